// Copyright 2021 Satchel contributors

// SPDX-License-Identifier: Apache-2.0

use satchel::archive::RecordSink;
use satchel::glob::GlobGroup;
use satchel::pickle::Value;
use satchel::policy::Action;
use satchel::{
    with_exporter, MemoryImporter, MemorySink, PackageError, PackageExporter, Records, Storage,
};
use std::cell::Cell;
use std::rc::Rc;

fn new_exporter(importer: MemoryImporter) -> (PackageExporter, Records) {
    let sink = MemorySink::new();
    let records = sink.records();
    (
        PackageExporter::new(Box::new(sink), Box::new(importer)),
        records,
    )
}

fn record(records: &Records, path: &str) -> Option<Vec<u8>> {
    records
        .borrow()
        .iter()
        .find(|(p, _)| p == path)
        .map(|(_, data)| data.clone())
}

fn record_paths(records: &Records) -> Vec<String> {
    records.borrow().iter().map(|(p, _)| p.clone()).collect()
}

#[test]
fn single_module_no_dependencies() {
    let (mut exporter, records) = new_exporter(MemoryImporter::new());
    exporter
        .save_source_string("a", "x = 1\n", false, true)
        .unwrap();
    let report = exporter.finalize().unwrap();

    assert_eq!(report.interned, vec!["a"]);
    assert!(report.externed.is_empty());
    assert_eq!(record(&records, "a.py").unwrap(), b"x = 1\n");
    // No externs: the manifest is a single trailing newline.
    assert_eq!(record(&records, ".data/extern_modules").unwrap(), b"\n");
}

#[test]
fn transitive_closure_interns_sources_and_externs_stdlib() {
    let mut importer = MemoryImporter::new();
    importer.add_module("b", "import types\n");
    importer.add_sourceless("types");
    let (mut exporter, records) = new_exporter(importer);

    exporter.intern("b").unwrap();
    exporter
        .save_source_string("a", "import b\n", false, true)
        .unwrap();
    let report = exporter.finalize().unwrap();

    assert_eq!(report.interned, vec!["a", "b"]);
    assert_eq!(report.externed, vec!["types"]);
    assert!(record(&records, "a.py").is_some());
    assert!(record(&records, "b.py").is_some());
    assert_eq!(record(&records, ".data/extern_modules").unwrap(), b"types\n");
}

#[test]
fn disallowed_stdlib_root_requires_explicit_extern() {
    let mut importer = MemoryImporter::new();
    importer.add_module("b", "import sys\n");
    importer.add_sourceless("sys");
    let (mut exporter, records) = new_exporter(importer);

    // `sys` is never externed implicitly; an explicit rule is needed.
    exporter.extern_("sys").unwrap();
    exporter.intern("b").unwrap();
    exporter
        .save_source_string("a", "import b\n", false, true)
        .unwrap();
    let report = exporter.finalize().unwrap();

    assert_eq!(report.externed, vec!["sys"]);
    assert_eq!(record(&records, ".data/extern_modules").unwrap(), b"sys\n");
}

#[test]
fn disallowed_stdlib_root_without_rule_is_unclassified() {
    let mut importer = MemoryImporter::new();
    importer.add_sourceless("sys");
    let (mut exporter, _records) = new_exporter(importer);

    exporter
        .save_source_string("a", "import sys\n", false, true)
        .unwrap();
    match exporter.finalize() {
        Err(PackageError::UnclassifiedModules { modules }) => {
            assert_eq!(modules, vec!["sys"]);
        }
        other => panic!("expected UnclassifiedModules, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn framework_root_is_externed_without_stdlib_help() {
    let mut importer = MemoryImporter::new();
    importer.add_sourceless("torch");
    let (mut exporter, _records) = new_exporter(importer);
    exporter.set_framework_root("torch");

    exporter
        .save_source_string("a", "import torch\n", false, true)
        .unwrap();
    let report = exporter.finalize().unwrap();
    assert_eq!(report.externed, vec!["torch"]);
}

#[test]
fn mock_with_glob_emits_stub_once() {
    let mut importer = MemoryImporter::new();
    importer.add_module("lib.x", "");
    importer.add_module("lib.y.z", "");
    let (mut exporter, records) = new_exporter(importer);

    exporter.mock("lib.**").unwrap();
    exporter
        .save_source_string("app", "import lib.x\nimport lib.y.z\n", false, true)
        .unwrap();
    let report = exporter.finalize().unwrap();

    assert_eq!(report.mocked, vec!["lib.x", "lib.y.z"]);
    assert!(report.externed.is_empty());
    let stub = record(&records, "_mock.py").unwrap();
    assert!(String::from_utf8(stub).unwrap().contains("MockedObject"));
    let redirect = String::from_utf8(record(&records, "lib/x.py").unwrap()).unwrap();
    assert!(redirect.contains("from _mock import MockedObject"));
    assert!(record(&records, "lib/y/z.py").is_some());
    // The stub is emitted exactly once.
    let stubs = record_paths(&records)
        .iter()
        .filter(|p| *p == "_mock.py")
        .count();
    assert_eq!(stubs, 1);
    assert_eq!(record(&records, ".data/extern_modules").unwrap(), b"\n");
}

#[test]
fn deny_aborts_sealing() {
    let mut importer = MemoryImporter::new();
    importer.add_module("secret", "token = 1\n");
    let (mut exporter, records) = new_exporter(importer);

    exporter.deny("secret").unwrap();
    exporter
        .save_source_string("app", "import secret\n", false, true)
        .unwrap();
    match exporter.finalize() {
        Err(PackageError::DeniedModule { module }) => assert_eq!(module, "secret"),
        other => panic!("expected DeniedModule, got {:?}", other.map(|_| ())),
    }
    // Sealing aborted before any source emission.
    assert!(record(&records, "app.py").is_none());
}

#[test]
fn empty_match_enforcement() {
    let (mut exporter, _records) = new_exporter(MemoryImporter::new());
    exporter.add_rule(
        Action::Extern,
        GlobGroup::new("never.*").unwrap(),
        false,
    );
    exporter
        .save_source_string("a", "x = 1\n", false, true)
        .unwrap();
    match exporter.finalize() {
        Err(PackageError::EmptyMatch { pattern }) => assert!(pattern.contains("never.*")),
        other => panic!("expected EmptyMatch, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn deny_rules_never_require_a_match() {
    let (mut exporter, _records) = new_exporter(MemoryImporter::new());
    exporter.deny("secret.**").unwrap();
    exporter
        .save_source_string("a", "x = 1\n", false, true)
        .unwrap();
    assert!(exporter.finalize().is_ok());
}

#[test]
fn pickle_with_storage() {
    let mut importer = MemoryImporter::new();
    importer.add_package("demo", "");
    importer.add_module("demo.models", "class Model:\n    pass\n");
    let (mut exporter, records) = new_exporter(importer);

    exporter.intern("demo.**").unwrap();
    let storage = Storage::new("FloatStorage", "cpu", 4, vec![7u8; 16]);
    let obj = Value::reduce(
        Value::global("demo.models", "Model"),
        vec![Value::Storage(storage)],
    );
    exporter.save_pickle("demo", "model", &obj, true).unwrap();
    let report = exporter.finalize().unwrap();

    // The payload lands at the resource path, the storage under .data.
    let payload = record(&records, "demo/model").unwrap();
    assert_eq!(payload[0], 0x80);
    assert_eq!(record(&records, ".data/0.storage").unwrap(), vec![7u8; 16]);
    // The probe discovered the module of the pickled class.
    assert!(report.interned.contains(&"demo.models".to_string()));
    assert!(report.interned.contains(&"<demo.model>".to_string()));
    assert!(record(&records, "demo/models.py").is_some());
}

#[test]
fn shared_storage_is_deduplicated() {
    let mut importer = MemoryImporter::new();
    importer.add_package("demo", "");
    let (mut exporter, records) = new_exporter(importer);

    let storage = Storage::new("FloatStorage", "cpu", 1, vec![1, 2, 3]);
    let obj = Value::Tuple(vec![
        Value::Storage(storage.clone()),
        Value::Storage(storage),
    ]);
    exporter.save_pickle("demo", "pair", &obj, true).unwrap();
    exporter.finalize().unwrap();

    let storage_records: Vec<String> = record_paths(&records)
        .into_iter()
        .filter(|p| p.ends_with(".storage"))
        .collect();
    assert_eq!(storage_records, vec![".data/0.storage"]);
}

#[test]
fn non_local_storage_is_moved_before_emission() {
    let mut importer = MemoryImporter::new();
    importer.add_package("demo", "");
    let (mut exporter, records) = new_exporter(importer);

    let storage = Storage::new("FloatStorage", "cuda:0", 1, vec![9, 9]);
    exporter
        .save_pickle("demo", "obj", &Value::Storage(storage), true)
        .unwrap();
    exporter.finalize().unwrap();
    assert_eq!(record(&records, ".data/0.storage").unwrap(), vec![9, 9]);
}

#[test]
fn determinism_across_runs() {
    let build = || {
        let mut importer = MemoryImporter::new();
        importer.add_module("b", "import types\n");
        importer.add_sourceless("types");
        importer.add_module("lib.x", "");
        let (mut exporter, records) = new_exporter(importer);
        exporter.mock("lib.**").unwrap();
        exporter
            .save_source_string("a", "import b\nimport lib.x\n", false, true)
            .unwrap();
        exporter.save_text("a", "notes.txt", "hello\n").unwrap();
        exporter.finalize().unwrap();
        let result: Vec<(String, Vec<u8>)> = records.borrow().clone();
        result
    };
    assert_eq!(build(), build());
}

#[test]
fn save_source_string_is_idempotent() {
    let build = |times: usize| {
        let (mut exporter, records) = new_exporter(MemoryImporter::new());
        for _ in 0..times {
            exporter
                .save_source_string("a", "x = 1\n", false, true)
                .unwrap();
        }
        exporter.finalize().unwrap();
        let result: Vec<(String, Vec<u8>)> = records.borrow().clone();
        result
    };
    assert_eq!(build(1), build(3));
}

#[test]
fn re_saving_with_new_text_is_last_writer_wins() {
    let (mut exporter, records) = new_exporter(MemoryImporter::new());
    exporter
        .save_source_string("a", "x = 1\n", false, true)
        .unwrap();
    exporter
        .save_source_string("a", "x = 2\n", false, true)
        .unwrap();
    exporter.finalize().unwrap();
    assert_eq!(record(&records, "a.py").unwrap(), b"x = 2\n");
}

#[test]
fn mangled_names_are_rejected_from_emission() {
    let (mut exporter, _records) = new_exporter(MemoryImporter::new());
    exporter
        .save_source_string("<satchel_0>.foo", "x = 1\n", false, false)
        .unwrap();
    match exporter.finalize() {
        Err(PackageError::InvalidName { name, .. }) => assert!(name.starts_with("<satchel_0>")),
        other => panic!("expected InvalidName, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn mangled_resource_package_is_rejected_immediately() {
    let (mut exporter, _records) = new_exporter(MemoryImporter::new());
    let err = exporter
        .save_binary("<satchel_1>.pkg", "blob", b"\x00")
        .unwrap_err();
    assert!(matches!(err, PackageError::InvalidName { .. }));
}

#[test]
fn saving_a_mangled_module_reports_the_reexport_ban() {
    let (mut exporter, _records) = new_exporter(MemoryImporter::new());
    let err = exporter.save_module("<satchel_2>.foo", true).unwrap_err();
    match err {
        PackageError::MangledModule(name) => assert_eq!(name, "<satchel_2>.foo"),
        other => panic!("expected MangledModule, got {:?}", other),
    }
}

#[test]
fn unclassified_dependency_fails_sealing() {
    let mut importer = MemoryImporter::new();
    importer.add_module("helpers", "def make():\n    return 1\n");
    let (mut exporter, _records) = new_exporter(importer);
    exporter
        .save_source_string("app", "import helpers\n", false, true)
        .unwrap();
    match exporter.finalize() {
        Err(PackageError::UnclassifiedModules { modules }) => {
            assert_eq!(modules, vec!["helpers"]);
        }
        other => panic!("expected UnclassifiedModules, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn first_match_wins_over_later_rules() {
    let mut importer = MemoryImporter::new();
    importer.add_module("util.x", "");
    let (mut exporter, _records) = new_exporter(importer);
    exporter.intern("util.**").unwrap();
    exporter.deny("util.x").unwrap();
    exporter
        .save_source_string("app", "import util.x\n", false, true)
        .unwrap();
    let report = exporter.finalize().unwrap();
    assert!(report.interned.contains(&"util.x".to_string()));
}

#[test]
fn from_import_of_submodule_records_the_submodule_only() {
    let mut importer = MemoryImporter::new();
    importer.add_package("pkg", "");
    importer.add_module("pkg.sub", "value = 1\n");
    let (mut exporter, _records) = new_exporter(importer);
    exporter.intern("pkg.**").unwrap();
    exporter
        .save_source_string("app", "from pkg import sub\n", false, true)
        .unwrap();
    let report = exporter.finalize().unwrap();
    assert!(report.interned.contains(&"pkg.sub".to_string()));
    // The parent package was not pulled in.
    assert!(!report.interned.contains(&"pkg".to_string()));
}

#[test]
fn from_import_of_attribute_records_the_parent() {
    let mut importer = MemoryImporter::new();
    importer.add_package("pkg", "def helper():\n    return 1\n");
    let (mut exporter, _records) = new_exporter(importer);
    exporter.intern("pkg.**").unwrap();
    exporter
        .save_source_string("app", "from pkg import helper\n", false, true)
        .unwrap();
    let report = exporter.finalize().unwrap();
    assert!(report.interned.contains(&"pkg".to_string()));
}

#[test]
fn relative_import_resolves_against_the_package() {
    let mut importer = MemoryImporter::new();
    importer.add_module("pkg.sub", "value = 1\n");
    let (mut exporter, records) = new_exporter(importer);
    exporter.intern("pkg.**").unwrap();
    exporter
        .save_source_string("pkg", "from . import sub\n", true, true)
        .unwrap();
    let report = exporter.finalize().unwrap();
    assert!(report.interned.contains(&"pkg.sub".to_string()));
    assert!(record(&records, "pkg/__init__.py").is_some());
    assert!(record(&records, "pkg/sub.py").is_some());
}

#[test]
fn interned_module_without_source_fails_at_seal() {
    let mut importer = MemoryImporter::new();
    importer.add_sourceless("accel");
    let (mut exporter, _records) = new_exporter(importer);
    exporter.save_module("accel", true).unwrap();
    match exporter.finalize() {
        Err(PackageError::SourceUnavailable { module, .. }) => assert_eq!(module, "accel"),
        other => panic!("expected SourceUnavailable, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn duplicate_resource_paths_are_a_fault() {
    let mut importer = MemoryImporter::new();
    importer.add_package("pkg", "");
    let (mut exporter, _records) = new_exporter(importer);
    exporter.save_text("pkg", "res.txt", "one\n").unwrap();
    let err = exporter.save_text("pkg", "res.txt", "two\n").unwrap_err();
    assert!(matches!(err, PackageError::DuplicateRecord(path) if path == "pkg/res.txt"));
}

#[test]
fn resource_paths_are_normalised_and_validated() {
    let mut importer = MemoryImporter::new();
    importer.add_package("pkg", "");
    let (mut exporter, records) = new_exporter(importer);
    exporter
        .save_binary("pkg", "weights\\model.bin", b"\x01")
        .unwrap();
    assert!(record(&records, "pkg/weights/model.bin").is_some());
    assert!(exporter.save_binary("pkg", "../escape", b"").is_err());
    assert!(exporter.save_binary("pkg", "/absolute", b"").is_err());
}

#[test]
fn with_exporter_seals_on_success() {
    let sink = MemorySink::new();
    let records = sink.records();
    let report = with_exporter(
        Box::new(sink),
        Box::new(MemoryImporter::new()),
        |exporter| exporter.save_source_string("a", "x = 1\n", false, true),
    )
    .unwrap();
    assert_eq!(report.interned, vec!["a"]);
    assert!(record(&records, "a.py").is_some());
}

#[test]
fn with_exporter_propagates_the_callers_fault() {
    let sink = MemorySink::new();
    let records = sink.records();
    let result = with_exporter(
        Box::new(sink),
        Box::new(MemoryImporter::new()),
        |exporter| exporter.save_module("missing", true),
    );
    assert!(matches!(result, Err(PackageError::ModuleNotFound(_))));
    // Nothing was sealed.
    assert!(record(&records, ".data/extern_modules").is_none());
}

#[test]
fn directory_exporter_writes_records_as_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut exporter =
        PackageExporter::to_directory(dir.path().join("pkg"), Box::new(MemoryImporter::new()))
            .unwrap();
    exporter
        .save_source_string("a", "x = 1\n", false, true)
        .unwrap();
    exporter.finalize().unwrap();
    let written = std::fs::read_to_string(dir.path().join("pkg/a.py")).unwrap();
    assert_eq!(written, "x = 1\n");
    assert!(dir.path().join("pkg/.data/extern_modules").exists());
}

#[test]
fn the_sink_learns_the_minimum_format_version_at_construction() {
    struct VersionProbe(Rc<Cell<Option<u32>>>);
    impl RecordSink for VersionProbe {
        fn set_min_version(&mut self, version: u32) {
            self.0.set(Some(version));
        }
        fn write_record(&mut self, _path: &str, _data: &[u8]) -> std::io::Result<()> {
            Ok(())
        }
    }

    let seen = Rc::new(Cell::new(None));
    let _exporter = PackageExporter::new(
        Box::new(VersionProbe(Rc::clone(&seen))),
        Box::new(MemoryImporter::new()),
    );
    assert_eq!(seen.get(), Some(6));
}

#[test]
fn report_records_match_emission_order() {
    let mut importer = MemoryImporter::new();
    importer.add_package("pkg", "");
    let (mut exporter, records) = new_exporter(importer);
    exporter.save_text("pkg", "res.txt", "data\n").unwrap();
    exporter
        .save_source_string("a", "x = 1\n", false, true)
        .unwrap();
    let report = exporter.finalize().unwrap();
    assert_eq!(report.records, record_paths(&records));
    // Resources are written at save time, sources at seal time.
    assert_eq!(report.records[0], "pkg/res.txt");
}
