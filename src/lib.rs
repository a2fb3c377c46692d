// Copyright 2021 Satchel contributors

// SPDX-License-Identifier: Apache-2.0

//! Satchel packages Python source code, pickled objects, and raw
//! resources into a single self-contained archive that can later be
//! loaded without touching the host module path, except for modules
//! explicitly declared external.

#[macro_use]
extern crate log;

pub mod archive;
pub mod glob;
pub mod graph;
pub mod importer;
pub mod pickle;
pub mod policy;
pub mod scanner;
pub mod stdlib;
pub mod storage;

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::archive::{ArchiveWriter, DirectorySink, RecordSink};
use crate::glob::GlobGroup;
use crate::graph::{ModuleGraph, SourceOrigin};
use crate::importer::{source_of, Importer, Module};
use crate::pickle::Value;
use crate::policy::{Action, Dispositions, ImplicitExtern, PatternRule, PatternTable};
use crate::storage::StorageTable;

pub use crate::archive::{MemorySink, Records, EXTERN_MANIFEST_PATH, SOURCE_EXTENSION};
pub use crate::importer::{DirectoryImporter, MemoryImporter, OrderedImporter};
pub use crate::pickle::{probe_global_references, PackageReduce};
pub use crate::policy::DISALLOWED_IMPLICIT_EXTERN;
pub use crate::storage::Storage;

/// Prefix of module names minted by a packaged load. Such names are
/// never accepted for emission.
pub const MANGLE_PREFIX: &str = "<satchel_";

/// Module name reserved for the mock stub.
pub const MOCK_MODULE_NAME: &str = "_mock";

/// Whether `name` came out of a previously packaged load.
pub fn is_mangled(name: &str) -> bool {
    name.starts_with(MANGLE_PREFIX)
}

/// First segment of a qualified name.
pub fn root_of(name: &str) -> &str {
    match name.find('.') {
        Some(idx) => &name[..idx],
        None => name,
    }
}

/// Graph key of a pickled object: `<package.resource>`.
pub fn pickle_key(package: &str, resource: &str) -> String {
    format!("<{}.{}>", package, resource)
}

/// Faults surfaced by the packager core. All of them propagate to the
/// caller; none are swallowed internally.
#[derive(Debug, Error)]
pub enum PackageError {
    #[error("{pattern} was marked allow_empty=false but matched no modules")]
    EmptyMatch { pattern: String },

    #[error("`{module}` was required during packaging but has been explicitly blocklisted")]
    DeniedModule { module: String },

    #[error(
        "the following modules were required but match no intern, extern, or mock rule: {}; \
         add rules to classify them",
        .modules.join(", ")
    )]
    UnclassifiedModules { modules: Vec<String> },

    #[error("module not found: `{0}`")]
    ModuleNotFound(String),

    #[error(
        "module not found: `{0}`; modules imported from a packaged archive cannot be \
         re-exported directly"
    )]
    MangledModule(String),

    #[error("cannot save source for module `{module}`: {reason}")]
    SourceUnavailable { module: String, reason: String },

    #[error("invalid name `{name}`: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("invalid pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("duplicate archive record `{0}`")]
    DuplicateRecord(String),

    #[error("malformed pickle stream at offset {offset}: {reason}")]
    BadPickle { offset: usize, reason: String },

    #[error("cannot pickle {0} without a persistent-id hook")]
    Unpicklable(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Summary of a finished package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageReport {
    /// Modules whose source was copied into the archive.
    pub interned: Vec<String>,
    /// Modules replaced with the mock stub.
    pub mocked: Vec<String>,
    /// Modules the loading side must provide.
    pub externed: Vec<String>,
    /// Every record path, in emission order.
    pub records: Vec<String>,
}

/// Source of the stub module emitted once when anything is mocked.
const MOCK_MODULE_SOURCE: &str = "\
class MockedObject:
    _name: str

    def __new__(cls, *args, **kwargs):
        if not kwargs.get(\"_suppress_err\"):
            raise NotImplementedError(
                f\"Object '{cls._name}' was mocked out during packaging \"
                \"but is being used in the loaded package\"
            )
        return super().__new__(cls)

    def __init__(self, name, _suppress_err=False):
        self.__dict__[\"_name\"] = name

    def __repr__(self):
        return f\"MockedObject({self._name})\"

    def __getattr__(self, attr):
        return MockedObject(f\"{self._name}.{attr}\", _suppress_err=True)
";

/// Source emitted for each mocked module, redirecting into the stub.
const MOCK_REDIRECT_SOURCE: &str = "\
from _mock import MockedObject

def __getattr__(attr):
    return MockedObject(__name__ + '.' + attr, _suppress_err=True)
";

/// Writes packages of code, pickled data, and arbitrary binary and text
/// resources into a self-contained archive.
///
/// Every module the package requires is discovered by scanning saved
/// sources and pickle streams, then classified by the pattern policy as
/// interned, mocked, externed, or denied. [`finalize`] seals the
/// package: it runs classification over the whole dependency graph,
/// validates it, and emits all deferred records.
///
/// [`finalize`]: PackageExporter::finalize
pub struct PackageExporter {
    writer: ArchiveWriter,
    importer: Box<dyn Importer>,
    graph: ModuleGraph,
    patterns: PatternTable,
    implicit: ImplicitExtern,
    storages: StorageTable,
    next_unique_id: u64,
}

impl PackageExporter {
    pub fn new(sink: Box<dyn RecordSink>, importer: Box<dyn Importer>) -> Self {
        Self {
            writer: ArchiveWriter::new(sink),
            importer,
            graph: ModuleGraph::new(),
            patterns: PatternTable::new(),
            implicit: ImplicitExtern::new(),
            storages: StorageTable::new(),
            next_unique_id: 0,
        }
    }

    /// Exporter writing one file per record under `path`.
    pub fn to_directory<P: AsRef<Path>>(
        path: P,
        importer: Box<dyn Importer>,
    ) -> Result<Self, PackageError> {
        Ok(Self::new(Box::new(DirectorySink::new(path)?), importer))
    }

    /// Declare the framework root that is implicitly externed even when
    /// the stdlib oracle does not know it.
    pub fn set_framework_root(&mut self, root: &str) {
        self.implicit.set_framework_root(root);
    }

    /// Mint an id guaranteed to be handed out once per package.
    pub fn unique_id(&mut self) -> String {
        let id = self.next_unique_id;
        self.next_unique_id += 1;
        id.to_string()
    }

    /// Add `src` as the source for `module_name`. An intern rule for
    /// exactly this name is prepended so that it takes precedence over
    /// any user pattern. With `dependencies`, the source is scanned and
    /// every new dependency is pulled in recursively.
    ///
    /// Calling this again for the same module replaces the previous
    /// source: last writer wins.
    pub fn save_source_string(
        &mut self,
        module_name: &str,
        src: &str,
        is_package: bool,
        dependencies: bool,
    ) -> Result<(), PackageError> {
        validate_module_name(module_name)?;
        self.implicit_intern(module_name)?;
        self.graph.update_node(module_name, |node| {
            node.source = Some(src.to_string());
            node.is_package = is_package;
            node.origin = SourceOrigin::UserProvided;
        });

        if dependencies {
            let deps = self.get_dependencies(src, module_name, is_package);
            debug!("`{}` depends on: {:?}", module_name, deps);
            for dep in deps {
                self.require_module_if_not_provided(&dep, true)?;
                self.graph.add_edge(module_name, &dep);
            }
        }
        Ok(())
    }

    /// Save the code for `module_name`, resolved through the importer.
    pub fn save_module(&mut self, module_name: &str, dependencies: bool) -> Result<(), PackageError> {
        validate_module_name(module_name)?;
        self.implicit_intern(module_name)?;
        self.save_module_inner(module_name, dependencies)
    }

    /// Called by dependency resolution when something in the package
    /// depends on `module_name` and it is not already present.
    pub fn require_module(&mut self, module_name: &str, dependencies: bool) -> Result<(), PackageError> {
        self.save_module_inner(module_name, dependencies)
    }

    pub fn require_module_if_not_provided(
        &mut self,
        module_name: &str,
        dependencies: bool,
    ) -> Result<(), PackageError> {
        if self.graph.contains(module_name) || self.implicit.can_extern(module_name) {
            return Ok(());
        }
        self.require_module(module_name, dependencies)
    }

    fn save_module_inner(&mut self, module_name: &str, dependencies: bool) -> Result<(), PackageError> {
        let module = self.import_module(module_name)?;
        self.graph.update_node(module_name, |node| {
            if node.origin == SourceOrigin::Absent {
                node.origin = SourceOrigin::Imported;
            }
        });
        // A module without source cannot be scanned. The fault is
        // deferred: it only matters if the node ends up interned.
        let (source, is_package) = match source_of(&module) {
            Ok((source, is_package)) => (source.to_string(), is_package),
            Err(_) => {
                debug!("`{}` has no source to scan", module_name);
                return Ok(());
            }
        };

        if dependencies {
            let deps = self.get_dependencies(&source, module_name, is_package);
            debug!("`{}` depends on: {:?}", module_name, deps);
            for dep in deps {
                self.require_module_if_not_provided(&dep, true)?;
                self.graph.add_edge(module_name, &dep);
            }
        }
        Ok(())
    }

    /// Pickle `obj` into the archive at `<package>/<resource>`. The
    /// persistent-id hook records storages into the storage table and
    /// lets packaging-aware objects reduce themselves. With
    /// `dependencies`, the opcode stream is probed for module references
    /// which are pulled in like source dependencies.
    pub fn save_pickle(
        &mut self,
        package: &str,
        resource: &str,
        obj: &Value,
        dependencies: bool,
    ) -> Result<(), PackageError> {
        let path = filename(package, resource)?;
        let data = {
            let storages = &mut self.storages;
            let next_unique_id = &mut self.next_unique_id;
            let mut hook = |value: &Value| -> Option<Value> {
                match value {
                    Value::Storage(s) => {
                        let key = storages.register(s, || {
                            let key = next_unique_id.to_string();
                            *next_unique_id += 1;
                            key
                        });
                        Some(Value::Tuple(vec![
                            Value::str("storage"),
                            Value::str(s.type_tag()),
                            Value::Str(key),
                            Value::str(s.device()),
                            Value::Int(s.numel() as i64),
                        ]))
                    }
                    Value::Reducible(r) => Some(Value::Tuple(vec![
                        Value::str("reduce_package"),
                        r.reduce_package(),
                    ])),
                    _ => None,
                }
            };
            pickle::dumps_with_hook(obj, &mut hook)?
        };

        let key = pickle_key(package, resource);
        self.patterns.append(PatternRule {
            glob: GlobGroup::new(&key)?,
            action: Action::Intern,
            allow_empty: true,
        });
        self.graph.update_node(&key, |node| {
            node.origin = SourceOrigin::Pickle;
        });

        if dependencies {
            let deps = pickle::probe_global_references(&data)?;
            debug!("`{}` depends on: {:?}", resource, deps);
            for dep in deps {
                self.require_module_if_not_provided(&dep, true)?;
                self.graph.add_edge(&key, &dep);
            }
        }

        self.writer.write_record(&path, &data)
    }

    /// Save text data under `<package>/<resource>`. Does not take part
    /// in dependency resolution.
    pub fn save_text(&mut self, package: &str, resource: &str, text: &str) -> Result<(), PackageError> {
        self.save_binary(package, resource, text.as_bytes())
    }

    /// Save raw bytes under `<package>/<resource>`. Does not take part
    /// in dependency resolution.
    pub fn save_binary(
        &mut self,
        package: &str,
        resource: &str,
        binary: &[u8],
    ) -> Result<(), PackageError> {
        let path = filename(package, resource)?;
        self.writer.write_record(&path, binary)
    }

    /// Append a policy rule. Deny rules never require a match.
    pub fn add_rule(&mut self, action: Action, glob: GlobGroup, allow_empty: bool) {
        let allow_empty = action == Action::Deny || allow_empty;
        self.patterns.append(PatternRule {
            glob,
            action,
            allow_empty,
        });
    }

    /// Intern every required module matching `include`.
    pub fn intern(&mut self, include: &str) -> Result<(), PackageError> {
        self.add_rule(Action::Intern, GlobGroup::new(include)?, true);
        Ok(())
    }

    /// Replace every required module matching `include` with a stub that
    /// fabricates attributes on access.
    pub fn mock(&mut self, include: &str) -> Result<(), PackageError> {
        self.add_rule(Action::Mock, GlobGroup::new(include)?, true);
        Ok(())
    }

    /// Declare every required module matching `include` external: the
    /// loading side provides it.
    pub fn extern_(&mut self, include: &str) -> Result<(), PackageError> {
        self.add_rule(Action::Extern, GlobGroup::new(include)?, true);
        Ok(())
    }

    /// Forbid modules matching `include`; requiring one aborts sealing.
    pub fn deny(&mut self, include: &str) -> Result<(), PackageError> {
        self.add_rule(Action::Deny, GlobGroup::new(include)?, true);
        Ok(())
    }

    /// The dependency graph in Graphviz dot form.
    pub fn graph_dot(&self) -> String {
        let mut buf = Vec::new();
        match self.graph.write_dot(&mut buf) {
            Ok(()) => String::from_utf8_lossy(&buf).into_owned(),
            Err(_) => String::new(),
        }
    }

    /// Seal the package: classify every graph node, validate the
    /// classification, and write all deferred records. Consumes the
    /// exporter; the sink is finished whether sealing succeeds or not,
    /// and on a fault the original error is the one propagated.
    pub fn finalize(mut self) -> Result<PackageReport, PackageError> {
        debug!("sealing package: {} graph nodes", self.graph.node_count());
        match self.seal() {
            Ok(report) => {
                self.writer.finish()?;
                Ok(report)
            }
            Err(e) => {
                if let Err(close_err) = self.writer.finish() {
                    warn!("error closing archive after fault: {}", close_err);
                }
                Err(e)
            }
        }
    }

    /// Close the archive without sealing. Used by the resource-scope
    /// wrapper when the caller's closure fails.
    pub fn abort(mut self) {
        if let Err(e) = self.writer.finish() {
            warn!("error closing aborted archive: {}", e);
        }
    }

    fn seal(&mut self) -> Result<PackageReport, PackageError> {
        // Classify in graph-insertion order so emission is stable.
        let names: Vec<String> = self.graph.node_names().map(String::from).collect();
        let mut disp = Dispositions::default();
        let mut unclassified = Vec::new();
        for name in &names {
            if self.implicit.can_extern(name) {
                disp.externed.insert(name);
                continue;
            }
            match self.patterns.classify(name) {
                Some(Action::Intern) => disp.interned.insert(name),
                Some(Action::Mock) => disp.mocked.insert(name),
                Some(Action::Extern) => disp.externed.insert(name),
                Some(Action::Deny) => {
                    return Err(PackageError::DeniedModule {
                        module: name.clone(),
                    })
                }
                None => unclassified.push(name.clone()),
            }
        }
        if !unclassified.is_empty() {
            unclassified.sort();
            return Err(PackageError::UnclassifiedModules {
                modules: unclassified,
            });
        }
        self.patterns.enforce_non_empty()?;

        if !disp.mocked.is_empty() {
            self.writer
                .write_source(MOCK_MODULE_NAME, MOCK_MODULE_SOURCE, false)?;
        }
        let mocked = disp.mocked.to_vec();
        for name in &mocked {
            // The package flag of the stub mirrors the real module.
            let is_package = self.import_module(name)?.is_package;
            self.writer
                .write_source(name, MOCK_REDIRECT_SOURCE, is_package)?;
        }

        let interned = disp.interned.to_vec();
        for name in &interned {
            let node = match self.graph.node(name) {
                Some(node) => node.clone(),
                None => continue,
            };
            if node.is_pickle() {
                // Pickle payloads were already written at save time.
                continue;
            }
            if let Some(src) = node.source {
                self.writer.write_source(name, &src, node.is_package)?;
            } else {
                let module = self.import_module(name)?;
                let (src, is_package) = source_of(&module)?;
                self.writer.write_source(name, src, is_package)?;
            }
        }

        let externed = disp.externed.to_vec();
        self.writer.write_extern_manifest(&externed)?;

        for key in self.storages.sorted_keys() {
            if let Some(storage) = self.storages.get(&key) {
                let data = storage.local_data();
                self.writer.write_storage(&key, &data)?;
            }
        }

        Ok(PackageReport {
            interned,
            mocked,
            externed,
            records: self.writer.record_paths().to_vec(),
        })
    }

    /// Prepend an intern rule for exactly `module_name`, ahead of every
    /// user pattern.
    fn implicit_intern(&mut self, module_name: &str) -> Result<(), PackageError> {
        self.patterns.prepend(PatternRule {
            glob: GlobGroup::new(module_name)?,
            action: Action::Intern,
            allow_empty: false,
        });
        Ok(())
    }

    fn import_module(&self, module_name: &str) -> Result<Module, PackageError> {
        match self.importer.import_module(module_name) {
            Err(PackageError::ModuleNotFound(_)) if is_mangled(module_name) => {
                Err(PackageError::MangledModule(module_name.to_string()))
            }
            other => other,
        }
    }

    fn get_dependencies(&self, src: &str, module_name: &str, is_package: bool) -> Vec<String> {
        scanner::resolve_dependencies(src, module_name, is_package, self.importer.as_ref())
    }
}

/// Run `f` against a fresh exporter and seal on success. On failure the
/// archive is closed without sealing and the closure's error propagates.
pub fn with_exporter<F>(
    sink: Box<dyn RecordSink>,
    importer: Box<dyn Importer>,
    f: F,
) -> Result<PackageReport, PackageError>
where
    F: FnOnce(&mut PackageExporter) -> Result<(), PackageError>,
{
    let mut exporter = PackageExporter::new(sink, importer);
    match f(&mut exporter) {
        Ok(()) => exporter.finalize(),
        Err(e) => {
            exporter.abort();
            Err(e)
        }
    }
}

fn validate_module_name(name: &str) -> Result<(), PackageError> {
    let well_formed = !name.is_empty()
        && name.split('.').all(|seg| !seg.is_empty())
        && !name.contains(|c: char| c.is_whitespace() || c == '/');
    if !well_formed {
        return Err(PackageError::InvalidName {
            name: name.to_string(),
            reason: "module names are dot-separated non-empty identifiers".to_string(),
        });
    }
    Ok(())
}

/// Archive path of a resource inside a package.
fn filename(package: &str, resource: &str) -> Result<String, PackageError> {
    validate_module_name(package)?;
    let resource = normalize_resource(resource)?;
    Ok(format!("{}/{}", package.replace('.', "/"), resource))
}

fn normalize_resource(resource: &str) -> Result<String, PackageError> {
    let resource = resource.replace('\\', "/");
    let well_formed = !resource.is_empty()
        && !resource.starts_with('/')
        && resource
            .split('/')
            .all(|seg| !seg.is_empty() && seg != "." && seg != "..");
    if !well_formed {
        return Err(PackageError::InvalidName {
            name: resource,
            reason: "resource paths must be relative and free of `.`/`..` segments".to_string(),
        });
    }
    Ok(resource)
}
