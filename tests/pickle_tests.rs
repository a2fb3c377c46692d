// Copyright 2021 Satchel contributors

// SPDX-License-Identifier: Apache-2.0

use satchel::pickle::{
    dumps, dumps_with_hook, op, probe_global_references, OpArg, OpcodeReader, Value,
};
use satchel::{PackageError, Storage};

fn opcode_names(data: &[u8]) -> Vec<&'static str> {
    OpcodeReader::new(data)
        .map(|r| r.unwrap().name)
        .collect()
}

#[test]
fn scalars_produce_a_wellformed_stream() {
    let value = Value::Tuple(vec![
        Value::None,
        Value::Bool(true),
        Value::Int(5),
        Value::Int(70_000),
        Value::Int(1 << 40),
        Value::Float(1.5),
        Value::str("hello"),
        Value::Bytes(vec![0, 1, 2]),
    ]);
    let data = dumps(&value).unwrap();
    let names = opcode_names(&data);
    assert_eq!(names[0], "PROTO");
    assert_eq!(names[names.len() - 1], "STOP");
    assert!(names.contains(&"NONE"));
    assert!(names.contains(&"NEWTRUE"));
    assert!(names.contains(&"BININT1"));
    assert!(names.contains(&"BININT"));
    assert!(names.contains(&"LONG1"));
    assert!(names.contains(&"BINFLOAT"));
    assert!(names.contains(&"BINUNICODE"));
    assert!(names.contains(&"SHORT_BINBYTES"));
}

#[test]
fn containers_nest() {
    let value = Value::Dict(vec![
        (Value::str("xs"), Value::List(vec![Value::Int(1), Value::Int(2)])),
        (Value::str("pair"), Value::Tuple(vec![Value::Int(1), Value::Int(2)])),
    ]);
    let data = dumps(&value).unwrap();
    let names = opcode_names(&data);
    assert!(names.contains(&"EMPTY_DICT"));
    assert!(names.contains(&"EMPTY_LIST"));
    assert!(names.contains(&"APPENDS"));
    assert!(names.contains(&"SETITEMS"));
    assert!(names.contains(&"TUPLE2"));
}

#[test]
fn reduce_emits_global_then_args_then_reduce() {
    let value = Value::reduce(
        Value::global("collections", "OrderedDict"),
        vec![Value::List(vec![])],
    );
    let data = dumps(&value).unwrap();
    let names = opcode_names(&data);
    let global_at = names.iter().position(|n| *n == "GLOBAL").unwrap();
    let reduce_at = names.iter().position(|n| *n == "REDUCE").unwrap();
    assert!(global_at < reduce_at);
}

#[test]
fn probe_reports_global_modules_in_order_without_duplicates() {
    let value = Value::Tuple(vec![
        Value::reduce(Value::global("models.resnet", "ResNet"), vec![]),
        Value::reduce(Value::global("collections", "OrderedDict"), vec![]),
        Value::reduce(Value::global("models.resnet", "Bottleneck"), vec![]),
    ]);
    let data = dumps(&value).unwrap();
    assert_eq!(
        probe_global_references(&data).unwrap(),
        vec!["models.resnet", "collections"]
    );
}

#[test]
fn probe_walks_handwritten_streams() {
    // PROTO 2, GLOBAL collections/OrderedDict, EMPTY_TUPLE, REDUCE, STOP:
    // the shape CPython produces for OrderedDict().
    let data = b"\x80\x02ccollections\nOrderedDict\n)R.";
    assert_eq!(probe_global_references(data).unwrap(), vec!["collections"]);
}

#[test]
fn reader_decodes_memo_and_frame_opcodes() {
    // A protocol 2 stream with memo puts, as CPython emits them.
    let data = b"\x80\x02]q\x00(K\x01K\x02e.";
    let names = opcode_names(data);
    assert_eq!(
        names,
        vec![
            "PROTO",
            "EMPTY_LIST",
            "BINPUT",
            "MARK",
            "BININT1",
            "BININT1",
            "APPENDS",
            "STOP"
        ]
    );
}

#[test]
fn reader_reports_truncated_streams() {
    let data = b"\x80\x02]q";
    let result: Result<Vec<_>, _> = OpcodeReader::new(data).collect();
    assert!(matches!(result, Err(PackageError::BadPickle { .. })));
}

#[test]
fn reader_reports_unknown_opcodes() {
    let data = b"\x80\x02\xff.";
    let result: Result<Vec<_>, _> = OpcodeReader::new(data).collect();
    assert!(matches!(result, Err(PackageError::BadPickle { .. })));
}

#[test]
fn reader_stops_at_stop() {
    // Trailing garbage after STOP is not part of the pickle.
    let data = b"\x80\x02N.\xff\xff";
    let names = opcode_names(data);
    assert_eq!(names, vec!["PROTO", "NONE", "STOP"]);
}

#[test]
fn global_argument_carries_module_and_symbol() {
    let data = dumps(&Value::global("pkg.models", "Net")).unwrap();
    let ops: Vec<_> = OpcodeReader::new(&data).map(|r| r.unwrap()).collect();
    let global = ops.iter().find(|o| o.name == "GLOBAL").unwrap();
    assert_eq!(
        global.arg,
        Some(OpArg::Pair("pkg.models".to_string(), "Net".to_string()))
    );
}

#[test]
fn globals_with_spaces_are_rejected() {
    assert!(dumps(&Value::global("bad module", "Net")).is_err());
}

#[test]
fn storages_require_a_hook() {
    let storage = Storage::new("FloatStorage", "cpu", 4, vec![0; 8]);
    let err = dumps(&Value::Storage(storage)).unwrap_err();
    assert!(matches!(err, PackageError::Unpicklable(_)));
}

#[test]
fn hook_replaces_claimed_values_with_persistent_ids() {
    let storage = Storage::new("FloatStorage", "cpu", 4, vec![0; 8]);
    let value = Value::Tuple(vec![Value::Int(1), Value::Storage(storage)]);
    let mut hook = |v: &Value| match v {
        Value::Storage(s) => Some(Value::Tuple(vec![
            Value::str("storage"),
            Value::str(s.type_tag()),
            Value::str("0"),
            Value::str(s.device()),
            Value::Int(s.numel() as i64),
        ])),
        _ => None,
    };
    let data = dumps_with_hook(&value, &mut hook).unwrap();
    let names = opcode_names(&data);
    assert!(names.contains(&"BINPERSID"));
    // The id tuple is in the stream in place of the storage.
    let text = String::from_utf8_lossy(&data);
    assert!(text.contains("FloatStorage"));
}

#[test]
fn the_persistent_id_itself_is_not_offered_to_the_hook() {
    let storage = Storage::new("FloatStorage", "cpu", 1, vec![0]);
    let mut calls = 0usize;
    let mut hook = |v: &Value| {
        calls += 1;
        match v {
            Value::Storage(_) => Some(Value::str("id")),
            _ => None,
        }
    };
    dumps_with_hook(&Value::Storage(storage), &mut hook).unwrap();
    // One offer for the storage; the replacement string is not offered.
    assert_eq!(calls, 1);
}

#[test]
fn stop_opcode_is_the_last_byte() {
    let data = dumps(&Value::Int(3)).unwrap();
    assert_eq!(*data.last().unwrap(), op::STOP);
}
