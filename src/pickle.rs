// Copyright 2021 Satchel contributors

// SPDX-License-Identifier: Apache-2.0

//! Pickle stream support.
//!
//! Three pieces live here: a [`Value`] object graph together with a
//! pickler that serialises it to a protocol-3 opcode stream, an
//! [`OpcodeReader`] that walks any pickle byte stream opcode by opcode,
//! and [`probe_global_references`], the dependency probe that extracts
//! the modules a serialised object needs at load time.
//!
//! The pickler accepts a persistent-id hook called once per value. When
//! the hook claims a value, the id it returns is serialised in its place
//! (with the hook suppressed for the id itself) followed by a
//! `BINPERSID` opcode.

use crate::storage::Storage;
use crate::PackageError;
use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;

/// Pickle protocol emitted by the pickler.
pub const PICKLE_PROTOCOL: u8 = 3;

/// Opcode bytes, named as in CPython's `pickletools`.
pub mod op {
    pub const MARK: u8 = b'(';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const STOP: u8 = b'.';
    pub const POP: u8 = b'0';
    pub const POP_MARK: u8 = b'1';
    pub const DUP: u8 = b'2';
    pub const BINBYTES: u8 = b'B';
    pub const SHORT_BINBYTES: u8 = b'C';
    pub const FLOAT: u8 = b'F';
    pub const BINFLOAT: u8 = b'G';
    pub const INT: u8 = b'I';
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const LONG: u8 = b'L';
    pub const BININT2: u8 = b'M';
    pub const NONE: u8 = b'N';
    pub const PERSID: u8 = b'P';
    pub const BINPERSID: u8 = b'Q';
    pub const REDUCE: u8 = b'R';
    pub const STRING: u8 = b'S';
    pub const BINSTRING: u8 = b'T';
    pub const SHORT_BINSTRING: u8 = b'U';
    pub const UNICODE: u8 = b'V';
    pub const BINUNICODE: u8 = b'X';
    pub const EMPTY_LIST: u8 = b']';
    pub const APPEND: u8 = b'a';
    pub const BUILD: u8 = b'b';
    pub const GLOBAL: u8 = b'c';
    pub const DICT: u8 = b'd';
    pub const APPENDS: u8 = b'e';
    pub const GET: u8 = b'g';
    pub const BINGET: u8 = b'h';
    pub const INST: u8 = b'i';
    pub const LONG_BINGET: u8 = b'j';
    pub const LIST: u8 = b'l';
    pub const OBJ: u8 = b'o';
    pub const PUT: u8 = b'p';
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const SETITEM: u8 = b's';
    pub const TUPLE: u8 = b't';
    pub const SETITEMS: u8 = b'u';
    pub const EMPTY_DICT: u8 = b'}';
    pub const PROTO: u8 = 0x80;
    pub const NEWOBJ: u8 = 0x81;
    pub const EXT1: u8 = 0x82;
    pub const EXT2: u8 = 0x83;
    pub const EXT4: u8 = 0x84;
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const LONG1: u8 = 0x8a;
    pub const LONG4: u8 = 0x8b;
    pub const SHORT_BINUNICODE: u8 = 0x8c;
    pub const BINUNICODE8: u8 = 0x8d;
    pub const BINBYTES8: u8 = 0x8e;
    pub const EMPTY_SET: u8 = 0x8f;
    pub const ADDITEMS: u8 = 0x90;
    pub const FROZENSET: u8 = 0x91;
    pub const NEWOBJ_EX: u8 = 0x92;
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const MEMOIZE: u8 = 0x94;
    pub const FRAME: u8 = 0x95;
    pub const BYTEARRAY8: u8 = 0x96;
    pub const NEXT_BUFFER: u8 = 0x97;
    pub const READONLY_BUFFER: u8 = 0x98;
}

/// How an opcode's inline argument is encoded.
#[derive(Debug, Clone, Copy)]
enum ArgKind {
    NoArg,
    U1,
    U2,
    I4,
    U4,
    U8,
    F8,
    /// u1 count, then that many long bytes.
    Long1,
    /// i4 count, then that many long bytes.
    Long4,
    /// Length-prefixed byte string (latin-1 text in old protocols).
    Str1,
    Str4,
    /// Length-prefixed utf-8 text.
    Utf1,
    Utf4,
    Utf8Len,
    /// Length-prefixed raw bytes.
    Bytes1,
    Bytes4,
    Bytes8,
    /// One newline-terminated line.
    NlString,
    /// Two newline-terminated lines (GLOBAL, INST).
    NlStringPair,
}

/// Decoded opcode argument.
#[derive(Debug, Clone, PartialEq)]
pub enum OpArg {
    Int(i64),
    Uint(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Pair(String, String),
}

/// One decoded opcode.
#[derive(Debug, Clone)]
pub struct Op {
    pub name: &'static str,
    pub arg: Option<OpArg>,
    /// Byte offset of the opcode in the stream.
    pub pos: usize,
}

fn opcode_info(code: u8) -> Option<(&'static str, ArgKind)> {
    use ArgKind::*;
    Some(match code {
        op::MARK => ("MARK", NoArg),
        op::EMPTY_TUPLE => ("EMPTY_TUPLE", NoArg),
        op::STOP => ("STOP", NoArg),
        op::POP => ("POP", NoArg),
        op::POP_MARK => ("POP_MARK", NoArg),
        op::DUP => ("DUP", NoArg),
        op::BINBYTES => ("BINBYTES", Bytes4),
        op::SHORT_BINBYTES => ("SHORT_BINBYTES", Bytes1),
        op::FLOAT => ("FLOAT", NlString),
        op::BINFLOAT => ("BINFLOAT", F8),
        op::INT => ("INT", NlString),
        op::BININT => ("BININT", I4),
        op::BININT1 => ("BININT1", U1),
        op::LONG => ("LONG", NlString),
        op::BININT2 => ("BININT2", U2),
        op::NONE => ("NONE", NoArg),
        op::PERSID => ("PERSID", NlString),
        op::BINPERSID => ("BINPERSID", NoArg),
        op::REDUCE => ("REDUCE", NoArg),
        op::STRING => ("STRING", NlString),
        op::BINSTRING => ("BINSTRING", Str4),
        op::SHORT_BINSTRING => ("SHORT_BINSTRING", Str1),
        op::UNICODE => ("UNICODE", NlString),
        op::BINUNICODE => ("BINUNICODE", Utf4),
        op::EMPTY_LIST => ("EMPTY_LIST", NoArg),
        op::APPEND => ("APPEND", NoArg),
        op::BUILD => ("BUILD", NoArg),
        op::GLOBAL => ("GLOBAL", NlStringPair),
        op::DICT => ("DICT", NoArg),
        op::APPENDS => ("APPENDS", NoArg),
        op::GET => ("GET", NlString),
        op::BINGET => ("BINGET", U1),
        op::INST => ("INST", NlStringPair),
        op::LONG_BINGET => ("LONG_BINGET", U4),
        op::LIST => ("LIST", NoArg),
        op::OBJ => ("OBJ", NoArg),
        op::PUT => ("PUT", NlString),
        op::BINPUT => ("BINPUT", U1),
        op::LONG_BINPUT => ("LONG_BINPUT", U4),
        op::SETITEM => ("SETITEM", NoArg),
        op::TUPLE => ("TUPLE", NoArg),
        op::SETITEMS => ("SETITEMS", NoArg),
        op::EMPTY_DICT => ("EMPTY_DICT", NoArg),
        op::PROTO => ("PROTO", U1),
        op::NEWOBJ => ("NEWOBJ", NoArg),
        op::EXT1 => ("EXT1", U1),
        op::EXT2 => ("EXT2", U2),
        op::EXT4 => ("EXT4", I4),
        op::TUPLE1 => ("TUPLE1", NoArg),
        op::TUPLE2 => ("TUPLE2", NoArg),
        op::TUPLE3 => ("TUPLE3", NoArg),
        op::NEWTRUE => ("NEWTRUE", NoArg),
        op::NEWFALSE => ("NEWFALSE", NoArg),
        op::LONG1 => ("LONG1", Long1),
        op::LONG4 => ("LONG4", Long4),
        op::SHORT_BINUNICODE => ("SHORT_BINUNICODE", Utf1),
        op::BINUNICODE8 => ("BINUNICODE8", Utf8Len),
        op::BINBYTES8 => ("BINBYTES8", Bytes8),
        op::EMPTY_SET => ("EMPTY_SET", NoArg),
        op::ADDITEMS => ("ADDITEMS", NoArg),
        op::FROZENSET => ("FROZENSET", NoArg),
        op::NEWOBJ_EX => ("NEWOBJ_EX", NoArg),
        op::STACK_GLOBAL => ("STACK_GLOBAL", NoArg),
        op::MEMOIZE => ("MEMOIZE", NoArg),
        op::FRAME => ("FRAME", U8),
        op::BYTEARRAY8 => ("BYTEARRAY8", Bytes8),
        op::NEXT_BUFFER => ("NEXT_BUFFER", NoArg),
        op::READONLY_BUFFER => ("READONLY_BUFFER", NoArg),
        _ => return None,
    })
}

/// Iterator over the opcodes of a pickle byte stream, in the manner of
/// `pickletools.genops`. Iteration ends after the STOP opcode; a stream
/// that runs out beforehand is malformed.
pub struct OpcodeReader<'a> {
    data: &'a [u8],
    pos: usize,
    done: bool,
}

impl<'a> OpcodeReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            done: false,
        }
    }

    fn bad(&self, reason: &str) -> PackageError {
        PackageError::BadPickle {
            offset: self.pos,
            reason: reason.to_string(),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PackageError> {
        if self.pos + n > self.data.len() {
            return Err(self.bad("ran out of input"));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_line(&mut self) -> Result<String, PackageError> {
        let rest = &self.data[self.pos..];
        match rest.iter().position(|&b| b == b'\n') {
            Some(end) => {
                let line = String::from_utf8_lossy(&rest[..end]).into_owned();
                self.pos += end + 1;
                Ok(line)
            }
            None => Err(self.bad("unterminated line argument")),
        }
    }

    fn read_arg(&mut self, kind: ArgKind) -> Result<Option<OpArg>, PackageError> {
        use ArgKind::*;
        let arg = match kind {
            NoArg => return Ok(None),
            U1 => OpArg::Uint(u64::from(self.take(1)?[0])),
            U2 => {
                let b = self.take(2)?;
                OpArg::Uint(u64::from(u16::from_le_bytes([b[0], b[1]])))
            }
            I4 => {
                let b = self.take(4)?;
                OpArg::Int(i64::from(i32::from_le_bytes([b[0], b[1], b[2], b[3]])))
            }
            U4 => {
                let b = self.take(4)?;
                OpArg::Uint(u64::from(u32::from_le_bytes([b[0], b[1], b[2], b[3]])))
            }
            U8 => {
                let b = self.take(8)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(b);
                OpArg::Uint(u64::from_le_bytes(buf))
            }
            F8 => {
                let b = self.take(8)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(b);
                OpArg::Float(f64::from_be_bytes(buf))
            }
            Long1 => {
                let n = self.take(1)?[0] as usize;
                OpArg::Bytes(self.take(n)?.to_vec())
            }
            Long4 => {
                let b = self.take(4)?;
                let n = i32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                let n = usize::try_from(n).map_err(|_| self.bad("negative length"))?;
                OpArg::Bytes(self.take(n)?.to_vec())
            }
            Str1 | Utf1 | Bytes1 => {
                let n = self.take(1)?[0] as usize;
                self.sized_arg(kind, n)?
            }
            Str4 => {
                let b = self.take(4)?;
                let n = i32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                let n = usize::try_from(n).map_err(|_| self.bad("negative length"))?;
                self.sized_arg(kind, n)?
            }
            Utf4 | Bytes4 => {
                let b = self.take(4)?;
                let n = u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize;
                self.sized_arg(kind, n)?
            }
            Utf8Len | Bytes8 => {
                let b = self.take(8)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(b);
                let n = usize::try_from(u64::from_le_bytes(buf))
                    .map_err(|_| self.bad("oversized length"))?;
                self.sized_arg(kind, n)?
            }
            NlString => OpArg::Str(self.take_line()?),
            NlStringPair => {
                let first = self.take_line()?;
                let second = self.take_line()?;
                OpArg::Pair(first, second)
            }
        };
        Ok(Some(arg))
    }

    fn sized_arg(&mut self, kind: ArgKind, n: usize) -> Result<OpArg, PackageError> {
        use ArgKind::*;
        let bytes = self.take(n)?;
        Ok(match kind {
            Bytes1 | Bytes4 | Bytes8 => OpArg::Bytes(bytes.to_vec()),
            _ => OpArg::Str(String::from_utf8_lossy(bytes).into_owned()),
        })
    }
}

impl<'a> Iterator for OpcodeReader<'a> {
    type Item = Result<Op, PackageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.pos >= self.data.len() {
            self.done = true;
            return Some(Err(self.bad("stream ended before STOP")));
        }
        let pos = self.pos;
        let code = self.data[self.pos];
        self.pos += 1;
        let (name, kind) = match opcode_info(code) {
            Some(info) => info,
            None => {
                self.done = true;
                return Some(Err(PackageError::BadPickle {
                    offset: pos,
                    reason: format!("unknown opcode 0x{:02x}", code),
                }));
            }
        };
        if code == op::STOP {
            self.done = true;
        }
        match self.read_arg(kind) {
            Ok(arg) => Some(Ok(Op { name, arg, pos })),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Walk a pickle stream and collect the module half of every GLOBAL
/// reference, in first-occurrence order.
///
/// The walk is purely lexical: reduce functions are never executed.
pub fn probe_global_references(data: &[u8]) -> Result<Vec<String>, PackageError> {
    let mut modules: Vec<String> = Vec::new();
    for result in OpcodeReader::new(data) {
        let op = result?;
        if op.name == "GLOBAL" {
            if let Some(OpArg::Pair(module, _)) = op.arg {
                if !modules.contains(&module) {
                    modules.push(module);
                }
            }
        }
    }
    Ok(modules)
}

/// An object that knows how to reduce itself for packaging. The payload
/// is embedded in the stream behind a `("reduce_package", …)` persistent
/// id and interpreted by the loading side.
pub trait PackageReduce: fmt::Debug {
    fn reduce_package(&self) -> Value;
}

/// Object graph accepted by the pickler.
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    /// Reference to `module.name`, emitted as a GLOBAL opcode.
    Global { module: String, name: String },
    /// `callable(*args)` on load; `callable` is usually a `Global`.
    Reduce { callable: Box<Value>, args: Vec<Value> },
    /// A storage handle; only picklable through a persistent-id hook.
    Storage(Arc<Storage>),
    /// A packaging-aware object; only picklable through a persistent-id
    /// hook.
    Reducible(Arc<dyn PackageReduce>),
}

impl Value {
    pub fn global(module: &str, name: &str) -> Value {
        Value::Global {
            module: module.to_string(),
            name: name.to_string(),
        }
    }

    pub fn reduce(callable: Value, args: Vec<Value>) -> Value {
        Value::Reduce {
            callable: Box::new(callable),
            args,
        }
    }

    pub fn str(s: &str) -> Value {
        Value::Str(s.to_string())
    }
}

/// Serialise `value` without a persistent-id hook. Storages and
/// reducible objects are rejected.
pub fn dumps(value: &Value) -> Result<Vec<u8>, PackageError> {
    dumps_with_hook(value, &mut |_| None)
}

/// Serialise `value`, consulting `hook` once per object. A claimed
/// object is replaced by its persistent id followed by BINPERSID; the
/// id itself is serialised with the hook suppressed, its children are
/// not.
pub fn dumps_with_hook(
    value: &Value,
    hook: &mut dyn FnMut(&Value) -> Option<Value>,
) -> Result<Vec<u8>, PackageError> {
    let mut out = Vec::new();
    out.push(op::PROTO);
    out.push(PICKLE_PROTOCOL);
    save(&mut out, value, hook, true)?;
    out.push(op::STOP);
    Ok(out)
}

fn save(
    out: &mut Vec<u8>,
    value: &Value,
    hook: &mut dyn FnMut(&Value) -> Option<Value>,
    check_persistent: bool,
) -> Result<(), PackageError> {
    if check_persistent {
        if let Some(pid) = hook(value) {
            save(out, &pid, hook, false)?;
            out.push(op::BINPERSID);
            return Ok(());
        }
    }
    match value {
        Value::None => out.push(op::NONE),
        Value::Bool(true) => out.push(op::NEWTRUE),
        Value::Bool(false) => out.push(op::NEWFALSE),
        Value::Int(i) => save_int(out, *i),
        Value::Float(f) => {
            out.push(op::BINFLOAT);
            out.extend_from_slice(&f.to_be_bytes());
        }
        Value::Str(s) => save_str(out, s)?,
        Value::Bytes(b) => save_bytes(out, b)?,
        Value::List(items) => {
            out.push(op::EMPTY_LIST);
            if !items.is_empty() {
                out.push(op::MARK);
                for item in items {
                    save(out, item, hook, true)?;
                }
                out.push(op::APPENDS);
            }
        }
        Value::Tuple(items) => save_tuple(out, items, hook)?,
        Value::Dict(entries) => {
            out.push(op::EMPTY_DICT);
            if !entries.is_empty() {
                out.push(op::MARK);
                for (k, v) in entries {
                    save(out, k, hook, true)?;
                    save(out, v, hook, true)?;
                }
                out.push(op::SETITEMS);
            }
        }
        Value::Global { module, name } => save_global(out, module, name)?,
        Value::Reduce { callable, args } => {
            save(out, callable, hook, true)?;
            save_tuple(out, args, hook)?;
            out.push(op::REDUCE);
        }
        Value::Storage(_) => return Err(PackageError::Unpicklable("a storage")),
        Value::Reducible(_) => {
            return Err(PackageError::Unpicklable("a packaging-reducible object"))
        }
    }
    Ok(())
}

fn save_tuple(
    out: &mut Vec<u8>,
    items: &[Value],
    hook: &mut dyn FnMut(&Value) -> Option<Value>,
) -> Result<(), PackageError> {
    match items.len() {
        0 => out.push(op::EMPTY_TUPLE),
        n @ 1..=3 => {
            for item in items {
                save(out, item, hook, true)?;
            }
            out.push([op::TUPLE1, op::TUPLE2, op::TUPLE3][n - 1]);
        }
        _ => {
            out.push(op::MARK);
            for item in items {
                save(out, item, hook, true)?;
            }
            out.push(op::TUPLE);
        }
    }
    Ok(())
}

fn save_int(out: &mut Vec<u8>, i: i64) {
    if (0..=0xff).contains(&i) {
        out.push(op::BININT1);
        out.push(i as u8);
    } else if (0x100..=0xffff).contains(&i) {
        out.push(op::BININT2);
        out.extend_from_slice(&(i as u16).to_le_bytes());
    } else if i32::try_from(i).is_ok() {
        out.push(op::BININT);
        out.extend_from_slice(&(i as i32).to_le_bytes());
    } else {
        // Minimal two's-complement little-endian encoding.
        let mut bytes = i.to_le_bytes().to_vec();
        while bytes.len() > 1 {
            let last = bytes[bytes.len() - 1];
            let prev = bytes[bytes.len() - 2];
            if (last == 0x00 && prev < 0x80) || (last == 0xff && prev >= 0x80) {
                bytes.pop();
            } else {
                break;
            }
        }
        out.push(op::LONG1);
        out.push(bytes.len() as u8);
        out.extend_from_slice(&bytes);
    }
}

fn save_str(out: &mut Vec<u8>, s: &str) -> Result<(), PackageError> {
    let bytes = s.as_bytes();
    let len = u32::try_from(bytes.len())
        .map_err(|_| PackageError::Unpicklable("a string longer than 4 GiB"))?;
    out.push(op::BINUNICODE);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn save_bytes(out: &mut Vec<u8>, b: &[u8]) -> Result<(), PackageError> {
    if b.len() < 0x100 {
        out.push(op::SHORT_BINBYTES);
        out.push(b.len() as u8);
    } else {
        let len = u32::try_from(b.len())
            .map_err(|_| PackageError::Unpicklable("a byte string longer than 4 GiB"))?;
        out.push(op::BINBYTES);
        out.extend_from_slice(&len.to_le_bytes());
    }
    out.extend_from_slice(b);
    Ok(())
}

fn save_global(out: &mut Vec<u8>, module: &str, name: &str) -> Result<(), PackageError> {
    for part in &[module, name] {
        if part.is_empty() || part.contains(|c: char| c == '\n' || c == ' ') {
            return Err(PackageError::InvalidName {
                name: format!("{} {}", module, name),
                reason: "global references must be space- and newline-free".to_string(),
            });
        }
    }
    out.push(op::GLOBAL);
    out.extend_from_slice(module.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(name.as_bytes());
    out.push(b'\n');
    Ok(())
}
