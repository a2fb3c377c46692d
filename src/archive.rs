// Copyright 2021 Satchel contributors

// SPDX-License-Identifier: Apache-2.0

//! Archive record emission.
//!
//! A [`RecordSink`] is a plain byte-stream sink keyed by path; the
//! [`ArchiveWriter`] layered on top owns path assignment for sources and
//! storages and enforces the layout rules: unique record paths, no
//! mangled names, records emitted in the order they are supplied.

use crate::{is_mangled, PackageError};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Source file suffix used for emitted module sources.
pub const SOURCE_EXTENSION: &str = "py";

/// Reserved record path of the extern-module manifest.
pub const EXTERN_MANIFEST_PATH: &str = ".data/extern_modules";

/// Minimum archive format version declared to the sink.
pub const MIN_FORMAT_VERSION: u32 = 6;

/// Byte-stream sink keyed by record path.
pub trait RecordSink {
    /// Declare the minimum format version a reader must understand.
    /// Invoked exactly once, at writer construction.
    fn set_min_version(&mut self, _version: u32) {}

    fn write_record(&mut self, path: &str, data: &[u8]) -> std::io::Result<()>;

    /// Flush and close. Must be safe to call more than once.
    fn finish(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Layout layer over a record sink.
pub struct ArchiveWriter {
    sink: Box<dyn RecordSink>,
    written: Vec<String>,
    finished: bool,
}

impl ArchiveWriter {
    pub fn new(mut sink: Box<dyn RecordSink>) -> Self {
        sink.set_min_version(MIN_FORMAT_VERSION);
        Self {
            sink,
            written: Vec::new(),
            finished: false,
        }
    }

    /// Emit one record. Mangled paths and duplicate paths are faults.
    pub fn write_record(&mut self, path: &str, data: &[u8]) -> Result<(), PackageError> {
        if is_mangled(path) {
            return Err(PackageError::InvalidName {
                name: path.to_string(),
                reason: "modules loaded from a packaged archive cannot be saved again".to_string(),
            });
        }
        if self.written.iter().any(|p| p == path) {
            return Err(PackageError::DuplicateRecord(path.to_string()));
        }
        trace!("record `{}` ({} bytes)", path, data.len());
        self.sink.write_record(path, data)?;
        self.written.push(path.to_string());
        Ok(())
    }

    /// Emit module source under its canonical path: dots become slashes,
    /// packages gain an `__init__` leaf.
    pub fn write_source(
        &mut self,
        module_name: &str,
        src: &str,
        is_package: bool,
    ) -> Result<(), PackageError> {
        let path = if is_package {
            format!(
                "{}/__init__.{}",
                module_name.replace('.', "/"),
                SOURCE_EXTENSION
            )
        } else {
            format!("{}.{}", module_name.replace('.', "/"), SOURCE_EXTENSION)
        };
        self.write_record(&path, src.as_bytes())
    }

    /// Emit the extern manifest: newline-joined names with a trailing
    /// newline.
    pub fn write_extern_manifest(&mut self, names: &[String]) -> Result<(), PackageError> {
        let mut contents = names.join("\n");
        contents.push('\n');
        self.write_record(EXTERN_MANIFEST_PATH, contents.as_bytes())
    }

    /// Emit one storage blob under its reserved path.
    pub fn write_storage(&mut self, key: &str, data: &[u8]) -> Result<(), PackageError> {
        self.write_record(&format!(".data/{}.storage", key), data)
    }

    /// Record paths in emission order.
    pub fn record_paths(&self) -> &[String] {
        &self.written
    }

    /// Close the sink. Idempotent; later writes are rejected by the sink
    /// being gone.
    pub fn finish(&mut self) -> Result<(), PackageError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.sink.finish()?;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Drop for ArchiveWriter {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.finish() {
                warn!("failed to finish archive sink: {}", e);
            }
        }
    }
}

/// Sink writing each record as a file under a root directory.
#[derive(Debug)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new<P: AsRef<Path>>(root: P) -> std::io::Result<Self> {
        fs::create_dir_all(root.as_ref())?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
        })
    }
}

impl RecordSink for DirectorySink {
    fn write_record(&mut self, path: &str, data: &[u8]) -> std::io::Result<()> {
        let target = self.root.join(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(target, data)
    }
}

/// Shared handle onto the records collected by a [`MemorySink`].
pub type Records = Rc<RefCell<Vec<(String, Vec<u8>)>>>;

/// In-memory sink for tests and programmatic use. The record list stays
/// readable through the handle after the exporter has been consumed.
#[derive(Default)]
pub struct MemorySink {
    records: Records,
    min_version: Option<u32>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle onto the record list, alive independently of the sink.
    pub fn records(&self) -> Records {
        Rc::clone(&self.records)
    }

    pub fn min_version(&self) -> Option<u32> {
        self.min_version
    }
}

impl RecordSink for MemorySink {
    fn set_min_version(&mut self, version: u32) {
        self.min_version = Some(version);
    }

    fn write_record(&mut self, path: &str, data: &[u8]) -> std::io::Result<()> {
        self.records
            .borrow_mut()
            .push((path.to_string(), data.to_vec()));
        Ok(())
    }
}
