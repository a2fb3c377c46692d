// Copyright 2021 Satchel contributors

// SPDX-License-Identifier: Apache-2.0

//! Module importers.
//!
//! An [`Importer`] maps a qualified module name to a [`Module`] handle, or
//! fails with `ModuleNotFound`. Handles carry the module source when one
//! exists on disk; extension modules resolve but have no source, which
//! surfaces later as `SourceUnavailable`.

use crate::PackageError;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// A resolved module.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub is_package: bool,
    /// Source text, absent for extension and built-in modules.
    pub source: Option<String>,
    /// File the module was resolved from, when known.
    pub file: Option<PathBuf>,
}

/// Lookup oracle mapping qualified names to modules.
pub trait Importer {
    fn import_module(&self, name: &str) -> Result<Module, PackageError>;
}

/// Source text and package flag of a module, failing with
/// `SourceUnavailable` when the handle has no on-disk source.
pub fn source_of(module: &Module) -> Result<(&str, bool), PackageError> {
    match &module.source {
        Some(src) => Ok((src, module.is_package)),
        None => Err(PackageError::SourceUnavailable {
            module: module.name.clone(),
            reason: match &module.file {
                Some(file) => format!("its file `{}` is not a source file", file.display()),
                None => "it has no source file".to_string(),
            },
        }),
    }
}

/// Importer over one or more filesystem roots laid out as Python source
/// trees: `a.b.c` resolves to `a/b/c/__init__.py` (package), `a/b/c.py`
/// (module) or `a/b/c.so`/`a/b/c.pyd` (extension module, no source).
#[derive(Debug, Clone)]
pub struct DirectoryImporter {
    roots: Vec<PathBuf>,
}

impl DirectoryImporter {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            roots: vec![root.as_ref().to_path_buf()],
        }
    }

    pub fn with_roots(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }
}

impl Importer for DirectoryImporter {
    fn import_module(&self, name: &str) -> Result<Module, PackageError> {
        if name.is_empty() || !name.split('.').all(is_import_segment) {
            return Err(PackageError::ModuleNotFound(name.to_string()));
        }
        let mut rel = PathBuf::new();
        for segment in name.split('.') {
            rel.push(segment);
        }
        for root in &self.roots {
            let base = root.join(&rel);
            let init = base.join("__init__.py");
            if init.is_file() {
                return Ok(Module {
                    name: name.to_string(),
                    is_package: true,
                    source: Some(fs::read_to_string(&init)?),
                    file: Some(init),
                });
            }
            let source_file = base.with_extension("py");
            if source_file.is_file() {
                return Ok(Module {
                    name: name.to_string(),
                    is_package: false,
                    source: Some(fs::read_to_string(&source_file)?),
                    file: Some(source_file),
                });
            }
            for ext in &["so", "pyd"] {
                let native = base.with_extension(ext);
                if native.is_file() {
                    return Ok(Module {
                        name: name.to_string(),
                        is_package: false,
                        source: None,
                        file: Some(native),
                    });
                }
            }
        }
        Err(PackageError::ModuleNotFound(name.to_string()))
    }
}

/// Path-safe module name segment.
fn is_import_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_')
        && !segment.starts_with(|c: char| c.is_numeric())
}

/// In-memory importer for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemoryImporter {
    modules: HashMap<String, Module>,
}

impl MemoryImporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plain module with the given source.
    pub fn add_module(&mut self, name: &str, source: &str) -> &mut Self {
        self.insert(name, source, false, true)
    }

    /// Register a package with the given `__init__` source.
    pub fn add_package(&mut self, name: &str, source: &str) -> &mut Self {
        self.insert(name, source, true, true)
    }

    /// Register a module that resolves but has no source, like an
    /// extension module.
    pub fn add_sourceless(&mut self, name: &str) -> &mut Self {
        self.insert(name, "", false, false)
    }

    fn insert(&mut self, name: &str, source: &str, is_package: bool, has_source: bool) -> &mut Self {
        self.modules.insert(
            name.to_string(),
            Module {
                name: name.to_string(),
                is_package,
                source: if has_source {
                    Some(source.to_string())
                } else {
                    None
                },
                file: None,
            },
        );
        self
    }
}

impl Importer for MemoryImporter {
    fn import_module(&self, name: &str) -> Result<Module, PackageError> {
        self.modules
            .get(name)
            .cloned()
            .ok_or_else(|| PackageError::ModuleNotFound(name.to_string()))
    }
}

/// Ordered fallback over several importers: the first success wins, and
/// `ModuleNotFound` is only reported when every importer misses.
pub struct OrderedImporter {
    importers: Vec<Box<dyn Importer>>,
}

impl OrderedImporter {
    pub fn new(importers: Vec<Box<dyn Importer>>) -> Self {
        Self { importers }
    }
}

impl Importer for OrderedImporter {
    fn import_module(&self, name: &str) -> Result<Module, PackageError> {
        for importer in &self.importers {
            match importer.import_module(name) {
                Ok(module) => return Ok(module),
                Err(PackageError::ModuleNotFound(_)) => continue,
                Err(other) => return Err(other),
            }
        }
        Err(PackageError::ModuleNotFound(name.to_string()))
    }
}
