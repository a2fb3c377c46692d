// Copyright 2021 Satchel contributors

// SPDX-License-Identifier: Apache-2.0

//! The pattern policy engine.
//!
//! An ordered table of glob rules classifies every module in the graph
//! into one of four dispositions. Rules prepended by the exporter (for
//! directly saved modules) take precedence over user rules; within the
//! table, first match wins.

use crate::glob::GlobGroup;
use crate::stdlib::is_stdlib_module;
use crate::{root_of, PackageError};
use std::collections::HashSet;

/// What to do with a module matched by a rule. A closed set: every
/// classification site enumerates all four.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Copy the module source into the archive.
    Intern,
    /// Replace the module with an attribute-fabricating stub.
    Mock,
    /// Record the module in the extern manifest; the loader provides it.
    Extern,
    /// Forbid the module; classification aborts if it is required.
    Deny,
}

/// One entry of the pattern table.
#[derive(Debug, Clone)]
pub struct PatternRule {
    pub glob: GlobGroup,
    pub action: Action,
    /// When false, sealing fails unless at least one module matched.
    pub allow_empty: bool,
}

/// Ordered rule list with matched-rule tracking.
#[derive(Debug, Default)]
pub struct PatternTable {
    rules: Vec<PatternRule>,
    matched: HashSet<String>,
}

impl PatternTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule in front of all existing ones.
    pub fn prepend(&mut self, rule: PatternRule) {
        self.rules.insert(0, rule);
    }

    /// Add a rule behind all existing ones.
    pub fn append(&mut self, rule: PatternRule) {
        self.rules.push(rule);
    }

    /// Classify `name` against the table, first match wins. The matching
    /// rule is recorded for empty-match enforcement. `None` means no rule
    /// applied.
    pub fn classify(&mut self, name: &str) -> Option<Action> {
        for rule in &self.rules {
            if rule.glob.matches(name) {
                self.matched.insert(rule.glob.key());
                return Some(rule.action);
            }
        }
        None
    }

    /// Enforce `allow_empty = false` rules after all modules have been
    /// classified.
    pub fn enforce_non_empty(&self) -> Result<(), PackageError> {
        for rule in &self.rules {
            if !rule.allow_empty && !self.matched.contains(&rule.glob.key()) {
                return Err(PackageError::EmptyMatch {
                    pattern: rule.glob.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Standard-library modules that are never auto-externed because they
/// grant broad system access.
pub const DISALLOWED_IMPLICIT_EXTERN: &[&str] = &["sys", "io"];

/// Oracle deciding whether a module may be externed without an explicit
/// rule: either its root is the hosting framework, or the root is a
/// standard-library package outside the disallow list.
#[derive(Debug, Clone, Default)]
pub struct ImplicitExtern {
    framework_root: Option<String>,
}

impl ImplicitExtern {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the distinguished framework root that always externs.
    pub fn set_framework_root(&mut self, root: &str) {
        self.framework_root = Some(root.to_string());
    }

    pub fn can_extern(&self, name: &str) -> bool {
        let root = root_of(name);
        if self.framework_root.as_deref() == Some(root) {
            return true;
        }
        !DISALLOWED_IMPLICIT_EXTERN.contains(&root) && is_stdlib_module(root)
    }
}

/// Insertion-ordered string set.
#[derive(Debug, Clone, Default)]
pub struct OrderedSet {
    items: Vec<String>,
    index: HashSet<String>,
}

impl OrderedSet {
    pub fn insert(&mut self, item: &str) {
        if self.index.insert(item.to_string()) {
            self.items.push(item.to_string());
        }
    }

    pub fn contains(&self, item: &str) -> bool {
        self.index.contains(item)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.items.clone()
    }
}

/// The three recording dispositions. Deny never records; it aborts.
#[derive(Debug, Clone, Default)]
pub struct Dispositions {
    pub interned: OrderedSet,
    pub mocked: OrderedSet,
    pub externed: OrderedSet,
}
