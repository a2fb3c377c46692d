// Copyright 2021 Satchel contributors

// SPDX-License-Identifier: Apache-2.0

//! Glob matching over dotted module names.
//!
//! Patterns are segment-oriented: `*` matches within a single segment,
//! `**` matches any number of whole segments (including none). A
//! `GlobGroup` combines include patterns with an exclusion set.

use crate::PackageError;
use regex::Regex;

/// A set of include/exclude globs compiled into a single predicate over
/// dotted names.
///
/// A name matches the group iff it matches at least one include pattern
/// and no exclude pattern. Matching always consumes the entire name.
#[derive(Debug, Clone)]
pub struct GlobGroup {
    include_raw: Vec<String>,
    exclude_raw: Vec<String>,
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl GlobGroup {
    /// Compile a group from a single include pattern.
    pub fn new(include: &str) -> Result<Self, PackageError> {
        Self::with_exclude(&[include.to_string()], &[])
    }

    /// Compile a group from include and exclude pattern lists.
    pub fn with_exclude(include: &[String], exclude: &[String]) -> Result<Self, PackageError> {
        let compile = |pats: &[String]| -> Result<Vec<Regex>, PackageError> {
            pats.iter().map(|p| glob_to_re(p)).collect()
        };
        Ok(Self {
            include_raw: include.to_vec(),
            exclude_raw: exclude.to_vec(),
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    /// Test whether `candidate` is matched by this group.
    pub fn matches(&self, candidate: &str) -> bool {
        // Prefix with the separator so every component regex can uniformly
        // require a leading dot.
        let candidate = format!(".{}", candidate);
        self.include.iter().any(|p| p.is_match(&candidate))
            && !self.exclude.iter().any(|p| p.is_match(&candidate))
    }

    /// Canonical identity of this group, used to track which rules have
    /// matched at least one module. Two groups built from the same
    /// include/exclude lists share a key.
    pub fn key(&self) -> String {
        format!("{}|{}", self.include_raw.join(","), self.exclude_raw.join(","))
    }
}

impl std::fmt::Display for GlobGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GlobGroup(include={:?}", self.include_raw)?;
        if !self.exclude_raw.is_empty() {
            write!(f, ", exclude={:?}", self.exclude_raw)?;
        }
        write!(f, ")")
    }
}

/// Translate a single glob pattern into an anchored regex over a
/// dot-prefixed candidate.
fn glob_to_re(pattern: &str) -> Result<Regex, PackageError> {
    let mut out = String::from("^");
    for component in pattern.split('.') {
        if component.contains("**") {
            if component == "**" {
                // Zero or more whole segments.
                out.push_str(r"(\.[^.]+)*");
            } else {
                return Err(PackageError::InvalidPattern {
                    pattern: pattern.to_string(),
                    reason: "`**` can only appear as an entire path segment".to_string(),
                });
            }
        } else {
            out.push_str(r"\.");
            let literal_parts: Vec<String> =
                component.split('*').map(|x| regex::escape(x)).collect();
            out.push_str(&literal_parts.join("[^.]*"));
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| PackageError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}
