// Copyright 2021 Satchel contributors

// SPDX-License-Identifier: Apache-2.0

//! Lexical import scanning.
//!
//! `scan_imports` is a pure function from source text to the import
//! statements it contains; `resolve_dependencies` turns that raw list into
//! qualified dependency names for a given enclosing module, resolving
//! relative references and disambiguating submodules from attributes.

use crate::importer::Importer;
use regex::Regex;
use std::collections::HashSet;

/// One import statement target as written in the source.
///
/// For `import a.b`, `module` is `"a.b"` and `symbol` is `None`. For
/// `from a.b import c`, `module` is `"a.b"` and `symbol` is `Some("c")`.
/// Relative imports keep their leading dots in `module`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImport {
    pub module: String,
    pub symbol: Option<String>,
}

/// Scan `src` for import statements.
///
/// The scan is purely lexical: it recognises `import` and `from … import`
/// statements (including parenthesised and backslash-continued ones) at
/// any indentation, and ignores everything else. Dependencies reachable
/// only through `__import__` or importlib calls are not detected.
pub fn scan_imports(src: &str) -> Vec<RawImport> {
    let import_re = Regex::new(r"^\s*import\s+(.+)$").unwrap();
    let from_re = Regex::new(r"^\s*from\s+([.\w]+)\s+import\s+(.+)$").unwrap();

    let mut out = Vec::new();
    for line in logical_lines(src) {
        let line = strip_comment(&line);
        if let Some(caps) = from_re.captures(&line) {
            let module = &caps[1];
            for name in split_import_list(&caps[2]) {
                if name == "*" {
                    out.push(RawImport {
                        module: module.to_string(),
                        symbol: None,
                    });
                } else if is_identifier(&name) {
                    out.push(RawImport {
                        module: module.to_string(),
                        symbol: Some(name),
                    });
                }
            }
        } else if let Some(caps) = import_re.captures(&line) {
            for name in split_import_list(&caps[1]) {
                if is_dotted_name(&name) {
                    out.push(RawImport {
                        module: name,
                        symbol: None,
                    });
                }
            }
        }
    }
    out
}

/// Resolve the raw imports of `src` into qualified dependency names.
///
/// Relative references are resolved against the enclosing module's package
/// name. `from pkg import sub` records `pkg.sub` when the importer can
/// resolve it as a module, `pkg` otherwise. Names the importer cannot
/// resolve at all are dropped. The result is de-duplicated preserving
/// first-occurrence order.
pub fn resolve_dependencies(
    src: &str,
    module_name: &str,
    is_package: bool,
    importer: &dyn Importer,
) -> Vec<String> {
    let package_name = if is_package {
        module_name
    } else {
        match module_name.rfind('.') {
            Some(idx) => &module_name[..idx],
            None => module_name,
        }
    };

    let mut deps = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |name: String, deps: &mut Vec<String>| {
        if seen.insert(name.clone()) {
            deps.push(name);
        }
    };

    for raw in scan_imports(src) {
        let module = match resolve_relative(&raw.module, package_name) {
            Some(m) => m,
            None => {
                warn!(
                    "`{}`: relative import `{}` reaches beyond the top-level package",
                    module_name, raw.module
                );
                continue;
            }
        };
        if let Some(symbol) = &raw.symbol {
            // `from pack import sub` where `sub` is a submodule: the
            // dependency is the submodule, not the parent.
            let submodule = format!("{}.{}", module, symbol);
            if importer.import_module(&submodule).is_ok() {
                push(submodule, &mut deps);
                continue;
            }
        }
        if importer.import_module(&module).is_ok() {
            push(module, &mut deps);
        }
    }
    deps
}

/// Resolve leading-dot notation against `package_name`. Returns `None`
/// when the dots climb past the top-level package.
fn resolve_relative(module: &str, package_name: &str) -> Option<String> {
    let level = module.chars().take_while(|&c| c == '.').count();
    if level == 0 {
        return Some(module.to_string());
    }
    let rest = &module[level..];
    let segments: Vec<&str> = package_name.split('.').collect();
    if level - 1 >= segments.len() {
        return None;
    }
    let base = segments[..segments.len() - (level - 1)].join(".");
    if rest.is_empty() {
        Some(base)
    } else {
        Some(format!("{}.{}", base, rest))
    }
}

/// Join continuation lines so every import statement occupies one line.
/// Parenthesised from-imports and backslash continuations are folded.
fn logical_lines(src: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut pending = String::new();
    let mut depth = 0i32;
    for line in src.lines() {
        let stripped = strip_comment(line);
        let mut continued = false;
        let mut body = stripped.as_str();
        if let Some(prefix) = body.strip_suffix('\\') {
            body = prefix;
            continued = true;
        }
        pending.push_str(body);
        for c in body.chars() {
            match c {
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth -= 1,
                _ => {}
            }
        }
        if depth > 0 || continued {
            pending.push(' ');
            continue;
        }
        out.push(std::mem::take(&mut pending));
    }
    if !pending.is_empty() {
        out.push(pending);
    }
    out
}

/// Drop a trailing `#` comment, tracking simple quote state.
fn strip_comment(line: &str) -> String {
    let mut quote: Option<char> = None;
    for (i, c) in line.char_indices() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '#' => return line[..i].trim_end().to_string(),
                _ => {}
            },
        }
    }
    line.trim_end().to_string()
}

/// Split a comma-separated import list, stripping parentheses and
/// `as`-aliases.
fn split_import_list(list: &str) -> Vec<String> {
    list.replace(&['(', ')'][..], " ")
        .split(',')
        .map(|item| {
            let item = item.trim();
            match item.split_whitespace().next() {
                Some(name) => name.to_string(),
                None => String::new(),
            }
        })
        .filter(|name| !name.is_empty())
        .collect()
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn is_dotted_name(name: &str) -> bool {
    !name.is_empty() && name.split('.').all(is_identifier)
}
