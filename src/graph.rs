// Copyright 2021 Satchel contributors

// SPDX-License-Identifier: Apache-2.0

//! The module dependency graph.
//!
//! Nodes are qualified module names (or pickle keys) carrying emission
//! metadata; a directed edge `u -> v` means `u` depends on `v`. Cycles are
//! permitted; traversal order is node insertion order so that archive
//! emission is deterministic.

use petgraph::graph::{Graph, NodeIndex};
use std::collections::HashMap;
use std::io::Write;

/// Where a node's source text (if any) came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceOrigin {
    /// No source has been attached yet.
    Absent,
    /// Source supplied directly by the user.
    UserProvided,
    /// Source will be fetched through the importer at seal time.
    Imported,
    /// The node stands for a pickled object; it never has source.
    Pickle,
}

/// Per-node metadata.
#[derive(Debug, Clone)]
pub struct ModuleNode {
    /// Qualified name, or a `<package.resource>` pickle key.
    pub name: String,
    pub origin: SourceOrigin,
    /// Present iff the node will be emitted from user-provided text.
    pub source: Option<String>,
    /// Only meaningful when source is present.
    pub is_package: bool,
}

impl ModuleNode {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            origin: SourceOrigin::Absent,
            source: None,
            is_package: false,
        }
    }

    pub fn is_pickle(&self) -> bool {
        self.origin == SourceOrigin::Pickle
    }
}

/// Directed graph of module nodes keyed by qualified name.
#[derive(Debug, Default)]
pub struct ModuleGraph {
    graph: Graph<ModuleNode, ()>,
    nodes: HashMap<String, NodeIndex>,
}

impl ModuleGraph {
    pub fn new() -> Self {
        Self {
            graph: Graph::new(),
            nodes: HashMap::new(),
        }
    }

    /// Insert `name` if absent and return its index. Existing nodes are
    /// left untouched.
    pub fn add_node(&mut self, name: &str) -> NodeIndex {
        if let Some(&idx) = self.nodes.get(name) {
            return idx;
        }
        let idx = self.graph.add_node(ModuleNode::new(name));
        self.nodes.insert(name.to_string(), idx);
        idx
    }

    /// Insert or update a node. The closure sees the node after creation;
    /// attribute updates are last-writer-wins.
    pub fn update_node<F: FnOnce(&mut ModuleNode)>(&mut self, name: &str, f: F) {
        let idx = self.add_node(name);
        f(&mut self.graph[idx]);
    }

    /// Record `u -> v`, creating both endpoints as needed. Parallel edges
    /// are collapsed.
    pub fn add_edge(&mut self, u: &str, v: &str) {
        let ui = self.add_node(u);
        let vi = self.add_node(v);
        self.graph.update_edge(ui, vi, ());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn node(&self, name: &str) -> Option<&ModuleNode> {
        self.nodes.get(name).map(|&idx| &self.graph[idx])
    }

    /// Node names in insertion order.
    pub fn node_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.graph.node_indices().map(move |i| self.graph[i].name.as_str())
    }

    /// All edges as (from, to) name pairs.
    pub fn edges(&self) -> Vec<(&str, &str)> {
        self.graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(u, v)| (self.graph[u].name.as_str(), self.graph[v].name.as_str()))
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Render the graph in Graphviz dot format.
    pub fn write_dot(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let named: Graph<&str, ()> = self.graph.map(|_, n| n.name.as_str(), |_, _| ());
        writeln!(
            out,
            "{:?}",
            petgraph::dot::Dot::with_config(&named, &[petgraph::dot::Config::EdgeNoLabel])
        )
    }
}
