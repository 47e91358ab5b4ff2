//! Build-graph representation.
//!
//! An arena of nodes with index-based edges. The graph is only ever appended
//! to; a `NodeId` stays valid for the lifetime of the graph that issued it.
//! Evaluation is the executor's business, this module only describes work.

use crate::model::SourceLocation;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Index of a node in its [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A filesystem attached to an [`ExecOp`] at `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mount {
    pub target: String,
    pub source: NodeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    pub readonly: bool,
}

/// Run a process with `root` as its root filesystem.
///
/// The output state is `root` after the process exits successfully.
/// Mounts are not part of the output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecOp {
    pub root: NodeId,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
}

impl ExecOp {
    pub fn new(root: NodeId, args: Vec<String>) -> Self {
        Self {
            root,
            args,
            env: BTreeMap::new(),
            cwd: None,
            mounts: Vec::new(),
        }
    }
}

/// What a node does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    /// A named input filesystem resolved by the executor.
    Source { name: String },
    /// A fresh filesystem holding a single file.
    File {
        path: String,
        contents: String,
        mode: u32,
    },
    /// Run a process; see [`ExecOp`].
    Exec(ExecOp),
    /// `base` with the full tree of every input laid over it at `path`.
    Merge {
        base: NodeId,
        inputs: Vec<NodeId>,
        path: String,
    },
    /// Content of `output`, evaluated only after every node in `forced`.
    Passthrough { output: NodeId, forced: Vec<NodeId> },
}

/// An operation plus the metadata shown in build progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    #[serde(flatten)]
    pub op: Op,
    /// Display name in build progress.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Progress group the node is listed under.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Test document locations an error on this node points at.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<SourceLocation>,
}

impl Node {
    pub fn new(op: Op) -> Self {
        Self {
            op,
            name: None,
            group: None,
            locations: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn at(mut self, location: Option<SourceLocation>) -> Self {
        self.locations.extend(location);
        self
    }

    pub fn with_locations(mut self, locations: impl IntoIterator<Item = SourceLocation>) -> Self {
        self.locations.extend(locations);
        self
    }

    /// Direct dependencies, in declaration order.
    pub fn deps(&self) -> Vec<NodeId> {
        match &self.op {
            Op::Source { .. } | Op::File { .. } => Vec::new(),
            Op::Exec(exec) => std::iter::once(exec.root)
                .chain(exec.mounts.iter().map(|m| m.source))
                .collect(),
            Op::Merge { base, inputs, .. } => {
                std::iter::once(*base).chain(inputs.iter().copied()).collect()
            }
            Op::Passthrough { output, forced } => {
                forced.iter().copied().chain(std::iter::once(*output)).collect()
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node; its id is its position.
    pub fn add(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    /// Append a named input filesystem.
    pub fn source(&mut self, name: impl Into<String>) -> NodeId {
        self.add(Node::new(Op::Source { name: name.into() }))
    }

    /// Panics if `id` was issued by another graph and is out of range.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// The node for `id`, or `None` if it was never issued by this graph.
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every node with its id, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    /// Combine independent states that all derive from `base`.
    ///
    /// Every input keeps a live edge into the result, so none of them can be
    /// pruned as unreferenced, and none is ordered before another. With a
    /// single input the input itself is returned.
    pub fn merge_at_path(&mut self, base: NodeId, inputs: Vec<NodeId>, path: &str) -> NodeId {
        match inputs.len() {
            0 => base,
            1 => inputs[0],
            _ => self.add(Node::new(Op::Merge {
                base,
                inputs,
                path: path.to_string(),
            })),
        }
    }

    /// Every node `id` transitively depends on, dependencies first, `id` last.
    pub fn reachable(&self, id: NodeId) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        // Iterative post-order: (node, deps already pushed)
        let mut stack = vec![(id, false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                order.push(current);
                continue;
            }
            if !seen.insert(current) {
                continue;
            }
            stack.push((current, true));
            for dep in self.node(current).deps().into_iter().rev() {
                if !seen.contains(&dep) {
                    stack.push((dep, false));
                }
            }
        }
        order
    }

    /// Pretty JSON dump; identical graphs produce identical text.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(graph: &mut Graph, root: NodeId, arg: &str) -> NodeId {
        graph.add(Node::new(Op::Exec(ExecOp::new(root, vec![arg.to_string()]))))
    }

    #[test]
    fn merge_of_one_is_identity() {
        let mut graph = Graph::new();
        let base = graph.source("rootfs");
        let only = exec(&mut graph, base, "a");
        assert_eq!(graph.merge_at_path(base, vec![only], "/"), only);
        assert_eq!(graph.merge_at_path(base, vec![], "/"), base);
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn merge_keeps_every_sibling_reachable() {
        let mut graph = Graph::new();
        let base = graph.source("rootfs");
        let siblings: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|a| exec(&mut graph, base, a))
            .collect();
        let merged = graph.merge_at_path(base, siblings.clone(), "/");

        let reachable = graph.reachable(merged);
        for s in &siblings {
            assert!(reachable.contains(s));
        }
        // Siblings only depend on the base, never on each other.
        for s in &siblings {
            assert_eq!(graph.node(*s).deps(), vec![base]);
        }
        assert_eq!(reachable.first(), Some(&base));
        assert_eq!(reachable.last(), Some(&merged));
    }

    #[test]
    fn reachable_skips_unreferenced_nodes() {
        let mut graph = Graph::new();
        let base = graph.source("rootfs");
        let used = exec(&mut graph, base, "used");
        let dead = exec(&mut graph, base, "dead");
        let reachable = graph.reachable(used);
        assert!(!reachable.contains(&dead));
        assert_eq!(reachable, vec![base, used]);
    }

    #[test]
    fn passthrough_depends_on_forced_and_output() {
        let mut graph = Graph::new();
        let base = graph.source("rootfs");
        let check = exec(&mut graph, base, "check");
        let guard = graph.add(Node::new(Op::Passthrough {
            output: base,
            forced: vec![check],
        }));
        assert_eq!(graph.node(guard).deps(), vec![check, base]);
    }

    #[test]
    fn json_dump_is_stable() {
        let build = || {
            let mut graph = Graph::new();
            let base = graph.source("rootfs");
            exec(&mut graph, base, "x");
            graph.to_json().unwrap()
        };
        let json = build();
        assert_eq!(json, build());
        assert!(json.contains("\"op\": \"exec\""));
    }
}
