//! Graph storage
//!
//! Nodes and edges live in flat vectors, which is also the persisted JSON
//! shape. Lookups go through [`Graph::index`] and the adjacency helpers.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::ids::NodeId;
use crate::node::{Node, NodeKind};

/// Edge kind; `true`/`false` mark Decision branches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    #[default]
    Default,
    True,
    False,
}

/// Which side of a Decision an edge belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    True,
    False,
}

impl Branch {
    pub fn from_outcome(outcome: bool) -> Self {
        if outcome {
            Branch::True
        } else {
            Branch::False
        }
    }
}

/// Directed edge between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub source: NodeId,
    pub target: NodeId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,

    #[serde(default)]
    pub kind: EdgeKind,
}

impl Edge {
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            id: None,
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
            kind: EdgeKind::Default,
        }
    }

    /// Edge on the true side of a Decision
    pub fn when_true(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            kind: EdgeKind::True,
            ..Self::new(source, target)
        }
    }

    /// Edge on the false side of a Decision
    pub fn when_false(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            kind: EdgeKind::False,
            ..Self::new(source, target)
        }
    }

    pub fn with_source_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }

    /// Branch label from the edge kind, falling back to a `"true"`/`"false"`
    /// source handle for edges authored with handles only.
    pub fn branch(&self) -> Option<Branch> {
        match self.kind {
            EdgeKind::True => Some(Branch::True),
            EdgeKind::False => Some(Branch::False),
            EdgeKind::Default => match self.source_handle.as_deref() {
                Some(h) if h.eq_ignore_ascii_case("true") => Some(Branch::True),
                Some(h) if h.eq_ignore_ascii_case("false") => Some(Branch::False),
                _ => None,
            },
        }
    }

    /// Short `source -> target` description for logs and errors
    pub fn describe(&self) -> String {
        match &self.id {
            Some(id) => format!("{} ({} -> {})", id, self.source, self.target),
            None => format!("{} -> {}", self.source, self.target),
        }
    }
}

/// Nodes plus edges
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Graph {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    /// Id → node, in declaration order. Later duplicates are ignored.
    pub fn index(&self) -> IndexMap<&str, &Node> {
        let mut index = IndexMap::with_capacity(self.nodes.len());
        for node in &self.nodes {
            index.entry(node.id.as_str()).or_insert(node);
        }
        index
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id.as_str() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.node(id).is_some()
    }

    pub fn nodes_of_kind(&self, kind: NodeKind) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(move |n| n.kind() == kind)
    }

    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.source.as_str() == id)
    }

    pub fn incoming<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.target.as_str() == id)
    }

    /// Adjacency lists keyed by source id, in edge declaration order.
    /// Edges whose endpoints are unknown are left out.
    pub fn adjacency(&self) -> IndexMap<&str, Vec<&Edge>> {
        let index = self.index();
        let mut adjacency: IndexMap<&str, Vec<&Edge>> =
            index.keys().map(|id| (*id, Vec::new())).collect();
        for edge in &self.edges {
            if index.contains_key(edge.target.as_str()) {
                if let Some(out) = adjacency.get_mut(edge.source.as_str()) {
                    out.push(edge);
                }
            }
        }
        adjacency
    }
}
