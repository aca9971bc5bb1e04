//! Structural validation of rule graphs
//!
//! Checks run in a fixed order and every error is collected:
//!
//! 1. required kinds (trigger, action) and duplicate ids
//! 2. edges pointing at unknown nodes
//! 3. orphans and reachability from the trigger set (breadth-first)
//! 4. cycles (depth-first with white/grey/black colouring on an explicit stack)
//! 5. branch labelling and trigger placement
//!
//! Validation never mutates the rule and never fails; a rule is valid when
//! the returned error list is empty.

use indexmap::{IndexMap, IndexSet};
use rulegraph_core::{AutomationRule, Graph, NodeKind};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, trace};

/// One structural problem in a rule graph
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("rule has no trigger node")]
    MissingTrigger,

    #[error("rule has no action node")]
    MissingAction,

    #[error("node id '{node_id}' is used more than once")]
    DuplicateNodeId { node_id: String },

    #[error("edge {edge} references unknown node '{node_id}'")]
    DanglingEdgeReference { edge: String, node_id: String },

    #[error("node '{node_id}' has no incoming edge")]
    OrphanNode { node_id: String },

    #[error("node '{node_id}' is not reachable from any trigger")]
    UnreachableNode { node_id: String },

    #[error("cycle detected at node '{node_id}'")]
    CycleDetected { node_id: String },

    #[error("trigger '{node_id}' has an incoming edge")]
    TriggerHasIncomingEdge { node_id: String },

    #[error("decision '{node_id}' has an unlabeled edge to '{target}'")]
    UnlabeledDecisionBranch { node_id: String, target: String },

    #[error("node '{node_id}' is not a decision but labels its edge to '{target}' as a branch")]
    BranchEdgeFromNonDecision { node_id: String, target: String },
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::MissingTrigger => "missing_trigger",
            ValidationError::MissingAction => "missing_action",
            ValidationError::DuplicateNodeId { .. } => "duplicate_node_id",
            ValidationError::DanglingEdgeReference { .. } => "dangling_edge_reference",
            ValidationError::OrphanNode { .. } => "orphan_node",
            ValidationError::UnreachableNode { .. } => "unreachable_node",
            ValidationError::CycleDetected { .. } => "cycle_detected",
            ValidationError::TriggerHasIncomingEdge { .. } => "trigger_has_incoming_edge",
            ValidationError::UnlabeledDecisionBranch { .. } => "unlabeled_decision_branch",
            ValidationError::BranchEdgeFromNonDecision { .. } => "branch_edge_from_non_decision",
        }
    }

    /// Node the error points at, when there is one
    pub fn node_id(&self) -> Option<&str> {
        match self {
            ValidationError::MissingTrigger | ValidationError::MissingAction => None,
            ValidationError::DuplicateNodeId { node_id }
            | ValidationError::DanglingEdgeReference { node_id, .. }
            | ValidationError::OrphanNode { node_id }
            | ValidationError::UnreachableNode { node_id }
            | ValidationError::CycleDetected { node_id }
            | ValidationError::TriggerHasIncomingEdge { node_id }
            | ValidationError::UnlabeledDecisionBranch { node_id, .. }
            | ValidationError::BranchEdgeFromNonDecision { node_id, .. } => Some(node_id),
        }
    }
}

/// Outcome of validating one rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub ok: bool,
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    pub fn from_errors(errors: Vec<ValidationError>) -> Self {
        Self {
            ok: errors.is_empty(),
            errors,
        }
    }

    pub fn has(&self, code: &str) -> bool {
        self.errors.iter().any(|e| e.code() == code)
    }
}

/// Validate a rule's graph
pub fn validate(rule: &AutomationRule) -> ValidationResult {
    let result = validate_graph(&rule.graph);
    debug!(
        rule_id = %rule.id,
        ok = result.ok,
        errors = result.errors.len(),
        "Validated rule"
    );
    result
}

/// Validate a bare graph
pub fn validate_graph(graph: &Graph) -> ValidationResult {
    let mut errors = Vec::new();
    let index = graph.index();

    check_required_kinds(graph, &mut errors);
    check_duplicates(graph, &mut errors);
    check_dangling_edges(graph, &index, &mut errors);

    // Adjacency over valid edges only; ids are positions in `index`
    let ids: Vec<&str> = index.keys().copied().collect();
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];
    let mut in_degree = vec![0usize; ids.len()];
    for edge in &graph.edges {
        if let (Some(s), Some(t)) = (
            index.get_index_of(edge.source.as_str()),
            index.get_index_of(edge.target.as_str()),
        ) {
            successors[s].push(t);
            in_degree[t] += 1;
        }
    }

    check_reachability(&index, &successors, &in_degree, &mut errors);
    check_cycles(&ids, &successors, &mut errors);
    check_edge_labels(graph, &index, &in_degree, &mut errors);

    ValidationResult::from_errors(errors)
}

fn check_required_kinds(graph: &Graph, errors: &mut Vec<ValidationError>) {
    if graph.nodes_of_kind(NodeKind::Trigger).next().is_none() {
        errors.push(ValidationError::MissingTrigger);
    }
    if graph.nodes_of_kind(NodeKind::Action).next().is_none() {
        errors.push(ValidationError::MissingAction);
    }
}

fn check_duplicates(graph: &Graph, errors: &mut Vec<ValidationError>) {
    let mut seen = IndexSet::new();
    let mut reported = IndexSet::new();
    for node in &graph.nodes {
        let id = node.id.as_str();
        if !seen.insert(id) && reported.insert(id) {
            errors.push(ValidationError::DuplicateNodeId {
                node_id: id.to_string(),
            });
        }
    }
}

fn check_dangling_edges(
    graph: &Graph,
    index: &IndexMap<&str, &rulegraph_core::Node>,
    errors: &mut Vec<ValidationError>,
) {
    for edge in &graph.edges {
        for endpoint in [&edge.source, &edge.target] {
            if !index.contains_key(endpoint.as_str()) {
                errors.push(ValidationError::DanglingEdgeReference {
                    edge: edge.describe(),
                    node_id: endpoint.to_string(),
                });
            }
        }
    }
}

fn check_reachability(
    index: &IndexMap<&str, &rulegraph_core::Node>,
    successors: &[Vec<usize>],
    in_degree: &[usize],
    errors: &mut Vec<ValidationError>,
) {
    let mut reached = vec![false; index.len()];
    let mut queue = VecDeque::new();
    for (i, node) in index.values().enumerate() {
        if node.kind() == NodeKind::Trigger {
            reached[i] = true;
            queue.push_back(i);
        }
    }

    while let Some(current) = queue.pop_front() {
        for &next in &successors[current] {
            if !reached[next] {
                reached[next] = true;
                queue.push_back(next);
            }
        }
    }

    for (i, (id, node)) in index.iter().enumerate() {
        if node.kind() == NodeKind::Trigger {
            continue;
        }
        if in_degree[i] == 0 {
            errors.push(ValidationError::OrphanNode {
                node_id: id.to_string(),
            });
        } else if !reached[i] {
            errors.push(ValidationError::UnreachableNode {
                node_id: id.to_string(),
            });
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Colour {
    White,
    Grey,
    Black,
}

/// Iterative DFS; an edge into a grey node closes a cycle
fn check_cycles(ids: &[&str], successors: &[Vec<usize>], errors: &mut Vec<ValidationError>) {
    let mut colour = vec![Colour::White; ids.len()];
    let mut reported = vec![false; ids.len()];
    // (node, index of the next successor to visit)
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for root in 0..ids.len() {
        if colour[root] != Colour::White {
            continue;
        }
        colour[root] = Colour::Grey;
        stack.push((root, 0));

        while let Some(frame) = stack.last_mut() {
            let (node, cursor) = *frame;
            if let Some(&next) = successors[node].get(cursor) {
                frame.1 += 1;
                match colour[next] {
                    Colour::White => {
                        colour[next] = Colour::Grey;
                        stack.push((next, 0));
                    }
                    Colour::Grey => {
                        if !reported[next] {
                            reported[next] = true;
                            trace!(node_id = ids[next], "Back edge found");
                            errors.push(ValidationError::CycleDetected {
                                node_id: ids[next].to_string(),
                            });
                        }
                    }
                    Colour::Black => {}
                }
            } else {
                colour[node] = Colour::Black;
                stack.pop();
            }
        }
    }
}

fn check_edge_labels(
    graph: &Graph,
    index: &IndexMap<&str, &rulegraph_core::Node>,
    in_degree: &[usize],
    errors: &mut Vec<ValidationError>,
) {
    for (i, (id, node)) in index.iter().enumerate() {
        if node.kind() == NodeKind::Trigger && in_degree[i] > 0 {
            errors.push(ValidationError::TriggerHasIncomingEdge {
                node_id: id.to_string(),
            });
        }
    }

    for edge in &graph.edges {
        let Some(source) = index.get(edge.source.as_str()) else {
            continue;
        };
        if !index.contains_key(edge.target.as_str()) {
            continue;
        }
        let is_decision = source.kind() == NodeKind::Decision;
        match (is_decision, edge.branch()) {
            (true, None) => errors.push(ValidationError::UnlabeledDecisionBranch {
                node_id: edge.source.to_string(),
                target: edge.target.to_string(),
            }),
            (false, Some(_)) => errors.push(ValidationError::BranchEdgeFromNonDecision {
                node_id: edge.source.to_string(),
                target: edge.target.to_string(),
            }),
            _ => {}
        }
    }
}
