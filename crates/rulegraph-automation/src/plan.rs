//! Plan compilation
//!
//! Turns a valid rule into stages with Kahn's algorithm. Stage 0 holds the
//! triggers; every other node sits one stage after its deepest dependency.
//! Decision fan-out is kept in a branch map so the executor can skip the
//! untaken side while still walking the static stage order.

use indexmap::IndexMap;
use rulegraph_core::{AutomationRule, Branch, NodeId, NodeKind, RuleId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::validate::{validate, ValidationError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    /// Compiling an invalid rule is a caller bug; the errors say why it is invalid
    #[error("rule {rule_id} is not valid ({} errors)", errors.len())]
    InvalidRule {
        rule_id: RuleId,
        errors: Vec<ValidationError>,
    },
}

pub type CompileResult<T> = Result<T, CompileError>;

/// Outgoing sides of one Decision node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchTargets {
    pub true_targets: Vec<NodeId>,
    pub false_targets: Vec<NodeId>,
}

impl BranchTargets {
    pub fn targets(&self, branch: Branch) -> &[NodeId] {
        match branch {
            Branch::True => &self.true_targets,
            Branch::False => &self.false_targets,
        }
    }
}

/// An incoming edge as seen from its target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub source: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<Branch>,
}

/// Executable form of a rule at one version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledPlan {
    pub rule_id: RuleId,
    pub version: u64,
    /// Node ids per stage, each stage in declaration order
    pub stages: Vec<Vec<NodeId>>,
    pub branches: IndexMap<NodeId, BranchTargets>,
    pub dependencies: IndexMap<NodeId, Vec<Dependency>>,
    pub triggers: Vec<NodeId>,
}

impl CompiledPlan {
    pub fn stage_of(&self, node_id: &str) -> Option<usize> {
        self.stages
            .iter()
            .position(|stage| stage.iter().any(|id| id.as_str() == node_id))
    }

    pub fn dependencies_of(&self, node_id: &str) -> &[Dependency] {
        self.dependencies
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn node_count(&self) -> usize {
        self.stages.iter().map(Vec::len).sum()
    }
}

/// Compile a rule, validating it first
pub fn compile(rule: &AutomationRule) -> CompileResult<CompiledPlan> {
    let validation = validate(rule);
    if !validation.ok {
        return Err(CompileError::InvalidRule {
            rule_id: rule.id.clone(),
            errors: validation.errors,
        });
    }

    let graph = &rule.graph;
    let index = graph.index();
    let ids: Vec<&str> = index.keys().copied().collect();

    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];
    let mut in_degree = vec![0usize; ids.len()];
    let mut dependencies: IndexMap<NodeId, Vec<Dependency>> = index
        .values()
        .map(|node| (node.id.clone(), Vec::new()))
        .collect();
    let mut branches: IndexMap<NodeId, BranchTargets> = index
        .values()
        .filter(|node| node.kind() == NodeKind::Decision)
        .map(|node| (node.id.clone(), BranchTargets::default()))
        .collect();

    for edge in &graph.edges {
        let (Some(s), Some(t)) = (
            index.get_index_of(edge.source.as_str()),
            index.get_index_of(edge.target.as_str()),
        ) else {
            continue;
        };
        successors[s].push(t);
        in_degree[t] += 1;

        let branch = edge.branch();
        if let Some(deps) = dependencies.get_mut(edge.target.as_str()) {
            deps.push(Dependency {
                source: edge.source.clone(),
                branch,
            });
        }
        if let (Some(targets), Some(branch)) = (branches.get_mut(edge.source.as_str()), branch) {
            let side = match branch {
                Branch::True => &mut targets.true_targets,
                Branch::False => &mut targets.false_targets,
            };
            if !side.contains(&edge.target) {
                side.push(edge.target.clone());
            }
        }
    }

    // Kahn's algorithm, one level at a time
    let mut stages = Vec::new();
    let mut current: Vec<usize> = (0..ids.len()).filter(|&i| in_degree[i] == 0).collect();
    while !current.is_empty() {
        let mut next = Vec::new();
        for &node in &current {
            for &succ in &successors[node] {
                in_degree[succ] -= 1;
                if in_degree[succ] == 0 {
                    next.push(succ);
                }
            }
        }
        next.sort_unstable();
        stages.push(
            current
                .iter()
                .map(|&i| NodeId::from(ids[i]))
                .collect::<Vec<_>>(),
        );
        current = next;
    }

    let triggers = graph
        .nodes_of_kind(NodeKind::Trigger)
        .map(|node| node.id.clone())
        .collect();

    let plan = CompiledPlan {
        rule_id: rule.id.clone(),
        version: rule.version(),
        stages,
        branches,
        dependencies,
        triggers,
    };
    debug!(
        rule_id = %rule.id,
        version = plan.version,
        stages = plan.stages.len(),
        "Compiled plan"
    );
    Ok(plan)
}
