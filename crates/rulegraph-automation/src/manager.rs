//! Rule lifecycle and plan cache
//!
//! The RuleManager owns every rule document together with its compiled plan.
//! Plans are keyed by graph version: a saved graph edit bumps the version,
//! drops the cached plan and takes an active rule out of service until it
//! is validated and activated again.

use dashmap::DashMap;
use rulegraph_core::{AutomationRule, Graph, RuleId, RuleStatus};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::plan::{compile, CompileError, CompiledPlan};
use crate::validate::{validate, ValidationError, ValidationResult};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleError {
    #[error("rule not found: {0}")]
    NotFound(RuleId),

    #[error("rule {rule_id} failed validation")]
    Invalid {
        rule_id: RuleId,
        errors: Vec<ValidationError>,
    },
}

impl From<CompileError> for RuleError {
    fn from(err: CompileError) -> Self {
        match err {
            CompileError::InvalidRule { rule_id, errors } => RuleError::Invalid { rule_id, errors },
        }
    }
}

pub type RuleResult<T> = Result<T, RuleError>;

#[derive(Debug, Clone)]
struct RuleEntry {
    rule: AutomationRule,
    plan: Option<Arc<CompiledPlan>>,
}

impl RuleEntry {
    fn cached_plan(&self) -> Option<Arc<CompiledPlan>> {
        self.plan
            .as_ref()
            .filter(|plan| plan.version == self.rule.version())
            .cloned()
    }
}

/// What a graph edit did to the rule
#[derive(Debug, Clone)]
pub struct GraphUpdate {
    pub rule: AutomationRule,
    /// The rule was active and has been taken out of service
    pub was_active: bool,
}

/// Manages all rules
pub struct RuleManager {
    rules: DashMap<RuleId, RuleEntry>,
}

impl RuleManager {
    pub fn new() -> Self {
        Self {
            rules: DashMap::new(),
        }
    }

    /// Insert or replace a rule. Any cached plan is dropped.
    pub fn upsert(&self, rule: AutomationRule) -> Option<AutomationRule> {
        info!(rule_id = %rule.id, name = %rule.name, version = rule.version(), "Storing rule");
        self.rules
            .insert(rule.id.clone(), RuleEntry { rule, plan: None })
            .map(|previous| previous.rule)
    }

    pub fn get(&self, id: &str) -> Option<AutomationRule> {
        self.rules.get(id).map(|entry| entry.rule.clone())
    }

    /// All rules ordered by id
    pub fn all(&self) -> Vec<AutomationRule> {
        let mut rules: Vec<AutomationRule> =
            self.rules.iter().map(|entry| entry.rule.clone()).collect();
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        rules
    }

    pub fn active(&self) -> Vec<AutomationRule> {
        self.all().into_iter().filter(|r| r.is_active()).collect()
    }

    pub fn count(&self) -> usize {
        self.rules.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rules.contains_key(id)
    }

    /// Validate a stored rule
    pub fn validate(&self, id: &str) -> RuleResult<ValidationResult> {
        let entry = self
            .rules
            .get(id)
            .ok_or_else(|| RuleError::NotFound(id.into()))?;
        Ok(validate(&entry.rule))
    }

    /// Save a graph edit: bump the version, drop the plan, deactivate
    pub fn update_graph(&self, id: &str, graph: Graph) -> RuleResult<GraphUpdate> {
        let mut entry = self
            .rules
            .get_mut(id)
            .ok_or_else(|| RuleError::NotFound(id.into()))?;

        entry.rule.replace_graph(graph);
        entry.plan = None;

        let was_active = entry.rule.is_active();
        if was_active {
            entry.rule.status = RuleStatus::Inactive;
            warn!(rule_id = %id, "Graph edited while active, rule deactivated");
        }
        debug!(rule_id = %id, version = entry.rule.version(), "Graph updated");

        Ok(GraphUpdate {
            rule: entry.rule.clone(),
            was_active,
        })
    }

    /// Remove a rule and its plan
    pub fn remove(&self, id: &str) -> RuleResult<AutomationRule> {
        let (_, entry) = self
            .rules
            .remove(id)
            .ok_or_else(|| RuleError::NotFound(id.into()))?;
        info!(rule_id = %id, "Removed rule");
        Ok(entry.rule)
    }

    /// Validate, compile and mark active.
    ///
    /// A rule that fails validation is put in `error` status and the
    /// validation errors are returned.
    pub fn activate(&self, id: &str) -> RuleResult<(AutomationRule, Arc<CompiledPlan>)> {
        let mut entry = self
            .rules
            .get_mut(id)
            .ok_or_else(|| RuleError::NotFound(id.into()))?;

        let plan = match entry.cached_plan() {
            Some(plan) => plan,
            None => match compile(&entry.rule) {
                Ok(plan) => Arc::new(plan),
                Err(err) => {
                    entry.rule.status = RuleStatus::Error;
                    warn!(rule_id = %id, error = %err, "Activation refused");
                    return Err(err.into());
                }
            },
        };

        entry.plan = Some(plan.clone());
        entry.rule.status = RuleStatus::Active;
        info!(rule_id = %id, version = plan.version, "Activated rule");
        Ok((entry.rule.clone(), plan))
    }

    /// Mark a rule inactive. Returns false when it was not active.
    pub fn deactivate(&self, id: &str) -> RuleResult<bool> {
        let mut entry = self
            .rules
            .get_mut(id)
            .ok_or_else(|| RuleError::NotFound(id.into()))?;
        let was_active = entry.rule.is_active();
        entry.rule.status = RuleStatus::Inactive;
        if was_active {
            info!(rule_id = %id, "Deactivated rule");
        }
        Ok(was_active)
    }

    pub fn set_status(&self, id: &str, status: RuleStatus) -> RuleResult<()> {
        let mut entry = self
            .rules
            .get_mut(id)
            .ok_or_else(|| RuleError::NotFound(id.into()))?;
        entry.rule.status = status;
        Ok(())
    }

    /// Rule plus a plan for its current version, compiling on a cache miss
    pub fn plan(&self, id: &str) -> RuleResult<(AutomationRule, Arc<CompiledPlan>)> {
        let mut entry = self
            .rules
            .get_mut(id)
            .ok_or_else(|| RuleError::NotFound(id.into()))?;

        if let Some(plan) = entry.cached_plan() {
            return Ok((entry.rule.clone(), plan));
        }
        let plan = Arc::new(compile(&entry.rule)?);
        entry.plan = Some(plan.clone());
        Ok((entry.rule.clone(), plan))
    }

    /// Cached plan without compiling
    pub fn cached_plan(&self, id: &str) -> Option<Arc<CompiledPlan>> {
        self.rules.get(id).and_then(|entry| entry.cached_plan())
    }
}

impl Default for RuleManager {
    fn default() -> Self {
        Self::new()
    }
}
