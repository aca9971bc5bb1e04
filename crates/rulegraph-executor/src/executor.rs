//! Plan executor
//!
//! Walks a compiled plan stage by stage. Nodes within a stage run
//! concurrently; a stage starts only after the previous one has settled.
//! Whether a node runs is decided from its incoming edges:
//!
//! - it is blocked if any dependency failed or timed out, if a Condition
//!   dependency did not pass, or if a dependency was itself blocked; a
//!   blocked node is skipped and blocks its whole downstream subtree
//! - otherwise it runs if at least one incoming edge was taken: the source
//!   completed or a Decision source chose the edge's branch; disabled
//!   sources pass through on unlabeled edges
//!
//! Each stage sees the device state of the moment it starts, and a clock
//! advanced by the time the run has spent so far.
//!
//! Every outcome is written as soon as the node settles, so a run that is
//! cancelled or hits its deadline still records what already happened.

use chrono::{FixedOffset, Offset, Utc};
use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use rulegraph_automation::{CompiledPlan, EvalContext};
use rulegraph_core::{
    AutomationRule, Branch, ExecutionError, ExecutionRecord, Node, NodeConfig, NodeId, NodeKind,
    NodeOutcome, NodeStatus, RunError, RunRequest, RunStatus,
};
use rulegraph_template::TemplateEngine;
use serde_json::{Map, Value};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::collaborators::Collaborators;
use crate::retry::BackoffPolicy;

/// Engine-wide execution settings
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub backoff: BackoffPolicy,
    /// Used when a rule sets no deadline of its own
    pub default_run_deadline: Duration,
    /// Zone time-of-day predicates are evaluated in
    pub time_zone: FixedOffset,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            default_run_deadline: Duration::from_secs(3600),
            time_zone: Utc.fix(),
        }
    }
}

/// Result of one node body, before bookkeeping
struct NodeRun {
    result: Option<bool>,
    variable: Option<(String, Value)>,
}

impl NodeRun {
    fn done() -> Self {
        Self {
            result: None,
            variable: None,
        }
    }

    fn predicate(result: bool) -> Self {
        Self {
            result: Some(result),
            variable: None,
        }
    }
}

/// Runs rule plans
pub struct Executor {
    collaborators: Collaborators,
    settings: ExecutorSettings,
    templates: TemplateEngine,
}

impl Executor {
    pub fn new(collaborators: Collaborators, settings: ExecutorSettings) -> Self {
        Self {
            collaborators,
            settings,
            templates: TemplateEngine::new(),
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Execute one run. Never fails: every outcome, including internal
    /// errors, is reported in the returned record.
    pub async fn execute(
        &self,
        rule: &AutomationRule,
        plan: &CompiledPlan,
        request: &RunRequest,
        cancel: &CancelToken,
    ) -> ExecutionRecord {
        if plan.rule_id != rule.id || plan.version != rule.version() {
            warn!(
                rule_id = %rule.id,
                rule_version = rule.version(),
                plan_version = plan.version,
                "Plan does not match rule"
            );
            return ExecutionRecord::aborted(
                request,
                rule.version(),
                RunError::RunFailed {
                    reason: format!(
                        "plan for version {} used with rule version {}",
                        plan.version,
                        rule.version()
                    ),
                },
            );
        }

        let started_at = Utc::now();
        let clock = Instant::now();
        let deadline = rule
            .policy
            .run_deadline_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.settings.default_run_deadline);

        info!(
            rule_id = %rule.id,
            run_id = %request.run_id,
            trigger = ?request.trigger_node_id,
            "Run started"
        );

        let outcomes: DashMap<NodeId, NodeOutcome> = DashMap::new();
        let blocked: DashSet<NodeId> = DashSet::new();
        let stopped = tokio::select! {
            biased;
            reason = cancel.cancelled() => Some(RunError::RunCancelled { reason }),
            _ = tokio::time::sleep(deadline) => Some(RunError::RunTimeout {
                deadline_secs: deadline.as_secs(),
            }),
            _ = self.walk(rule, plan, request, &outcomes, &blocked) => None,
        };

        let nodes: Vec<NodeOutcome> = plan
            .stages
            .iter()
            .flatten()
            .map(|id| {
                outcomes
                    .remove(id)
                    .map(|(_, outcome)| outcome)
                    .unwrap_or_else(|| {
                        let kind = rule
                            .graph
                            .node(id.as_str())
                            .map(Node::kind)
                            .unwrap_or(NodeKind::Action);
                        NodeOutcome::new(id.clone(), kind, NodeStatus::Cancelled)
                    })
            })
            .collect();

        let status = match &stopped {
            Some(RunError::RunTimeout { .. }) => RunStatus::Timeout,
            Some(RunError::RunCancelled { .. }) => RunStatus::Cancelled,
            Some(RunError::RunFailed { .. }) => RunStatus::Failed,
            None if nodes.iter().any(|n| n.status.is_failure()) => RunStatus::Failed,
            None => RunStatus::Completed,
        };

        let record = ExecutionRecord {
            id: request.run_id.clone(),
            rule_id: rule.id.clone(),
            rule_version: rule.version(),
            trigger_node_id: request.trigger_node_id.clone(),
            trigger_payload: request.payload.clone(),
            triggering_event: request.event.clone(),
            started_at,
            finished_at: Utc::now(),
            duration_ms: clock.elapsed().as_millis() as u64,
            status,
            nodes,
            error: stopped,
        };

        info!(
            rule_id = %rule.id,
            run_id = %record.id,
            status = record.status.as_str(),
            duration_ms = record.duration_ms,
            "Run finished"
        );
        record
    }

    async fn walk(
        &self,
        rule: &AutomationRule,
        plan: &CompiledPlan,
        request: &RunRequest,
        outcomes: &DashMap<NodeId, NodeOutcome>,
        blocked: &DashSet<NodeId>,
    ) {
        let index = rule.graph.index();
        let started = tokio::time::Instant::now();
        let mut variables = Map::new();

        for (stage_no, stage) in plan.stages.iter().enumerate() {
            let elapsed = chrono::Duration::from_std(started.elapsed())
                .unwrap_or_else(|_| chrono::Duration::zero());
            let ctx = EvalContext {
                devices: self.collaborators.devices.snapshot(),
                variables: variables.clone(),
                trigger: request.payload.clone(),
                now: (request.requested_at + elapsed).with_timezone(&self.settings.time_zone),
            };
            debug!(rule_id = %rule.id, stage = stage_no, nodes = stage.len(), "Running stage");

            let runs = stage
                .iter()
                .filter_map(|id| index.get(id.as_str()).copied())
                .map(|node| self.settle(rule, plan, request, node, &ctx, outcomes, blocked));

            for variable in join_all(runs).await.into_iter().flatten() {
                variables.insert(variable.0, variable.1);
            }
        }
    }

    /// Decide, run and record one node; returns a Logic variable to merge
    #[allow(clippy::too_many_arguments)]
    async fn settle(
        &self,
        rule: &AutomationRule,
        plan: &CompiledPlan,
        request: &RunRequest,
        node: &Node,
        ctx: &EvalContext,
        outcomes: &DashMap<NodeId, NodeOutcome>,
        blocked: &DashSet<NodeId>,
    ) -> Option<(String, Value)> {
        let kind = node.kind();
        let record = |status: NodeStatus| {
            outcomes.insert(node.id.clone(), NodeOutcome::new(node.id.clone(), kind, status));
        };

        if kind == NodeKind::Trigger {
            let fired = request
                .trigger_node_id
                .as_ref()
                .map_or(true, |requested| requested == &node.id);
            record(match (fired, node.enabled) {
                (false, _) => NodeStatus::Skipped,
                (true, false) => NodeStatus::Disabled,
                (true, true) => NodeStatus::Completed,
            });
            return None;
        }

        match self.activation(plan, node, outcomes, blocked) {
            Activation::Blocked => {
                debug!(node_id = %node.id, "Blocked upstream, skipped");
                blocked.insert(node.id.clone());
                record(NodeStatus::Skipped);
                return None;
            }
            Activation::Pruned => {
                debug!(node_id = %node.id, "Skipped");
                record(NodeStatus::Skipped);
                return None;
            }
            Activation::Ready if !node.enabled => {
                debug!(node_id = %node.id, "Disabled, passing through");
                record(NodeStatus::Disabled);
                return None;
            }
            Activation::Ready => {}
        }

        let started = Instant::now();
        let (result, attempts) = self.run_with_retry(rule, node, ctx).await;
        let mut outcome = NodeOutcome::new(node.id.clone(), kind, NodeStatus::Completed);
        outcome.attempts = attempts;
        outcome.duration_ms = started.elapsed().as_millis() as u64;

        let variable = match result {
            Ok(run) => {
                outcome.result = run.result;
                debug!(node_id = %node.id, kind = %kind, result = ?run.result, "Node completed");
                run.variable
            }
            Err(err) => {
                outcome.status = if err.is_timeout() {
                    NodeStatus::Timeout
                } else {
                    NodeStatus::Failed
                };
                warn!(
                    rule_id = %rule.id,
                    node_id = %node.id,
                    error = %err,
                    attempts,
                    "Node failed"
                );
                outcome.error = Some(err);
                None
            }
        };

        outcomes.insert(node.id.clone(), outcome);
        variable
    }

    fn activation(
        &self,
        plan: &CompiledPlan,
        node: &Node,
        outcomes: &DashMap<NodeId, NodeOutcome>,
        blocked: &DashSet<NodeId>,
    ) -> Activation {
        let mut taken = false;
        for dependency in plan.dependencies_of(node.id.as_str()) {
            if blocked.contains(&dependency.source) {
                return Activation::Blocked;
            }
            let Some(source) = outcomes.get(&dependency.source) else {
                continue;
            };
            if source.status.is_failure() {
                return Activation::Blocked;
            }
            taken |= match source.status {
                NodeStatus::Completed => match (source.kind, dependency.branch) {
                    (NodeKind::Decision, Some(branch)) => {
                        source.result.map(Branch::from_outcome) == Some(branch)
                    }
                    (NodeKind::Condition, _) if source.result != Some(true) => {
                        return Activation::Blocked;
                    }
                    _ => true,
                },
                NodeStatus::Disabled => dependency.branch.is_none(),
                _ => false,
            };
        }
        if taken {
            Activation::Ready
        } else {
            Activation::Pruned
        }
    }

    /// Attempt a node up to `retry_count + 1` times
    async fn run_with_retry(
        &self,
        rule: &AutomationRule,
        node: &Node,
        ctx: &EvalContext,
    ) -> (Result<NodeRun, ExecutionError>, u32) {
        let retries = rule.policy.retry_count;
        let max_attempts = retries.saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.run_node(rule, node, ctx).await {
                Ok(run) => return (Ok(run), attempt),
                Err(err) => err,
            };

            if !err.is_retryable() {
                return (Err(err), attempt);
            }
            if attempt >= max_attempts {
                let err = if retries > 0 {
                    ExecutionError::RetryExhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    }
                } else {
                    err
                };
                return (Err(err), attempt);
            }

            let delay = self.settings.backoff.delay(attempt);
            warn!(
                rule_id = %rule.id,
                node_id = %node.id,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying node"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn run_node(
        &self,
        rule: &AutomationRule,
        node: &Node,
        ctx: &EvalContext,
    ) -> Result<NodeRun, ExecutionError> {
        match &node.config {
            NodeConfig::Trigger(_) => Ok(NodeRun::done()),

            NodeConfig::Condition(config) => self
                .evaluate(&config.predicate, ctx)
                .map(NodeRun::predicate),

            NodeConfig::Decision(config) => self
                .evaluate(&config.predicate, ctx)
                .map(NodeRun::predicate),

            NodeConfig::Logic(config) => {
                let result = self.evaluate(&config.expression, ctx)?;
                Ok(NodeRun {
                    result: Some(result),
                    variable: Some((config.variable.clone(), Value::Bool(result))),
                })
            }

            NodeConfig::Action(config) => {
                let value = self.render_value(&config.value, ctx)?;
                let timeout_secs = rule.policy.timeout_seconds;
                let timeout = Duration::from_secs(timeout_secs);
                debug!(
                    node_id = %node.id,
                    device_id = %config.device_id,
                    parameter = %config.parameter,
                    %value,
                    "Sending command"
                );
                let send = self.collaborators.commander.send_command(
                    &config.device_id,
                    &config.parameter,
                    &value,
                    timeout,
                );
                with_timeout(timeout, timeout_secs, send)
                    .await?
                    .map_err(|e| e.into_action_error())?;
                Ok(NodeRun::done())
            }

            NodeConfig::Timer(config) => {
                let delay = config.duration();
                debug!(node_id = %node.id, delay_ms = delay.as_millis() as u64, "Timer started");
                tokio::time::sleep(delay).await;
                Ok(NodeRun::done())
            }

            NodeConfig::Notification(config) => {
                let message = self
                    .templates
                    .render(&config.message, &ctx.to_template_context())
                    .map_err(template_error)?;
                self.collaborators
                    .notifier
                    .notify(&config.channel, &config.recipients, &message)
                    .await
                    .map_err(|e| e.into_collaborator_error("notifier"))?;
                Ok(NodeRun::done())
            }

            NodeConfig::Data(config) => {
                let record = self.render_value(&Value::Object(config.fields.clone()), ctx)?;
                self.collaborators
                    .data_sink
                    .write(&config.sink, record)
                    .await
                    .map_err(|e| e.into_collaborator_error("data_sink"))?;
                Ok(NodeRun::done())
            }
        }
    }

    fn evaluate(
        &self,
        predicate: &rulegraph_core::Predicate,
        ctx: &EvalContext,
    ) -> Result<bool, ExecutionError> {
        self.collaborators
            .evaluator
            .evaluate(predicate, ctx)
            .map_err(|e| ExecutionError::ConditionEvalError {
                reason: e.to_string(),
            })
    }

    fn render_value(&self, value: &Value, ctx: &EvalContext) -> Result<Value, ExecutionError> {
        self.templates
            .render_value(value, &ctx.to_template_context())
            .map_err(template_error)
    }
}

enum Activation {
    Ready,
    /// No incoming edge was taken
    Pruned,
    /// Behind a failed node or a Condition that did not pass
    Blocked,
}

fn template_error(err: rulegraph_template::TemplateError) -> ExecutionError {
    ExecutionError::Template {
        reason: err.to_string(),
    }
}

async fn with_timeout<F: Future>(
    timeout: Duration,
    timeout_secs: u64,
    future: F,
) -> Result<F::Output, ExecutionError> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| ExecutionError::ActionTimeout { timeout_secs })
}
