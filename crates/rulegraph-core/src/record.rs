//! Run requests, execution records and the execution error taxonomy

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::event::{EventData, RUN_FINISHED};
use crate::ids::{NodeId, RuleId, RunId};
use crate::node::NodeKind;

/// Request to run a rule once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub run_id: RunId,
    pub rule_id: RuleId,

    /// Trigger that fired; `None` fires every trigger (manual runs)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_node_id: Option<NodeId>,

    #[serde(default)]
    pub payload: Value,

    /// Originating event, serialized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Value>,

    pub requested_at: DateTime<Utc>,
}

impl RunRequest {
    pub fn new(rule_id: impl Into<RuleId>, payload: Value) -> Self {
        Self {
            run_id: RunId::generate(),
            rule_id: rule_id.into(),
            trigger_node_id: None,
            payload,
            event: None,
            requested_at: Utc::now(),
        }
    }

    pub fn from_trigger(mut self, trigger_node_id: impl Into<NodeId>) -> Self {
        self.trigger_node_id = Some(trigger_node_id.into());
        self
    }

    pub fn with_event(mut self, event: Value) -> Self {
        self.event = Some(event);
        self
    }

    pub fn at(mut self, requested_at: DateTime<Utc>) -> Self {
        self.requested_at = requested_at;
        self
    }
}

/// Per-node execution failures
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum ExecutionError {
    #[error("action timed out after {timeout_secs}s")]
    ActionTimeout { timeout_secs: u64 },

    #[error("action failed: {reason}")]
    ActionFailed { reason: String },

    #[error("condition evaluation failed: {reason}")]
    ConditionEvalError { reason: String },

    #[error("device unreachable: {device_id}")]
    DeviceUnreachable { device_id: String },

    #[error("{collaborator} failed: {reason}")]
    CollaboratorFailed { collaborator: String, reason: String },

    #[error("template error: {reason}")]
    Template { reason: String },

    #[error("gave up after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        last: Box<ExecutionError>,
    },
}

impl ExecutionError {
    /// Stable code used in metrics
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionError::ActionTimeout { .. } => "action_timeout",
            ExecutionError::ActionFailed { .. } => "action_failed",
            ExecutionError::ConditionEvalError { .. } => "condition_eval_error",
            ExecutionError::DeviceUnreachable { .. } => "device_unreachable",
            ExecutionError::CollaboratorFailed { .. } => "collaborator_failed",
            ExecutionError::Template { .. } => "template",
            ExecutionError::RetryExhausted { .. } => "retry_exhausted",
        }
    }

    /// Template errors are configuration mistakes and never improve on retry
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ExecutionError::Template { .. } | ExecutionError::RetryExhausted { .. }
        )
    }

    /// The innermost error, looking through `RetryExhausted`
    pub fn root(&self) -> &ExecutionError {
        match self {
            ExecutionError::RetryExhausted { last, .. } => last.root(),
            other => other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), ExecutionError::ActionTimeout { .. })
    }
}

/// Run-level failures
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RunError {
    #[error("run exceeded its {deadline_secs}s deadline")]
    RunTimeout { deadline_secs: u64 },

    #[error("run cancelled: {reason}")]
    RunCancelled { reason: String },

    #[error("internal error: {reason}")]
    RunFailed { reason: String },
}

impl RunError {
    pub fn code(&self) -> &'static str {
        match self {
            RunError::RunTimeout { .. } => "run_timeout",
            RunError::RunCancelled { .. } => "run_cancelled",
            RunError::RunFailed { .. } => "run_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Completed,
    Failed,
    Timeout,
    /// Not activated in this run
    Skipped,
    /// Passed through without executing
    Disabled,
    /// Pending or in flight when the run stopped
    Cancelled,
}

impl NodeStatus {
    /// Whether the node actually executed
    pub fn executed(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Timeout
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, NodeStatus::Failed | NodeStatus::Timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Timeout => "timeout",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// Outcome of one node within one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutcome {
    pub node_id: NodeId,
    pub kind: NodeKind,
    pub status: NodeStatus,

    #[serde(default)]
    pub attempts: u32,

    #[serde(default)]
    pub duration_ms: u64,

    /// Predicate outcome for Condition, Decision and Logic nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
}

impl NodeOutcome {
    pub fn new(node_id: NodeId, kind: NodeKind, status: NodeStatus) -> Self {
        Self {
            node_id,
            kind,
            status,
            attempts: 0,
            duration_ms: 0,
            result: None,
            error: None,
        }
    }
}

/// Audit entry for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: RunId,
    pub rule_id: RuleId,
    pub rule_version: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_node_id: Option<NodeId>,

    #[serde(default)]
    pub trigger_payload: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggering_event: Option<Value>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: RunStatus,

    #[serde(default)]
    pub nodes: Vec<NodeOutcome>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

impl ExecutionRecord {
    /// Record for a run that never reached its plan
    pub fn aborted(request: &RunRequest, rule_version: u64, error: RunError) -> Self {
        let now = Utc::now();
        let status = match error {
            RunError::RunTimeout { .. } => RunStatus::Timeout,
            RunError::RunCancelled { .. } => RunStatus::Cancelled,
            RunError::RunFailed { .. } => RunStatus::Failed,
        };
        Self {
            id: request.run_id.clone(),
            rule_id: request.rule_id.clone(),
            rule_version,
            trigger_node_id: request.trigger_node_id.clone(),
            trigger_payload: request.payload.clone(),
            triggering_event: request.event.clone(),
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            status,
            nodes: Vec::new(),
            error: Some(error),
        }
    }

    pub fn outcome(&self, node_id: &str) -> Option<&NodeOutcome> {
        self.nodes.iter().find(|n| n.node_id.as_str() == node_id)
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

impl EventData for ExecutionRecord {
    fn event_type() -> &'static str {
        RUN_FINISHED
    }
}

/// Half-open time window `[start, end)`; missing bounds are unbounded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| time >= s) && self.end.map_or(true, |e| time < e)
    }
}
