//! Collaborator seams
//!
//! The executor never talks to devices, messaging or storage directly. Each
//! side effect goes through one of these traits so hosts can plug in real
//! drivers and tests can record calls.

use async_trait::async_trait;
use rulegraph_automation::{EvalContext, PredicateError, PredicateEvaluator};
use rulegraph_core::{ExecutionError, Predicate};
use rulegraph_state_store::DeviceStateStore;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("device {device_id} is unreachable")]
    Unreachable { device_id: String },

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("{0}")]
    Failed(String),
}

impl CommandError {
    /// Execution error for a device command
    pub fn into_action_error(self) -> ExecutionError {
        match self {
            CommandError::Unreachable { device_id } => ExecutionError::DeviceUnreachable { device_id },
            other => ExecutionError::ActionFailed {
                reason: other.to_string(),
            },
        }
    }

    /// Execution error for a notifier or data sink call
    pub fn into_collaborator_error(self, collaborator: &str) -> ExecutionError {
        ExecutionError::CollaboratorFailed {
            collaborator: collaborator.to_string(),
            reason: self.to_string(),
        }
    }
}

pub type CommandResult<T> = Result<T, CommandError>;

/// Sends parameter changes to devices
#[async_trait]
pub trait DeviceCommander: Send + Sync {
    /// `timeout` is advisory; the executor enforces it regardless
    async fn send_command(
        &self,
        device_id: &str,
        parameter: &str,
        value: &Value,
        timeout: Duration,
    ) -> CommandResult<()>;
}

/// Delivers notification messages
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, channel: &str, recipients: &[String], message: &str)
        -> CommandResult<()>;
}

/// Receives records written by Data nodes
#[async_trait]
pub trait DataSink: Send + Sync {
    async fn write(&self, sink: &str, record: Value) -> CommandResult<()>;
}

/// Evaluates Condition, Decision and Logic expressions. Must be side-effect free.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, predicate: &Predicate, ctx: &EvalContext) -> Result<bool, PredicateError>;
}

impl ExpressionEvaluator for PredicateEvaluator {
    fn evaluate(&self, predicate: &Predicate, ctx: &EvalContext) -> Result<bool, PredicateError> {
        PredicateEvaluator::evaluate(self, predicate, ctx)
    }
}

/// Read-only view of current device states, `{device_id: {parameter: value}}`
pub trait DeviceSnapshot: Send + Sync {
    fn snapshot(&self) -> Value;
}

impl DeviceSnapshot for DeviceStateStore {
    fn snapshot(&self) -> Value {
        DeviceStateStore::snapshot(self)
    }
}

/// Fixed snapshot, mostly for tests and dry runs
impl DeviceSnapshot for Value {
    fn snapshot(&self) -> Value {
        self.clone()
    }
}

/// Everything the executor calls out to
#[derive(Clone)]
pub struct Collaborators {
    pub commander: Arc<dyn DeviceCommander>,
    pub notifier: Arc<dyn Notifier>,
    pub data_sink: Arc<dyn DataSink>,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    pub devices: Arc<dyn DeviceSnapshot>,
}

impl Collaborators {
    /// Bundle with the built-in predicate evaluator
    pub fn new(
        commander: Arc<dyn DeviceCommander>,
        notifier: Arc<dyn Notifier>,
        data_sink: Arc<dyn DataSink>,
        devices: Arc<dyn DeviceSnapshot>,
    ) -> Self {
        Self {
            commander,
            notifier,
            data_sink,
            evaluator: Arc::new(PredicateEvaluator::default()),
            devices,
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }
}
