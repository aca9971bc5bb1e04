//! Engine errors

use rulegraph_automation::{RuleError, TriggerError, ValidationError};
use rulegraph_config::StorageError;
use rulegraph_core::{RuleId, RunId};
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error("rule {rule_id} has an invalid trigger: {source}")]
    Trigger {
        rule_id: RuleId,
        #[source]
        source: TriggerError,
    },

    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    /// The run was dropped from a queue or its task went away before
    /// producing a record
    #[error("run {run_id} was dropped before it finished")]
    RunDropped { run_id: RunId },
}

impl EngineError {
    /// Validation errors carried by this error, if any
    pub fn validation_errors(&self) -> Option<&[ValidationError]> {
        match self {
            EngineError::Rule(RuleError::Invalid { errors, .. }) => Some(errors),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::Rule(RuleError::NotFound(_)))
    }
}
