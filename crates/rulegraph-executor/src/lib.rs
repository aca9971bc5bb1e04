//! Rule executor
//!
//! Runs a [`CompiledPlan`](rulegraph_automation::CompiledPlan) for one
//! [`RunRequest`](rulegraph_core::RunRequest) and produces an
//! [`ExecutionRecord`](rulegraph_core::ExecutionRecord).
//!
//! Side effects go through the collaborator traits in [`collaborators`].
//! Per-node failures are retried with [`BackoffPolicy`]; a run can be
//! stopped early through its [`CancelToken`] or by its deadline.

pub mod cancel;
pub mod collaborators;
pub mod executor;
pub mod retry;

pub use cancel::CancelToken;
pub use collaborators::{
    Collaborators, CommandError, CommandResult, DataSink, DeviceCommander, DeviceSnapshot,
    ExpressionEvaluator, Notifier,
};
pub use executor::{Executor, ExecutorSettings};
pub use retry::{BackoffPolicy, BackoffStrategy};
