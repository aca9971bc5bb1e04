//! Execution history and metrics
//!
//! Stores [`ExecutionRecord`](rulegraph_core::ExecutionRecord)s per rule
//! and computes [`Metrics`] from them on read. Records past the retention
//! limit are evicted into running totals, so aggregates always cover every
//! appended run.

mod history;
mod metrics;

pub use history::{HistoryStore, SharedHistoryStore, DEFAULT_MAX_RECORDS_PER_RULE};
pub use metrics::{Metrics, Tally};
