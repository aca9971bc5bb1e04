//! Aggregated run statistics

use chrono::{DateTime, Utc};
use rulegraph_core::{ExecutionRecord, RunStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Statistics over a set of execution records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub total_executions: u64,

    /// Runs that completed
    pub success_count: u64,

    /// Runs that failed or timed out
    pub failure_count: u64,

    pub timeout_count: u64,
    pub cancelled_count: u64,

    pub avg_duration_ms: f64,

    /// `success_count / total_executions`, 0 when nothing ran
    pub success_rate: f64,

    /// How often each node kind actually executed
    pub node_usage_counts: BTreeMap<String, u64>,

    /// Error codes from nodes and runs
    pub error_frequency: BTreeMap<String, u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Metrics {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ExecutionRecord>) -> Self {
        let mut tally = Tally::default();
        for record in records {
            tally.add(record);
        }
        tally.finish()
    }
}

/// Running totals that can absorb records one at a time and be merged
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tally {
    counts: Metrics,
    total_duration_ms: u128,
}

impl Tally {
    pub fn add(&mut self, record: &ExecutionRecord) {
        let counts = &mut self.counts;
        counts.total_executions += 1;
        self.total_duration_ms += u128::from(record.duration_ms);

        match record.status {
            RunStatus::Completed => counts.success_count += 1,
            RunStatus::Failed => counts.failure_count += 1,
            RunStatus::Timeout => {
                counts.failure_count += 1;
                counts.timeout_count += 1;
            }
            RunStatus::Cancelled => counts.cancelled_count += 1,
        }

        if let Some(error) = &record.error {
            *counts
                .error_frequency
                .entry(error.code().to_string())
                .or_default() += 1;
        }

        for node in &record.nodes {
            if node.status.executed() {
                *counts
                    .node_usage_counts
                    .entry(node.kind.as_str().to_string())
                    .or_default() += 1;
            }
            if let Some(error) = &node.error {
                *counts
                    .error_frequency
                    .entry(error.code().to_string())
                    .or_default() += 1;
            }
        }

        counts.last_run_at = counts.last_run_at.max(Some(record.started_at));
    }

    pub fn merge(&mut self, other: &Tally) {
        let counts = &mut self.counts;
        let theirs = &other.counts;
        counts.total_executions += theirs.total_executions;
        counts.success_count += theirs.success_count;
        counts.failure_count += theirs.failure_count;
        counts.timeout_count += theirs.timeout_count;
        counts.cancelled_count += theirs.cancelled_count;
        for (kind, n) in &theirs.node_usage_counts {
            *counts.node_usage_counts.entry(kind.clone()).or_default() += n;
        }
        for (code, n) in &theirs.error_frequency {
            *counts.error_frequency.entry(code.clone()).or_default() += n;
        }
        counts.last_run_at = counts.last_run_at.max(theirs.last_run_at);
        self.total_duration_ms += other.total_duration_ms;
    }

    pub fn finish(self) -> Metrics {
        let mut metrics = self.counts;
        if metrics.total_executions > 0 {
            let total = metrics.total_executions as f64;
            metrics.avg_duration_ms = self.total_duration_ms as f64 / total;
            metrics.success_rate = metrics.success_count as f64 / total;
        }
        metrics
    }
}
