//! Per-rule execution history

use dashmap::DashMap;
use rulegraph_core::{ExecutionRecord, RuleId, TimeRange};
use std::sync::Arc;
use tracing::{debug, info};

use crate::metrics::{Metrics, Tally};

pub const DEFAULT_MAX_RECORDS_PER_RULE: usize = 1000;

/// In-memory execution history.
///
/// `append` is the only way records enter the store. Each rule keeps at
/// most `max_records_per_rule` records; the oldest by start time are
/// evicted first, but their totals stay in the rule's metrics.
pub struct HistoryStore {
    records: DashMap<RuleId, RuleHistory>,
    max_records_per_rule: usize,
}

#[derive(Default)]
struct RuleHistory {
    /// Ordered by start time
    records: Vec<ExecutionRecord>,
    /// Totals of records no longer retained
    evicted: Tally,
}

impl RuleHistory {
    fn tally(&self) -> Tally {
        let mut tally = self.evicted.clone();
        for record in &self.records {
            tally.add(record);
        }
        tally
    }
}

impl HistoryStore {
    pub fn new(max_records_per_rule: usize) -> Self {
        Self {
            records: DashMap::new(),
            max_records_per_rule: max_records_per_rule.max(1),
        }
    }

    pub fn append(&self, record: ExecutionRecord) {
        let mut entry = self.records.entry(record.rule_id.clone()).or_default();
        debug!(
            rule_id = %record.rule_id,
            run_id = %record.id,
            status = record.status.as_str(),
            "Recording run"
        );

        // Runs finish out of order; keep the list ordered by start time
        let history = entry.value_mut();
        let at = history
            .records
            .partition_point(|r| r.started_at <= record.started_at);
        history.records.insert(at, record);

        if history.records.len() > self.max_records_per_rule {
            let excess = history.records.len() - self.max_records_per_rule;
            for evicted in history.records.drain(..excess) {
                history.evicted.add(&evicted);
            }
        }
    }

    /// Records of one rule started within `range`, oldest first
    pub fn query(&self, rule_id: &str, range: &TimeRange) -> Vec<ExecutionRecord> {
        self.records
            .get(rule_id)
            .map(|history| {
                history
                    .records
                    .iter()
                    .filter(|r| range.contains(r.started_at))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Most recent `limit` records of one rule, newest first
    pub fn recent(&self, rule_id: &str, limit: usize) -> Vec<ExecutionRecord> {
        self.records
            .get(rule_id)
            .map(|history| history.records.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Metrics for one rule, or across every rule when `rule_id` is `None`.
    /// Evicted records still count.
    pub fn aggregate(&self, rule_id: Option<&str>) -> Metrics {
        match rule_id {
            Some(id) => self
                .records
                .get(id)
                .map(|history| history.tally().finish())
                .unwrap_or_default(),
            None => {
                let mut total = Tally::default();
                for entry in self.records.iter() {
                    total.merge(&entry.value().tally());
                }
                total.finish()
            }
        }
    }

    /// Remove and return every retained record of a rule, dropping its
    /// totals as well
    pub fn archive(&self, rule_id: &str) -> Vec<ExecutionRecord> {
        let removed = self
            .records
            .remove(rule_id)
            .map(|(_, history)| history.records)
            .unwrap_or_default();
        info!(rule_id, records = removed.len(), "Archived history");
        removed
    }

    pub fn count(&self, rule_id: &str) -> usize {
        self.records
            .get(rule_id)
            .map(|history| history.records.len())
            .unwrap_or(0)
    }

    pub fn rule_ids(&self) -> Vec<RuleId> {
        let mut ids: Vec<RuleId> = self.records.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORDS_PER_RULE)
    }
}

pub type SharedHistoryStore = Arc<HistoryStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use rulegraph_core::{
        ExecutionError, NodeKind, NodeOutcome, NodeStatus, RunError, RunRequest, RunStatus,
    };
    use serde_json::json;

    fn record(rule: &str, minute: u32, status: RunStatus, duration_ms: u64) -> ExecutionRecord {
        let started = Utc.with_ymd_and_hms(2024, 3, 1, 8, minute, 0).unwrap();
        let request = RunRequest::new(rule, json!({})).at(started);
        let mut record = ExecutionRecord::aborted(
            &request,
            1,
            RunError::RunFailed {
                reason: String::new(),
            },
        );
        record.started_at = started;
        record.finished_at = started + Duration::milliseconds(duration_ms as i64);
        record.duration_ms = duration_ms;
        record.status = status;
        record.error = None;
        record
    }

    fn with_node(
        mut record: ExecutionRecord,
        kind: NodeKind,
        status: NodeStatus,
    ) -> ExecutionRecord {
        let id = format!("n{}", record.nodes.len());
        record.nodes.push(NodeOutcome::new(id.into(), kind, status));
        record
    }

    #[test]
    fn test_query_filters_by_range_and_sorts() {
        let store = HistoryStore::default();
        store.append(record("r", 30, RunStatus::Completed, 10));
        store.append(record("r", 10, RunStatus::Completed, 10));
        store.append(record("r", 20, RunStatus::Failed, 10));
        store.append(record("other", 15, RunStatus::Completed, 10));

        let all = store.query("r", &TimeRange::all());
        let minutes: Vec<_> = all
            .iter()
            .map(|r| r.started_at.format("%M").to_string())
            .collect();
        assert_eq!(minutes, ["10", "20", "30"]);

        let start = Utc.with_ymd_and_hms(2024, 3, 1, 8, 15, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 8, 25, 0).unwrap();
        let window = store.query("r", &TimeRange::between(start, end));
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].status, RunStatus::Failed);

        assert!(store.query("missing", &TimeRange::all()).is_empty());
    }

    #[test]
    fn test_retention_evicts_oldest() {
        let store = HistoryStore::new(2);
        for minute in [5, 1, 3] {
            store.append(record("r", minute, RunStatus::Completed, 1));
        }
        let kept = store.query("r", &TimeRange::all());
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].started_at.format("%M").to_string(), "03");
        assert_eq!(store.recent("r", 1)[0].started_at.format("%M").to_string(), "05");
    }

    #[test]
    fn test_metrics_include_evicted_records() {
        let store = HistoryStore::new(2);
        let failed = record("r", 1, RunStatus::Failed, 400);
        let mut failed = with_node(failed, NodeKind::Action, NodeStatus::Failed);
        failed.nodes[0].error = Some(ExecutionError::ActionFailed {
            reason: "busy".into(),
        });
        store.append(failed);
        store.append(record("r", 2, RunStatus::Completed, 100));
        store.append(record("r", 3, RunStatus::Completed, 100));
        store.append(record("other", 4, RunStatus::Completed, 0));

        assert_eq!(store.count("r"), 2);
        let metrics = store.aggregate(Some("r"));
        assert_eq!(metrics.total_executions, 3);
        assert_eq!(metrics.failure_count, 1);
        assert_eq!(metrics.success_count, 2);
        assert_eq!(metrics.avg_duration_ms, 200.0);
        assert_eq!(metrics.node_usage_counts.get("action"), Some(&1));
        assert_eq!(metrics.error_frequency.get("action_failed"), Some(&1));

        assert_eq!(store.aggregate(None).total_executions, 4);

        store.archive("r");
        assert_eq!(store.aggregate(Some("r")), Metrics::default());
    }

    #[test]
    fn test_aggregate_matches_hand_computed_totals() {
        let store = HistoryStore::default();

        let ok = record("r", 1, RunStatus::Completed, 100);
        let ok = with_node(ok, NodeKind::Trigger, NodeStatus::Completed);
        let ok = with_node(ok, NodeKind::Action, NodeStatus::Completed);

        let failed = record("r", 2, RunStatus::Failed, 300);
        let mut failed = with_node(failed, NodeKind::Action, NodeStatus::Failed);
        failed.nodes[0].error = Some(ExecutionError::ActionFailed {
            reason: "busy".into(),
        });
        let slow = record("r", 3, RunStatus::Timeout, 500);
        let mut slow = with_node(slow, NodeKind::Timer, NodeStatus::Cancelled);
        slow.error = Some(RunError::RunTimeout { deadline_secs: 1 });
        let skipped = record("r", 4, RunStatus::Completed, 300);
        let skipped = with_node(skipped, NodeKind::Action, NodeStatus::Skipped);

        for r in [ok, failed, slow, skipped] {
            store.append(r);
        }
        store.append(record("other", 5, RunStatus::Cancelled, 0));

        let metrics = store.aggregate(Some("r"));
        assert_eq!(metrics.total_executions, 4);
        assert_eq!(metrics.success_count, 2);
        assert_eq!(metrics.failure_count, 2);
        assert_eq!(metrics.timeout_count, 1);
        assert_eq!(metrics.avg_duration_ms, 300.0);
        assert_eq!(metrics.success_rate, 0.5);
        assert_eq!(metrics.node_usage_counts.get("action"), Some(&2));
        assert_eq!(metrics.node_usage_counts.get("trigger"), Some(&1));
        assert_eq!(metrics.node_usage_counts.get("timer"), None);
        assert_eq!(metrics.error_frequency.get("action_failed"), Some(&1));
        assert_eq!(metrics.error_frequency.get("run_timeout"), Some(&1));

        // Same records, same answer
        assert_eq!(metrics, store.aggregate(Some("r")));

        let global = store.aggregate(None);
        assert_eq!(global.total_executions, 5);
        assert_eq!(global.cancelled_count, 1);
        assert_eq!(global.success_rate, 0.4);
    }

    #[test]
    fn test_empty_aggregate() {
        let metrics = HistoryStore::default().aggregate(Some("nothing"));
        assert_eq!(metrics, Metrics::default());
        assert_eq!(metrics.success_rate, 0.0);
    }

    #[test]
    fn test_archive_removes_records() {
        let store = HistoryStore::default();
        store.append(record("r", 1, RunStatus::Completed, 1));
        store.append(record("r", 2, RunStatus::Completed, 1));

        let archived = store.archive("r");
        assert_eq!(archived.len(), 2);
        assert_eq!(store.count("r"), 0);
        assert!(store.rule_ids().is_empty());
    }
}
