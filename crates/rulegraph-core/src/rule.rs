//! Automation rules
//!
//! A rule owns one graph plus its policy and metadata. It is the unit of
//! validation, compilation, activation and execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::Graph;
use crate::ids::RuleId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    Safety,
    Optimization,
    Maintenance,
    Quality,
    #[default]
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RulePriority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Active,
    #[default]
    Inactive,
    Error,
    Testing,
}

/// Whether triggers start runs on their own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Runs only start through `run_now`
    Manual,
    #[default]
    Automatic,
}

/// What a serialized rule does with a trigger that does not fit its queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOverflow {
    /// Evict the longest-waiting request to make room
    DropOldest,
    /// Reject the incoming request
    #[default]
    DropNewest,
}

/// Per-rule policy for overlapping runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// Overlapping runs proceed independently
    #[default]
    Unrestricted,

    /// One run in flight; later triggers wait in a bounded queue
    Serialized {
        #[serde(default = "default_queue_capacity")]
        queue_capacity: usize,
        #[serde(default)]
        overflow: QueueOverflow,
    },

    /// A new trigger cancels whatever run is in flight
    LatestWins,
}

fn default_queue_capacity() -> usize {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    #[serde(default)]
    pub mode: ExecutionMode,

    /// Extra attempts per failing node
    #[serde(default)]
    pub retry_count: u32,

    /// Per action-node timeout
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Whole-run deadline; engine default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_deadline_seconds: Option<u64>,

    #[serde(default)]
    pub concurrency: ConcurrencyPolicy,
}

fn default_timeout_seconds() -> u64 {
    30
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            retry_count: 0,
            timeout_seconds: default_timeout_seconds(),
            run_deadline_seconds: None,
            concurrency: ConcurrencyPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMetadata {
    /// Bumped on every saved graph change
    #[serde(default = "default_version")]
    pub version: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_version() -> u64 {
    1
}

impl Default for RuleMetadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            version: default_version(),
            author: None,
            created_at: now,
            updated_at: now,
            tags: Vec::new(),
        }
    }
}

/// An automation rule document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: RuleId,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub category: RuleCategory,

    #[serde(default)]
    pub priority: RulePriority,

    #[serde(default)]
    pub status: RuleStatus,

    #[serde(default)]
    pub policy: ExecutionPolicy,

    #[serde(default)]
    pub metadata: RuleMetadata,

    #[serde(default)]
    pub graph: Graph,
}

impl AutomationRule {
    /// New draft rule (status `inactive`, version 1)
    pub fn new(id: impl Into<RuleId>, name: impl Into<String>, graph: Graph) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            category: RuleCategory::default(),
            priority: RulePriority::default(),
            status: RuleStatus::default(),
            policy: ExecutionPolicy::default(),
            metadata: RuleMetadata::default(),
            graph,
        }
    }

    pub fn version(&self) -> u64 {
        self.metadata.version
    }

    pub fn is_active(&self) -> bool {
        self.status == RuleStatus::Active
    }

    /// Replace the graph and bump the version
    pub fn replace_graph(&mut self, graph: Graph) {
        self.graph = graph;
        self.metadata.version += 1;
        self.metadata.updated_at = Utc::now();
    }

    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_priority(mut self, priority: RulePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_concurrency(mut self, concurrency: ConcurrencyPolicy) -> Self {
        self.policy.concurrency = concurrency;
        self
    }
}
