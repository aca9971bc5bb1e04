//! Graph nodes
//!
//! A node is a closed tagged union over the eight node kinds. Nodes never
//! point at each other; edges connect them by [`NodeId`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::ids::NodeId;
use crate::predicate::{Predicate, TriggerMatch};

/// Node kind discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Trigger,
    Condition,
    Action,
    Decision,
    Timer,
    Notification,
    Data,
    Logic,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Trigger => "trigger",
            NodeKind::Condition => "condition",
            NodeKind::Action => "action",
            NodeKind::Decision => "decision",
            NodeKind::Timer => "timer",
            NodeKind::Notification => "notification",
            NodeKind::Data => "data",
            NodeKind::Logic => "logic",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node in a rule graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,

    #[serde(default)]
    pub label: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(flatten)]
    pub config: NodeConfig,
}

fn default_enabled() -> bool {
    true
}

impl Node {
    pub fn new(id: impl Into<NodeId>, config: NodeConfig) -> Self {
        Self {
            id: id.into(),
            label: String::new(),
            enabled: true,
            config,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn kind(&self) -> NodeKind {
        self.config.kind()
    }

    /// Label if set, otherwise the id
    pub fn display_name(&self) -> &str {
        if self.label.is_empty() {
            self.id.as_str()
        } else {
            &self.label
        }
    }

    // Shorthand constructors used by builders and tests

    pub fn device_trigger(
        id: impl Into<NodeId>,
        device_id: impl Into<String>,
        parameter: impl Into<String>,
        matches: TriggerMatch,
    ) -> Self {
        Self::new(
            id,
            NodeConfig::Trigger(TriggerConfig {
                source: TriggerSource::Device {
                    device_id: device_id.into(),
                    parameter: parameter.into(),
                    matches,
                },
            }),
        )
    }

    pub fn schedule_trigger(id: impl Into<NodeId>, cron: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeConfig::Trigger(TriggerConfig {
                source: TriggerSource::Schedule {
                    cron: cron.into(),
                    time_zone: None,
                },
            }),
        )
    }

    pub fn condition(id: impl Into<NodeId>, predicate: Predicate) -> Self {
        Self::new(id, NodeConfig::Condition(ConditionConfig { predicate }))
    }

    pub fn decision(id: impl Into<NodeId>, predicate: Predicate) -> Self {
        Self::new(id, NodeConfig::Decision(DecisionConfig { predicate }))
    }

    pub fn action(
        id: impl Into<NodeId>,
        device_id: impl Into<String>,
        parameter: impl Into<String>,
        value: Value,
    ) -> Self {
        Self::new(
            id,
            NodeConfig::Action(ActionConfig {
                device_id: device_id.into(),
                parameter: parameter.into(),
                value,
            }),
        )
    }

    pub fn timer(id: impl Into<NodeId>, delay: u64, unit: TimeUnit) -> Self {
        Self::new(id, NodeConfig::Timer(TimerConfig { delay, unit }))
    }

    pub fn notification(
        id: impl Into<NodeId>,
        channel: impl Into<String>,
        recipients: Vec<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            NodeConfig::Notification(NotificationConfig {
                channel: channel.into(),
                recipients,
                message: message.into(),
            }),
        )
    }

    pub fn logic(id: impl Into<NodeId>, variable: impl Into<String>, expression: Predicate) -> Self {
        Self::new(
            id,
            NodeConfig::Logic(LogicConfig {
                variable: variable.into(),
                expression,
            }),
        )
    }
}

/// Kind-specific node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeConfig {
    Trigger(TriggerConfig),
    Condition(ConditionConfig),
    Action(ActionConfig),
    Decision(DecisionConfig),
    Timer(TimerConfig),
    Notification(NotificationConfig),
    Data(DataConfig),
    Logic(LogicConfig),
}

impl NodeConfig {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeConfig::Trigger(_) => NodeKind::Trigger,
            NodeConfig::Condition(_) => NodeKind::Condition,
            NodeConfig::Action(_) => NodeKind::Action,
            NodeConfig::Decision(_) => NodeKind::Decision,
            NodeConfig::Timer(_) => NodeKind::Timer,
            NodeConfig::Notification(_) => NodeKind::Notification,
            NodeConfig::Data(_) => NodeKind::Data,
            NodeConfig::Logic(_) => NodeKind::Logic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub source: TriggerSource,
}

/// Where a trigger listens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSource {
    /// Device telemetry filtered by device, parameter and match
    Device {
        device_id: String,
        parameter: String,
        #[serde(rename = "match", default)]
        matches: TriggerMatch,
    },

    /// Cron-like schedule: `minute hour day-of-month month day-of-week`
    Schedule {
        cron: String,
        /// Fixed UTC offset such as `"+02:00"`; engine default when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time_zone: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub predicate: Predicate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionConfig {
    pub predicate: Predicate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    pub device_id: String,
    pub parameter: String,
    /// String values may contain `{{ placeholders }}`
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerConfig {
    pub delay: u64,
    #[serde(default)]
    pub unit: TimeUnit,
}

impl TimerConfig {
    pub fn duration(&self) -> Duration {
        self.unit.duration(self.delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    #[default]
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
}

impl TimeUnit {
    pub fn duration(&self, amount: u64) -> Duration {
        match self {
            TimeUnit::Milliseconds => Duration::from_millis(amount),
            TimeUnit::Seconds => Duration::from_secs(amount),
            TimeUnit::Minutes => Duration::from_secs(amount.saturating_mul(60)),
            TimeUnit::Hours => Duration::from_secs(amount.saturating_mul(3600)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub channel: String,
    #[serde(default)]
    pub recipients: Vec<String>,
    /// May contain `{{ placeholders }}`
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    pub sink: String,
    /// Rendered field by field before being written
    #[serde(default)]
    pub fields: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicConfig {
    /// Run variable that receives the boolean result
    pub variable: String,
    pub expression: Predicate,
}
