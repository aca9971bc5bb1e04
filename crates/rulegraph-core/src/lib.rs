//! Core types for automation rule graphs
//!
//! This crate holds the data model shared by every other crate: node, edge
//! and rule definitions, events, run requests and execution records.
//! Everything here is plain data and JSON-serializable.

mod event;
mod graph;
mod ids;
mod node;
mod predicate;
mod record;
mod rule;

pub use event::{
    Context, DeviceCommandIssued, DeviceEvent, Event, EventData, EventType, DEVICE_COMMAND,
    DEVICE_EVENT, RUN_FINISHED, SCHEDULE_FIRED,
};
pub use graph::{Branch, Edge, EdgeKind, Graph};
pub use ids::{NodeId, RuleId, RunId};
pub use node::{
    ActionConfig, ConditionConfig, DataConfig, DecisionConfig, LogicConfig, Node, NodeConfig,
    NodeKind, NotificationConfig, TimeUnit, TimerConfig, TriggerConfig, TriggerSource,
};
pub use predicate::{Predicate, TriggerKeyword, TriggerMatch, ValueMatch};
pub use record::{
    ExecutionError, ExecutionRecord, NodeOutcome, NodeStatus, RunError, RunRequest, RunStatus,
    TimeRange,
};
pub use rule::{
    AutomationRule, ConcurrencyPolicy, ExecutionMode, ExecutionPolicy, QueueOverflow,
    RuleCategory, RuleMetadata, RulePriority, RuleStatus,
};
