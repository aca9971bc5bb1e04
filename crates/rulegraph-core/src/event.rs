//! Events carried on the bus
//!
//! Device telemetry, schedule fires and issued commands all travel as
//! [`Event`]s. Typed payloads implement [`EventData`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

/// Event type for device telemetry
pub const DEVICE_EVENT: &str = "device_event";

/// Event type for schedule fires
pub const SCHEDULE_FIRED: &str = "schedule_fired";

/// Event type for commands issued to devices
pub const DEVICE_COMMAND: &str = "device_command";

/// Event type for finished runs
pub const RUN_FINISHED: &str = "run_finished";

/// Trait for typed event payloads
pub trait EventData: Clone + Send + Sync + 'static {
    /// The event type string for this payload
    fn event_type() -> &'static str;
}

/// Event type identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self(event_type.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Causality context attached to events and runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    /// Unique identifier (ULID)
    pub id: String,

    /// User that caused this, for manual and API-driven work
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Context this one was derived from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            id: Ulid::new().to_string(),
            user_id: None,
            parent_id: None,
        }
    }

    /// Derive a context whose parent is `self`
    pub fn child(&self) -> Self {
        Self {
            id: Ulid::new().to_string(),
            user_id: self.user_id.clone(),
            parent_id: Some(self.id.clone()),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// An event with a typed payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<T = Value> {
    pub event_type: EventType,
    pub data: T,
    pub time_fired: DateTime<Utc>,
    pub context: Context,
}

impl<T> Event<T> {
    /// Create an event stamped with the current time
    pub fn new(event_type: impl Into<EventType>, data: T, context: Context) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            time_fired: Utc::now(),
            context,
        }
    }

    /// Override the firing time
    pub fn at(mut self, time_fired: DateTime<Utc>) -> Self {
        self.time_fired = time_fired;
        self
    }
}

impl<T: EventData> Event<T> {
    pub fn typed(data: T, context: Context) -> Self {
        Self::new(T::event_type(), data, context)
    }
}

/// A device reported a parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub device_id: String,
    pub parameter: String,
    pub value: Value,

    /// Value before this report, when the device was already known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Value>,

    pub timestamp: DateTime<Utc>,
}

impl DeviceEvent {
    pub fn new(device_id: impl Into<String>, parameter: impl Into<String>, value: Value) -> Self {
        Self {
            device_id: device_id.into(),
            parameter: parameter.into(),
            value,
            previous: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_previous(mut self, previous: Value) -> Self {
        self.previous = Some(previous);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether the reported value differs from the previous one
    pub fn changed(&self) -> bool {
        self.previous.as_ref() != Some(&self.value)
    }
}

impl EventData for DeviceEvent {
    fn event_type() -> &'static str {
        DEVICE_EVENT
    }
}

/// A device command was sent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommandIssued {
    pub device_id: String,
    pub parameter: String,
    pub value: Value,
}

impl EventData for DeviceCommandIssued {
    fn event_type() -> &'static str {
        DEVICE_COMMAND
    }
}
