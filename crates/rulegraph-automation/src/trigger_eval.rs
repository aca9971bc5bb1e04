//! Trigger matching against device telemetry

use rulegraph_core::{DeviceEvent, TriggerKeyword, TriggerMatch, TriggerSource};
use serde_json::{json, Value};
use tracing::trace;

/// Whether a device trigger fires for an event
pub fn matches_device_event(source: &TriggerSource, event: &DeviceEvent) -> bool {
    let TriggerSource::Device {
        device_id,
        parameter,
        matches,
    } = source
    else {
        return false;
    };

    if device_id != &event.device_id || parameter != &event.parameter {
        return false;
    }

    let fired = match matches {
        TriggerMatch::Keyword(TriggerKeyword::Any) => true,
        TriggerMatch::Keyword(TriggerKeyword::Changed) => event.changed(),
        TriggerMatch::Value(value_match) => value_match.matches(&event.value),
    };
    trace!(
        device_id = %event.device_id,
        parameter = %event.parameter,
        value = %event.value,
        fired,
        "Evaluated device trigger"
    );
    fired
}

/// Payload handed to a run started by a device event
pub fn device_payload(event: &DeviceEvent) -> Value {
    json!({
        "platform": "device",
        "device_id": event.device_id,
        "parameter": event.parameter,
        "value": event.value,
        "previous": event.previous,
        "timestamp": event.timestamp.to_rfc3339(),
    })
}

/// Payload handed to a run started by a schedule
pub fn schedule_payload(cron: &str, fired_at: chrono::DateTime<chrono::Utc>) -> Value {
    json!({
        "platform": "schedule",
        "cron": cron,
        "timestamp": fired_at.to_rfc3339(),
    })
}
