//! Device state storage
//!
//! Tracks the latest reported value of every device parameter. Each report
//! is published on the event bus as a [`DeviceEvent`] carrying the previous
//! value, which is what device triggers match against. Conditions read a
//! point-in-time [`DeviceStateStore::snapshot`].

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rulegraph_core::DeviceEvent;
use rulegraph_event_bus::EventBus;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Latest value of one parameter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterState {
    pub value: Value,
    /// Last time the value actually changed
    pub last_changed: DateTime<Utc>,
    /// Last time the value was reported
    pub last_reported: DateTime<Utc>,
}

/// Parameter values keyed by device id
pub struct DeviceStateStore {
    devices: DashMap<String, HashMap<String, ParameterState>>,
    event_bus: Arc<EventBus>,
}

impl DeviceStateStore {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self {
            devices: DashMap::new(),
            event_bus,
        }
    }

    /// Record a reported value and publish it as telemetry
    #[instrument(skip(self, value), fields(device_id = %device_id, parameter = %parameter))]
    pub fn report(&self, device_id: &str, parameter: &str, value: Value) -> DeviceEvent {
        self.report_at(device_id, parameter, value, Utc::now())
    }

    /// Same as [`report`](Self::report) with an explicit timestamp
    pub fn report_at(
        &self,
        device_id: &str,
        parameter: &str,
        value: Value,
        timestamp: DateTime<Utc>,
    ) -> DeviceEvent {
        let previous = {
            let mut device = self.devices.entry(device_id.to_string()).or_default();
            let previous = device.get(parameter).map(|p| p.value.clone());
            let last_changed = match device.get(parameter) {
                Some(existing) if existing.value == value => existing.last_changed,
                _ => timestamp,
            };
            device.insert(
                parameter.to_string(),
                ParameterState {
                    value: value.clone(),
                    last_changed,
                    last_reported: timestamp,
                },
            );
            previous
        };

        let mut event = DeviceEvent::new(device_id, parameter, value).at(timestamp);
        if let Some(previous) = previous {
            event = event.with_previous(previous);
        }

        debug!(changed = event.changed(), "Device reported");
        self.event_bus.publish_device_event(event.clone());
        event
    }

    pub fn get(&self, device_id: &str, parameter: &str) -> Option<Value> {
        self.devices
            .get(device_id)
            .and_then(|d| d.get(parameter).map(|p| p.value.clone()))
    }

    pub fn parameter(&self, device_id: &str, parameter: &str) -> Option<ParameterState> {
        self.devices
            .get(device_id)
            .and_then(|d| d.get(parameter).cloned())
    }

    /// All devices as `{device_id: {parameter: value}}`
    pub fn snapshot(&self) -> Value {
        let mut devices = Map::new();
        for entry in self.devices.iter() {
            let parameters: Map<String, Value> = entry
                .value()
                .iter()
                .map(|(name, state)| (name.clone(), state.value.clone()))
                .collect();
            devices.insert(entry.key().clone(), Value::Object(parameters));
        }
        Value::Object(devices)
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.key().clone()).collect()
    }

    /// Forget a device; no event is published
    pub fn remove_device(&self, device_id: &str) -> bool {
        self.devices.remove(device_id).is_some()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

pub type SharedDeviceStateStore = Arc<DeviceStateStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn store() -> (Arc<EventBus>, DeviceStateStore) {
        let bus = Arc::new(EventBus::new());
        let store = DeviceStateStore::new(bus.clone());
        (bus, store)
    }

    #[test]
    fn test_report_publishes_with_previous() {
        let (bus, store) = store();
        let mut devices = bus.subscribe_devices();

        store.report("motion_1", "motion", json!(false));
        store.report("motion_1", "motion", json!(true));

        let (first, second) = tokio_test::block_on(async {
            (devices.recv().await.unwrap(), devices.recv().await.unwrap())
        });
        assert_eq!(first.data.previous, None);
        assert_eq!(second.data.previous, Some(json!(false)));
        assert!(second.data.changed());
    }

    #[test]
    fn test_last_changed_only_moves_on_change() {
        let (_bus, store) = store();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(10);

        store.report_at("lamp", "power", json!("on"), t0);
        store.report_at("lamp", "power", json!("on"), t1);

        let state = store.parameter("lamp", "power").unwrap();
        assert_eq!(state.last_changed, t0);
        assert_eq!(state.last_reported, t1);
    }

    #[test]
    fn test_snapshot_shape() {
        let (_bus, store) = store();
        store.report("thermo", "temperature", json!(21.5));
        store.report("thermo", "mode", json!("heat"));
        store.report("lamp", "power", json!("off"));

        let snapshot = store.snapshot();
        assert_eq!(snapshot["thermo"]["temperature"], json!(21.5));
        assert_eq!(snapshot["thermo"]["mode"], json!("heat"));
        assert_eq!(snapshot["lamp"]["power"], json!("off"));
        assert_eq!(store.device_count(), 2);
    }

    #[test]
    fn test_remove_device() {
        let (_bus, store) = store();
        store.report("lamp", "power", json!("off"));
        assert!(store.remove_device("lamp"));
        assert!(store.get("lamp", "power").is_none());
        assert!(!store.remove_device("lamp"));
    }
}
