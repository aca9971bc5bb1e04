//! Default collaborators for the standalone server
//!
//! Device commands are published on the event bus as `device_command`
//! events for whatever driver listens there; notifications and data
//! records are written to the log.

use async_trait::async_trait;
use rulegraph_core::{Context, DeviceCommandIssued};
use rulegraph_event_bus::EventBus;
use rulegraph_executor::{CommandResult, DataSink, DeviceCommander, Notifier};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Publishes commands on the bus
pub struct BusDeviceCommander {
    event_bus: Arc<EventBus>,
}

impl BusDeviceCommander {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self { event_bus }
    }
}

#[async_trait]
impl DeviceCommander for BusDeviceCommander {
    async fn send_command(
        &self,
        device_id: &str,
        parameter: &str,
        value: &Value,
        _timeout: Duration,
    ) -> CommandResult<()> {
        let command = DeviceCommandIssued {
            device_id: device_id.to_string(),
            parameter: parameter.to_string(),
            value: value.clone(),
        };
        self.event_bus.fire_typed(command, Context::new());
        Ok(())
    }
}

/// Logs notifications
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, channel: &str, recipients: &[String], message: &str) -> CommandResult<()> {
        info!(channel, recipients = ?recipients, "Notification: {}", message);
        Ok(())
    }
}

/// Logs data records
#[derive(Debug, Default)]
pub struct LogDataSink;

#[async_trait]
impl DataSink for LogDataSink {
    async fn write(&self, sink: &str, record: Value) -> CommandResult<()> {
        info!(sink, %record, "Data record");
        Ok(())
    }
}
