//! Event bus
//!
//! Topic-keyed broadcast channels. Device telemetry, schedule fires, issued
//! commands and finished runs are all published here; the trigger dispatcher
//! is the main subscriber.
//!
//! Slow subscribers lag rather than block publishers: a receiver that falls
//! more than the channel capacity behind gets `RecvError::Lagged`.

use dashmap::DashMap;
use rulegraph_core::{Context, DeviceEvent, Event, EventData, EventType};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Broadcast hub keyed by event type
pub struct EventBus {
    topics: DashMap<EventType, broadcast::Sender<Event>>,
    firehose: broadcast::Sender<Event>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (firehose, _) = broadcast::channel(capacity);
        Self {
            topics: DashMap::new(),
            firehose,
            capacity,
        }
    }

    /// Receive every event of one type
    pub fn subscribe(&self, event_type: impl Into<EventType>) -> broadcast::Receiver<Event> {
        let event_type = event_type.into();
        trace!(event_type = %event_type, "Subscribing");
        self.topics
            .entry(event_type)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Receive every event regardless of type
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.firehose.subscribe()
    }

    /// Receive events of `T`'s type with their payload decoded
    pub fn subscribe_typed<T: EventData + DeserializeOwned>(&self) -> TypedReceiver<T> {
        TypedReceiver {
            rx: self.subscribe(T::event_type()),
            _payload: PhantomData,
        }
    }

    /// Device telemetry stream
    pub fn subscribe_devices(&self) -> TypedReceiver<DeviceEvent> {
        self.subscribe_typed()
    }

    /// Publish an event; returns how many topic subscribers received it
    pub fn fire(&self, event: Event) -> usize {
        debug!(event_type = %event.event_type, "Firing event");

        let delivered = self
            .topics
            .get(&event.event_type)
            .and_then(|tx| tx.send(event.clone()).ok())
            .unwrap_or(0);

        // No receivers is not an error
        let _ = self.firehose.send(event);
        delivered
    }

    /// Publish a typed payload
    pub fn fire_typed<T: EventData + Serialize>(&self, data: T, context: Context) -> usize {
        let data = match serde_json::to_value(&data) {
            Ok(value) => value,
            Err(e) => {
                warn!(event_type = T::event_type(), error = %e, "Dropping unserializable event");
                return 0;
            }
        };
        self.fire(Event::new(T::event_type(), data, context))
    }

    /// Publish a device telemetry report
    pub fn publish_device_event(&self, event: DeviceEvent) -> usize {
        let time_fired = event.timestamp;
        match serde_json::to_value(&event) {
            Ok(data) => {
                self.fire(Event::new(DeviceEvent::event_type(), data, Context::new()).at(time_fired))
            }
            Err(e) => {
                warn!(error = %e, "Dropping unserializable device event");
                0
            }
        }
    }

    /// Number of topics with at least one channel created
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver that decodes payloads into `T`, skipping events that do not decode
pub struct TypedReceiver<T> {
    rx: broadcast::Receiver<Event>,
    _payload: PhantomData<T>,
}

impl<T: EventData + DeserializeOwned> TypedReceiver<T> {
    pub async fn recv(&mut self) -> Result<Event<T>, broadcast::error::RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if let Some(typed) = decode(event) {
                return Ok(typed);
            }
        }
    }

    /// Non-blocking receive; `Empty` when nothing decodable is waiting
    pub fn try_recv(&mut self) -> Result<Event<T>, broadcast::error::TryRecvError> {
        loop {
            let event = self.rx.try_recv()?;
            if let Some(typed) = decode(event) {
                return Ok(typed);
            }
        }
    }
}

fn decode<T: DeserializeOwned>(event: Event<Value>) -> Option<Event<T>> {
    let Event {
        event_type,
        data,
        time_fired,
        context,
    } = event;
    match serde_json::from_value::<T>(data) {
        Ok(data) => Some(Event {
            event_type,
            data,
            time_fired,
            context,
        }),
        Err(e) => {
            trace!(event_type = %event_type, error = %e, "Skipping undecodable event");
            None
        }
    }
}

pub type SharedEventBus = Arc<EventBus>;
