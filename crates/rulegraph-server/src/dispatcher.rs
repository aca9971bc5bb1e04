//! Trigger dispatcher
//!
//! Watches device telemetry and cron schedules for the trigger nodes of
//! subscribed rules and turns every match into a [`RunRequest`] on the run
//! channel. Matches are never deduplicated: two events that both match
//! produce two requests, and the engine's concurrency policy decides what
//! happens to them.

use chrono::{DateTime, FixedOffset, Utc};
use dashmap::DashMap;
use rulegraph_automation::{
    device_payload, matches_device_event, schedule_payload, CronSchedule, TriggerResult,
};
use rulegraph_core::{
    AutomationRule, Context, DeviceEvent, Event, NodeConfig, NodeId, RuleId, RunRequest,
    TriggerSource, SCHEDULE_FIRED,
};
use rulegraph_event_bus::EventBus;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// A device trigger of one subscribed rule
#[derive(Debug, Clone)]
struct DeviceSubscription {
    node_id: NodeId,
    source: TriggerSource,
}

/// Routes trigger matches to the engine
pub struct TriggerDispatcher {
    event_bus: Arc<EventBus>,
    run_tx: mpsc::Sender<RunRequest>,
    default_offset: FixedOffset,
    /// rule_id -> device triggers
    device_triggers: DashMap<RuleId, Vec<DeviceSubscription>>,
    /// rule_id -> one timer task per schedule trigger
    schedules: DashMap<RuleId, Vec<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl TriggerDispatcher {
    /// `default_offset` applies to schedule triggers without their own zone
    pub fn new(
        event_bus: Arc<EventBus>,
        run_tx: mpsc::Sender<RunRequest>,
        default_offset: FixedOffset,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            event_bus,
            run_tx,
            default_offset,
            device_triggers: DashMap::new(),
            schedules: DashMap::new(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    /// Watch the enabled trigger nodes of `rule`, replacing any earlier
    /// subscription. Every schedule is parsed before anything is
    /// subscribed, so a bad cron expression leaves the rule unsubscribed.
    pub fn subscribe_rule(&self, rule: &AutomationRule) -> TriggerResult<usize> {
        let mut devices = Vec::new();
        let mut schedules = Vec::new();

        for node in rule.graph.nodes.iter().filter(|n| n.enabled) {
            let NodeConfig::Trigger(config) = &node.config else {
                continue;
            };
            match &config.source {
                TriggerSource::Device { .. } => devices.push(DeviceSubscription {
                    node_id: node.id.clone(),
                    source: config.source.clone(),
                }),
                TriggerSource::Schedule { cron, time_zone } => {
                    let schedule =
                        CronSchedule::with_zone(cron, time_zone.as_deref(), self.default_offset)?;
                    schedules.push((node.id.clone(), schedule));
                }
            }
        }

        self.unsubscribe_rule(rule.id.as_str());

        let count = devices.len() + schedules.len();
        if !devices.is_empty() {
            self.device_triggers.insert(rule.id.clone(), devices);
        }
        if !schedules.is_empty() {
            let tasks = schedules
                .into_iter()
                .map(|(node_id, schedule)| self.spawn_schedule(rule.id.clone(), node_id, schedule))
                .collect();
            self.schedules.insert(rule.id.clone(), tasks);
        }

        info!(rule_id = %rule.id, triggers = count, "Subscribed rule triggers");
        Ok(count)
    }

    /// Stop watching a rule's triggers. Returns false if it had none.
    pub fn unsubscribe_rule(&self, rule_id: &str) -> bool {
        let had_devices = self.device_triggers.remove(rule_id).is_some();
        let had_schedules = match self.schedules.remove(rule_id) {
            Some((_, tasks)) => {
                for task in tasks {
                    task.abort();
                }
                true
            }
            None => false,
        };
        if had_devices || had_schedules {
            debug!(rule_id, "Unsubscribed rule triggers");
        }
        had_devices || had_schedules
    }

    pub fn is_subscribed(&self, rule_id: &str) -> bool {
        self.device_triggers.contains_key(rule_id) || self.schedules.contains_key(rule_id)
    }

    pub fn subscribed_rules(&self) -> usize {
        let mut ids: Vec<RuleId> = self
            .device_triggers
            .iter()
            .map(|e| e.key().clone())
            .chain(self.schedules.iter().map(|e| e.key().clone()))
            .collect();
        ids.sort();
        ids.dedup();
        ids.len()
    }

    /// Match one device event against every subscribed device trigger and
    /// enqueue a run request per match. Returns the number enqueued.
    pub async fn dispatch_device_event(&self, event: &DeviceEvent) -> usize {
        let event_json = serde_json::to_value(event).unwrap_or_default();

        // Collect first so no map guard is held across the sends
        let requests: Vec<RunRequest> = self
            .device_triggers
            .iter()
            .flat_map(|entry| {
                let rule_id = entry.key().clone();
                entry
                    .value()
                    .iter()
                    .filter(|sub| matches_device_event(&sub.source, event))
                    .map(|sub| {
                        RunRequest::new(rule_id.clone(), device_payload(event))
                            .from_trigger(sub.node_id.clone())
                            .with_event(event_json.clone())
                            .at(event.timestamp)
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut sent = 0;
        for request in requests {
            trace!(rule_id = %request.rule_id, run_id = %request.run_id, "Device trigger matched");
            if self.enqueue(request).await {
                sent += 1;
            }
        }
        sent
    }

    /// Fire a schedule trigger as if its timer elapsed at `fired_at`
    pub async fn fire_schedule(
        &self,
        rule_id: &RuleId,
        node_id: &NodeId,
        cron: &str,
        fired_at: DateTime<Utc>,
    ) -> bool {
        fire_schedule(&self.event_bus, &self.run_tx, rule_id, node_id, cron, fired_at).await
    }

    /// Start consuming device events from the bus
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Trigger dispatcher already running");
            return;
        }
        info!("Starting trigger dispatcher");

        let mut events = self.event_bus.subscribe_devices();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let dispatcher = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = events.recv() => match result {
                        Ok(event) => {
                            dispatcher.dispatch_device_event(&event.data).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Trigger dispatcher lagged by {} events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("Event bus closed, stopping trigger dispatcher");
                            break;
                        }
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
            dispatcher.running.store(false, Ordering::SeqCst);
            info!("Trigger dispatcher stopped");
        });
    }

    /// Stop the event loop and every schedule timer
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let ids: Vec<RuleId> = self.schedules.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.unsubscribe_rule(id.as_str());
        }
        self.device_triggers.clear();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn enqueue(&self, request: RunRequest) -> bool {
        send_request(&self.run_tx, request).await
    }

    fn spawn_schedule(
        &self,
        rule_id: RuleId,
        node_id: NodeId,
        schedule: CronSchedule,
    ) -> JoinHandle<()> {
        let event_bus = self.event_bus.clone();
        let run_tx = self.run_tx.clone();

        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let Some(next) = schedule.next_after(now) else {
                    warn!(rule_id = %rule_id, node_id = %node_id, "Schedule never fires again");
                    return;
                };
                let wait = (next - now).to_std().unwrap_or_default();
                trace!(rule_id = %rule_id, node_id = %node_id, next = %next, "Waiting for schedule");
                tokio::time::sleep(wait).await;

                let sent = fire_schedule(
                    &event_bus,
                    &run_tx,
                    &rule_id,
                    &node_id,
                    schedule.expression(),
                    next,
                )
                .await;
                if !sent {
                    return;
                }
            }
        })
    }
}

async fn fire_schedule(
    event_bus: &EventBus,
    run_tx: &mpsc::Sender<RunRequest>,
    rule_id: &RuleId,
    node_id: &NodeId,
    cron: &str,
    fired_at: DateTime<Utc>,
) -> bool {
    let data = json!({
        "rule_id": rule_id,
        "node_id": node_id,
        "cron": cron,
    });
    let event = Event::new(SCHEDULE_FIRED, data, Context::new()).at(fired_at);
    let event_json = serde_json::to_value(&event).unwrap_or_default();
    event_bus.fire(event);

    debug!(rule_id = %rule_id, node_id = %node_id, fired_at = %fired_at, "Schedule fired");
    let request = RunRequest::new(rule_id.clone(), schedule_payload(cron, fired_at))
        .from_trigger(node_id.clone())
        .with_event(event_json)
        .at(fired_at);
    send_request(run_tx, request).await
}

async fn send_request(run_tx: &mpsc::Sender<RunRequest>, request: RunRequest) -> bool {
    match run_tx.send(request).await {
        Ok(()) => true,
        Err(_) => {
            warn!("Run channel closed, dropping trigger");
            false
        }
    }
}
