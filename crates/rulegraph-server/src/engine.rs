//! Automation engine
//!
//! Ties the rule manager, trigger dispatcher, executor and history store
//! together. Each run is its own tokio task; a per-rule coordinator applies
//! the rule's concurrency policy before a run starts:
//!
//! - `unrestricted`: every request starts immediately
//! - `serialized`: one run in flight, later requests wait in a bounded queue
//! - `latest_wins`: a new request cancels whatever is in flight
//!
//! A run never fails the engine. Panics inside a run task are caught at the
//! task boundary and recorded as `run_failed`.

use dashmap::DashMap;
use rulegraph_automation::{
    validate, CompiledPlan, GraphUpdate, RuleError, RuleManager, ValidationResult,
};
use rulegraph_config::{ConfigResult, EngineConfig, NotificationTarget, RetryStrategy, RuleStorage};
use rulegraph_core::{
    AutomationRule, ConcurrencyPolicy, Context, Event, ExecutionMode, ExecutionRecord, Graph,
    QueueOverflow, RuleId, RulePriority, RuleStatus, RunError, RunId, RunRequest, RunStatus,
    TimeRange, RUN_FINISHED,
};
use rulegraph_event_bus::EventBus;
use rulegraph_executor::{
    BackoffPolicy, CancelToken, Collaborators, Executor, ExecutorSettings, Notifier,
};
use rulegraph_recorder::{HistoryStore, Metrics, DEFAULT_MAX_RECORDS_PER_RULE};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

use crate::dispatcher::TriggerDispatcher;
use crate::error::{EngineError, EngineResult};

/// Engine settings derived from [`EngineConfig`]
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub executor: ExecutorSettings,
    pub max_records_per_rule: usize,
    /// Capacity of the dispatcher to engine channel
    pub run_queue_capacity: usize,
    pub critical_failures: Option<NotificationTarget>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            executor: ExecutorSettings::default(),
            max_records_per_rule: DEFAULT_MAX_RECORDS_PER_RULE,
            run_queue_capacity: 1024,
            critical_failures: None,
        }
    }
}

impl EngineOptions {
    pub fn from_config(config: &EngineConfig) -> ConfigResult<Self> {
        let retry = &config.engine.retry;
        let backoff = match retry.strategy {
            RetryStrategy::Fixed => BackoffPolicy::fixed(retry.base()),
            RetryStrategy::Exponential => {
                BackoffPolicy::exponential(retry.base(), retry.max(), retry.multiplier)
            }
        };
        Ok(Self {
            executor: ExecutorSettings {
                backoff,
                default_run_deadline: config.run_deadline(),
                time_zone: config.time_zone()?,
            },
            max_records_per_rule: config.history.max_records_per_rule,
            run_queue_capacity: config.engine.run_queue_capacity,
            critical_failures: config.notifications.critical_failures.clone(),
        })
    }
}

/// Awaitable result of a submitted run
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: RunId,
    rx: oneshot::Receiver<ExecutionRecord>,
}

impl RunHandle {
    /// Wait for the run's record. Fails if the run was dropped from a
    /// queue before it started.
    pub async fn wait(self) -> EngineResult<ExecutionRecord> {
        let run_id = self.run_id;
        self.rx.await.map_err(|_| EngineError::RunDropped { run_id })
    }
}

/// What the coordinator did with a run request
#[derive(Debug)]
pub enum RunSubmission {
    Started(RunHandle),
    /// Waiting behind an in-flight run; `position` is 1-based
    Queued { handle: RunHandle, position: usize },
    Rejected { run_id: RunId, reason: String },
}

impl RunSubmission {
    pub fn run_id(&self) -> &RunId {
        match self {
            RunSubmission::Started(handle) | RunSubmission::Queued { handle, .. } => &handle.run_id,
            RunSubmission::Rejected { run_id, .. } => run_id,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            RunSubmission::Started(_) => "started",
            RunSubmission::Queued { .. } => "queued",
            RunSubmission::Rejected { .. } => "rejected",
        }
    }

    pub fn into_handle(self) -> Option<RunHandle> {
        match self {
            RunSubmission::Started(handle) | RunSubmission::Queued { handle, .. } => Some(handle),
            RunSubmission::Rejected { .. } => None,
        }
    }
}

/// Result of deleting a rule
#[derive(Debug)]
pub struct Deletion {
    pub rule: AutomationRule,
    /// Records removed with the rule, kept only when archiving was asked for
    pub archived: Vec<ExecutionRecord>,
    /// Where the archive was written, when storage is configured
    pub archive_path: Option<PathBuf>,
}

struct PendingRun {
    request: RunRequest,
    reply: oneshot::Sender<ExecutionRecord>,
}

/// Runs of one rule
#[derive(Default)]
struct RuleRuns {
    in_flight: HashMap<RunId, CancelToken>,
    queue: VecDeque<PendingRun>,
}

struct Inner {
    rules: RuleManager,
    executor: Executor,
    history: HistoryStore,
    storage: Option<RuleStorage>,
    event_bus: Arc<EventBus>,
    notifier: Arc<dyn Notifier>,
    dispatcher: Arc<TriggerDispatcher>,
    runs: DashMap<RuleId, RuleRuns>,
    critical_failures: Option<NotificationTarget>,
    intake: Mutex<Option<mpsc::Receiver<RunRequest>>>,
    shutdown_tx: broadcast::Sender<()>,
}

/// The automation engine. Cheap to clone.
#[derive(Clone)]
pub struct AutomationEngine {
    inner: Arc<Inner>,
}

impl AutomationEngine {
    pub fn new(
        event_bus: Arc<EventBus>,
        collaborators: Collaborators,
        storage: Option<RuleStorage>,
        options: EngineOptions,
    ) -> Self {
        let (run_tx, run_rx) = mpsc::channel(options.run_queue_capacity.max(1));
        let dispatcher = Arc::new(TriggerDispatcher::new(
            event_bus.clone(),
            run_tx,
            options.executor.time_zone,
        ));
        let (shutdown_tx, _) = broadcast::channel(1);
        let notifier = collaborators.notifier.clone();

        Self {
            inner: Arc::new(Inner {
                rules: RuleManager::new(),
                executor: Executor::new(collaborators, options.executor),
                history: HistoryStore::new(options.max_records_per_rule),
                storage,
                event_bus,
                notifier,
                dispatcher,
                runs: DashMap::new(),
                critical_failures: options.critical_failures,
                intake: Mutex::new(Some(run_rx)),
                shutdown_tx,
            }),
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.inner.event_bus
    }

    pub fn dispatcher(&self) -> &Arc<TriggerDispatcher> {
        &self.inner.dispatcher
    }

    // ==================== Rules ====================

    pub fn rules(&self) -> Vec<AutomationRule> {
        self.inner.rules.all()
    }

    pub fn get_rule(&self, id: &str) -> Option<AutomationRule> {
        self.inner.rules.get(id)
    }

    /// Store a rule. A rule submitted as `active` goes through a fresh
    /// validate and compile; if that fails it is stored in `error` status
    /// and the failure is returned.
    pub async fn upsert_rule(&self, mut rule: AutomationRule) -> EngineResult<AutomationRule> {
        let id = rule.id.clone();
        let activate = rule.is_active();
        if activate {
            rule.status = RuleStatus::Inactive;
        }

        self.inner.dispatcher.unsubscribe_rule(id.as_str());
        self.inner.rules.upsert(rule);

        let activated = if activate {
            self.start_triggers(id.as_str()).map(|_| ())
        } else {
            Ok(())
        };
        self.persist(id.as_str()).await?;
        activated?;

        self.inner
            .rules
            .get(id.as_str())
            .ok_or_else(|| RuleError::NotFound(id).into())
    }

    /// Save a graph edit. An active rule stops listening to its triggers
    /// until it is activated again; runs already in flight finish on the
    /// plan they started with.
    pub async fn update_graph(&self, id: &str, graph: Graph) -> EngineResult<GraphUpdate> {
        let update = self.inner.rules.update_graph(id, graph)?;
        if update.was_active {
            self.inner.dispatcher.unsubscribe_rule(id);
        }
        self.persist(id).await?;
        Ok(update)
    }

    /// Remove a rule, cancel its runs and drop its history. With `archive`
    /// the removed records are returned and, when storage is configured,
    /// written to the archive directory.
    pub async fn delete_rule(&self, id: &str, archive: bool) -> EngineResult<Deletion> {
        let rule = self.inner.rules.remove(id)?;
        self.inner.dispatcher.unsubscribe_rule(id);
        self.inner.cancel_runs(id, "rule deleted");

        let records = self.inner.history.archive(id);
        let mut archive_path = None;
        if let Some(storage) = &self.inner.storage {
            if archive && !records.is_empty() {
                archive_path = Some(storage.archive_records(id, &records).await?);
            }
            storage.delete(id).await?;
        }

        info!(rule_id = id, records = records.len(), archive, "Deleted rule");
        Ok(Deletion {
            rule,
            archived: if archive { records } else { Vec::new() },
            archive_path,
        })
    }

    pub fn validate(&self, rule: &AutomationRule) -> ValidationResult {
        validate(rule)
    }

    pub fn validate_rule(&self, id: &str) -> EngineResult<ValidationResult> {
        Ok(self.inner.rules.validate(id)?)
    }

    /// Validate, compile and start listening to the rule's triggers
    pub async fn activate(&self, id: &str) -> EngineResult<AutomationRule> {
        let result = self.start_triggers(id);
        // Persist either outcome; a refused activation leaves `error` status
        if self.inner.rules.contains(id) {
            self.persist(id).await?;
        }
        result
    }

    /// Stop listening to the rule's triggers and cancel its runs. Returns
    /// false when the rule was not active.
    pub async fn deactivate(&self, id: &str) -> EngineResult<bool> {
        let was_active = self.inner.rules.deactivate(id)?;
        self.inner.dispatcher.unsubscribe_rule(id);
        self.inner.cancel_runs(id, "rule deactivated");
        self.persist(id).await?;
        Ok(was_active)
    }

    fn start_triggers(&self, id: &str) -> EngineResult<AutomationRule> {
        let (rule, _plan) = self.inner.rules.activate(id)?;
        if rule.policy.mode == ExecutionMode::Automatic {
            if let Err(source) = self.inner.dispatcher.subscribe_rule(&rule) {
                warn!(rule_id = id, error = %source, "Trigger subscription failed");
                self.inner.rules.set_status(id, RuleStatus::Error)?;
                return Err(EngineError::Trigger {
                    rule_id: rule.id,
                    source,
                });
            }
        }
        Ok(rule)
    }

    async fn persist(&self, id: &str) -> EngineResult<()> {
        if let (Some(storage), Some(rule)) = (&self.inner.storage, self.inner.rules.get(id)) {
            storage.save(&rule).await?;
        }
        Ok(())
    }

    /// Load every stored rule and re-activate those stored as active.
    /// Rules that no longer validate are kept in `error` status.
    pub async fn restore(&self) -> EngineResult<usize> {
        let Some(storage) = &self.inner.storage else {
            return Ok(0);
        };
        let rules = storage.load_all().await?;
        let count = rules.len();
        for rule in rules {
            let id = rule.id.clone();
            if let Err(e) = self.upsert_rule(rule).await {
                warn!(rule_id = %id, error = %e, "Stored rule could not be activated");
            }
        }
        info!(rules = count, "Restored rules");
        Ok(count)
    }

    // ==================== Runs ====================

    /// Manually run a rule with a test payload. Every trigger node fires.
    /// The rule does not have to be active, but it must be valid.
    pub fn run_now(&self, id: &str, payload: Value) -> EngineResult<RunSubmission> {
        let (rule, plan) = self.inner.rules.plan(id)?;
        let request = RunRequest::new(rule.id.clone(), payload);
        info!(rule_id = id, run_id = %request.run_id, "Manual run requested");
        Ok(self.inner.submit(rule, plan, request))
    }

    /// Submit a dispatched request. Requests for rules that are no longer
    /// active are dropped.
    pub fn submit(&self, request: RunRequest) -> EngineResult<Option<RunSubmission>> {
        self.inner.submit_dispatched(request)
    }

    /// Runs currently executing for a rule
    pub fn in_flight(&self, id: &str) -> usize {
        self.inner.runs.get(id).map(|r| r.in_flight.len()).unwrap_or(0)
    }

    /// Requests waiting behind a serialized rule's in-flight run
    pub fn queued(&self, id: &str) -> usize {
        self.inner.runs.get(id).map(|r| r.queue.len()).unwrap_or(0)
    }

    /// Rules with runs executing or waiting
    pub fn busy_rules(&self) -> usize {
        self.inner.runs.len()
    }

    // ==================== History ====================

    pub fn get_metrics(&self, id: Option<&str>) -> Metrics {
        self.inner.history.aggregate(id)
    }

    pub fn get_history(&self, id: &str, range: &TimeRange) -> Vec<ExecutionRecord> {
        self.inner.history.query(id, range)
    }

    // ==================== Lifecycle ====================

    /// Start the dispatcher and the run intake loop. Only the first call
    /// has an effect.
    pub async fn start(&self) {
        let Some(mut run_rx) = self.inner.intake.lock().await.take() else {
            warn!("Automation engine already started");
            return;
        };
        info!("Starting automation engine");

        for rule in self.inner.rules.active() {
            if rule.policy.mode != ExecutionMode::Automatic {
                continue;
            }
            if let Err(e) = self.inner.dispatcher.subscribe_rule(&rule) {
                warn!(rule_id = %rule.id, error = %e, "Trigger subscription failed");
            }
        }
        self.inner.dispatcher.start();

        let inner = self.inner.clone();
        let mut shutdown_rx = inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    request = run_rx.recv() => match request {
                        Some(request) => {
                            if let Err(e) = inner.submit_dispatched(request) {
                                warn!(error = %e, "Dropping triggered run");
                            }
                        }
                        None => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
            info!("Run intake stopped");
        });
    }

    /// Stop dispatching and cancel every in-flight run
    pub fn stop(&self) {
        info!("Stopping automation engine");
        self.inner.dispatcher.stop();
        let _ = self.inner.shutdown_tx.send(());
        let ids: Vec<RuleId> = self.inner.runs.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.inner.cancel_runs(id.as_str(), "engine stopping");
        }
    }
}

impl Inner {
    fn submit_dispatched(self: &Arc<Self>, request: RunRequest) -> EngineResult<Option<RunSubmission>> {
        let (rule, plan) = self.rules.plan(request.rule_id.as_str())?;
        if !rule.is_active() {
            debug!(rule_id = %rule.id, run_id = %request.run_id, "Rule inactive, ignoring trigger");
            return Ok(None);
        }
        let submission = self.submit(rule, plan, request);
        if let RunSubmission::Rejected { run_id, reason } = &submission {
            warn!(run_id = %run_id, reason = %reason, "Triggered run rejected");
        }
        Ok(Some(submission))
    }

    /// Apply the rule's concurrency policy and start or queue the run
    fn submit(
        self: &Arc<Self>,
        rule: AutomationRule,
        plan: Arc<CompiledPlan>,
        request: RunRequest,
    ) -> RunSubmission {
        let (reply, rx) = oneshot::channel();
        let handle = RunHandle {
            run_id: request.run_id.clone(),
            rx,
        };

        let token = {
            let mut runs = self.runs.entry(rule.id.clone()).or_default();
            match rule.policy.concurrency {
                ConcurrencyPolicy::Unrestricted => {}
                ConcurrencyPolicy::LatestWins => {
                    for (run_id, token) in &runs.in_flight {
                        debug!(rule_id = %rule.id, run_id = %run_id, "Preempting run");
                        token.cancel(format!("preempted by run {}", request.run_id));
                    }
                }
                ConcurrencyPolicy::Serialized {
                    queue_capacity,
                    overflow,
                } => {
                    if !runs.in_flight.is_empty() || !runs.queue.is_empty() {
                        if runs.queue.len() >= queue_capacity {
                            let evicted = match overflow {
                                QueueOverflow::DropOldest => runs.queue.pop_front(),
                                QueueOverflow::DropNewest => None,
                            };
                            match evicted {
                                Some(evicted) => warn!(
                                    rule_id = %rule.id,
                                    run_id = %evicted.request.run_id,
                                    "Run queue full, dropping oldest request"
                                ),
                                None => {
                                    warn!(
                                        rule_id = %rule.id,
                                        run_id = %request.run_id,
                                        "Run queue full, rejecting request"
                                    );
                                    return RunSubmission::Rejected {
                                        run_id: request.run_id,
                                        reason: format!(
                                            "run queue full ({queue_capacity} waiting)"
                                        ),
                                    };
                                }
                            }
                        }
                        runs.queue.push_back(PendingRun { request, reply });
                        let position = runs.queue.len();
                        debug!(rule_id = %rule.id, position, "Run queued");
                        return RunSubmission::Queued { handle, position };
                    }
                }
            }

            let token = CancelToken::new();
            runs.in_flight.insert(request.run_id.clone(), token.clone());
            token
        };

        self.spawn_run(rule, plan, request, token, reply);
        RunSubmission::Started(handle)
    }

    fn spawn_run(
        self: &Arc<Self>,
        rule: AutomationRule,
        plan: Arc<CompiledPlan>,
        request: RunRequest,
        token: CancelToken,
        reply: oneshot::Sender<ExecutionRecord>,
    ) {
        let inner = self.clone();
        tokio::spawn(async move {
            // A nested task so a panic in the run surfaces as a JoinError here
            let run = {
                let inner = inner.clone();
                let rule = rule.clone();
                let request = request.clone();
                tokio::spawn(async move { inner.executor.execute(&rule, &plan, &request, &token).await })
            };
            let record = match run.await {
                Ok(record) => record,
                Err(e) => {
                    error!(rule_id = %rule.id, run_id = %request.run_id, error = %e, "Run task failed");
                    ExecutionRecord::aborted(
                        &request,
                        rule.version(),
                        RunError::RunFailed {
                            reason: format!("run task failed: {e}"),
                        },
                    )
                }
            };
            inner.finish(&rule, record, reply).await;
        });
    }

    async fn finish(
        self: &Arc<Self>,
        rule: &AutomationRule,
        record: ExecutionRecord,
        reply: oneshot::Sender<ExecutionRecord>,
    ) {
        match record.status {
            RunStatus::Completed => {}
            RunStatus::Failed => error!(
                rule_id = %rule.id,
                run_id = %record.id,
                error = ?record.error,
                "Run failed"
            ),
            RunStatus::Timeout | RunStatus::Cancelled => warn!(
                rule_id = %rule.id,
                run_id = %record.id,
                status = record.status.as_str(),
                "Run did not complete"
            ),
        }

        // A deleted rule takes its history with it
        if self.rules.contains(rule.id.as_str()) {
            self.history.append(record.clone());
        }

        self.event_bus.fire(Event::new(
            RUN_FINISHED,
            json!({
                "rule_id": record.rule_id,
                "run_id": record.id,
                "status": record.status,
                "duration_ms": record.duration_ms,
            }),
            Context::new(),
        ));

        if rule.priority == RulePriority::Critical && !record.is_success() {
            self.report_critical(rule, &record).await;
        }

        // Free the slot first so a waiter that resubmits finds it open
        self.release(&rule.id, record.id.clone());
        let _ = reply.send(record);
    }

    /// Free the finished run's slot and start the next queued request
    fn release(self: &Arc<Self>, rule_id: &RuleId, mut finished: RunId) {
        loop {
            let next = self.runs.get_mut(rule_id).and_then(|mut runs| {
                runs.in_flight.remove(&finished);
                if !runs.in_flight.is_empty() {
                    return None;
                }
                let pending = runs.queue.pop_front()?;
                let token = CancelToken::new();
                runs.in_flight.insert(pending.request.run_id.clone(), token.clone());
                Some((pending, token))
            });
            let Some((pending, token)) = next else {
                self.forget_if_idle(rule_id.as_str());
                return;
            };

            match self.rules.plan(rule_id.as_str()) {
                Ok((rule, plan)) => {
                    debug!(rule_id = %rule_id, run_id = %pending.request.run_id, "Starting queued run");
                    self.spawn_run(rule, plan, pending.request, token, pending.reply);
                    return;
                }
                Err(e) => {
                    warn!(rule_id = %rule_id, error = %e, "Dropping queued run");
                    finished = pending.request.run_id;
                }
            }
        }
    }

    fn cancel_runs(&self, rule_id: &str, reason: &str) -> usize {
        let Some(mut runs) = self.runs.get_mut(rule_id) else {
            return 0;
        };
        for token in runs.in_flight.values() {
            token.cancel(reason);
        }
        let dropped = runs.queue.len();
        runs.queue.clear();
        if dropped > 0 {
            warn!(rule_id, dropped, "Dropped queued runs");
        }
        let in_flight = runs.in_flight.len();
        drop(runs);
        self.forget_if_idle(rule_id);
        in_flight
    }

    /// Drop the rule's run bookkeeping once nothing is running or waiting
    fn forget_if_idle(&self, rule_id: &str) {
        self.runs
            .remove_if(rule_id, |_, runs| runs.in_flight.is_empty() && runs.queue.is_empty());
    }

    async fn report_critical(&self, rule: &AutomationRule, record: &ExecutionRecord) {
        let Some(target) = &self.critical_failures else {
            return;
        };
        let cause = record.error.as_ref().map(ToString::to_string).or_else(|| {
            record.nodes.iter().find_map(|node| {
                node.error
                    .as_ref()
                    .map(|e| format!("node {}: {}", node.node_id, e))
            })
        });
        let message = match cause {
            Some(cause) => format!(
                "Critical rule '{}' run {} {}: {}",
                rule.name,
                record.id,
                record.status.as_str(),
                cause
            ),
            None => format!(
                "Critical rule '{}' run {} {}",
                rule.name,
                record.id,
                record.status.as_str()
            ),
        };
        if let Err(e) = self
            .notifier
            .notify(&target.channel, &target.recipients, &message)
            .await
        {
            warn!(rule_id = %rule.id, error = %e, "Critical failure notification failed");
        }
    }
}
