//! End-to-end executor behavior with recording collaborators

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rulegraph_automation::compile;
use rulegraph_core::{
    AutomationRule, Edge, ExecutionError, ExecutionPolicy, Graph, Node, NodeStatus, Predicate,
    RunError, RunRequest, RunStatus, TimeUnit, TriggerMatch, ValueMatch,
};
use rulegraph_executor::{
    BackoffPolicy, CancelToken, Collaborators, CommandError, CommandResult, DataSink,
    DeviceCommander, Executor, ExecutorSettings, Notifier,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Command {
    device_id: String,
    parameter: String,
    value: Value,
    at: Instant,
}

/// Commander that records calls and can be told to misbehave per device
#[derive(Default)]
struct RecordingCommander {
    commands: Mutex<Vec<Command>>,
    failures_left: Mutex<HashMap<String, u32>>,
    unreachable: Vec<String>,
    hanging: Vec<String>,
}

impl RecordingCommander {
    fn failing(device_id: &str, times: u32) -> Self {
        let commander = Self::default();
        commander
            .failures_left
            .lock()
            .unwrap()
            .insert(device_id.to_string(), times);
        commander
    }

    fn hanging(device_id: &str) -> Self {
        Self {
            hanging: vec![device_id.to_string()],
            ..Default::default()
        }
    }

    fn commands(&self) -> Vec<Command> {
        self.commands.lock().unwrap().clone()
    }

    fn calls_to(&self, device_id: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.device_id == device_id)
            .count()
    }
}

#[async_trait]
impl DeviceCommander for RecordingCommander {
    async fn send_command(
        &self,
        device_id: &str,
        parameter: &str,
        value: &Value,
        _timeout: Duration,
    ) -> CommandResult<()> {
        self.commands.lock().unwrap().push(Command {
            device_id: device_id.to_string(),
            parameter: parameter.to_string(),
            value: value.clone(),
            at: Instant::now(),
        });

        if self.hanging.iter().any(|d| d == device_id) {
            std::future::pending::<()>().await;
        }
        if self.unreachable.iter().any(|d| d == device_id) {
            return Err(CommandError::Unreachable {
                device_id: device_id.to_string(),
            });
        }
        let mut failures = self.failures_left.lock().unwrap();
        if let Some(left) = failures.get_mut(device_id) {
            if *left > 0 {
                *left -= 1;
                return Err(CommandError::Rejected("device busy".into()));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    messages: Mutex<Vec<(String, Vec<String>, String)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, channel: &str, recipients: &[String], message: &str) -> CommandResult<()> {
        self.messages.lock().unwrap().push((
            channel.to_string(),
            recipients.to_vec(),
            message.to_string(),
        ));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSink {
    records: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl DataSink for RecordingSink {
    async fn write(&self, sink: &str, record: Value) -> CommandResult<()> {
        self.records.lock().unwrap().push((sink.to_string(), record));
        Ok(())
    }
}

struct Harness {
    executor: Executor,
    commander: Arc<RecordingCommander>,
    notifier: Arc<RecordingNotifier>,
    sink: Arc<RecordingSink>,
}

fn harness_with(commander: RecordingCommander, devices: Value) -> Harness {
    let commander = Arc::new(commander);
    let notifier = Arc::new(RecordingNotifier::default());
    let sink = Arc::new(RecordingSink::default());
    let collaborators = Collaborators::new(
        commander.clone(),
        notifier.clone(),
        sink.clone(),
        Arc::new(devices),
    );
    let settings = ExecutorSettings {
        backoff: BackoffPolicy::none(),
        ..ExecutorSettings::default()
    };
    Harness {
        executor: Executor::new(collaborators, settings),
        commander,
        notifier,
        sink,
    }
}

fn harness() -> Harness {
    harness_with(RecordingCommander::default(), json!({}))
}

impl Harness {
    async fn run(&self, rule: &AutomationRule, request: RunRequest) -> rulegraph_core::ExecutionRecord {
        let plan = compile(rule).expect("rule compiles");
        self.executor
            .execute(rule, &plan, &request, &CancelToken::new())
            .await
    }
}

fn at(hour: u32, minute: u32) -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 10, hour, minute, 0).unwrap()
}

fn trigger(id: &str) -> Node {
    Node::device_trigger(id, "motion_1", "motion", TriggerMatch::default())
}

fn request(rule: &AutomationRule, trigger: &str) -> RunRequest {
    RunRequest::new(rule.id.clone(), json!({"device_id": "motion_1", "value": true}))
        .from_trigger(trigger)
        .at(at(12, 0))
}

fn hallway_rule() -> AutomationRule {
    AutomationRule::new(
        "hallway_night",
        "Hallway night light",
        Graph::new(
            vec![
                trigger("motion"),
                Node::condition("night", Predicate::time_between("18:00", "06:00")),
                Node::action("dim", "lights.hallway", "brightness", json!(40)),
                Node::timer("hold", 300_000, TimeUnit::Milliseconds),
                Node::action("off", "lights.hallway", "power", json!("off")),
            ],
            vec![
                Edge::new("motion", "night"),
                Edge::new("night", "dim"),
                Edge::new("dim", "hold"),
                Edge::new("hold", "off"),
            ],
        ),
    )
}

#[tokio::test(start_paused = true)]
async fn night_motion_dims_then_turns_off_after_five_minutes() {
    let h = harness();
    let rule = hallway_rule();

    let record = h.run(&rule, request(&rule, "motion").at(at(2, 0))).await;

    assert_eq!(record.status, RunStatus::Completed);
    let commands = h.commander.commands();
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[0].parameter, "brightness");
    assert_eq!(commands[0].value, json!(40));
    assert_eq!(commands[1].parameter, "power");
    assert_eq!(commands[1].value, json!("off"));
    assert_eq!(commands[1].at - commands[0].at, Duration::from_secs(300));
    assert_eq!(record.outcome("night").unwrap().result, Some(true));
}

#[tokio::test(start_paused = true)]
async fn afternoon_motion_fails_condition_and_fires_nothing() {
    let h = harness();
    let rule = hallway_rule();

    let record = h.run(&rule, request(&rule, "motion").at(at(14, 0))).await;

    assert_eq!(record.status, RunStatus::Completed);
    assert!(h.commander.commands().is_empty());
    assert_eq!(record.outcome("night").unwrap().result, Some(false));
    for id in ["dim", "hold", "off"] {
        assert_eq!(record.outcome(id).unwrap().status, NodeStatus::Skipped, "{id}");
    }
}

fn decision_rule() -> AutomationRule {
    AutomationRule::new(
        "climate",
        "Climate",
        Graph::new(
            vec![
                trigger("t"),
                Node::decision(
                    "hot",
                    Predicate::DeviceState {
                        device_id: "thermo".into(),
                        parameter: "temperature".into(),
                        matches: ValueMatch::Above { value: 25.0 },
                    },
                ),
                Node::action("cool", "ac", "power", json!("on")),
                Node::action("heat", "heater", "power", json!("on")),
            ],
            vec![
                Edge::new("t", "hot"),
                Edge::when_true("hot", "cool"),
                Edge::when_false("hot", "heat"),
            ],
        ),
    )
}

#[tokio::test]
async fn decision_takes_exactly_one_branch() {
    for (temperature, expect_cool) in [(30.0, true), (18.0, false)] {
        let h = harness_with(
            RecordingCommander::default(),
            json!({"thermo": {"temperature": temperature}}),
        );
        let rule = decision_rule();
        let record = h.run(&rule, request(&rule, "t")).await;

        assert_eq!(record.status, RunStatus::Completed);
        let cool = record.outcome("cool").unwrap().status;
        let heat = record.outcome("heat").unwrap().status;
        let both = [cool, heat];
        let ran: Vec<_> = both
            .iter()
            .filter(|s| **s == NodeStatus::Completed)
            .collect();
        assert_eq!(ran.len(), 1, "temperature {temperature}");
        assert_eq!(cool == NodeStatus::Completed, expect_cool);
        assert_eq!(h.commander.commands().len(), 1);
    }
}

#[tokio::test]
async fn failing_condition_prunes_only_its_subtree() {
    let h = harness();
    let rule = AutomationRule::new(
        "r",
        "Siblings",
        Graph::new(
            vec![
                trigger("t"),
                Node::condition("never", Predicate::Constant { value: false }),
                Node::action("gated", "lamp.a", "power", json!("on")),
                Node::action("gated_child", "lamp.b", "power", json!("on")),
                Node::action("sibling", "lamp.c", "power", json!("on")),
            ],
            vec![
                Edge::new("t", "never"),
                Edge::new("never", "gated"),
                Edge::new("gated", "gated_child"),
                Edge::new("t", "sibling"),
            ],
        ),
    );

    let record = h.run(&rule, request(&rule, "t")).await;

    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(record.outcome("gated").unwrap().status, NodeStatus::Skipped);
    assert_eq!(record.outcome("gated_child").unwrap().status, NodeStatus::Skipped);
    assert_eq!(record.outcome("sibling").unwrap().status, NodeStatus::Completed);
    assert_eq!(h.commander.calls_to("lamp.c"), 1);
    assert_eq!(h.commander.calls_to("lamp.a"), 0);
}

#[tokio::test]
async fn failing_condition_blocks_joins_with_other_parents() {
    let h = harness();
    let rule = AutomationRule::new(
        "r",
        "Join",
        Graph::new(
            vec![
                trigger("t"),
                Node::condition("never", Predicate::Constant { value: false }),
                Node::action("chime", "chime", "power", json!("on")),
                Node::action("siren", "siren", "power", json!("on")),
                Node::action("after_siren", "strobe", "power", json!("on")),
            ],
            vec![
                Edge::new("t", "never"),
                Edge::new("t", "chime"),
                Edge::new("never", "siren"),
                Edge::new("chime", "siren"),
                Edge::new("siren", "after_siren"),
                Edge::new("chime", "after_siren"),
            ],
        ),
    );

    let record = h.run(&rule, request(&rule, "t")).await;

    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(record.outcome("chime").unwrap().status, NodeStatus::Completed);
    assert_eq!(record.outcome("siren").unwrap().status, NodeStatus::Skipped);
    assert_eq!(record.outcome("after_siren").unwrap().status, NodeStatus::Skipped);
    assert_eq!(h.commander.calls_to("chime"), 1);
    assert_eq!(h.commander.calls_to("siren"), 0);
    assert_eq!(h.commander.calls_to("strobe"), 0);
}

#[tokio::test]
async fn decision_branches_rejoin() {
    let h = harness_with(
        RecordingCommander::default(),
        json!({"thermo": {"temperature": 18.0}}),
    );
    let mut rule = decision_rule();
    rule.graph
        .nodes
        .push(Node::action("report", "display", "text", json!("done")));
    rule.graph.edges.push(Edge::new("cool", "report"));
    rule.graph.edges.push(Edge::new("heat", "report"));

    let record = h.run(&rule, request(&rule, "t")).await;

    assert_eq!(record.outcome("cool").unwrap().status, NodeStatus::Skipped);
    assert_eq!(record.outcome("heat").unwrap().status, NodeStatus::Completed);
    assert_eq!(record.outcome("report").unwrap().status, NodeStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn conditions_after_a_timer_see_state_at_that_point() {
    use rulegraph_event_bus::EventBus;
    use rulegraph_state_store::DeviceStateStore;

    let store = Arc::new(DeviceStateStore::new(Arc::new(EventBus::new())));
    store.report("door", "state", json!("open"));

    let commander = Arc::new(RecordingCommander::default());
    let collaborators = Collaborators::new(
        commander.clone(),
        Arc::new(RecordingNotifier::default()),
        Arc::new(RecordingSink::default()),
        store.clone(),
    );
    let executor = Executor::new(collaborators, ExecutorSettings::default());
    let rule = AutomationRule::new(
        "r",
        "Lock when closed",
        Graph::new(
            vec![
                trigger("t"),
                Node::timer("settle", 10, TimeUnit::Seconds),
                Node::condition(
                    "closed",
                    Predicate::DeviceState {
                        device_id: "door".into(),
                        parameter: "state".into(),
                        matches: ValueMatch::Equals { value: json!("closed") },
                    },
                ),
                Node::condition("late", Predicate::time_between("12:00:10", "13:00")),
                Node::action("lock", "door", "lock", json!(true)),
            ],
            vec![
                Edge::new("t", "settle"),
                Edge::new("settle", "closed"),
                Edge::new("settle", "late"),
                Edge::new("closed", "lock"),
                Edge::new("late", "lock"),
            ],
        ),
    );
    let plan = compile(&rule).unwrap();
    let request = request(&rule, "t");

    let closer = async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        store.report("door", "state", json!("closed"));
    };
    let cancel = CancelToken::new();
    let (record, _) = tokio::join!(executor.execute(&rule, &plan, &request, &cancel), closer);

    assert_eq!(record.outcome("closed").unwrap().result, Some(true));
    assert_eq!(record.outcome("late").unwrap().result, Some(true));
    assert_eq!(record.outcome("lock").unwrap().status, NodeStatus::Completed);
    assert_eq!(commander.calls_to("door"), 1);
}

fn single_action_rule(retry_count: u32, timeout_seconds: u64) -> AutomationRule {
    AutomationRule::new(
        "r",
        "Single",
        Graph::new(
            vec![
                trigger("t"),
                Node::action("a", "lamp", "power", json!("on")),
                Node::timer("after", 1, TimeUnit::Seconds),
            ],
            vec![Edge::new("t", "a"), Edge::new("a", "after")],
        ),
    )
    .with_policy(ExecutionPolicy {
        retry_count,
        timeout_seconds,
        ..ExecutionPolicy::default()
    })
}

#[tokio::test]
async fn retry_budget_is_exact() {
    let h = harness_with(RecordingCommander::failing("lamp", u32::MAX), json!({}));
    let rule = single_action_rule(2, 30);

    let record = h.run(&rule, request(&rule, "t")).await;

    assert_eq!(h.commander.calls_to("lamp"), 3);
    assert_eq!(record.status, RunStatus::Failed);
    let outcome = record.outcome("a").unwrap();
    assert_eq!(outcome.status, NodeStatus::Failed);
    assert_eq!(outcome.attempts, 3);
    match outcome.error.as_ref().unwrap() {
        ExecutionError::RetryExhausted { attempts, last } => {
            assert_eq!(*attempts, 3);
            assert!(matches!(**last, ExecutionError::ActionFailed { .. }));
        }
        other => panic!("unexpected error {other:?}"),
    }
    // Failure prunes dependants
    assert_eq!(record.outcome("after").unwrap().status, NodeStatus::Skipped);
}

#[tokio::test]
async fn no_retries_reports_the_plain_error() {
    let h = harness_with(RecordingCommander::failing("lamp", 1), json!({}));
    let rule = single_action_rule(0, 30);

    let record = h.run(&rule, request(&rule, "t")).await;

    assert_eq!(h.commander.calls_to("lamp"), 1);
    assert!(matches!(
        record.outcome("a").unwrap().error,
        Some(ExecutionError::ActionFailed { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn retry_recovers_after_transient_failure() {
    let h = harness_with(RecordingCommander::failing("lamp", 1), json!({}));
    let rule = single_action_rule(3, 30);

    let record = h.run(&rule, request(&rule, "t")).await;

    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(record.outcome("a").unwrap().attempts, 2);
    assert_eq!(record.outcome("after").unwrap().status, NodeStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn action_timeout_is_enforced() {
    let h = harness_with(RecordingCommander::hanging("lamp"), json!({}));
    let rule = single_action_rule(0, 5);

    let started = Instant::now();
    let record = h.run(&rule, request(&rule, "t")).await;

    assert_eq!(record.status, RunStatus::Failed);
    let outcome = record.outcome("a").unwrap();
    assert_eq!(outcome.status, NodeStatus::Timeout);
    assert_eq!(
        outcome.error,
        Some(ExecutionError::ActionTimeout { timeout_secs: 5 })
    );
    assert_eq!(started.elapsed(), Duration::from_secs(5));
}

#[tokio::test]
async fn unreachable_device_is_reported() {
    let commander = RecordingCommander {
        unreachable: vec!["lamp".into()],
        ..Default::default()
    };
    let h = harness_with(commander, json!({}));
    let rule = single_action_rule(0, 30);

    let record = h.run(&rule, request(&rule, "t")).await;

    assert_eq!(
        record.outcome("a").unwrap().error,
        Some(ExecutionError::DeviceUnreachable {
            device_id: "lamp".into()
        })
    );
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_a_waiting_run() {
    let h = harness();
    let rule = hallway_rule();
    let plan = compile(&rule).unwrap();
    let request = request(&rule, "motion").at(at(2, 0));
    let cancel = CancelToken::new();

    let canceller = {
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            cancel.cancel("rule deactivated");
        }
    };
    let (record, _) = tokio::join!(h.executor.execute(&rule, &plan, &request, &cancel), canceller);

    assert_eq!(record.status, RunStatus::Cancelled);
    assert_eq!(
        record.error,
        Some(RunError::RunCancelled {
            reason: "rule deactivated".into()
        })
    );
    assert_eq!(record.outcome("dim").unwrap().status, NodeStatus::Completed);
    assert_eq!(record.outcome("hold").unwrap().status, NodeStatus::Cancelled);
    assert_eq!(record.outcome("off").unwrap().status, NodeStatus::Cancelled);
    assert_eq!(h.commander.commands().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn run_deadline_times_out() {
    let h = harness();
    let mut rule = hallway_rule();
    rule.policy.run_deadline_seconds = Some(60);

    let record = h.run(&rule, request(&rule, "motion").at(at(2, 0))).await;

    assert_eq!(record.status, RunStatus::Timeout);
    assert_eq!(record.error, Some(RunError::RunTimeout { deadline_secs: 60 }));
    assert_eq!(record.outcome("hold").unwrap().status, NodeStatus::Cancelled);
}

#[tokio::test]
async fn only_the_requesting_trigger_completes() {
    let h = harness();
    let rule = AutomationRule::new(
        "r",
        "Two triggers",
        Graph::new(
            vec![
                trigger("motion"),
                Node::schedule_trigger("nightly", "0 22 * * *"),
                Node::action("a", "lamp", "power", json!("on")),
                Node::action("b", "fan", "power", json!("on")),
            ],
            vec![Edge::new("motion", "a"), Edge::new("nightly", "b")],
        ),
    );

    let record = h.run(&rule, request(&rule, "motion")).await;
    assert_eq!(record.outcome("nightly").unwrap().status, NodeStatus::Skipped);
    assert_eq!(record.outcome("b").unwrap().status, NodeStatus::Skipped);
    assert_eq!(record.outcome("a").unwrap().status, NodeStatus::Completed);

    // Manual runs fire every trigger
    let manual = RunRequest::new(rule.id.clone(), json!({}));
    let record = h.run(&rule, manual).await;
    assert_eq!(record.outcome("a").unwrap().status, NodeStatus::Completed);
    assert_eq!(record.outcome("b").unwrap().status, NodeStatus::Completed);
}

#[tokio::test]
async fn logic_variables_feed_later_stages() {
    let h = harness_with(
        RecordingCommander::default(),
        json!({"presence": {"home": true}}),
    );
    let rule = AutomationRule::new(
        "r",
        "Logic",
        Graph::new(
            vec![
                trigger("t"),
                Node::logic(
                    "occupied",
                    "occupied",
                    Predicate::DeviceState {
                        device_id: "presence".into(),
                        parameter: "home".into(),
                        matches: ValueMatch::Equals { value: json!(true) },
                    },
                ),
                Node::decision(
                    "check",
                    Predicate::Variable {
                        name: "vars.occupied".into(),
                        matches: ValueMatch::Equals { value: json!(true) },
                    },
                ),
                Node::action("welcome", "lamp", "power", json!("on")),
            ],
            vec![
                Edge::new("t", "occupied"),
                Edge::new("occupied", "check"),
                Edge::when_true("check", "welcome"),
            ],
        ),
    );

    let record = h.run(&rule, request(&rule, "t")).await;

    assert_eq!(record.outcome("occupied").unwrap().result, Some(true));
    assert_eq!(record.outcome("welcome").unwrap().status, NodeStatus::Completed);
}

#[tokio::test]
async fn disabled_nodes_pass_through() {
    let h = harness();
    let rule = AutomationRule::new(
        "r",
        "Disabled",
        Graph::new(
            vec![
                trigger("t"),
                Node::action("muted", "siren", "power", json!("on")).disabled(),
                Node::action("lamp", "lamp", "power", json!("on")),
            ],
            vec![Edge::new("t", "muted"), Edge::new("muted", "lamp")],
        ),
    );

    let record = h.run(&rule, request(&rule, "t")).await;

    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(record.outcome("muted").unwrap().status, NodeStatus::Disabled);
    assert_eq!(record.outcome("lamp").unwrap().status, NodeStatus::Completed);
    assert_eq!(h.commander.calls_to("siren"), 0);
}

#[tokio::test]
async fn placeholders_render_into_commands_messages_and_data() {
    let h = harness_with(
        RecordingCommander::default(),
        json!({"thermo": {"temperature": 27}}),
    );
    let rule = AutomationRule::new(
        "r",
        "Templates",
        Graph::new(
            vec![
                trigger("t"),
                Node::action("mirror", "display", "text", json!("{{ devices.thermo.temperature }}")),
                Node::notification(
                    "tell",
                    "push",
                    vec!["owner".into()],
                    "Motion on {{ trigger.device_id }}",
                ),
                Node::new(
                    "log",
                    rulegraph_core::NodeConfig::Data(rulegraph_core::DataConfig {
                        sink: "history".into(),
                        fields: serde_json::from_value(json!({
                            "device": "{{ trigger.device_id }}",
                            "temperature": "{{ devices.thermo.temperature }}"
                        }))
                        .unwrap(),
                    }),
                ),
            ],
            vec![Edge::new("t", "mirror"), Edge::new("t", "tell"), Edge::new("t", "log")],
        ),
    );

    let record = h.run(&rule, request(&rule, "t")).await;

    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(h.commander.commands()[0].value, json!(27));
    let messages = h.notifier.messages.lock().unwrap().clone();
    assert_eq!(messages[0].2, "Motion on motion_1");
    let records = h.sink.records.lock().unwrap().clone();
    assert_eq!(records[0].0, "history");
    assert_eq!(records[0].1, json!({"device": "motion_1", "temperature": 27}));
}

#[tokio::test]
async fn template_errors_fail_without_retry() {
    let h = harness();
    let mut rule = single_action_rule(3, 30);
    rule.graph.nodes[1] = Node::action("a", "lamp", "power", json!("{{ vars.missing }}"));

    let record = h.run(&rule, request(&rule, "t")).await;

    let outcome = record.outcome("a").unwrap();
    assert_eq!(outcome.attempts, 1);
    assert!(matches!(outcome.error, Some(ExecutionError::Template { .. })));
    assert_eq!(h.commander.calls_to("lamp"), 0);
}

#[tokio::test]
async fn stale_plan_is_an_internal_failure() {
    let h = harness();
    let mut rule = hallway_rule();
    let plan = compile(&rule).unwrap();
    rule.replace_graph(rule.graph.clone());

    let record = h
        .executor
        .execute(&rule, &plan, &request(&rule, "motion"), &CancelToken::new())
        .await;

    assert_eq!(record.status, RunStatus::Failed);
    assert!(matches!(record.error, Some(RunError::RunFailed { .. })));
    assert!(h.commander.commands().is_empty());
}

#[tokio::test]
async fn reads_live_device_state_from_the_store() {
    use rulegraph_event_bus::EventBus;
    use rulegraph_state_store::DeviceStateStore;

    let store = Arc::new(DeviceStateStore::new(Arc::new(EventBus::new())));
    store.report("thermo", "temperature", json!(31));

    let commander = Arc::new(RecordingCommander::default());
    let collaborators = Collaborators::new(
        commander.clone(),
        Arc::new(RecordingNotifier::default()),
        Arc::new(RecordingSink::default()),
        store.clone(),
    );
    let executor = Executor::new(collaborators, ExecutorSettings::default());
    let rule = decision_rule();
    let plan = compile(&rule).unwrap();

    let record = executor
        .execute(&rule, &plan, &request(&rule, "t"), &CancelToken::new())
        .await;

    assert_eq!(record.outcome("cool").unwrap().status, NodeStatus::Completed);
    assert_eq!(commander.calls_to("ac"), 1);
    assert_eq!(commander.calls_to("heater"), 0);
}
