//! REST API
//!
//! JSON over HTTP for rule authoring, activation, manual runs, history and
//! device telemetry ingress.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use rulegraph_automation::{ValidationError, ValidationResult};
use rulegraph_core::{AutomationRule, DeviceEvent, ExecutionRecord, Graph, TimeRange};
use rulegraph_recorder::Metrics;
use rulegraph_state_store::DeviceStateStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::engine::{AutomationEngine, RunSubmission};
use crate::error::EngineError;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: AutomationEngine,
    pub states: Arc<DeviceStateStore>,
}

/// Error body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<ValidationError>>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            message: message.into(),
            errors: None,
        }),
    )
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            EngineError::Rule(_) | EngineError::Trigger { .. } => StatusCode::BAD_REQUEST,
            EngineError::RunDropped { .. } => StatusCode::CONFLICT,
            EngineError::Storage(e) => {
                error!("Storage failure: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(ErrorResponse {
                message: err.to_string(),
                errors: err.validation_errors().map(<[_]>::to_vec),
            }),
        )
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    rules: usize,
    busy_rules: usize,
}

#[derive(Debug, Default, Deserialize)]
struct DeleteParams {
    #[serde(default)]
    archive: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub rule_id: String,
    pub archived_records: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeactivateResponse {
    pub rule: AutomationRule,
    pub was_active: bool,
}

/// Body of `POST /api/rules/:rule_id/run`
#[derive(Debug, Default, Deserialize)]
pub struct RunBody {
    #[serde(default)]
    pub payload: Value,
    /// Hold the response until the run finishes
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunResponse {
    pub run_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<ExecutionRecord>,
}

/// Body of `POST /api/devices/:device_id/state`
#[derive(Debug, Deserialize)]
pub struct DeviceStateBody {
    pub parameter: String,
    pub value: Value,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_check))
        // Rules
        .route("/api/rules", get(list_rules).post(upsert_rule))
        .route("/api/rules/:rule_id", get(get_rule).delete(delete_rule))
        .route("/api/rules/:rule_id/graph", put(update_graph))
        .route("/api/validate", post(validate_rule_body))
        .route("/api/rules/:rule_id/validate", post(validate_rule))
        .route("/api/rules/:rule_id/activate", post(activate_rule))
        .route("/api/rules/:rule_id/deactivate", post(deactivate_rule))
        .route("/api/rules/:rule_id/run", post(run_rule))
        // History
        .route("/api/rules/:rule_id/history", get(get_history))
        .route("/api/rules/:rule_id/metrics", get(get_rule_metrics))
        .route("/api/metrics", get(get_metrics))
        // Telemetry
        .route("/api/devices/:device_id/state", post(report_device_state))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the API server
pub async fn start_server(state: AppState, addr: std::net::SocketAddr) -> std::io::Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API server listening on {}", addr);
    axum::serve(listener, router).await
}

// ==================== Handlers ====================

/// GET /api/health
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        rules: state.engine.rules().len(),
        busy_rules: state.engine.busy_rules(),
    })
}

/// GET /api/rules
async fn list_rules(State(state): State<AppState>) -> Json<Vec<AutomationRule>> {
    Json(state.engine.rules())
}

/// POST /api/rules - create or replace a rule
async fn upsert_rule(
    State(state): State<AppState>,
    Json(rule): Json<AutomationRule>,
) -> ApiResult<AutomationRule> {
    Ok(Json(state.engine.upsert_rule(rule).await?))
}

/// GET /api/rules/:rule_id
async fn get_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
) -> ApiResult<AutomationRule> {
    state
        .engine
        .get_rule(&rule_id)
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("rule not found: {rule_id}")))
}

/// DELETE /api/rules/:rule_id?archive=true
async fn delete_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
    Query(params): Query<DeleteParams>,
) -> ApiResult<DeleteResponse> {
    let deletion = state.engine.delete_rule(&rule_id, params.archive).await?;
    Ok(Json(DeleteResponse {
        rule_id,
        archived_records: deletion.archived.len(),
        archive_path: deletion.archive_path,
    }))
}

/// PUT /api/rules/:rule_id/graph
async fn update_graph(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
    Json(graph): Json<Graph>,
) -> ApiResult<AutomationRule> {
    let update = state.engine.update_graph(&rule_id, graph).await?;
    Ok(Json(update.rule))
}

/// POST /api/validate - validate a rule without storing it
async fn validate_rule_body(
    State(state): State<AppState>,
    Json(rule): Json<AutomationRule>,
) -> Json<ValidationResult> {
    Json(state.engine.validate(&rule))
}

/// POST /api/rules/:rule_id/validate
async fn validate_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
) -> ApiResult<ValidationResult> {
    Ok(Json(state.engine.validate_rule(&rule_id)?))
}

/// POST /api/rules/:rule_id/activate
async fn activate_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
) -> ApiResult<AutomationRule> {
    Ok(Json(state.engine.activate(&rule_id).await?))
}

/// POST /api/rules/:rule_id/deactivate
async fn deactivate_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
) -> ApiResult<DeactivateResponse> {
    let was_active = state.engine.deactivate(&rule_id).await?;
    let rule = state
        .engine
        .get_rule(&rule_id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("rule not found: {rule_id}")))?;
    Ok(Json(DeactivateResponse { rule, was_active }))
}

/// POST /api/rules/:rule_id/run
async fn run_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
    body: Option<Json<RunBody>>,
) -> ApiResult<RunResponse> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let submission = state.engine.run_now(&rule_id, body.payload)?;

    let run_id = submission.run_id().to_string();
    let status = submission.status().to_string();
    let (handle, position) = match submission {
        RunSubmission::Started(handle) => (handle, None),
        RunSubmission::Queued { handle, position } => (handle, Some(position)),
        RunSubmission::Rejected { reason, .. } => {
            return Err(api_error(StatusCode::CONFLICT, reason));
        }
    };

    let record = if body.wait {
        Some(handle.wait().await?)
    } else {
        None
    };
    Ok(Json(RunResponse {
        run_id,
        status,
        position,
        record,
    }))
}

/// GET /api/rules/:rule_id/history?start=...&end=...
async fn get_history(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
    Query(range): Query<TimeRange>,
) -> ApiResult<Vec<ExecutionRecord>> {
    if state.engine.get_rule(&rule_id).is_none() {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("rule not found: {rule_id}"),
        ));
    }
    Ok(Json(state.engine.get_history(&rule_id, &range)))
}

/// GET /api/metrics
async fn get_metrics(State(state): State<AppState>) -> Json<Metrics> {
    Json(state.engine.get_metrics(None))
}

/// GET /api/rules/:rule_id/metrics
async fn get_rule_metrics(
    State(state): State<AppState>,
    Path(rule_id): Path<String>,
) -> ApiResult<Metrics> {
    if state.engine.get_rule(&rule_id).is_none() {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("rule not found: {rule_id}"),
        ));
    }
    Ok(Json(state.engine.get_metrics(Some(&rule_id))))
}

/// POST /api/devices/:device_id/state
async fn report_device_state(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(body): Json<DeviceStateBody>,
) -> Json<DeviceEvent> {
    Json(state.states.report(&device_id, &body.parameter, body.value))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::collaborators::{BusDeviceCommander, LogDataSink, LogNotifier};
    use crate::engine::EngineOptions;
    use axum::body::Body;
    use axum::http::Request;
    use rulegraph_core::{Edge, Node, RuleStatus, RunStatus, TriggerMatch};
    use rulegraph_event_bus::EventBus;
    use rulegraph_executor::Collaborators;
    use serde_json::json;
    use tower::ServiceExt;

    fn create_test_state() -> AppState {
        let event_bus = Arc::new(EventBus::new());
        let states = Arc::new(DeviceStateStore::new(event_bus.clone()));
        let collaborators = Collaborators::new(
            Arc::new(BusDeviceCommander::new(event_bus.clone())),
            Arc::new(LogNotifier),
            Arc::new(LogDataSink),
            states.clone(),
        );
        let engine =
            AutomationEngine::new(event_bus, collaborators, None, EngineOptions::default());
        AppState { engine, states }
    }

    fn lamp_rule(id: &str) -> AutomationRule {
        AutomationRule::new(
            id,
            "Lamp on motion",
            Graph::new(
                vec![
                    Node::device_trigger("t", "motion_1", "motion", TriggerMatch::default()),
                    Node::action("a", "lamp", "power", json!("on")),
                ],
                vec![Edge::new("t", "a")],
            ),
        )
    }

    async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = create_router(create_test_state());
        let (status, body) = send(app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["rules"], 0);
        assert_eq!(body["busy_rules"], 0);
    }

    #[tokio::test]
    async fn test_create_and_get_rule() {
        let state = create_test_state();
        let rule = serde_json::to_value(lamp_rule("hall")).unwrap();

        let (status, body) = send(create_router(state.clone()), "POST", "/api/rules", Some(rule)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "hall");

        let (status, body) = send(create_router(state.clone()), "GET", "/api/rules/hall", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "Lamp on motion");

        let (status, body) = send(create_router(state), "GET", "/api/rules", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_rule_is_404() {
        let state = create_test_state();
        let (status, body) = send(create_router(state.clone()), "GET", "/api/rules/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["message"].as_str().unwrap().contains("nope"));

        let (status, _) = send(create_router(state), "POST", "/api/rules/nope/activate", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_activate_invalid_rule_returns_errors() {
        let state = create_test_state();
        let mut rule = lamp_rule("broken");
        rule.graph.edges.clear();
        state.engine.upsert_rule(rule).await.unwrap();

        let (status, body) =
            send(create_router(state.clone()), "POST", "/api/rules/broken/activate", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let codes: Vec<&str> = body["errors"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["code"].as_str().unwrap())
            .collect();
        assert!(codes.contains(&"orphan_node"));
        assert_eq!(
            state.engine.get_rule("broken").unwrap().status,
            RuleStatus::Error
        );
    }

    #[tokio::test]
    async fn test_validate_without_storing() {
        let state = create_test_state();
        let mut rule = lamp_rule("draft");
        rule.graph.nodes.retain(|n| n.id.as_str() != "a");
        rule.graph.edges.clear();

        let (status, body) = send(
            create_router(state.clone()),
            "POST",
            "/api/validate",
            Some(serde_json::to_value(rule).unwrap()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], false);
        assert_eq!(body["errors"][0]["code"], "missing_action");
        assert!(state.engine.get_rule("draft").is_none());
    }

    #[tokio::test]
    async fn test_activate_and_deactivate() {
        let state = create_test_state();
        state.engine.upsert_rule(lamp_rule("hall")).await.unwrap();

        let (status, body) =
            send(create_router(state.clone()), "POST", "/api/rules/hall/activate", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "active");

        let (status, body) =
            send(create_router(state.clone()), "POST", "/api/rules/hall/deactivate", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["was_active"], true);
        assert_eq!(body["rule"]["status"], "inactive");
    }

    #[tokio::test]
    async fn test_run_and_history() {
        let state = create_test_state();
        state.engine.upsert_rule(lamp_rule("hall")).await.unwrap();

        let (status, body) = send(
            create_router(state.clone()),
            "POST",
            "/api/rules/hall/run",
            Some(json!({"payload": {"value": true}, "wait": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "started");
        assert_eq!(body["record"]["status"], "completed");

        let (status, body) =
            send(create_router(state.clone()), "GET", "/api/rules/hall/history", None).await;
        assert_eq!(status, StatusCode::OK);
        let records: Vec<ExecutionRecord> = serde_json::from_value(body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RunStatus::Completed);

        let (status, body) = send(create_router(state), "GET", "/api/rules/hall/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_executions"], 1);
        assert_eq!(body["success_count"], 1);
    }

    #[tokio::test]
    async fn test_run_invalid_rule_is_400() {
        let state = create_test_state();
        let mut rule = lamp_rule("broken");
        rule.graph.edges.clear();
        state.engine.upsert_rule(rule).await.unwrap();

        let (status, body) = send(create_router(state), "POST", "/api/rules/broken/run", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["errors"].is_array());
    }

    #[tokio::test]
    async fn test_update_graph_deactivates() {
        let state = create_test_state();
        let mut rule = lamp_rule("hall");
        rule.status = RuleStatus::Active;
        state.engine.upsert_rule(rule).await.unwrap();

        let graph = serde_json::to_value(lamp_rule("hall").graph).unwrap();
        let (status, body) =
            send(create_router(state), "PUT", "/api/rules/hall/graph", Some(graph)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "inactive");
        assert_eq!(body["metadata"]["version"], 2);
    }

    #[tokio::test]
    async fn test_delete_rule() {
        let state = create_test_state();
        state.engine.upsert_rule(lamp_rule("hall")).await.unwrap();
        let handle = state
            .engine
            .run_now("hall", Value::Null)
            .unwrap()
            .into_handle()
            .unwrap();
        handle.wait().await.unwrap();

        let (status, body) = send(
            create_router(state.clone()),
            "DELETE",
            "/api/rules/hall?archive=true",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["archived_records"], 1);
        // No storage configured, nothing written
        assert!(body.get("archive_path").is_none());

        let (status, _) = send(create_router(state), "GET", "/api/rules/hall", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_report_device_state() {
        let state = create_test_state();
        let (status, body) = send(
            create_router(state.clone()),
            "POST",
            "/api/devices/thermo_1/state",
            Some(json!({"parameter": "temperature", "value": 21.5})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["device_id"], "thermo_1");
        assert_eq!(
            state.states.get("thermo_1", "temperature"),
            Some(json!(21.5))
        );
    }
}
