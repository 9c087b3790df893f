//! REST API server for the audit and telemetry pipeline
//!
//! Streams agent runs over SSE, accepts telemetry from remote agents, and
//! exposes the ledger tip, verification and reasoning traces.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::agents::{create_remote_registry, AgentRegistry};
use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::ledger::{HashChainLedger, JsonlLedgerStore};
use crate::models::{next_event_id, AgentStatus, AuditClass, Step};
use crate::stream::{RunRequest, SseStreamGenerator};
use crate::telemetry::{build_telemetry_store, EventBus, LedgerRecorder};
use crate::trace::TraceAggregator;
use crate::verify::IntegrityVerifier;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AnalyzeRequest {
    /// Correlation id for the run; generated when absent.
    pub request_id: Option<String>,
    /// Agents to run, in order.
    pub agents: Vec<String>,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EmitRequest {
    pub correlation_id: String,
    pub agent_name: String,
    pub status: AgentStatus,
    pub step: Option<Step>,
    pub audit_class: Option<AuditClass>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

fn error_status(error: &PipelineError) -> StatusCode {
    match error {
        PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::UnknownAgent(_) => StatusCode::BAD_REQUEST,
        PipelineError::RunInProgress(_) => StatusCode::CONFLICT,
        PipelineError::Canonicalization(_) => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::AuditUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(error: PipelineError) -> (StatusCode, Json<ApiResponse>) {
    (error_status(&error), Json(ApiResponse::error(error.to_string())))
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub bus: EventBus,
    pub ledger: Arc<HashChainLedger>,
    pub generator: Arc<SseStreamGenerator>,
    pub traces: Arc<TraceAggregator>,
    pub agents: Arc<AgentRegistry>,
    pub verifier: Arc<IntegrityVerifier>,
}

impl ApiState {
    /// Wire the pipeline from configuration: file-backed ledger, bus with
    /// ledger recorder and telemetry store, generator, trace aggregator.
    pub async fn from_config(config: &AppConfig) -> crate::Result<Self> {
        let store = Arc::new(JsonlLedgerStore::open(&config.ledger_dir).await?);
        let ledger = Arc::new(HashChainLedger::open(store, config.ledger.clone()).await?);

        let telemetry_store = build_telemetry_store(config.database_url.as_deref());
        let bus = EventBus::builder()
            .capacity(config.subscriber_capacity)
            .audit_sink(
                Arc::new(LedgerRecorder::new(ledger.clone())),
                config.audit_policy,
            )
            .persist_to(telemetry_store.clone())
            .build();

        let agents = match &config.specialist_api_base_url {
            Some(base_url) => create_remote_registry(
                base_url,
                &config.specialist_agents,
                config.agent_request_timeout,
            )?,
            None => {
                warn!("SPECIALIST_API_BASE_URL is not configured; no agents registered");
                AgentRegistry::new()
            }
        };
        info!("Registered agents: {:?}", agents.list());

        Ok(Self {
            generator: Arc::new(SseStreamGenerator::new(bus.clone(), config.stream.clone())),
            traces: Arc::new(TraceAggregator::new(telemetry_store).with_ledger(ledger.clone())),
            agents: Arc::new(agents),
            verifier: Arc::new(IntegrityVerifier::new()),
            bus,
            ledger,
        })
    }
}

/// =============================
/// Health Endpoint
/// =============================

async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let audit_available = !state.ledger.is_degraded() && !state.bus.is_degraded();
    Json(serde_json::json!({
        "status": if audit_available { "healthy" } else { "degraded" },
        "audit_available": audit_available,
        "ledger_tip": state.ledger.tip_commitment().await,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Streaming Endpoint
/// =============================

async fn analyze(State(state): State<ApiState>, Json(req): Json<AnalyzeRequest>) -> Response {
    if req.agents.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("at least one agent is required".to_string())),
        )
            .into_response();
    }

    let agents = match state.agents.resolve(&req.agents) {
        Ok(agents) => agents,
        Err(e) => return failure(e).into_response(),
    };

    let request_id = req
        .request_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| next_event_id().to_string());
    info!("Starting run {} with agents {:?}", request_id, req.agents);

    let stream = match state.generator.start(RunRequest {
        correlation_id: request_id.clone(),
        input: req.input,
        agents,
    }) {
        Ok(stream) => stream,
        Err(e) => return failure(e).into_response(),
    };

    let mut response = Response::new(Body::from_stream(stream.into_wire_stream()));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert("x-request-id", value);
    }
    response
}

/// =============================
/// Telemetry Endpoints
/// =============================

async fn get_trace(State(state): State<ApiState>, Path(request_id): Path<String>) -> Response {
    match state.traces.get_trace(&request_id).await {
        Ok(trace) => Json(trace).into_response(),
        Err(e) => failure(e).into_response(),
    }
}

async fn emit_telemetry(
    State(state): State<ApiState>,
    Json(req): Json<EmitRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let result = match req.audit_class {
        Some(class) => {
            state
                .bus
                .emit_classified(&req.correlation_id, &req.agent_name, req.status, req.step, class)
                .await
        }
        None => {
            state
                .bus
                .emit(&req.correlation_id, &req.agent_name, req.status, req.step)
                .await
        }
    };

    match result {
        Ok(delivered) => (
            StatusCode::ACCEPTED,
            Json(ApiResponse::success(serde_json::json!({ "delivered": delivered }))),
        ),
        Err(e) => failure(e),
    }
}

/// =============================
/// Ledger Endpoints
/// =============================

async fn ledger_tip(State(state): State<ApiState>) -> (StatusCode, Json<ApiResponse>) {
    (
        StatusCode::OK,
        Json(ApiResponse::success(state.ledger.tip_commitment().await)),
    )
}

async fn ledger_verify(State(state): State<ApiState>) -> (StatusCode, Json<ApiResponse>) {
    match state.verifier.verify(&state.ledger).await {
        Ok(report) => {
            if !report.ok {
                warn!(
                    "Ledger verification failed at sequence {:?}: {:?}",
                    report.first_bad_sequence, report.reason
                );
            }
            (StatusCode::OK, Json(ApiResponse::success(report)))
        }
        Err(e) => failure(e),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/analyze", post(analyze))
        .route("/telemetry/trace/:request_id", get(get_trace))
        .route("/api/telemetry/emit", post(emit_telemetry))
        .route("/api/ledger/tip", get(ledger_tip))
        .route("/api/ledger/verify", get(ledger_verify))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    state: ApiState,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::{HangingAgent, ScriptedAgent};
    use crate::stream::StreamConfig;
    use crate::telemetry::{AuditPolicy, InMemoryTelemetryStore};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_state() -> ApiState {
        let ledger = Arc::new(HashChainLedger::in_memory().await.unwrap());
        let store = Arc::new(InMemoryTelemetryStore::new());
        let bus = EventBus::builder()
            .audit_sink(
                Arc::new(LedgerRecorder::new(ledger.clone())),
                AuditPolicy::default(),
            )
            .persist_to(store.clone())
            .build();

        let mut agents = AgentRegistry::new();
        agents.register(Arc::new(ScriptedAgent::new("quant_agent", &["buy", "hold"])));
        agents.register(Arc::new(ScriptedAgent::new("risk_agent", &["ok"])));
        agents.register(Arc::new(HangingAgent {
            name: "slow_agent".to_string(),
            released: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }));

        ApiState {
            generator: Arc::new(SseStreamGenerator::new(bus.clone(), StreamConfig::default())),
            traces: Arc::new(TraceAggregator::new(store).with_ledger(ledger.clone())),
            agents: Arc::new(agents),
            verifier: Arc::new(IntegrityVerifier::new()),
            bus,
            ledger,
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_audit_state() {
        let router = create_router(test_state().await);
        let response = router.oneshot(get_request("/health")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["audit_available"], true);
        assert_eq!(body["ledger_tip"]["sequence_no"], 0);
    }

    #[tokio::test]
    async fn test_analyze_streams_sse_frames() {
        let state = test_state().await;
        let router = create_router(state.clone());
        let request = post_json(
            "/api/analyze",
            serde_json::json!({
                "request_id": "req-42",
                "agents": ["quant_agent", "risk_agent"],
                "input": {"ticker": "ACME"}
            }),
        );

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(response.headers()["x-accel-buffering"], "no");

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let events: Vec<&str> = text
            .lines()
            .filter_map(|line| line.strip_prefix("event: "))
            .collect();
        assert_eq!(events.first(), Some(&"RUN_STARTED"));
        assert_eq!(events.last(), Some(&"RUN_FINISHED"));
        assert_eq!(events.iter().filter(|e| **e == "STEP_STARTED").count(), 2);

        let trace = state.traces.get_trace("req-42").await.unwrap();
        assert!(trace.complete);
    }

    #[tokio::test]
    async fn test_analyze_rejects_unknown_agent() {
        let router = create_router(test_state().await);
        let request = post_json(
            "/api/analyze",
            serde_json::json!({ "agents": ["macro_agent"] }),
        );

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_analyze_rejects_request_id_already_streaming() {
        let state = test_state().await;
        let body = serde_json::json!({
            "request_id": "req-dup",
            "agents": ["slow_agent"]
        });

        let first = create_router(state.clone())
            .oneshot(post_json("/api/analyze", body.clone()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = create_router(state.clone())
            .oneshot(post_json("/api/analyze", body))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        let error = body_json(second).await;
        assert_eq!(error["success"], false);

        drop(first);
        for _ in 0..50 {
            if !state.generator.is_live("req-dup") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!state.generator.is_live("req-dup"));
    }

    #[tokio::test]
    async fn test_trace_not_found() {
        let router = create_router(test_state().await);
        let response = router
            .oneshot(get_request("/telemetry/trace/unknown"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_emit_then_trace() {
        let state = test_state().await;
        let request = post_json(
            "/api/telemetry/emit",
            serde_json::json!({
                "correlation_id": "req-7",
                "agent_name": "risk_agent",
                "status": "ready",
                "step": {"action": "assessment", "content": {"var_95": "0.02"}}
            }),
        );
        let response = create_router(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = create_router(state)
            .oneshot(get_request("/telemetry/trace/req-7"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["request_id"], "req-7");
        assert_eq!(body["complete"], false);
        assert_eq!(body["events"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_emit_rejects_monetary_float() {
        let router = create_router(test_state().await);
        let request = post_json(
            "/api/telemetry/emit",
            serde_json::json!({
                "correlation_id": "req-8",
                "agent_name": "execution_agent",
                "status": "ready",
                "audit_class": "trade_execution",
                "step": {"action": "order", "content": {"price": 101.5}}
            }),
        );

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_ledger_tip_and_verify() {
        let state = test_state().await;
        state
            .bus
            .emit("req-9", "risk_agent", AgentStatus::Ready, None)
            .await
            .unwrap();

        let response = create_router(state.clone())
            .oneshot(get_request("/api/ledger/tip"))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["data"]["sequence_no"], 1);
        assert_eq!(body["data"]["hash"], state.ledger.tip().await);

        let response = create_router(state)
            .oneshot(get_request("/api/ledger/verify"))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["data"]["ok"], true);
        assert_eq!(body["data"]["entries_checked"], 2);
    }
}
