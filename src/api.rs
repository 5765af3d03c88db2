//! HTTP ingress. Thin translation layer: every handler delegates to a
//! component method and maps `CoreError` to a status code. No business
//! logic lives here.

use crate::action::{ActionGateway, ActionRequest};
use crate::error::CoreError;
use crate::event_bus::EventBus;
use crate::gateway::ApiGateway;
use crate::incident::IncidentLog;
use crate::registry::ServiceRegistry;
use crate::types::{Tier, TraceId};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;

/// Shared handles every route needs. Each field is itself already an `Arc`
/// over a single-owner component — this struct never grows a lock of its
/// own.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ServiceRegistry>,
    pub gateway: Arc<ApiGateway>,
    pub actions: Arc<ActionGateway>,
    pub incidents: Arc<IncidentLog>,
    pub events: Arc<EventBus>,
}

/// Maps the internal error taxonomy to HTTP status.
pub fn to_status(err: &CoreError) -> StatusCode {
    match err {
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::Busy(_) => StatusCode::TOO_MANY_REQUESTS,
        CoreError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        CoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::ContractViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        CoreError::RollbackFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        CoreError::ConfigError(_) => StatusCode::BAD_REQUEST,
        CoreError::Denied(_) => StatusCode::FORBIDDEN,
        CoreError::Io(_) | CoreError::Serialization(_) | CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(err: CoreError) -> Response {
    let status = to_status(&err);
    (status, Json(ErrorBody { error: err.to_string() })).into_response()
}

#[derive(Deserialize)]
pub struct SubmitActionBody {
    pub action_type: String,
    pub proposer: String,
    pub params: serde_json::Value,
    pub declared_tier: Tier,
    pub justification: String,
    pub risk_tag: Option<String>,
}

/// Honors a caller-supplied `X-Trace-Id` so retried submissions land on the
/// same trace and hit the idempotency path in `ActionGateway::submit`
/// instead of minting a fresh action each time.
fn trace_id_from_headers(headers: &HeaderMap) -> TraceId {
    headers
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| uuid::Uuid::parse_str(s).ok())
        .map(TraceId)
        .unwrap_or_else(TraceId::new)
}

async fn submit_action(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<SubmitActionBody>) -> Response {
    let request = ActionRequest {
        trace_id: trace_id_from_headers(&headers),
        action_type: body.action_type,
        proposer: body.proposer,
        params: body.params,
        declared_tier: body.declared_tier,
        justification: body.justification,
        risk_tag: body.risk_tag,
    };
    match state.actions.submit(request).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
pub struct ApprovalBody {
    pub approver: String,
}

/// `Busy` from the approval endpoints always means "this approval is no
/// longer open" (already resolved, or its window expired) rather than the
/// backpressure/rate-limit sense `to_status` assumes elsewhere, so it maps
/// to 409 Conflict here instead of the generic 429.
fn approval_error_response(err: CoreError) -> Response {
    match err {
        CoreError::Busy(msg) => (StatusCode::CONFLICT, Json(ErrorBody { error: msg })).into_response(),
        other => error_response(other),
    }
}

async fn approve_action(State(state): State<AppState>, Path(trace_id): Path<uuid::Uuid>, Json(body): Json<ApprovalBody>) -> Response {
    match state.actions.approve(TraceId(trace_id), &body.approver).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => approval_error_response(e),
    }
}

async fn reject_action(State(state): State<AppState>, Path(trace_id): Path<uuid::Uuid>, Json(body): Json<ApprovalBody>) -> Response {
    match state.actions.reject(TraceId(trace_id), &body.approver).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => approval_error_response(e),
    }
}

async fn pending_actions(State(state): State<AppState>) -> Response {
    Json(serde_json::json!({"pending_count": state.actions.pending_count().await})).into_response()
}

async fn mesh_topology(State(state): State<AppState>) -> Response {
    Json(state.registry.list_all().await).into_response()
}

async fn mesh_health(State(state): State<AppState>) -> Response {
    Json(state.registry.health_summary().await).into_response()
}

async fn circuit_breakers(State(state): State<AppState>) -> Response {
    let snapshot = state.gateway.circuit_snapshot().await;
    let body: Vec<_> = snapshot
        .into_iter()
        .map(|(id, capability, circuit_state)| serde_json::json!({"instance_id": id.0, "capability": capability, "state": format!("{circuit_state:?}")}))
        .collect();
    Json(body).into_response()
}

#[derive(Deserialize)]
struct IncidentsQuery {
    window: Option<String>,
}

fn parse_window(raw: Option<&str>) -> chrono::Duration {
    match raw {
        Some("1h") => chrono::Duration::hours(1),
        Some("7d") => chrono::Duration::days(7),
        _ => chrono::Duration::hours(24),
    }
}

async fn incidents(State(state): State<AppState>, Query(query): Query<IncidentsQuery>) -> Response {
    let window = parse_window(query.window.as_deref());
    let aggregate = state.incidents.aggregate(window).await;
    let open = state.incidents.list_open().await;
    Json(serde_json::json!({"aggregate": aggregate, "open": open})).into_response()
}

async fn event_stream(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let subscription = state.events.subscribe(Arc::new(|_event| true), crate::event_bus::DeliveryMode::BestEffort).await;
    let stream = stream::unfold(subscription, |mut sub| async move { sub.recv().await.map(|event| (event, sub)) })
        .map(|event| Ok(SseEvent::default().event(event.event_type.clone()).data(serde_json::to_string(&event).unwrap_or_default())));
    Sse::new(stream)
}

/// Builds the router with CORS permissive for all origins, matching an
/// ingress fronted by its own reverse proxy.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/actions", post(submit_action))
        .route("/api/actions/:trace_id/approve", post(approve_action))
        .route("/api/actions/:trace_id/reject", post(reject_action))
        .route("/api/actions/pending", get(pending_actions))
        .route("/api/mesh/topology", get(mesh_topology))
        .route("/api/mesh/health", get(mesh_health))
        .route("/api/gateway/circuit-breakers", get(circuit_breakers))
        .route("/api/guardian/incidents", get(incidents))
        .route("/api/events/stream", get(event_stream))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}
