//! HTTP API
//!
//! Routes under `/api`:
//! - Clusters and devices: desired-state CRUD
//! - Sync: preview / execute, kill-all, container status
//! - Rules: apply, batch apply, reset, restore
//! - Traffic: iperf3 bandwidth tests
//! - Metrics: latest snapshot and an SSE stream

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{Request, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{delete, get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, info_span, warn, Span};
use uuid::Uuid;

use super::error::ApiError;
use super::state::AppState;
use crate::metrics::MetricsSnapshot;
use crate::rules::{ActiveRule, ApplyReport, BatchReport, ResetAllReport, ResetOutcome, RestoreReport};
use crate::runtime::{TrafficRequest, TrafficSession};
use crate::shaping::BandwidthRule;
use crate::store::{Cluster, ClusterUpdate, Device, NewCluster, NewDevice};
use crate::sync::{KillSummary, SyncPreview, SyncResult, SyncScope, TeardownReport};

type ApiResult<T> = Result<T, ApiError>;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(api_health))
        // Clusters
        .route("/clusters", get(list_clusters).post(create_cluster))
        .route(
            "/clusters/{id}",
            get(get_cluster).put(update_cluster).delete(delete_cluster),
        )
        .route("/clusters/{id}/activate", post(activate_cluster))
        .route("/clusters/{id}/deactivate", post(deactivate_cluster))
        .route(
            "/clusters/{id}/devices",
            get(list_cluster_devices).post(create_device),
        )
        // Devices
        .route("/devices", get(list_devices))
        .route("/devices/{id}", get(get_device).delete(delete_device))
        .route("/devices/{id}/start", post(start_device))
        .route("/devices/{id}/stop", post(stop_device))
        // Sync
        .route("/sync/preview", get(sync_preview))
        .route("/sync/execute", post(sync_execute))
        .route("/containers/kill-all", post(kill_all))
        .route("/containers/status", get(container_status))
        // Rules
        .route("/rules", get(list_rules))
        .route("/rules/apply", post(apply_rule))
        .route("/rules/apply-batch", post(apply_batch))
        .route("/rules/reset", post(reset_rules))
        .route("/rules/restore", post(restore_rules))
        .route("/rules/{client}", delete(reset_client))
        // Traffic
        .route("/traffic/start", post(start_traffic))
        .route("/traffic/stop", post(stop_traffic))
        .route("/traffic/status", get(traffic_status))
        // Metrics
        .route("/metrics/current", get(current_metrics))
        .route("/metrics/stream", get(metrics_stream));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api)
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Span per request, tagged with the caller's `x-request-id` or a fresh one
fn request_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);
    info_span!(
        "request",
        id = %request_id,
        method = %request.method(),
        uri = %request.uri()
    )
}

/// Generic success/failure payload
#[derive(Debug, Serialize, Deserialize)]
pub struct OperationStatus {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl OperationStatus {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

// ============================================================================
// Health
// ============================================================================

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

async fn api_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "netshaper",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============================================================================
// Clusters
// ============================================================================

async fn list_clusters(State(state): State<AppState>) -> Json<Vec<Cluster>> {
    Json(state.store.list_clusters().await)
}

async fn create_cluster(
    State(state): State<AppState>,
    Json(req): Json<NewCluster>,
) -> ApiResult<(StatusCode, Json<Cluster>)> {
    let cluster = state.store.create_cluster(req).await?;
    Ok((StatusCode::CREATED, Json(cluster)))
}

async fn get_cluster(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult<Json<Cluster>> {
    Ok(Json(state.store.get_cluster(id).await?))
}

async fn update_cluster(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(req): Json<ClusterUpdate>,
) -> ApiResult<Json<Cluster>> {
    Ok(Json(state.store.update_cluster(id, req).await?))
}

#[derive(Serialize)]
struct TeardownResponse {
    success: bool,
    message: String,
    #[serde(flatten)]
    report: TeardownReport,
}

async fn delete_cluster(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Json<TeardownResponse>> {
    let report = state.reconciler.delete_cluster(id).await?;
    for error in &report.teardown_errors {
        warn!("Cluster {} teardown: {}", id, error);
    }
    Ok(Json(TeardownResponse {
        success: true,
        message: format!("Cluster {} deleted", id),
        report,
    }))
}

async fn activate_cluster(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult<Json<Cluster>> {
    Ok(Json(state.store.set_cluster_active(id, true).await?))
}

async fn deactivate_cluster(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult<Json<Cluster>> {
    Ok(Json(state.store.set_cluster_active(id, false).await?))
}

async fn list_cluster_devices(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Json<Vec<Device>>> {
    Ok(Json(state.store.list_devices(Some(id)).await?))
}

async fn create_device(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(req): Json<NewDevice>,
) -> ApiResult<(StatusCode, Json<Device>)> {
    let device = state.store.create_device(id, req).await?;
    Ok((StatusCode::CREATED, Json(device)))
}

// ============================================================================
// Devices
// ============================================================================

async fn list_devices(State(state): State<AppState>) -> ApiResult<Json<Vec<Device>>> {
    Ok(Json(state.store.list_devices(None).await?))
}

async fn get_device(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult<Json<Device>> {
    Ok(Json(state.store.get_device(id).await?))
}

async fn delete_device(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Json<TeardownResponse>> {
    let report = state.reconciler.delete_device(id).await?;
    Ok(Json(TeardownResponse {
        success: true,
        message: format!("Device {} deleted", id),
        report,
    }))
}

async fn start_device(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult<Json<Device>> {
    Ok(Json(state.reconciler.start_device(id).await?))
}

async fn stop_device(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult<Json<Device>> {
    Ok(Json(state.reconciler.stop_device(id).await?))
}

// ============================================================================
// Sync
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SyncQuery {
    pub cluster_id: Option<u64>,
}

async fn sync_preview(
    State(state): State<AppState>,
    Query(query): Query<SyncQuery>,
) -> ApiResult<Json<SyncPreview>> {
    let scope = SyncScope::from_cluster_id(query.cluster_id);
    Ok(Json(state.reconciler.preview(scope).await?))
}

async fn sync_execute(
    State(state): State<AppState>,
    Query(query): Query<SyncQuery>,
) -> ApiResult<Json<SyncResult>> {
    let scope = SyncScope::from_cluster_id(query.cluster_id);
    let result = state.reconciler.execute(scope).await?;
    info!(
        "Sync of {}: {} ok, {} failed",
        scope, result.success_count, result.error_count
    );
    Ok(Json(result))
}

async fn kill_all(State(state): State<AppState>) -> ApiResult<Json<KillSummary>> {
    Ok(Json(state.reconciler.kill_all().await?))
}

#[derive(Serialize)]
struct ContainerStatusResponse {
    containers: BTreeMap<String, bool>,
}

/// Running flag of the shaping endpoint, the support containers and every
/// device container
async fn container_status(State(state): State<AppState>) -> ApiResult<Json<ContainerStatusResponse>> {
    let mut names = vec![state.settings.router_container.clone()];
    names.extend(state.settings.status_containers.iter().cloned());
    names.extend(
        state
            .store
            .list_devices(None)
            .await?
            .into_iter()
            .map(|d| d.container_name),
    );

    let containers = state
        .reconciler
        .lifecycle()
        .container_status(&names)
        .await?;
    Ok(Json(ContainerStatusResponse { containers }))
}

// ============================================================================
// Rules
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct RuleList<T> {
    pub rules: Vec<T>,
}

async fn list_rules(State(state): State<AppState>) -> Json<RuleList<ActiveRule>> {
    Json(RuleList {
        rules: state.rules.current_rules().await,
    })
}

async fn apply_rule(
    State(state): State<AppState>,
    Json(rule): Json<BandwidthRule>,
) -> ApiResult<Json<ApplyReport>> {
    Ok(Json(state.rules.apply(rule).await?))
}

async fn apply_batch(
    State(state): State<AppState>,
    Json(req): Json<RuleList<BandwidthRule>>,
) -> Json<BatchReport> {
    Json(state.rules.apply_batch(req.rules).await)
}

async fn reset_client(
    State(state): State<AppState>,
    Path(client): Path<String>,
) -> ApiResult<Json<ResetOutcome>> {
    Ok(Json(state.rules.reset_client(&client).await?))
}

async fn reset_rules(State(state): State<AppState>) -> ApiResult<Json<ResetAllReport>> {
    Ok(Json(state.rules.reset_all().await?))
}

async fn restore_rules(State(state): State<AppState>) -> Json<RestoreReport> {
    Json(state.rules.restore().await)
}

// ============================================================================
// Traffic
// ============================================================================

async fn running_device(state: &AppState, client: &str) -> ApiResult<Device> {
    let device = state.store.resolve_client(client).await?;
    if !device.is_running() {
        return Err(ApiError::Unprocessable(format!(
            "Device '{}' is not running",
            device.name
        )));
    }
    Ok(device)
}

async fn start_traffic(
    State(state): State<AppState>,
    Json(req): Json<TrafficRequest>,
) -> ApiResult<Json<TrafficSession>> {
    let device = running_device(&state, &req.client).await?;
    let session = state
        .traffic
        .start(&device, req.duration, req.bandwidth)
        .await?;
    Ok(Json(session))
}

async fn stop_traffic(
    State(state): State<AppState>,
    Json(req): Json<TrafficRequest>,
) -> ApiResult<Json<OperationStatus>> {
    let device = running_device(&state, &req.client).await?;
    let was_running = state.traffic.stop(&device).await?;
    Ok(Json(
        OperationStatus::success(format!("Traffic stopped on {}", device.name))
            .with_details(serde_json::json!({ "client": device.name, "was_running": was_running })),
    ))
}

#[derive(Serialize)]
struct TrafficStatusEntry {
    client: String,
    active: bool,
}

#[derive(Serialize)]
struct TrafficStatusResponse {
    traffic_status: Vec<TrafficStatusEntry>,
}

async fn traffic_status(State(state): State<AppState>) -> ApiResult<Json<TrafficStatusResponse>> {
    let devices = state.store.list_devices(None).await?;
    let traffic_status = state
        .traffic
        .status(&devices)
        .await
        .into_iter()
        .map(|(client, active)| TrafficStatusEntry { client, active })
        .collect();
    Ok(Json(TrafficStatusResponse { traffic_status }))
}

// ============================================================================
// Metrics
// ============================================================================

async fn current_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    let snapshot = state.metrics.borrow().clone();
    Json(snapshot.as_ref().clone())
}

fn metrics_event(snapshot: &MetricsSnapshot) -> Event {
    let data = serde_json::to_string(snapshot).unwrap_or_default();
    Event::default().event("metrics").data(data)
}

/// One `metrics` event per sampler tick, starting with the current snapshot.
/// The stream ends when the sampler stops.
async fn metrics_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.metrics.clone();
    rx.mark_changed();

    let events = stream::unfold(rx, |mut rx| async move {
        rx.changed().await.ok()?;
        let snapshot = rx.borrow_and_update().clone();
        Some((Ok::<_, Infallible>(metrics_event(&snapshot)), rx))
    });

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}
