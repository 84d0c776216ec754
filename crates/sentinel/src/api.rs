//! HTTP API for health checks, Prometheus metrics and engine management
//!
//! Monitors, webhooks and schedules are managed over `/api/v1`; the probe
//! and metrics endpoints sit at the root for the benefit of orchestrators.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use sentinel_lib::{
    health::{ComponentStatus, HealthRegistry},
    monitor::{MonitorSpec, MonitorSupervisor},
    notify::{ChannelKind, NotificationDispatcher, SeverityFilter, WebhookConfig},
    schedule::{RunKind, Schedule, ScheduleRunner},
    store::RecordStore,
};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health: HealthRegistry,
    pub supervisor: Arc<MonitorSupervisor>,
    pub runner: Arc<ScheduleRunner>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub store: Arc<dyn RecordStore>,
}

fn error_body(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn not_found(message: String) -> Response {
    error_body(StatusCode::NOT_FOUND, message)
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder.encode(&metric_families, &mut buffer).unwrap();

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

async fn list_monitors(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.supervisor.list())
}

async fn start_monitor(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<MonitorSpec>,
) -> Response {
    match state.supervisor.start(spec).await {
        Ok(handle) => (StatusCode::CREATED, Json(handle)).into_response(),
        Err(e) => error_body(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn get_monitor(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.supervisor.get(&id) {
        Some(handle) => Json(handle).into_response(),
        None => not_found(format!("unknown monitor: {id}")),
    }
}

async fn stop_monitor(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.supervisor.stop(&id).await {
        Ok(handle) => Json(handle).into_response(),
        Err(e) => not_found(e.to_string()),
    }
}

/// Findings currently retained, oldest first
async fn list_findings(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.supervisor.active_findings())
}

/// Health rollup over recent findings
async fn health_score(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.supervisor.health_snapshot())
}

#[derive(Debug, Deserialize)]
struct CreateWebhook {
    name: String,
    kind: ChannelKind,
    url: String,
    #[serde(default)]
    filter: SeverityFilter,
    #[serde(default)]
    headers: HashMap<String, String>,
    secret: Option<String>,
}

async fn list_webhooks(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.dispatcher.list().await)
}

async fn register_webhook(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateWebhook>,
) -> impl IntoResponse {
    let mut webhook = WebhookConfig::new(req.name, req.kind, req.url).with_filter(req.filter);
    webhook.headers = req.headers;
    webhook.secret = req.secret;

    let registered = state.dispatcher.register(webhook).await;
    (StatusCode::CREATED, Json(registered))
}

async fn get_webhook(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.dispatcher.get(&id).await {
        Some(webhook) => Json(webhook).into_response(),
        None => not_found(format!("unknown webhook: {id}")),
    }
}

async fn remove_webhook(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    if state.dispatcher.remove(&id).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        not_found(format!("unknown webhook: {id}"))
    }
}

async fn set_webhook_enabled(state: &AppState, id: &str, enabled: bool) -> Response {
    if state.dispatcher.set_enabled(id, enabled).await {
        match state.dispatcher.get(id).await {
            Some(webhook) => Json(webhook).into_response(),
            None => not_found(format!("unknown webhook: {id}")),
        }
    } else {
        not_found(format!("unknown webhook: {id}"))
    }
}

async fn enable_webhook(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    set_webhook_enabled(&state, &id, true).await
}

async fn disable_webhook(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    set_webhook_enabled(&state, &id, false).await
}

#[derive(Debug, Deserialize)]
struct CreateSchedule {
    name: String,
    /// Five-field cron expression, evaluated in UTC
    cron: String,
    run_kind: RunKind,
    description: Option<String>,
    #[serde(default)]
    params: serde_json::Value,
    #[serde(default = "default_schedule_enabled")]
    enabled: bool,
}

fn default_schedule_enabled() -> bool {
    true
}

async fn list_schedules(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.runner.list().await)
}

async fn create_schedule(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSchedule>,
) -> Response {
    let mut schedule = Schedule::new(req.name, req.cron, req.run_kind).with_params(req.params);
    schedule.description = req.description;
    schedule.enabled = req.enabled;

    match state.runner.register(schedule).await {
        Ok(registered) => (StatusCode::CREATED, Json(registered)).into_response(),
        Err(e) => error_body(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn get_schedule(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.runner.get(&id).await {
        Some(schedule) => Json(schedule).into_response(),
        None => not_found(format!("unknown schedule: {id}")),
    }
}

async fn remove_schedule(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.runner.remove(&id).await {
        Ok(removed) => Json(removed).into_response(),
        Err(e) => not_found(e.to_string()),
    }
}

async fn enable_schedule(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.runner.set_enabled(&id, true).await {
        Ok(schedule) => Json(schedule).into_response(),
        Err(e) => not_found(e.to_string()),
    }
}

async fn disable_schedule(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.runner.set_enabled(&id, false).await {
        Ok(schedule) => Json(schedule).into_response(),
        Err(e) => not_found(e.to_string()),
    }
}

async fn pause_schedule(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.runner.pause(&id).await {
        Ok(schedule) => Json(schedule).into_response(),
        Err(e) => not_found(e.to_string()),
    }
}

async fn resume_schedule(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.runner.resume(&id).await {
        Ok(schedule) => Json(schedule).into_response(),
        Err(e) => not_found(e.to_string()),
    }
}

async fn trigger_schedule(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.runner.trigger_now(&id).await {
        Ok(run) => Json(run).into_response(),
        Err(e) => not_found(e.to_string()),
    }
}

/// Most recent runs of a schedule, newest first
async fn schedule_runs(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.store.runs_for(&id, 50).await {
        Ok(runs) => Json(runs).into_response(),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Delivery attempts recorded for an alert
async fn alert_deliveries(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.store.delivery_log(&id).await {
        Ok(attempts) => Json(attempts).into_response(),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/monitors", get(list_monitors).post(start_monitor))
        .route("/api/v1/monitors/:id", get(get_monitor).delete(stop_monitor))
        .route("/api/v1/findings", get(list_findings))
        .route("/api/v1/health-score", get(health_score))
        .route("/api/v1/webhooks", get(list_webhooks).post(register_webhook))
        .route("/api/v1/webhooks/:id", get(get_webhook).delete(remove_webhook))
        .route("/api/v1/webhooks/:id/enable", post(enable_webhook))
        .route("/api/v1/webhooks/:id/disable", post(disable_webhook))
        .route("/api/v1/schedules", get(list_schedules).post(create_schedule))
        .route("/api/v1/schedules/:id", get(get_schedule).delete(remove_schedule))
        .route("/api/v1/schedules/:id/enable", post(enable_schedule))
        .route("/api/v1/schedules/:id/disable", post(disable_schedule))
        .route("/api/v1/schedules/:id/pause", post(pause_schedule))
        .route("/api/v1/schedules/:id/resume", post(resume_schedule))
        .route("/api/v1/schedules/:id/trigger", post(trigger_schedule))
        .route("/api/v1/schedules/:id/runs", get(schedule_runs))
        .route("/api/v1/alerts/:id/deliveries", get(alert_deliveries))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
