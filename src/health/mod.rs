//! Health check endpoints

use crate::metrics::GatewayMetrics;
use crate::nats::NatsPublisher;
use crate::shard::ShardState;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub shards_total: usize,
    pub shards_healthy: usize,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub shards_total: usize,
    pub shards_ready: usize,
    pub nats_connected: bool,
    pub frames_received: u64,
    pub dispatches: u64,
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    pub shard_state: ShardState,
    pub nats: Option<Arc<NatsPublisher>>,
    pub metrics: Arc<GatewayMetrics>,
}

/// Create the health check router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health endpoint - always returns 200 if process is running
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        shards_total: state.shard_state.shard_count(),
        shards_healthy: state.shard_state.healthy_shards(),
    })
}

/// Readiness endpoint - returns 200 if at least one shard is ready
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let response = ready_response(&state);

    if response.ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

fn ready_response(state: &AppState) -> ReadyResponse {
    let shards_ready = state.shard_state.ready_shards();
    let nats_connected = state.nats.as_ref().map_or(true, |n| n.is_connected());

    ReadyResponse {
        ready: shards_ready > 0 && nats_connected,
        shards_total: state.shard_state.shard_count(),
        shards_ready,
        nats_connected,
        frames_received: state.shard_state.total_frames_received(),
        dispatches: state.shard_state.total_dispatches(),
    }
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state
        .metrics
        .set_shards_ready(state.shard_state.ready_shards());

    if let Some(ref nats) = state.nats {
        state.metrics.set_nats_connected(nats.is_connected());
    }

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}
