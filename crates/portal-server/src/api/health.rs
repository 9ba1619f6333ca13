//! Health, status, and metrics endpoints.

use axum::extract::State;
use axum::Json;
use portal_core::registry::{GatewayMetrics, GatewayStatus};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime: u64,
}

/// GET /api/v1/health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime: state.registry.uptime_seconds().await,
    })
}

/// GET /api/v1/status
pub async fn gateway_status(State(state): State<AppState>) -> Json<GatewayStatus> {
    Json(state.registry.status_summary().await)
}

/// GET /api/v1/metrics
pub async fn gateway_metrics(State(state): State<AppState>) -> Json<GatewayMetrics> {
    Json(state.registry.metrics().await)
}
