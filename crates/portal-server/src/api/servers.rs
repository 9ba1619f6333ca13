//! Server management endpoints.

use axum::extract::{Path, State};
use axum::Json;
use portal_core::registry::ServerStatus;
use portal_core::supervisor::ToggleOutcome;
use serde::{Deserialize, Serialize};

use super::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct ServersResponse {
    pub servers: Vec<ServerStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub data: RefreshData,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RefreshData {
    pub discovered_count: usize,
}

/// GET /api/v1/servers
pub async fn list_servers(State(state): State<AppState>) -> Json<ServersResponse> {
    Json(ServersResponse {
        servers: state.registry.snapshot().await,
    })
}

/// POST /api/v1/servers/{name}/enable
pub async fn enable_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    let outcome = state.supervisor.set_enabled(&name, true).await?;
    Ok(Json(ActionResponse {
        success: true,
        message: match outcome {
            ToggleOutcome::Applied => format!("server '{name}' enabled"),
            ToggleOutcome::Noop => format!("server '{name}' already enabled"),
        },
    }))
}

/// POST /api/v1/servers/{name}/disable
pub async fn disable_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    let outcome = state.supervisor.set_enabled(&name, false).await?;
    Ok(Json(ActionResponse {
        success: true,
        message: match outcome {
            ToggleOutcome::Applied => format!("server '{name}' disabled"),
            ToggleOutcome::Noop => format!("server '{name}' already disabled"),
        },
    }))
}

/// POST /api/v1/servers/{name}/reconnect
pub async fn reconnect_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    state.supervisor.reconnect(&name).await?;
    Ok(Json(ActionResponse {
        success: true,
        message: format!("reconnect of '{name}' initiated"),
    }))
}

/// POST /api/v1/servers/refresh
pub async fn refresh_servers(State(state): State<AppState>) -> Json<RefreshResponse> {
    let (discovered_count, _delta) = state.supervisor.refresh().await;
    Json(RefreshResponse {
        data: RefreshData { discovered_count },
    })
}
