//! API routes.

pub mod catalog;
pub mod config;
pub mod events;
pub mod health;
pub mod mcp;
pub mod servers;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use portal_core::PortalError;

use crate::state::AppState;

/// Create the main API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Server management
        .route("/api/v1/servers", get(servers::list_servers))
        .route("/api/v1/servers/refresh", post(servers::refresh_servers))
        .route("/api/v1/servers/{name}/enable", post(servers::enable_server))
        .route(
            "/api/v1/servers/{name}/disable",
            post(servers::disable_server),
        )
        .route(
            "/api/v1/servers/{name}/reconnect",
            post(servers::reconnect_server),
        )
        // Aggregated catalog
        .route("/api/v1/tools", get(catalog::list_tools))
        .route("/api/v1/resources", get(catalog::list_resources))
        // Configuration
        .route("/api/v1/config", get(config::get_config))
        .route("/api/v1/config", post(config::save_config))
        // Health and metrics
        .route("/api/v1/health", get(health::health_check))
        .route("/api/v1/status", get(health::gateway_status))
        .route("/api/v1/metrics", get(health::gateway_metrics))
        // Streaming
        .route("/api/v1/events", get(events::event_stream))
        // Unified MCP endpoint
        .route("/api/v1/mcp", post(mcp::mcp_request))
        .route("/api/v1/mcp", get(mcp::mcp_notifications))
        .with_state(state)
}

/// REST error envelope: `{"error": {"kind", "message"}}`.
#[derive(Debug)]
pub struct ApiError(pub PortalError);

impl From<PortalError> for ApiError {
    fn from(error: PortalError) -> Self {
        ApiError(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PortalError::NotFound(_) => StatusCode::NOT_FOUND,
            PortalError::ConfigInvalid(_) => StatusCode::BAD_REQUEST,
            PortalError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            PortalError::UpstreamUnavailable(_) | PortalError::SessionClosed => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            PortalError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({
            "error": {
                "kind": self.0.kind(),
                "message": self.0.to_string(),
            }
        }));
        (status, body).into_response()
    }
}
