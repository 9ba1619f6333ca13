//! Aggregated catalog endpoints.

use axum::extract::State;
use axum::Json;
use portal_core::aggregator::{ResourceDescriptor, ToolDescriptor};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolsResponse {
    pub tools: Vec<ToolDescriptor>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResourcesResponse {
    pub resources: Vec<ResourceDescriptor>,
}

/// GET /api/v1/tools
pub async fn list_tools(State(state): State<AppState>) -> Json<ToolsResponse> {
    Json(ToolsResponse {
        tools: state.aggregator.list_tools(),
    })
}

/// GET /api/v1/resources
pub async fn list_resources(State(state): State<AppState>) -> Json<ResourcesResponse> {
    Json(ResourcesResponse {
        resources: state.aggregator.list_resources(),
    })
}
