//! Configuration endpoints.
//!
//! Reads and writes go only to the gateway-owned manual source; files owned
//! by IDEs are never edited. A successful write triggers reconciliation.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigSaveResponse {
    pub data: ConfigSaveData,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigSaveData {
    pub updated_servers: usize,
}

/// GET /api/v1/config
pub async fn get_config(State(state): State<AppState>) -> Json<Value> {
    Json(state.supervisor.discovery().read_manual())
}

/// POST /api/v1/config
pub async fn save_config(
    State(state): State<AppState>,
    Json(doc): Json<Value>,
) -> Result<Json<ConfigSaveResponse>, ApiError> {
    let updated_servers = state.supervisor.discovery().write_manual(&doc)?;
    state.supervisor.refresh().await;
    Ok(Json(ConfigSaveResponse {
        data: ConfigSaveData { updated_servers },
    }))
}
