//! Unified MCP endpoint.
//!
//! Clients POST JSON-RPC 2.0 requests and subscribe to an SSE channel for
//! server-to-client notifications. There is no `Last-Event-ID` replay;
//! clients re-sync from the management API after a disconnect.

use std::convert::Infallible;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::Stream;
use portal_core::protocol::{Frame, JsonRpcNotification, JsonRpcResponse, RpcError};
use serde_json::Value;
use tracing::debug;

use crate::state::AppState;

/// POST /api/v1/mcp
pub async fn mcp_request(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    match Frame::from_value(body) {
        Ok(Frame::Request(request)) => {
            let response = state.dispatcher.dispatch(request).await;
            Json(response).into_response()
        }
        Ok(Frame::Notification(notification)) => {
            debug!(method = %notification.method, "client notification accepted");
            StatusCode::ACCEPTED.into_response()
        }
        Ok(Frame::Response(_)) => {
            let error = JsonRpcResponse::failure(
                Value::Null,
                RpcError::invalid_params("unexpected response frame"),
            );
            (StatusCode::BAD_REQUEST, Json(error)).into_response()
        }
        Err(reason) => {
            let error = JsonRpcResponse::failure(
                Value::Null,
                RpcError {
                    code: -32700,
                    message: format!("parse error: {reason}"),
                    data: None,
                },
            );
            (StatusCode::BAD_REQUEST, Json(error)).into_response()
        }
    }
}

/// GET /api/v1/mcp
///
/// Portal events re-framed as JSON-RPC notifications.
pub async fn mcp_notifications(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let mut subscription = state.bus.subscribe();

    let stream = async_stream::stream! {
        while let Some(event) = subscription.recv().await {
            let kind = serde_json::to_value(event.kind)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "event".to_string());
            let notification = JsonRpcNotification::new(
                format!("notifications/portal/{kind}"),
                Some(serde_json::to_value(&event).unwrap_or(Value::Null)),
            );
            let data = serde_json::to_string(&notification)
                .unwrap_or_else(|_| "{}".to_string());
            yield Ok(SseEvent::default().data(data));
        }
    };

    Sse::new(stream)
}
