//! Live event stream.
//!
//! SSE endpoint pushing registry events to management clients. The first
//! frame is always an `initial_status` snapshot; the bus itself provides
//! the 15-second heartbeat.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, Sse};
use futures::Stream;
use portal_core::events::{Event, EventKind};
use tracing::debug;

use crate::state::AppState;

/// GET /api/v1/events
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let mut subscription = state.bus.subscribe();

    let initial = Event::new(
        EventKind::InitialStatus,
        serde_json::json!({
            "gateway": state.registry.status_summary().await,
            "servers": state.registry.snapshot().await,
            "tools_count": state.aggregator.tool_count(),
            "resources_count": state.aggregator.resource_count(),
        }),
    );

    let stream = async_stream::stream! {
        yield Ok(to_sse(&initial));
        while let Some(event) = subscription.recv().await {
            yield Ok(to_sse(&event));
        }
        debug!("event stream ended");
    };

    Sse::new(stream)
}

fn to_sse(event: &Event) -> SseEvent {
    SseEvent::default()
        .data(serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string()))
}
