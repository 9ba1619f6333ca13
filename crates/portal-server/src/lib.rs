//! MCP Portal HTTP server.
//!
//! This crate provides:
//! - REST management API under `/api/v1`
//! - Server-sent events stream for live status
//! - The unified MCP endpoint (JSON-RPC over POST + SSE notifications)

pub mod api;
pub mod state;

pub use api::create_router;
pub use state::AppState;
