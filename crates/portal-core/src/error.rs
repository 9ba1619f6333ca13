//! Portal error types.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the portal core.
///
/// Each variant maps to a stable `kind` string carried in REST error
/// envelopes and `server_event` payloads.
#[derive(Debug, Error)]
pub enum PortalError {
    /// A declaration could not be parsed or normalized
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The OS refused to start the child process
    #[error("failed to spawn '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    /// The transport opened but the MCP handshake did not complete
    #[error("handshake with '{server}' failed: {reason}")]
    HandshakeFailed { server: String, reason: String },

    /// Mid-session I/O failure
    #[error("transport error: {0}")]
    Transport(String),

    /// A caller's deadline expired
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Unknown prefixed tool or resource
    #[error("not found: {0}")]
    NotFound(String),

    /// The upstream returned a JSON-RPC error; passed through verbatim
    #[error("upstream error {code}: {message}")]
    Upstream {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The call was lost to session teardown
    #[error("session closed")]
    SessionClosed,

    /// Retries exhausted; the server cannot currently serve requests
    #[error("server '{0}' is unavailable")]
    UpstreamUnavailable(String),

    /// Unrecoverable internal invariant violation
    #[error("fatal: {0}")]
    Fatal(String),
}

impl PortalError {
    /// Stable machine-readable kind for error envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            PortalError::ConfigInvalid(_) => "config_invalid",
            PortalError::SpawnFailed { .. } => "spawn_failed",
            PortalError::HandshakeFailed { .. } => "handshake_failed",
            PortalError::Transport(_) => "transport_error",
            PortalError::Timeout(_) => "timeout",
            PortalError::NotFound(_) => "not_found",
            PortalError::Upstream { .. } => "upstream_error",
            PortalError::SessionClosed => "session_closed",
            PortalError::UpstreamUnavailable(_) => "upstream_unavailable",
            PortalError::Fatal(_) => "fatal",
        }
    }
}

/// Result type alias for portal operations.
pub type PortalResult<T> = Result<T, PortalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings_are_stable() {
        assert_eq!(PortalError::ConfigInvalid("x".into()).kind(), "config_invalid");
        assert_eq!(PortalError::SessionClosed.kind(), "session_closed");
        assert_eq!(
            PortalError::Timeout(Duration::from_secs(1)).kind(),
            "timeout"
        );
        assert_eq!(
            PortalError::Upstream {
                code: -32601,
                message: "method not found".into(),
                data: None,
            }
            .kind(),
            "upstream_error"
        );
    }

    #[test]
    fn test_display_includes_context() {
        let err = PortalError::SpawnFailed {
            command: "npx".into(),
            reason: "no such file".into(),
        };
        assert!(err.to_string().contains("npx"));
        assert!(err.to_string().contains("no such file"));
    }
}
