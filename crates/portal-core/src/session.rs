//! One live MCP conversation with one upstream server.
//!
//! A session owns its carrier and drives it from a single I/O loop task:
//! outbound frames are serialized through an mpsc queue, inbound responses
//! are dispatched into per-request oneshot waiters keyed by a monotonic
//! request id. Concurrent calls are permitted; responses may return out of
//! order.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::command;
use crate::discovery::{ServerDecl, TransportHint};
use crate::protocol::{
    initialize_params, parse_resource_list, parse_tool_list, Frame, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, ResourceDef, ToolDef,
};
use crate::transport::{Carrier, SseCarrier, StdioCarrier};
use crate::transport::stdio::StderrTail;
use crate::{PortalError, PortalResult};

/// Cadence of the keepalive ping.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Shared map of live sessions. The supervisor writes it; the dispatcher
/// and API layer read it.
pub type SessionMap = Arc<tokio::sync::RwLock<HashMap<String, Arc<Session>>>>;

/// Grace period for the I/O loop to wind down on `stop()`.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Init,
    Connecting,
    Ready,
    Degraded,
    Failed,
    Stopped,
}

impl SessionState {
    /// Whether the catalog may expose this session's inventory.
    pub fn exposes_inventory(&self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Degraded)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Init => "init",
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Degraded => "degraded",
            SessionState::Failed => "failed",
            SessionState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Out-of-band signals a session raises for its supervisor.
#[derive(Debug)]
pub enum SessionSignal {
    /// The upstream announced a tools/resources list change.
    InventoryChanged,
    /// The transport died mid-session (EOF, I/O error, malformed frame).
    TransportClosed { reason: String },
}

/// Last-known inventory fetched from the upstream.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub tools: Vec<ToolDef>,
    pub resources: Vec<ResourceDef>,
}

enum Outbound {
    Frame(Frame),
    Shutdown,
}

struct Shared {
    server_name: String,
    out_tx: mpsc::Sender<Outbound>,
    pending: Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    signals: mpsc::Sender<SessionSignal>,
}

impl Shared {
    fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Response(resp) => {
                let Some(id) = resp.id.as_u64() else {
                    warn!(server = %self.server_name, "response with non-numeric id discarded");
                    return;
                };
                let waiter = self.pending.lock().expect("pending poisoned").remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(resp);
                    }
                    None => {
                        debug!(server = %self.server_name, id, "late response discarded");
                    }
                }
            }
            Frame::Notification(n) => {
                if n.method.ends_with("list_changed") {
                    let _ = self.signals.try_send(SessionSignal::InventoryChanged);
                } else {
                    debug!(server = %self.server_name, method = %n.method, "notification ignored");
                }
            }
            Frame::Request(req) => {
                debug!(
                    server = %self.server_name,
                    method = %req.method,
                    "server-initiated request not supported, ignored"
                );
            }
        }
    }

    /// Drop every waiter. Their `oneshot` receivers resolve to an error the
    /// caller maps to `session_closed`; no waiter is ever orphaned.
    fn drain_pending(&self) {
        self.pending.lock().expect("pending poisoned").clear();
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().expect("pending poisoned").len()
    }
}

/// A live session.
pub struct Session {
    name: String,
    timeout: Duration,
    shared: Arc<Shared>,
    io_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    stderr_tail: Option<StderrTail>,
}

impl Session {
    /// Construct the transport for a declaration and run the MCP handshake.
    ///
    /// On success the session is `ready` and its initial inventory has been
    /// fetched. On failure all resources are released before returning.
    pub async fn start(
        decl: &ServerDecl,
        home: &Path,
        signals: mpsc::Sender<SessionSignal>,
    ) -> PortalResult<(Session, Inventory)> {
        let timeout = Duration::from_secs(decl.timeout_seconds);
        match decl.transport {
            TransportHint::Stdio => {
                let spec = command::normalize(decl, home)?;
                let carrier = StdioCarrier::spawn(&decl.name, &spec)?;
                let tail = carrier.stderr_tail();
                Self::start_with_carrier(&decl.name, timeout, Box::new(carrier), Some(tail), signals)
                    .await
            }
            TransportHint::HttpSse => {
                let url = decl.url.as_deref().ok_or_else(|| {
                    PortalError::ConfigInvalid(format!("server '{}' has no url", decl.name))
                })?;
                let carrier = SseCarrier::connect(&decl.name, url, timeout).await?;
                Self::start_with_carrier(&decl.name, timeout, Box::new(carrier), None, signals)
                    .await
            }
        }
    }

    /// Wire a session over an already-constructed carrier and handshake.
    pub(crate) async fn start_with_carrier(
        name: &str,
        timeout: Duration,
        carrier: Box<dyn Carrier>,
        stderr_tail: Option<StderrTail>,
        signals: mpsc::Sender<SessionSignal>,
    ) -> PortalResult<(Session, Inventory)> {
        let (out_tx, out_rx) = mpsc::channel(64);
        let shared = Arc::new(Shared {
            server_name: name.to_string(),
            out_tx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            signals,
        });

        let io = tokio::spawn(io_loop(carrier, out_rx, shared.clone()));
        let session = Session {
            name: name.to_string(),
            timeout,
            shared,
            io_task: tokio::sync::Mutex::new(Some(io)),
            stderr_tail,
        };

        match session.handshake().await {
            Ok(inventory) => Ok((session, inventory)),
            Err(e) => {
                session.stop().await;
                Err(PortalError::HandshakeFailed {
                    server: name.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn handshake(&self) -> PortalResult<Inventory> {
        self.call("initialize", Some(initialize_params()), self.timeout)
            .await?;
        self.notify("notifications/initialized", None).await?;
        self.refresh_inventory().await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Default call deadline for this session.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Issue one request and await the correlated response.
    ///
    /// Returns the upstream `result` value, a verbatim `upstream_error`, a
    /// `timeout` once the deadline passes (the waiter is released and a late
    /// response is discarded), or `session_closed` if the session tears down
    /// underneath the call.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> PortalResult<Value> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(PortalError::SessionClosed);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .expect("pending poisoned")
            .insert(id, tx);

        let frame = Frame::Request(JsonRpcRequest::new(id, method, params));
        if self
            .shared
            .out_tx
            .send(Outbound::Frame(frame))
            .await
            .is_err()
        {
            self.shared
                .pending
                .lock()
                .expect("pending poisoned")
                .remove(&id);
            return Err(PortalError::SessionClosed);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(resp)) => match resp.error {
                Some(err) => Err(PortalError::Upstream {
                    code: err.code,
                    message: err.message,
                    data: err.data,
                }),
                None => Ok(resp.result.unwrap_or(Value::Null)),
            },
            Ok(Err(_)) => Err(PortalError::SessionClosed),
            Err(_) => {
                self.shared
                    .pending
                    .lock()
                    .expect("pending poisoned")
                    .remove(&id);
                Err(PortalError::Timeout(deadline))
            }
        }
    }

    /// Send a notification (no reply expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> PortalResult<()> {
        let frame = Frame::Notification(JsonRpcNotification::new(method, params));
        self.shared
            .out_tx
            .send(Outbound::Frame(frame))
            .await
            .map_err(|_| PortalError::SessionClosed)
    }

    /// Re-issue `tools/list` and `resources/list`.
    ///
    /// An upstream that lacks one of the capabilities answers with a
    /// JSON-RPC error; that surface is treated as an empty list.
    pub async fn refresh_inventory(&self) -> PortalResult<Inventory> {
        let tools = match self
            .call("tools/list", Some(serde_json::json!({})), self.timeout)
            .await
        {
            Ok(result) => parse_tool_list(&result),
            Err(PortalError::Upstream { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };

        let resources = match self
            .call("resources/list", Some(serde_json::json!({})), self.timeout)
            .await
        {
            Ok(result) => parse_resource_list(&result),
            Err(PortalError::Upstream { .. }) => Vec::new(),
            Err(e) => return Err(e),
        };

        Ok(Inventory { tools, resources })
    }

    /// Lightweight keepalive. Falls back to `tools/list` for upstreams that
    /// do not implement `ping`.
    pub async fn ping(&self) -> PortalResult<()> {
        match self.call("ping", None, self.timeout).await {
            Ok(_) => Ok(()),
            Err(PortalError::Upstream { .. }) => self
                .call("tools/list", Some(serde_json::json!({})), self.timeout)
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        }
    }

    /// Last captured stderr output (stdio transport only).
    pub fn last_stderr(&self) -> Option<String> {
        self.stderr_tail
            .as_ref()
            .map(StderrTail::snapshot)
            .filter(|s| !s.is_empty())
    }

    /// Cancel all waiters, close the transport, release the child process.
    /// Idempotent.
    pub async fn stop(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.shared.out_tx.send(Outbound::Shutdown).await;

        if let Some(handle) = self.io_task.lock().await.take() {
            let abort = handle.abort_handle();
            if tokio::time::timeout(STOP_GRACE, handle).await.is_err() {
                warn!(server = %self.name, "I/O loop did not stop in time, aborting");
                abort.abort();
            }
        }

        self.shared.drain_pending();
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.shared.pending_len()
    }
}

/// Single I/O loop per session: serializes writes, dispatches reads.
async fn io_loop(
    mut carrier: Box<dyn Carrier>,
    mut out_rx: mpsc::Receiver<Outbound>,
    shared: Arc<Shared>,
) {
    let reason = loop {
        tokio::select! {
            outbound = out_rx.recv() => match outbound {
                Some(Outbound::Frame(frame)) => {
                    if let Err(e) = carrier.send(frame).await {
                        break e.to_string();
                    }
                }
                Some(Outbound::Shutdown) | None => break "session closed".to_string(),
            },
            inbound = carrier.recv() => match inbound {
                Some(Ok(frame)) => shared.dispatch(frame),
                // A malformed frame force-closes the session; it never
                // reaches a waiter.
                Some(Err(e)) => break e.to_string(),
                None => break "transport closed".to_string(),
            },
        }
    };

    carrier.close().await;
    shared.drain_pending();

    if !shared.closed.load(Ordering::SeqCst) {
        debug!(server = %shared.server_name, %reason, "transport lost");
        let _ = shared
            .signals
            .try_send(SessionSignal::TransportClosed { reason });
    }
}
