//! Request dispatch.
//!
//! Accepts MCP-shaped requests from clients, resolves prefixed identifiers
//! through the aggregator, forwards to the owning session, and returns the
//! upstream result verbatim. Every dispatched call emits a `tool_execution`
//! or `resource_access` event.

use std::time::Instant;

use serde_json::Value;
use tracing::debug;

use crate::aggregator::Aggregator;
use crate::events::{Event, EventKind};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, RpcError, MCP_PROTOCOL_VERSION};
use crate::registry::Registry;
use crate::session::SessionMap;
use crate::{PortalError, PortalResult};

/// Routes client requests onto upstream sessions.
#[derive(Clone)]
pub struct Dispatcher {
    aggregator: Aggregator,
    sessions: SessionMap,
    registry: Registry,
}

impl Dispatcher {
    pub fn new(aggregator: Aggregator, sessions: SessionMap, registry: Registry) -> Self {
        Self {
            aggregator,
            sessions,
            registry,
        }
    }

    /// Execute a prefixed tool call and return the upstream result verbatim.
    pub async fn call_tool(&self, prefixed_name: &str, arguments: Value) -> PortalResult<Value> {
        let (server_name, original_name) = self
            .aggregator
            .resolve_tool(prefixed_name)
            .ok_or_else(|| PortalError::NotFound(format!("tool '{prefixed_name}'")))?;

        let start = Instant::now();
        let result = self
            .forward(
                &server_name,
                "tools/call",
                serde_json::json!({ "name": original_name, "arguments": arguments }),
            )
            .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        self.registry
            .record_call(&server_name, result.is_ok(), duration_ms)
            .await;
        self.registry.record_event(Event::new(
            EventKind::ToolExecution,
            serde_json::json!({
                "tool_name": prefixed_name,
                "server_name": server_name,
                "original_name": original_name,
                "success": result.is_ok(),
                "duration_ms": duration_ms,
                "error": result.as_ref().err().map(|e| e.to_string()),
            }),
        ));

        result
    }

    /// Read a prefixed resource and return the upstream result verbatim.
    pub async fn read_resource(&self, prefixed_uri: &str) -> PortalResult<Value> {
        let (server_name, original_uri) = self
            .aggregator
            .resolve_resource(prefixed_uri)
            .ok_or_else(|| PortalError::NotFound(format!("resource '{prefixed_uri}'")))?;

        let start = Instant::now();
        let result = self
            .forward(
                &server_name,
                "resources/read",
                serde_json::json!({ "uri": original_uri }),
            )
            .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        self.registry
            .record_call(&server_name, result.is_ok(), duration_ms)
            .await;
        self.registry.record_event(Event::new(
            EventKind::ResourceAccess,
            serde_json::json!({
                "resource_uri": prefixed_uri,
                "server_name": server_name,
                "original_uri": original_uri,
                "success": result.is_ok(),
                "duration_ms": duration_ms,
                "error": result.as_ref().err().map(|e| e.to_string()),
            }),
        ));

        result
    }

    async fn forward(&self, server_name: &str, method: &str, params: Value) -> PortalResult<Value> {
        let session = self
            .sessions
            .read()
            .await
            .get(server_name)
            .cloned()
            .ok_or_else(|| PortalError::UpstreamUnavailable(server_name.to_string()))?;
        let deadline = session.timeout();
        session.call(method, Some(params), deadline).await
    }

    /// Serve one JSON-RPC request on the unified MCP endpoint.
    pub async fn dispatch(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();
        debug!(method = %request.method, "mcp request");

        match request.method.as_str() {
            "initialize" => JsonRpcResponse::success(
                id,
                serde_json::json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {
                        "tools": { "listChanged": true },
                        "resources": { "listChanged": true }
                    },
                    "serverInfo": {
                        "name": "mcp-portal",
                        "version": env!("CARGO_PKG_VERSION")
                    }
                }),
            ),
            "ping" => JsonRpcResponse::success(id, serde_json::json!({})),
            "tools/list" => {
                let tools: Vec<Value> = self
                    .aggregator
                    .list_tools()
                    .into_iter()
                    .map(|t| {
                        serde_json::json!({
                            "name": t.prefixed_name,
                            "description": t.description,
                            "inputSchema": t.parameters,
                        })
                    })
                    .collect();
                JsonRpcResponse::success(id, serde_json::json!({ "tools": tools }))
            }
            "resources/list" => {
                let resources: Vec<Value> = self
                    .aggregator
                    .list_resources()
                    .into_iter()
                    .map(|r| {
                        serde_json::json!({
                            "uri": r.prefixed_uri,
                            "name": r.name,
                            "description": r.description,
                            "mimeType": r.mime_type,
                        })
                    })
                    .collect();
                JsonRpcResponse::success(id, serde_json::json!({ "resources": resources }))
            }
            "tools/call" => {
                let params = request.params.unwrap_or(Value::Null);
                let Some(name) = params.get("name").and_then(Value::as_str) else {
                    return JsonRpcResponse::failure(
                        id,
                        RpcError::invalid_params("missing tool name"),
                    );
                };
                let arguments = params
                    .get("arguments")
                    .cloned()
                    .unwrap_or_else(|| serde_json::json!({}));
                match self.call_tool(name, arguments).await {
                    Ok(result) => JsonRpcResponse::success(id, result),
                    Err(e) => JsonRpcResponse::failure(id, rpc_error_from(e)),
                }
            }
            "resources/read" => {
                let params = request.params.unwrap_or(Value::Null);
                let Some(uri) = params.get("uri").and_then(Value::as_str) else {
                    return JsonRpcResponse::failure(
                        id,
                        RpcError::invalid_params("missing resource uri"),
                    );
                };
                match self.read_resource(uri).await {
                    Ok(result) => JsonRpcResponse::success(id, result),
                    Err(e) => JsonRpcResponse::failure(id, rpc_error_from(e)),
                }
            }
            other => JsonRpcResponse::failure(id, RpcError::method_not_found(other)),
        }
    }
}

/// Map a portal error onto the wire.
///
/// Upstream JSON-RPC errors pass through verbatim; portal-side failures
/// carry their `kind` in the error data.
fn rpc_error_from(error: PortalError) -> RpcError {
    match error {
        PortalError::Upstream {
            code,
            message,
            data,
        } => RpcError {
            code,
            message,
            data,
        },
        PortalError::NotFound(what) => RpcError {
            code: -32602,
            message: format!("not found: {what}"),
            data: Some(serde_json::json!({ "kind": "not_found" })),
        },
        other => RpcError {
            code: -32000,
            message: other.to_string(),
            data: Some(serde_json::json!({ "kind": other.kind() })),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::protocol::Frame;
    use crate::registry::InventoryView;
    use crate::session::{Session, SessionState};
    use crate::transport::testing::MockCarrier;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Upstream that serves one `echo` tool returning its arguments, and
    /// one resource at `notes://today`.
    fn run_echo_upstream(mut remote: crate::transport::testing::MockRemote) {
        tokio::spawn(async move {
            while let Some(frame) = remote.sent.recv().await {
                let Frame::Request(req) = frame else { continue };
                let result = match req.method.as_str() {
                    "initialize" => serde_json::json!({"capabilities": {}}),
                    "tools/list" => serde_json::json!({
                        "tools": [{"name": "echo", "description": "Echo", "inputSchema": {}}]
                    }),
                    "resources/list" => serde_json::json!({
                        "resources": [{"uri": "notes://today", "name": "today"}]
                    }),
                    "tools/call" => {
                        let params = req.params.clone().unwrap_or(Value::Null);
                        serde_json::json!({
                            "echoed_name": params["name"],
                            "content": [{"type": "text", "text": params["arguments"]["msg"]}]
                        })
                    }
                    "resources/read" => {
                        let params = req.params.clone().unwrap_or(Value::Null);
                        serde_json::json!({
                            "contents": [{"uri": params["uri"], "text": "note body"}]
                        })
                    }
                    _ => Value::Null,
                };
                let _ = remote
                    .push
                    .send(Ok(Frame::Response(JsonRpcResponse::success(req.id, result))));
            }
        });
    }

    async fn fixture() -> (Dispatcher, EventBus) {
        let bus = EventBus::new();
        let registry = Registry::new(bus.clone());
        let aggregator = Aggregator::new();
        let sessions: SessionMap = Arc::new(tokio::sync::RwLock::new(HashMap::new()));

        let (carrier, remote) = MockCarrier::pair();
        run_echo_upstream(remote);
        let (signal_tx, _signal_rx) = mpsc::channel(8);
        let (session, inventory) = Session::start_with_carrier(
            "alpha",
            Duration::from_secs(2),
            Box::new(carrier),
            None,
            signal_tx,
        )
        .await
        .unwrap();

        sessions
            .write()
            .await
            .insert("alpha".to_string(), Arc::new(session));
        aggregator.rebuild(&[InventoryView {
            server_name: "alpha".into(),
            status: SessionState::Ready,
            tools: inventory.tools,
            resources: inventory.resources,
        }]);

        (Dispatcher::new(aggregator, sessions, registry), bus)
    }

    #[tokio::test]
    async fn test_call_routes_with_original_name() {
        let (dispatcher, bus) = fixture().await;
        let mut events = bus.subscribe();

        let result = dispatcher
            .call_tool("alpha.echo", serde_json::json!({"msg": "hi"}))
            .await
            .unwrap();

        // The upstream saw the original name, not the prefixed one.
        assert_eq!(result["echoed_name"], "echo");
        assert_eq!(result["content"][0]["text"], "hi");

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::ToolExecution);
        assert_eq!(event.data["server_name"], "alpha");
        assert_eq!(event.data["success"], true);
        assert!(event.data["duration_ms"].is_u64());
    }

    #[tokio::test]
    async fn test_unknown_tool_is_not_found() {
        let (dispatcher, _bus) = fixture().await;
        let err = dispatcher
            .call_tool("alpha.bogus", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_catalog_entry_without_session_is_unavailable() {
        let (dispatcher, _bus) = fixture().await;
        dispatcher.sessions.write().await.clear();

        let err = dispatcher
            .call_tool("alpha.echo", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "upstream_unavailable");
    }

    #[tokio::test]
    async fn test_resource_read_forwards_original_uri() {
        let (dispatcher, bus) = fixture().await;
        let mut events = bus.subscribe();

        let result = dispatcher
            .read_resource("mcp://alpha/today")
            .await
            .unwrap();
        assert_eq!(result["contents"][0]["uri"], "notes://today");

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::ResourceAccess);
        assert_eq!(event.data["resource_uri"], "mcp://alpha/today");
    }

    #[tokio::test]
    async fn test_dispatch_lists_prefixed_tools() {
        let (dispatcher, _bus) = fixture().await;
        let response = dispatcher
            .dispatch(JsonRpcRequest::new(1, "tools/list", None))
            .await;
        let tools = response.result.unwrap()["tools"].clone();
        assert_eq!(tools[0]["name"], "alpha.echo");
    }

    #[tokio::test]
    async fn test_dispatch_ping_is_local() {
        let (dispatcher, _bus) = fixture().await;
        let response = dispatcher
            .dispatch(JsonRpcRequest::new(2, "ping", None))
            .await;
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_unknown_method() {
        let (dispatcher, _bus) = fixture().await;
        let response = dispatcher
            .dispatch(JsonRpcRequest::new(3, "prompts/list", None))
            .await;
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_dispatch_tool_call_end_to_end() {
        let (dispatcher, _bus) = fixture().await;
        let response = dispatcher
            .dispatch(JsonRpcRequest::new(
                4,
                "tools/call",
                Some(serde_json::json!({
                    "name": "alpha.echo",
                    "arguments": {"msg": "routed"}
                })),
            ))
            .await;
        assert_eq!(response.result.unwrap()["content"][0]["text"], "routed");
    }
}
