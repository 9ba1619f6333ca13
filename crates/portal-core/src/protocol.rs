//! MCP wire protocol types.
//!
//! MCP frames are JSON-RPC 2.0 objects. Tool parameter schemas and call
//! arguments are arbitrary JSON and stay `serde_json::Value` end to end;
//! only the envelope is typed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC version string carried on every frame.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision sent during the `initialize` handshake.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Value::from(id),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: -32601,
            message: format!("method not found: {method}"),
            data: None,
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: -32602,
            message: message.into(),
            data: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: -32603,
            message: message.into(),
            data: None,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no reply).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// One inbound or outbound MCP frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl Frame {
    /// Classify a decoded JSON value.
    ///
    /// A frame with `method` and `id` is a request, `method` without `id` a
    /// notification, and `id` without `method` a response. Anything else is
    /// malformed.
    pub fn from_value(value: Value) -> Result<Frame, String> {
        let has_method = value.get("method").is_some();
        let has_id = value.get("id").is_some();

        match (has_method, has_id) {
            (true, true) => serde_json::from_value(value)
                .map(Frame::Request)
                .map_err(|e| format!("malformed request: {e}")),
            (true, false) => serde_json::from_value(value)
                .map(Frame::Notification)
                .map_err(|e| format!("malformed notification: {e}")),
            (false, true) => serde_json::from_value(value)
                .map(Frame::Response)
                .map_err(|e| format!("malformed response: {e}")),
            (false, false) => Err("frame has neither method nor id".to_string()),
        }
    }

    /// Parse one newline-delimited JSON frame.
    pub fn from_line(line: &str) -> Result<Frame, String> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| format!("invalid JSON: {e}"))?;
        Frame::from_value(value)
    }

    /// Serialize to a single JSON line (no trailing newline).
    pub fn to_json(&self) -> Value {
        match self {
            Frame::Request(r) => serde_json::to_value(r).unwrap_or(Value::Null),
            Frame::Response(r) => serde_json::to_value(r).unwrap_or(Value::Null),
            Frame::Notification(n) => serde_json::to_value(n).unwrap_or(Value::Null),
        }
    }
}

/// Tool definition as declared by an upstream server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// JSON Schema for the tool input; opaque to the portal.
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// Resource definition as declared by an upstream server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDef {
    pub uri: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "mimeType", default)]
    pub mime_type: Option<String>,
}

/// Parse the `tools` array out of a `tools/list` result.
pub fn parse_tool_list(result: &Value) -> Vec<ToolDef> {
    result
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| serde_json::from_value(t.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Parse the `resources` array out of a `resources/list` result.
pub fn parse_resource_list(result: &Value) -> Vec<ResourceDef> {
    result
        .get("resources")
        .and_then(Value::as_array)
        .map(|resources| {
            resources
                .iter()
                .filter_map(|r| serde_json::from_value(r.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Client capabilities advertised in the `initialize` request.
pub fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {
            "roots": {},
            "sampling": {}
        },
        "clientInfo": {
            "name": "mcp-portal",
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}
