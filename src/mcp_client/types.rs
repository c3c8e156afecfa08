//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types and MCP protocol structures.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

// ─── Protocol Constants ─────────────────────────────────────────────────────

/// MCP protocol revision sent in the `initialize` request.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Client identity sent in the `initialize` request.
pub const CLIENT_NAME: &str = env!("CARGO_PKG_NAME");

/// Client version sent in the `initialize` request.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// A framed message read from a server's stdout, classified by shape.
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    /// Reply to one of our requests.
    Response(JsonRpcResponse),
    /// Server-initiated notification (`method`, no `id`).
    Notification { method: String },
    /// Server-initiated request (`method` and `id`). We do not serve these.
    Request {
        id: serde_json::Value,
        method: String,
    },
    /// Valid JSON that is not a JSON-RPC message we understand.
    Other(serde_json::Value),
}

impl IncomingMessage {
    /// Classify a framed JSON object.
    pub fn classify(value: serde_json::Value) -> Self {
        if let Some(method) = value.get("method").and_then(|m| m.as_str()) {
            let method = method.to_string();
            return match value.get("id") {
                Some(id) => Self::Request {
                    id: id.clone(),
                    method,
                },
                None => Self::Notification { method },
            };
        }

        let has_payload = value.get("result").is_some() || value.get("error").is_some();
        if has_payload && value.get("id").is_some() {
            if let Ok(resp) = serde_json::from_value::<JsonRpcResponse>(value.clone()) {
                return Self::Response(resp);
            }
        }

        Self::Other(value)
    }
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// MCP tool definition as returned by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub description: String,
    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: serde_json::Value,
}

/// Some servers send `"description": null`.
fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// `tools/list` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolListResult {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
    #[serde(default, rename = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, rename = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, rename = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// Server configuration from `mcp-servers.json`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Per-server working directory (overrides the global working_dir).
    #[serde(default)]
    pub cwd: Option<String>,
}

/// Top-level MCP servers configuration file.
///
/// Entries are parsed one by one: an invalid entry is logged and skipped
/// so it cannot keep the other servers from starting.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "RawServersConfig")]
pub struct McpServersConfig {
    pub servers: HashMap<String, ServerConfig>,
}

#[derive(Deserialize)]
struct RawServersConfig {
    #[serde(default, alias = "mcpServers")]
    servers: HashMap<String, serde_json::Value>,
}

impl From<RawServersConfig> for McpServersConfig {
    fn from(raw: RawServersConfig) -> Self {
        let servers = raw
            .servers
            .into_iter()
            .filter_map(|(name, entry)| match serde_json::from_value::<ServerConfig>(entry) {
                Ok(config) => Some((name, config)),
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "invalid server entry skipped");
                    None
                }
            })
            .collect();
        Self { servers }
    }
}

// ─── Standard Error Codes ───────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
