//! MCP Client error types.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// JSON-RPC communication error (I/O error, closed stdout).
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The qualified tool name has no `<server>__<tool>` structure.
    #[error("malformed tool name '{name}': expected '<server>{separator}<tool>'")]
    MalformedName {
        name: String,
        separator: &'static str,
    },

    /// No available server with this name.
    #[error("unknown or unavailable server: '{name}'")]
    UnknownServer { name: String },

    /// The server is known but does not list this tool.
    #[error("unknown tool '{tool}' on server '{server}'")]
    UnknownTool { server: String, tool: String },

    /// A request timed out.
    #[error("request '{method}' to server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// Server process exited or closed its stdout.
    #[error("server '{name}' crashed: {reason}")]
    ServerCrashed { name: String, reason: String },

    /// Configuration error (missing servers, bad config file).
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// All restart attempts exhausted for a server.
    #[error("server '{name}' failed after {attempts} restart attempts")]
    RestartExhausted { name: String, attempts: u32 },
}
