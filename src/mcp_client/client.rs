//! MCP Client — high-level interface for tool execution.
//!
//! Owns the server registry and configurations, and implements the
//! [`ToolGateway`] the conversation loop calls tools through.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::errors::McpError;
use super::lifecycle;
use super::registry::{split_qualified_name, ServerCatalog, ServerRegistry};
use super::transport::extract_result;
use super::types::{McpServersConfig, ServerConfig};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default timeout for tool call execution (ms).
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

/// Default wait for a freshly spawned server's `initialize` reply (ms).
pub const DEFAULT_SETTLE_MS: u64 = 2_000;

/// Prefix for tool results the server flagged with `isError`.
const TOOL_ERROR_PREFIX: &str = "Tool reported an error: ";

// ─── ToolGateway ─────────────────────────────────────────────────────────────

/// Where the conversation loop sends tool calls.
#[async_trait]
pub trait ToolGateway: Send + Sync {
    /// Invoke `<server>__<tool>` and return its result as text.
    ///
    /// A call that times out yields `Ok` with an empty string.
    async fn invoke(
        &self,
        qualified_name: &str,
        arguments: serde_json::Value,
    ) -> Result<String, McpError>;

    /// Current catalogs of the servers that can take calls.
    fn catalogs(&self) -> Vec<ServerCatalog>;
}

// ─── McpClient ───────────────────────────────────────────────────────────────

/// High-level MCP client that manages multiple servers and routes tool calls.
pub struct McpClient {
    /// Server configurations (for starts and restarts).
    configs: HashMap<String, ServerConfig>,
    registry: ServerRegistry,
    /// Working directory for server processes.
    working_dir: Option<String>,
    call_timeout: Duration,
    settle: Duration,
}

impl McpClient {
    /// Create a new MCP client from a servers configuration file.
    pub fn new(config: McpServersConfig, working_dir: Option<String>) -> Self {
        Self {
            configs: config.servers,
            registry: ServerRegistry::new(),
            working_dir,
            call_timeout: Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS),
            settle: Duration::from_millis(DEFAULT_SETTLE_MS),
        }
    }

    /// Set the tool call timeout in milliseconds.
    pub fn set_call_timeout(&mut self, timeout_ms: u64) {
        self.call_timeout = Duration::from_millis(timeout_ms);
    }

    /// Set how long a start waits for each server's `initialize` reply.
    pub fn set_settle(&mut self, settle_ms: u64) {
        self.settle = Duration::from_millis(settle_ms);
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start all configured servers.
    ///
    /// Returns the servers that failed to start (partial startup is OK).
    pub async fn start_all(&self) -> Vec<(String, McpError)> {
        let (servers, errors) = lifecycle::spawn_all_servers(
            &self.configs,
            self.working_dir.as_deref(),
            self.settle,
        )
        .await;

        for (name, err) in &errors {
            tracing::warn!(server = %name, error = %err, "server failed to start");
        }
        for server in servers.into_values() {
            self.registry.insert(server);
        }

        tracing::info!(
            started = self.registry.len(),
            failed = errors.len(),
            tools = self.registry.tool_count(),
            "MCP servers started"
        );
        errors
    }

    /// Start a specific server by name.
    pub async fn start_server(&self, name: &str) -> Result<(), McpError> {
        let config = self.config_for(name)?;
        let server =
            lifecycle::spawn_server(name, config, self.working_dir.as_deref(), self.settle)
                .await?;

        if let Some(old) = self.registry.insert(server) {
            old.shutdown().await;
        }
        Ok(())
    }

    /// Shut down all servers concurrently.
    pub async fn shutdown_all(&self) {
        let servers = self.registry.drain();
        futures::future::join_all(servers.iter().map(|s| s.shutdown())).await;
    }

    /// Shut down a specific server.
    pub async fn shutdown_server(&self, name: &str) {
        if let Some(server) = self.registry.remove(name) {
            server.shutdown().await;
        }
    }

    /// Replace a server with a fresh process, with backoff.
    ///
    /// Crashed servers are never restarted automatically; this is the only
    /// way a server becomes available again.
    pub async fn restart_server(&self, name: &str) -> Result<(), McpError> {
        let config = self.config_for(name)?;

        let restart_count = match self.registry.remove(name) {
            Some(old) => {
                let count = old.restart_count();
                old.shutdown().await;
                count
            }
            None => 0,
        };

        let server = lifecycle::restart_server(
            name,
            config,
            self.working_dir.as_deref(),
            self.settle,
            restart_count,
        )
        .await?;
        self.registry.insert(server);
        Ok(())
    }

    fn config_for(&self, name: &str) -> Result<&ServerConfig, McpError> {
        self.configs.get(name).ok_or(McpError::ConfigError {
            reason: format!("no configuration for server '{name}'"),
        })
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Execute a tool call and return the raw `tools/call` result.
    ///
    /// Steps:
    /// 1. Split the qualified name and find the available server
    /// 2. Check the tool against the server's catalog, if it has one yet
    /// 3. Send JSON-RPC `tools/call` bounded by the call timeout
    pub async fn call_tool(
        &self,
        qualified_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let start = Instant::now();

        // 1. Resolve
        let (server_name, tool_name) = split_qualified_name(qualified_name)?;
        let server = self
            .registry
            .get_available(server_name)
            .ok_or(McpError::UnknownServer {
                name: server_name.to_string(),
            })?;

        // 2. Validate against the catalog
        let catalog = server.tools();
        if !catalog.is_empty() && !catalog.iter().any(|t| t.name == tool_name) {
            return Err(McpError::UnknownTool {
                server: server_name.to_string(),
                tool: tool_name.to_string(),
            });
        }

        // 3. Send request
        let arguments = if arguments.is_null() {
            serde_json::json!({})
        } else {
            arguments
        };
        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });

        let response = server
            .transport()
            .request_with_timeout("tools/call", Some(params), self.call_timeout)
            .await
            .map_err(|e| match e {
                McpError::TransportError { reason, .. } => McpError::ServerCrashed {
                    name: server_name.to_string(),
                    reason,
                },
                other => other,
            })?;

        tracing::debug!(
            server = server_name,
            tool = tool_name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "tool call returned"
        );

        extract_result(response)
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Get the number of available servers.
    pub fn running_server_count(&self) -> usize {
        self.registry.available_names().len()
    }

    /// Get the number of tools across available servers.
    pub fn tool_count(&self) -> usize {
        self.registry.tool_count()
    }

    /// Check if a specific server is up.
    pub fn is_server_running(&self, name: &str) -> bool {
        self.registry.get_available(name).is_some()
    }

    /// Get a sorted list of available server names.
    pub fn running_servers(&self) -> Vec<String> {
        self.registry.available_names()
    }

    /// Get names of all configured servers (including those that failed to start).
    pub fn configured_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ToolGateway for McpClient {
    async fn invoke(
        &self,
        qualified_name: &str,
        arguments: serde_json::Value,
    ) -> Result<String, McpError> {
        match self.call_tool(qualified_name, arguments).await {
            Ok(result) => Ok(normalize_tool_result(&result)),
            Err(McpError::Timeout {
                server, timeout_ms, ..
            }) => {
                tracing::warn!(
                    server = %server,
                    tool = qualified_name,
                    timeout_ms,
                    "tool call timed out, returning empty result"
                );
                Ok(String::new())
            }
            Err(e) => Err(e),
        }
    }

    fn catalogs(&self) -> Vec<ServerCatalog> {
        self.registry.catalogs()
    }
}

// ─── Result Normalization ────────────────────────────────────────────────────

/// Flatten a `tools/call` result into text for the model.
///
/// MCP results carry a `content` array of typed parts; text parts contribute
/// their `text`, other parts (images, resources) are serialized as JSON.
/// A bare string is returned as-is; any other shape is pretty-printed.
pub fn normalize_tool_result(result: &serde_json::Value) -> String {
    if let Some(text) = result.as_str() {
        return text.to_string();
    }

    if let Some(content) = result.get("content").and_then(|c| c.as_array()) {
        let parts: Vec<String> = content
            .iter()
            .map(|part| match part.get("text").and_then(|t| t.as_str()) {
                Some(text) => text.to_string(),
                None => part.to_string(),
            })
            .collect();
        let text = parts.join("\n");

        let is_error = result
            .get("isError")
            .and_then(|e| e.as_bool())
            .unwrap_or(false);
        return if is_error {
            format!("{TOOL_ERROR_PREFIX}{text}")
        } else {
            text
        };
    }

    serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
