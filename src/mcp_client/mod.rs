//! MCP Client — JSON-RPC over stdio for MCP tool servers.
//!
//! This module handles:
//! - Framing JSON-RPC messages out of raw server stdout
//! - Spawning and supervising MCP server child processes
//! - Concurrent request/response matching over process stdio
//! - Tool call routing and result normalization
//! - Server lifecycle (start, explicit restart with backoff, shutdown)
//!
//! The conversation loop reaches tools only through [`ToolGateway`].

pub mod client;
pub mod errors;
pub mod framer;
pub mod lifecycle;
pub mod registry;
pub mod transport;
pub mod types;

#[cfg(all(test, unix))]
pub(crate) mod test_support;

// Re-exports for convenience
pub use client::{normalize_tool_result, McpClient, ToolGateway};
pub use errors::McpError;
pub use registry::{qualify, split_qualified_name, ServerCatalog, ServerRegistry, SEPARATOR};
pub use types::{McpServersConfig, McpToolDefinition, ServerConfig};
