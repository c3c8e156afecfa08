//! Server registry and qualified tool names.
//!
//! Provides:
//! - The explicit registry of running servers, owned by the `McpClient`
//! - Qualified-name helpers (`server__tool`)
//! - Catalog snapshots and the capability summary for the system prompt

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::errors::McpError;
use super::lifecycle::ManagedServer;
use super::types::McpToolDefinition;

// ─── Qualified Names ─────────────────────────────────────────────────────────

/// Separator between server and tool in a qualified name (`jira__get_issue`).
///
/// Dots are not allowed in OpenAI function names, so the separator is a
/// double underscore. Tool names may contain single underscores.
pub const SEPARATOR: &str = "__";

/// Build a qualified name from its parts.
pub fn qualify(server: &str, tool: &str) -> String {
    format!("{server}{SEPARATOR}{tool}")
}

/// Split a qualified name on the first separator.
///
/// `"jira__get_issue"` → `("jira", "get_issue")`; `"a__b__c"` → `("a", "b__c")`.
pub fn split_qualified_name(name: &str) -> Result<(&str, &str), McpError> {
    match name.split_once(SEPARATOR) {
        Some((server, tool)) if !server.is_empty() && !tool.is_empty() => Ok((server, tool)),
        _ => Err(McpError::MalformedName {
            name: name.to_string(),
            separator: SEPARATOR,
        }),
    }
}

// ─── Catalog Snapshots ───────────────────────────────────────────────────────

/// One server's tool catalog at a point in time.
#[derive(Debug, Clone)]
pub struct ServerCatalog {
    pub server: String,
    pub tools: Arc<Vec<McpToolDefinition>>,
}

impl ServerCatalog {
    pub fn new(server: &str, tools: Vec<McpToolDefinition>) -> Self {
        Self {
            server: server.to_string(),
            tools: Arc::new(tools),
        }
    }
}

/// Concise capability summary for the system prompt.
///
/// One line per server listing its tool names, so the model knows what the
/// qualified names refer to even when only a subset is offered.
pub fn capability_summary(catalogs: &[ServerCatalog]) -> String {
    let total: usize = catalogs.iter().map(|c| c.tools.len()).sum();
    if total == 0 {
        return "No tool servers are currently available.".to_string();
    }

    let mut summary = format!(
        "Available capabilities ({total} tools across {} servers):",
        catalogs.iter().filter(|c| !c.tools.is_empty()).count()
    );
    for catalog in catalogs.iter().filter(|c| !c.tools.is_empty()) {
        let names: Vec<&str> = catalog.tools.iter().map(|t| t.name.as_str()).collect();
        summary.push_str(&format!("\n- {}: {}", catalog.server, names.join(", ")));
    }
    summary
}

// ─── ServerRegistry ──────────────────────────────────────────────────────────

/// Running servers by name.
///
/// Readers take a snapshot (`Arc<ManagedServer>`) and never hold the lock
/// across an await.
#[derive(Debug, Default)]
pub struct ServerRegistry {
    servers: RwLock<HashMap<String, Arc<ManagedServer>>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server, returning the one it replaced.
    pub fn insert(&self, server: Arc<ManagedServer>) -> Option<Arc<ManagedServer>> {
        let mut servers = self.servers.write().unwrap_or_else(|p| p.into_inner());
        servers.insert(server.name.clone(), server)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<ManagedServer>> {
        let mut servers = self.servers.write().unwrap_or_else(|p| p.into_inner());
        servers.remove(name)
    }

    /// Remove and return every server.
    pub fn drain(&self) -> Vec<Arc<ManagedServer>> {
        let mut servers = self.servers.write().unwrap_or_else(|p| p.into_inner());
        servers.drain().map(|(_, server)| server).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ManagedServer>> {
        let servers = self.servers.read().unwrap_or_else(|p| p.into_inner());
        servers.get(name).cloned()
    }

    /// Look up a server that is still available.
    pub fn get_available(&self, name: &str) -> Option<Arc<ManagedServer>> {
        self.get(name).filter(|server| server.is_available())
    }

    /// Names of available servers, sorted.
    pub fn available_names(&self) -> Vec<String> {
        let servers = self.servers.read().unwrap_or_else(|p| p.into_inner());
        let mut names: Vec<String> = servers
            .values()
            .filter(|s| s.is_available())
            .map(|s| s.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Catalog snapshots of available servers, sorted by server name.
    pub fn catalogs(&self) -> Vec<ServerCatalog> {
        let servers = self.servers.read().unwrap_or_else(|p| p.into_inner());
        let mut catalogs: Vec<ServerCatalog> = servers
            .values()
            .filter(|s| s.is_available())
            .map(|s| ServerCatalog {
                server: s.name.clone(),
                tools: s.tools(),
            })
            .collect();
        catalogs.sort_by(|a, b| a.server.cmp(&b.server));
        catalogs
    }

    /// Total tools across available servers.
    pub fn tool_count(&self) -> usize {
        self.catalogs().iter().map(|c| c.tools.len()).sum()
    }

    pub fn len(&self) -> usize {
        self.servers.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str) -> McpToolDefinition {
        McpToolDefinition {
            name: name.to_string(),
            description: format!("{name} tool"),
            input_schema: serde_json::json!({"type": "object"}),
        }
    }

    #[test]
    fn test_split_qualified_name() {
        assert_eq!(
            split_qualified_name("jira__get_issue").unwrap(),
            ("jira", "get_issue")
        );
    }

    #[test]
    fn test_split_on_first_separator_only() {
        assert_eq!(
            split_qualified_name("svn__commit__file").unwrap(),
            ("svn", "commit__file")
        );
    }

    #[test]
    fn test_split_without_separator_is_malformed() {
        let err = split_qualified_name("get_issue").unwrap_err();
        assert!(matches!(err, McpError::MalformedName { separator: "__", .. }));
    }

    #[test]
    fn test_split_with_empty_part_is_malformed() {
        assert!(split_qualified_name("__get_issue").is_err());
        assert!(split_qualified_name("jira__").is_err());
    }

    #[test]
    fn test_qualify_round_trips_through_split() {
        let name = qualify("knowledge", "search_similar");
        assert_eq!(name, "knowledge__search_similar");
        assert_eq!(
            split_qualified_name(&name).unwrap(),
            ("knowledge", "search_similar")
        );
    }

    #[test]
    fn test_capability_summary_empty() {
        let summary = capability_summary(&[]);
        assert!(summary.contains("No tool servers"));
    }

    #[test]
    fn test_capability_summary_lists_servers_and_tools() {
        let catalogs = vec![
            ServerCatalog::new("jira", vec![tool("get_issue"), tool("add_comment")]),
            ServerCatalog::new("empty", vec![]),
            ServerCatalog::new("knowledge", vec![tool("search_similar")]),
        ];
        let summary = capability_summary(&catalogs);
        assert!(summary.contains("3 tools across 2 servers"));
        assert!(summary.contains("- jira: get_issue, add_comment"));
        assert!(!summary.contains("empty"));
    }

    #[test]
    fn test_empty_registry() {
        let registry = ServerRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.catalogs().is_empty());
        assert!(registry.get_available("jira").is_none());
        assert_eq!(registry.tool_count(), 0);
    }
}
