//! Keyword pre-filter for tool selection.
//!
//! Presenting the whole catalog degrades tool choice, so each turn only sees
//! the tools whose name, description or server matches a category the prompt
//! mentions. The match is a heuristic: false negatives are acceptable and
//! false positives are tolerated as noise. An unmatched prompt falls back to
//! the default categories so the model never loses its baseline tools.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::inference::types::ToolDefinition;
use crate::mcp_client::{qualify, McpToolDefinition, ServerCatalog};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Upper bound on tools sent with one model turn.
pub const MAX_SELECTED_TOOLS: usize = 24;

/// Categories used when the prompt matches none.
pub const DEFAULT_CATEGORIES: &[&str] = &["jira", "knowledge"];

/// Category selected by an issue key such as `CMU-102`.
const ISSUE_CATEGORY: &str = "jira";

static ISSUE_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][A-Z0-9]+-\d+\b").expect("issue key pattern"));

/// First issue key in `text`, if any.
pub fn find_issue_key(text: &str) -> Option<&str> {
    ISSUE_KEY.find(text).map(|m| m.as_str())
}

// ─── Keyword Groups ─────────────────────────────────────────────────────────

/// A category and the prompt words that select it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordGroup {
    pub category: String,
    #[serde(default)]
    pub triggers: Vec<String>,
}

impl KeywordGroup {
    fn new(category: &str, triggers: &[&str]) -> Self {
        Self {
            category: category.to_string(),
            triggers: triggers.iter().map(|t| t.to_string()).collect(),
        }
    }
}

/// Built-in keyword groups.
pub fn default_groups() -> Vec<KeywordGroup> {
    vec![
        KeywordGroup::new(
            "jira",
            &["jira", "issue", "ticket", "story", "bug", "sprint", "status"],
        ),
        KeywordGroup::new(
            "knowledge",
            &["knowledge", "document", "docs", "search", "wiki", "explain"],
        ),
        KeywordGroup::new(
            "standard",
            &["standard", "guideline", "convention", "naming", "review"],
        ),
        KeywordGroup::new(
            "code",
            &["code", "svn", "source", "file", "repository", "generate", "sql"],
        ),
        KeywordGroup::new("prompt", &["prompt", "analysis", "analyze", "save", "store"]),
        KeywordGroup::new("dashboard", &["dashboard", "todo", "task"]),
    ]
}

// ─── Selection ──────────────────────────────────────────────────────────────

/// A tool picked for a model turn.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedTool {
    /// `<server>__<tool>`, the name the model calls.
    pub qualified_name: String,
    pub server: String,
    pub tool: McpToolDefinition,
}

impl SelectedTool {
    /// Function definition sent to the model.
    pub fn to_tool_definition(&self) -> ToolDefinition {
        let parameters = if self.tool.input_schema.is_null() {
            serde_json::json!({"type": "object", "properties": {}})
        } else {
            self.tool.input_schema.clone()
        };
        ToolDefinition::function(&self.qualified_name, &self.tool.description, parameters)
    }
}

/// Selects a bounded, relevant subset of the tool catalogs for a prompt.
#[derive(Debug, Clone)]
pub struct ToolPrefilter {
    groups: Vec<KeywordGroup>,
    max_tools: usize,
}

impl Default for ToolPrefilter {
    fn default() -> Self {
        Self::new(default_groups())
    }
}

impl ToolPrefilter {
    /// Build a filter from keyword groups. An empty list means the defaults.
    pub fn new(groups: Vec<KeywordGroup>) -> Self {
        let groups = if groups.is_empty() {
            default_groups()
        } else {
            groups
        };
        Self {
            groups,
            max_tools: MAX_SELECTED_TOOLS,
        }
    }

    pub fn with_max_tools(mut self, max_tools: usize) -> Self {
        self.max_tools = max_tools.max(1);
        self
    }

    /// Categories the prompt selects, lowercased and in group order.
    ///
    /// Never empty: an unmatched prompt yields [`DEFAULT_CATEGORIES`].
    pub fn categories_for(&self, prompt: &str) -> Vec<String> {
        let lowered = prompt.to_lowercase();
        let mut categories: Vec<String> = Vec::new();

        if find_issue_key(prompt).is_some() {
            categories.push(ISSUE_CATEGORY.to_string());
        }

        for group in &self.groups {
            let category = group.category.to_lowercase();
            if categories.contains(&category) {
                continue;
            }
            let hit = std::iter::once(&group.category)
                .chain(group.triggers.iter())
                .any(|t| !t.is_empty() && lowered.contains(&t.to_lowercase()));
            if hit {
                categories.push(category);
            }
        }

        if categories.is_empty() {
            categories = DEFAULT_CATEGORIES.iter().map(|c| c.to_string()).collect();
        }
        categories
    }

    /// Pick the tools for one model turn, sorted by qualified name.
    pub fn select(&self, prompt: &str, catalogs: &[ServerCatalog]) -> Vec<SelectedTool> {
        let categories = self.categories_for(prompt);

        let mut selected: Vec<SelectedTool> = all_tools(catalogs)
            .filter(|t| tool_matches(t, &categories))
            .collect();

        if selected.is_empty() {
            selected = all_tools(catalogs).collect();
            if !selected.is_empty() {
                tracing::debug!(
                    categories = ?categories,
                    "no tool matched the prompt categories, offering the whole catalog"
                );
            }
        }

        selected.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));
        selected.truncate(self.max_tools);

        tracing::debug!(
            categories = ?categories,
            selected = selected.len(),
            "tool pre-filter"
        );
        selected
    }
}

fn all_tools(catalogs: &[ServerCatalog]) -> impl Iterator<Item = SelectedTool> + '_ {
    catalogs.iter().flat_map(|catalog| {
        catalog.tools.iter().map(move |tool| SelectedTool {
            qualified_name: qualify(&catalog.server, &tool.name),
            server: catalog.server.clone(),
            tool: tool.clone(),
        })
    })
}

fn tool_matches(tool: &SelectedTool, categories: &[String]) -> bool {
    let name = tool.tool.name.to_lowercase();
    let description = tool.tool.description.to_lowercase();
    let server = tool.server.to_lowercase();
    categories.iter().any(|c| {
        name.contains(c.as_str()) || description.contains(c.as_str()) || server.contains(c.as_str())
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────
