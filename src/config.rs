//! Bridge configuration.
//!
//! `bridge.yaml` holds the listen address, model endpoints, loop limits and
//! the progress endpoint; the tool servers live in a separate JSON file
//! (`mcp-servers.json`). String values may reference the environment as
//! `${VAR}` or `${VAR:-default}`, which keeps API keys out of the file.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::agent_core::orchestrator::{
    LoopConfig, DEFAULT_MAX_ITERATIONS, DEFAULT_MAX_PARALLEL_TOOLS,
};
use crate::agent_core::tool_prefilter::{KeywordGroup, ToolPrefilter};
use crate::inference::ModelsConfig;
use crate::mcp_client::client::{DEFAULT_CALL_TIMEOUT_MS, DEFAULT_SETTLE_MS};
use crate::mcp_client::McpServersConfig;

// ─── Constants ───────────────────────────────────────────────────────────────

pub const CONFIG_FILE_NAME: &str = "bridge.yaml";

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "AGENT_BRIDGE_CONFIG";

const DEFAULT_LISTEN: &str = "127.0.0.1:8765";
const DEFAULT_SERVERS_FILE: &str = "mcp-servers.json";

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not find bridge.yaml (searched upward from {searched})")]
    NotFound { searched: String },

    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Contents of `bridge.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Tool server file, relative to the config file's directory.
    #[serde(default = "default_servers_file")]
    pub servers_file: String,
    /// Working directory for servers without their own `cwd`.
    #[serde(default)]
    pub working_dir: Option<String>,
    pub models: ModelsConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    /// Directory of the loaded file; relative paths resolve against it.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}
fn default_servers_file() -> String {
    DEFAULT_SERVERS_FILE.to_string()
}

/// The `agent` section: loop limits and tool-call timing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_iterations: u32,
    pub max_parallel_tools: usize,
    pub call_timeout_ms: u64,
    /// Longest wait for a server's handshake when it starts.
    pub settle_ms: u64,
    /// Replaces the built-in keyword groups when non-empty.
    pub tool_categories: Vec<KeywordGroup>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_parallel_tools: DEFAULT_MAX_PARALLEL_TOOLS,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            settle_ms: DEFAULT_SETTLE_MS,
            tool_categories: Vec::new(),
        }
    }
}

impl AgentConfig {
    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            max_iterations: self.max_iterations,
            max_parallel_tools: self.max_parallel_tools,
        }
    }

    pub fn prefilter(&self) -> ToolPrefilter {
        ToolPrefilter::new(self.tool_categories.clone())
    }
}

/// The `progress` section. No endpoint means events are only logged.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProgressConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl BridgeConfig {
    /// Absolute path of the tool server file.
    pub fn servers_path(&self) -> PathBuf {
        resolve_path(&self.base_dir, &self.servers_file)
    }

    /// Global server working directory, resolved against the config dir.
    pub fn resolved_working_dir(&self) -> Option<String> {
        self.working_dir
            .as_deref()
            .filter(|d| !d.is_empty())
            .map(|d| resolve_path(&self.base_dir, d).to_string_lossy().into_owned())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_iterations == 0 {
            return Err(ConfigError::Invalid {
                reason: "agent.max_iterations must be at least 1".into(),
            });
        }
        if self.agent.max_parallel_tools == 0 {
            return Err(ConfigError::Invalid {
                reason: "agent.max_parallel_tools must be at least 1".into(),
            });
        }
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Invalid {
                reason: "listen address is empty".into(),
            });
        }
        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate `bridge.yaml`.
///
/// Order: the explicit path, then `AGENT_BRIDGE_CONFIG`, then an upward
/// search from `start`.
pub fn find_config(explicit: Option<&Path>, start: &Path) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Ok(PathBuf::from(expand_tilde(&path)));
        }
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(ConfigError::NotFound {
        searched: start.display().to_string(),
    })
}

/// Load and validate `bridge.yaml`, interpolating environment variables.
pub fn load_config(path: &Path) -> Result<BridgeConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let mut config: BridgeConfig =
        serde_yaml::from_str(&interpolate_env_vars(&raw)).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

    config.base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    config.validate()?;

    tracing::info!(
        path = %path.display(),
        active_model = %config.models.active_model,
        listen = %config.listen,
        "loaded bridge config"
    );
    Ok(config)
}

/// Load the tool server file.
///
/// A missing or unparsable file yields an empty configuration and a
/// warning: the bridge still runs, just without tools. An invalid entry
/// drops only that server. Relative `cwd` entries resolve against the
/// file's directory.
pub fn load_servers_config(path: &Path) -> McpServersConfig {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "no tool server config, starting without tools");
            return McpServersConfig::default();
        }
    };

    let mut config: McpServersConfig = match serde_json::from_str(&interpolate_env_vars(&content))
    {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to parse tool server config");
            return McpServersConfig::default();
        }
    };

    let base_dir = path.parent().unwrap_or(Path::new("."));
    for server in config.servers.values_mut() {
        if let Some(cwd) = server.cwd.as_deref() {
            server.cwd = Some(resolve_path(base_dir, cwd).to_string_lossy().into_owned());
        }
    }

    tracing::info!(
        path = %path.display(),
        count = config.servers.len(),
        servers = ?config.servers.keys().collect::<Vec<_>>(),
        "loaded tool server config"
    );
    config
}

fn resolve_path(base_dir: &Path, path: &str) -> PathBuf {
    let expanded = PathBuf::from(expand_tilde(path));
    if expanded.is_absolute() {
        expanded
    } else {
        base_dir.join(expanded)
    }
}

// ─── Interpolation ───────────────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` with environment values.
///
/// An unset variable without a default becomes the empty string.
pub fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
