//! Server process lifecycle management.
//!
//! Handles spawning, handshaking, monitoring, restarting, and shutting down
//! MCP server child processes. Each server runs as a separate OS process
//! communicating via JSON-RPC over stdio.
//!
//! A spawned server is usable as soon as its process is up. The handshake
//! (`initialize`, `notifications/initialized`, `tools/list`) runs in the
//! background; `spawn_server` waits for the `initialize` reply for at most
//! the configured settle window and the catalog may fill in later.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::errors::McpError;
use super::transport::{extract_result, StdioTransport};
use super::types::{
    InitializeResult, McpToolDefinition, ServerConfig, ToolListResult, CLIENT_NAME,
    CLIENT_VERSION, PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Maximum restart attempts before giving up on a server.
pub const MAX_RESTART_ATTEMPTS: u32 = 3;

/// Base delay between restart attempts (doubles each time).
const RESTART_BASE_DELAY: Duration = Duration::from_secs(1);

/// Timeout for each handshake request (`initialize`, each `tools/list` page).
///
/// Python servers that import large client libraries at startup can take
/// tens of seconds before their first reply.
const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Time a server gets to exit after stdin is closed before it is killed.
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Upper bound on `shutdown()`.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on `tools/list` pages followed per handshake.
const MAX_TOOL_PAGES: usize = 32;

/// Stderr lines kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

// ─── Shared State ────────────────────────────────────────────────────────────

/// State written by the background tasks and read by the gateway.
#[derive(Debug, Default)]
struct ServerState {
    available: AtomicBool,
    tools: RwLock<Arc<Vec<McpToolDefinition>>>,
    stderr_tail: std::sync::Mutex<VecDeque<String>>,
}

/// `available` only changes to false, and the catalog is only filled, while
/// the catalog write lock is held.
impl ServerState {
    fn mark_unavailable(&self) {
        let mut slot = self.tools.write().unwrap_or_else(|p| p.into_inner());
        self.available.store(false, Ordering::SeqCst);
        *slot = Arc::new(Vec::new());
    }

    /// Assign the catalog unless the server has already gone away.
    fn fill_tools(&self, tools: Vec<McpToolDefinition>) -> bool {
        let mut slot = self.tools.write().unwrap_or_else(|p| p.into_inner());
        if !self.available.load(Ordering::SeqCst) {
            return false;
        }
        *slot = Arc::new(tools);
        true
    }

    fn tools(&self) -> Arc<Vec<McpToolDefinition>> {
        let slot = self.tools.read().unwrap_or_else(|p| p.into_inner());
        Arc::clone(&slot)
    }

    fn push_stderr(&self, line: String) {
        let mut tail = self.stderr_tail.lock().unwrap_or_else(|p| p.into_inner());
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    fn stderr_tail(&self) -> String {
        let tail = self.stderr_tail.lock().unwrap_or_else(|p| p.into_inner());
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

// ─── ManagedServer ───────────────────────────────────────────────────────────

/// A running MCP server process with its transport and tool catalog.
pub struct ManagedServer {
    /// Server name from the configuration (e.g., "jira").
    pub name: String,
    /// The config used to spawn this server (retained for restart).
    config: ServerConfig,
    transport: Arc<StdioTransport>,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
    restart_count: u32,
}

impl ManagedServer {
    /// Whether the process is up and its stdout still open.
    pub fn is_available(&self) -> bool {
        self.state.available.load(Ordering::SeqCst)
    }

    /// Current tool catalog. Empty until `tools/list` has been answered.
    pub fn tools(&self) -> Arc<Vec<McpToolDefinition>> {
        self.state.tools()
    }

    pub fn transport(&self) -> &StdioTransport {
        &self.transport
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// How many times this server has been restarted.
    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// Stop the server: close stdin, then kill it if it does not exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.watcher.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
                tracing::warn!(server = %self.name, "shutdown timed out");
            }
        }
        self.state.mark_unavailable();
    }
}

impl Drop for ManagedServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for ManagedServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedServer")
            .field("name", &self.name)
            .field("available", &self.is_available())
            .field("tools", &self.tools().len())
            .field("restart_count", &self.restart_count)
            .finish()
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn a single MCP server process and start its handshake.
///
/// Returns once the server has answered `initialize` or `settle` has elapsed,
/// whichever comes first. Only a failure to start the process is an error;
/// handshake failures surface as the server going unavailable.
pub async fn spawn_server(
    name: &str,
    config: &ServerConfig,
    working_dir: Option<&str>,
    settle: Duration,
) -> Result<Arc<ManagedServer>, McpError> {
    spawn_with_restart_count(name, config, working_dir, settle, 0).await
}

async fn spawn_with_restart_count(
    name: &str,
    config: &ServerConfig,
    working_dir: Option<&str>,
    settle: Duration,
    restart_count: u32,
) -> Result<Arc<ManagedServer>, McpError> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);

    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    // Per-server cwd overrides the global working_dir
    let effective_dir = config.cwd.as_deref().or(working_dir);
    if let Some(dir) = effective_dir {
        cmd.current_dir(dir);
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
        name: name.to_string(),
        reason: format!("{e}"),
    })?;

    let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdin".into(),
    })?;
    let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdout".into(),
    })?;

    let state = Arc::new(ServerState::default());
    state.available.store(true, Ordering::SeqCst);

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(drain_stderr(name.to_string(), stderr, Arc::clone(&state)));
    }

    let transport = Arc::new(StdioTransport::new(name, stdin, stdout));
    let shutdown = CancellationToken::new();

    tracing::info!(
        server = name,
        command = %config.command,
        pid = child.id().unwrap_or_default(),
        "spawned MCP server"
    );

    let watcher = tokio::spawn(watch_process(
        name.to_string(),
        child,
        Arc::clone(&transport),
        Arc::clone(&state),
        shutdown.clone(),
    ));

    let (ready_tx, mut ready_rx) = watch::channel(false);
    tokio::spawn(handshake(
        name.to_string(),
        Arc::clone(&transport),
        Arc::clone(&state),
        shutdown.clone(),
        ready_tx,
    ));

    // Errors here mean the handshake task ended without signalling ready;
    // either way there is nothing more to wait for.
    match tokio::time::timeout(settle, ready_rx.wait_for(|ready| *ready)).await {
        Ok(Ok(_)) => tracing::debug!(server = name, "server initialized within settle window"),
        Ok(Err(_)) => tracing::debug!(server = name, "handshake ended before ready"),
        Err(_) => tracing::debug!(
            server = name,
            settle_ms = settle.as_millis() as u64,
            "settle window elapsed, catalog will fill in later"
        ),
    }

    Ok(Arc::new(ManagedServer {
        name: name.to_string(),
        config: config.clone(),
        transport,
        state,
        shutdown,
        watcher: Mutex::new(Some(watcher)),
        restart_count,
    }))
}

/// Forward server stderr into the log, keeping a short tail for diagnostics.
async fn drain_stderr(name: String, stderr: ChildStderr, state: Arc<ServerState>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::debug!(server = %name, line = %line, "server stderr");
                state.push_stderr(line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(server = %name, error = %e, "stderr read failed");
                break;
            }
        }
    }
}

/// Wait for the process to exit, its stdout to close, or a shutdown request.
async fn watch_process(
    name: String,
    mut child: Child,
    transport: Arc<StdioTransport>,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
) {
    tokio::select! {
        status = child.wait() => {
            state.mark_unavailable();
            match status {
                Ok(status) => tracing::warn!(server = %name, %status, "server exited"),
                Err(e) => tracing::warn!(server = %name, error = %e, "failed to wait on server"),
            }
        }
        _ = transport.closed() => {
            state.mark_unavailable();
            tracing::warn!(server = %name, "server closed stdout, stopping it");
            let _ = child.kill().await;
        }
        _ = shutdown.cancelled() => {
            state.mark_unavailable();
            transport.close_input().await;
            if tokio::time::timeout(EXIT_GRACE, child.wait()).await.is_err() {
                tracing::debug!(server = %name, "server ignored stdin close, killing");
                let _ = child.kill().await;
            }
            tracing::info!(server = %name, "server stopped");
        }
    }
}

/// Run the MCP handshake and fill the catalog.
async fn handshake(
    name: String,
    transport: Arc<StdioTransport>,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
    ready: watch::Sender<bool>,
) {
    let init = match initialize(&transport, &name).await {
        Ok(init) => init,
        Err(e) => {
            let stderr = state.stderr_tail();
            let err = McpError::InitFailed {
                name: name.clone(),
                reason: format!("{e}{}", format_stderr_suffix(&stderr)),
            };
            tracing::warn!(server = %name, error = %err, "handshake failed");
            state.mark_unavailable();
            shutdown.cancel();
            return;
        }
    };

    tracing::info!(
        server = %name,
        protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
        server_name = init
            .server_info
            .as_ref()
            .and_then(|info| info.name.as_deref())
            .unwrap_or("unknown"),
        "server initialized"
    );
    let _ = ready.send(true);

    if let Err(e) = transport.notify("notifications/initialized", None).await {
        tracing::warn!(server = %name, error = %e, "failed to send initialized notification");
        return;
    }

    match list_tools(&transport, &name).await {
        Ok(tools) => {
            let count = tools.len();
            if state.fill_tools(tools) {
                tracing::info!(server = %name, tools = count, "tool catalog loaded");
            } else {
                tracing::debug!(server = %name, "server gone before its catalog arrived");
            }
        }
        Err(e) => tracing::warn!(server = %name, error = %e, "tools/list failed"),
    }
}

/// Send `initialize` and parse its result.
async fn initialize(
    transport: &StdioTransport,
    server_name: &str,
) -> Result<InitializeResult, McpError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": CLIENT_VERSION,
        },
    });

    let response = transport
        .request_with_timeout("initialize", Some(params), INIT_TIMEOUT)
        .await?;
    let result = extract_result(response)?;

    serde_json::from_value(result).map_err(|e| McpError::InitFailed {
        name: server_name.to_string(),
        reason: format!("failed to parse initialize response: {e}"),
    })
}

/// Fetch the full catalog, following `nextCursor` pagination.
async fn list_tools(
    transport: &StdioTransport,
    server_name: &str,
) -> Result<Vec<McpToolDefinition>, McpError> {
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_TOOL_PAGES {
        let params = cursor
            .as_ref()
            .map(|c| serde_json::json!({ "cursor": c }));
        let response = transport
            .request_with_timeout("tools/list", params, INIT_TIMEOUT)
            .await?;
        let page: ToolListResult =
            serde_json::from_value(extract_result(response)?).map_err(|e| {
                McpError::InitFailed {
                    name: server_name.to_string(),
                    reason: format!("failed to parse tools/list response: {e}"),
                }
            })?;

        tools.extend(page.tools);
        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => return Ok(tools),
        }
    }

    tracing::warn!(
        server = server_name,
        pages = MAX_TOOL_PAGES,
        "tools/list pagination limit reached"
    );
    Ok(tools)
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

/// Restart a server with exponential backoff.
///
/// Returns the new `ManagedServer` if successful, or an error if all
/// attempts are exhausted.
pub async fn restart_server(
    name: &str,
    config: &ServerConfig,
    working_dir: Option<&str>,
    settle: Duration,
    current_restart_count: u32,
) -> Result<Arc<ManagedServer>, McpError> {
    if current_restart_count >= MAX_RESTART_ATTEMPTS {
        return Err(McpError::RestartExhausted {
            name: name.to_string(),
            attempts: MAX_RESTART_ATTEMPTS,
        });
    }

    // Exponential backoff: 1s, 2s, 4s
    let delay = RESTART_BASE_DELAY * 2u32.pow(current_restart_count);
    tracing::info!(
        server = name,
        attempt = current_restart_count + 1,
        delay_ms = delay.as_millis() as u64,
        "restarting server"
    );
    sleep(delay).await;

    spawn_with_restart_count(name, config, working_dir, settle, current_restart_count + 1).await
}

// ─── Batch Operations ────────────────────────────────────────────────────────

/// Spawn all configured servers concurrently.
///
/// Servers that fail to start are returned as errors alongside the ones
/// that did (partial startup is acceptable).
pub async fn spawn_all_servers(
    configs: &HashMap<String, ServerConfig>,
    working_dir: Option<&str>,
    settle: Duration,
) -> (HashMap<String, Arc<ManagedServer>>, Vec<(String, McpError)>) {
    let spawns = configs.iter().map(|(name, config)| async move {
        (
            name.clone(),
            spawn_server(name, config, working_dir, settle).await,
        )
    });

    let mut servers = HashMap::new();
    let mut errors = Vec::new();
    for (name, result) in futures::future::join_all(spawns).await {
        match result {
            Ok(server) => {
                servers.insert(name, server);
            }
            Err(e) => errors.push((name, e)),
        }
    }

    (servers, errors)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
