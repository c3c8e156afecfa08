pub mod agent_core;
pub mod bridge;
pub mod config;
pub mod inference;
pub mod mcp_client;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use agent_core::progress::ProgressError;
use agent_core::{
    HttpProgressSink, LogProgressSink, Orchestrator, ProgressBroadcaster, ProgressSink,
};
use bridge::{BridgeError, BridgeServer};
use config::BridgeConfig;
use inference::{InferenceClient, InferenceError};
use mcp_client::McpClient;

/// How long shutdown waits for queued progress events to be published.
const PROGRESS_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that stop the bridge from starting.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Model(#[from] InferenceError),

    #[error(transparent)]
    Progress(#[from] ProgressError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Return the platform-standard data directory for the bridge.
///
/// - macOS: `~/Library/Application Support/agent-bridge/`
/// - Windows: `{FOLDERID_RoamingAppData}\agent-bridge\`
/// - Linux: `$XDG_DATA_HOME/agent-bridge/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.agent-bridge/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("agent-bridge");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agent-bridge")
}

// ─── Logging ─────────────────────────────────────────────────────────────────

/// Where and how logs are written.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOptions {
    /// One JSON object per line instead of human-readable text.
    pub json: bool,
    /// Write to stderr instead of the rotated log file.
    pub stderr: bool,
}

/// Initialize the tracing subscriber.
///
/// By default logs go to `bridge.log` in the data directory:
/// 1. Rotates existing logs (bridge.log → bridge.log.1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh bridge.log with a line-flushing writer for crash resilience.
/// 3. Logs a startup banner with the log file path for discoverability.
///
/// Returns the log file path, or `None` when logging to stderr.
pub fn init_tracing(options: LogOptions) -> std::io::Result<Option<PathBuf>> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::EnvFilter;

    let (writer, log_path) = if options.stderr {
        (BoxMakeWriter::new(std::io::stderr), None)
    } else {
        let log_dir = data_dir();
        std::fs::create_dir_all(&log_dir)?;
        let log_path = log_dir.join("bridge.log");

        // Rotate: bridge.log.2 → .3, .1 → .2, bridge.log → .1
        rotate_log_file(&log_path, 3);

        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        (BoxMakeWriter::new(FlushingWriter::new(log_file)), Some(log_path))
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("agent_bridge=info,warn"));

    let builder = fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);

    // A subscriber may already be installed (tests, embedding)
    let _ = if options.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_path.as_ref().map(|p| p.display().to_string()),
        pid = std::process::id(),
        "=== agent-bridge starting ==="
    );
    Ok(log_path)
}

/// Rotate log files: `bridge.log` → `bridge.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &std::path::Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Without explicit flushing, log entries may sit in OS buffers and be lost
/// when the process is killed.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── Run ─────────────────────────────────────────────────────────────────────

/// Start tool servers and serve bridge clients until `shutdown` fires.
///
/// The listen address is bound before any tool server starts, so a port
/// conflict fails fast. Tool servers that fail to start are logged and
/// skipped.
pub async fn run(config: BridgeConfig, shutdown: CancellationToken) -> Result<(), StartupError> {
    let model = Arc::new(InferenceClient::from_config(&config.models)?);
    tracing::info!(
        model = model.current_model_name(),
        "inference client ready"
    );

    let sink: Arc<dyn ProgressSink> = match config
        .progress
        .endpoint
        .as_deref()
        .filter(|e| !e.trim().is_empty())
    {
        Some(endpoint) => {
            let sink = HttpProgressSink::new(endpoint)?;
            tracing::info!(url = sink.url(), "publishing progress over HTTP");
            Arc::new(sink)
        }
        None => Arc::new(LogProgressSink),
    };
    let (progress, progress_worker) = ProgressBroadcaster::spawn(sink);

    let listener = BridgeServer::bind(&config.listen).await?;

    let servers = config::load_servers_config(&config.servers_path());
    let mut mcp = McpClient::new(servers, config.resolved_working_dir());
    mcp.set_call_timeout(config.agent.call_timeout_ms);
    mcp.set_settle(config.agent.settle_ms);
    let mcp = Arc::new(mcp);

    mcp.start_all().await;
    tracing::info!(
        running_servers = mcp.running_server_count(),
        total_tools = mcp.tool_count(),
        "MCP client initialized"
    );

    let orchestrator = Arc::new(
        Orchestrator::new(model, mcp.clone(), progress, config.agent.loop_config())
            .with_prefilter(config.agent.prefilter()),
    );
    let server = BridgeServer::new(orchestrator, shutdown);
    server.serve(listener).await;
    drop(server);

    mcp.shutdown_all().await;
    if tokio::time::timeout(PROGRESS_DRAIN_TIMEOUT, progress_worker)
        .await
        .is_err()
    {
        tracing::debug!("progress queue not drained before exit");
    }
    tracing::info!("=== agent-bridge stopped ===");
    Ok(())
}
