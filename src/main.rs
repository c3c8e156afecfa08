//! agent-bridge daemon.
//!
//! Loads `bridge.yaml`, starts the configured tool servers and serves
//! conversation requests over WebSocket until Ctrl-C.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use agent_bridge::config::{find_config, load_config};
use agent_bridge::LogOptions;

/// Command-line arguments for the bridge daemon
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to bridge.yaml (default: $AGENT_BRIDGE_CONFIG, then upward search)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the config file
    #[arg(short, long)]
    listen: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false)]
    log_json: bool,

    /// Log to stderr instead of the rotated log file
    #[arg(long, default_value_t = false)]
    log_stderr: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_path = agent_bridge::init_tracing(LogOptions {
        json: args.log_json,
        stderr: args.log_stderr,
    })
    .context("failed to initialize logging")?;
    if let Some(path) = log_path {
        eprintln!("agent-bridge: logging to {}", path.display());
    }

    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let config_path = find_config(args.config.as_deref(), &cwd)?;
    let mut config = load_config(&config_path)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
        }
        signal.cancel();
    });

    agent_bridge::run(config, shutdown)
        .await
        .context("bridge failed to start")?;
    Ok(())
}
