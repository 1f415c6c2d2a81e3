//! monitor-agent
//!
//! Supervises local exporters and runs actions for the control plane over one
//! streaming connection, reconnecting until stopped. Configuration comes from
//! `--config` or the `MONITOR_AGENT_CONFIG` env var.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use monitor_agent::actions::{ActionRegistry, JobRegistry};
use monitor_agent::checker::TcpConnectionChecker;
use monitor_agent::client::{Client, ClientError, AGENT_VERSION};
use monitor_agent::config::Config;
use monitor_agent::supervisor::Supervisor;
use monitor_agent::transport::TcpDialer;

#[derive(Parser, Debug)]
#[command(name = "monitor-agent")]
#[command(about = "Host agent for exporters, actions and jobs driven by a control plane")]
struct Args {
    /// Path to the JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => Config::from_file(path),
        None => Config::from_env(),
    }
    .context("Failed to load configuration")?;

    info!(
        version = AGENT_VERSION,
        agent_id = ?config.agent_id(),
        server = ?config.server_address(),
        "Loaded configuration"
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                signal.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });

    let supervisor = Arc::new(Supervisor::new(&config, shutdown.child_token()));
    let actions = ActionRegistry::with_builtin(&config.paths);
    let jobs = JobRegistry::new();

    // One Client per connection; a dropped connection gets a fresh one.
    while !shutdown.is_cancelled() {
        let client = Client::new(
            config.clone(),
            Arc::new(TcpDialer),
            supervisor.clone(),
            Arc::new(TcpConnectionChecker),
            actions.clone(),
            jobs.clone(),
        );
        match client.run(shutdown.clone()).await {
            Ok(()) => break,
            Err(e @ ClientError::Config(_)) => {
                error!(error = %e, "Not connecting");
                break;
            }
            Err(e) => warn!(error = %e, "Connection ended"),
        }

        tokio::select! {
            () = tokio::time::sleep(config.connection.backoff_min()) => {}
            () = shutdown.cancelled() => {}
        }
    }

    supervisor.stop_all().await;
    info!("Agent stopped");
    Ok(())
}
