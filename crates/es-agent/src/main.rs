//! EasyShell Agent Daemon
//!
//! Registers this host with the control server, then keeps three loops
//! running until SIGINT/SIGTERM: the duplex connection, the heartbeat and
//! the remote config poller.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use es_agent::metrics;
use es_agent::AgentState;
use es_core::config::{self, AgentConfig};

/// How long shutdown waits for the loops to finish
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "es-agent")]
#[command(about = "EasyShell agent - runs remote scripts and terminals for the control server")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Control server base URL, e.g. http://control:8080
    #[arg(short, long, env = "EASYSHELL_SERVER_URL")]
    server_url: Option<String>,

    /// Agent ID (defaults to one derived from the hostname)
    #[arg(long, env = "EASYSHELL_AGENT_ID")]
    agent_id: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);

    let config_found = config_path.exists();
    let mut config: AgentConfig = if config_found {
        config::load_config(&config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?
    } else {
        AgentConfig::default()
    };

    // Apply command-line overrides
    if let Some(server_url) = args.server_url {
        config.server_url = server_url;
    }
    if let Some(agent_id) = args.agent_id {
        config.agent_id = Some(agent_id);
    }
    if let Some(log_level) = args.log_level {
        config.log_level = log_level;
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if !config_found {
        tracing::warn!("No config at {:?}, using defaults", config_path);
    }

    let hostname = metrics::hostname();
    let agent_id = config.resolve_agent_id(&hostname);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        server_url = %config.server_url,
        agent_id = %agent_id,
        "EasyShell Agent starting..."
    );

    let state = AgentState::new(config, agent_id).context("Failed to set up agent")?;

    let info = metrics::collect_system_info();
    tracing::info!(
        "Host: {} ({}/{}, {} cores, kernel {})",
        info.hostname,
        info.os,
        info.arch,
        info.cpu_cores,
        info.kernel
    );
    state
        .client
        .register(&info.register_request(&state.agent_id, env!("CARGO_PKG_VERSION")))
        .await
        .context("Failed to register agent")?;

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let manager = state.connection_manager();
    let stop = shutdown.clone();
    tasks.spawn(async move { manager.run(stop).await });

    let heartbeat = state.heartbeat.clone();
    let stop = shutdown.clone();
    tasks.spawn(async move { heartbeat.run(stop).await });

    let poller = state.config_poller();
    let stop = shutdown.clone();
    tasks.spawn(async move { poller.run(stop).await });

    tracing::info!("EasyShell Agent running");

    wait_for_signal().await;
    tracing::info!("Shutting down...");
    shutdown.cancel();

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::warn!("Task ended abnormally: {}", e);
            }
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!("Shutdown grace period elapsed, aborting remaining tasks");
        tasks.abort_all();
    }

    state.sessions.close_all();
    tracing::info!("EasyShell Agent stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
    }
}
