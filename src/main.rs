#![forbid(unsafe_code)]

//! `agent-relay` binary.
//!
//! Loads configuration and credentials, probes the agent CLI, then keeps a
//! WebSocket connection to the controller until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_relay::config::ConfigStore;
use agent_relay::exec::spawner::probe_version;
use agent_relay::relay::{RelayClient, RelayEndpoint, SessionManager};
use agent_relay::system_info::SystemInfoProvider;
use agent_relay::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-relay", about = "Remote relay for a local coding agent", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "agent-relay.toml")]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the default working directory for executions.
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Set the controller URL and persist it to the config file.
    #[arg(long)]
    server_url: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-relay bootstrap");

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut store = ConfigStore::load(&args.config)?;

    if let Some(url) = args.server_url {
        store.set_server_url(url);
        store.save()?;
        info!(path = %store.path().display(), "server url saved");
    }

    if let Some(dir) = args.workdir {
        let canonical = dir
            .canonicalize()
            .map_err(|err| AppError::Config(format!("invalid workdir override: {err}")))?;
        store.set_default_working_directory(canonical);
    }

    let agent_id = store.ensure_agent_id()?;
    store.load_token().await?;

    if !store.is_configured() {
        return Err(AppError::Config(format!(
            "relay is not configured: set server_url in {} and provide a token",
            store.path().display()
        )));
    }
    let (Some(url), Some(token)) = (store.server_url(), store.token()) else {
        return Err(AppError::Config("missing server url or token".into()));
    };
    let endpoint = RelayEndpoint {
        url: url.to_owned(),
        token: token.to_owned(),
        agent_id: agent_id.clone(),
    };
    info!(agent_id, "configuration loaded");

    // ── Probe the agent CLI ─────────────────────────────
    let config = Arc::new(store.config().clone());
    let (version, probe_error) = match probe_version(&config.agent.binary).await {
        Ok(version) => {
            info!(version, "agent cli detected");
            (Some(version), None)
        }
        Err(err) => {
            warn!(%err, "agent cli version probe failed");
            (None, Some(err))
        }
    };

    let (mut manager, events_rx) =
        SessionManager::new(agent_id, Arc::clone(&config), SystemInfoProvider::new(version));
    if let Some(err) = probe_error.filter(|_| config.agent.preflight) {
        manager.mark_unavailable(err.to_string());
    }

    // ── Serve ───────────────────────────────────────────
    let ct = CancellationToken::new();
    let client = RelayClient::new(endpoint, &config.connection, manager, events_rx);
    let mut relay_handle = tokio::spawn(client.run(ct.clone()));

    let finished = tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown signal received");
            ct.cancel();
            None
        }
        result = &mut relay_handle => Some(result),
    };
    let result = match finished {
        Some(result) => result,
        None => relay_handle.await,
    };

    match result {
        Ok(Ok(())) => {
            info!("agent-relay shut down");
            Ok(())
        }
        Ok(Err(err)) => {
            error!(%err, "relay stopped");
            Err(err)
        }
        Err(join_err) => Err(AppError::Connection(format!("relay task failed: {join_err}"))),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
