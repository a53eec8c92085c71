#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # bctl
//!
//! Tunnels kubectl to a cluster's API server through a relay, with every
//! request signed and hash-chained end to end.
//!
//! ## Subcommands
//!
//! - `bctl daemon`: serve kubectl on `https://127.0.0.1:<daemonPort>`
//! - `bctl agent`: run inside the cluster and execute tunnelled requests
//!
//! ## Daemon flags
//!
//! | Flag                | Meaning                                          |
//! |---------------------|--------------------------------------------------|
//! | `--sessionId`       | Relay session this daemon belongs to             |
//! | `--authHeader`      | `Authorization` header for the relay             |
//! | `--serviceURL`      | Relay base URL                                   |
//! | `--assumeRole`      | Kubernetes user the agent impersonates           |
//! | `--assumeClusterId` | Target cluster                                   |
//! | `--environmentId`   | Target environment                               |
//! | `--daemonPort`      | Local HTTPS port                                 |
//! | `--localhostToken`  | Token kubectl must present                       |
//! | `--certPath`        | PEM certificate for the local endpoint           |
//! | `--keyPath`         | PEM private key for the local endpoint           |
//! | `--configPath`      | Keysplitting identity (JSON)                     |
//! | `--logPath`         | Log file                                         |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          entry point, clap subcommands, tracing, signals
//! config.rs        flags, environment overrides, TOML tunnel tuning
//! error.rs         Error and its wire classes
//! message/         envelopes: keysplitting, stream, error, control
//! keysplitting/    hashing, signing, bzcert, daemon and agent engines
//! transport/       SignalR websocket to the relay, reconnect, challenge
//! action/          action paths, payloads, ordering, remote-command frames
//! daemon/          HTTPS ingress, sessions, rest/stream/exec
//! agent/           control and data channels, kube plugin, vault
//! ```

use std::fs::OpenOptions;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Mutex;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use bctl::config::{AgentArgs, AgentConfig, DaemonArgs, DaemonConfig, TransportConfig};
use bctl::{agent, daemon, Error, Result};

/// Keysplitting-authenticated kubectl tunnel.
#[derive(Parser)]
#[command(name = "bctl", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve kubectl locally and tunnel its requests to the cluster agent.
    Daemon(DaemonArgs),
    /// Run inside the cluster and execute tunnelled requests.
    Agent(AgentArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _ = rustls::crypto::ring::default_provider().install_default();

    let outcome = match cli.command {
        Commands::Daemon(args) => run_daemon(args).await,
        Commands::Agent(args) => run_agent(args).await,
    };
    match outcome {
        Ok(()) => {
            info!("Goodbye");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            eprintln!("bctl: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_daemon(args: DaemonArgs) -> Result<()> {
    let config = DaemonConfig::from_args(args)?;
    init_tracing(Some(&config.log_path))?;
    info!("bctl daemon v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        session = %config.session_id,
        cluster = %config.assume_cluster_id,
        "Relay: {}",
        config.service_url
    );

    let transport_config = TransportConfig::load()?;
    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));
    daemon::run(config, transport_config, shutdown).await
}

async fn run_agent(args: AgentArgs) -> Result<()> {
    init_tracing(None)?;
    let config = AgentConfig::from_env(args)?;
    info!("bctl agent v{} starting", env!("CARGO_PKG_VERSION"));
    info!(org = %config.org_id, "Relay: {}", config.service_url);

    let transport_config = TransportConfig::load()?;
    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));
    agent::run(config, transport_config, cancel).await
}

/// `RUST_LOG` wins, otherwise `info`. With a path, logs go to that file
/// without colour; otherwise to stdout.
fn init_tracing(log_path: Option<&Path>) -> Result<()> {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    match log_path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| Error::startup(format!("could not open {}: {e}", path.display())))?;
            tracing_subscriber::fmt()
                .with_env_filter(log_filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => tracing_subscriber::fmt().with_env_filter(log_filter).init(),
    }
    Ok(())
}

async fn cancel_on_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Could not register SIGTERM: {e}");
                let _ = ctrl_c.await;
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("Received SIGINT");
    }
    info!("Shutting down...");
    token.cancel();
}
