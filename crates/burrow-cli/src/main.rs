//! Burrow agent CLI: save a token, start tunnels.
//!
//! Exit codes: 0 normal, 1 fatal error, 2 session conflict
//! (another agent holds this user's session and `--force` was not given).

mod config;

use anyhow::{Context, Result};
use burrow_agent::{Event, ReconnectConfig, Tunnel, TunnelConfig, TunnelError};
use clap::{Parser, Subcommand};
use config::ConfigManager;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_BROKER: &str = "localhost:4443";

/// Expose local servers through burrow tunnels
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "A secure request tunneling tool", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Save an authentication token
    Auth {
        /// Token issued by the dashboard (shown once at creation)
        token: String,
    },
    /// Start a public tunnel to a local port
    Start {
        /// Local port to expose
        port: u16,

        /// Broker control plane address (host:port)
        #[arg(short, long, env = "BURROW_BROKER")]
        broker: Option<String>,

        /// Authentication token (overrides the saved one)
        #[arg(short, long, env = "BURROW_TOKEN")]
        token: Option<String>,

        /// Evict an existing session for this user
        #[arg(short, long)]
        force: bool,

        /// Skip TLS certificate verification (development only)
        #[arg(long)]
        insecure: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_new(&cli.log_level).unwrap_or_default())
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Auth { token } => match ConfigManager::save_token(token) {
            Ok(path) => {
                println!("Token saved to {}", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "failed to save token");
                ExitCode::FAILURE
            }
        },
        Commands::Start {
            port,
            broker,
            token,
            force,
            insecure,
        } => match run_tunnel(port, broker, token, force, insecure) {
            Ok(()) => ExitCode::SUCCESS,
            Err(RunError::Tunnel(e)) => {
                error!(error = %e, "tunnel stopped");
                ExitCode::from(e.exit_code() as u8)
            }
            Err(RunError::Setup(e)) => {
                error!(error = %e, "failed to start");
                ExitCode::FAILURE
            }
        },
    }
}

enum RunError {
    Setup(anyhow::Error),
    Tunnel(TunnelError),
}

fn run_tunnel(
    port: u16,
    broker: Option<String>,
    token: Option<String>,
    force: bool,
    insecure: bool,
) -> Result<(), RunError> {
    let saved = ConfigManager::load().map_err(RunError::Setup)?;

    let token = token
        .or(saved.token)
        .context("no token configured; run `burrow auth <token>` first")
        .map_err(RunError::Setup)?;
    let broker_addr = broker
        .or(saved.broker_addr)
        .unwrap_or_else(|| DEFAULT_BROKER.to_string());

    let runtime = tokio::runtime::Runtime::new()
        .context("failed to start async runtime")
        .map_err(RunError::Setup)?;

    runtime.block_on(async move {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let config = TunnelConfig::new(broker_addr.clone(), token, port)
            .with_force(force)
            .with_insecure(insecure);
        let tunnel = Arc::new(Tunnel::new(config));

        // Print tunnel lifecycle to the terminal.
        let mut events = tunnel.events().subscribe();
        let printer = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    Event::TunnelReady { domains } => {
                        println!("Tunnel established! Incoming traffic on:");
                        for domain in domains {
                            println!(" - {} -> localhost:{}", domain, port);
                        }
                    }
                    Event::Reconnecting { delay, attempt } => {
                        info!(?delay, attempt, "reconnecting");
                    }
                    Event::Disconnected { reason } => {
                        info!(reason, "disconnected");
                    }
                    _ => {}
                }
            }
        });

        // Ctrl-C cancels the tunnel; everything closes within its grace.
        let cancel = tunnel.cancel_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                cancel.cancel();
            }
        });

        info!(broker = %broker_addr, port, "starting tunnel");
        let err = tunnel.run(ReconnectConfig::default()).await;
        printer.abort();

        match err {
            TunnelError::Cancelled => Ok(()),
            e => Err(RunError::Tunnel(e)),
        }
    })
}
