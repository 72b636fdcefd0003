//! Burrow broker binary: public ingress + control plane + bandwidth
//! accounting over a sqlite-backed user store.

use anyhow::{Context, Result};
use burrow_broker::broker::tls_acceptor_from_files;
use burrow_broker::{Broker, BrokerConfig};
use burrow_db::SqlStore;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Run the burrow broker
#[derive(Parser, Debug)]
#[command(name = "burrow-broker")]
#[command(about = "Public broker for burrow reverse tunnels", long_about = None)]
#[command(version)]
struct Args {
    /// Public root domain; tunnels bind as <name>.<domain>
    #[arg(long, env = "DOMAIN_NAME")]
    domain: Option<String>,

    /// Control plane bind address (":4443" or "host:4443")
    #[arg(long, env = "CONTROL_PLANE_PORT", default_value = ":4443")]
    control_addr: String,

    /// Public ingress bind address (defaults to :8080, or :443 with TLS)
    #[arg(long, env = "INGRESS_ADDR")]
    ingress_addr: Option<String>,

    /// Serve plain HTTP even with a domain configured (development)
    #[arg(long, env = "INSECURE_HTTP")]
    insecure_http: bool,

    /// Daily per-user bandwidth allowance in MiB (0 = unlimited)
    #[arg(long, env = "DAILY_BANDWIDTH_LIMIT_MB", default_value = "100")]
    daily_bandwidth_limit_mb: u64,

    /// Database connection string
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://burrow.db?mode=rwc")]
    database_url: String,

    /// TLS certificate (PEM) for the ingress and control plane
    #[arg(long, env = "TLS_CERT")]
    tls_cert: Option<String>,

    /// TLS private key (PEM) for the ingress and control plane
    #[arg(long, env = "TLS_KEY")]
    tls_key: Option<String>,

    /// Concurrent agent session cap
    #[arg(long, default_value = "1000")]
    max_sessions: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_new(&args.log_level).unwrap_or_default())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut config = BrokerConfig {
        root_domain: args.domain.clone(),
        control_addr: args.control_addr.clone(),
        insecure_http: args.insecure_http,
        daily_limit_bytes: args.daily_bandwidth_limit_mb * 1024 * 1024,
        max_sessions: args.max_sessions,
        ..Default::default()
    };
    config.ingress_addr = args
        .ingress_addr
        .clone()
        .unwrap_or_else(|| if config.is_secure() { ":443" } else { ":8080" }.to_string());

    let store = SqlStore::connect(&args.database_url)
        .await
        .with_context(|| format!("failed to open database {}", args.database_url))?;

    // Local/dev brokers get a ready-to-use test account.
    if !config.is_secure() {
        store
            .seed_dev_data()
            .await
            .context("failed to seed dev data")?;
    }

    let mut builder = Broker::builder(config.clone()).store(Arc::new(store));

    if config.is_secure() {
        let cert = args
            .tls_cert
            .as_deref()
            .context("TLS_CERT is required when DOMAIN_NAME is set")?;
        let key = args
            .tls_key
            .as_deref()
            .context("TLS_KEY is required when DOMAIN_NAME is set")?;
        let acceptor = tls_acceptor_from_files(cert, key).context("failed to load TLS material")?;
        builder = builder
            .control_tls(acceptor.clone())
            .ingress_tls(acceptor);
        info!(domain = ?config.root_domain, "TLS enabled on ingress and control plane");
    } else {
        warn!("running without TLS (local dev mode)");
    }

    let broker = builder.build().context("failed to assemble broker")?;

    info!(
        control = %config.control_addr,
        ingress = %config.ingress_addr,
        limit_mb = args.daily_bandwidth_limit_mb,
        "starting burrow broker"
    );

    broker.run().await.context("broker exited with error")?;
    Ok(())
}
