//! Broker assembly: builds the control plane, ingress, and ledger around a
//! shared registry and runs them until shutdown.

use crate::bandwidth::BandwidthLedger;
use crate::config::{normalize_bind_addr, BrokerConfig};
use crate::control::{ControlPlane, ControlPlaneError};
use crate::ingress::{Ingress, IngressError};
use crate::site::{DashboardStub, LandingPage, SiteHandler};
use burrow_db::Store;
use burrow_registry::TunnelRegistry;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("control plane failed: {0}")]
    ControlPlane(#[from] ControlPlaneError),

    #[error("ingress failed: {0}")]
    Ingress(#[from] IngressError),
}

/// Load a TLS acceptor from PEM files. HTTP/2 is deliberately absent from
/// the ALPN list: WebSocket upgrades hijack the byte stream, which h2
/// cannot offer.
pub fn tls_acceptor_from_files(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, BrokerError> {
    let certs = load_certs(Path::new(cert_path))?;
    let key = load_private_key(Path::new(key_path))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| BrokerError::Tls(format!("invalid cert/key: {}", e)))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, BrokerError> {
    let file = File::open(path)
        .map_err(|e| BrokerError::Tls(format!("failed to open cert file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| BrokerError::Tls(format!("failed to parse certs: {}", e)))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, BrokerError> {
    let file = File::open(path)
        .map_err(|e| BrokerError::Tls(format!("failed to open key file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| BrokerError::Tls(format!("failed to parse key: {}", e)))?
        .ok_or_else(|| BrokerError::Tls("no private key found".to_string()))
}

/// Builder for a [`Broker`].
pub struct BrokerBuilder {
    config: BrokerConfig,
    store: Option<Arc<dyn Store>>,
    control_tls: Option<TlsAcceptor>,
    ingress_tls: Option<TlsAcceptor>,
    landing: Option<Arc<dyn SiteHandler>>,
    dashboard: Option<Arc<dyn SiteHandler>>,
}

impl BrokerBuilder {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            store: None,
            control_tls: None,
            ingress_tls: None,
            landing: None,
            dashboard: None,
        }
    }

    /// Storage collaborator. Required.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// TLS acceptor for the control plane. Required once a root domain is
    /// configured (unless `insecure_http`).
    pub fn control_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.control_tls = Some(acceptor);
        self
    }

    /// TLS acceptor for the public ingress, typically provided by the
    /// cert-manager collaborator. Must not negotiate HTTP/2.
    pub fn ingress_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.ingress_tls = Some(acceptor);
        self
    }

    pub fn landing(mut self, handler: Arc<dyn SiteHandler>) -> Self {
        self.landing = Some(handler);
        self
    }

    pub fn dashboard(mut self, handler: Arc<dyn SiteHandler>) -> Self {
        self.dashboard = Some(handler);
        self
    }

    pub fn build(self) -> Result<Broker, BrokerError> {
        let store = self
            .store
            .ok_or_else(|| BrokerError::Config("a store is required".to_string()))?;

        if self.config.is_secure() && (self.control_tls.is_none() || self.ingress_tls.is_none()) {
            return Err(BrokerError::Config(
                "a root domain is configured: TLS acceptors are required for both \
                 the control plane and the ingress (or set INSECURE_HTTP for dev)"
                    .to_string(),
            ));
        }

        let registry = Arc::new(TunnelRegistry::new());
        let ledger = Arc::new(BandwidthLedger::new(self.config.daily_limit_bytes));
        let shutdown = CancellationToken::new();

        let landing = self.landing.unwrap_or_else(|| {
            Arc::new(LandingPage::new(
                self.config.root_domain.clone().unwrap_or_default(),
            ))
        });
        let dashboard = self.dashboard.unwrap_or_else(|| Arc::new(DashboardStub));

        let control = Arc::new(ControlPlane::new(
            registry.clone(),
            store.clone(),
            self.config.clone(),
            self.control_tls,
            shutdown.clone(),
        ));

        let ingress = Arc::new(Ingress::new(
            registry.clone(),
            ledger.clone(),
            store.clone(),
            self.config.clone(),
            self.ingress_tls,
            landing,
            dashboard,
            shutdown.clone(),
        ));

        Ok(Broker {
            config: self.config,
            registry,
            ledger,
            store,
            control,
            ingress,
            shutdown,
        })
    }
}

/// A fully wired broker process.
pub struct Broker {
    config: BrokerConfig,
    registry: Arc<TunnelRegistry>,
    ledger: Arc<BandwidthLedger>,
    store: Arc<dyn Store>,
    control: Arc<ControlPlane>,
    ingress: Arc<Ingress>,
    shutdown: CancellationToken,
}

impl Broker {
    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder::new(config)
    }

    /// Shared registry handle, e.g. for the dashboard's `is_connected`
    /// queries.
    pub fn registry(&self) -> Arc<TunnelRegistry> {
        self.registry.clone()
    }

    /// Token that aborts the whole broker when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind both listeners and serve until a shutdown signal or a fatal
    /// listener error.
    pub async fn run(self) -> Result<(), BrokerError> {
        let control_listener =
            TcpListener::bind(normalize_bind_addr(&self.config.control_addr)).await?;
        let ingress_listener =
            TcpListener::bind(normalize_bind_addr(&self.config.ingress_addr)).await?;

        self.run_with_listeners(control_listener, ingress_listener)
            .await
    }

    /// Same as [`run`](Self::run) with pre-bound listeners (tests bind to
    /// ephemeral ports).
    pub async fn run_with_listeners(
        self,
        control_listener: TcpListener,
        ingress_listener: TcpListener,
    ) -> Result<(), BrokerError> {
        let mut tasks = tokio::task::JoinSet::new();

        {
            let control = self.control.clone();
            tasks.spawn(async move {
                control
                    .run(control_listener)
                    .await
                    .map_err(BrokerError::from)
            });
        }
        {
            let ingress = self.ingress.clone();
            tasks.spawn(async move {
                ingress
                    .run(ingress_listener)
                    .await
                    .map_err(BrokerError::from)
            });
        }
        {
            let ledger = self.ledger.clone();
            let store = self.store.clone();
            let interval = self.config.bandwidth_flush_interval;
            let shutdown = self.shutdown.clone();
            tasks.spawn(async move {
                ledger.run_flusher(store, interval, shutdown).await;
                Ok(())
            });
        }

        let mut fatal: Option<BrokerError> = None;
        tokio::select! {
            _ = wait_for_shutdown_signal(&self.shutdown) => {
                info!("shutdown requested");
            }
            joined = tasks.join_next() => {
                match joined {
                    Some(Ok(Err(e))) => {
                        error!(error = %e, "server task failed, shutting down");
                        fatal = Some(e);
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "server task panicked, shutting down");
                    }
                    _ => {}
                }
            }
        }

        // Stop accepting, drop every live session, flush the ledger, and
        // give in-flight work a bounded grace period.
        self.shutdown.cancel();
        self.registry.close_all();

        let grace = self.config.shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(grace = ?grace, "shutdown grace period expired, aborting tasks");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        info!("broker stopped");
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Resolves on SIGTERM/SIGINT (or Ctrl-C off unix), or when the token is
/// cancelled externally.
async fn wait_for_shutdown_signal(shutdown: &CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                shutdown.cancelled().await;
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGINT handler");
                shutdown.cancelled().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
            _ = shutdown.cancelled() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received Ctrl-C"),
            _ = shutdown.cancelled() => {}
        }
    }
}
