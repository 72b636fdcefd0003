//! Control plane: accepts agent connections, runs the handshake, binds
//! hostnames into the registry, and cleans up when sessions die.

use crate::config::BrokerConfig;
use burrow_db::Store;
use burrow_proto::{
    read_message_timeout, write_message, AuthRequest, ErrorCode, InitResponse, TunnelRequest,
    HANDSHAKE_TIMEOUT,
};
use burrow_registry::TunnelRegistry;
use burrow_session::{MuxSession, MuxStream, SessionHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long a fresh connection gets to open its handshake stream.
const FIRST_STREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause before retrying a transient accept failure.
const ACCEPT_RETRY_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("accept failed: {0}")]
    Accept(#[from] std::io::Error),
}

/// How one handshake ended.
enum HandshakeOutcome {
    /// Session registered under these FQDNs.
    Bound(Vec<String>),
    /// Refused with a protocol error code; respond, then close.
    Refused(ErrorCode, &'static str),
    /// Malformed or timed out; close without a response.
    Aborted(String),
}

pub struct ControlPlane {
    registry: Arc<TunnelRegistry>,
    store: Arc<dyn Store>,
    config: BrokerConfig,
    tls: Option<TlsAcceptor>,
    shutdown: CancellationToken,
}

impl ControlPlane {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        store: Arc<dyn Store>,
        config: BrokerConfig,
        tls: Option<TlsAcceptor>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            store,
            config,
            tls,
            shutdown,
        }
    }

    /// Accept agent connections until shutdown or a fatal listener error.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<(), ControlPlaneError> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_sessions));
        info!(
            addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            tls = self.tls.is_some(),
            max_sessions = self.config.max_sessions,
            "control plane listening"
        );

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("control plane: shutdown, stopping accept loop");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let permit = tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(()),
                        permit = semaphore.clone().acquire_owned() => match permit {
                            Ok(p) => p,
                            Err(_) => return Ok(()),
                        },
                    };

                    let this = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        this.handle_connection(stream, peer).await;
                    });
                }
                Err(e) if is_transient_accept(&e) => {
                    warn!(error = %e, "transient accept error, retrying");
                    tokio::time::sleep(ACCEPT_RETRY_PAUSE).await;
                }
                Err(e) => {
                    error!(error = %e, "fatal accept error");
                    return Err(e.into());
                }
            }
        }
    }

    async fn handle_connection(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        debug!(%peer, "new control connection");
        match &self.tls {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls_stream) => self.handle_session(tls_stream, peer).await,
                Err(e) => warn!(%peer, error = %e, "control TLS handshake failed"),
            },
            None => self.handle_session(stream, peer).await,
        }
    }

    /// Drive one agent session: handshake, register, watch for close.
    pub async fn handle_session<IO>(&self, io: IO, peer: SocketAddr)
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut session = MuxSession::server_side(io);
        let handle = session.handle();

        let mut control_stream = match session.accept_timeout(FIRST_STREAM_TIMEOUT).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(%peer, error = %e, "no handshake stream");
                handle.close();
                return;
            }
        };

        match self.handshake(&mut control_stream, &handle, peer).await {
            HandshakeOutcome::Bound(domains) => {
                let _ = control_stream.shutdown().await;
                info!(%peer, session = %handle.id(), ?domains, "handshake complete");

                // Hold the connection until either side ends it, then drop
                // every hostname the session held.
                handle.closed().await;
                self.registry.unregister_session(handle.id());
                debug!(%peer, session = %handle.id(), "session closed, unregistered");
            }
            HandshakeOutcome::Refused(code, message) => {
                info!(%peer, %code, message, "handshake refused");
                let resp = InitResponse::err(code, message);
                let _ = write_message(&mut control_stream, &resp).await;
                let _ = control_stream.shutdown().await;
                handle.close();
            }
            HandshakeOutcome::Aborted(reason) => {
                debug!(%peer, reason, "handshake aborted");
                handle.close();
            }
        }
    }

    async fn handshake(
        &self,
        stream: &mut MuxStream,
        handle: &SessionHandle,
        peer: SocketAddr,
    ) -> HandshakeOutcome {
        let auth: AuthRequest = match read_message_timeout(stream, HANDSHAKE_TIMEOUT).await {
            Ok(msg) => msg,
            Err(e) => return HandshakeOutcome::Aborted(format!("auth decode: {}", e)),
        };

        let user = match self.store.validate_token(&auth.token).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                return HandshakeOutcome::Refused(ErrorCode::InvalidToken, "invalid token")
            }
            Err(e) => return HandshakeOutcome::Aborted(format!("token lookup: {}", e)),
        };
        debug!(%peer, user_id = user.id, "agent authenticated");

        if !user.terms_accepted {
            return HandshakeOutcome::Refused(
                ErrorCode::TermsNotAccepted,
                "terms of service not accepted",
            );
        }

        if !auth.force && self.registry.has_session(user.id) {
            return HandshakeOutcome::Refused(
                ErrorCode::AlreadyConnected,
                "another session is active for this user; reconnect with force to take over",
            );
        }

        let request: TunnelRequest = match read_message_timeout(stream, HANDSHAKE_TIMEOUT).await {
            Ok(msg) => msg,
            Err(e) => return HandshakeOutcome::Aborted(format!("tunnel request decode: {}", e)),
        };

        // Empty request means "bind every domain I own".
        let requested = if request.requested_domains.is_empty() {
            match self.store.user_domains(user.id).await {
                Ok(domains) => domains,
                Err(e) => return HandshakeOutcome::Aborted(format!("domain lookup: {}", e)),
            }
        } else {
            request.requested_domains
        };

        if requested.is_empty() {
            return HandshakeOutcome::Refused(ErrorCode::NoDomains, "no domains to bind");
        }

        let mut bound = Vec::with_capacity(requested.len());
        for name in &requested {
            match self.store.domain_owned_by(name, user.id).await {
                Ok(true) => bound.push(self.config.fqdn(name)),
                Ok(false) => {
                    warn!(%peer, user_id = user.id, domain = %name, "dropping unowned domain")
                }
                Err(e) => {
                    warn!(%peer, domain = %name, error = %e, "ownership check failed, dropping")
                }
            }
        }

        if bound.is_empty() {
            return HandshakeOutcome::Refused(
                ErrorCode::NoDomains,
                "no valid domains requested or authorized",
            );
        }

        let evicted = self.registry.register(
            user.id,
            handle.clone(),
            bound.clone(),
            user.bandwidth_exempt,
        );
        if let Some(old) = evicted {
            info!(user_id = user.id, old_session = %old.id(), "evicted previous session");
        }

        let resp = InitResponse::ok(bound.clone());
        if let Err(e) = write_message(stream, &resp).await {
            // The agent never learned it was bound; take the entry back out.
            self.registry.unregister_session(handle.id());
            return HandshakeOutcome::Aborted(format!("init response write: {}", e));
        }

        HandshakeOutcome::Bound(bound)
    }
}

/// Accept errors worth retrying rather than tearing the broker down.
pub(crate) fn is_transient_accept(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::TimedOut
    )
}
