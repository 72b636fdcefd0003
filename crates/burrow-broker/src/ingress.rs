//! Public ingress dispatcher.
//!
//! Accepts HTTP/1.1 connections, routes by Host header (landing, dashboard,
//! or tunnel), and proxies one exchange per connection over a fresh stream
//! of the owning agent session. Only heads are parsed; bodies stream
//! through untouched, which is also what makes `101 Switching Protocols`
//! upgrades and SSE work. HTTP/2 is never negotiated on this listener:
//! upgrades need a hijackable byte stream.

use crate::bandwidth::BandwidthLedger;
use crate::config::BrokerConfig;
use crate::site::{RequestHead, SiteHandler};
use burrow_db::Store;
use burrow_registry::TunnelRegistry;
use burrow_session::MuxStream;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Request and response heads larger than this are rejected.
const MAX_HEAD_SIZE: usize = 64 * 1024;

const MAX_HEADERS: usize = 100;

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("accept failed: {0}")]
    Accept(#[from] std::io::Error),
}

pub struct Ingress {
    registry: Arc<TunnelRegistry>,
    ledger: Arc<BandwidthLedger>,
    store: Arc<dyn Store>,
    config: BrokerConfig,
    tls: Option<TlsAcceptor>,
    landing: Arc<dyn SiteHandler>,
    dashboard: Arc<dyn SiteHandler>,
    shutdown: CancellationToken,
}

impl Ingress {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<TunnelRegistry>,
        ledger: Arc<BandwidthLedger>,
        store: Arc<dyn Store>,
        config: BrokerConfig,
        tls: Option<TlsAcceptor>,
        landing: Arc<dyn SiteHandler>,
        dashboard: Arc<dyn SiteHandler>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            ledger,
            store,
            config,
            tls,
            landing,
            dashboard,
            shutdown,
        }
    }

    /// Accept public connections until shutdown or a fatal listener error.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<(), IngressError> {
        info!(
            addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            tls = self.tls.is_some(),
            "public ingress listening"
        );

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("ingress: shutdown, stopping accept loop");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.handle_connection(stream, peer).await;
                    });
                }
                Err(e) if crate::control::is_transient_accept(&e) => {
                    warn!(error = %e, "transient accept error, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
                Err(e) => {
                    error!(error = %e, "fatal accept error");
                    return Err(e.into());
                }
            }
        }
    }

    async fn handle_connection(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        match &self.tls {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls_stream) => self.serve(tls_stream, peer).await,
                Err(e) => debug!(%peer, error = %e, "ingress TLS handshake failed"),
            },
            None => self.serve(stream, peer).await,
        }
    }

    /// Serve one HTTP exchange on an accepted connection.
    pub async fn serve<IO>(&self, mut io: IO, peer: SocketAddr)
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (buffer, head) = match read_request_head(&mut io).await {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return,
            Err(e) => {
                debug!(%peer, error = %e, "bad request head");
                let _ = respond_text(&mut io, 400, "Bad Request", "malformed request").await;
                return;
            }
        };

        let Some(host) = head.host.clone() else {
            let _ = respond_text(&mut io, 400, "Bad Request", "missing Host header").await;
            return;
        };

        debug!(%peer, %host, method = %head.method, path = %head.path, "ingress request");

        if Some(&host) == self.config.root_domain.as_ref() {
            let request = head.into_request_head(host);
            if let Err(e) = self.landing.handle(&request, &mut io).await {
                debug!(%peer, error = %e, "landing handler failed");
            }
            return;
        }

        if self.config.dashboard_host().as_deref() == Some(host.as_str()) {
            let request = head.into_request_head(host);
            if let Err(e) = self.dashboard.handle(&request, &mut io).await {
                debug!(%peer, error = %e, "dashboard handler failed");
            }
            return;
        }

        let Some(entry) = self.registry.lookup(&host) else {
            let body = format!("Tunnel not found for host: {}", host);
            let _ = respond_text(&mut io, 404, "Not Found", &body).await;
            return;
        };

        if !entry.bandwidth_exempt && self.ledger.limit_bytes() > 0 {
            self.ledger.hydrate(self.store.as_ref(), entry.user_id).await;
            if !self.ledger.admit(entry.user_id, entry.bandwidth_exempt) {
                warn!(%host, user_id = entry.user_id, "daily bandwidth limit reached");
                let _ = respond_text(
                    &mut io,
                    509,
                    "Bandwidth Limit Exceeded",
                    "daily bandwidth limit exceeded",
                )
                .await;
                return;
            }
        }

        let upstream = match entry.session.open().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%host, error = %e, "failed to open stream to agent");
                let _ = respond_text(
                    &mut io,
                    502,
                    "Bad Gateway",
                    "failed to connect to tunnel client",
                )
                .await;
                return;
            }
        };

        match proxy_exchange(io, upstream, &buffer).await {
            Ok((sent, received)) => {
                self.ledger.add(entry.user_id, sent + received);
                debug!(%host, sent, received, "exchange complete");
            }
            Err(e) => {
                self.ledger
                    .add(entry.user_id, buffer.len() as u64);
                debug!(%host, error = %e, "exchange failed");
            }
        }
    }
}

/// Parsed request head fields the dispatcher routes on.
#[derive(Debug)]
struct ParsedRequestHead {
    method: String,
    path: String,
    /// Host header with any port stripped.
    host: Option<String>,
}

impl ParsedRequestHead {
    fn into_request_head(self, host: String) -> RequestHead {
        RequestHead {
            method: self.method,
            path: self.path,
            host,
        }
    }
}

/// Read until the request head is complete. Returns every byte read so far
/// (head plus any body prefix) together with the parsed fields, or `None`
/// if the peer closed before sending anything.
async fn read_request_head<IO>(
    io: &mut IO,
) -> std::io::Result<Option<(Vec<u8>, ParsedRequestHead)>>
where
    IO: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = io.read(&mut chunk).await?;
        if n == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-head",
            ));
        }
        buffer.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&buffer) {
            Ok(httparse::Status::Complete(_)) => {
                let host = request
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("host"))
                    .and_then(|h| std::str::from_utf8(h.value).ok())
                    .map(|value| {
                        value.split(':').next().unwrap_or(value).trim().to_string()
                    });
                let head = ParsedRequestHead {
                    method: request.method.unwrap_or("GET").to_string(),
                    path: request.path.unwrap_or("/").to_string(),
                    host,
                };
                return Ok(Some((buffer, head)));
            }
            Ok(httparse::Status::Partial) => {
                if buffer.len() > MAX_HEAD_SIZE {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "request head too large",
                    ));
                }
            }
            Err(e) => {
                return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e));
            }
        }
    }
}

/// Read the response head from the agent. Returns all bytes read (head plus
/// any body prefix) and the status code.
async fn read_response_head<R>(upstream: &mut R) -> std::io::Result<(Vec<u8>, u16)>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = upstream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "agent closed the stream before a response head",
            ));
        }
        buffer.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buffer) {
            Ok(httparse::Status::Complete(_)) => {
                let status = response.code.unwrap_or(502);
                return Ok((buffer, status));
            }
            Ok(httparse::Status::Partial) => {
                if buffer.len() > MAX_HEAD_SIZE {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "response head too large",
                    ));
                }
            }
            Err(e) => {
                return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e));
            }
        }
    }
}

/// Proxy one exchange: forward the request head, then relay both directions
/// concurrently until the agent side finishes.
///
/// The request body MUST flow while the response head is still pending:
/// `read_request_head` only buffers whatever body bytes arrived with the
/// head, and an upstream that consumes the whole body before answering (any
/// large POST/PUT) would otherwise deadlock against a broker waiting on the
/// response head.
///
/// Returns `(bytes sent to agent, bytes received from agent)`.
async fn proxy_exchange<IO>(
    client: IO,
    mut upstream: MuxStream,
    request_bytes: &[u8],
) -> std::io::Result<(u64, u64)>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    upstream.write_all(request_bytes).await?;
    upstream.flush().await?;

    let sent = AtomicU64::new(request_bytes.len() as u64);
    let received = AtomicU64::new(0);

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    // Remaining request body (or upgraded-connection bytes) up to the agent.
    let upload = async {
        let mut buf = [0u8; 8192];
        loop {
            let n = match client_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if upstream_write.write_all(&buf[..n]).await.is_err() {
                break;
            }
            let _ = upstream_write.flush().await;
            sent.fetch_add(n as u64, Ordering::Relaxed);
        }
        // Propagate the client's half-close so the agent sees request EOF.
        let _ = upstream_write.shutdown().await;
    };

    // Response head, then body (or upgraded-connection bytes) down to the
    // client.
    let download = async {
        match read_response_head(&mut upstream_read).await {
            Ok((response_bytes, status)) => {
                debug!(status, "response head relayed");
                if client_write.write_all(&response_bytes).await.is_err() {
                    return;
                }
                let _ = client_write.flush().await;
                received.fetch_add(response_bytes.len() as u64, Ordering::Relaxed);

                let mut buf = [0u8; 8192];
                loop {
                    let n = match upstream_read.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if client_write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                    let _ = client_write.flush().await;
                    received.fetch_add(n as u64, Ordering::Relaxed);
                }
            }
            Err(e) => {
                debug!(error = %e, "no response head from agent");
                let _ = respond_text(
                    &mut client_write,
                    502,
                    "Bad Gateway",
                    "invalid response from tunnel client",
                )
                .await;
            }
        }
        let _ = client_write.shutdown().await;
    };

    // The agent finishing the response ends the exchange; a client that
    // stops sending first merely half-closes and waits for the response.
    let mut upload = pin!(upload);
    let mut download = pin!(download);
    tokio::select! {
        _ = &mut download => {}
        _ = &mut upload => download.await,
    }

    Ok((
        sent.load(Ordering::Relaxed),
        received.load(Ordering::Relaxed),
    ))
}

/// Canned plain-text response.
async fn respond_text<IO>(
    io: &mut IO,
    status: u16,
    reason: &str,
    body: &str,
) -> std::io::Result<()>
where
    IO: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    );
    io.write_all(response.as_bytes()).await?;
    io.flush().await
}
