//! The tunnel session: dial, handshake, and per-stream proxying.

use crate::errors::TunnelError;
use crate::events::{Event, EventBus};
use crate::inspector::Inspector;
use crate::reconnect::{retry_loop, ReconnectConfig};
use burrow_proto::{
    read_message_timeout, write_message, AuthRequest, ErrorCode, InitResponse, TunnelRequest,
    DEFAULT_CONTROL_PORT, HANDSHAKE_TIMEOUT,
};
use burrow_session::{MuxSession, MuxStream};
use std::collections::HashSet;
use std::net::IpAddr;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 100;

/// Agent-side tunnel configuration.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Broker control plane, `host:port`.
    pub broker_addr: String,
    pub token: String,
    pub local_host: String,
    /// Every hostname this session binds forwards to this one local port.
    pub local_port: u16,
    /// Evict an existing session for this user.
    pub force: bool,
    /// Skip TLS certificate verification (development only).
    pub insecure: bool,
}

impl TunnelConfig {
    pub fn new(broker_addr: impl Into<String>, token: impl Into<String>, local_port: u16) -> Self {
        Self {
            broker_addr: broker_addr.into(),
            token: token.into(),
            local_host: "localhost".to_string(),
            local_port,
            force: false,
            insecure: false,
        }
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }
}

/// One agent tunnel: a persistent session to the broker plus a worker per
/// inbound stream.
pub struct Tunnel {
    config: TunnelConfig,
    events: EventBus,
    inspector: Arc<Inspector>,
    cancel: CancellationToken,
    /// Ids of streams currently being proxied.
    active: Arc<Mutex<HashSet<u64>>>,
    next_stream_id: AtomicU64,
}

impl Tunnel {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            events: EventBus::new(),
            inspector: Arc::new(Inspector::new()),
            cancel: CancellationToken::new(),
            active: Arc::new(Mutex::new(HashSet::new())),
            next_stream_id: AtomicU64::new(1),
        }
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn inspector(&self) -> Arc<Inspector> {
        self.inspector.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn active_streams(&self) -> usize {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Ask the tunnel (and every in-flight stream) to stop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Keep the tunnel up, reconnecting with backoff, until a fatal error
    /// or cancellation. Returns the terminal error.
    pub async fn run(&self, reconnect: ReconnectConfig) -> TunnelError {
        retry_loop(
            reconnect,
            self.cancel.clone(),
            self.events.clone(),
            || self.run_once(),
        )
        .await
    }

    /// One connection lifecycle. `Ok(())` means the session ended after a
    /// successful handshake (the caller reconnects with a fresh backoff).
    pub async fn run_once(&self) -> Result<(), TunnelError> {
        self.events.publish(Event::Connecting {
            broker: self.config.broker_addr.clone(),
        });

        let (host, port) = split_broker_addr(&self.config.broker_addr)?;
        let tcp = TcpStream::connect((host.as_str(), port)).await.map_err(|e| {
            TunnelError::Connection(format!("dial {}: {}", self.config.broker_addr, e))
        })?;

        if is_loopback_host(&host) {
            // Local broker: plain TCP. Anything remote speaks TLS, with no
            // silent plaintext downgrade.
            debug!(%host, "loopback broker, using plain TCP");
            self.drive(tcp).await
        } else {
            let tls = tls_connect(tcp, &host, self.config.insecure).await?;
            self.drive(tls).await
        }
    }

    async fn drive<IO>(&self, io: IO) -> Result<(), TunnelError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut session = MuxSession::client_side(io);
        let handle = session.handle();

        let mut control = handle
            .open()
            .await
            .map_err(|e| TunnelError::Connection(format!("open control stream: {}", e)))?;

        write_message(
            &mut control,
            &AuthRequest {
                token: self.config.token.clone(),
                force: self.config.force,
            },
        )
        .await
        .map_err(|e| TunnelError::Handshake(format!("send auth: {}", e)))?;

        // Empty list: bind every domain this token owns.
        write_message(
            &mut control,
            &TunnelRequest {
                requested_domains: Vec::new(),
            },
        )
        .await
        .map_err(|e| TunnelError::Handshake(format!("send tunnel request: {}", e)))?;

        let resp: InitResponse = read_message_timeout(&mut control, HANDSHAKE_TIMEOUT)
            .await
            .map_err(|e| TunnelError::Handshake(format!("read init response: {}", e)))?;

        if !resp.success {
            handle.close();
            return Err(refusal_error(resp));
        }

        let domains = resp.bound_domains.unwrap_or_default();
        info!(?domains, "tunnel established");
        self.events.publish(Event::Connected);
        self.events.publish(Event::TunnelReady {
            domains: domains.clone(),
        });
        let _ = control.shutdown().await;

        let local_addr = format!("{}:{}", self.config.local_host, self.config.local_port);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    handle.close();
                    return Err(TunnelError::Cancelled);
                }
                accepted = session.accept() => match accepted {
                    Some(stream) => self.spawn_worker(stream, local_addr.clone()),
                    None => {
                        self.events.publish(Event::Disconnected {
                            reason: "session closed by broker".to_string(),
                        });
                        return Ok(());
                    }
                }
            }
        }
    }

    fn spawn_worker(&self, stream: MuxStream, local_addr: String) {
        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);

        let active = self.active.clone();
        let inspector = self.inspector.clone();
        let events = self.events.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = proxy_stream(stream, &local_addr, inspector, events) => {}
                _ = cancel.cancelled() => {
                    debug!(stream = id, "worker cancelled");
                }
            }
            active.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
        });
    }
}

/// Map a refused handshake to the agent error taxonomy.
fn refusal_error(resp: InitResponse) -> TunnelError {
    let message = resp
        .error
        .unwrap_or_else(|| "unknown handshake error".to_string());
    match resp.error_code {
        Some(ErrorCode::AlreadyConnected) => TunnelError::AlreadyConnected,
        Some(ErrorCode::InvalidToken) => TunnelError::InvalidToken,
        Some(ErrorCode::TermsNotAccepted) => TunnelError::TermsNotAccepted,
        Some(ErrorCode::NoDomains) | None => TunnelError::Refused(message),
    }
}

fn split_broker_addr(addr: &str) -> Result<(String, u16), TunnelError> {
    match addr.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().map_err(|_| {
                TunnelError::Connection(format!("invalid port in broker address '{}'", addr))
            })?;
            Ok((host.to_string(), port))
        }
        None => Ok((addr.to_string(), DEFAULT_CONTROL_PORT)),
    }
}

fn is_loopback_host(host: &str) -> bool {
    host == "localhost"
        || host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

async fn tls_connect(
    tcp: TcpStream,
    host: &str,
    insecure: bool,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, TunnelError> {
    let config = if insecure {
        warn!("TLS certificate verification disabled");
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    let connector = TlsConnector::from(Arc::new(config));
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|_| TunnelError::Tls(format!("invalid server name '{}'", host)))?;

    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| TunnelError::Tls(format!("handshake with {}: {}", host, e)))
}

/// Skip server certificate verification. Dev flag only; production agents
/// never downgrade.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// What the first bytes of an inbound stream turned out to be.
enum StreamPrefix {
    /// A parseable HTTP request head (plus any body bytes already read).
    Http {
        buffer: Vec<u8>,
        method: String,
        host: String,
        path: String,
    },
    /// Not HTTP; proxy the bytes opaquely.
    Opaque(Vec<u8>),
    Closed,
}

/// Read enough of the stream to decide whether it is an HTTP request the
/// inspector can record. Never discards bytes: whatever was read is
/// forwarded either way.
async fn read_stream_prefix(stream: &mut MuxStream) -> StreamPrefix {
    let mut buffer = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) => {
                return if buffer.is_empty() {
                    StreamPrefix::Closed
                } else {
                    StreamPrefix::Opaque(buffer)
                }
            }
            Ok(n) => n,
            Err(_) => return StreamPrefix::Closed,
        };
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
                    .unwrap_or("")
                    .to_string();
                let method = request.method.unwrap_or("GET").to_string();
                let path = request.path.unwrap_or("/").to_string();
                return StreamPrefix::Http {
                    buffer,
                    method,
                    host,
                    path,
                };
            }
            Ok(httparse::Status::Partial) => {
                if buffer.len() > MAX_HEAD_SIZE {
                    return StreamPrefix::Opaque(buffer);
                }
            }
            Err(_) => return StreamPrefix::Opaque(buffer),
        }
    }
}

/// Best-effort response head read from the local service, for status
/// recording. Returns everything read plus the status if it parsed.
async fn read_response_prefix<R>(local: &mut R) -> (Vec<u8>, Option<u16>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = match local.read(&mut chunk).await {
            Ok(0) | Err(_) => return (buffer, None),
            Ok(n) => n,
        };
        buffer.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buffer) {
            Ok(httparse::Status::Complete(_)) => {
                let status = response.code;
                return (buffer, status);
            }
            Ok(httparse::Status::Partial) => {
                if buffer.len() > MAX_HEAD_SIZE {
                    return (buffer, None);
                }
            }
            Err(_) => return (buffer, None),
        }
    }
}

/// Proxy one inbound stream to the local service.
async fn proxy_stream(
    mut stream: MuxStream,
    local_addr: &str,
    inspector: Arc<Inspector>,
    events: EventBus,
) {
    let mut local = match TcpStream::connect(local_addr).await {
        Ok(local) => local,
        Err(e) => {
            warn!(%local_addr, error = %e, "failed to dial local service");
            let body = "failed to reach local service";
            let response = format!(
                "HTTP/1.1 502 Bad Gateway\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.flush().await;
            let _ = stream.shutdown().await;
            return;
        }
    };

    match read_stream_prefix(&mut stream).await {
        StreamPrefix::Closed => {}
        StreamPrefix::Opaque(buffer) => {
            debug!("non-HTTP stream, copying opaquely");
            if local.write_all(&buffer).await.is_ok() {
                let _ = tokio::io::copy_bidirectional(&mut stream, &mut local).await;
            }
        }
        StreamPrefix::Http {
            buffer,
            method,
            host,
            path,
        } => {
            let id = inspector.record_request(&method, &host, &path);
            events.publish(Event::RequestStarted {
                method,
                host,
                path,
            });

            if local.write_all(&buffer).await.is_err() {
                let _ = stream.shutdown().await;
                return;
            }

            // The prefix read only captured body bytes that arrived with
            // the head. The rest of the request body has to keep flowing
            // while the response head is still pending, or a service that
            // reads the whole body before answering deadlocks.
            let (mut stream_read, mut stream_write) = tokio::io::split(stream);
            let (mut local_read, mut local_write) = tokio::io::split(local);

            // Remaining request body from the broker to the local service.
            let upload = async {
                let _ = tokio::io::copy(&mut stream_read, &mut local_write).await;
                // Propagate request EOF so the service can finish reading.
                let _ = local_write.shutdown().await;
            };

            // Response head (for the inspector), then the body or upgraded
            // bytes back to the broker.
            let download = async {
                let (response_prefix, status) = read_response_prefix(&mut local_read).await;
                if let Some(status) = status {
                    inspector.record_status(id, status);
                }
                if !response_prefix.is_empty() {
                    if stream_write.write_all(&response_prefix).await.is_err() {
                        return;
                    }
                    let _ = stream_write.flush().await;
                }
                let _ = tokio::io::copy(&mut local_read, &mut stream_write).await;
                let _ = stream_write.shutdown().await;
            };

            // The local service finishing its response ends the exchange; a
            // broker stream that half-closes first just waits for it.
            let mut upload = pin!(upload);
            let mut download = pin!(download);
            tokio::select! {
                _ = &mut download => {}
                _ = &mut upload => download.await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_session::MuxSession;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[test]
    fn test_split_broker_addr() {
        assert_eq!(
            split_broker_addr("broker.example.com:4443").unwrap(),
            ("broker.example.com".to_string(), 4443)
        );
        assert_eq!(
            split_broker_addr("localhost").unwrap(),
            ("localhost".to_string(), DEFAULT_CONTROL_PORT)
        );
        assert!(split_broker_addr("host:notaport").is_err());
    }

    #[test]
    fn test_is_loopback_host() {
        assert!(is_loopback_host("localhost"));
        assert!(is_loopback_host("127.0.0.1"));
        assert!(is_loopback_host("::1"));
        assert!(!is_loopback_host("broker.example.com"));
        assert!(!is_loopback_host("203.0.113.9"));
    }

    #[test]
    fn test_refusal_error_mapping() {
        let resp = |code| InitResponse {
            success: false,
            error: Some("nope".to_string()),
            error_code: Some(code),
            bound_domains: None,
        };

        assert!(matches!(
            refusal_error(resp(ErrorCode::AlreadyConnected)),
            TunnelError::AlreadyConnected
        ));
        assert!(matches!(
            refusal_error(resp(ErrorCode::InvalidToken)),
            TunnelError::InvalidToken
        ));
        assert!(matches!(
            refusal_error(resp(ErrorCode::TermsNotAccepted)),
            TunnelError::TermsNotAccepted
        ));
        assert!(matches!(
            refusal_error(resp(ErrorCode::NoDomains)),
            TunnelError::Refused(_)
        ));
    }

    /// A minimal broker: accepts one control connection, answers the
    /// handshake, then opens `requests` streams carrying canned HTTP.
    async fn fake_broker(
        listener: TcpListener,
        response: InitResponse,
        requests: Vec<&'static [u8]>,
    ) -> tokio::task::JoinHandle<Vec<Vec<u8>>> {
        tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            let mut session = MuxSession::server_side(conn);

            let mut control = session
                .accept_timeout(Duration::from_secs(5))
                .await
                .unwrap();
            let _auth: AuthRequest = burrow_proto::read_message(&mut control).await.unwrap();
            let _req: TunnelRequest = burrow_proto::read_message(&mut control).await.unwrap();
            write_message(&mut control, &response).await.unwrap();
            let _ = control.shutdown().await;

            let mut replies = Vec::new();
            for request in requests {
                let mut stream = session.handle().open().await.unwrap();
                stream.write_all(request).await.unwrap();
                stream.flush().await.unwrap();
                stream.shutdown().await.unwrap();

                let mut reply = Vec::new();
                stream.read_to_end(&mut reply).await.unwrap();
                replies.push(reply);
            }
            replies
        })
    }

    /// A local HTTP service answering every connection with one canned
    /// response.
    async fn local_service(response: &'static [u8]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut byte = [0u8; 1];
                    while !head.ends_with(b"\r\n\r\n") {
                        match conn.read(&mut byte).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => head.push(byte[0]),
                        }
                    }
                    let _ = conn.write_all(response).await;
                    let _ = conn.flush().await;
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_handshake_and_proxy_roundtrip() {
        let broker_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker_addr = broker_listener.local_addr().unwrap();

        let broker = fake_broker(
            broker_listener,
            InitResponse::ok(vec!["misty-river.example.com".to_string()]),
            vec![b"GET /api HTTP/1.1\r\nHost: misty-river.example.com\r\n\r\n"],
        )
        .await;

        let local_port =
            local_service(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\npong").await;

        let tunnel = Tunnel::new(TunnelConfig::new(
            broker_addr.to_string(),
            "sk_live_12345",
            local_port,
        ));
        let mut events = tunnel.events().subscribe();
        let cancel = tunnel.cancel_token();

        tokio::spawn(async move {
            let _ = tunnel.run_once().await;
        });

        // Bound domains are published upward once the handshake completes.
        let domains = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Event::TunnelReady { domains } = events.recv().await.unwrap() {
                    return domains;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(domains, vec!["misty-river.example.com"]);

        let replies = tokio::time::timeout(Duration::from_secs(5), broker)
            .await
            .unwrap()
            .unwrap();
        let reply = String::from_utf8_lossy(&replies[0]).to_string();
        assert!(reply.starts_with("HTTP/1.1 200 OK"));
        assert!(reply.ends_with("pong"));

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_refused_handshake_surfaces_error() {
        let broker_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker_addr = broker_listener.local_addr().unwrap();

        let _broker = fake_broker(
            broker_listener,
            InitResponse::err(ErrorCode::AlreadyConnected, "session conflict"),
            vec![],
        )
        .await;

        let tunnel = Tunnel::new(TunnelConfig::new(
            broker_addr.to_string(),
            "sk_live_12345",
            3000,
        ));

        let err = tunnel.run_once().await.unwrap_err();
        assert!(matches!(err, TunnelError::AlreadyConnected));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_dial_failure_is_transient() {
        // Bind then drop to find a port that refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let tunnel = Tunnel::new(TunnelConfig::new(addr.to_string(), "tok", 3000));
        let err = tunnel.run_once().await.unwrap_err();
        assert!(matches!(err, TunnelError::Connection(_)));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_local_dial_failure_answers_502_and_keeps_session() {
        let broker_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker_addr = broker_listener.local_addr().unwrap();

        // Pick a dead local port.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        let broker = fake_broker(
            broker_listener,
            InitResponse::ok(vec!["misty-river".to_string()]),
            vec![
                b"GET / HTTP/1.1\r\nHost: misty-river\r\n\r\n",
                b"GET /two HTTP/1.1\r\nHost: misty-river\r\n\r\n",
            ],
        )
        .await;

        let tunnel = Arc::new(Tunnel::new(TunnelConfig::new(
            broker_addr.to_string(),
            "sk_live_12345",
            dead_port,
        )));
        let cancel = tunnel.cancel_token();
        let t = tunnel.clone();
        tokio::spawn(async move { t.run_once().await });

        let replies = tokio::time::timeout(Duration::from_secs(5), broker)
            .await
            .unwrap()
            .unwrap();

        // Both streams get a 502; the session survived the first failure.
        for reply in &replies {
            assert!(String::from_utf8_lossy(reply).starts_with("HTTP/1.1 502 "));
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_upload_body_relayed_while_response_pending() {
        const BODY_LEN: usize = 64 * 1024;
        let broker_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker_addr = broker_listener.local_addr().unwrap();

        // A POST whose body is far larger than one prefix-read chunk, so
        // most of it must be relayed after the head.
        let mut request = format!(
            "POST /upload HTTP/1.1\r\nHost: misty-river\r\nContent-Length: {}\r\n\r\n",
            BODY_LEN
        )
        .into_bytes();
        request.extend(std::iter::repeat(9u8).take(BODY_LEN));
        let request: &'static [u8] = request.leak();

        let broker = fake_broker(
            broker_listener,
            InitResponse::ok(vec!["misty-river".to_string()]),
            vec![request],
        )
        .await;

        // A local service that drains the whole body before answering.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let Ok((mut conn, _)) = listener.accept().await else {
                return;
            };
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                match conn.read(&mut byte).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => head.push(byte[0]),
                }
            }
            let mut remaining = BODY_LEN;
            let mut buf = [0u8; 8192];
            while remaining > 0 {
                match conn.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => remaining = remaining.saturating_sub(n),
                }
            }
            let _ = conn
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\n\r\ndrained")
                .await;
            let _ = conn.flush().await;
        });

        let tunnel = Arc::new(Tunnel::new(TunnelConfig::new(
            broker_addr.to_string(),
            "sk_live_12345",
            local_port,
        )));
        let cancel = tunnel.cancel_token();
        let t = tunnel.clone();
        tokio::spawn(async move {
            let _ = t.run_once().await;
        });

        let replies = tokio::time::timeout(Duration::from_secs(5), broker)
            .await
            .expect("large upload must not deadlock")
            .unwrap();
        let reply = String::from_utf8_lossy(&replies[0]).to_string();
        assert!(reply.starts_with("HTTP/1.1 200 OK"), "got: {}", reply);
        assert!(reply.ends_with("drained"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_inspector_records_proxied_exchange() {
        let broker_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker_addr = broker_listener.local_addr().unwrap();

        let broker = fake_broker(
            broker_listener,
            InitResponse::ok(vec!["misty-river".to_string()]),
            vec![b"POST /submit HTTP/1.1\r\nHost: misty-river\r\nContent-Length: 0\r\n\r\n"],
        )
        .await;

        let local_port = local_service(b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n").await;

        let tunnel = Arc::new(Tunnel::new(TunnelConfig::new(
            broker_addr.to_string(),
            "sk_live_12345",
            local_port,
        )));
        let cancel = tunnel.cancel_token();
        let t = tunnel.clone();
        tokio::spawn(async move { t.run_once().await });

        tokio::time::timeout(Duration::from_secs(5), broker)
            .await
            .unwrap()
            .unwrap();

        // The worker records asynchronously; give it a beat.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let entries = tunnel.inspector().recent();
                if let Some(entry) = entries.first() {
                    if entry.status == Some(201) {
                        assert_eq!(entry.method, "POST");
                        assert_eq!(entry.path, "/submit");
                        assert_eq!(entry.host, "misty-river");
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
    }
}
