//! Multiplexed session layer.
//!
//! One TCP (or TLS) connection between an agent and the broker carries many
//! concurrent bidirectional streams, one per proxied request. Yamux provides
//! the framing, flow control, and keepalive; this crate wraps it in the two
//! handles the rest of the system works with:
//!
//! - [`MuxSession`] is owned by whichever side runs the accept loop and
//!   yields inbound streams.
//! - [`SessionHandle`] is cloneable; it opens outbound streams, closes the
//!   session, and exposes the close signal the registry watches.
//!
//! The broker is the passive side (the agent opens the handshake stream);
//! the agent is the active side and accepts the proxy streams the broker
//! opens afterwards.

use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_yamux::config::Config;
use tokio_yamux::Control;
use tokio_yamux::session::Session;
use tokio_yamux::stream::StreamHandle;
use tracing::{debug, trace, warn};

/// A single proxied byte stream inside a session.
pub type MuxStream = StreamHandle;

/// Keepalive ping interval on every session.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Writes that cannot make progress for this long kill the session.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(60);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one mux session for registry bookkeeping and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sess-{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,

    #[error("timed out waiting for a stream")]
    AcceptTimeout,

    #[error("mux error: {0}")]
    Mux(String),
}

fn mux_config() -> Config {
    Config {
        enable_keepalive: true,
        keepalive_interval: KEEPALIVE_INTERVAL,
        connection_write_timeout: WRITE_TIMEOUT,
        ..Default::default()
    }
}

/// Cloneable handle to a live session.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    control: Control,
    closed: CancellationToken,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Open a new outbound stream on the session.
    pub async fn open(&self) -> Result<MuxStream, SessionError> {
        if self.closed.is_cancelled() {
            return Err(SessionError::Closed);
        }
        let mut control = self.control.clone();
        control
            .open_stream()
            .await
            .map_err(|e| SessionError::Mux(e.to_string()))
    }

    /// Tear the session down. Every in-flight stream sees end-of-stream.
    ///
    /// Synchronous so a caller holding a lock can signal closure inside its
    /// critical section; the driver task performs the actual goaway.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Resolves once the session is gone, whichever side ended it.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

/// A mux session together with its inbound-stream receiver.
pub struct MuxSession {
    handle: SessionHandle,
    incoming: mpsc::Receiver<MuxStream>,
}

impl MuxSession {
    /// Wrap the broker side of a connection (accepts the first stream).
    pub fn server_side<IO>(io: IO) -> Self
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::start(Session::new_server(io, mux_config()))
    }

    /// Wrap the agent side of a connection (opens the first stream).
    pub fn client_side<IO>(io: IO) -> Self
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::start(Session::new_client(io, mux_config()))
    }

    fn start<IO>(mut session: Session<IO>) -> Self
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed));
        let control = session.control();
        let closed = CancellationToken::new();
        // Roomy enough that bursts never overflow; the accept loop only
        // spawns a task per stream, so it drains fast.
        let (tx, rx) = mpsc::channel(256);

        tokio::spawn(drive(id, session, tx, closed.clone()));

        Self {
            handle: SessionHandle {
                id,
                control,
                closed,
            },
            incoming: rx,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn id(&self) -> SessionId {
        self.handle.id
    }

    /// Wait for the peer to open a stream. `None` once the session is dead.
    pub async fn accept(&mut self) -> Option<MuxStream> {
        tokio::select! {
            stream = self.incoming.recv() => stream,
            _ = self.handle.closed() => None,
        }
    }

    /// Wait for the peer to open a stream, up to `limit`.
    pub async fn accept_timeout(&mut self, limit: Duration) -> Result<MuxStream, SessionError> {
        match tokio::time::timeout(limit, self.accept()).await {
            Ok(Some(stream)) => Ok(stream),
            Ok(None) => Err(SessionError::Closed),
            Err(_) => Err(SessionError::AcceptTimeout),
        }
    }

    pub fn close(&self) {
        self.handle.close();
    }
}

/// Pumps the yamux state machine: inbound streams out, shutdown in.
///
/// Yamux only makes progress while the session is polled, so this task runs
/// for the life of the connection.
async fn drive<IO>(
    id: SessionId,
    mut session: Session<IO>,
    inbound: mpsc::Sender<MuxStream>,
    closed: CancellationToken,
) where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut control = session.control();
    loop {
        tokio::select! {
            next = session.next() => match next {
                Some(Ok(stream)) => {
                    trace!(session = %id, "inbound stream");
                    // try_send keeps the driver from ever parking on a full
                    // buffer; an unread stream is simply dropped (closed).
                    // The accept side being gone is fine too: outbound
                    // streams opened through the handle must keep working.
                    if let Err(e) = inbound.try_send(stream) {
                        debug!(session = %id, "inbound stream dropped: {}", e);
                    }
                }
                Some(Err(e)) => {
                    warn!(session = %id, error = %e, "session failed");
                    break;
                }
                None => {
                    debug!(session = %id, "session ended by peer");
                    break;
                }
            },
            _ = closed.cancelled() => {
                debug!(session = %id, "session closed locally");
                let _ = control.close().await;
                break;
            }
        }
    }
    closed.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (MuxSession, MuxSession) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (MuxSession::server_side(a), MuxSession::client_side(b))
    }

    #[tokio::test]
    async fn test_open_and_accept() {
        let (server, mut client) = pair();

        let mut outbound = server.handle().open().await.unwrap();
        outbound.write_all(b"hello").await.unwrap();
        outbound.flush().await.unwrap();

        let mut inbound = client
            .accept_timeout(Duration::from_secs(5))
            .await
            .unwrap();
        let mut buf = [0u8; 5];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_byte_fidelity_both_directions() {
        let (server, mut client) = pair();

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let echo_payload = payload.clone();

        let mut outbound = server.handle().open().await.unwrap();
        let mut inbound = client
            .accept_timeout(Duration::from_secs(5))
            .await
            .unwrap();

        // Echo server on the accepting side.
        let echo = tokio::spawn(async move {
            let mut received = vec![0u8; echo_payload.len()];
            inbound.read_exact(&mut received).await.unwrap();
            assert_eq!(received, echo_payload);
            inbound.write_all(&received).await.unwrap();
            inbound.flush().await.unwrap();
        });

        outbound.write_all(&payload).await.unwrap();
        outbound.flush().await.unwrap();

        let mut echoed = vec![0u8; payload.len()];
        outbound.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);

        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_streams_are_independent() {
        let (server, mut client) = pair();
        let handle = server.handle();

        let acceptor = tokio::spawn(async move {
            for _ in 0..4 {
                let mut stream = client
                    .accept_timeout(Duration::from_secs(5))
                    .await
                    .unwrap();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    stream.read_to_end(&mut buf).await.unwrap();
                    stream.write_all(&buf).await.unwrap();
                    stream.flush().await.unwrap();
                    stream.shutdown().await.unwrap();
                });
            }
        });

        let mut tasks = Vec::new();
        for i in 0..4u8 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                let mut stream = handle.open().await.unwrap();
                let msg = vec![i; 1024];
                stream.write_all(&msg).await.unwrap();
                stream.flush().await.unwrap();
                stream.shutdown().await.unwrap();

                let mut back = Vec::new();
                stream.read_to_end(&mut back).await.unwrap();
                assert_eq!(back, msg);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        acceptor.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_signal_fires() {
        let (server, client) = pair();
        let watched = server.handle();

        client.close();

        tokio::time::timeout(Duration::from_secs(5), watched.closed())
            .await
            .expect("close signal should propagate to the peer");
    }

    #[tokio::test]
    async fn test_open_after_close_fails() {
        let (server, _client) = pair();
        let handle = server.handle();

        handle.close();
        handle.closed().await;

        assert!(handle.open().await.is_err());
    }

    #[tokio::test]
    async fn test_accept_returns_none_after_close() {
        let (mut server, client) = pair();

        client.close();

        let got = tokio::time::timeout(Duration::from_secs(5), server.accept())
            .await
            .unwrap();
        assert!(got.is_none());
    }
}
