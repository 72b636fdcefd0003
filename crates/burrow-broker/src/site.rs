//! Built-in pages for the root and dashboard hostnames.
//!
//! The real landing page and dashboard are separate collaborators; the
//! ingress only needs something that can answer for those two hostnames.
//! These defaults serve the same inline HTML the service shipped with.

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// The parsed head of an inbound request, as much as host routing needs.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    /// Host header value with any `:port` suffix stripped.
    pub host: String,
}

/// Serves a hostname the dispatcher does not tunnel (landing, dashboard).
#[async_trait]
pub trait SiteHandler: Send + Sync {
    async fn handle(
        &self,
        head: &RequestHead,
        io: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> std::io::Result<()>;
}

async fn write_html(
    io: &mut (dyn AsyncWrite + Unpin + Send),
    body: &str,
) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    io.write_all(response.as_bytes()).await?;
    io.flush().await
}

/// Root-domain landing page.
pub struct LandingPage {
    root_domain: String,
}

impl LandingPage {
    pub fn new(root_domain: impl Into<String>) -> Self {
        Self {
            root_domain: root_domain.into(),
        }
    }
}

#[async_trait]
impl SiteHandler for LandingPage {
    async fn handle(
        &self,
        _head: &RequestHead,
        io: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> std::io::Result<()> {
        let body = format!(
            "<h1>Welcome to Burrow</h1><p>Fast, simple, secure tunnels.</p><a href='http://app.{}'>Go to Dashboard</a>",
            self.root_domain
        );
        write_html(io, &body).await
    }
}

/// Placeholder for the dashboard collaborator at `app.<root>` (login, API,
/// and static assets all live there).
pub struct DashboardStub;

#[async_trait]
impl SiteHandler for DashboardStub {
    async fn handle(
        &self,
        _head: &RequestHead,
        io: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> std::io::Result<()> {
        write_html(io, "<h1>Burrow Dashboard</h1><p>Sign-in is handled by the dashboard service.</p>").await
    }
}
