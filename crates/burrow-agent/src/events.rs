//! Agent lifecycle events for TUI and log consumers.

use std::time::Duration;
use tokio::sync::broadcast;

/// What the tunnel is doing right now.
#[derive(Debug, Clone)]
pub enum Event {
    Connecting { broker: String },
    Connected,
    /// Handshake finished; these hostnames now route here.
    TunnelReady { domains: Vec<String> },
    RequestStarted { method: String, host: String, path: String },
    Disconnected { reason: String },
    Reconnecting { delay: Duration, attempt: u32 },
    Error { message: String },
}

/// Fan-out bus. Publishing never blocks and drops events when nobody
/// listens, so the tunnel never stalls on a slow consumer.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
