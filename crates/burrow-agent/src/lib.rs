//! The burrow agent: dials the broker, keeps one multiplexed session alive,
//! and proxies each inbound stream to a local service. No inbound port is
//! ever opened on the agent's host.

mod errors;
mod events;
mod inspector;
mod reconnect;
mod tunnel;

pub use errors::TunnelError;
pub use events::{Event, EventBus};
pub use inspector::{CapturedExchange, Inspector};
pub use reconnect::{retry_loop, Backoff, ReconnectConfig};
pub use tunnel::{Tunnel, TunnelConfig};
