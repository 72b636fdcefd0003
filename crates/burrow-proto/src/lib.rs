//! Wire protocol for the burrow control plane.
//!
//! A session's first stream carries exactly three newline-delimited JSON
//! messages: [`AuthRequest`] and [`TunnelRequest`] from the agent, then
//! [`InitResponse`] from the broker. After that the control stream closes
//! and every subsequent stream carries raw HTTP/1.1 bytes.

mod codec;
mod handshake;

pub use codec::{read_message, read_message_timeout, write_message, CodecError};
pub use handshake::{AuthRequest, ErrorCode, InitResponse, TunnelRequest};

use std::time::Duration;

/// Default control plane port on the broker.
pub const DEFAULT_CONTROL_PORT: u16 = 4443;

/// Bound on each handshake message read.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
