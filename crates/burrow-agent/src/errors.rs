//! Agent-side error taxonomy.

use thiserror::Error;

/// Everything that can end a tunnel attempt. The reconnect loop retries
/// transient errors and stops on fatal ones.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The user already has a live session and `force` was not set.
    /// Retrying cannot help; a human has to decide who wins.
    #[error("another session is already active for this user")]
    AlreadyConnected,

    #[error("the broker rejected the token")]
    InvalidToken,

    #[error("terms of service not accepted")]
    TermsNotAccepted,

    /// Refused by the broker for a reason retrying will not change
    /// (e.g. no domains to bind).
    #[error("the broker refused the tunnel: {0}")]
    Refused(String),

    #[error("failed to reach the broker: {0}")]
    Connection(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The session ended after a successful handshake; the reconnect loop
    /// dials again with a fresh backoff.
    #[error("session ended: {0}")]
    SessionEnded(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

impl TunnelError {
    /// Fatal errors stop the reconnect loop and surface to the user.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::AlreadyConnected
                | TunnelError::InvalidToken
                | TunnelError::TermsNotAccepted
                | TunnelError::Refused(_)
        )
    }

    /// Exit code for the CLI: 2 for session conflicts, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            TunnelError::AlreadyConnected => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(TunnelError::AlreadyConnected.is_fatal());
        assert!(TunnelError::InvalidToken.is_fatal());
        assert!(TunnelError::TermsNotAccepted.is_fatal());
        assert!(TunnelError::Refused("no domains".into()).is_fatal());

        assert!(!TunnelError::Connection("refused".into()).is_fatal());
        assert!(!TunnelError::Handshake("timeout".into()).is_fatal());
        assert!(!TunnelError::SessionEnded("broker restart".into()).is_fatal());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(TunnelError::AlreadyConnected.exit_code(), 2);
        assert_eq!(TunnelError::InvalidToken.exit_code(), 1);
        assert_eq!(TunnelError::Connection("x".into()).exit_code(), 1);
    }
}
