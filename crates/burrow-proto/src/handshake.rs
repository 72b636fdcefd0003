//! Handshake message types

use serde::{Deserialize, Serialize};

/// First message on the control stream: the agent authenticates with a token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthRequest {
    pub token: String,
    /// Evict any live session this user already has.
    #[serde(default)]
    pub force: bool,
}

/// Second message: the agent asks for specific hostnames.
///
/// An empty `requested_domains` means "bind all domains I own". Many clients
/// rely on this, so the empty-list meaning must not change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelRequest {
    pub requested_domains: Vec<String>,
}

/// Machine-readable handshake failure classification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidToken,
    AlreadyConnected,
    NoDomains,
    TermsNotAccepted,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::InvalidToken => "invalid_token",
            ErrorCode::AlreadyConnected => "already_connected",
            ErrorCode::NoDomains => "no_domains",
            ErrorCode::TermsNotAccepted => "terms_not_accepted",
        };
        f.write_str(s)
    }
}

/// Final handshake message, broker to agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InitResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_code: Option<ErrorCode>,
    /// The FQDNs the session is now reachable under. Present iff `success`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub bound_domains: Option<Vec<String>>,
}

impl InitResponse {
    pub fn ok(bound_domains: Vec<String>) -> Self {
        Self {
            success: true,
            error: None,
            error_code: None,
            bound_domains: Some(bound_domains),
        }
    }

    pub fn err(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            error_code: Some(code),
            bound_domains: None,
        }
    }
}
