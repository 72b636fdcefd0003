//! Broker configuration

use std::time::Duration;

/// Runtime configuration for one broker process.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Public root domain (`DOMAIN_NAME`). Tunnels bind as
    /// `<name>.<root_domain>`; unset means bare names (local dev).
    pub root_domain: Option<String>,

    /// Control plane bind address (`CONTROL_PLANE_PORT`, default `:4443`).
    pub control_addr: String,

    /// Public ingress bind address (dev default `:8080`, prod `:443`).
    pub ingress_addr: String,

    /// Serve plain HTTP even with a root domain configured
    /// (`INSECURE_HTTP`).
    pub insecure_http: bool,

    /// Daily per-user allowance in bytes (`DAILY_BANDWIDTH_LIMIT_MB`
    /// converted; 0 = unlimited).
    pub daily_limit_bytes: u64,

    /// Concurrent agent session cap on the control plane.
    pub max_sessions: usize,

    /// How often the bandwidth ledger persists counters.
    pub bandwidth_flush_interval: Duration,

    /// Grace period for in-flight work on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            root_domain: None,
            control_addr: "0.0.0.0:4443".to_string(),
            ingress_addr: "0.0.0.0:8080".to_string(),
            insecure_http: false,
            daily_limit_bytes: 100 * 1024 * 1024,
            max_sessions: 1000,
            bandwidth_flush_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl BrokerConfig {
    /// TLS is required on both listeners once a root domain is configured,
    /// unless explicitly overridden for development.
    pub fn is_secure(&self) -> bool {
        self.root_domain.is_some() && !self.insecure_http
    }

    /// Public FQDN for a bare domain label.
    pub fn fqdn(&self, name: &str) -> String {
        match &self.root_domain {
            Some(root) => format!("{}.{}", name, root),
            None => name.to_string(),
        }
    }

    /// Hostname of the dashboard, when a root domain exists.
    pub fn dashboard_host(&self) -> Option<String> {
        self.root_domain.as_ref().map(|root| format!("app.{}", root))
    }
}

/// Accept both `:4443` and `host:4443` bind addresses; the env variable
/// format uses the bare-port form.
pub fn normalize_bind_addr(addr: &str) -> String {
    if let Some(stripped) = addr.strip_prefix(':') {
        format!("0.0.0.0:{}", stripped)
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fqdn_with_root_domain() {
        let config = BrokerConfig {
            root_domain: Some("example.com".to_string()),
            ..Default::default()
        };
        assert_eq!(config.fqdn("misty-river"), "misty-river.example.com");
        assert_eq!(config.dashboard_host(), Some("app.example.com".to_string()));
        assert!(config.is_secure());
    }

    #[test]
    fn test_fqdn_local_dev() {
        let config = BrokerConfig::default();
        assert_eq!(config.fqdn("misty-river"), "misty-river");
        assert_eq!(config.dashboard_host(), None);
        assert!(!config.is_secure());
    }

    #[test]
    fn test_insecure_http_overrides() {
        let config = BrokerConfig {
            root_domain: Some("example.com".to_string()),
            insecure_http: true,
            ..Default::default()
        };
        assert!(!config.is_secure());
    }

    #[test]
    fn test_normalize_bind_addr() {
        assert_eq!(normalize_bind_addr(":4443"), "0.0.0.0:4443");
        assert_eq!(normalize_bind_addr("127.0.0.1:4443"), "127.0.0.1:4443");
    }
}
