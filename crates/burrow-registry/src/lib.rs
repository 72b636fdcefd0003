//! Tunnel registry: the broker's live routing table.
//!
//! Two indexes behind one lock: hostname to [`RegistryEntry`] for ingress
//! lookups, and user id to session for the single-active-session rule.
//! Keeping both under the same lock makes a force-reconnect swap one
//! linearizable step: the evicted session's close signal fires before the
//! new entry is visible to any lookup.

use burrow_session::{SessionHandle, SessionId};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{info, warn};

/// What the ingress dispatcher needs to proxy one request.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub session: SessionHandle,
    pub user_id: i64,
    /// Disables the daily bandwidth limit for this tunnel's user.
    pub bandwidth_exempt: bool,
}

/// One user's active session and the hostname set it bound.
#[derive(Debug, Clone)]
struct UserSession {
    session: SessionHandle,
    hostnames: Vec<String>,
}

#[derive(Default)]
struct Inner {
    by_host: HashMap<String, RegistryEntry>,
    by_user: HashMap<i64, UserSession>,
}

/// Hostname-to-session routing table. One per broker process; the control
/// plane and the ingress dispatcher share it by `Arc`.
#[derive(Default)]
pub struct TunnelRegistry {
    inner: RwLock<Inner>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a public hostname to its live session.
    pub fn lookup(&self, hostname: &str) -> Option<RegistryEntry> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_host.get(hostname).cloned()
    }

    /// Whether the user currently has a live session.
    pub fn has_session(&self, user_id: i64) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_user.contains_key(&user_id)
    }

    /// Read-only connectivity query for the dashboard. The dashboard never
    /// reaches into control plane internals; this is the whole interface.
    pub fn is_connected(&self, user_id: i64) -> bool {
        self.has_session(user_id)
    }

    /// Bind `hostnames` to `session`, replacing any prior session this user
    /// had. Returns the evicted session, already signalled closed.
    ///
    /// The close signal fires while the write lock is held, so once any
    /// lookup observes the new entry the old session is guaranteed to have
    /// seen its close signal.
    pub fn register(
        &self,
        user_id: i64,
        session: SessionHandle,
        hostnames: Vec<String>,
        bandwidth_exempt: bool,
    ) -> Option<SessionHandle> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        let evicted = inner.by_user.remove(&user_id).map(|old| {
            for host in &old.hostnames {
                inner.by_host.remove(host);
            }
            old.session.close();
            old.session
        });

        for host in &hostnames {
            inner.by_host.insert(
                host.clone(),
                RegistryEntry {
                    session: session.clone(),
                    user_id,
                    bandwidth_exempt,
                },
            );
        }
        inner.by_user.insert(
            user_id,
            UserSession {
                session,
                hostnames: hostnames.clone(),
            },
        );

        info!(
            user_id,
            hostnames = ?hostnames,
            replaced = evicted.is_some(),
            "registered tunnel session"
        );
        evicted
    }

    /// Drop every hostname `session_id` holds, plus its user entry.
    ///
    /// Invoked by the close watcher. A session evicted by a force swap is
    /// already gone from both indexes by the time its watcher fires, so the
    /// id check keeps the watcher from tearing down the replacement.
    pub fn unregister_session(&self, session_id: SessionId) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        let user_id = inner
            .by_user
            .iter()
            .find(|(_, s)| s.session.id() == session_id)
            .map(|(uid, _)| *uid);

        match user_id {
            Some(uid) => {
                if let Some(old) = inner.by_user.remove(&uid) {
                    for host in &old.hostnames {
                        inner.by_host.remove(host);
                    }
                    info!(user_id = uid, session = %session_id, "unregistered tunnel session");
                }
            }
            None => {
                warn!(session = %session_id, "unregister for unknown session (already replaced)");
            }
        }
    }

    /// Number of hostnames currently routable.
    pub fn hostname_count(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_host.len()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_user.len()
    }

    /// Close every session. Used on broker shutdown.
    pub fn close_all(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for (_, user_session) in inner.by_user.drain() {
            user_session.session.close();
        }
        inner.by_host.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_session::MuxSession;

    fn test_session() -> SessionHandle {
        let (a, _b) = tokio::io::duplex(1024);
        // Leak the peer half; these tests only exercise registry bookkeeping.
        std::mem::forget(_b);
        MuxSession::server_side(a).handle()
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = TunnelRegistry::new();
        let session = test_session();

        let evicted = registry.register(
            1,
            session.clone(),
            vec!["misty-river.example.com".to_string()],
            false,
        );
        assert!(evicted.is_none());

        let entry = registry.lookup("misty-river.example.com").unwrap();
        assert_eq!(entry.user_id, 1);
        assert_eq!(entry.session.id(), session.id());
        assert!(!entry.bandwidth_exempt);

        assert!(registry.lookup("nope.example.com").is_none());
    }

    #[tokio::test]
    async fn test_single_session_per_user() {
        let registry = TunnelRegistry::new();

        let first = test_session();
        let second = test_session();

        registry.register(7, first.clone(), vec!["a.example.com".to_string()], false);
        registry.register(7, second.clone(), vec!["a.example.com".to_string()], false);

        assert_eq!(registry.session_count(), 1);
        assert_eq!(
            registry.lookup("a.example.com").unwrap().session.id(),
            second.id()
        );
    }

    #[tokio::test]
    async fn test_force_swap_evicts_and_closes_previous() {
        let registry = TunnelRegistry::new();

        let first = test_session();
        let second = test_session();

        registry.register(
            7,
            first.clone(),
            vec![
                "a.example.com".to_string(),
                "b.example.com".to_string(),
            ],
            false,
        );

        let evicted = registry.register(7, second.clone(), vec!["a.example.com".to_string()], false);

        let evicted = evicted.expect("previous session should be returned");
        assert_eq!(evicted.id(), first.id());
        // Closed inside the registration critical section.
        assert!(evicted.is_closed());

        // The whole old hostname set is swapped out, not just the overlap.
        assert!(registry.lookup("b.example.com").is_none());
        assert_eq!(
            registry.lookup("a.example.com").unwrap().session.id(),
            second.id()
        );
    }

    #[tokio::test]
    async fn test_no_lookup_resolves_to_stale_session_during_swap() {
        // Eviction ordering: once the new entry is visible, the old session
        // must already be signalled. Hammer the swap from one task while
        // another looks up, and assert every resolved session is live or the
        // lookup raced ahead of any registration at all.
        let registry = std::sync::Arc::new(TunnelRegistry::new());

        let reader = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for _ in 0..500 {
                    if let Some(entry) = registry.lookup("swap.example.com") {
                        assert!(
                            !entry.session.is_closed(),
                            "lookup resolved a session that was already evicted"
                        );
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        for _ in 0..50 {
            let session = test_session();
            registry.register(3, session, vec!["swap.example.com".to_string()], false);
            tokio::task::yield_now().await;
        }

        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_unregister_removes_all_hostnames() {
        let registry = TunnelRegistry::new();
        let session = test_session();

        registry.register(
            2,
            session.clone(),
            vec![
                "one.example.com".to_string(),
                "two.example.com".to_string(),
            ],
            true,
        );

        registry.unregister_session(session.id());

        assert!(registry.lookup("one.example.com").is_none());
        assert!(registry.lookup("two.example.com").is_none());
        assert!(!registry.has_session(2));
        assert_eq!(registry.hostname_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_unregister_keeps_replacement() {
        let registry = TunnelRegistry::new();

        let first = test_session();
        let second = test_session();

        registry.register(9, first.clone(), vec!["x.example.com".to_string()], false);
        registry.register(9, second.clone(), vec!["x.example.com".to_string()], false);

        // The evicted session's close watcher fires late.
        registry.unregister_session(first.id());

        assert_eq!(
            registry.lookup("x.example.com").unwrap().session.id(),
            second.id()
        );
        assert!(registry.is_connected(9));
    }

    #[tokio::test]
    async fn test_is_connected() {
        let registry = TunnelRegistry::new();
        assert!(!registry.is_connected(5));

        let session = test_session();
        registry.register(5, session.clone(), vec!["c.example.com".to_string()], false);
        assert!(registry.is_connected(5));

        registry.unregister_session(session.id());
        assert!(!registry.is_connected(5));
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = TunnelRegistry::new();
        let s1 = test_session();
        let s2 = test_session();

        registry.register(1, s1.clone(), vec!["a.example.com".to_string()], false);
        registry.register(2, s2.clone(), vec!["b.example.com".to_string()], false);

        registry.close_all();

        assert!(s1.is_closed());
        assert!(s2.is_closed());
        assert_eq!(registry.session_count(), 0);
        assert_eq!(registry.hostname_count(), 0);
    }

    #[tokio::test]
    async fn test_bandwidth_exempt_flag_carried() {
        let registry = TunnelRegistry::new();
        let session = test_session();

        registry.register(4, session, vec!["vip.example.com".to_string()], true);
        assert!(registry.lookup("vip.example.com").unwrap().bandwidth_exempt);
    }
}
