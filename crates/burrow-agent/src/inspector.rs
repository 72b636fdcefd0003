//! Request capture for the local inspector.
//!
//! The agent records one entry per proxied HTTP exchange into a bounded
//! ring; the inspector web UI (a separate collaborator) reads them back.
//! Opaque (non-HTTP) streams are not recorded.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

const DEFAULT_CAPACITY: usize = 100;

/// One proxied request/response pair.
#[derive(Debug, Clone)]
pub struct CapturedExchange {
    pub id: u64,
    pub method: String,
    pub host: String,
    pub path: String,
    /// Filled in once the local service answers.
    pub status: Option<u16>,
    pub at: DateTime<Utc>,
}

/// Bounded in-memory exchange log.
pub struct Inspector {
    capacity: usize,
    next_id: AtomicU64,
    entries: Mutex<VecDeque<CapturedExchange>>,
}

impl Inspector {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            next_id: AtomicU64::new(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Record a request as it heads to the local service.
    pub fn record_request(&self, method: &str, host: &str, path: &str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(CapturedExchange {
            id,
            method: method.to_string(),
            host: host.to_string(),
            path: path.to_string(),
            status: None,
            at: Utc::now(),
        });
        id
    }

    /// Attach the response status once known.
    pub fn record_status(&self, id: u64, status: u16) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
            entry.status = Some(status);
        }
    }

    /// Most recent exchanges, oldest first.
    pub fn recent(&self) -> Vec<CapturedExchange> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().cloned().collect()
    }
}

impl Default for Inspector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_update() {
        let inspector = Inspector::new();

        let id = inspector.record_request("GET", "misty-river.example.com", "/api");
        inspector.record_status(id, 200);

        let entries = inspector.recent();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].method, "GET");
        assert_eq!(entries[0].path, "/api");
        assert_eq!(entries[0].status, Some(200));
    }

    #[test]
    fn test_ring_is_bounded() {
        let inspector = Inspector::with_capacity(3);
        for i in 0..10 {
            inspector.record_request("GET", "h", &format!("/{}", i));
        }

        let entries = inspector.recent();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].path, "/7");
        assert_eq!(entries[2].path, "/9");
    }

    #[test]
    fn test_status_for_evicted_entry_is_ignored() {
        let inspector = Inspector::with_capacity(1);
        let first = inspector.record_request("GET", "h", "/first");
        inspector.record_request("GET", "h", "/second");

        inspector.record_status(first, 200);
        let entries = inspector.recent();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, None);
    }
}
