//! Per-user daily bandwidth accounting.
//!
//! Counters live in memory keyed by `(user, UTC day)`; increments are
//! lock-free and admission reads snapshot the in-memory value. A flush task
//! persists deltas through the storage collaborator every interval and once
//! at shutdown; losing the final few seconds of counts is acceptable, since
//! the in-memory view is what admission trusts.

use burrow_db::{Store, StoreError};
use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Key = (i64, NaiveDate);

/// In-memory daily byte counters with soft admission.
pub struct BandwidthLedger {
    /// 0 means unlimited.
    limit_bytes: u64,
    counters: DashMap<Key, Arc<AtomicU64>>,
    /// Portion of each counter already persisted.
    flushed: DashMap<Key, u64>,
}

impl BandwidthLedger {
    pub fn new(limit_bytes: u64) -> Self {
        Self {
            limit_bytes,
            counters: DashMap::new(),
            flushed: DashMap::new(),
        }
    }

    pub fn limit_bytes(&self) -> u64 {
        self.limit_bytes
    }

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    fn counter(&self, key: Key) -> Arc<AtomicU64> {
        self.counters
            .entry(key)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    /// Add transferred bytes to today's counter.
    pub fn add(&self, user_id: i64, bytes: u64) {
        self.counter((user_id, Self::today()))
            .fetch_add(bytes, Ordering::Relaxed);
    }

    /// Today's in-memory usage for a user.
    pub fn used_today(&self, user_id: i64) -> u64 {
        self.counters
            .get(&(user_id, Self::today()))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Whether a new exchange may start for this user.
    pub fn admit(&self, user_id: i64, bandwidth_exempt: bool) -> bool {
        if bandwidth_exempt || self.limit_bytes == 0 {
            return true;
        }
        self.used_today(user_id) < self.limit_bytes
    }

    /// Pull the persisted counter into memory the first time a user shows
    /// up today, so a broker restart does not reset allowances.
    pub async fn hydrate(&self, store: &dyn Store, user_id: i64) {
        let key = (user_id, Self::today());
        if self.counters.contains_key(&key) {
            return;
        }
        match store.bandwidth_used(user_id, key.1).await {
            Ok(persisted) if persisted > 0 => {
                let counter = self.counter(key);
                // Another task may have raced an increment in; only seed the base.
                counter.fetch_add(persisted, Ordering::Relaxed);
                self.flushed.insert(key, persisted);
                debug!(user_id, persisted, "hydrated bandwidth counter");
            }
            Ok(_) => {
                self.counter(key);
            }
            Err(e) => warn!(user_id, error = %e, "failed to hydrate bandwidth counter"),
        }
    }

    /// Persist every counter's unflushed delta.
    pub async fn flush(&self, store: &dyn Store) -> Result<(), StoreError> {
        let keys: Vec<Key> = self.counters.iter().map(|e| *e.key()).collect();
        let today = Self::today();

        for key in keys {
            let current = self
                .counters
                .get(&key)
                .map(|c| c.load(Ordering::Relaxed))
                .unwrap_or(0);
            let already = self.flushed.get(&key).map(|v| *v).unwrap_or(0);

            if current > already {
                store.add_bandwidth(key.0, key.1, current - already).await?;
                self.flushed.insert(key, current);
            }

            // Finished days never grow again; drop them once persisted.
            if key.1 < today && current <= already {
                self.counters.remove(&key);
                self.flushed.remove(&key);
            }
        }
        Ok(())
    }

    /// Periodic persistence until shutdown, plus one final flush.
    pub async fn run_flusher(
        self: Arc<Self>,
        store: Arc<dyn Store>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.flush(store.as_ref()).await {
                        warn!(error = %e, "bandwidth flush failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    if let Err(e) = self.flush(store.as_ref()).await {
                        warn!(error = %e, "final bandwidth flush failed");
                    }
                    return;
                }
            }
        }
    }
}
