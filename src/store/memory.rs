//! In-process counter store.
//!
//! Counters live in a sharded map; each increment runs under its shard's
//! write lock, which gives the same no-lost-update guarantee as a networked
//! store but only within one process.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use super::{CounterHit, CounterStore, StoreError};

#[derive(Debug)]
struct CounterRecord {
    count: u64,
    expires_at: Option<Instant>,
}

impl CounterRecord {
    fn new() -> Self {
        Self {
            count: 0,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }

    fn expires_in(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }
}

/// A counter store held in process memory.
///
/// Expired records are replaced lazily on the next increment. Records for
/// identities that never return are only dropped by
/// [`MemoryStore::purge_expired`]; a long-lived store should run it through
/// [`MemoryStore::spawn_purger`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    counters: DashMap<String, CounterRecord>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current count for `key`, or `None` if absent or expired.
    pub fn current_count(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        self.counters
            .get(key)
            .filter(|record| !record.is_expired(now))
            .map(|record| record.count)
    }

    /// Drop every expired record and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.counters.len();
        self.counters.retain(|_, record| !record.is_expired(now));
        let removed = before.saturating_sub(self.counters.len());
        trace!(removed, "Purged expired counters");
        removed
    }

    /// Run [`MemoryStore::purge_expired`] every `every` on the tokio runtime.
    ///
    /// The task holds only a weak reference and exits once the store is
    /// dropped.
    pub fn spawn_purger(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        debug!(every_ms = u64::try_from(every.as_millis()).unwrap_or(u64::MAX), "Starting expired counter purger");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => {
                        store.purge_expired();
                    }
                    None => break,
                }
            }
            debug!("Counter store dropped, purger stopped");
        })
    }

    /// Number of records currently held, expired or not.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str) -> Result<CounterHit, StoreError> {
        let now = Instant::now();
        let mut record = self
            .counters
            .entry(key.to_string())
            .or_insert_with(CounterRecord::new);

        if record.is_expired(now) {
            *record = CounterRecord::new();
        }
        record.count += 1;

        Ok(CounterHit {
            count: record.count,
            expires_in: record.expires_in(now),
        })
    }

    async fn expire_after(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        if let Some(mut record) = self.counters.get_mut(key) {
            record.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn expire_if_unset(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        if let Some(mut record) = self.counters.get_mut(key) {
            if record.expires_at.is_none() {
                record.expires_at = Some(Instant::now() + ttl);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_increment_creates_at_one() {
        let store = MemoryStore::new();

        let hit = store.increment("rate-limit:a").await.unwrap();
        assert_eq!(hit.count, 1);
        assert!(hit.is_first());
        assert_eq!(hit.expires_in, None);

        let hit = store.increment("rate-limit:a").await.unwrap();
        assert_eq!(hit.count, 2);
        assert!(!hit.is_first());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_reports_remaining_ttl() {
        let store = MemoryStore::new();

        store.increment("k").await.unwrap();
        store.expire_after("k", Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        let hit = store.increment("k").await.unwrap();
        assert_eq!(hit.count, 2);
        assert_eq!(hit.expires_in, Some(Duration::from_secs(6)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_record_restarts_window() {
        let store = MemoryStore::new();

        store.increment("k").await.unwrap();
        store.expire_after("k", Duration::from_millis(500)).await.unwrap();
        store.increment("k").await.unwrap();
        assert_eq!(store.current_count("k"), Some(2));

        tokio::time::advance(Duration::from_millis(501)).await;
        assert_eq!(store.current_count("k"), None);

        let hit = store.increment("k").await.unwrap();
        assert_eq!(hit.count, 1);
        assert_eq!(hit.expires_in, None);
    }

    #[tokio::test]
    async fn test_expire_after_missing_key_is_noop() {
        let store = MemoryStore::new();
        store.expire_after("missing", Duration::from_secs(1)).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = MemoryStore::new();

        store.increment("short").await.unwrap();
        store.expire_after("short", Duration::from_secs(1)).await.unwrap();
        store.increment("long").await.unwrap();
        store.expire_after("long", Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.current_count("long"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_if_unset_keeps_existing_ttl() {
        let store = MemoryStore::new();

        store.increment("bare").await.unwrap();
        store.expire_if_unset("bare", Duration::from_secs(5)).await.unwrap();
        store.expire_if_unset("bare", Duration::from_secs(60)).await.unwrap();

        let hit = store.increment("bare").await.unwrap();
        assert_eq!(hit.expires_in, Some(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purger_drops_idle_records() {
        let store = Arc::new(MemoryStore::new());
        let purger = store.spawn_purger(Duration::from_secs(1));

        store.increment("idle").await.unwrap();
        store.expire_after("idle", Duration::from_millis(500)).await.unwrap();
        store.increment("busy").await.unwrap();
        store.expire_after("busy", Duration::from_secs(60)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(store.len(), 1);
        assert_eq!(store.current_count("busy"), Some(1));

        drop(store);
        let stopped = tokio::time::timeout(Duration::from_secs(5), purger).await;
        assert!(matches!(stopped, Ok(Ok(()))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(MemoryStore::new());

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment("hot").await.unwrap() })
            })
            .collect();

        let mut firsts = 0;
        for handle in handles {
            if handle.await.unwrap().is_first() {
                firsts += 1;
            }
        }

        assert_eq!(firsts, 1);
        assert_eq!(store.current_count("hot"), Some(200));
    }
}
