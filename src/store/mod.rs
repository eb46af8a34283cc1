//! Shared counter stores.
//!
//! A store provides the two atomic primitives the decision engine composes:
//! an increment that creates the counter at 1 when absent, and a TTL setter
//! used once per window. All cross-request synchronization lives here; the
//! engine itself holds no lock across these calls.

mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Errors raised by a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unavailable(String),
    #[error("store command timed out")]
    Timeout,
    #[error("unexpected store reply: {0}")]
    Protocol(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            StoreError::Timeout
        } else if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Protocol(err.to_string())
        }
    }
}

/// Result of a single atomic increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterHit {
    /// Counter value after this increment.
    pub count: u64,
    /// Remaining time-to-live, when the store reported one in the same
    /// round-trip. `None` means the key carries no expiry yet.
    pub expires_in: Option<Duration>,
}

impl CounterHit {
    /// Whether this increment created the counter for a new window.
    pub fn is_first(&self) -> bool {
        self.count == 1
    }
}

/// Trait for shared counter store implementations.
///
/// Implementations must make `increment` linearizable across every caller,
/// including callers in other processes: no lost updates, and exactly one
/// caller per window observes a count of 1.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment the counter at `key`, creating it at 1 if absent.
    async fn increment(&self, key: &str) -> Result<CounterHit, StoreError>;

    /// Set a time-to-live on `key`.
    async fn expire_after(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Set a time-to-live on `key` only if it has none.
    ///
    /// Never shortens or extends a running window.
    async fn expire_if_unset(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;
}
