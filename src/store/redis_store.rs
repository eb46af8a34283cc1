//! Redis-backed counter store.
//!
//! `INCR` and `PTTL` are sent as one `MULTI/EXEC` transaction so the count
//! and the remaining TTL come back in a single atomic round-trip. `PEXPIRE`
//! is a separate command, issued only by the caller that observed a count
//! of 1.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::Client;
use tracing::{debug, info, warn};

use super::{CounterHit, CounterStore, StoreError};

/// Command timeout used when none is configured.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(1000);

/// Reconnection attempts before a connect or reconnect gives up.
const CONNECT_RETRIES: usize = 2;
/// Base delay between reconnection attempts, in milliseconds.
const RETRY_FACTOR_MS: u64 = 10;
/// Upper bound on a single reconnection delay, in milliseconds.
const MAX_RETRY_DELAY_MS: u64 = 200;

/// A counter store backed by a Redis server.
///
/// The connection manager reconnects on its own after a dropped connection,
/// with a small bounded number of retries. Every command, and the initial
/// connect, is bounded by the command timeout, so a dead or stalled server
/// surfaces as [`StoreError::Unavailable`] or [`StoreError::Timeout`] instead
/// of blocking the caller.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    command_timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl RedisStore {
    /// Connect to the Redis server at `url` with the default command timeout.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_timeout(url, DEFAULT_COMMAND_TIMEOUT).await
    }

    /// Connect to the Redis server at `url`, bounding the connect and every
    /// later command by `command_timeout`.
    pub async fn connect_with_timeout(url: &str, command_timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let manager_config = ConnectionManagerConfig::new()
            .set_number_of_retries(CONNECT_RETRIES)
            .set_factor(RETRY_FACTOR_MS)
            .set_max_delay(MAX_RETRY_DELAY_MS)
            .set_connection_timeout(command_timeout)
            .set_response_timeout(command_timeout);

        let connection = tokio::time::timeout(
            command_timeout,
            ConnectionManager::new_with_config(client, manager_config),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        info!(
            command_timeout_ms = u64::try_from(command_timeout.as_millis()).unwrap_or(u64::MAX),
            "Connected to Redis counter store"
        );

        Ok(Self {
            connection,
            command_timeout,
        })
    }

    /// The bound applied to every command.
    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    async fn run<T, F>(&self, command: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        tokio::time::timeout(self.command_timeout, command)
            .await
            .map_err(|_| StoreError::Timeout)?
            .map_err(StoreError::from)
    }

    async fn pexpire(&self, key: &str, ttl: Duration, only_if_unset: bool) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);

        let mut command = redis::cmd("PEXPIRE");
        command.arg(key).arg(millis);
        if only_if_unset {
            command.arg("NX");
        }
        self.run(command.query_async(&mut connection)).await
    }
}

/// Convert a `PTTL` reply into a remaining TTL.
///
/// Redis answers `-1` for a key without expiry and `-2` for a missing key.
fn ttl_from_pttl(pttl: i64) -> Option<Duration> {
    u64::try_from(pttl).ok().map(Duration::from_millis)
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str) -> Result<CounterHit, StoreError> {
        let mut connection = self.connection.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().incr(key, 1).cmd("PTTL").arg(key);

        let (count, pttl): (i64, i64) = self.run(pipe.query_async(&mut connection)).await?;
        let count = u64::try_from(count)
            .map_err(|_| StoreError::Protocol(format!("negative counter value {}", count)))?;

        Ok(CounterHit {
            count,
            expires_in: ttl_from_pttl(pttl),
        })
    }

    async fn expire_after(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        if !self.pexpire(key, ttl, false).await? {
            debug!(key = %key, "PEXPIRE found no key; it expired before the TTL was set");
        }
        Ok(())
    }

    // PEXPIRE NX needs Redis 7.0 or later.
    async fn expire_if_unset(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        if self.pexpire(key, ttl, true).await? {
            warn!(key = %key, "Restored missing TTL on rate limit counter");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_from_pttl() {
        assert_eq!(ttl_from_pttl(1500), Some(Duration::from_millis(1500)));
        assert_eq!(ttl_from_pttl(0), Some(Duration::ZERO));
        assert_eq!(ttl_from_pttl(-1), None);
        assert_eq!(ttl_from_pttl(-2), None);
    }

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    fn unique_key(prefix: &str) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("turnstile-test:{}:{}", prefix, nanos)
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_redis_increment_and_expire() {
        let store = RedisStore::connect(&redis_url()).await.unwrap();
        let key = unique_key("incr");

        let first = store.increment(&key).await.unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(first.expires_in, None);

        store.expire_after(&key, Duration::from_secs(5)).await.unwrap();

        let second = store.increment(&key).await.unwrap();
        assert_eq!(second.count, 2);
        let remaining = second.expires_in.unwrap();
        assert!(remaining <= Duration::from_secs(5));
        assert!(remaining > Duration::from_secs(3));
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_redis_key_expires() {
        let store = RedisStore::connect_with_timeout(&redis_url(), Duration::from_secs(2))
            .await
            .unwrap();
        let key = unique_key("expire");

        store.increment(&key).await.unwrap();
        store.expire_after(&key, Duration::from_millis(200)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let hit = store.increment(&key).await.unwrap();
        assert_eq!(hit.count, 1);
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_fast() {
        let started = std::time::Instant::now();
        let result =
            RedisStore::connect_with_timeout("redis://127.0.0.1:1", Duration::from_millis(500)).await;

        assert!(matches!(
            result,
            Err(StoreError::Unavailable(_)) | Err(StoreError::Timeout)
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_redis_expire_if_unset_keeps_running_window() {
        let store = RedisStore::connect(&redis_url()).await.unwrap();
        let key = unique_key("repair");

        store.increment(&key).await.unwrap();
        store.expire_if_unset(&key, Duration::from_secs(5)).await.unwrap();
        store.expire_if_unset(&key, Duration::from_secs(60)).await.unwrap();

        let hit = store.increment(&key).await.unwrap();
        assert!(hit.expires_in.unwrap() <= Duration::from_secs(5));
    }

    #[tokio::test]
    #[ignore = "requires a Redis server at REDIS_URL"]
    async fn test_redis_concurrent_first_increment() {
        let store = RedisStore::connect(&redis_url()).await.unwrap();
        let key = unique_key("race");

        let hits = futures::future::join_all((0..50).map(|_| store.increment(&key))).await;
        let firsts = hits
            .into_iter()
            .map(|hit| hit.unwrap())
            .filter(CounterHit::is_first)
            .count();
        assert_eq!(firsts, 1);
    }
}
