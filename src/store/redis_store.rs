//! Redis-backed counter store.
//!
//! Counters are plain Redis integers:
//! - `increment` is a single `INCR`
//! - `expire_if_absent` runs a short Lua script that applies `PEXPIRE` only
//!   when `PTTL` reports the key has no expiry, so it can never push an
//!   existing window forward
//! - `increment_with_expiry` runs `INCR` and the first-increment `PEXPIRE`
//!   inside one script, closing the gap where a key could be left without
//!   an expiry
//!
//! Connections go through `redis::aio::ConnectionManager`, which reconnects
//! on failure. Calls are not bounded here; wrap the store in a
//! [`TimeoutStore`](super::TimeoutStore) for that.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

use super::{CounterStore, StoreError};

const EXPIRE_IF_ABSENT: &str = r#"
if redis.call('PTTL', KEYS[1]) == -1 then
  return redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return 0
"#;

const INCREMENT_WITH_EXPIRY: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Configuration for the Redis counter store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prefix prepended to every partition key (default: empty)
    pub key_prefix: String,
    /// Bound on establishing the initial connection (default: 2s)
    pub connect_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

/// A [`CounterStore`] shared across service instances through Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
    expire_script: Script,
    increment_script: Script,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect to Redis with the default configuration.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect to Redis with a custom configuration.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid, the server is unreachable, or
    /// the connection is not established within `config.connect_timeout`.
    pub async fn connect_with_config(
        url: &str,
        config: RedisStoreConfig,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(config.connect_timeout))??;

        info!(key_prefix = %config.key_prefix, "Connected to Redis counter store");

        Ok(Self {
            connection,
            config,
            expire_script: Script::new(EXPIRE_IF_ABSENT),
            increment_script: Script::new(INCREMENT_WITH_EXPIRY),
        })
    }

    /// Check that the server answers.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }
}

fn window_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection.clone();
        let count: i64 = conn.incr(self.key(key), 1).await?;
        Ok(count)
    }

    async fn expire_if_absent(&self, key: &str, window: Duration) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let applied: i64 = self
            .expire_script
            .key(self.key(key))
            .arg(window_millis(window))
            .invoke_async(&mut conn)
            .await?;
        debug!(key = %key, applied = applied == 1, "Expiry requested");
        Ok(applied == 1)
    }

    async fn increment_with_expiry(&self, key: &str, window: Duration) -> Result<i64, StoreError> {
        let mut conn = self.connection.clone();
        let count: i64 = self
            .increment_script
            .key(self.key(key))
            .arg(window_millis(window))
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REDIS_URL: &str = "redis://127.0.0.1/";

    async fn test_store(test_name: &str) -> Option<RedisCounterStore> {
        let config = RedisStoreConfig {
            key_prefix: format!("turnstile-test:{}:{}:", test_name, std::process::id()),
            ..Default::default()
        };
        match RedisCounterStore::connect_with_config(REDIS_URL, config).await {
            Ok(store) => Some(store),
            Err(e) => {
                eprintln!("Skipping test: Redis not available at {}: {}", REDIS_URL, e);
                None
            }
        }
    }

    #[test]
    fn test_window_millis() {
        assert_eq!(window_millis(Duration::from_secs(60)), 60_000);
        assert_eq!(window_millis(Duration::ZERO), 1);
        assert_eq!(window_millis(Duration::from_micros(10)), 1);
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let result = RedisCounterStore::connect("not-a-redis-url").await;
        assert!(matches!(result, Err(StoreError::Redis(_))));
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_increment_and_expire() {
        let Some(store) = test_store("increment_and_expire").await else {
            return;
        };
        let window = Duration::from_secs(5);

        assert_eq!(store.increment("k").await.unwrap(), 1);
        assert_eq!(store.increment("k").await.unwrap(), 2);

        assert!(store.expire_if_absent("k", window).await.unwrap());
        // A second request must not move the window.
        assert!(!store.expire_if_absent("k", window).await.unwrap());
        assert!(!store.expire_if_absent("missing", window).await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_window_rollover() {
        let Some(store) = test_store("rollover").await else {
            return;
        };
        let window = Duration::from_millis(200);

        assert_eq!(store.increment_with_expiry("k", window).await.unwrap(), 1);
        assert_eq!(store.increment_with_expiry("k", window).await.unwrap(), 2);

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(store.increment_with_expiry("k", window).await.unwrap(), 1);
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_ping() {
        let Some(store) = test_store("ping").await else {
            return;
        };
        store.ping().await.unwrap();
    }
}
