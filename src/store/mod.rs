//! Shared counter stores backing the rate limiter.
//!
//! The limiter never keeps counts in-process. Every count lives in a
//! [`CounterStore`], which linearizes increments for the same key across all
//! tasks and all service instances.

mod memory;
mod redis_store;
mod timeout;

#[cfg(test)]
pub(crate) mod testing;

pub use memory::MemoryCounterStore;
pub use redis_store::{RedisCounterStore, RedisStoreConfig};
pub use timeout::TimeoutStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Errors returned by counter store calls.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The call did not complete within the configured bound
    #[error("counter store call timed out after {0:?}")]
    Timeout(Duration),

    /// Redis reported an error or the connection failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Any other backend failure
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

/// Atomic integer store used for fixed-window counting.
///
/// Both primitives must be individually atomic. Implementations are shared
/// across tasks behind an `Arc`.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter for `key` by one and return the new value.
    ///
    /// A missing (or expired) key starts from zero, so the first call of a
    /// window returns 1.
    async fn increment(&self, key: &str) -> Result<i64, StoreError>;

    /// Set the expiry of `key` to `window` if the key exists and has none.
    ///
    /// Returns `true` if an expiry was applied.
    async fn expire_if_absent(&self, key: &str, window: Duration) -> Result<bool, StoreError>;

    /// Increment `key` and arm its expiry when the increment created it.
    ///
    /// The default issues the two calls back to back. Stores that can do
    /// this in one atomic step should override it. A failed expiry call is
    /// logged and the count still returned, since the increment already
    /// happened.
    async fn increment_with_expiry(&self, key: &str, window: Duration) -> Result<i64, StoreError> {
        let count = self.increment(key).await?;
        if count == 1 {
            if let Err(e) = self.expire_if_absent(key, window).await {
                warn!(key, error = %e, "Failed to set window expiry");
            }
        }
        Ok(count)
    }
}
