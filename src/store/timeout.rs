//! Per-call timeout decorator for counter stores.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::{CounterStore, StoreError};

/// Wraps a [`CounterStore`] so that no single call can stall a request for
/// longer than `timeout`.
///
/// A call that runs out of time is dropped and reported as
/// [`StoreError::Timeout`]. The store may still have applied it.
#[derive(Debug, Clone)]
pub struct TimeoutStore<S> {
    inner: S,
    timeout: Duration,
}

impl<S: CounterStore> TimeoutStore<S> {
    /// Bound every call to `inner` by `timeout`.
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// The configured per-call bound.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn bounded<T, F>(&self, op: &'static str, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>> + Send,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(op, timeout_ms = self.timeout.as_millis() as u64, "Counter store call timed out");
                Err(StoreError::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl<S: CounterStore> CounterStore for TimeoutStore<S> {
    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        self.bounded("increment", self.inner.increment(key)).await
    }

    async fn expire_if_absent(&self, key: &str, window: Duration) -> Result<bool, StoreError> {
        self.bounded("expire_if_absent", self.inner.expire_if_absent(key, window))
            .await
    }

    async fn increment_with_expiry(&self, key: &str, window: Duration) -> Result<i64, StoreError> {
        self.bounded(
            "increment_with_expiry",
            self.inner.increment_with_expiry(key, window),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::StalledStore;
    use crate::store::MemoryCounterStore;

    #[tokio::test(start_paused = true)]
    async fn test_stalled_call_times_out() {
        let store = TimeoutStore::new(StalledStore, Duration::from_millis(250));

        let result = store.increment("k").await;
        assert!(matches!(result, Err(StoreError::Timeout(t)) if t == Duration::from_millis(250)));

        let result = store.expire_if_absent("k", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_fast_calls_pass_through() {
        let store = TimeoutStore::new(MemoryCounterStore::new(), Duration::from_secs(1));

        assert_eq!(store.increment("k").await.unwrap(), 1);
        assert!(store.expire_if_absent("k", Duration::from_secs(1)).await.unwrap());
        assert_eq!(store.inner().count("k"), Some(1));
        assert_eq!(store.timeout(), Duration::from_secs(1));
    }
}
