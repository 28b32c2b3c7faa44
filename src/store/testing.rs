//! Counter store doubles shared by unit tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{CounterStore, MemoryCounterStore, StoreError};

/// A store whose calls never complete.
pub struct StalledStore;

#[async_trait]
impl CounterStore for StalledStore {
    async fn increment(&self, _key: &str) -> Result<i64, StoreError> {
        futures::future::pending().await
    }

    async fn expire_if_absent(&self, _key: &str, _window: Duration) -> Result<bool, StoreError> {
        futures::future::pending().await
    }
}

/// A store that rejects every call.
pub struct FailingStore;

#[async_trait]
impl CounterStore for FailingStore {
    async fn increment(&self, _key: &str) -> Result<i64, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn expire_if_absent(&self, _key: &str, _window: Duration) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("connection refused".to_string()))
    }
}

/// A memory store that records how often it is called and can fail the
/// first few expiry requests.
#[derive(Default)]
pub struct RecordingStore {
    pub inner: MemoryCounterStore,
    increments: AtomicUsize,
    expiries: AtomicUsize,
    failing_expiries: AtomicUsize,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls to `expire_if_absent`.
    pub fn fail_next_expiries(self, n: usize) -> Self {
        self.failing_expiries.store(n, Ordering::SeqCst);
        self
    }

    pub fn increments(&self) -> usize {
        self.increments.load(Ordering::SeqCst)
    }

    pub fn expiries(&self) -> usize {
        self.expiries.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.increments() + self.expiries()
    }
}

#[async_trait]
impl CounterStore for RecordingStore {
    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        self.increments.fetch_add(1, Ordering::SeqCst);
        self.inner.increment(key).await
    }

    async fn expire_if_absent(&self, key: &str, window: Duration) -> Result<bool, StoreError> {
        self.expiries.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .failing_expiries
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(StoreError::Timeout(Duration::from_millis(250)));
        }
        self.inner.expire_if_absent(key, window).await
    }
}
