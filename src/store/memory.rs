//! In-process counter store.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use super::{CounterStore, StoreError};

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    count: i64,
    expires_at: Option<Instant>,
}

impl WindowEntry {
    fn fresh() -> Self {
        Self {
            count: 0,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// A [`CounterStore`] kept in a concurrent map inside this process.
///
/// Counts are only shared between tasks of one process, so this is meant for
/// tests and single-instance development setups. Each call locks a single map
/// shard and never holds it across an `.await`.
///
/// Time is read from `tokio::time`, so tests running on a paused clock can
/// step windows forward deterministically.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    entries: DashMap<String, WindowEntry>,
}

impl MemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current count for `key`, or `None` if it does not exist or has expired.
    pub fn count(&self, key: &str) -> Option<i64> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.count)
    }

    /// Remaining lifetime of `key`.
    ///
    /// `None` if the key is missing, expired, or has no expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            trace!(removed, "Purged expired counters");
        }
        removed
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(WindowEntry::fresh);

        if entry.is_expired(now) {
            *entry = WindowEntry::fresh();
        }
        entry.count += 1;
        Ok(entry.count)
    }

    async fn expire_if_absent(&self, key: &str, window: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let Some(mut entry) = self.entries.get_mut(key) else {
            return Ok(false);
        };

        if entry.is_expired(now) || entry.expires_at.is_some() {
            return Ok(false);
        }
        entry.expires_at = Some(now + window);
        Ok(true)
    }

    async fn increment_with_expiry(&self, key: &str, window: Duration) -> Result<i64, StoreError> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(WindowEntry::fresh);

        if entry.is_expired(now) {
            *entry = WindowEntry::fresh();
        }
        entry.count += 1;
        if entry.count == 1 {
            entry.expires_at = Some(now + window);
        }
        Ok(entry.count)
    }
}
