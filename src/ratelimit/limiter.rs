//! Core rate limiter implementation.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use super::key::{KeyError, KeyStrategy, PartitionKey, RequestIdentity};
use super::window::LimitConfig;
use crate::store::{CounterStore, StoreError};

/// Why a request was turned away.
#[derive(Error, Debug)]
pub enum Rejection {
    /// The key strategy could not derive a partition key. Caller error.
    #[error(transparent)]
    MissingCredential(#[from] KeyError),

    /// The partition has used up its quota for the current window.
    #[error("too many requests")]
    QuotaExceeded { count: i64, limit: u64 },

    /// The counter store failed or timed out. Fail closed.
    #[error("rate limiter error")]
    StoreUnavailable(#[source] StoreError),
}

/// Outcome of one admission check.
#[derive(Debug)]
pub enum Decision {
    /// Admit the request. `count` is its ordinal within the window.
    Allow { count: i64 },
    /// Turn the request away.
    Reject(Rejection),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Decision::Allow { .. } => None,
            Decision::Reject(rejection) => Some(rejection),
        }
    }
}

/// Enforces "at most N requests per window per partition key".
///
/// The limiter holds no mutable state. All counting happens in the injected
/// [`CounterStore`], which linearizes concurrent increments of one key, so a
/// single limiter can be shared by any number of tasks.
pub struct RateLimiter {
    /// Route group name, used in logs
    name: String,
    strategy: KeyStrategy,
    limit: LimitConfig,
    store: Arc<dyn CounterStore>,
    /// Use the store's combined increment+expiry primitive
    atomic_expiry: bool,
}

impl RateLimiter {
    /// Create a rate limiter for one route group.
    pub fn new(
        name: impl Into<String>,
        strategy: KeyStrategy,
        limit: LimitConfig,
        store: Arc<dyn CounterStore>,
    ) -> Self {
        Self {
            name: name.into(),
            strategy,
            limit,
            store,
            atomic_expiry: false,
        }
    }

    /// Arm the window expiry in the same store call as the increment.
    ///
    /// Off by default: the increment and the first-request expiry are then
    /// two separate store calls, and a key whose expiry call fails is left
    /// without one until the leak repair in [`admit`](Self::admit) re-arms it.
    pub fn with_atomic_expiry(mut self, enabled: bool) -> Self {
        self.atomic_expiry = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> KeyStrategy {
        self.strategy
    }

    pub fn limit(&self) -> LimitConfig {
        self.limit
    }

    /// Decide whether to admit one request.
    ///
    /// 1. Derive the partition key. Failure rejects the request without
    ///    touching the store, so no quota is consumed.
    /// 2. Increment the key's counter. A store error or timeout rejects the
    ///    request (fail closed).
    /// 3. On the first increment of a window, arm the key's expiry. Later
    ///    requests never move it, so sustained traffic cannot keep a window
    ///    open forever.
    /// 4. Reject when the count is strictly greater than the limit.
    ///
    /// The window is fixed, not sliding: bursts on either side of a window
    /// boundary can admit up to twice the limit in less than one window.
    ///
    /// If the caller drops this future after the increment was sent, the
    /// store may still have applied it; the cancelled request then counts
    /// against the quota. Nothing is rolled back.
    pub async fn admit(&self, identity: &RequestIdentity<'_>) -> Decision {
        let key = match self.strategy.derive(identity) {
            Ok(key) => key,
            Err(e) => {
                debug!(limiter = %self.name, error = %e, "Rejecting request without partition key");
                return Decision::Reject(Rejection::MissingCredential(e));
            }
        };

        let window = self.limit.window();
        let counted = if self.atomic_expiry {
            self.store.increment_with_expiry(key.as_str(), window).await
        } else {
            self.store.increment(key.as_str()).await
        };

        let count = match counted {
            Ok(count) => count,
            Err(e) => {
                error!(
                    limiter = %self.name,
                    key = %key,
                    error = %e,
                    "Counter store unavailable, rejecting request"
                );
                return Decision::Reject(Rejection::StoreUnavailable(e));
            }
        };

        trace!(limiter = %self.name, key = %key, count, "Counted request");

        if count == 1 && !self.atomic_expiry {
            self.arm_expiry(&key).await;
        }

        if self.limit.is_exceeded(count) {
            if self.limit.is_first_rejection(count) {
                // Re-arm a key whose first expiry call was lost. A no-op
                // when the window already has an expiry.
                self.arm_expiry(&key).await;
            }
            debug!(
                limiter = %self.name,
                key = %key,
                count,
                limit = self.limit.max_requests(),
                "Rate limit exceeded"
            );
            return Decision::Reject(Rejection::QuotaExceeded {
                count,
                limit: self.limit.max_requests(),
            });
        }

        Decision::Allow { count }
    }

    async fn arm_expiry(&self, key: &PartitionKey) {
        match self
            .store
            .expire_if_absent(key.as_str(), self.limit.window())
            .await
        {
            Ok(applied) => {
                trace!(limiter = %self.name, key = %key, applied, "Window expiry requested");
            }
            Err(e) => {
                warn!(
                    limiter = %self.name,
                    key = %key,
                    error = %e,
                    "Failed to set window expiry"
                );
            }
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("strategy", &self.strategy)
            .field("limit", &self.limit)
            .field("atomic_expiry", &self.atomic_expiry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::key::API_KEY_HEADER;
    use crate::store::testing::{FailingStore, RecordingStore, StalledStore};
    use crate::store::{MemoryCounterStore, TimeoutStore};
    use futures::future::join_all;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    const MINUTE: Duration = Duration::from_secs(60);

    fn peer(last: u8) -> RequestIdentity<'static> {
        RequestIdentity::from_peer(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)))
    }

    fn limiter(limit: u64, store: Arc<dyn CounterStore>) -> RateLimiter {
        RateLimiter::new(
            "test",
            KeyStrategy::NetworkAddress,
            LimitConfig::new(limit, MINUTE).unwrap(),
            store,
        )
    }

    #[tokio::test]
    async fn test_rejects_after_limit() {
        let store = Arc::new(MemoryCounterStore::new());
        let limiter = limiter(10, store.clone());

        for i in 1..=10 {
            let decision = limiter.admit(&peer(1)).await;
            assert!(
                matches!(decision, Decision::Allow { count } if count == i),
                "Request {} should be allowed",
                i
            );
        }

        let decision = limiter.admit(&peer(1)).await;
        assert!(matches!(
            decision,
            Decision::Reject(Rejection::QuotaExceeded { count: 11, limit: 10 })
        ));
        assert_eq!(decision.rejection().unwrap().to_string(), "too many requests");
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_request_arms_expiry_once() {
        let store = Arc::new(RecordingStore::new());
        let limiter = limiter(5, store.clone());

        for _ in 0..3 {
            limiter.admit(&peer(1)).await;
        }

        assert_eq!(store.increments(), 3);
        assert_eq!(store.expiries(), 1);
        assert_eq!(store.inner.ttl("rate:10.0.0.1"), Some(MINUTE));
    }

    #[tokio::test]
    async fn test_missing_credential_skips_store() {
        let store = Arc::new(RecordingStore::new());
        let limiter = RateLimiter::new(
            "uploads",
            KeyStrategy::Credential,
            LimitConfig::new(10, MINUTE).unwrap(),
            store.clone(),
        );

        for _ in 0..3 {
            let decision = limiter.admit(&peer(1)).await;
            match decision {
                Decision::Reject(Rejection::MissingCredential(KeyError::MissingCredential {
                    header,
                })) => assert_eq!(header, API_KEY_HEADER),
                other => panic!("unexpected decision: {:?}", other),
            }
        }

        assert_eq!(store.calls(), 0);
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let store = Arc::new(MemoryCounterStore::new());
        let limiter = limiter(2, store.clone());

        limiter.admit(&peer(1)).await;
        limiter.admit(&peer(1)).await;
        assert!(!limiter.admit(&peer(1)).await.is_allowed());

        assert!(matches!(limiter.admit(&peer(2)).await, Decision::Allow { count: 1 }));
        assert_eq!(store.count("rate:10.0.0.1"), Some(3));
        assert_eq!(store.count("rate:10.0.0.2"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_rollover_starts_fresh() {
        let store = Arc::new(MemoryCounterStore::new());
        let limiter = limiter(3, store);

        for _ in 0..3 {
            assert!(limiter.admit(&peer(1)).await.is_allowed());
        }
        assert!(!limiter.admit(&peer(1)).await.is_allowed());

        tokio::time::advance(MINUTE + Duration::from_millis(1)).await;

        assert!(matches!(limiter.admit(&peer(1)).await, Decision::Allow { count: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_traffic_does_not_extend_window() {
        let store = Arc::new(MemoryCounterStore::new());
        let limiter = limiter(1000, store);

        for _ in 0..6 {
            limiter.admit(&peer(1)).await;
            tokio::time::advance(Duration::from_secs(10)).await;
        }

        // Six requests ten seconds apart span exactly one window.
        assert!(matches!(limiter.admit(&peer(1)).await, Decision::Allow { count: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_boundary_burst_is_accepted() {
        // Up to twice the limit can pass across a boundary.
        let store = Arc::new(MemoryCounterStore::new());
        let limiter = limiter(5, store);

        limiter.admit(&peer(1)).await;
        tokio::time::advance(MINUTE - Duration::from_millis(1)).await;
        for _ in 0..4 {
            assert!(limiter.admit(&peer(1)).await.is_allowed());
        }

        tokio::time::advance(Duration::from_millis(1)).await;
        for _ in 0..5 {
            assert!(limiter.admit(&peer(1)).await.is_allowed());
        }
        assert!(!limiter.admit(&peer(1)).await.is_allowed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admits_are_linearized() {
        let store = Arc::new(MemoryCounterStore::new());
        let limiter = Arc::new(limiter(10, store));

        let handles = (0..50).map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.admit(&peer(1)).await })
        });
        let decisions: Vec<Decision> = join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let mut counts: Vec<i64> = decisions
            .iter()
            .map(|decision| match decision {
                Decision::Allow { count } => *count,
                Decision::Reject(Rejection::QuotaExceeded { count, .. }) => *count,
                other => panic!("unexpected decision: {:?}", other),
            })
            .collect();
        counts.sort_unstable();
        assert_eq!(counts, (1..=50).collect::<Vec<i64>>());

        let allowed = decisions.iter().filter(|d| d.is_allowed()).count();
        assert_eq!(allowed, 10);
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed() {
        let limiter = limiter(10, Arc::new(FailingStore));

        for _ in 0..20 {
            let decision = limiter.admit(&peer(1)).await;
            assert!(matches!(decision, Decision::Reject(Rejection::StoreUnavailable(_))));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_timeout_fails_closed() {
        let store = TimeoutStore::new(StalledStore, Duration::from_millis(250));
        let limiter = limiter(10, Arc::new(store));

        let decision = limiter.admit(&peer(1)).await;
        assert!(matches!(
            decision,
            Decision::Reject(Rejection::StoreUnavailable(StoreError::Timeout(_)))
        ));
        assert_eq!(decision.rejection().unwrap().to_string(), "rate limiter error");
    }

    #[tokio::test]
    async fn test_expiry_failure_does_not_change_decision() {
        let store = Arc::new(RecordingStore::new().fail_next_expiries(1));
        let limiter = limiter(2, store.clone());

        assert!(limiter.admit(&peer(1)).await.is_allowed());
        assert_eq!(store.inner.ttl("rate:10.0.0.1"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_rejection_repairs_missing_expiry() {
        let store = Arc::new(RecordingStore::new().fail_next_expiries(1));
        let limiter = limiter(2, store.clone());

        limiter.admit(&peer(1)).await;
        limiter.admit(&peer(1)).await;
        assert_eq!(store.inner.ttl("rate:10.0.0.1"), None);

        assert!(!limiter.admit(&peer(1)).await.is_allowed());
        assert_eq!(store.inner.ttl("rate:10.0.0.1"), Some(MINUTE));

        // Later rejections in the same window do not call the store again.
        assert!(!limiter.admit(&peer(1)).await.is_allowed());
        assert_eq!(store.expiries(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_atomic_expiry_uses_combined_call() {
        let store = Arc::new(RecordingStore::new());
        let limiter = limiter(5, store.clone()).with_atomic_expiry(true);

        assert!(limiter.admit(&peer(1)).await.is_allowed());
        assert!(limiter.admit(&peer(1)).await.is_allowed());

        // RecordingStore keeps the trait's default two-step combination.
        assert_eq!(store.increments(), 2);
        assert_eq!(store.expiries(), 1);
        assert_eq!(store.inner.ttl("rate:10.0.0.1"), Some(MINUTE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_atomic_expiry_failure_does_not_change_decision() {
        let store = Arc::new(RecordingStore::new().fail_next_expiries(1));
        let limiter = limiter(1, store.clone()).with_atomic_expiry(true);

        assert!(limiter.admit(&peer(1)).await.is_allowed());
        assert_eq!(store.inner.ttl("rate:10.0.0.1"), None);

        let decision = limiter.admit(&peer(1)).await;
        assert!(matches!(
            decision,
            Decision::Reject(Rejection::QuotaExceeded { count: 2, limit: 1 })
        ));
        assert_eq!(store.inner.ttl("rate:10.0.0.1"), Some(MINUTE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_atomic_expiry_window_rollover() {
        let store = Arc::new(MemoryCounterStore::new());
        let limiter = limiter(1, store).with_atomic_expiry(true);

        assert!(limiter.admit(&peer(1)).await.is_allowed());
        assert!(!limiter.admit(&peer(1)).await.is_allowed());

        tokio::time::advance(MINUTE).await;
        assert!(limiter.admit(&peer(1)).await.is_allowed());
    }
}
