//! Limit and window configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, TurnstileError};

/// Named window lengths accepted in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Second => Duration::from_secs(1),
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86400),
        }
    }
}

/// A window as written in configuration: either a unit name (`minute`) or a
/// number of seconds (`90`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WindowSpec {
    Unit(TimeWindow),
    Seconds(u64),
}

impl WindowSpec {
    /// Window length as a duration.
    pub fn duration(&self) -> Duration {
        match self {
            WindowSpec::Unit(unit) => unit.duration(),
            WindowSpec::Seconds(secs) => Duration::from_secs(*secs),
        }
    }
}

impl From<TimeWindow> for WindowSpec {
    fn from(unit: TimeWindow) -> Self {
        WindowSpec::Unit(unit)
    }
}

/// An immutable `(max_requests, window)` pair.
///
/// Counting is fixed-window: the first request of a partition opens a window
/// of length `window`, and the window resets entirely when it elapses. A
/// burst straddling the boundary can therefore admit up to twice
/// `max_requests` in a span shorter than one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitConfig {
    max_requests: u64,
    window: Duration,
}

impl LimitConfig {
    /// Create a limit, rejecting a zero request count or a zero window.
    pub fn new(max_requests: u64, window: Duration) -> Result<Self> {
        if max_requests == 0 {
            return Err(TurnstileError::Config(
                "limit must be a positive number of requests".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(TurnstileError::Config(
                "window must be longer than zero".to_string(),
            ));
        }
        Ok(Self {
            max_requests,
            window,
        })
    }

    /// Maximum requests admitted per window.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// Length of the counting window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Whether a post-increment `count` is over the limit.
    ///
    /// Strict: `count == max_requests` is the last admitted request.
    pub fn is_exceeded(&self, count: i64) -> bool {
        u64::try_from(count).is_ok_and(|count| count > self.max_requests)
    }

    /// Whether `count` is the first one over the limit in its window.
    pub fn is_first_rejection(&self, count: i64) -> bool {
        u64::try_from(count).ok() == self.max_requests.checked_add(1)
    }
}
