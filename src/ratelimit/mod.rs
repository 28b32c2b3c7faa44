//! Rate limiting logic: partition keys, limits and admission decisions.

mod key;
mod limiter;
mod window;

pub use key::{
    KeyError, KeyStrategy, PartitionKey, RequestIdentity, API_KEY_HEADER, USERNAME_HEADER,
};
pub use limiter::{Decision, RateLimiter, Rejection};
pub use window::{LimitConfig, TimeWindow, WindowSpec};
