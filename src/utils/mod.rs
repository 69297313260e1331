pub mod error;
pub mod rate_limit;

pub use error::{Result, WebSocketError};
pub use rate_limit::{Limit, NoopLimiter, RateLimiter, SlidingWindowLimiter, TokenBucketLimiter};
