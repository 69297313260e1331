// src/server/middleware/mod.rs
pub mod rate_limit;
pub mod validation;

pub use rate_limit::ConnectionRateLimiter;
pub use validation::{validate_inbound, validate_room_name};
