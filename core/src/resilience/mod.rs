//! Resilience module
//!
//! Protection against abusive or broken peers:
//! - Rate limiting of sources that keep sending dropped packets

pub mod rate_limit;

pub use rate_limit::{RateLimitConfig, RateLimitResult, RateLimiter};
