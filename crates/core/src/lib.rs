// Transport-agnostic primitives for the Toolgate protocol engine

pub mod context;
pub mod ratelimit;

pub use context::CallContext;
pub use ratelimit::{RateLimitConfig, RateLimitError, RateLimiter, TokenBucket};
