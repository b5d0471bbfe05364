//! Guards around external platform calls: a sliding-window rate limiter, a
//! three-state circuit breaker and a jittered exponential-backoff retry policy.
//!
//! All state is local to one instance; nothing here is process-global. Locks are held
//! only for in-memory bookkeeping and never across an `.await`.

#![deny(unsafe_code)]

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use rate_limiter::{RateLimitConfig, RateLimitStats, RateLimiter};
pub use retry::{AttemptReport, RetryConfig, RetryOutcome, RetryPolicy};
