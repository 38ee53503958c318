//! Resilience primitives for Corral's outbound calls.
//!
//! One [`CircuitBreaker`] guards each external dependency (the document
//! store connection, the workflow engine, per-source extractor runs); the
//! process-wide [`BreakerRegistry`] hands out named breakers idempotently.
//! [`RetryConfig`] provides backoff strategies with jitter for transient
//! failures.

pub mod breaker;
pub mod retry;

pub use breaker::{
    BreakerRegistry, BreakerStatus, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    CircuitStats, Clock, ManualClock, SystemClock,
};
pub use retry::{RetryConfig, RetryStrategy};
