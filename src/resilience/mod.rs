//! Resilience primitives for the inference boundary
//!
//! - Circuit breaker: sliding failure window, exponential backoff between
//!   re-opens, open-count decay under sustained success
//! - Retry: jittered exponential backoff, transient errors only

pub mod breaker;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker, CircuitOpen};
pub use retry::{retry, Retryable, RetryConfig};
