//! Retry with jittered exponential backoff
//!
//! Transient failures are retried up to `max_retries` extra attempts; the
//! sleep between attempts doubles (capped) with uniform jitter so a fleet of
//! callers does not stampede a recovering backend. Cancellation is the usual
//! tokio contract: dropping the returned future abandons the operation.

use rand::Rng;
use std::time::Duration;
use tracing::debug;

/// Classifies an error as worth retrying.
///
/// Wire errors signalling Unavailable, DeadlineExceeded, ResourceExhausted,
/// Aborted, or Internal are transient; argument/permission/not-found errors
/// are permanent and fail fast.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

/// Retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Extra attempts after the first (total attempts = max_retries + 1)
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Ceiling for the exponential delay
    pub max_delay: Duration,
    /// Total width of the uniform jitter band around the exponential value
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    /// Policy for long-running LLM operations (streams, summarization).
    pub fn llm() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }

    /// Exponential component of the delay before retry `attempt` (0-based).
    fn exponential_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(6);
        self.base_delay.saturating_mul(1 << exp).min(self.max_delay)
    }

    /// Full delay: exponential value ± jitter/2, clamped to `max_delay`.
    fn delay(&self, attempt: u32) -> Duration {
        let exp = self.exponential_delay(attempt).as_secs_f64();
        let spread = rand::rng().random_range(-self.jitter / 2.0..=self.jitter / 2.0);
        let jittered = (exp * (1.0 + spread)).max(0.0);
        Duration::from_secs_f64(jittered).min(self.max_delay)
    }
}

/// Invoke `op` until it succeeds, returns a permanent error, or the attempt
/// budget is exhausted; the last error is returned in that case.
pub async fn retry<T, E, F, Fut>(config: &RetryConfig, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut last_err: Option<E> = None;
    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            tokio::time::sleep(config.delay(attempt - 1)).await;
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < config.max_retries => {
                debug!(attempt = attempt + 1, error = %err, "transient error, will retry");
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    // Unreachable: the loop always returns from its final iteration.
    Err(last_err.expect("retry loop exited without an error"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError {
        transient: bool,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error (transient={})", self.transient)
        }
    }

    impl Retryable for TestError {
        fn is_transient(&self) -> bool {
            self.transient
        }
    }

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(8),
            jitter: 0.2,
        }
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, TestError> = retry(&fast_config(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_permanent_error_single_invocation() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, TestError> = retry(&fast_config(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError { transient: false }) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_error_bounded_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, TestError> = retry(&fast_config(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError { transient: true }) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4); // max_retries + 1
    }

    #[tokio::test]
    async fn test_recovers_midway() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, TestError> = retry(&fast_config(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TestError { transient: true })
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_exponential_schedule_caps() {
        let cfg = RetryConfig {
            max_retries: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
        };
        assert_eq!(cfg.exponential_delay(0), Duration::from_millis(500));
        assert_eq!(cfg.exponential_delay(1), Duration::from_secs(1));
        assert_eq!(cfg.exponential_delay(4), Duration::from_secs(8));
        // Exponent caps at 6 and the result caps at max_delay.
        assert_eq!(cfg.exponential_delay(5), Duration::from_secs(10));
        assert_eq!(cfg.exponential_delay(60), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let cfg = RetryConfig::default();
        let exp = cfg.exponential_delay(2).as_secs_f64();
        for _ in 0..200 {
            let d = cfg.delay(2).as_secs_f64();
            assert!(d >= exp * (1.0 - cfg.jitter / 2.0) - f64::EPSILON);
            assert!(d <= exp * (1.0 + cfg.jitter / 2.0) + f64::EPSILON);
        }
    }
}
