//! Circuit breaker with a sliding failure window
//!
//! State machine:
//!
//! ```text
//! Closed --threshold failures in window--> Open
//! Open   --backoff elapsed, next Allow--> HalfOpen
//! HalfOpen --one failure--> Open (open count + 1)
//! HalfOpen --N successes--> Closed (failure history cleared)
//! ```
//!
//! Each re-open doubles the backoff (capped); sustained success in the
//! Closed state decays the open count back to zero.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within `failure_window` that trip the breaker
    pub threshold: usize,
    /// Sliding window over which failures are counted
    pub failure_window: Duration,
    /// Base open duration before the first half-open probe
    pub reset_timeout: Duration,
    /// Ceiling for the doubled open duration
    pub max_backoff: Duration,
    /// Cumulative half-open successes required to close
    pub half_open_successes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            failure_window: Duration::from_secs(30),
            reset_timeout: Duration::from_secs(10),
            max_backoff: Duration::from_secs(120),
            half_open_successes: 2,
        }
    }
}

/// Breaker state, observable via [`CircuitBreaker::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Error returned by [`CircuitBreaker::allow`] while the breaker is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitOpen;

impl std::fmt::Display for CircuitOpen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "circuit breaker open")
    }
}

impl std::error::Error for CircuitOpen {}

struct Inner {
    state: BreakerState,
    /// Recent failure instants, pruned to `failure_window` and capped at
    /// `threshold` entries.
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_ok: u32,
    /// Last time an open rejection was logged; throttles to once per second.
    last_open_log: Option<Instant>,
}

/// Stateful gate in front of a flaky dependency.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
    open_count: AtomicU32,
    consecutive_ok: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                half_open_ok: 0,
                last_open_log: None,
            }),
            open_count: AtomicU32::new(0),
            consecutive_ok: AtomicU32::new(0),
        }
    }

    /// Gate one call. `Ok` means proceed; `Err(CircuitOpen)` means reject
    /// without touching the dependency. Never blocks.
    pub fn allow(&self) -> Result<(), CircuitOpen> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let backoff = self.current_backoff();
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= backoff {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_ok = 0;
                    debug!("circuit breaker half-open, allowing probe");
                    Ok(())
                } else {
                    let throttled = inner
                        .last_open_log
                        .map(|t| t.elapsed() < Duration::from_secs(1))
                        .unwrap_or(false);
                    if !throttled {
                        inner.last_open_log = Some(Instant::now());
                        warn!(
                            remaining_ms = (backoff - elapsed).as_millis() as u64,
                            "circuit breaker open, rejecting calls"
                        );
                    }
                    Err(CircuitOpen)
                }
            }
        }
    }

    /// Record a successful operation.
    pub fn success(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.half_open_ok += 1;
                if inner.half_open_ok >= self.config.half_open_successes {
                    inner.state = BreakerState::Closed;
                    inner.failures.clear();
                    inner.opened_at = None;
                    self.consecutive_ok.store(0, Ordering::Relaxed);
                    info!("circuit breaker closed after successful probes");
                }
            }
            BreakerState::Closed => {
                let ok = self.consecutive_ok.fetch_add(1, Ordering::Relaxed) + 1;
                if ok as usize >= 2 * self.config.threshold
                    && self.open_count.load(Ordering::Relaxed) > 0
                {
                    self.open_count.store(0, Ordering::Relaxed);
                    self.consecutive_ok.store(0, Ordering::Relaxed);
                    debug!("circuit breaker open count decayed to 0");
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Record a failed operation. Callers only report failures the error
    /// classifier deems transient; permanent errors bypass the breaker.
    pub fn failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::HalfOpen => self.trip(&mut inner),
            BreakerState::Closed => {
                self.consecutive_ok.store(0, Ordering::Relaxed);
                let now = Instant::now();
                inner.failures.push_back(now);
                let window = self.config.failure_window;
                while inner
                    .failures
                    .front()
                    .map(|&t| now.duration_since(t) > window)
                    .unwrap_or(false)
                {
                    inner.failures.pop_front();
                }
                while inner.failures.len() > self.config.threshold {
                    inner.failures.pop_front();
                }
                if inner.failures.len() >= self.config.threshold {
                    self.trip(&mut inner);
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Current state without side effects.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    /// Force the breaker back to a pristine Closed state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = BreakerState::Closed;
        inner.failures.clear();
        inner.opened_at = None;
        inner.half_open_ok = 0;
        self.open_count.store(0, Ordering::Relaxed);
        self.consecutive_ok.store(0, Ordering::Relaxed);
        debug!("circuit breaker reset");
    }

    /// Times the breaker has opened since the last decay or reset.
    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::Relaxed)
    }

    /// Gate + record in one call. Failure is recorded for every error.
    pub async fn execute<T, E, Fut>(&self, op: impl FnOnce() -> Fut) -> Result<T, E>
    where
        Fut: std::future::Future<Output = Result<T, E>>,
        E: From<CircuitOpen>,
    {
        self.allow()?;
        match op().await {
            Ok(value) => {
                self.success();
                Ok(value)
            }
            Err(err) => {
                self.failure();
                Err(err)
            }
        }
    }

    fn trip(&self, inner: &mut Inner) {
        let count = self.open_count.fetch_add(1, Ordering::Relaxed) + 1;
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.failures.clear();
        warn!(
            open_count = count,
            backoff_ms = self.current_backoff().as_millis() as u64,
            "circuit breaker opened"
        );
    }

    /// `min(reset_timeout * 2^min(open_count - 1, 4), max_backoff)`.
    fn current_backoff(&self) -> Duration {
        let opens = self.open_count.load(Ordering::Relaxed).max(1);
        let exp = (opens - 1).min(4);
        let backoff = self.config.reset_timeout.saturating_mul(1 << exp);
        backoff.min(self.config.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            threshold: 5,
            failure_window: Duration::from_secs(30),
            reset_timeout: Duration::from_millis(50),
            max_backoff: Duration::from_millis(400),
            half_open_successes: 2,
        }
    }

    #[test]
    fn test_threshold_failures_open() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..4 {
            cb.failure();
        }
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(cb.allow().is_err());
    }

    #[test]
    fn test_half_open_then_close() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..5 {
            cb.failure();
        }
        assert!(cb.allow().is_err());

        std::thread::sleep(Duration::from_millis(60));
        assert!(cb.allow().is_ok());
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        cb.success();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.success();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.open_count(), 1);
    }

    #[test]
    fn test_half_open_failure_reopens_with_longer_backoff() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..5 {
            cb.failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(cb.allow().is_ok());
        cb.failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.open_count(), 2);

        // Second open doubles the backoff, so 60ms is no longer enough.
        std::thread::sleep(Duration::from_millis(60));
        assert!(cb.allow().is_err());
        std::thread::sleep(Duration::from_millis(60));
        assert!(cb.allow().is_ok());
    }

    #[test]
    fn test_backoff_schedule() {
        let cb = CircuitBreaker::new(fast_config());
        for (opens, expected_ms) in [(1u32, 50u64), (2, 100), (3, 200), (4, 400), (5, 400), (9, 400)]
        {
            cb.open_count.store(opens, Ordering::Relaxed);
            assert_eq!(
                cb.current_backoff(),
                Duration::from_millis(expected_ms),
                "open count {opens}"
            );
        }
    }

    #[test]
    fn test_open_count_decays_after_sustained_success() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..5 {
            cb.failure();
        }
        std::thread::sleep(Duration::from_millis(60));
        assert!(cb.allow().is_ok());
        cb.success();
        cb.success();
        assert_eq!(cb.open_count(), 1);

        // 2 * threshold consecutive successes in Closed decay the count.
        for _ in 0..10 {
            cb.success();
        }
        assert_eq!(cb.open_count(), 0);
    }

    #[test]
    fn test_failure_resets_success_streak() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..9 {
            cb.success();
        }
        cb.failure();
        assert_eq!(cb.consecutive_ok.load(Ordering::Relaxed), 0);
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_reset() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..5 {
            cb.failure();
        }
        cb.reset();
        assert_eq!(cb.state(), BreakerState::Closed);
        assert_eq!(cb.open_count(), 0);
        assert!(cb.allow().is_ok());
    }

    #[tokio::test]
    async fn test_execute_composes() {
        #[derive(Debug, PartialEq)]
        enum OpError {
            Rejected,
            Failed,
        }
        impl From<CircuitOpen> for OpError {
            fn from(_: CircuitOpen) -> Self {
                OpError::Rejected
            }
        }

        let cb = CircuitBreaker::new(fast_config());
        let ok: Result<u32, OpError> = cb.execute(|| async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        for _ in 0..5 {
            let _: Result<(), OpError> = cb.execute(|| async { Err(OpError::Failed) }).await;
        }
        let rejected: Result<(), OpError> = cb.execute(|| async { Ok(()) }).await;
        assert_eq!(rejected.unwrap_err(), OpError::Rejected);
    }
}
