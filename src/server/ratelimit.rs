//! IP-scoped sliding-window rate limiting
//!
//! One window per client IP, shared across every WebSocket connection from
//! that IP, so opening more sockets buys no extra quota.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Messages accepted per window
    pub max_messages: usize,
    /// Trailing window length
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_messages: 10,
            window: Duration::from_secs(1),
        }
    }
}

/// Sliding window of accept timestamps per IP.
pub struct IpRateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl IpRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record and accept one message, or reject it without recording.
    pub fn allow(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        let window = windows.entry(ip).or_default();
        while window
            .front()
            .map(|&t| now.duration_since(t) > self.config.window)
            .unwrap_or(false)
        {
            window.pop_front();
        }
        if window.len() >= self.config.max_messages {
            return false;
        }
        window.push_back(now);
        true
    }

    /// Drop IPs whose window has fully expired.
    pub fn prune(&self) {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        windows.retain(|_, window| {
            window
                .back()
                .map(|&t| now.duration_since(t) <= self.config.window)
                .unwrap_or(false)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([127, 0, 0, last])
    }

    #[test]
    fn test_limit_enforced_within_window() {
        let limiter = IpRateLimiter::new(RateLimitConfig {
            max_messages: 10,
            window: Duration::from_secs(1),
        });
        for _ in 0..10 {
            assert!(limiter.allow(ip(1)));
        }
        assert!(!limiter.allow(ip(1)));
    }

    #[test]
    fn test_quota_is_per_ip() {
        let limiter = IpRateLimiter::new(RateLimitConfig {
            max_messages: 2,
            window: Duration::from_secs(1),
        });
        assert!(limiter.allow(ip(1)));
        assert!(limiter.allow(ip(1)));
        assert!(!limiter.allow(ip(1)));
        assert!(limiter.allow(ip(2)));
    }

    #[test]
    fn test_window_slides() {
        let limiter = IpRateLimiter::new(RateLimitConfig {
            max_messages: 2,
            window: Duration::from_millis(30),
        });
        assert!(limiter.allow(ip(1)));
        assert!(limiter.allow(ip(1)));
        assert!(!limiter.allow(ip(1)));
        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.allow(ip(1)));
    }

    #[test]
    fn test_rejections_do_not_consume_quota() {
        let limiter = IpRateLimiter::new(RateLimitConfig {
            max_messages: 1,
            window: Duration::from_millis(50),
        });
        assert!(limiter.allow(ip(1)));
        for _ in 0..5 {
            assert!(!limiter.allow(ip(1)));
        }
        std::thread::sleep(Duration::from_millis(60));
        // Had the rejections been recorded, this would still be blocked.
        assert!(limiter.allow(ip(1)));
    }

    #[test]
    fn test_prune_drops_idle_ips() {
        let limiter = IpRateLimiter::new(RateLimitConfig {
            max_messages: 2,
            window: Duration::from_millis(10),
        });
        limiter.allow(ip(1));
        std::thread::sleep(Duration::from_millis(20));
        limiter.prune();
        assert!(limiter.windows.lock().unwrap().is_empty());
    }
}
