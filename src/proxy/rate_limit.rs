//! Sliding-window admission control
//!
//! Every outbound operation (source fetches and validation attempts) passes through one shared
//! limiter, so no more than `requests_per_window` operations start in any trailing window.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Default number of admissions per window
const DEFAULT_REQUESTS_PER_WINDOW: usize = 60;

/// Default window length in seconds
const DEFAULT_WINDOW_SECS: u64 = 60;

/// Rate limit configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Maximum admissions in any trailing window
    pub requests_per_window: usize,
    /// Window length
    pub window_size: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            requests_per_window: DEFAULT_REQUESTS_PER_WINDOW,
            window_size: Duration::from_secs(DEFAULT_WINDOW_SECS),
        }
    }
}

impl RateLimitPolicy {
    pub fn new(requests_per_window: usize, window_size: Duration) -> Self {
        Self {
            requests_per_window: requests_per_window.max(1),
            window_size,
        }
    }
}

/// Rate limiter shared by all outbound operations
#[derive(Debug)]
pub struct RateLimiter {
    policy: RateLimitPolicy,
    /// Admission timestamps, oldest first
    admitted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a new rate limiter
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy: RateLimitPolicy::new(policy.requests_per_window, policy.window_size),
            admitted: Mutex::new(VecDeque::new()),
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Wait until an operation may start, then record it.
    ///
    /// Callers are never rejected: a full window only delays them until the oldest admission
    /// leaves the window.
    pub async fn admit(&self) {
        loop {
            let wait = match self.try_admit_at(Instant::now()) {
                None => return,
                Some(wait) => wait,
            };

            debug!("Rate limit reached, waiting {:.2}s", wait.as_secs_f64());
            tokio::time::sleep(wait).await;
        }
    }

    /// Admit at `now` if there is room, otherwise return how long to wait.
    ///
    /// The wait is re-checked after sleeping because concurrent callers may have taken the
    /// slot that just opened.
    fn try_admit_at(&self, now: Instant) -> Option<Duration> {
        let mut admitted = self.admitted.lock();

        while let Some(&oldest) = admitted.front() {
            if now.duration_since(oldest) >= self.policy.window_size {
                admitted.pop_front();
            } else {
                break;
            }
        }

        if admitted.len() >= self.policy.requests_per_window {
            let oldest = *admitted.front()?;
            let wait = self
                .policy
                .window_size
                .saturating_sub(now.duration_since(oldest));
            return Some(wait.max(Duration::from_millis(1)));
        }

        admitted.push_back(now);
        None
    }

    /// Number of admissions still inside the window
    pub fn in_window(&self) -> usize {
        let now = Instant::now();
        self.admitted
            .lock()
            .iter()
            .filter(|&&ts| now.duration_since(ts) < self.policy.window_size)
            .count()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_limit_without_waiting() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(3, Duration::from_secs(60)));
        let start = Instant::now();

        for _ in 0..3 {
            limiter.admit().await;
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.in_window(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fourth_admission_waits_for_window() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(3, Duration::from_secs(60)));
        let start = Instant::now();

        limiter.admit().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        limiter.admit().await;
        limiter.admit().await;

        limiter.admit().await;

        // The first admission leaves the window 60s after it was made.
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert!(start.elapsed() < Duration::from_secs(61));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_admission_is_pending_until_slot_opens() {
        let limiter = Arc::new(RateLimiter::new(RateLimitPolicy::new(
            2,
            Duration::from_secs(10),
        )));
        limiter.admit().await;
        limiter.admit().await;

        let mut blocked = task::spawn({
            let limiter = limiter.clone();
            async move { limiter.admit().await }
        });
        assert_pending!(blocked.poll());

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_pending!(blocked.poll());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_ready!(blocked.poll());
        assert_eq!(limiter.in_window(), 1);
    }

    #[test]
    fn test_policy_never_allows_zero_requests() {
        let policy = RateLimitPolicy::new(0, Duration::from_secs(1));
        assert_eq!(policy.requests_per_window, 1);

        let default = RateLimitPolicy::default();
        assert_eq!(default.requests_per_window, DEFAULT_REQUESTS_PER_WINDOW);
        assert_eq!(default.window_size, Duration::from_secs(DEFAULT_WINDOW_SECS));
    }
}
