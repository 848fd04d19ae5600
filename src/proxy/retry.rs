//! Bounded retry with exponential backoff, jitter and per-attempt timeouts
//!
//! One executor is shared by every outbound call site (source fetches and relay validation).
//! Each attempt is admitted by the shared [`RateLimiter`] and bounded by
//! [`TimeoutPolicy::total`]; a timeout is treated like any other failed attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::{PoolError, Result};
use crate::proxy::rate_limit::RateLimiter;

/// Retry configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay (before jitter)
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub exponential_base: f64,
    /// Symmetric jitter as a fraction of the delay
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            exponential_base: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the retry that follows failed attempt `attempt` (0-based), without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.exponential_base.powi(attempt.min(i32::MAX as u32) as i32);
        let secs = self.base_delay.as_secs_f64() * exp;
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    /// Apply `±jitter * delay` for a random factor in `[-1, 1]`, clamped at zero
    pub fn apply_jitter(&self, delay: Duration, factor: f64) -> Duration {
        let secs = delay.as_secs_f64();
        let jittered = secs + self.jitter * secs * factor.clamp(-1.0, 1.0);
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Jittered backoff for failed attempt `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = rand::thread_rng().gen_range(-1.0..=1.0);
        self.apply_jitter(self.backoff(attempt), factor)
    }
}

/// Timeout configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    /// Establishing a connection to a relay or source
    pub connect: Duration,
    /// Waiting for a response once connected
    pub read: Duration,
    /// Whole attempt, enforced by the executor
    pub total: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            read: Duration::from_secs(30),
            total: Duration::from_secs(60),
        }
    }
}

/// Per-key counters, kept only for correlation in logs and metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    pub attempts: u64,
    pub failures: u64,
    pub exhausted: u64,
}

/// Wraps fallible async operations with retries, backoff, rate limiting and timeouts
pub struct RetryExecutor {
    retry: RetryPolicy,
    timeout: TimeoutPolicy,
    limiter: Arc<RateLimiter>,
    stats: DashMap<String, RetryStats>,
}

impl RetryExecutor {
    pub fn new(retry: RetryPolicy, timeout: TimeoutPolicy, limiter: Arc<RateLimiter>) -> Self {
        Self {
            retry: RetryPolicy {
                max_attempts: retry.max_attempts.max(1),
                ..retry
            },
            timeout,
            limiter,
            stats: DashMap::new(),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn timeout_policy(&self) -> &TimeoutPolicy {
        &self.timeout
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Counters recorded for `retry_key`
    pub fn stats(&self, retry_key: &str) -> RetryStats {
        self.stats.get(retry_key).map(|s| *s).unwrap_or_default()
    }

    /// Run `operation` until it succeeds or `max_attempts` attempts have failed.
    ///
    /// `retry_key` only labels logs and counters; it never changes behaviour.
    pub async fn execute<T, F, Fut>(&self, retry_key: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.retry.max_attempts;
        let mut attempt: u32 = 0;

        self.limiter.admit().await;

        loop {
            self.bump(retry_key, |s| s.attempts += 1);

            let error = match tokio::time::timeout(self.timeout.total, operation()).await {
                Ok(Ok(value)) => {
                    if attempt > 0 {
                        debug!(retry_key, attempts = attempt + 1, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Ok(Err(e)) => {
                    warn!(retry_key, attempt = attempt + 1, error = %e, "Attempt failed");
                    e
                }
                Err(_) => {
                    warn!(
                        retry_key,
                        attempt = attempt + 1,
                        "Attempt timed out after {:?}",
                        self.timeout.total
                    );
                    PoolError::Timeout(self.timeout.total)
                }
            };

            self.bump(retry_key, |s| s.failures += 1);

            if attempt + 1 >= max_attempts {
                self.bump(retry_key, |s| s.exhausted += 1);
                return Err(PoolError::ExhaustedRetries {
                    key: retry_key.to_string(),
                    attempts: attempt + 1,
                    source: Box::new(error),
                });
            }

            let delay = self.retry.delay_for(attempt);
            attempt += 1;

            self.limiter.admit().await;
            info!(
                retry_key,
                "Retrying in {:.2}s (attempt {}/{})",
                delay.as_secs_f64(),
                attempt + 1,
                max_attempts
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn bump(&self, retry_key: &str, update: impl FnOnce(&mut RetryStats)) {
        let mut entry = self.stats.entry(retry_key.to_string()).or_default();
        update(&mut entry);
    }
}
