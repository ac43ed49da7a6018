//! Bounded retry with exponential backoff.
//!
//! Cleanup calls against the container runtime and the cluster scheduler can
//! fail transiently (only one prune may run host-wide at a time). Those call
//! sites consult an explicit [`RetryPolicy`] rather than a task decoration:
//! retry only the error kinds the caller marks retryable, a bounded number
//! of times, then propagate.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Default initial backoff delay.
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 100;

/// Default backoff multiplier between attempts.
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default cap on any single backoff delay.
pub const DEFAULT_MAX_DELAY_MS: u64 = 5_000;

/// Default attempt bound, including the first attempt.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// An explicit retry policy: bounded attempts, exponential delay, full
/// jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Never zero.
    pub max_attempts: u32,

    /// Delay before the second attempt.
    pub initial_delay: Duration,

    /// Multiplier applied to the delay after each failed attempt.
    pub multiplier: f64,

    /// Cap on any single delay.
    pub max_delay: Duration,

    /// Whether to draw each delay uniformly from `[0, computed_delay]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MS),
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// The delay to sleep after the given zero-based failed attempt.
    fn delay_after(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64) as u64;
        let millis = if self.jitter && capped > 0 {
            rand::rng().random_range(0..=capped)
        } else {
            capped
        };
        Duration::from_millis(millis)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt bound is reached. The final error is propagated unchanged.
    pub async fn run<T, E, F, Fut, R>(&self, mut op: F, retry_on: R) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts.max(1);
        for attempt in 0..attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 < attempts && retry_on(&err) => {
                    let delay = self.delay_after(attempt);
                    debug!(
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retryable failure, backing off"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }
        // The loop always returns on its final attempt.
        unreachable!("retry loop exited without returning")
    }
}
