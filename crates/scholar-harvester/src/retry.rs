//! Bounded exponential-backoff retry.
//!
//! Every network call the harvester makes on behalf of a single element (a profile
//! page, a publication detail page, a DOI lookup) runs inside [`RetryPolicy::with_retry`].

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Errors the retry policy knows how to classify.
pub trait Retryable: Sized {
    /// Whether another attempt could succeed.
    fn is_retryable(&self) -> bool;

    /// Wrap the final failure once the attempt budget is spent.
    #[must_use]
    fn exhausted(self, attempts: u32) -> Self;
}

/// Retry policy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// Delay before the second attempt; doubled for each one after.
    pub base_delay: Duration,

    /// Add up to 25% random extra delay to each wait.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Create a policy without jitter. `max_attempts` is clamped to at least 1.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), base_delay, jitter: false }
    }

    /// Enable or disable jitter.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Un-jittered wait after the given (1-based) failed attempt: `base * 2^(attempt-1)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    fn wait_for(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let spread = (delay.as_millis() / 4) as u64;
        let extra = rand::thread_rng().gen_range(0..=spread);
        delay.saturating_add(Duration::from_millis(extra))
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent.
    ///
    /// The closure receives the 1-based attempt number. Non-retryable errors are
    /// returned untouched after the first attempt that produced them; exhaustion is
    /// reported through [`Retryable::exhausted`] carrying the attempt count.
    pub async fn with_retry<T, E, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    tracing::debug!(op = label, attempt, outcome = "success", "attempt finished");
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() => {
                    tracing::warn!(
                        op = label,
                        attempt,
                        outcome = "non_retryable",
                        error = %err,
                        "attempt failed, not retrying"
                    );
                    return Err(err);
                }
                Err(err) if attempt >= self.max_attempts => {
                    tracing::error!(
                        op = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        outcome = "exhausted",
                        error = %err,
                        "all attempts failed"
                    );
                    return Err(err.exhausted(attempt));
                }
                Err(err) => {
                    let delay = self.wait_for(attempt);
                    tracing::warn!(
                        op = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        outcome = "retry",
                        error = %err,
                        "attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(5))
    }
}
