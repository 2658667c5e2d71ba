use std::time::Duration;

use rand::Rng;

/// Exponential backoff schedule for retrying transient failures.
///
/// The delay before attempt `n` (zero-based) is
/// `min(initial_interval * 2^n, maximum_interval)`, scaled by a random
/// factor in `[0.5, 1.0]` when jitter is enabled so concurrent retries
/// don't land on the dependency at the same instant.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    /// The backoff interval before the first retry.
    pub initial_interval: Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_interval: Duration, maximum_interval: Duration) -> Self {
        Self {
            max_retries,
            initial_interval,
            maximum_interval,
            jitter: true,
        }
    }

    /// Total number of attempts this policy allows, the first one included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Backoff to sleep before retrying after a failure on `attempt`
    /// (zero-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_interval
            .saturating_mul(2u32.saturating_pow(attempt));
        let capped = std::cmp::min(exp, self.maximum_interval);

        if !self.jitter {
            return capped;
        }

        let factor = rand::thread_rng().gen_range(0.5..=1.0);
        capped.mul_f64(factor)
    }

    /// Disable jitter, for deterministic assertions.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_interval: Duration::from_secs(3),
            maximum_interval: Duration::from_secs(30),
            jitter: true,
        }
    }
}
