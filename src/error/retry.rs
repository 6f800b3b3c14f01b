/// Retry strategies for recoverable pipeline steps
///
/// Only pre-checks are retried. Method invocation is destructive and is
/// never routed through a strategy: a failed invocation is surfaced as is.
use super::{WipeError, WipeResult};
use std::thread;
use std::time::Duration;

/// Retry strategy trait
pub trait RetryStrategy: Send + Sync {
    /// Determine if another attempt should follow the failed `attempt` (0-based)
    fn should_retry(&self, attempt: u32, error: &WipeError) -> bool;

    /// Calculate delay before the attempt following `attempt`
    fn next_delay(&self, attempt: u32) -> Duration;

    /// Total number of attempts, the first one included
    fn max_attempts(&self) -> u32;
}

/// Exponential backoff retry strategy with jitter
///
/// Implements exponential backoff: delay = base * 2^attempt
/// Adds random jitter to spread out retries against the same controller
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Base delay for first retry
    base_delay: Duration,

    /// Maximum delay cap
    max_delay: Duration,

    /// Total attempts allowed
    max_attempts: u32,

    /// Jitter factor (0.0 - 1.0) - adds randomness to delay
    jitter_factor: f64,
}

impl ExponentialBackoff {
    /// Create new exponential backoff strategy
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
            jitter_factor: 0.3, // 30% jitter by default
        }
    }

    /// Create with custom jitter factor
    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// Calculate exponential delay with jitter
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponential_ms = self
            .base_delay
            .as_millis()
            .saturating_mul(2_u128.saturating_pow(attempt));
        let capped_ms = exponential_ms.min(self.max_delay.as_millis());

        // Add jitter: delay ± (delay * jitter_factor)
        let jitter_range = capped_ms as f64 * self.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * 2.0 * jitter_range;
        let final_ms = (capped_ms as f64 + jitter).max(0.0);

        Duration::from_millis(final_ms as u64)
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn should_retry(&self, attempt: u32, error: &WipeError) -> bool {
        attempt + 1 < self.max_attempts && error.allows_retry()
    }

    fn next_delay(&self, attempt: u32) -> Duration {
        self.calculate_delay(attempt)
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Run `operation` until it succeeds or the strategy gives up.
///
/// `on_retry` is told about every failure that will be retried, before the
/// backoff sleep. On final failure the number of attempts made is returned
/// with the last error.
pub fn retry_blocking<T, R, F>(
    strategy: &dyn RetryStrategy,
    mut on_retry: R,
    mut operation: F,
) -> Result<T, (u32, WipeError)>
where
    R: FnMut(u32, Duration, &WipeError),
    F: FnMut(u32) -> WipeResult<T>,
{
    let mut attempt = 0;
    loop {
        match operation(attempt) {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(attempt = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                if !strategy.should_retry(attempt, &error) {
                    tracing::error!(
                        attempt = attempt + 1,
                        max_attempts = strategy.max_attempts(),
                        error = %error,
                        "Giving up after final attempt"
                    );
                    return Err((attempt + 1, error));
                }

                let delay = strategy.next_delay(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying after delay"
                );
                on_retry(attempt + 1, delay, &error);
                thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}
