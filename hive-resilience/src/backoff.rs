//! Exponential backoff for reconnection loops

use rand::Rng;
use std::time::Duration;

/// Delay ceiling applied when no explicit maximum is configured
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);

/// Backoff delay calculator: `min(initial_delay * 2^attempt, max_delay)`
///
/// Attempts are zero-indexed: attempt `0` is the first retry after a failure,
/// so the calculator yields `initial_delay` for it.
#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    initial_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl BackoffCalculator {
    /// Doubling backoff capped at `max_delay`, without jitter
    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            jitter: false,
        }
    }

    /// Spread each delay by ±20% so peers that lost the same server do not retry in lockstep
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Upper bound for every computed delay
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Calculate delay for a specific attempt (0-indexed)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let capped_delay = self.capped_base_delay(attempt);

        if self.jitter {
            self.add_jitter(capped_delay)
        } else {
            capped_delay
        }
    }

    fn capped_base_delay(&self, attempt: u32) -> Duration {
        let initial_nanos = self.initial_delay.as_nanos() as f64;
        let max_nanos = self.max_delay.as_nanos() as f64;

        // powi saturates to infinity for large attempts
        let delay_nanos = initial_nanos * 2f64.powi(attempt.min(i32::MAX as u32) as i32);

        if !delay_nanos.is_finite() || delay_nanos >= max_nanos {
            self.max_delay
        } else {
            Duration::from_nanos(delay_nanos.max(0.0) as u64)
        }
    }

    fn add_jitter(&self, delay: Duration) -> Duration {
        let mut rng = rand::thread_rng();

        // ±20%, never beyond the ceiling
        let jitter_factor = rng.gen_range(0.8..1.2);
        Duration::from_nanos((delay.as_nanos() as f64 * jitter_factor) as u64).min(self.max_delay)
    }
}

impl Default for BackoffCalculator {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(1_000), DEFAULT_MAX_DELAY)
    }
}
