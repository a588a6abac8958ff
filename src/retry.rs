//! Retry policy with exponential backoff
//!
//! Shared by the pool (reconnecting broken sessions) and the dispatcher
//! (retrying requests that failed with a retryable error).

use std::time::Duration;

/// Upper bound for a single backoff delay
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Exponential backoff retry policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Cap for any single delay
    pub max_backoff: Duration,
    /// Growth factor per retry
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: MAX_BACKOFF,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Exponential policy doubling from `initial_backoff`
    pub fn exponential(max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            ..Self::default()
        }
    }

    /// Policy that never retries
    pub fn none() -> Self {
        Self::exponential(0, Duration::ZERO)
    }

    /// Total attempts including the first one
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait after failed attempt number `attempt` (0-indexed), or
    /// `None` once the retry budget is spent.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let delay = self.initial_backoff.as_secs_f64() * factor;
        // Negative, NaN and overflowing delays fall back to the cap
        let delay = Duration::try_from_secs_f64(delay).unwrap_or(self.max_backoff);
        Some(delay.min(self.max_backoff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_delays_grow_until_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        };

        assert_eq!(policy.delay_for_attempt(0), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for_attempt(1), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay_for_attempt(3), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_for_attempt(9), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay_for_attempt(10), None);
    }

    #[test]
    fn retry_budget() {
        let policy = RetryPolicy::exponential(2, Duration::from_millis(10));

        assert_eq!(policy.max_attempts(), 3);
        assert!(policy.delay_for_attempt(1).is_some());
        assert_eq!(policy.delay_for_attempt(2), None);
    }

    #[test]
    fn degenerate_multiplier_uses_cap() {
        let negative = RetryPolicy {
            multiplier: -3.0,
            ..RetryPolicy::exponential(5, Duration::from_secs(1))
        };
        assert_eq!(negative.delay_for_attempt(1), Some(MAX_BACKOFF));

        let huge = RetryPolicy {
            multiplier: 1e300,
            ..RetryPolicy::exponential(5, Duration::from_secs(1))
        };
        assert_eq!(huge.delay_for_attempt(2), Some(MAX_BACKOFF));
    }

    #[test]
    fn no_retries() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.delay_for_attempt(0), None);
    }
}
