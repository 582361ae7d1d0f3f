//! Reconnect backoff policy
//!
//! Before the first successful connection the manager retries a bounded
//! number of times and then gives up; after first success reconnect attempts
//! are unbounded. Both phases space attempts with the same capped linear
//! backoff.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Capped linear backoff: `delay(attempt) = min(base + attempt * step, max)`.
///
/// Delays never decrease within a backoff sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,

    /// Added per attempt, in milliseconds
    pub step_ms: u64,

    /// Upper bound on any single delay, in milliseconds
    pub max_delay_ms: u64,

    /// Attempts allowed before the first successful connection
    pub pre_connect_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 200,
            step_ms: 400,
            max_delay_ms: 5_000,
            pre_connect_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given zero-based failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let millis = self
            .base_delay_ms
            .saturating_add(self.step_ms.saturating_mul(u64::from(attempt)))
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// Whether another pre-connect attempt is allowed after `failed` failures.
    pub fn allows_pre_connect_attempt(&self, failed: u32) -> bool {
        failed < self.pre_connect_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_is_monotonic_and_capped() {
        let policy = RetryPolicy::default();
        let mut previous = Duration::ZERO;
        for attempt in 0..50 {
            let delay = policy.delay(attempt);
            assert!(delay >= previous, "delay must never decrease");
            assert!(delay <= Duration::from_millis(policy.max_delay_ms));
            previous = delay;
        }
    }

    #[test]
    fn test_first_delay_is_base() {
        let policy = RetryPolicy {
            base_delay_ms: 100,
            step_ms: 50,
            max_delay_ms: 1_000,
            pre_connect_attempts: 5,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(150));
    }

    #[test]
    fn test_delay_saturates_at_max() {
        let policy = RetryPolicy {
            base_delay_ms: 100,
            step_ms: 500,
            max_delay_ms: 800,
            pre_connect_attempts: 5,
        };
        assert_eq!(policy.delay(10), Duration::from_millis(800));
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(800));
    }

    #[test]
    fn test_pre_connect_budget() {
        let policy = RetryPolicy {
            pre_connect_attempts: 3,
            ..RetryPolicy::default()
        };
        assert!(policy.allows_pre_connect_attempt(0));
        assert!(policy.allows_pre_connect_attempt(2));
        assert!(!policy.allows_pre_connect_attempt(3));
    }
}
