//! Step retry policies.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for a failing step body or transport operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first. `1` means no retries.
    pub max_attempts: u32,
    /// Delay strategy between attempts.
    #[serde(default)]
    pub backoff: Backoff,
    /// Let the scheduler add random jitter to each delay.
    #[serde(default)]
    pub jitter: bool,
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
            jitter: false,
        }
    }

    /// Base delay before retry attempt `attempt` (2 = first retry).
    ///
    /// Attempt 1 is the initial try and has no delay.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        match &self.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay } => *delay,
            Backoff::Exponential { initial, factor, max } => {
                let exp = (attempt - 2).min(31);
                let scaled = initial.as_secs_f64() * factor.powi(exp as i32);
                let capped = scaled.min(max.as_secs_f64());
                Duration::from_secs_f64(capped)
            }
        }
    }
}

/// Delay strategy between retry attempts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately.
    #[default]
    None,
    /// Constant delay.
    Fixed {
        /// Delay between attempts.
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
    /// Exponentially growing delay, capped at `max`.
    Exponential {
        /// Delay before the first retry.
        #[serde(with = "humantime_serde")]
        initial: Duration,
        /// Growth factor per retry.
        factor: f64,
        /// Delay ceiling.
        #[serde(with = "humantime_serde")]
        max: Duration,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn first_attempt_has_no_delay() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::Fixed { delay: Duration::from_secs(1) },
            jitter: false,
        };
        assert_eq!(policy.delay_for(1), Duration::ZERO);
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(1));
    }

    #[test]
    fn exponential_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            backoff: Backoff::Exponential {
                initial: Duration::from_millis(100),
                factor: 2.0,
                max: Duration::from_millis(500),
            },
            jitter: false,
        };
        assert_eq!(policy.delay_for(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_millis(500));
        assert_eq!(policy.delay_for(6), Duration::from_millis(500));
    }

    #[test]
    fn backoff_wire_format() {
        let policy: RetryPolicy = serde_json::from_value(serde_json::json!({
            "max_attempts": 3,
            "backoff": {"strategy": "exponential", "initial": "100ms", "factor": 2.0, "max": "5s"},
        }))
        .unwrap();
        assert!(matches!(policy.backoff, Backoff::Exponential { .. }));
    }
}
