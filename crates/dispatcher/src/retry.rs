//! Backoff policy for messages whose publish failed.

use std::time::Duration;

/// Exponential backoff with an alert threshold.
///
/// Messages are never discarded. Once a message has failed
/// `max_attempts_before_alert` times it is reported as poison on every
/// further failure and keeps being retried at `max_delay`.
///
/// # Default Values
///
/// - `initial_delay`: 1 second
/// - `max_delay`: 5 minutes
/// - `multiplier`: 2.0
/// - `max_attempts_before_alert`: 10
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Cap for the exponential backoff.
    pub max_delay: Duration,
    /// Growth factor per failed attempt.
    pub multiplier: f64,
    /// Failures after which a message counts as poison.
    pub max_attempts_before_alert: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            max_attempts_before_alert: 10,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next claim of a message that has failed `attempts`
    /// times before this failure.
    ///
    /// `initial_delay * multiplier ^ attempts`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);

        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(delay_ms as u64)
    }

    /// Returns true once a message with `attempts` failures should be
    /// surfaced to operators.
    pub fn is_poison(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts_before_alert
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts_before_alert: 3,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(20), policy.max_delay);
        assert_eq!(policy.delay_for_attempt(u32::MAX), policy.max_delay);
    }

    #[test]
    fn poison_threshold() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_poison(9));
        assert!(policy.is_poison(10));
        assert!(policy.is_poison(11));
    }
}
