//! # Retry
//!
//! Module providing a `RetryPolicy` struct to configure retrying counter increments.
use std::num::NonZeroU32;
use std::time;

#[derive(Clone, Debug, PartialEq, Eq)]
/// A linear retry policy: the wait after failed attempt `n` is `n * base_delay`.
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: NonZeroU32,
    /// The backoff interval after the first failed attempt.
    pub base_delay: time::Duration,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(max_attempts: NonZeroU32) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(max_attempts)
    }

    /// Determine how long to wait after the given (1-based) attempt has failed.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Whether another attempt is allowed after the given (1-based) attempt has failed.
    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.get()
    }

    /// The sum of every wait a caller sleeps through when all attempts fail.
    pub fn total_backoff(&self) -> time::Duration {
        (1..self.max_attempts.get())
            .map(|attempt| self.retry_interval(attempt))
            .sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub max_attempts: NonZeroU32,
    pub base_delay: time::Duration,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            max_attempts: NonZeroU32::MIN.saturating_add(2),
            base_delay: time::Duration::from_millis(500),
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(max_attempts: NonZeroU32) -> Self {
        Self {
            max_attempts,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn base_delay(mut self, delay: time::Duration) -> RetryPolicyBuilder {
        self.base_delay = delay;
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempts(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    #[test]
    fn test_linear_intervals() {
        let policy = RetryPolicy::build(attempts(5))
            .base_delay(time::Duration::from_millis(100))
            .provide();

        let intervals: Vec<_> = (1..5).map(|a| policy.retry_interval(a)).collect();
        assert_eq!(
            intervals,
            vec![
                time::Duration::from_millis(100),
                time::Duration::from_millis(200),
                time::Duration::from_millis(300),
                time::Duration::from_millis(400),
            ]
        );
        assert!(intervals.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_attempts_left() {
        let policy = RetryPolicy::build(attempts(3)).provide();

        assert!(policy.has_attempts_left(1));
        assert!(policy.has_attempts_left(2));
        assert!(!policy.has_attempts_left(3));

        let single = RetryPolicy::build(attempts(1)).provide();
        assert!(!single.has_attempts_left(1));
    }

    #[test]
    fn test_total_backoff() {
        let policy = RetryPolicy::build(attempts(3))
            .base_delay(time::Duration::from_millis(10))
            .provide();
        // 1 * 10ms + 2 * 10ms
        assert_eq!(policy.total_backoff(), time::Duration::from_millis(30));

        let single = RetryPolicy::build(attempts(1)).provide();
        assert_eq!(single.total_backoff(), time::Duration::ZERO);
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts.get(), 3);
        assert_eq!(policy.base_delay, time::Duration::from_millis(500));
    }
}
