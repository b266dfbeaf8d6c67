//! Retry policy for saga steps.
//!
//! A [`RetryPolicy`] decides whether a failed step attempt is retried and how
//! long to wait before the next attempt. The delay grows linearly with the
//! attempt index and is scaled by the backoff multiplier:
//!
//! ```text
//! delay(attempt) = initial_delay * (attempt + 1) * backoff_multiplier
//! ```

use crate::error::{Error, ErrorKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy configuration for saga steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Base delay between attempts.
    pub initial_delay: Duration,
    /// Scale factor applied to the weighted delay.
    pub backoff_multiplier: f64,
    /// Error message fragments that are worth retrying. `None` retries everything.
    #[serde(default)]
    pub retryable_errors: Option<Vec<String>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            retryable_errors: None,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy retrying every error.
    pub fn new(max_attempts: u32, initial_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts,
            initial_delay,
            backoff_multiplier,
            retryable_errors: None,
        }
    }

    /// Single attempt, never retried. Used when no policy is configured.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            retryable_errors: None,
        }
    }

    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }

    /// Returns true if the failed attempt `attempt` (0-indexed) should be retried.
    ///
    /// Cancellation, guard rejections and failed rollbacks are never retried.
    pub fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        if attempt.saturating_add(1) >= self.max_attempts {
            return false;
        }
        if matches!(
            error.kind(),
            ErrorKind::Cancelled | ErrorKind::GuardRejected | ErrorKind::Compensation
        ) {
            return false;
        }
        self.is_retryable(error)
    }

    /// Checks the error against the allow-list.
    pub fn is_retryable(&self, error: &Error) -> bool {
        match &self.retryable_errors {
            None => true,
            Some(allowed) => {
                let message = error.to_string();
                let kind = error.kind();
                allowed
                    .iter()
                    .any(|fragment| message.contains(fragment.as_str()) || kind.as_str() == fragment)
            }
        }
    }

    /// Delay before the attempt following `attempt` (0-indexed).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let nanos =
            self.initial_delay.as_nanos() as f64 * (attempt as f64 + 1.0) * self.backoff_multiplier;
        if nanos.is_nan() || nanos <= 0.0 {
            return Duration::ZERO;
        }
        if nanos >= u64::MAX as f64 {
            return Duration::MAX;
        }
        Duration::from_nanos(nanos.round() as u64)
    }

    /// Sum of all delays the policy can produce.
    pub fn max_total_delay(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|attempt| self.calculate_delay(attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.policy.backoff_multiplier = multiplier;
        self
    }

    /// Adds a message fragment to the allow-list.
    pub fn retry_on(mut self, fragment: impl Into<String>) -> Self {
        self.policy
            .retryable_errors
            .get_or_insert_with(Vec::new)
            .push(fragment.into());
        self
    }

    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(100));
        assert_eq!(policy.backoff_multiplier, 2.0);
        assert!(policy.retryable_errors.is_none());
    }

    #[test]
    fn test_delay_is_linear_weighted() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), 2.0);

        assert_eq!(policy.calculate_delay(0), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(400));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(600));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_with_unit_multiplier() {
        let policy = RetryPolicy::new(3, Duration::from_millis(50), 1.0);
        assert_eq!(policy.calculate_delay(0), Duration::from_millis(50));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(150));
    }

    #[test]
    fn test_delay_never_panics_on_bad_multiplier() {
        let negative = RetryPolicy::new(3, Duration::from_millis(50), -1.0);
        assert_eq!(negative.calculate_delay(1), Duration::ZERO);

        let nan = RetryPolicy::new(3, Duration::from_millis(50), f64::NAN);
        assert_eq!(nan.calculate_delay(1), Duration::ZERO);

        let huge = RetryPolicy::new(3, Duration::from_secs(1_000_000), 1e20);
        assert_eq!(huge.calculate_delay(1), Duration::MAX);
    }

    #[test]
    fn test_should_retry_respects_max_attempts() {
        let policy = RetryPolicy::new(3, Duration::ZERO, 1.0);
        let error = Error::step_execution("boom");

        assert!(policy.should_retry(&error, 0));
        assert!(policy.should_retry(&error, 1));
        assert!(!policy.should_retry(&error, 2));
    }

    #[test]
    fn test_no_retry_policy() {
        let policy = RetryPolicy::no_retry();
        assert!(!policy.should_retry(&Error::step_execution("boom"), 0));
        assert_eq!(policy.max_total_delay(), Duration::ZERO);
    }

    #[test]
    fn test_allow_list_filters_errors() {
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .retry_on("connection reset")
            .retry_on("timeout")
            .build();

        assert!(policy.should_retry(&Error::step_execution("upstream connection reset"), 0));
        assert!(policy.should_retry(&Error::timeout("step exceeded 5s"), 0));
        assert!(!policy.should_retry(&Error::step_execution("card declined"), 0));
    }

    #[test]
    fn test_cancellation_is_never_retried() {
        let policy = RetryPolicy::new(10, Duration::ZERO, 1.0);
        assert!(!policy.should_retry(&Error::cancelled("saga cancelled"), 0));
        assert!(!policy.should_retry(&Error::guard_rejected("charge"), 0));
        let rollback = Error::new("rollback failed", ErrorKind::Compensation);
        assert!(!policy.should_retry(&rollback, 0));
    }

    #[test]
    fn test_max_total_delay() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100), 1.0);
        // 100ms + 200ms
        assert_eq!(policy.max_total_delay(), Duration::from_millis(300));
    }

    #[test]
    fn test_policy_serde_roundtrip() {
        let policy = RetryPolicy::builder().max_attempts(4).retry_on("busy").build();
        let json = serde_json::to_value(&policy).unwrap();
        let back: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(policy, back);
    }
}
