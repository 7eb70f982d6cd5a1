//! Retry policy implementation

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Configuration for activity and workflow retries
///
/// The delay before retry `n` (after failed attempt `n`) is
/// `min(initial_interval * backoff_coefficient^(n-1), maximum_interval)`,
/// optionally spread by `jitter`.
///
/// # Example
///
/// ```
/// use waypoint_durable::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_maximum_attempts(5)
///     .with_initial_interval(Duration::from_secs(1))
///     .with_maximum_interval(Duration::from_secs(60));
///
/// assert_eq!(policy.backoff_for(1), Duration::from_secs(1));
/// assert_eq!(policy.backoff_for(3), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    #[serde(with = "crate::duration::millis")]
    pub initial_interval: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Upper bound on the delay between attempts
    #[serde(with = "crate::duration::millis")]
    pub maximum_interval: Duration,

    /// Maximum number of attempts including the first; 0 means unlimited
    pub maximum_attempts: u32,

    /// Error codes that are never retried
    #[serde(default)]
    pub non_retryable_error_codes: Vec<String>,

    /// Jitter factor (0.0-1.0); 0.1 means +/-10% randomness
    #[serde(default)]
    pub jitter: f64,
}

/// What to do after an attempt failed
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Schedule another attempt after `delay`
    Retry { delay: Duration },

    /// The failure is terminal
    GiveUp {
        /// True when the policy ran out of attempts, false for non-retryable errors
        attempts_exhausted: bool,
    },
}

impl RetryDecision {
    pub fn will_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry { .. })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Create an exponential backoff retry policy with sensible defaults
    ///
    /// - 1 second initial interval
    /// - 2x backoff coefficient
    /// - 100 second max interval
    /// - 5 max attempts
    pub fn exponential() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(100),
            maximum_attempts: 5,
            non_retryable_error_codes: vec![],
            jitter: 0.0,
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            initial_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            maximum_interval: Duration::ZERO,
            maximum_attempts: 1,
            non_retryable_error_codes: vec![],
            jitter: 0.0,
        }
    }

    /// Create a policy with fixed intervals (no backoff)
    pub fn fixed(interval: Duration, maximum_attempts: u32) -> Self {
        Self {
            initial_interval: interval,
            backoff_coefficient: 1.0,
            maximum_interval: interval,
            maximum_attempts,
            non_retryable_error_codes: vec![],
            jitter: 0.0,
        }
    }

    /// Set the maximum number of attempts (0 = unlimited)
    pub fn with_maximum_attempts(mut self, maximum_attempts: u32) -> Self {
        self.maximum_attempts = maximum_attempts;
        self
    }

    /// Set the initial retry interval
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the maximum retry interval
    pub fn with_maximum_interval(mut self, interval: Duration) -> Self {
        self.maximum_interval = interval;
        self
    }

    /// Set the backoff coefficient
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Add a non-retryable error code
    pub fn with_non_retryable_error(mut self, code: impl Into<String>) -> Self {
        self.non_retryable_error_codes.push(code.into());
        self
    }

    /// Delay to wait after failed attempt `failed_attempt` (1-based)
    pub fn backoff_for(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.maximum_interval.as_secs_f64());

        let jitter = if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let jitter_range = capped * jitter;
        let jittered = if jitter_range > 0.0 {
            let mut rng = rand::thread_rng();
            capped + rng.gen_range(-jitter_range..jitter_range)
        } else {
            capped
        };

        // Deserialized policies may carry negative or non-finite parameters
        if jittered.is_nan() {
            return self.maximum_interval;
        }
        Duration::try_from_secs_f64(jittered.max(0.0)).unwrap_or(self.maximum_interval)
    }

    /// Check if an error code may be retried under this policy
    pub fn should_retry(&self, code: Option<&str>) -> bool {
        match code {
            Some(code) => !self.non_retryable_error_codes.iter().any(|c| c == code),
            None => true,
        }
    }

    /// Check if another attempt is allowed after `current_attempt`
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        self.maximum_attempts == 0 || current_attempt < self.maximum_attempts
    }

    /// Decide the fate of failed attempt `attempt` (1-based)
    pub fn decide(&self, attempt: u32, retryable: bool, code: Option<&str>) -> RetryDecision {
        if !retryable || !self.should_retry(code) {
            return RetryDecision::GiveUp {
                attempts_exhausted: false,
            };
        }
        if !self.has_attempts_remaining(attempt) {
            return RetryDecision::GiveUp {
                attempts_exhausted: true,
            };
        }
        RetryDecision::Retry {
            delay: self.backoff_for(attempt),
        }
    }
}
