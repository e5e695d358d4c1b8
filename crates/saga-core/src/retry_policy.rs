use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, Result, SagaError};

/// Transient-failure vocabulary matched against errors that carry no code.
pub const DEFAULT_RETRYABLE_ERRORS: &[&str] = &[
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
    "temporarily unavailable",
    "service unavailable",
    "rate limit",
    "too many requests",
    "deadlock",
    "try again",
];

/// Backoff settings for a step, or the saga-wide default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Lower-case substrings marking an untyped error as transient.
    pub retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            retryable_errors: DEFAULT_RETRYABLE_ERRORS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
        }
    }
}

impl RetryPolicy {
    /// A policy that runs the step exactly once.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_delays(mut self, initial_delay: Duration, max_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.max_delay = max_delay;
        self
    }

    #[must_use]
    pub fn with_backoff_factor(mut self, backoff_factor: f64) -> Self {
        self.backoff_factor = backoff_factor;
        self
    }

    #[must_use]
    pub fn with_retryable_errors<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_errors = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// # Errors
    ///
    /// Returns `InvalidInput` when the policy could not produce a sane backoff.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(SagaError::new(
                ErrorCode::InvalidInput,
                "retry policy needs at least one attempt",
            ));
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(SagaError::new(
                ErrorCode::InvalidInput,
                format!(
                    "backoff factor must be a finite number >= 1.0, got {}",
                    self.backoff_factor
                ),
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(SagaError::new(
                ErrorCode::InvalidInput,
                "max delay must not be shorter than the initial delay",
            ));
        }
        Ok(())
    }
}

/// Serializes a [`Duration`] as whole milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// # Errors
    ///
    /// Propagates serializer failures.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    /// # Errors
    ///
    /// Fails when the input is not an unsigned integer.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_valid() {
        assert!(RetryPolicy::default().validate().is_ok());
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let err = RetryPolicy::default()
            .with_max_attempts(0)
            .validate()
            .expect_err("zero attempts");
        assert_eq!(err.code(), ErrorCode::InvalidInput);
    }

    #[test]
    fn shrinking_backoff_is_rejected() {
        let err = RetryPolicy::default()
            .with_backoff_factor(0.5)
            .validate()
            .expect_err("factor below one");
        assert_eq!(err.code(), ErrorCode::InvalidInput);
    }

    #[test]
    fn inverted_delays_are_rejected() {
        let policy = RetryPolicy::default()
            .with_delays(Duration::from_secs(10), Duration::from_secs(1));
        assert!(policy.validate().is_err());
    }

    #[test]
    fn delays_serialize_as_milliseconds() -> anyhow::Result<()> {
        let policy = RetryPolicy::default()
            .with_delays(Duration::from_millis(250), Duration::from_secs(2));
        let json = serde_json::to_value(&policy)?;

        assert_eq!(json["initial_delay_ms"], 250);
        assert_eq!(json["max_delay_ms"], 2000);

        let parsed: RetryPolicy = serde_json::from_value(json)?;
        assert_eq!(parsed, policy);
        Ok(())
    }
}
