use std::error::Error as StdError;
use std::time::Duration;

use saga_core::{RetryPolicy, SagaError};

/// Stateless retry decisions: whether to try again and how long to wait.
#[derive(Debug, Clone, Default)]
pub struct RetryManager {
    default_policy: RetryPolicy,
}

impl RetryManager {
    #[must_use]
    pub fn new(default_policy: RetryPolicy) -> Self {
        Self { default_policy }
    }

    #[must_use]
    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default_policy
    }

    /// Picks the step override when present, the default otherwise.
    #[must_use]
    pub fn effective_policy<'a>(&'a self, step_policy: Option<&'a RetryPolicy>) -> &'a RetryPolicy {
        step_policy.unwrap_or(&self.default_policy)
    }

    /// `attempt_count` is the number of attempts already made.
    #[must_use]
    pub fn should_retry(
        &self,
        err: &(dyn StdError + 'static),
        attempt_count: u32,
        policy: &RetryPolicy,
    ) -> bool {
        attempt_count < policy.max_attempts && self.is_retryable_error(err, policy)
    }

    /// Exponential backoff `initial * factor^attempt`, clamped to `max_delay`.
    ///
    /// `attempt` is zero-based: the wait before the first retry uses `0`.
    #[must_use]
    pub fn calculate_delay(&self, attempt: u32, policy: &RetryPolicy) -> Duration {
        let factor = policy.backoff_factor.max(1.0);
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let seconds = policy.initial_delay.as_secs_f64() * factor.powi(exponent);

        if !seconds.is_finite() || seconds >= policy.max_delay.as_secs_f64() {
            return policy.max_delay;
        }
        Duration::from_secs_f64(seconds).min(policy.max_delay)
    }

    /// Classifies by error code first, then by the policy's substring list.
    ///
    /// The whole source chain is inspected; the first [`SagaError`] with a
    /// transient or permanent code decides.
    #[must_use]
    pub fn is_retryable_error(&self, err: &(dyn StdError + 'static), policy: &RetryPolicy) -> bool {
        let mut current = Some(err);
        while let Some(e) = current {
            if let Some(saga_err) = e.downcast_ref::<SagaError>() {
                let code = saga_err.code();
                if code.is_retryable() {
                    return true;
                }
                if code.is_permanent() {
                    return false;
                }
            } else if e.is::<tokio::time::error::Elapsed>() || matches_vocabulary(e, policy) {
                return true;
            }
            current = e.source();
        }
        false
    }
}

fn matches_vocabulary(err: &(dyn StdError + 'static), policy: &RetryPolicy) -> bool {
    let text = err.to_string().to_lowercase();
    policy
        .retryable_errors
        .iter()
        .any(|pattern| text.contains(&pattern.to_lowercase()))
}
