use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use saga_core::{Payload, Result, RetryPolicy};

use crate::definition::{SagaDefinition, SagaStepDefinition};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

type ContextValidator = Arc<dyn Fn(&Payload) -> Result<()> + Send + Sync>;

/// Marker type for a builder with no steps.
pub struct Empty;

/// Marker type for a builder with at least one step.
pub struct HasSteps;

/// Type-state builder for [`Saga`] definitions.
///
/// `build()` only exists once a first step was added, so an empty saga
/// cannot be constructed:
///
/// ```compile_fail
/// use saga_engine::SagaBuilder;
///
/// let saga = SagaBuilder::new("empty").build();
/// ```
pub struct SagaBuilder<State> {
    saga: Saga,
    _state: PhantomData<State>,
}

impl SagaBuilder<Empty> {
    #[must_use]
    pub fn new(saga_type: impl Into<String>) -> Self {
        Self {
            saga: Saga {
                saga_type: saga_type.into(),
                steps: Vec::new(),
                timeout: DEFAULT_TIMEOUT,
                retry_policy: None,
                validator: None,
            },
            _state: PhantomData,
        }
    }

    #[must_use]
    pub fn first_step(mut self, step: SagaStepDefinition) -> SagaBuilder<HasSteps> {
        self.saga.steps.push(step);
        SagaBuilder {
            saga: self.saga,
            _state: PhantomData,
        }
    }
}

impl<State> SagaBuilder<State> {
    /// Fixed saga-wide deadline. Defaults to thirty minutes.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.saga.timeout = timeout;
        self
    }

    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.saga.retry_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn validate_with<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Payload) -> Result<()> + Send + Sync + 'static,
    {
        self.saga.validator = Some(Arc::new(validator));
        self
    }
}

impl SagaBuilder<HasSteps> {
    #[must_use]
    pub fn then(mut self, step: SagaStepDefinition) -> Self {
        self.saga.steps.push(step);
        self
    }

    #[must_use]
    pub fn build(self) -> Saga {
        self.saga
    }
}

/// A saga definition assembled from closures.
///
/// Covers sagas whose timeout does not depend on the context. Types that
/// need more control implement [`SagaDefinition`] directly.
pub struct Saga {
    saga_type: String,
    steps: Vec<SagaStepDefinition>,
    timeout: Duration,
    retry_policy: Option<RetryPolicy>,
    validator: Option<ContextValidator>,
}

impl std::fmt::Debug for Saga {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Saga")
            .field("saga_type", &self.saga_type)
            .field("steps", &self.steps)
            .field("timeout", &self.timeout)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

impl SagaDefinition for Saga {
    fn saga_type(&self) -> &str {
        &self.saga_type
    }

    fn steps(&self) -> &[SagaStepDefinition] {
        &self.steps
    }

    fn validate_context(&self, context: &Payload) -> Result<()> {
        self.validator
            .as_ref()
            .map_or(Ok(()), |validate| validate(context))
    }

    fn calculate_timeout(&self, _context: &Payload) -> Duration {
        self.timeout
    }

    fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use saga_core::{ErrorCode, SagaError};

    use super::*;

    fn noop(name: &str) -> SagaStepDefinition {
        SagaStepDefinition::new(name, |_| async { Ok(Payload::empty()) })
    }

    #[test]
    fn builder_keeps_step_order() {
        let saga = SagaBuilder::new("order")
            .first_step(noop("a"))
            .then(noop("b"))
            .then(noop("c"))
            .build();

        let names: Vec<_> = saga.steps().iter().map(SagaStepDefinition::name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(saga.saga_type(), "order");
    }

    #[test]
    fn timeout_and_policy_are_recorded() {
        let saga = SagaBuilder::new("order")
            .timeout(Duration::from_secs(5))
            .retry_policy(RetryPolicy::no_retry())
            .first_step(noop("a"))
            .build();

        assert_eq!(saga.calculate_timeout(&Payload::empty()), Duration::from_secs(5));
        assert_eq!(saga.retry_policy().map(|p| p.max_attempts), Some(1));
    }

    #[test]
    fn validator_is_applied() {
        let saga = SagaBuilder::new("order")
            .first_step(noop("a"))
            .validate_with(|ctx| {
                if ctx.as_str().contains("user_id") {
                    Ok(())
                } else {
                    Err(SagaError::new(ErrorCode::InvalidContext, "user_id is required"))
                }
            })
            .build();

        assert!(saga.validate_context(&Payload::from_raw(r#"{"user_id":1}"#)).is_ok());
        let err = saga
            .validate_context(&Payload::empty())
            .expect_err("missing user id");
        assert_eq!(err.code(), ErrorCode::InvalidContext);
    }
}
