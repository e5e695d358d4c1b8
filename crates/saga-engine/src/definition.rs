use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use saga_core::{ErrorCode, Payload, Result, RetryPolicy, SagaError, SagaId, StepError};
use saga_runtime::ExecutionContext;

/// Everything a step function receives for one attempt.
#[derive(Debug, Clone)]
pub struct StepInvocation {
    /// Cancelled when the saga is cancelled; expires at the step deadline.
    pub ctx: ExecutionContext,
    pub saga_id: SagaId,
    pub step_index: usize,
    /// 1-based attempt number. Compensation attempts are counted separately.
    pub attempt: u32,
    /// Saga context as of the invocation.
    pub saga_context: Payload,
    /// The input recorded when the step row was created. Compensation gets
    /// the same value the forward action saw.
    pub input: Payload,
}

/// What a step function resolves to.
pub type StepResult<T> = std::result::Result<T, StepError>;

pub type ExecuteFn =
    Arc<dyn Fn(StepInvocation) -> BoxFuture<'static, StepResult<Payload>> + Send + Sync>;
pub type CompensateFn =
    Arc<dyn Fn(StepInvocation) -> BoxFuture<'static, StepResult<()>> + Send + Sync>;
pub type StepCondition = Arc<dyn Fn(&Payload) -> bool + Send + Sync>;

/// One step of a saga: a forward action and, optionally, its undo.
#[derive(Clone)]
pub struct SagaStepDefinition {
    name: String,
    execute: ExecuteFn,
    compensate: Option<CompensateFn>,
    compensation_description: Option<String>,
    retry_policy: Option<RetryPolicy>,
    timeout: Option<Duration>,
    prerequisites: Vec<String>,
    idempotent: bool,
    critical: bool,
    condition: Option<StepCondition>,
}

impl fmt::Debug for SagaStepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaStepDefinition")
            .field("name", &self.name)
            .field("has_compensation", &self.compensate.is_some())
            .field("retry_policy", &self.retry_policy)
            .field("timeout", &self.timeout)
            .field("prerequisites", &self.prerequisites)
            .field("idempotent", &self.idempotent)
            .field("critical", &self.critical)
            .field("conditional", &self.condition.is_some())
            .finish()
    }
}

impl SagaStepDefinition {
    /// A non-critical, non-idempotent step with no compensation.
    pub fn new<F, Fut>(name: impl Into<String>, execute: F) -> Self
    where
        F: Fn(StepInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult<Payload>> + Send + 'static,
    {
        Self {
            name: name.into(),
            execute: Arc::new(move |invocation| Box::pin(execute(invocation))),
            compensate: None,
            compensation_description: None,
            retry_policy: None,
            timeout: None,
            prerequisites: Vec::new(),
            idempotent: false,
            critical: false,
            condition: None,
        }
    }

    #[must_use]
    pub fn with_compensation<F, Fut>(mut self, compensate: F) -> Self
    where
        F: Fn(StepInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult<()>> + Send + 'static,
    {
        self.compensate = Some(Arc::new(move |invocation| Box::pin(compensate(invocation))));
        self
    }

    #[must_use]
    pub fn with_compensation_description(mut self, description: impl Into<String>) -> Self {
        self.compensation_description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Requires the named earlier step to have completed.
    #[must_use]
    pub fn requires(mut self, step_name: impl Into<String>) -> Self {
        self.prerequisites.push(step_name.into());
        self
    }

    #[must_use]
    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    /// Marks the step's effects as ones that must be undone if the saga
    /// cannot finish. A critical step with a compensation makes a failure
    /// roll the saga back; one without makes rollback impossible.
    #[must_use]
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    /// Runs the step only when `condition` holds for the saga context;
    /// otherwise it is recorded as skipped.
    #[must_use]
    pub fn run_if<F>(mut self, condition: F) -> Self
    where
        F: Fn(&Payload) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    #[must_use]
    pub fn prerequisites(&self) -> &[String] {
        &self.prerequisites
    }

    /// Safe to run again after a crash left the attempt's outcome unknown.
    #[must_use]
    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.critical
    }

    #[must_use]
    pub fn has_compensation(&self) -> bool {
        self.compensate.is_some()
    }

    #[must_use]
    pub fn compensation_description(&self) -> String {
        self.compensation_description
            .clone()
            .unwrap_or_else(|| format!("undo {}", self.name))
    }

    #[must_use]
    pub fn should_run(&self, context: &Payload) -> bool {
        self.condition.as_ref().is_none_or(|condition| condition(context))
    }

    pub(crate) fn execute(
        &self,
        invocation: StepInvocation,
    ) -> BoxFuture<'static, StepResult<Payload>> {
        (self.execute)(invocation)
    }

    pub(crate) fn compensate(
        &self,
        invocation: StepInvocation,
    ) -> Option<BoxFuture<'static, StepResult<()>>> {
        self.compensate.as_ref().map(|compensate| compensate(invocation))
    }
}

/// Contract a saga type implements to be run by the engine.
pub trait SagaDefinition: Send + Sync {
    /// Unique name the definition is registered under.
    fn saga_type(&self) -> &str;

    /// Ordered steps. Must not be empty.
    fn steps(&self) -> &[SagaStepDefinition];

    /// Rejects a context before any execution row is written.
    ///
    /// # Errors
    ///
    /// Should return `InvalidContext` describing what is wrong.
    fn validate_context(&self, context: &Payload) -> Result<()> {
        let _ = context;
        Ok(())
    }

    /// Saga-wide deadline for this context.
    fn calculate_timeout(&self, context: &Payload) -> Duration;

    /// Saga-wide retry policy; steps may override it.
    fn retry_policy(&self) -> Option<&RetryPolicy> {
        None
    }

    /// Folds a step's output into the saga context handed to later steps.
    ///
    /// The default shallow-merges JSON objects.
    ///
    /// # Errors
    ///
    /// Returns `DeserializationFailed` when either payload is not valid JSON.
    fn apply_output(
        &self,
        context: &Payload,
        step: &SagaStepDefinition,
        output: &Payload,
    ) -> Result<Payload> {
        let _ = step;
        context.merged_with(output)
    }
}

/// Structural checks run at registration.
pub(crate) fn validate_definition(definition: &dyn SagaDefinition) -> Result<()> {
    let invalid = |message: String| {
        SagaError::new(
            ErrorCode::InvalidInput,
            format!("saga '{}': {message}", definition.saga_type()),
        )
    };

    if definition.saga_type().is_empty() {
        return Err(SagaError::new(
            ErrorCode::InvalidInput,
            "saga type must not be empty",
        ));
    }
    if definition.steps().is_empty() {
        return Err(invalid("a saga needs at least one step".to_string()));
    }

    let mut seen = HashSet::new();
    for step in definition.steps() {
        for prerequisite in step.prerequisites() {
            if !seen.contains(prerequisite.as_str()) {
                return Err(invalid(format!(
                    "step '{}' requires '{prerequisite}', which is not an earlier step",
                    step.name()
                )));
            }
        }
        if !seen.insert(step.name()) {
            return Err(invalid(format!("duplicate step name '{}'", step.name())));
        }
        if let Some(policy) = step.retry_policy() {
            policy.validate()?;
        }
    }
    if let Some(policy) = definition.retry_policy() {
        policy.validate()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::SagaBuilder;

    fn noop(name: &str) -> SagaStepDefinition {
        SagaStepDefinition::new(name, |_| async { Ok(Payload::empty()) })
    }

    #[test]
    fn steps_default_to_plain_forward_actions() {
        let step = noop("reserve");
        assert!(!step.is_critical());
        assert!(!step.is_idempotent());
        assert!(!step.has_compensation());
        assert_eq!(step.compensation_description(), "undo reserve");
    }

    #[test]
    fn condition_gates_execution() {
        let step = noop("notify").run_if(|ctx| ctx.as_str().contains("\"notify\":true"));
        assert!(step.should_run(&Payload::from_raw(r#"{"notify":true}"#)));
        assert!(!step.should_run(&Payload::empty()));
        assert!(noop("always").should_run(&Payload::empty()));
    }

    #[test]
    fn duplicate_step_names_are_rejected() {
        let saga = SagaBuilder::new("dup")
            .first_step(noop("a"))
            .then(noop("a"))
            .build();
        let err = validate_definition(&saga).expect_err("duplicate name");
        assert_eq!(err.code(), ErrorCode::InvalidInput);
        assert!(err.message().contains("duplicate"));
    }

    #[test]
    fn prerequisites_must_name_earlier_steps() {
        let saga = SagaBuilder::new("order")
            .first_step(noop("a").requires("b"))
            .then(noop("b"))
            .build();
        let err = validate_definition(&saga).expect_err("forward reference");
        assert!(err.message().contains("requires 'b'"));

        let saga = SagaBuilder::new("order")
            .first_step(noop("a"))
            .then(noop("b").requires("a"))
            .build();
        assert!(validate_definition(&saga).is_ok());
    }

    #[test]
    fn default_apply_output_merges_objects() -> anyhow::Result<()> {
        let saga = SagaBuilder::new("merge").first_step(noop("a")).build();
        let merged = saga.apply_output(
            &Payload::from_raw(r#"{"a":1}"#),
            &saga.steps()[0],
            &Payload::from_raw(r#"{"b":2}"#),
        )?;
        let value: serde_json::Value = merged.decode()?;
        assert_eq!(value, serde_json::json!({"a": 1, "b": 2}));
        Ok(())
    }
}
