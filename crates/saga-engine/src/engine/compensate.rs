use chrono::Utc;
use saga_core::{
    ErrorCode, Result, SagaError, SagaExecution, SagaId, SagaStatus, SagaStepExecution, StepError,
    StepStatus,
};
use saga_runtime::ExecutionContext;
use saga_store::SagaStatusChange;
use tracing::{debug, error, info, warn};

use super::Engine;
use crate::definition::{SagaDefinition, StepInvocation};

impl Engine {
    /// Undoes completed steps of a `Compensating` saga in reverse order and
    /// settles it as `Compensated` or `Failed`.
    ///
    /// `cause` is the step failure that triggered the rollback; it is
    /// returned as the error once rollback succeeds.
    pub(super) async fn run_compensation(
        &self,
        ctx: &ExecutionContext,
        saga_id: SagaId,
        definition: &dyn SagaDefinition,
        cause: Option<SagaError>,
    ) -> Result<SagaExecution> {
        let trace_id = ctx.trace_id();
        // Rollback is not bound by the saga deadline that may have triggered it.
        let rollback_ctx = ExecutionContext::new().with_trace_id(trace_id);

        let execution = self.state.get_saga(saga_id).await?;
        let mut steps = self.state.get_steps(saga_id).await?;
        steps.retain(|step| {
            matches!(
                step.status,
                StepStatus::Completed | StepStatus::Compensating
            )
        });
        steps.sort_by(|a, b| b.step_index.cmp(&a.step_index));
        info!(saga_id = %saga_id, steps = steps.len(), "compensating saga");

        let mut failures = Vec::new();
        for step in steps {
            let step_index = step.step_index;
            if let Err(err) = self
                .compensate_step(&rollback_ctx, &execution, definition, step)
                .await
            {
                error!(
                    saga_id = %saga_id,
                    step_index,
                    code = %err.code(),
                    error = %err,
                    "step compensation failed"
                );
                failures.push(err);
            }
        }

        let Some(first) = failures.first() else {
            let compensated = self
                .state
                .transition_saga_status(
                    saga_id,
                    SagaStatus::Compensating,
                    SagaStatus::Compensated,
                    trace_id,
                )
                .await?;
            info!(saga_id = %saga_id, "saga compensated");
            return match cause {
                Some(cause) => Err(cause),
                None => Ok(compensated),
            };
        };

        let code = first.code();
        let summary = failures
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        let mut change =
            SagaStatusChange::new(SagaStatus::Compensating, SagaStatus::Failed, Utc::now());
        change.compensation_error = Some(summary.clone());
        change.error_code = Some(code);
        self.state.transition_saga(saga_id, change, trace_id).await?;

        let err = SagaError::new(code, format!("compensation failed: {summary}")).with_saga(saga_id);
        Err(match cause {
            Some(cause) => err.with_source(cause),
            None => err,
        })
    }

    /// Runs one step's compensation with the step's retry policy.
    ///
    /// The compensation sees the input the forward action was given.
    async fn compensate_step(
        &self,
        ctx: &ExecutionContext,
        execution: &SagaExecution,
        definition: &dyn SagaDefinition,
        step: SagaStepExecution,
    ) -> Result<()> {
        let saga_id = execution.id;
        let index = step.step_index;
        let trace_id = ctx.trace_id();
        let locate = move |e: SagaError| e.with_saga(saga_id).with_step(index);

        let Some(step_def) = definition.steps().get(index) else {
            return Err(locate(SagaError::new(
                ErrorCode::CompensationImpossible,
                format!("step '{}' is not part of the definition", step.step_name),
            )));
        };
        if !step_def.has_compensation() && step_def.is_critical() {
            return Err(locate(SagaError::new(
                ErrorCode::CompensationImpossible,
                format!("critical step '{}' has no compensation", step.step_name),
            )));
        }

        let step = match step.status {
            StepStatus::Completed => {
                self.state
                    .transition_step_status(&step, StepStatus::Compensating, trace_id)
                    .await?
            }
            _ => step,
        };

        let policy = self
            .retry
            .effective_policy(step_def.retry_policy().or_else(|| definition.retry_policy()));
        let mut attempt = 0;
        loop {
            attempt += 1;
            let step_ctx = self.timeouts.step_context(ctx, step_def.timeout());
            let invocation = StepInvocation {
                ctx: step_ctx.clone(),
                saga_id,
                step_index: index,
                attempt,
                saga_context: execution.context.clone(),
                input: step.input.clone(),
            };
            let outcome = match step_def.compensate(invocation) {
                Some(compensation) => match step_ctx.run(compensation).await {
                    Ok(outcome) => outcome,
                    Err(interrupted) => Err(StepError::from(interrupted)),
                },
                None => {
                    debug!(saga_id = %saga_id, step = %step.step_name, "nothing to undo");
                    Ok(())
                }
            };

            let cause = match outcome {
                Ok(()) => {
                    self.state
                        .transition_step_status(&step, StepStatus::Compensated, trace_id)
                        .await?;
                    info!(
                        saga_id = %saga_id,
                        step = %step.step_name,
                        action = %step_def.compensation_description(),
                        "step compensated"
                    );
                    return Ok(());
                }
                Err(cause) => cause,
            };

            let message = cause.to_string();
            if self.retry.should_retry(&*cause, attempt, policy) {
                let delay = self.retry.calculate_delay(attempt - 1, policy);
                warn!(
                    saga_id = %saga_id,
                    step = %step.step_name,
                    attempt,
                    delay = ?delay,
                    error = %message,
                    "compensation failed, retrying"
                );
                if let Err(interrupted) = ctx.sleep(delay).await {
                    return Err(locate(interrupted).with_source(cause));
                }
                continue;
            }

            self.state
                .record_step_result(step.id, step.output.clone(), Some(message.clone()))
                .await?;
            return Err(locate(SagaError::new(
                ErrorCode::StepCompensationFailed,
                format!(
                    "compensating '{}' failed after {attempt} attempt(s): {message}",
                    step.step_name
                ),
            ))
            .with_source(cause));
        }
    }
}
