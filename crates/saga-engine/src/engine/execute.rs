use chrono::Utc;
use dashmap::DashMap;
use saga_core::{
    ErrorCode, NewStepExecution, Payload, Result, RetryPolicy, SagaError, SagaExecution, SagaId,
    SagaStatus, SagaStepExecution, StepError, StepStatus,
};
use saga_runtime::{ExecutionContext, LockHandle};
use saga_store::{SagaStatusChange, StepStatusChange};
use tracing::{debug, error, info, warn};

use super::{Engine, already_finished};
use crate::definition::{SagaDefinition, SagaStepDefinition, StepInvocation};

/// Keeps a saga's context in the active map for as long as it is driven.
struct ActiveSaga<'a> {
    active: &'a DashMap<SagaId, ExecutionContext>,
    saga_id: SagaId,
}

impl Drop for ActiveSaga<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.saga_id);
    }
}

impl Engine {
    /// Runs a locked saga forward. The caller owns `lock`.
    pub(super) async fn drive(
        &self,
        ctx: &ExecutionContext,
        saga_id: SagaId,
        definition: &dyn SagaDefinition,
        lock: &dyn LockHandle,
    ) -> Result<SagaExecution> {
        let mut execution = self.state.get_saga(saga_id).await?;
        match execution.status {
            SagaStatus::Pending => {
                execution = self
                    .state
                    .transition_saga_status(
                        saga_id,
                        SagaStatus::Pending,
                        SagaStatus::Running,
                        ctx.trace_id(),
                    )
                    .await?;
                info!(
                    saga_id = %saga_id,
                    saga_type = %execution.saga_type,
                    trace_id = ctx.trace_id(),
                    "saga started"
                );
            }
            SagaStatus::Running => {
                debug!(saga_id = %saga_id, from_step = execution.current_step, "resuming saga");
            }
            SagaStatus::Compensating => {
                return Err(SagaError::new(
                    ErrorCode::SagaAlreadyRunning,
                    "saga is being compensated",
                )
                .with_saga(saga_id));
            }
            status => return Err(already_finished(saga_id, status)),
        }

        let timeout = definition.calculate_timeout(&execution.context);
        let saga_ctx = self.timeouts.saga_context(ctx, Some(timeout));
        self.active.insert(saga_id, saga_ctx.clone());
        let _active = ActiveSaga {
            active: &self.active,
            saga_id,
        };

        self.run_steps(&saga_ctx, execution, definition, lock).await
    }

    async fn run_steps(
        &self,
        saga_ctx: &ExecutionContext,
        execution: SagaExecution,
        definition: &dyn SagaDefinition,
        lock: &dyn LockHandle,
    ) -> Result<SagaExecution> {
        let saga_id = execution.id;
        let trace_id = saga_ctx.trace_id();
        let steps = definition.steps();
        let mut context = execution.context;

        for (index, step_def) in steps.iter().enumerate().skip(execution.current_step) {
            if let Err(interrupted) = saga_ctx.check() {
                return self.interrupt(saga_id, index, interrupted, trace_id).await;
            }
            lock.extend(self.config.lock_ttl())
                .await
                .map_err(|e| e.with_saga(saga_id).with_step(index))?;

            let policy = self
                .retry
                .effective_policy(step_def.retry_policy().or_else(|| definition.retry_policy()));
            let step = self
                .state
                .get_or_create_step(NewStepExecution {
                    saga_execution_id: saga_id,
                    step_name: step_def.name().to_string(),
                    step_index: index,
                    input: context.clone(),
                    max_retries: policy.max_attempts,
                })
                .await?;

            match step.status {
                StepStatus::Completed => {
                    debug!(saga_id = %saga_id, step = %step.step_name, "step already completed");
                    if let Some(output) = &step.output {
                        context = definition.apply_output(&context, step_def, output)?;
                    }
                    self.state
                        .update_saga_progress(saga_id, index + 1, context.clone())
                        .await?;
                    continue;
                }
                StepStatus::Skipped => {
                    self.state
                        .update_saga_progress(saga_id, index + 1, context.clone())
                        .await?;
                    continue;
                }
                StepStatus::Compensating | StepStatus::Compensated => {
                    return Err(SagaError::new(
                        ErrorCode::InvalidStateTransition,
                        format!("step is {} and cannot run forward", step.status),
                    )
                    .with_saga(saga_id)
                    .with_step(index));
                }
                StepStatus::Pending if !step_def.should_run(&context) => {
                    self.state
                        .transition_step_status(&step, StepStatus::Skipped, trace_id)
                        .await?;
                    info!(saga_id = %saga_id, step = %step.step_name, "step skipped");
                    self.state
                        .update_saga_progress(saga_id, index + 1, context.clone())
                        .await?;
                    continue;
                }
                StepStatus::Pending
                | StepStatus::Running
                | StepStatus::Failed
                | StepStatus::Retrying => {}
            }

            if let Err(err) = self.check_prerequisites(saga_id, index, step_def).await {
                return self
                    .fail_saga(saga_ctx, saga_id, index, definition, err)
                    .await;
            }

            let output = match self
                .execute_step_with_retry(saga_ctx, saga_id, step_def, step, &context, policy)
                .await
            {
                Ok(output) => output,
                Err(err) => {
                    return self
                        .fail_saga(saga_ctx, saga_id, index, definition, err)
                        .await;
                }
            };

            context = match definition.apply_output(&context, step_def, &output) {
                Ok(context) => context,
                Err(err) => {
                    let err = err.with_saga(saga_id).with_step(index);
                    return self
                        .fail_saga(saga_ctx, saga_id, index, definition, err)
                        .await;
                }
            };
            self.state
                .update_saga_progress(saga_id, index + 1, context.clone())
                .await?;
        }

        let completed = self
            .state
            .transition_saga_status(saga_id, SagaStatus::Running, SagaStatus::Completed, trace_id)
            .await?;
        info!(saga_id = %saga_id, steps = steps.len(), "saga completed");
        Ok(completed)
    }

    async fn check_prerequisites(
        &self,
        saga_id: SagaId,
        index: usize,
        step_def: &SagaStepDefinition,
    ) -> Result<()> {
        if step_def.prerequisites().is_empty() {
            return Ok(());
        }
        let rows = self.state.get_steps(saga_id).await?;
        for prerequisite in step_def.prerequisites() {
            let completed = rows
                .iter()
                .any(|row| row.step_name == *prerequisite && row.status == StepStatus::Completed);
            if !completed {
                return Err(SagaError::new(
                    ErrorCode::StepPrerequisiteFailed,
                    format!(
                        "step '{}' requires '{prerequisite}' to be completed",
                        step_def.name()
                    ),
                )
                .with_saga(saga_id)
                .with_step(index));
            }
        }
        Ok(())
    }

    /// Runs one step until it succeeds, its attempt budget is spent, or the
    /// saga is interrupted. Backoff sleeps observe the saga context.
    pub(super) async fn execute_step_with_retry(
        &self,
        saga_ctx: &ExecutionContext,
        saga_id: SagaId,
        step_def: &SagaStepDefinition,
        step: SagaStepExecution,
        context: &Payload,
        policy: &RetryPolicy,
    ) -> Result<Payload> {
        let trace_id = saga_ctx.trace_id();
        let index = step.step_index;
        let locate = move |e: SagaError| e.with_saga(saga_id).with_step(index);

        let mut step = self.enter_running(step, step_def, policy, trace_id).await?;
        loop {
            let attempt = step.attempt_count + 1;
            self.state.record_step_attempt(step.id, attempt).await?;
            step.attempt_count = attempt;
            debug!(saga_id = %saga_id, step = %step.step_name, attempt, "executing step");

            let step_ctx = self.timeouts.step_context(saga_ctx, step_def.timeout());
            let invocation = StepInvocation {
                ctx: step_ctx.clone(),
                saga_id,
                step_index: index,
                attempt,
                saga_context: context.clone(),
                input: step.input.clone(),
            };
            let outcome = match step_ctx.run(step_def.execute(invocation)).await {
                Ok(outcome) => outcome,
                Err(interrupted) => Err(StepError::from(interrupted)),
            };

            let cause = match outcome {
                Ok(output) => {
                    self.state
                        .record_step_result(step.id, Some(output.clone()), None)
                        .await?;
                    self.state
                        .transition_step_status(&step, StepStatus::Completed, trace_id)
                        .await?;
                    info!(saga_id = %saga_id, step = %step.step_name, attempt, "step completed");
                    return Ok(output);
                }
                Err(cause) => cause,
            };

            let message = cause.to_string();
            self.state
                .record_step_result(step.id, None, Some(message.clone()))
                .await?;
            let mut failed = StepStatusChange::new(StepStatus::Running, StepStatus::Failed, Utc::now());
            failed.error = Some(message.clone());
            step = self.state.transition_step(&step, failed, trace_id).await?;

            if let Err(interrupted) = saga_ctx.check() {
                return Err(locate(interrupted).with_source(cause));
            }

            if !self.retry.should_retry(&*cause, attempt, policy) {
                let code = if self.retry.is_retryable_error(&*cause, policy) {
                    ErrorCode::MaxRetriesExceeded
                } else {
                    ErrorCode::StepExecutionFailed
                };
                warn!(
                    saga_id = %saga_id,
                    step = %step.step_name,
                    attempt,
                    code = %code,
                    error = %message,
                    "step failed"
                );
                return Err(locate(SagaError::new(
                    code,
                    format!(
                        "step '{}' failed after {attempt} attempt(s): {message}",
                        step.step_name
                    ),
                ))
                .with_source(cause));
            }

            let delay = self.retry.calculate_delay(attempt - 1, policy);
            let mut retrying =
                StepStatusChange::new(StepStatus::Failed, StepStatus::Retrying, Utc::now());
            retrying.next_retry_at = chrono::Duration::from_std(delay)
                .ok()
                .map(|delay| Utc::now() + delay);
            step = self.state.transition_step(&step, retrying, trace_id).await?;
            warn!(
                saga_id = %saga_id,
                step = %step.step_name,
                attempt,
                delay = ?delay,
                error = %message,
                "step failed, retrying"
            );

            if let Err(interrupted) = saga_ctx.sleep(delay).await {
                return Err(locate(interrupted).with_source(cause));
            }
            step = self
                .state
                .transition_step_status(&step, StepStatus::Running, trace_id)
                .await?;
        }
    }

    /// Moves a step into `Running` from wherever a previous driver left it.
    async fn enter_running(
        &self,
        step: SagaStepExecution,
        step_def: &SagaStepDefinition,
        policy: &RetryPolicy,
        trace_id: &str,
    ) -> Result<SagaStepExecution> {
        let (saga_id, index) = (step.saga_execution_id, step.step_index);
        let locate = move |e: SagaError| e.with_saga(saga_id).with_step(index);
        match step.status {
            StepStatus::Pending | StepStatus::Retrying => {
                self.state
                    .transition_step_status(&step, StepStatus::Running, trace_id)
                    .await
            }
            StepStatus::Failed if step.attempt_count >= policy.max_attempts => {
                Err(locate(SagaError::new(
                    ErrorCode::MaxRetriesExceeded,
                    format!(
                        "step '{}' already used {} attempt(s): {}",
                        step.step_name,
                        step.attempt_count,
                        step.error.as_deref().unwrap_or("unknown error")
                    ),
                )))
            }
            StepStatus::Failed => {
                let retrying = self
                    .state
                    .transition_step_status(&step, StepStatus::Retrying, trace_id)
                    .await?;
                self.state
                    .transition_step_status(&retrying, StepStatus::Running, trace_id)
                    .await
            }
            StepStatus::Running if step_def.is_idempotent() => {
                debug!(
                    saga_id = %saga_id,
                    step = %step.step_name,
                    "re-running interrupted idempotent step"
                );
                Ok(step)
            }
            StepStatus::Running => {
                let mut failed =
                    StepStatusChange::new(StepStatus::Running, StepStatus::Failed, Utc::now());
                failed.error = Some("interrupted while running, outcome unknown".to_string());
                self.state.transition_step(&step, failed, trace_id).await?;
                Err(locate(SagaError::new(
                    ErrorCode::StepExecutionFailed,
                    format!(
                        "step '{}' was interrupted and is not idempotent",
                        step.step_name
                    ),
                )))
            }
            status => Err(locate(SagaError::invalid_transition(
                status,
                StepStatus::Running,
            ))),
        }
    }

    /// Routes a step failure to `Timeout`, `Cancelled`, `Failed` or compensation.
    async fn fail_saga(
        &self,
        saga_ctx: &ExecutionContext,
        saga_id: SagaId,
        failed_index: usize,
        definition: &dyn SagaDefinition,
        err: SagaError,
    ) -> Result<SagaExecution> {
        let trace_id = saga_ctx.trace_id();
        if matches!(
            err.code(),
            ErrorCode::SagaTimeout | ErrorCode::SagaCancelled
        ) {
            return self.interrupt(saga_id, failed_index, err, trace_id).await;
        }

        error!(
            saga_id = %saga_id,
            step_index = failed_index,
            code = %err.code(),
            error = %err,
            "saga step failed"
        );

        if should_compensate(definition, failed_index) {
            let mut change =
                SagaStatusChange::new(SagaStatus::Running, SagaStatus::Compensating, Utc::now());
            change.error = Some(err.to_string());
            change.error_code = Some(err.code());
            self.state.transition_saga(saga_id, change, trace_id).await?;
            return self
                .run_compensation(saga_ctx, saga_id, definition, Some(err))
                .await;
        }

        let mut change = SagaStatusChange::new(SagaStatus::Running, SagaStatus::Failed, Utc::now());
        change.error = Some(err.to_string());
        change.error_code = Some(err.code());
        self.state.transition_saga(saga_id, change, trace_id).await?;
        Err(err)
    }

    /// Records a deadline or cancellation. Nothing is compensated.
    ///
    /// During shutdown the saga is left `Running` for recovery to resume.
    async fn interrupt(
        &self,
        saga_id: SagaId,
        step_index: usize,
        err: SagaError,
        trace_id: &str,
    ) -> Result<SagaExecution> {
        let err = err.with_saga(saga_id).with_step(step_index);
        if !self.is_running() {
            warn!(saga_id = %saga_id, step_index, "saga interrupted by engine shutdown");
            return Err(SagaError::new(
                ErrorCode::EngineNotInitialized,
                "engine shut down while the saga was running",
            )
            .with_saga(saga_id)
            .with_step(step_index)
            .with_source(err));
        }

        let to = if err.code() == ErrorCode::SagaTimeout {
            SagaStatus::Timeout
        } else {
            SagaStatus::Cancelled
        };
        let mut change = SagaStatusChange::new(SagaStatus::Running, to, Utc::now());
        change.error = Some(err.to_string());
        change.error_code = Some(err.code());
        self.state.transition_saga(saga_id, change, trace_id).await?;
        warn!(saga_id = %saga_id, step_index, status = %to, "saga interrupted");
        Err(err)
    }
}

/// Rollback is worth attempting only if some step up to and including the
/// failed one is critical and knows how to undo itself.
fn should_compensate(definition: &dyn SagaDefinition, failed_index: usize) -> bool {
    definition
        .steps()
        .iter()
        .take(failed_index + 1)
        .any(|step| step.is_critical() && step.has_compensation())
}
