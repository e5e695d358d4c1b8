use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use saga_core::{
    ErrorCode, NewSagaEvent, NewSagaExecution, NewStepExecution, Payload, Result, SagaError,
    SagaEvent, SagaEventType, SagaExecution, SagaId, SagaStatus, SagaStepExecution,
    StepExecutionId, StepStatus,
};
use saga_runtime::{EventBus, LockHandle, LockManager};
use saga_store::{SagaRepository, SagaStatusChange, StepStatusChange};
use serde_json::json;
use tracing::{debug, trace, warn};

/// Single writer of saga and step status.
///
/// Every status change is validated against the transition table, applied
/// as a compare-and-swap on the stored status, recorded as an event in the
/// same write, and then published on the event bus without blocking.
pub struct StateManager {
    repository: Arc<dyn SagaRepository>,
    locks: Arc<dyn LockManager>,
    events: Arc<EventBus>,
    stale_pending_after: Duration,
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("stale_pending_after", &self.stale_pending_after)
            .finish_non_exhaustive()
    }
}

impl StateManager {
    #[must_use]
    pub fn new(
        repository: Arc<dyn SagaRepository>,
        locks: Arc<dyn LockManager>,
        events: Arc<EventBus>,
        stale_pending_after: Duration,
    ) -> Self {
        Self {
            repository,
            locks,
            events,
            stale_pending_after,
        }
    }

    #[must_use]
    pub fn repository(&self) -> &Arc<dyn SagaRepository> {
        &self.repository
    }

    /// Creates a `Pending` execution, or returns the one already recorded
    /// for the same saga type and request id. The flag is `true` when a new
    /// row was written.
    ///
    /// # Errors
    ///
    /// Propagates repository failures.
    pub async fn create_saga(
        &self,
        new: NewSagaExecution,
        trace_id: &str,
    ) -> Result<(SagaExecution, bool)> {
        let (execution, created) = self.repository.create_execution(new).await?;
        if !created {
            debug!(
                saga_id = %execution.id,
                request_id = %execution.request_id,
                "request already has an execution"
            );
            return Ok((execution, false));
        }

        let event = self
            .repository
            .append_event(
                NewSagaEvent::saga(execution.id, SagaEventType::SagaCreated, trace_id).with_data(
                    json!({
                        "saga_type": execution.saga_type,
                        "request_id": execution.request_id,
                        "total_steps": execution.total_steps,
                    }),
                ),
            )
            .await?;
        self.publish(event);
        Ok((execution, true))
    }

    /// # Errors
    ///
    /// Returns `SagaNotFound` for an unknown id.
    pub async fn get_saga(&self, id: SagaId) -> Result<SagaExecution> {
        self.repository
            .get_execution(id)
            .await?
            .ok_or_else(|| SagaError::saga_not_found(id))
    }

    /// Moves a saga from `from` to `to`.
    ///
    /// # Errors
    ///
    /// `InvalidStateTransition` when the table forbids the edge,
    /// `StateConflict` when the stored status is no longer `from`.
    pub async fn transition_saga_status(
        &self,
        id: SagaId,
        from: SagaStatus,
        to: SagaStatus,
        trace_id: &str,
    ) -> Result<SagaExecution> {
        self.transition_saga(id, SagaStatusChange::new(from, to, Utc::now()), trace_id)
            .await
    }

    /// Like [`Self::transition_saga_status`], also writing the error fields
    /// carried by `change`.
    ///
    /// # Errors
    ///
    /// See [`Self::transition_saga_status`].
    pub async fn transition_saga(
        &self,
        id: SagaId,
        change: SagaStatusChange,
        trace_id: &str,
    ) -> Result<SagaExecution> {
        let (from, to) = (change.from, change.to);
        if !from.can_transition_to(to) {
            return Err(SagaError::invalid_transition(from, to).with_saga(id));
        }

        let mut data = json!({ "from": from, "to": to });
        if let Some(error) = &change.error {
            data["error"] = json!(error);
        }
        if let Some(code) = change.error_code {
            data["error_code"] = json!(code.as_str());
        }
        if let Some(error) = &change.compensation_error {
            data["compensation_error"] = json!(error);
        }
        let event =
            NewSagaEvent::saga(id, SagaEventType::for_saga_status(to), trace_id).with_data(data);

        let Some(moved) = self
            .repository
            .transition_execution(id, change, event)
            .await?
        else {
            warn!(saga_id = %id, %from, %to, "saga status changed underneath");
            return Err(SagaError::state_conflict(from).with_saga(id));
        };

        debug!(saga_id = %id, %from, %to, "saga transitioned");
        self.publish(moved.event);
        Ok(moved.record)
    }

    /// Moves a step to `to` from its current status.
    ///
    /// # Errors
    ///
    /// `InvalidStateTransition` or `StateConflict`, as for sagas.
    pub async fn transition_step_status(
        &self,
        step: &SagaStepExecution,
        to: StepStatus,
        trace_id: &str,
    ) -> Result<SagaStepExecution> {
        self.transition_step(step, StepStatusChange::new(step.status, to, Utc::now()), trace_id)
            .await
    }

    /// # Errors
    ///
    /// `InvalidStateTransition` or `StateConflict`.
    pub async fn transition_step(
        &self,
        step: &SagaStepExecution,
        change: StepStatusChange,
        trace_id: &str,
    ) -> Result<SagaStepExecution> {
        let (from, to) = (change.from, change.to);
        let locate = |err: SagaError| {
            err.with_saga(step.saga_execution_id)
                .with_step(step.step_index)
        };
        if !from.can_transition_to(to) {
            return Err(locate(SagaError::invalid_transition(from, to)));
        }

        let mut data = json!({
            "from": from,
            "to": to,
            "attempt": step.attempt_count,
        });
        if let Some(error) = &change.error {
            data["error"] = json!(error);
        }
        if let Some(at) = change.next_retry_at {
            data["next_retry_at"] = json!(at);
        }
        let event = NewSagaEvent::step(
            step.saga_execution_id,
            SagaEventType::for_step_status(to),
            &step.step_name,
            step.step_index,
            trace_id,
        )
        .with_data(data);

        let Some(moved) = self
            .repository
            .transition_step(step.id, change, event)
            .await?
        else {
            warn!(
                saga_id = %step.saga_execution_id,
                step = %step.step_name,
                %from,
                %to,
                "step status changed underneath"
            );
            return Err(locate(SagaError::state_conflict(from)));
        };

        trace!(
            saga_id = %step.saga_execution_id,
            step = %step.step_name,
            %from,
            %to,
            "step transitioned"
        );
        self.publish(moved.event);
        Ok(moved.record)
    }

    /// Takes the per-saga lock without waiting.
    ///
    /// # Errors
    ///
    /// `SagaLockFailed` when another holder has it.
    pub async fn acquire_saga_lock(&self, id: SagaId, ttl: Duration) -> Result<Box<dyn LockHandle>> {
        self.locks
            .acquire_lock(&id.lock_key(), ttl)
            .await
            .map_err(|e| e.with_saga(id))
    }

    /// Records how far a running saga got and the context after that step.
    ///
    /// # Errors
    ///
    /// `InvalidStateTransition` when the saga is not `Running` or
    /// `current_step` would move backwards.
    pub async fn update_saga_progress(
        &self,
        id: SagaId,
        current_step: usize,
        context: Payload,
    ) -> Result<()> {
        let execution = self.get_saga(id).await?;
        if execution.status != SagaStatus::Running {
            return Err(SagaError::new(
                ErrorCode::InvalidStateTransition,
                format!("progress can only change while running, saga is {}", execution.status),
            )
            .with_saga(id));
        }
        if current_step < execution.current_step {
            return Err(SagaError::new(
                ErrorCode::InvalidStateTransition,
                format!(
                    "current step cannot move back from {} to {current_step}",
                    execution.current_step
                ),
            )
            .with_saga(id));
        }
        self.repository
            .update_progress(id, current_step, context, Utc::now())
            .await
    }

    /// # Errors
    ///
    /// `StepNotFound` for an unknown step row.
    pub async fn record_step_result(
        &self,
        id: StepExecutionId,
        output: Option<Payload>,
        error: Option<String>,
    ) -> Result<()> {
        self.repository.record_step_result(id, output, error).await
    }

    /// # Errors
    ///
    /// `StepNotFound` for an unknown step row.
    pub async fn record_step_attempt(&self, id: StepExecutionId, attempt_count: u32) -> Result<()> {
        self.repository.record_step_attempt(id, attempt_count).await
    }

    /// Returns the step row at `new.step_index`, creating it if absent.
    ///
    /// # Errors
    ///
    /// Propagates repository failures.
    pub async fn get_or_create_step(&self, new: NewStepExecution) -> Result<SagaStepExecution> {
        if let Some(step) = self
            .repository
            .find_step(new.saga_execution_id, new.step_index)
            .await?
        {
            return Ok(step);
        }
        self.repository.create_step(new).await
    }

    /// # Errors
    ///
    /// Propagates repository failures.
    pub async fn get_steps(&self, id: SagaId) -> Result<Vec<SagaStepExecution>> {
        self.repository.list_steps(id).await
    }

    /// # Errors
    ///
    /// Propagates repository failures.
    pub async fn get_events(&self, id: SagaId) -> Result<Vec<SagaEvent>> {
        self.repository.list_events(id).await
    }

    /// Sagas a restarted process should pick up: everything `Running` or
    /// `Compensating`, plus `Pending` rows nobody touched for a while.
    ///
    /// # Errors
    ///
    /// Propagates repository failures.
    pub async fn get_recoverable_sagas(&self) -> Result<Vec<SagaExecution>> {
        let mut sagas = self
            .repository
            .find_by_status(&[SagaStatus::Running, SagaStatus::Compensating])
            .await?;

        let window = chrono::Duration::from_std(self.stale_pending_after)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let stale = self
            .repository
            .find_stale(SagaStatus::Pending, Utc::now() - window)
            .await?;
        sagas.extend(stale);
        sagas.sort_by_key(|s| s.id);
        Ok(sagas)
    }

    fn publish(&self, event: SagaEvent) {
        if !self.events.publish_async(event) {
            trace!("event not queued for delivery");
        }
    }
}
