use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use saga_core::{
    ErrorCode, NewSagaEvent, NewSagaExecution, NewStepExecution, Payload, Result, SagaError,
    SagaEvent, SagaExecution, SagaId, SagaStatus, SagaStepExecution, StepExecutionId, StepStatus,
};
use tracing::trace;

use crate::repository::{SagaRepository, SagaStatusChange, StepStatusChange, Transitioned};

#[derive(Debug, Default)]
struct Tables {
    executions: BTreeMap<SagaId, SagaExecution>,
    steps: BTreeMap<StepExecutionId, SagaStepExecution>,
    events: Vec<SagaEvent>,
    next_execution_id: i64,
    next_step_id: i64,
    next_event_id: i64,
}

impl Tables {
    fn push_event(&mut self, new: NewSagaEvent) -> SagaEvent {
        self.next_event_id += 1;
        let event = SagaEvent {
            id: self.next_event_id,
            saga_execution_id: new.saga_execution_id,
            event_type: new.event_type,
            step_name: new.step_name,
            step_index: new.step_index,
            event_data: new.event_data,
            trace_id: new.trace_id,
            created_at: Utc::now(),
        };
        self.events.push(event.clone());
        event
    }

    fn step_mut(&mut self, id: StepExecutionId) -> Result<&mut SagaStepExecution> {
        self.steps.get_mut(&id).ok_or_else(|| step_not_found(id))
    }
}

fn step_not_found(id: StepExecutionId) -> SagaError {
    SagaError::new(
        ErrorCode::StepNotFound,
        format!("step execution {id} not found"),
    )
}

/// [`SagaRepository`] kept entirely in memory.
///
/// A single mutex plays the role of the storage transaction, so every
/// conditional update and its event append are atomic.
#[derive(Debug, Default)]
pub struct InMemorySagaRepository {
    tables: Mutex<Tables>,
}

impl InMemorySagaRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites `updated_at`, letting tests age a row past the stale window.
    ///
    /// # Errors
    ///
    /// Returns `SagaNotFound` when no row has `id`.
    pub fn backdate(&self, id: SagaId, updated_at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.lock();
        let execution = tables
            .executions
            .get_mut(&id)
            .ok_or_else(|| SagaError::saga_not_found(id))?;
        execution.updated_at = updated_at;
        Ok(())
    }
}

#[async_trait]
impl SagaRepository for InMemorySagaRepository {
    async fn create_execution(&self, new: NewSagaExecution) -> Result<(SagaExecution, bool)> {
        let mut tables = self.tables.lock();
        if let Some(existing) = tables
            .executions
            .values()
            .find(|e| e.saga_type == new.saga_type && e.request_id == new.request_id)
        {
            return Ok((existing.clone(), false));
        }
        tables.next_execution_id += 1;
        let now = Utc::now();
        let execution = SagaExecution {
            id: SagaId(tables.next_execution_id),
            saga_type: new.saga_type,
            request_id: new.request_id,
            status: SagaStatus::Pending,
            current_step: 0,
            total_steps: new.total_steps,
            context: new.context,
            error: None,
            error_code: None,
            compensation_error: None,
            started_at: now,
            completed_at: None,
            updated_at: now,
        };
        tables.executions.insert(execution.id, execution.clone());
        trace!(saga_id = %execution.id, "execution row created");
        Ok((execution, true))
    }

    async fn get_execution(&self, id: SagaId) -> Result<Option<SagaExecution>> {
        Ok(self.tables.lock().executions.get(&id).cloned())
    }

    async fn find_by_request_id(
        &self,
        saga_type: &str,
        request_id: &str,
    ) -> Result<Option<SagaExecution>> {
        Ok(self
            .tables
            .lock()
            .executions
            .values()
            .find(|e| e.saga_type == saga_type && e.request_id == request_id)
            .cloned())
    }

    async fn transition_execution(
        &self,
        id: SagaId,
        change: SagaStatusChange,
        event: NewSagaEvent,
    ) -> Result<Option<Transitioned<SagaExecution>>> {
        let mut tables = self.tables.lock();
        let execution = tables
            .executions
            .get_mut(&id)
            .ok_or_else(|| SagaError::saga_not_found(id))?;
        if execution.status != change.from {
            return Ok(None);
        }

        execution.status = change.to;
        execution.updated_at = change.at;
        if let Some(completed_at) = change.completed_at {
            execution.completed_at = Some(completed_at);
        }
        if let Some(error) = change.error {
            execution.error = Some(error);
        }
        if let Some(code) = change.error_code {
            execution.error_code = Some(code);
        }
        if let Some(error) = change.compensation_error {
            execution.compensation_error = Some(error);
        }
        let record = execution.clone();
        let event = tables.push_event(event);
        Ok(Some(Transitioned { record, event }))
    }

    async fn update_progress(
        &self,
        id: SagaId,
        current_step: usize,
        context: Payload,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.tables.lock();
        let execution = tables
            .executions
            .get_mut(&id)
            .ok_or_else(|| SagaError::saga_not_found(id))?;
        execution.current_step = current_step;
        execution.context = context;
        execution.updated_at = at;
        Ok(())
    }

    async fn find_by_status(&self, statuses: &[SagaStatus]) -> Result<Vec<SagaExecution>> {
        Ok(self
            .tables
            .lock()
            .executions
            .values()
            .filter(|e| statuses.contains(&e.status))
            .cloned()
            .collect())
    }

    async fn find_stale(
        &self,
        status: SagaStatus,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<SagaExecution>> {
        Ok(self
            .tables
            .lock()
            .executions
            .values()
            .filter(|e| e.status == status && e.updated_at < updated_before)
            .cloned()
            .collect())
    }

    async fn create_step(&self, new: NewStepExecution) -> Result<SagaStepExecution> {
        let mut tables = self.tables.lock();
        let duplicate = tables.steps.values().any(|s| {
            s.saga_execution_id == new.saga_execution_id && s.step_index == new.step_index
        });
        if duplicate {
            return Err(SagaError::repository(format!(
                "step {} already exists",
                new.step_index
            ))
            .with_saga(new.saga_execution_id)
            .with_step(new.step_index));
        }

        tables.next_step_id += 1;
        let step = SagaStepExecution {
            id: StepExecutionId(tables.next_step_id),
            saga_execution_id: new.saga_execution_id,
            step_name: new.step_name,
            step_index: new.step_index,
            status: StepStatus::Pending,
            input: new.input,
            output: None,
            error: None,
            attempt_count: 0,
            max_retries: new.max_retries,
            next_retry_at: None,
            started_at: None,
            completed_at: None,
            compensated_at: None,
        };
        tables.steps.insert(step.id, step.clone());
        Ok(step)
    }

    async fn get_step(&self, id: StepExecutionId) -> Result<Option<SagaStepExecution>> {
        Ok(self.tables.lock().steps.get(&id).cloned())
    }

    async fn find_step(
        &self,
        saga_id: SagaId,
        step_index: usize,
    ) -> Result<Option<SagaStepExecution>> {
        Ok(self
            .tables
            .lock()
            .steps
            .values()
            .find(|s| s.saga_execution_id == saga_id && s.step_index == step_index)
            .cloned())
    }

    async fn list_steps(&self, saga_id: SagaId) -> Result<Vec<SagaStepExecution>> {
        let mut steps: Vec<_> = self
            .tables
            .lock()
            .steps
            .values()
            .filter(|s| s.saga_execution_id == saga_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.step_index);
        Ok(steps)
    }

    async fn transition_step(
        &self,
        id: StepExecutionId,
        change: StepStatusChange,
        event: NewSagaEvent,
    ) -> Result<Option<Transitioned<SagaStepExecution>>> {
        let mut tables = self.tables.lock();
        let step = tables.step_mut(id)?;
        if step.status != change.from {
            return Ok(None);
        }

        step.status = change.to;
        step.next_retry_at = change.next_retry_at;
        if let Some(error) = change.error {
            step.error = Some(error);
        }
        if let Some(at) = change.started_at {
            step.started_at = Some(at);
        }
        if let Some(at) = change.completed_at {
            step.completed_at = Some(at);
        }
        if let Some(at) = change.compensated_at {
            step.compensated_at = Some(at);
        }
        let record = step.clone();
        let event = tables.push_event(event);
        Ok(Some(Transitioned { record, event }))
    }

    async fn record_step_attempt(&self, id: StepExecutionId, attempt_count: u32) -> Result<()> {
        self.tables.lock().step_mut(id)?.attempt_count = attempt_count;
        Ok(())
    }

    async fn record_step_result(
        &self,
        id: StepExecutionId,
        output: Option<Payload>,
        error: Option<String>,
    ) -> Result<()> {
        let mut tables = self.tables.lock();
        let step = tables.step_mut(id)?;
        step.output = output;
        step.error = error;
        Ok(())
    }

    async fn append_event(&self, event: NewSagaEvent) -> Result<SagaEvent> {
        Ok(self.tables.lock().push_event(event))
    }

    async fn list_events(&self, saga_id: SagaId) -> Result<Vec<SagaEvent>> {
        Ok(self
            .tables
            .lock()
            .events
            .iter()
            .filter(|e| e.saga_execution_id == saga_id)
            .cloned()
            .collect())
    }
}
