use async_trait::async_trait;
use chrono::{DateTime, Utc};
use saga_core::{
    ErrorCode, NewSagaEvent, NewSagaExecution, NewStepExecution, Payload, Result, SagaEvent,
    SagaExecution, SagaId, SagaStatus, SagaStepExecution, StepExecutionId, StepStatus,
};

/// A row after a successful conditional update, with the event written alongside it.
#[derive(Debug, Clone)]
pub struct Transitioned<T> {
    pub record: T,
    pub event: SagaEvent,
}

/// Conditional status write for a saga row.
///
/// Applied only while the row is still in `from`. `Some` fields overwrite the
/// stored value; `None` fields leave it untouched.
#[derive(Debug, Clone)]
pub struct SagaStatusChange {
    pub from: SagaStatus,
    pub to: SagaStatus,
    pub at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub compensation_error: Option<String>,
}

impl SagaStatusChange {
    #[must_use]
    pub fn new(from: SagaStatus, to: SagaStatus, at: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            at,
            completed_at: to.is_terminal().then_some(at),
            error: None,
            error_code: None,
            compensation_error: None,
        }
    }
}

/// Conditional status write for a step row.
///
/// Timestamps overwrite when `Some`. `next_retry_at` is always written, so
/// `None` clears a previously scheduled retry. `error` overwrites when `Some`.
#[derive(Debug, Clone)]
pub struct StepStatusChange {
    pub from: StepStatus,
    pub to: StepStatus,
    pub at: DateTime<Utc>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub compensated_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl StepStatusChange {
    #[must_use]
    pub fn new(from: StepStatus, to: StepStatus, at: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            at,
            error: None,
            started_at: (to == StepStatus::Running).then_some(at),
            completed_at: (to == StepStatus::Completed).then_some(at),
            compensated_at: (to == StepStatus::Compensated).then_some(at),
            next_retry_at: None,
        }
    }
}

/// Storage operations the engine depends on.
///
/// Any backend with conditional updates and ordered secondary lookups
/// (SQL table, document store, indexed key-value store) can implement it.
/// Status changes must be atomic with the event they append.
#[async_trait]
pub trait SagaRepository: Send + Sync {
    /// Inserts a `Pending` execution unless one already exists for the same
    /// `(saga_type, request_id)`, in which case that row is returned. The
    /// flag is `true` only when a row was written.
    ///
    /// The pair is a unique key: the lookup and the insert must be one atomic
    /// step (a unique index or an insert-if-absent), so concurrent callers
    /// with the same request id all observe the same execution.
    ///
    /// # Errors
    ///
    /// Returns a `Repository` error when the row cannot be written.
    async fn create_execution(&self, new: NewSagaExecution) -> Result<(SagaExecution, bool)>;

    /// # Errors
    ///
    /// Returns a `Repository` error on storage failure.
    async fn get_execution(&self, id: SagaId) -> Result<Option<SagaExecution>>;

    /// Looks up an execution by its idempotency key.
    ///
    /// # Errors
    ///
    /// Returns a `Repository` error on storage failure.
    async fn find_by_request_id(
        &self,
        saga_type: &str,
        request_id: &str,
    ) -> Result<Option<SagaExecution>>;

    /// Compare-and-swap on the saga status, appending `event` in the same
    /// transaction. Returns `None` when the row is no longer in `change.from`.
    ///
    /// # Errors
    ///
    /// Returns `SagaNotFound` when no row has `id`.
    async fn transition_execution(
        &self,
        id: SagaId,
        change: SagaStatusChange,
        event: NewSagaEvent,
    ) -> Result<Option<Transitioned<SagaExecution>>>;

    /// Writes progress fields without touching the status.
    ///
    /// # Errors
    ///
    /// Returns `SagaNotFound` when no row has `id`.
    async fn update_progress(
        &self,
        id: SagaId,
        current_step: usize,
        context: Payload,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// All executions currently in one of `statuses`.
    ///
    /// # Errors
    ///
    /// Returns a `Repository` error on storage failure.
    async fn find_by_status(&self, statuses: &[SagaStatus]) -> Result<Vec<SagaExecution>>;

    /// Executions in `status` whose `updated_at` is older than `updated_before`.
    ///
    /// # Errors
    ///
    /// Returns a `Repository` error on storage failure.
    async fn find_stale(
        &self,
        status: SagaStatus,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<SagaExecution>>;

    /// # Errors
    ///
    /// Returns a `Repository` error when a row already exists for the same
    /// saga and step index.
    async fn create_step(&self, new: NewStepExecution) -> Result<SagaStepExecution>;

    /// # Errors
    ///
    /// Returns a `Repository` error on storage failure.
    async fn get_step(&self, id: StepExecutionId) -> Result<Option<SagaStepExecution>>;

    /// # Errors
    ///
    /// Returns a `Repository` error on storage failure.
    async fn find_step(
        &self,
        saga_id: SagaId,
        step_index: usize,
    ) -> Result<Option<SagaStepExecution>>;

    /// Steps of one saga ordered by `step_index` ascending.
    ///
    /// # Errors
    ///
    /// Returns a `Repository` error on storage failure.
    async fn list_steps(&self, saga_id: SagaId) -> Result<Vec<SagaStepExecution>>;

    /// Compare-and-swap on the step status, appending `event` atomically.
    /// Returns `None` when the row is no longer in `change.from`.
    ///
    /// # Errors
    ///
    /// Returns `StepNotFound` when no row has `id`.
    async fn transition_step(
        &self,
        id: StepExecutionId,
        change: StepStatusChange,
        event: NewSagaEvent,
    ) -> Result<Option<Transitioned<SagaStepExecution>>>;

    /// # Errors
    ///
    /// Returns `StepNotFound` when no row has `id`.
    async fn record_step_attempt(&self, id: StepExecutionId, attempt_count: u32) -> Result<()>;

    /// Overwrites the step's output and error.
    ///
    /// # Errors
    ///
    /// Returns `StepNotFound` when no row has `id`.
    async fn record_step_result(
        &self,
        id: StepExecutionId,
        output: Option<Payload>,
        error: Option<String>,
    ) -> Result<()>;

    /// # Errors
    ///
    /// Returns a `Repository` error on storage failure.
    async fn append_event(&self, event: NewSagaEvent) -> Result<SagaEvent>;

    /// Events of one saga in insertion order.
    ///
    /// # Errors
    ///
    /// Returns a `Repository` error on storage failure.
    async fn list_events(&self, saga_id: SagaId) -> Result<Vec<SagaEvent>>;
}
