use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::payload::Payload;

/// Surrogate key of a saga execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SagaId(pub i64);

impl SagaId {
    /// Key used for the per-execution advisory lock.
    #[must_use]
    pub fn lock_key(self) -> String {
        format!("saga:{}", self.0)
    }
}

impl fmt::Display for SagaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Surrogate key of a step execution row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepExecutionId(pub i64);

impl fmt::Display for StepExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a saga execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// Created, no step has run yet.
    Pending,
    /// Steps are being executed.
    Running,
    /// Every step succeeded.
    Completed,
    /// Completed steps are being undone.
    Compensating,
    /// Every completed step was undone.
    Compensated,
    /// Stopped on an unrecoverable error.
    Failed,
    /// Stopped on request.
    Cancelled,
    /// Exceeded its deadline; awaiting compensation or failure.
    Timeout,
}

impl SagaStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Compensating => "compensating",
            Self::Compensated => "compensated",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }

    /// Terminal statuses never change again and carry a completion time.
    ///
    /// `Timeout` is not terminal: an operator may still compensate or fail it.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Compensated | Self::Failed | Self::Cancelled
        )
    }

    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Running | Self::Cancelled)
                | (
                    Self::Running,
                    Self::Completed
                        | Self::Compensating
                        | Self::Failed
                        | Self::Timeout
                        | Self::Cancelled
                )
                | (Self::Compensating, Self::Compensated | Self::Failed)
                | (Self::Timeout, Self::Compensating | Self::Failed)
        )
    }
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of one step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Recorded but not started.
    Pending,
    /// Attempt in progress.
    Running,
    /// Step executed successfully.
    Completed,
    /// Last attempt failed.
    Failed,
    /// Waiting for the next attempt.
    Retrying,
    /// Compensation in progress.
    Compensating,
    /// Compensation finished.
    Compensated,
    /// Not run because a precondition excluded it.
    Skipped,
}

impl StepStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Compensating => "compensating",
            Self::Compensated => "compensated",
            Self::Skipped => "skipped",
        }
    }

    /// `Completed → Compensating` is the only way back out of a finished step.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Running | Self::Skipped)
                | (Self::Running, Self::Completed | Self::Failed)
                | (Self::Failed, Self::Retrying | Self::Compensating)
                | (Self::Retrying, Self::Running | Self::Compensating)
                | (Self::Compensating, Self::Compensated)
                | (Self::Completed, Self::Compensating)
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt at a business transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaExecution {
    pub id: SagaId,
    /// Name of the registered definition.
    pub saga_type: String,
    /// Caller-supplied idempotency key.
    pub request_id: String,
    pub status: SagaStatus,
    /// Index of the next step to run.
    pub current_step: usize,
    pub total_steps: usize,
    /// Opaque input shared by every step.
    pub context: Payload,
    /// Message of the error that stopped the run.
    pub error: Option<String>,
    pub error_code: Option<ErrorCode>,
    /// First compensation failure, if any.
    pub compensation_error: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Set once the status is terminal.
    pub completed_at: Option<DateTime<Utc>>,
    /// Touched on every write; drives stale detection.
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when persisting a new execution; the repository assigns the id.
#[derive(Debug, Clone)]
pub struct NewSagaExecution {
    /// Name of the registered definition.
    pub saga_type: String,
    /// Idempotency key, unique per `saga_type`.
    pub request_id: String,
    pub total_steps: usize,
    /// Opaque input shared by every step.
    pub context: Payload,
}

/// Persisted record of one step within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStepExecution {
    pub id: StepExecutionId,
    /// Owning saga.
    pub saga_execution_id: SagaId,
    pub step_name: String,
    /// Position in the definition, starting at 0.
    pub step_index: usize,
    pub status: StepStatus,
    pub input: Payload,
    /// Result of the last successful attempt.
    pub output: Option<Payload>,
    /// Message of the last failed attempt.
    pub error: Option<String>,
    /// Attempts made so far.
    pub attempt_count: u32,
    pub max_retries: u32,
    /// When the next attempt is due while `Retrying`.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub compensated_at: Option<DateTime<Utc>>,
}

/// Fields supplied when persisting a new step row.
#[derive(Debug, Clone)]
pub struct NewStepExecution {
    /// Owning saga.
    pub saga_execution_id: SagaId,
    pub step_name: String,
    /// Position in the definition, starting at 0.
    pub step_index: usize,
    pub input: Payload,
    pub max_retries: u32,
}

/// Lifecycle tag of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaEventType {
    /// Execution row written.
    SagaCreated,
    /// Saga moved to `Running`.
    SagaStarted,
    /// Every step succeeded.
    SagaCompleted,
    /// Compensation began.
    SagaCompensating,
    /// Compensation finished.
    SagaCompensated,
    /// Saga moved to `Failed`.
    SagaFailed,
    /// Saga was cancelled.
    SagaCancelled,
    /// Saga exceeded its deadline.
    SagaTimedOut,
    /// Step attempt began.
    StepStarted,
    /// Step executed successfully.
    StepCompleted,
    /// Step attempt failed.
    StepFailed,
    /// Step scheduled for another attempt.
    StepRetrying,
    /// Step compensation began.
    StepCompensating,
    /// Step compensation finished.
    StepCompensated,
    /// Step was skipped.
    StepSkipped,
}

impl SagaEventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SagaCreated => "saga.created",
            Self::SagaStarted => "saga.started",
            Self::SagaCompleted => "saga.completed",
            Self::SagaCompensating => "saga.compensating",
            Self::SagaCompensated => "saga.compensated",
            Self::SagaFailed => "saga.failed",
            Self::SagaCancelled => "saga.cancelled",
            Self::SagaTimedOut => "saga.timed_out",
            Self::StepStarted => "step.started",
            Self::StepCompleted => "step.completed",
            Self::StepFailed => "step.failed",
            Self::StepRetrying => "step.retrying",
            Self::StepCompensating => "step.compensating",
            Self::StepCompensated => "step.compensated",
            Self::StepSkipped => "step.skipped",
        }
    }

    /// Event emitted when a saga enters `status`.
    #[must_use]
    pub fn for_saga_status(status: SagaStatus) -> Self {
        match status {
            SagaStatus::Pending => Self::SagaCreated,
            SagaStatus::Running => Self::SagaStarted,
            SagaStatus::Completed => Self::SagaCompleted,
            SagaStatus::Compensating => Self::SagaCompensating,
            SagaStatus::Compensated => Self::SagaCompensated,
            SagaStatus::Failed => Self::SagaFailed,
            SagaStatus::Cancelled => Self::SagaCancelled,
            SagaStatus::Timeout => Self::SagaTimedOut,
        }
    }

    /// Event emitted when a step enters `status`.
    #[must_use]
    pub fn for_step_status(status: StepStatus) -> Self {
        match status {
            StepStatus::Pending | StepStatus::Running => Self::StepStarted,
            StepStatus::Completed => Self::StepCompleted,
            StepStatus::Failed => Self::StepFailed,
            StepStatus::Retrying => Self::StepRetrying,
            StepStatus::Compensating => Self::StepCompensating,
            StepStatus::Compensated => Self::StepCompensated,
            StepStatus::Skipped => Self::StepSkipped,
        }
    }
}

impl fmt::Display for SagaEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit record. Written once per transition, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaEvent {
    /// Monotonic per repository.
    pub id: i64,
    pub saga_execution_id: SagaId,
    pub event_type: SagaEventType,
    /// Set for step events.
    pub step_name: Option<String>,
    /// Set for step events.
    pub step_index: Option<usize>,
    /// Free-form JSON detail.
    pub event_data: serde_json::Value,
    /// Correlates the event with the request that caused it.
    pub trace_id: String,
    pub created_at: DateTime<Utc>,
}

/// Event fields supplied on append; the repository assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct NewSagaEvent {
    pub saga_execution_id: SagaId,
    pub event_type: SagaEventType,
    /// Set for step events.
    pub step_name: Option<String>,
    /// Set for step events.
    pub step_index: Option<usize>,
    /// Free-form JSON detail.
    pub event_data: serde_json::Value,
    pub trace_id: String,
}

impl NewSagaEvent {
    #[must_use]
    pub fn saga(saga_execution_id: SagaId, event_type: SagaEventType, trace_id: &str) -> Self {
        Self {
            saga_execution_id,
            event_type,
            step_name: None,
            step_index: None,
            event_data: serde_json::Value::Null,
            trace_id: trace_id.to_string(),
        }
    }

    #[must_use]
    pub fn step(
        saga_execution_id: SagaId,
        event_type: SagaEventType,
        step_name: &str,
        step_index: usize,
        trace_id: &str,
    ) -> Self {
        Self {
            saga_execution_id,
            event_type,
            step_name: Some(step_name.to_string()),
            step_index: Some(step_index),
            event_data: serde_json::Value::Null,
            trace_id: trace_id.to_string(),
        }
    }

    #[must_use]
    pub fn with_data(mut self, event_data: serde_json::Value) -> Self {
        self.event_data = event_data;
        self
    }
}
