use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::SagaId;

/// Boxed error returned by integrator-supplied step functions.
pub type StepError = Box<dyn StdError + Send + Sync + 'static>;

pub type Result<T, E = SagaError> = std::result::Result<T, E>;

/// Closed set of failure kinds the engine can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ErrorCode {
    /// Engine used before it was built.
    EngineNotInitialized,
    /// No definition registered for the saga type.
    DefinitionNotFound,
    /// A definition with the same type is already registered.
    DefinitionExists,

    /// No execution row for the id.
    SagaNotFound,
    /// Execution is already being driven.
    SagaAlreadyRunning,
    /// Execution reached a terminal status.
    SagaAlreadyCompleted,
    /// Advisory lock could not be acquired or was lost.
    SagaLockFailed,
    /// Saga exceeded its deadline.
    SagaTimeout,
    /// Saga was cancelled.
    SagaCancelled,

    /// No step at the requested index.
    StepNotFound,
    /// Step function returned an error.
    StepExecutionFailed,
    /// Compensation function returned an error.
    StepCompensationFailed,
    /// Step attempt exceeded its timeout.
    StepTimeout,
    /// Step precondition was not met.
    StepPrerequisiteFailed,

    /// Requested status change is not allowed.
    InvalidStateTransition,
    /// Record changed status concurrently.
    StateConflict,

    /// Step failed on every allowed attempt.
    MaxRetriesExceeded,
    /// Saga must be compensated before it can finish.
    CompensationRequired,
    /// A completed step cannot be undone.
    CompensationImpossible,

    /// Saga context failed validation.
    InvalidContext,
    /// Caller input failed validation.
    InvalidInput,
    /// Value could not be encoded.
    SerializationFailed,
    /// Value could not be decoded.
    DeserializationFailed,

    /// Failure inside the persistence adapter.
    Repository,
}

impl ErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EngineNotInitialized => "ENGINE_NOT_INITIALIZED",
            Self::DefinitionNotFound => "DEFINITION_NOT_FOUND",
            Self::DefinitionExists => "DEFINITION_EXISTS",
            Self::SagaNotFound => "SAGA_NOT_FOUND",
            Self::SagaAlreadyRunning => "SAGA_ALREADY_RUNNING",
            Self::SagaAlreadyCompleted => "SAGA_ALREADY_COMPLETED",
            Self::SagaLockFailed => "SAGA_LOCK_FAILED",
            Self::SagaTimeout => "SAGA_TIMEOUT",
            Self::SagaCancelled => "SAGA_CANCELLED",
            Self::StepNotFound => "STEP_NOT_FOUND",
            Self::StepExecutionFailed => "STEP_EXECUTION_FAILED",
            Self::StepCompensationFailed => "STEP_COMPENSATION_FAILED",
            Self::StepTimeout => "STEP_TIMEOUT",
            Self::StepPrerequisiteFailed => "STEP_PREREQUISITE_FAILED",
            Self::InvalidStateTransition => "INVALID_STATE_TRANSITION",
            Self::StateConflict => "STATE_CONFLICT",
            Self::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
            Self::CompensationRequired => "COMPENSATION_REQUIRED",
            Self::CompensationImpossible => "COMPENSATION_IMPOSSIBLE",
            Self::InvalidContext => "INVALID_CONTEXT",
            Self::InvalidInput => "INVALID_INPUT",
            Self::SerializationFailed => "SERIALIZATION_FAILED",
            Self::DeserializationFailed => "DESERIALIZATION_FAILED",
            Self::Repository => "REPOSITORY",
        }
    }

    /// Structured retry classification.
    ///
    /// Timeouts and contention are transient. Validation, data and
    /// compensation kinds are never retried.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::StepTimeout | Self::SagaLockFailed | Self::StateConflict | Self::Repository
        )
    }

    /// Codes that retrying can never fix.
    #[must_use]
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            Self::InvalidContext
                | Self::InvalidInput
                | Self::SerializationFailed
                | Self::DeserializationFailed
                | Self::CompensationImpossible
                | Self::CompensationRequired
                | Self::StepPrerequisiteFailed
                | Self::InvalidStateTransition
                | Self::DefinitionNotFound
                | Self::SagaTimeout
                | Self::SagaCancelled
        )
    }

    /// Codes raised when a deadline elapsed.
    #[must_use]
    pub fn is_timeout(self) -> bool {
        matches!(self, Self::StepTimeout | Self::SagaTimeout)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error raised by any layer of the saga engine.
///
/// Carries the saga and step it concerns, when known, and optionally the
/// underlying cause so callers can walk the chain with [`StdError::source`].
#[derive(Debug, Error)]
#[error("[{code}] {message}{}", location(.saga_id, .step_index))]
pub struct SagaError {
    code: ErrorCode,
    message: String,
    saga_id: Option<SagaId>,
    step_index: Option<usize>,
    #[source]
    source: Option<StepError>,
}

fn location(saga_id: &Option<SagaId>, step_index: &Option<usize>) -> String {
    match (saga_id, step_index) {
        (Some(id), Some(index)) => format!(" (saga {id}, step {index})"),
        (Some(id), None) => format!(" (saga {id})"),
        (None, Some(index)) => format!(" (step {index})"),
        (None, None) => String::new(),
    }
}

impl SagaError {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            saga_id: None,
            step_index: None,
            source: None,
        }
    }

    #[must_use]
    pub fn with_saga(mut self, saga_id: SagaId) -> Self {
        self.saga_id = Some(saga_id);
        self
    }

    #[must_use]
    pub fn with_step(mut self, step_index: usize) -> Self {
        self.step_index = Some(step_index);
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<StepError>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn saga_id(&self) -> Option<SagaId> {
        self.saga_id
    }

    #[must_use]
    pub fn step_index(&self) -> Option<usize> {
        self.step_index
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.code.is_timeout()
    }

    /// Walks the source chain looking for the first [`SagaError`] with `code`.
    #[must_use]
    pub fn find_in_chain(err: &(dyn StdError + 'static), code: ErrorCode) -> bool {
        let mut current: Option<&(dyn StdError + 'static)> = Some(err);
        while let Some(e) = current {
            if e.downcast_ref::<SagaError>()
                .is_some_and(|saga_err| saga_err.code == code)
            {
                return true;
            }
            current = e.source();
        }
        false
    }

    #[must_use]
    pub fn saga_not_found(saga_id: SagaId) -> Self {
        Self::new(ErrorCode::SagaNotFound, "saga execution not found").with_saga(saga_id)
    }

    #[must_use]
    pub fn definition_not_found(saga_type: &str) -> Self {
        Self::new(
            ErrorCode::DefinitionNotFound,
            format!("no saga definition registered for type '{saga_type}'"),
        )
    }

    #[must_use]
    pub fn invalid_transition(from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("illegal transition from {from} to {to}"),
        )
    }

    #[must_use]
    pub fn state_conflict(expected: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::StateConflict,
            format!("record is no longer in state {expected}"),
        )
    }

    #[must_use]
    pub fn repository(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Repository, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("disk on fire")]
    struct Underlying;

    #[test]
    fn display_includes_code_and_location() {
        let err = SagaError::new(ErrorCode::StepExecutionFailed, "upload failed")
            .with_saga(SagaId(7))
            .with_step(2);

        assert_eq!(
            err.to_string(),
            "[STEP_EXECUTION_FAILED] upload failed (saga 7, step 2)"
        );
    }

    #[test]
    fn display_omits_unknown_location() {
        let err = SagaError::definition_not_found("file_upload");
        assert_eq!(
            err.to_string(),
            "[DEFINITION_NOT_FOUND] no saga definition registered for type 'file_upload'"
        );
        assert_eq!(err.saga_id(), None);
        assert_eq!(err.step_index(), None);
    }

    #[test]
    fn source_is_exposed_for_chained_inspection() {
        let err = SagaError::new(ErrorCode::StepExecutionFailed, "wrapped").with_source(Underlying);

        let source = err.source().expect("source should be set");
        assert_eq!(source.to_string(), "disk on fire");
    }

    #[test]
    fn timeouts_are_retryable_but_validation_is_not() {
        assert!(ErrorCode::StepTimeout.is_retryable());
        assert!(!ErrorCode::InvalidInput.is_retryable());
        assert!(!ErrorCode::InvalidContext.is_retryable());
        assert!(!ErrorCode::CompensationImpossible.is_retryable());
        assert!(!ErrorCode::SagaTimeout.is_retryable());
    }

    #[test]
    fn shorthand_constructors_carry_their_codes() {
        let cases = [
            (SagaError::saga_not_found(SagaId(3)), ErrorCode::SagaNotFound),
            (SagaError::definition_not_found("order"), ErrorCode::DefinitionNotFound),
            (
                SagaError::invalid_transition("pending", "completed"),
                ErrorCode::InvalidStateTransition,
            ),
            (SagaError::state_conflict("running"), ErrorCode::StateConflict),
            (SagaError::repository("row vanished"), ErrorCode::Repository),
        ];
        for (err, code) in cases {
            assert_eq!(err.code(), code);
        }
        assert_eq!(SagaError::saga_not_found(SagaId(3)).saga_id(), Some(SagaId(3)));
    }

    #[test]
    fn find_in_chain_matches_nested_codes() {
        let inner = SagaError::new(ErrorCode::StepTimeout, "slow");
        let outer = SagaError::new(ErrorCode::MaxRetriesExceeded, "gave up").with_source(inner);

        assert!(SagaError::find_in_chain(&outer, ErrorCode::StepTimeout));
        assert!(SagaError::find_in_chain(&outer, ErrorCode::MaxRetriesExceeded));
        assert!(!SagaError::find_in_chain(&outer, ErrorCode::SagaTimeout));
    }
}
