//! Core vocabulary of the saga engine.
//!
//! Holds the persisted data model, the saga and step status machines, the
//! retry policy value object and the closed error taxonomy shared by every
//! other crate in the workspace.

pub mod error;
mod payload;
pub mod retry_policy;
pub mod types;

pub use error::{ErrorCode, Result, SagaError, StepError};
pub use payload::Payload;
pub use retry_policy::{DEFAULT_RETRYABLE_ERRORS, RetryPolicy};
pub use types::*;
