//! Persistence boundary of the saga engine.
//!
//! The engine talks to storage only through [`SagaRepository`]. An in-memory
//! implementation is provided for embedding and tests.

mod memory;
mod repository;

pub use memory::InMemorySagaRepository;
pub use repository::{SagaRepository, SagaStatusChange, StepStatusChange, Transitioned};
