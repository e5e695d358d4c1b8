//! Saga orchestration on top of a pluggable repository.
//!
//! A saga is an ordered list of steps, each a forward action with an
//! optional compensating action. The [`Engine`] persists every state change
//! through a [`SagaRepository`](saga_store::SagaRepository) before moving on,
//! so an interrupted saga can be resumed by [`Engine::recover_sagas`]
//! without re-running completed steps.
//!
//! Definitions are either assembled with [`SagaBuilder`] or written by hand
//! against [`SagaDefinition`]:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use saga_core::Payload;
//! use saga_engine::{Engine, EngineConfig, SagaBuilder, SagaStepDefinition};
//! use saga_runtime::ExecutionContext;
//! use saga_store::InMemorySagaRepository;
//!
//! # async fn run() -> saga_core::Result<()> {
//! let engine = Engine::new(Arc::new(InMemorySagaRepository::new()), EngineConfig::default())?;
//! engine.register_definition(Arc::new(
//!     SagaBuilder::new("greeting")
//!         .first_step(SagaStepDefinition::new("say_hello", |_| async {
//!             Ok(Payload::from_raw(r#"{"greeted":true}"#))
//!         }))
//!         .build(),
//! ))?;
//!
//! let ctx = ExecutionContext::new();
//! let execution = engine
//!     .start_saga(&ctx, "greeting", "request-1", Payload::from_raw("{}"))
//!     .await?;
//! assert!(execution.status.is_terminal());
//! # Ok(())
//! # }
//! ```

mod builder;
mod config;
mod definition;
mod engine;
mod report;
mod state;

pub use builder::{Empty, HasSteps, Saga, SagaBuilder};
pub use config::EngineConfig;
pub use definition::{
    CompensateFn, ExecuteFn, SagaDefinition, SagaStepDefinition, StepCondition, StepInvocation,
    StepResult,
};
pub use engine::Engine;
pub use report::{RecoveryOutcome, SagaStatusReport};
pub use state::StateManager;
