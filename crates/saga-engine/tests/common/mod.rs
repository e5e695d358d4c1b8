#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use saga_core::{Payload, RetryPolicy, SagaId, SagaStatus, StepError};
use saga_engine::{Engine, EngineConfig, SagaStepDefinition};
use saga_store::{InMemorySagaRepository, SagaRepository};

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TestError(pub String);

pub fn failure(message: &str) -> StepError {
    Box::new(TestError(message.to_string()))
}

/// Retry policy with millisecond backoff.
pub fn fast_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::default()
        .with_max_attempts(max_attempts)
        .with_delays(Duration::from_millis(1), Duration::from_millis(5))
}

pub fn config() -> EngineConfig {
    EngineConfig::default().with_default_retry_policy(fast_retries(3))
}

pub fn engine() -> anyhow::Result<(Arc<Engine>, Arc<InMemorySagaRepository>)> {
    let repository = Arc::new(InMemorySagaRepository::new());
    let engine = engine_on(&repository)?;
    Ok((engine, repository))
}

pub fn engine_on(repository: &Arc<InMemorySagaRepository>) -> anyhow::Result<Arc<Engine>> {
    let engine = Engine::new(
        Arc::clone(repository) as Arc<dyn SagaRepository>,
        config(),
    )?;
    Ok(Arc::new(engine))
}

/// Ordered record of the actions steps performed.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().iter().filter(|e| *e == entry).count()
    }
}

/// Records `run <name>` and outputs `{"<name>": true}`.
pub fn recorded_step(name: &'static str, journal: &Journal) -> SagaStepDefinition {
    let journal = journal.clone();
    SagaStepDefinition::new(name, move |_| {
        let journal = journal.clone();
        async move {
            journal.record(format!("run {name}"));
            Ok(Payload::from_raw(format!(r#"{{"{name}":true}}"#)))
        }
    })
}

/// A critical step whose compensation records `undo <name> with <input>`.
pub fn compensable_step(name: &'static str, journal: &Journal) -> SagaStepDefinition {
    let undo_journal = journal.clone();
    recorded_step(name, journal)
        .critical()
        .with_compensation(move |invocation| {
            let journal = undo_journal.clone();
            async move {
                journal.record(format!("undo {name} with {}", invocation.input));
                Ok(())
            }
        })
}

/// Always fails with `message`.
pub fn failing_step(name: &'static str, journal: &Journal, message: &'static str) -> SagaStepDefinition {
    let journal = journal.clone();
    SagaStepDefinition::new(name, move |_| {
        let journal = journal.clone();
        async move {
            journal.record(format!("run {name}"));
            Err(failure(message))
        }
    })
}

/// Polls until the saga reaches `status` or a second passes.
pub async fn wait_for_status(
    engine: &Engine,
    saga_id: SagaId,
    status: SagaStatus,
) -> anyhow::Result<()> {
    for _ in 0..200 {
        if engine.get_saga_status(saga_id).await?.execution.status == status {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    anyhow::bail!("saga {saga_id} never reached {status}")
}

/// Polls until `journal` holds `entry` or a second passes.
pub async fn wait_for_entry(journal: &Journal, entry: &str) -> anyhow::Result<()> {
    for _ in 0..200 {
        if journal.count(entry) > 0 {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    anyhow::bail!("journal never recorded '{entry}'")
}
