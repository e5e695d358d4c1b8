//! Integration tests for forward saga execution.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use common::{
    Journal, config, engine, failing_step, failure, recorded_step, wait_for_entry,
    wait_for_status,
};
use saga_core::{ErrorCode, Payload, RetryPolicy, SagaError, SagaStatus, StepStatus};
use saga_engine::{Engine, Saga, SagaBuilder, SagaStepDefinition, StepInvocation, StepResult};
use saga_runtime::{ExecutionContext, Submission};
use saga_store::{InMemorySagaRepository, SagaRepository};
use serde_json::{Value, json};

async fn charge(invocation: StepInvocation, journal: Journal) -> StepResult<Payload> {
    let context: Value = invocation.saga_context.decode()?;
    journal.record("run charge");
    Ok(Payload::encode(&json!({
        "charged": context["amount"],
        "after_reserve": context["reserve"],
    }))?)
}

fn reserve_then_charge(journal: &Journal) -> Saga {
    let charge_journal = journal.clone();
    SagaBuilder::new("order")
        .first_step(recorded_step("reserve", journal))
        .then(SagaStepDefinition::new("charge", move |invocation| {
            charge(invocation, charge_journal.clone())
        }))
        .build()
}

#[tokio::test]
async fn completed_saga_threads_context_through_steps() -> anyhow::Result<()> {
    let (engine, _) = engine()?;
    let journal = Journal::default();
    engine.register_definition(Arc::new(reserve_then_charge(&journal)))?;

    let ctx = ExecutionContext::new();
    let execution = engine
        .start_saga(&ctx, "order", "req-1", Payload::from_raw(r#"{"amount":42}"#))
        .await?;

    assert_eq!(execution.status, SagaStatus::Completed);
    assert_eq!(execution.current_step, 2);
    assert!(execution.completed_at.is_some());
    let context: Value = execution.context.decode()?;
    assert_eq!(context["amount"], json!(42));
    assert_eq!(context["reserve"], json!(true));
    assert_eq!(context["charged"], json!(42));
    assert_eq!(context["after_reserve"], json!(true));
    assert_eq!(journal.entries(), vec!["run reserve", "run charge"]);

    let report = engine.get_saga_status(execution.id).await?;
    assert_eq!(report.steps.len(), 2);
    assert!(report.steps.iter().all(|s| s.status == StepStatus::Completed));
    assert!(report.steps.iter().all(|s| s.attempt_count == 1));
    Ok(())
}

#[tokio::test]
async fn repeated_request_returns_first_execution() -> anyhow::Result<()> {
    let (engine, _) = engine()?;
    let journal = Journal::default();
    engine.register_definition(Arc::new(reserve_then_charge(&journal)))?;

    let ctx = ExecutionContext::new();
    let first = engine
        .start_saga(&ctx, "order", "req-1", Payload::from_raw(r#"{"amount":1}"#))
        .await?;
    let second = engine
        .start_saga(&ctx, "order", "req-1", Payload::from_raw(r#"{"amount":1}"#))
        .await?;

    assert_eq!(first.id, second.id);
    assert_eq!(second.status, SagaStatus::Completed);
    assert_eq!(journal.count("run reserve"), 1);
    assert_eq!(journal.count("run charge"), 1);
    Ok(())
}

#[tokio::test]
async fn registry_rejects_unknown_and_duplicate_types() -> anyhow::Result<()> {
    let (engine, _) = engine()?;
    let journal = Journal::default();
    let ctx = ExecutionContext::new();

    let err = engine
        .create_saga(&ctx, "order", "req-1", Payload::empty())
        .await
        .expect_err("nothing registered");
    assert_eq!(err.code(), ErrorCode::DefinitionNotFound);

    engine.register_definition(Arc::new(reserve_then_charge(&journal)))?;
    let err = engine
        .register_definition(Arc::new(reserve_then_charge(&journal)))
        .expect_err("registered twice");
    assert_eq!(err.code(), ErrorCode::DefinitionExists);
    Ok(())
}

#[tokio::test]
async fn invalid_context_is_rejected_before_anything_is_stored() -> anyhow::Result<()> {
    let (engine, repository) = engine()?;
    let journal = Journal::default();
    engine.register_definition(Arc::new(
        SagaBuilder::new("order")
            .first_step(recorded_step("reserve", &journal))
            .validate_with(|context| {
                if context.as_str().contains("amount") {
                    Ok(())
                } else {
                    Err(SagaError::new(ErrorCode::InvalidContext, "amount is required"))
                }
            })
            .build(),
    ))?;

    let ctx = ExecutionContext::new();
    let err = engine
        .start_saga(&ctx, "order", "req-1", Payload::empty())
        .await
        .expect_err("context lacks amount");
    assert_eq!(err.code(), ErrorCode::InvalidContext);

    let stored = repository.find_by_request_id("order", "req-1").await?;
    assert!(stored.is_none());
    assert!(journal.entries().is_empty());
    Ok(())
}

#[tokio::test]
async fn second_driver_fails_to_lock_running_saga() -> anyhow::Result<()> {
    let (engine, _) = engine()?;
    let journal = Journal::default();
    let slow_journal = journal.clone();
    engine.register_definition(Arc::new(
        SagaBuilder::new("slow")
            .first_step(SagaStepDefinition::new("wait", move |_| {
                let journal = slow_journal.clone();
                async move {
                    journal.record("run wait");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(Payload::empty())
                }
            }))
            .build(),
    ))?;

    let ctx = ExecutionContext::new();
    let saga = engine.create_saga(&ctx, "slow", "req-1", Payload::empty()).await?;
    let (first, second) = tokio::join!(
        engine.execute_saga(&ctx, saga.id),
        engine.execute_saga(&ctx, saga.id)
    );

    let outcomes = [first, second];
    let completed = outcomes.iter().filter(|r| r.is_ok()).count();
    let locked_out = outcomes
        .iter()
        .filter(|r| matches!(r, Err(e) if e.code() == ErrorCode::SagaLockFailed))
        .count();
    assert_eq!(completed, 1);
    assert_eq!(locked_out, 1);
    assert_eq!(journal.count("run wait"), 1);
    Ok(())
}

/// Engine whose saga locks expire after 30ms unless extended.
fn short_lease_engine() -> anyhow::Result<Arc<Engine>> {
    let repository: Arc<dyn SagaRepository> = Arc::new(InMemorySagaRepository::new());
    let engine = Engine::new(repository, config().with_lock_ttl(Duration::from_millis(30)))?;
    Ok(Arc::new(engine))
}

#[tokio::test]
async fn lock_outlives_its_ttl_while_a_step_retries() -> anyhow::Result<()> {
    let engine = short_lease_engine()?;
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let retries = RetryPolicy::default()
        .with_max_attempts(4)
        .with_delays(Duration::from_millis(40), Duration::from_millis(40));
    engine.register_definition(Arc::new(
        SagaBuilder::new("sync")
            .first_step(
                SagaStepDefinition::new("upload", move |_| {
                    let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if call <= 3 {
                            Err(failure("connection refused"))
                        } else {
                            Ok(Payload::empty())
                        }
                    }
                })
                .with_retry_policy(retries),
            )
            .build(),
    ))?;

    let ctx = ExecutionContext::new();
    let saga = engine.create_saga(&ctx, "sync", "req-1", Payload::empty()).await?;
    let driver = {
        let engine = Arc::clone(&engine);
        let saga_id = saga.id;
        tokio::spawn(async move { engine.execute_saga(&ExecutionContext::new(), saga_id).await })
    };
    tokio::time::sleep(Duration::from_millis(60)).await;

    let err = engine
        .execute_saga(&ctx, saga.id)
        .await
        .expect_err("first driver still holds the saga");
    assert_eq!(err.code(), ErrorCode::SagaLockFailed);

    let execution = driver.await??;
    assert_eq!(execution.status, SagaStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    Ok(())
}

#[tokio::test]
async fn lock_outlives_its_ttl_during_slow_compensation() -> anyhow::Result<()> {
    let engine = short_lease_engine()?;
    let journal = Journal::default();
    let undo_journal = journal.clone();
    engine.register_definition(Arc::new(
        SagaBuilder::new("import")
            .first_step(recorded_step("stage", &journal).critical().with_compensation(
                move |_| {
                    let journal = undo_journal.clone();
                    async move {
                        journal.record("undo stage");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(())
                    }
                },
            ))
            .then(failing_step("load", &journal, "schema mismatch"))
            .build(),
    ))?;

    let ctx = ExecutionContext::new();
    let saga = engine.create_saga(&ctx, "import", "req-1", Payload::empty()).await?;
    let driver = {
        let engine = Arc::clone(&engine);
        let saga_id = saga.id;
        tokio::spawn(async move { engine.execute_saga(&ExecutionContext::new(), saga_id).await })
    };
    wait_for_entry(&journal, "undo stage").await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = engine
        .compensate_saga(&ctx, saga.id)
        .await
        .expect_err("rollback still in progress");
    assert_eq!(err.code(), ErrorCode::SagaLockFailed);

    let err = driver.await?.expect_err("load failed");
    assert_eq!(err.code(), ErrorCode::StepExecutionFailed);
    assert_eq!(
        engine.get_saga_status(saga.id).await?.execution.status,
        SagaStatus::Compensated
    );
    assert_eq!(journal.count("undo stage"), 1);
    Ok(())
}

#[tokio::test]
async fn finished_saga_is_not_executed_again() -> anyhow::Result<()> {
    let (engine, _) = engine()?;
    let journal = Journal::default();
    engine.register_definition(Arc::new(reserve_then_charge(&journal)))?;

    let ctx = ExecutionContext::new();
    let execution = engine
        .start_saga(&ctx, "order", "req-1", Payload::from_raw(r#"{"amount":1}"#))
        .await?;
    let err = engine
        .execute_saga(&ctx, execution.id)
        .await
        .expect_err("already completed");
    assert_eq!(err.code(), ErrorCode::SagaAlreadyCompleted);
    assert_eq!(journal.count("run reserve"), 1);
    Ok(())
}

#[tokio::test]
async fn background_execution_completes() -> anyhow::Result<()> {
    let (engine, _) = engine()?;
    let journal = Journal::default();
    engine.register_definition(Arc::new(reserve_then_charge(&journal)))?;

    let ctx = ExecutionContext::new();
    let saga = engine
        .create_saga(&ctx, "order", "req-1", Payload::from_raw(r#"{"amount":7}"#))
        .await?;
    assert_eq!(engine.spawn_execution(saga.id), Submission::Queued);

    wait_for_status(&engine, saga.id, SagaStatus::Completed).await?;
    assert_eq!(journal.entries(), vec!["run reserve", "run charge"]);
    Ok(())
}

#[tokio::test]
async fn shut_down_engine_rejects_work() -> anyhow::Result<()> {
    let (engine, _) = engine()?;
    let journal = Journal::default();
    engine.register_definition(Arc::new(reserve_then_charge(&journal)))?;

    engine.shutdown().await;
    assert!(!engine.is_running());

    let ctx = ExecutionContext::new();
    let err = engine
        .start_saga(&ctx, "order", "req-1", Payload::empty())
        .await
        .expect_err("engine stopped");
    assert_eq!(err.code(), ErrorCode::EngineNotInitialized);
    Ok(())
}

#[tokio::test]
async fn racing_status_writers_have_one_winner() -> anyhow::Result<()> {
    let (engine, _) = engine()?;
    let journal = Journal::default();
    engine.register_definition(Arc::new(reserve_then_charge(&journal)))?;

    let ctx = ExecutionContext::new();
    let saga = engine.create_saga(&ctx, "order", "req-1", Payload::empty()).await?;
    let state = engine.state();
    let (first, second) = tokio::join!(
        state.transition_saga_status(saga.id, SagaStatus::Pending, SagaStatus::Running, "a"),
        state.transition_saga_status(saga.id, SagaStatus::Pending, SagaStatus::Running, "b")
    );

    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        outcomes
            .iter()
            .any(|r| matches!(r, Err(e) if e.code() == ErrorCode::StateConflict))
    );
    Ok(())
}
