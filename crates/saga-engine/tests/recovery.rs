//! Integration tests for resuming sagas left behind by a crashed driver.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{Journal, compensable_step, engine, recorded_step};
use saga_core::{
    ErrorCode, NewStepExecution, Payload, SagaId, SagaStatus, SagaStepExecution, StepStatus,
};
use saga_engine::{Engine, SagaBuilder, SagaStepDefinition};
use saga_runtime::{ExecutionContext, LockHandle};
use serde_json::{Value, json};

const TRACE: &str = "crashed-driver";

async fn running_saga(engine: &Engine, context: Payload) -> anyhow::Result<SagaId> {
    let ctx = ExecutionContext::new();
    let saga = engine.create_saga(&ctx, "order", "req-1", context).await?;
    engine
        .state()
        .transition_saga_status(saga.id, SagaStatus::Pending, SagaStatus::Running, TRACE)
        .await?;
    Ok(saga.id)
}

async fn started_step(
    engine: &Engine,
    saga_id: SagaId,
    index: usize,
    name: &str,
) -> anyhow::Result<SagaStepExecution> {
    let state = engine.state();
    let step = state
        .get_or_create_step(NewStepExecution {
            saga_execution_id: saga_id,
            step_name: name.to_string(),
            step_index: index,
            input: Payload::empty(),
            max_retries: 3,
        })
        .await?;
    let step = state
        .transition_step_status(&step, StepStatus::Running, TRACE)
        .await?;
    state.record_step_attempt(step.id, 1).await?;
    Ok(step)
}

fn two_step_order(journal: &Journal, second: SagaStepDefinition) -> Arc<saga_engine::Saga> {
    Arc::new(
        SagaBuilder::new("order")
            .first_step(recorded_step("reserve", journal))
            .then(second)
            .build(),
    )
}

#[tokio::test]
async fn completed_step_is_not_run_again() -> anyhow::Result<()> {
    let (engine, _) = engine()?;
    let journal = Journal::default();
    let seen = Journal::default();
    let seen_by_charge = seen.clone();
    engine.register_definition(two_step_order(
        &journal,
        SagaStepDefinition::new("charge", move |invocation| {
            let seen = seen_by_charge.clone();
            async move {
                seen.record(invocation.saga_context.to_string());
                Ok(Payload::empty())
            }
        }),
    ))?;

    // The driver finished step 0 but died before recording progress.
    let saga_id = running_saga(&engine, Payload::from_raw(r#"{"order":7}"#)).await?;
    let reserve = started_step(&engine, saga_id, 0, "reserve").await?;
    engine
        .state()
        .record_step_result(reserve.id, Some(Payload::from_raw(r#"{"reserve":true}"#)), None)
        .await?;
    engine
        .state()
        .transition_step_status(&reserve, StepStatus::Completed, TRACE)
        .await?;

    let ctx = ExecutionContext::new();
    let outcomes = engine.recover_sagas(&ctx).await?;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].saga_id, saga_id);
    assert!(outcomes[0].result.is_ok());

    assert!(journal.entries().is_empty());
    let contexts = seen.entries();
    assert_eq!(contexts.len(), 1);
    let context: Value = serde_json::from_str(&contexts[0])?;
    assert_eq!(context, json!({"order": 7, "reserve": true}));

    let report = engine.get_saga_status(saga_id).await?;
    assert_eq!(report.execution.status, SagaStatus::Completed);
    assert_eq!(report.step(0).map(|s| s.attempt_count), Some(1));
    Ok(())
}

#[tokio::test]
async fn interrupted_idempotent_step_is_run_again() -> anyhow::Result<()> {
    let (engine, _) = engine()?;
    let journal = Journal::default();
    engine.register_definition(two_step_order(
        &journal,
        recorded_step("charge", &journal).idempotent(),
    ))?;

    let saga_id = running_saga(&engine, Payload::empty()).await?;
    let reserve = started_step(&engine, saga_id, 0, "reserve").await?;
    engine
        .state()
        .transition_step_status(&reserve, StepStatus::Completed, TRACE)
        .await?;
    engine
        .state()
        .update_saga_progress(saga_id, 1, Payload::empty())
        .await?;
    started_step(&engine, saga_id, 1, "charge").await?;

    let ctx = ExecutionContext::new();
    let execution = engine.execute_saga(&ctx, saga_id).await?;
    assert_eq!(execution.status, SagaStatus::Completed);
    assert_eq!(journal.entries(), vec!["run charge"]);

    let report = engine.get_saga_status(saga_id).await?;
    assert_eq!(report.step(1).map(|s| s.attempt_count), Some(2));
    Ok(())
}

#[tokio::test]
async fn interrupted_non_idempotent_step_fails_the_saga() -> anyhow::Result<()> {
    let (engine, _) = engine()?;
    let journal = Journal::default();
    engine.register_definition(two_step_order(&journal, recorded_step("charge", &journal)))?;

    let saga_id = running_saga(&engine, Payload::empty()).await?;
    started_step(&engine, saga_id, 0, "reserve").await?;

    let ctx = ExecutionContext::new();
    let err = engine
        .execute_saga(&ctx, saga_id)
        .await
        .expect_err("outcome of reserve is unknown");
    assert_eq!(err.code(), ErrorCode::StepExecutionFailed);
    assert!(journal.entries().is_empty());

    let report = engine.get_saga_status(saga_id).await?;
    assert_eq!(report.execution.status, SagaStatus::Failed);
    let reserve = report.step(0).expect("reserve row");
    assert_eq!(reserve.status, StepStatus::Failed);
    assert!(
        reserve
            .error
            .as_deref()
            .is_some_and(|e| e.contains("interrupted"))
    );
    Ok(())
}

#[tokio::test]
async fn interrupted_compensation_is_finished() -> anyhow::Result<()> {
    let (engine, _) = engine()?;
    let journal = Journal::default();
    engine.register_definition(Arc::new(
        SagaBuilder::new("order")
            .first_step(compensable_step("reserve", &journal))
            .then(compensable_step("charge", &journal))
            .build(),
    ))?;

    let saga_id = running_saga(&engine, Payload::empty()).await?;
    let reserve = started_step(&engine, saga_id, 0, "reserve").await?;
    engine
        .state()
        .transition_step_status(&reserve, StepStatus::Completed, TRACE)
        .await?;
    engine
        .state()
        .transition_saga_status(saga_id, SagaStatus::Running, SagaStatus::Compensating, TRACE)
        .await?;

    let ctx = ExecutionContext::new();
    let outcomes = engine.recover_sagas(&ctx).await?;
    assert_eq!(outcomes.len(), 1);
    let execution = outcomes[0].result.as_ref().map_err(|e| anyhow::anyhow!("{e}"))?;
    assert_eq!(execution.status, SagaStatus::Compensated);
    assert_eq!(journal.entries(), vec!["undo reserve with {}"]);
    Ok(())
}

#[tokio::test]
async fn stale_pending_saga_is_started() -> anyhow::Result<()> {
    let (engine, repository) = engine()?;
    let journal = Journal::default();
    engine.register_definition(two_step_order(&journal, recorded_step("charge", &journal)))?;

    let ctx = ExecutionContext::new();
    let fresh = engine.create_saga(&ctx, "order", "fresh", Payload::empty()).await?;
    let stale = engine.create_saga(&ctx, "order", "stale", Payload::empty()).await?;
    repository.backdate(stale.id, Utc::now() - chrono::Duration::minutes(10))?;

    let outcomes = engine.recover_sagas(&ctx).await?;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].saga_id, stale.id);
    assert_eq!(
        engine.get_saga_status(fresh.id).await?.execution.status,
        SagaStatus::Pending
    );
    assert_eq!(journal.entries(), vec!["run reserve", "run charge"]);
    Ok(())
}

#[tokio::test]
async fn saga_held_elsewhere_is_reported_not_run() -> anyhow::Result<()> {
    let (engine, _) = engine()?;
    let journal = Journal::default();
    engine.register_definition(two_step_order(&journal, recorded_step("charge", &journal)))?;

    let saga_id = running_saga(&engine, Payload::empty()).await?;
    let held = engine
        .state()
        .acquire_saga_lock(saga_id, Duration::from_secs(60))
        .await?;

    let ctx = ExecutionContext::new();
    let outcomes = engine.recover_sagas(&ctx).await?;
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(
        &outcomes[0].result,
        Err(e) if e.code() == ErrorCode::SagaLockFailed
    ));
    assert!(journal.entries().is_empty());

    held.unlock().await?;
    let outcomes = engine.recover_sagas(&ctx).await?;
    assert!(outcomes[0].result.is_ok());
    assert_eq!(journal.entries(), vec!["run reserve", "run charge"]);
    Ok(())
}
