use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use saga_core::{
    ErrorCode, NewSagaExecution, Payload, Result, SagaError, SagaExecution, SagaId, SagaStatus,
    StepStatus,
};
use saga_runtime::{
    EventBus, ExecutionContext, InMemoryLockManager, LockHandle, LockManager, RetryManager,
    Submission, TimeoutManager, WorkerPool,
};
use saga_store::{SagaRepository, SagaStatusChange};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::definition::{SagaDefinition, validate_definition};
use crate::report::{RecoveryOutcome, SagaStatusReport};
use crate::state::StateManager;

mod compensate;
mod execute;

/// Drives saga executions stored in a [`SagaRepository`].
///
/// Work runs on the task that calls into the engine. Each saga id is
/// serialized by a lock; different ids proceed in parallel.
pub struct Engine {
    state: StateManager,
    retry: RetryManager,
    timeouts: TimeoutManager,
    events: Arc<EventBus>,
    workers: WorkerPool,
    definitions: RwLock<IndexMap<String, Arc<dyn SagaDefinition>>>,
    active: DashMap<SagaId, ExecutionContext>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    config: EngineConfig,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("definitions", &self.definitions.read().keys().collect::<Vec<_>>())
            .field("active", &self.active.len())
            .field("running", &self.running.load(Ordering::SeqCst))
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Engine with the in-process lock manager and its background sweeper.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when `config` does not validate.
    pub fn new(repository: Arc<dyn SagaRepository>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let locks = InMemoryLockManager::new();
        let sweeper = locks.spawn_sweeper(config.lock_sweep_interval());
        let engine = Self::with_lock_manager(repository, Arc::new(locks), config)?;
        *engine.sweeper.lock() = Some(sweeper);
        Ok(engine)
    }

    /// Engine using an externally provided lock manager, such as a
    /// lease-backed one shared between processes.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when `config` does not validate.
    pub fn with_lock_manager(
        repository: Arc<dyn SagaRepository>,
        locks: Arc<dyn LockManager>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let events = Arc::new(EventBus::new(config.event_queue_capacity()));
        let state = StateManager::new(
            repository,
            locks,
            Arc::clone(&events),
            config.stale_pending_after(),
        );
        let engine = Self {
            state,
            retry: RetryManager::new(config.default_retry_policy().clone()),
            timeouts: TimeoutManager::new(
                config.default_saga_timeout(),
                config.default_step_timeout(),
            ),
            events,
            workers: WorkerPool::new(config.worker_pool_size(), config.worker_queue_capacity()),
            definitions: RwLock::new(IndexMap::new()),
            active: DashMap::new(),
            sweeper: Mutex::new(None),
            running: AtomicBool::new(true),
            config,
        };
        info!(
            workers = engine.config.worker_pool_size(),
            "saga engine started"
        );
        Ok(engine)
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Bus carrying every saga and step event; subscribe here to observe.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    #[must_use]
    pub fn state(&self) -> &StateManager {
        &self.state
    }

    /// # Errors
    ///
    /// `DefinitionExists` when the saga type is taken, `InvalidInput` when
    /// the definition is malformed.
    pub fn register_definition(&self, definition: Arc<dyn SagaDefinition>) -> Result<()> {
        self.ensure_running()?;
        validate_definition(definition.as_ref())?;

        let saga_type = definition.saga_type().to_string();
        let mut definitions = self.definitions.write();
        if definitions.contains_key(&saga_type) {
            return Err(SagaError::new(
                ErrorCode::DefinitionExists,
                format!("saga type '{saga_type}' is already registered"),
            ));
        }
        info!(
            saga_type = %saga_type,
            steps = definition.steps().len(),
            "saga definition registered"
        );
        definitions.insert(saga_type, definition);
        Ok(())
    }

    /// # Errors
    ///
    /// `DefinitionNotFound` for an unregistered type.
    pub fn definition(&self, saga_type: &str) -> Result<Arc<dyn SagaDefinition>> {
        self.definitions
            .read()
            .get(saga_type)
            .cloned()
            .ok_or_else(|| SagaError::definition_not_found(saga_type))
    }

    /// Validates `context` and records a `Pending` execution.
    ///
    /// Idempotent per `(saga_type, request_id)`: a repeated request returns
    /// the execution created the first time, whatever its status.
    ///
    /// # Errors
    ///
    /// `DefinitionNotFound`, the definition's validation error, or a
    /// repository failure.
    pub async fn create_saga(
        &self,
        ctx: &ExecutionContext,
        saga_type: &str,
        request_id: &str,
        context: Payload,
    ) -> Result<SagaExecution> {
        self.ensure_running()?;
        let definition = self.definition(saga_type)?;
        definition.validate_context(&context)?;

        let (execution, created) = self
            .state
            .create_saga(
                NewSagaExecution {
                    saga_type: saga_type.to_string(),
                    request_id: request_id.to_string(),
                    total_steps: definition.steps().len(),
                    context,
                },
                ctx.trace_id(),
            )
            .await?;
        if created {
            info!(
                saga_id = %execution.id,
                saga_type,
                request_id,
                trace_id = ctx.trace_id(),
                "saga created"
            );
        }
        Ok(execution)
    }

    /// Creates the execution if needed and drives it.
    ///
    /// A request whose execution already left `Pending`/`Running` is not
    /// run again; its stored execution is returned as is.
    ///
    /// # Errors
    ///
    /// See [`Self::create_saga`] and [`Self::execute_saga`].
    pub async fn start_saga(
        &self,
        ctx: &ExecutionContext,
        saga_type: &str,
        request_id: &str,
        context: Payload,
    ) -> Result<SagaExecution> {
        let execution = self.create_saga(ctx, saga_type, request_id, context).await?;
        match execution.status {
            SagaStatus::Pending | SagaStatus::Running => self.execute_saga(ctx, execution.id).await,
            status => {
                debug!(saga_id = %execution.id, %status, "request already processed");
                Ok(execution)
            }
        }
    }

    /// Runs a saga with its registered definition. See [`Self::execute_saga_with`].
    ///
    /// # Errors
    ///
    /// `SagaNotFound`, `DefinitionNotFound`, or any error of
    /// [`Self::execute_saga_with`].
    pub async fn execute_saga(&self, ctx: &ExecutionContext, saga_id: SagaId) -> Result<SagaExecution> {
        self.ensure_running()?;
        let execution = self.state.get_saga(saga_id).await?;
        let definition = self.definition(&execution.saga_type)?;
        self.execute_saga_with(ctx, saga_id, definition.as_ref()).await
    }

    /// Drives a saga from its current step to the end.
    ///
    /// Resumes after the last recorded step, so completed steps are never
    /// executed twice. Returns the execution only when it completed; every
    /// other outcome is an error, with the final status persisted on the row.
    ///
    /// # Errors
    ///
    /// - `SagaLockFailed` when another driver holds the saga
    /// - `SagaAlreadyCompleted` / `SagaAlreadyRunning` for sagas that cannot run
    /// - `StepExecutionFailed`, `MaxRetriesExceeded` or `StepPrerequisiteFailed`
    ///   when a step failed, after any compensation ran
    /// - `SagaTimeout` or `SagaCancelled` when interrupted
    /// - `StepCompensationFailed` or `CompensationImpossible` when rollback failed
    pub async fn execute_saga_with(
        &self,
        ctx: &ExecutionContext,
        saga_id: SagaId,
        definition: &dyn SagaDefinition,
    ) -> Result<SagaExecution> {
        self.ensure_running()?;
        let lock = self
            .state
            .acquire_saga_lock(saga_id, self.config.lock_ttl())
            .await?;
        let result = self
            .holding(
                saga_id,
                lock.as_ref(),
                self.drive(ctx, saga_id, definition, lock.as_ref()),
            )
            .await;
        self.release(saga_id, lock.as_ref()).await;
        result
    }

    /// Queues a saga for execution on the worker pool.
    pub fn spawn_execution(self: &Arc<Self>, saga_id: SagaId) -> Submission {
        let engine = Arc::clone(self);
        self.workers.submit(async move {
            let ctx = ExecutionContext::new();
            match engine.execute_saga(&ctx, saga_id).await {
                Ok(execution) => {
                    debug!(saga_id = %saga_id, status = %execution.status, "background saga finished");
                }
                Err(e) => warn!(saga_id = %saga_id, error = %e, "background saga did not complete"),
            }
        })
    }

    /// Rolls back a `Running`, `Timeout` or half-compensated saga.
    ///
    /// # Errors
    ///
    /// `SagaLockFailed`, `SagaAlreadyCompleted` for terminal sagas,
    /// `InvalidStateTransition` for `Pending` ones, or the compensation
    /// failure.
    pub async fn compensate_saga(
        &self,
        ctx: &ExecutionContext,
        saga_id: SagaId,
    ) -> Result<SagaExecution> {
        self.ensure_running()?;
        let execution = self.state.get_saga(saga_id).await?;
        let definition = self.definition(&execution.saga_type)?;
        let lock = self
            .state
            .acquire_saga_lock(saga_id, self.config.lock_ttl())
            .await?;
        let result = self
            .holding(
                saga_id,
                lock.as_ref(),
                self.compensate_locked(ctx, saga_id, definition.as_ref()),
            )
            .await;
        self.release(saga_id, lock.as_ref()).await;
        result
    }

    async fn compensate_locked(
        &self,
        ctx: &ExecutionContext,
        saga_id: SagaId,
        definition: &dyn SagaDefinition,
    ) -> Result<SagaExecution> {
        let execution = self.state.get_saga(saga_id).await?;
        match execution.status {
            SagaStatus::Running | SagaStatus::Timeout => {
                self.state
                    .transition_saga_status(
                        saga_id,
                        execution.status,
                        SagaStatus::Compensating,
                        ctx.trace_id(),
                    )
                    .await?;
            }
            SagaStatus::Compensating => {
                debug!(saga_id = %saga_id, "continuing interrupted compensation");
            }
            status if status.is_terminal() => return Err(already_finished(saga_id, status)),
            status => {
                return Err(
                    SagaError::invalid_transition(status, SagaStatus::Compensating)
                        .with_saga(saga_id),
                );
            }
        }
        self.run_compensation(ctx, saga_id, definition, None).await
    }

    /// Re-drives a saga whose step is stuck in `Failed` or `Retrying`,
    /// granting the step a fresh attempt budget.
    ///
    /// # Errors
    ///
    /// `StepNotFound`, `InvalidStateTransition` when the saga is not
    /// `Running` or the step is not stuck, or any error of
    /// [`Self::execute_saga_with`].
    pub async fn retry_step(
        &self,
        ctx: &ExecutionContext,
        saga_id: SagaId,
        step_index: usize,
    ) -> Result<SagaExecution> {
        self.ensure_running()?;
        let execution = self.state.get_saga(saga_id).await?;
        let definition = self.definition(&execution.saga_type)?;
        let lock = self
            .state
            .acquire_saga_lock(saga_id, self.config.lock_ttl())
            .await?;

        let result = self
            .holding(
                saga_id,
                lock.as_ref(),
                self.retry_step_locked(
                    ctx,
                    saga_id,
                    step_index,
                    definition.as_ref(),
                    lock.as_ref(),
                ),
            )
            .await;
        self.release(saga_id, lock.as_ref()).await;
        result
    }

    async fn retry_step_locked(
        &self,
        ctx: &ExecutionContext,
        saga_id: SagaId,
        step_index: usize,
        definition: &dyn SagaDefinition,
        lock: &dyn LockHandle,
    ) -> Result<SagaExecution> {
        let execution = self.state.get_saga(saga_id).await?;
        if execution.status != SagaStatus::Running {
            return Err(SagaError::new(
                ErrorCode::InvalidStateTransition,
                format!(
                    "steps can only be retried while running, saga is {}",
                    execution.status
                ),
            )
            .with_saga(saga_id)
            .with_step(step_index));
        }
        let step = self
            .state
            .repository()
            .find_step(saga_id, step_index)
            .await?
            .ok_or_else(|| {
                SagaError::new(ErrorCode::StepNotFound, "step has not been started")
                    .with_saga(saga_id)
                    .with_step(step_index)
            })?;
        if !matches!(step.status, StepStatus::Failed | StepStatus::Retrying) {
            return Err(SagaError::new(
                ErrorCode::InvalidStateTransition,
                format!(
                    "only failed or retrying steps can be retried, step is {}",
                    step.status
                ),
            )
            .with_saga(saga_id)
            .with_step(step_index));
        }

        info!(saga_id = %saga_id, step = %step.step_name, "step retry requested");
        self.state.record_step_attempt(step.id, 0).await?;
        self.drive(ctx, saga_id, definition, lock).await
    }

    /// Cancels a saga.
    ///
    /// A `Pending` saga is cancelled at once. A saga being driven by this
    /// engine is signalled and moves to `Cancelled` as soon as its current
    /// step observes the signal; the returned row may still show `Running`.
    /// A `Running` saga with no live driver is cancelled under its lock.
    ///
    /// # Errors
    ///
    /// `SagaAlreadyCompleted` for terminal sagas, `SagaLockFailed` when a
    /// driver in another process holds it, `StateConflict` on a race.
    pub async fn cancel_saga(&self, ctx: &ExecutionContext, saga_id: SagaId) -> Result<SagaExecution> {
        self.ensure_running()?;
        let execution = self.state.get_saga(saga_id).await?;
        match execution.status {
            SagaStatus::Pending => {
                let cancelled = self
                    .state
                    .transition_saga(saga_id, cancel_change(SagaStatus::Pending), ctx.trace_id())
                    .await?;
                info!(saga_id = %saga_id, "pending saga cancelled");
                Ok(cancelled)
            }
            SagaStatus::Running => {
                let active = self.active.get(&saga_id).map(|entry| entry.value().clone());
                if let Some(active) = active {
                    active.cancel();
                    info!(saga_id = %saga_id, "cancellation signalled to running saga");
                    return Ok(execution);
                }

                let lock = self
                    .state
                    .acquire_saga_lock(saga_id, self.config.lock_ttl())
                    .await?;
                let result = self
                    .state
                    .transition_saga(saga_id, cancel_change(SagaStatus::Running), ctx.trace_id())
                    .await;
                self.release(saga_id, lock.as_ref()).await;
                if result.is_ok() {
                    info!(saga_id = %saga_id, "idle running saga cancelled");
                }
                result
            }
            status if status.is_terminal() => Err(already_finished(saga_id, status)),
            status => {
                Err(SagaError::invalid_transition(status, SagaStatus::Cancelled).with_saga(saga_id))
            }
        }
    }

    /// Current row, its steps and its audit trail.
    ///
    /// # Errors
    ///
    /// `SagaNotFound` for an unknown id.
    pub async fn get_saga_status(&self, saga_id: SagaId) -> Result<SagaStatusReport> {
        let execution = self.state.get_saga(saga_id).await?;
        let steps = self.state.get_steps(saga_id).await?;
        let events = self.state.get_events(saga_id).await?;
        Ok(SagaStatusReport {
            execution,
            steps,
            events,
        })
    }

    /// Resumes every recoverable saga: `Running` ones are executed,
    /// `Compensating` ones compensated, stale `Pending` ones started.
    ///
    /// Sagas are processed one after another. A saga still held by a live
    /// driver shows up with `SagaLockFailed`.
    ///
    /// # Errors
    ///
    /// Only when the recoverable set cannot be listed; per-saga failures
    /// are reported in the outcomes.
    pub async fn recover_sagas(&self, ctx: &ExecutionContext) -> Result<Vec<RecoveryOutcome>> {
        self.ensure_running()?;
        let sagas = self.state.get_recoverable_sagas().await?;
        info!(count = sagas.len(), "recovering sagas");

        let mut outcomes = Vec::with_capacity(sagas.len());
        for saga in sagas {
            let result = if saga.status == SagaStatus::Compensating {
                self.compensate_saga(ctx, saga.id).await
            } else {
                self.execute_saga(ctx, saga.id).await
            };
            if let Err(e) = &result {
                warn!(saga_id = %saga.id, error = %e, "recovered saga did not complete");
            }
            outcomes.push(RecoveryOutcome {
                saga_id: saga.id,
                result,
            });
        }
        Ok(outcomes)
    }

    /// Stops accepting work, interrupts sagas driven by this engine and
    /// waits for queued background jobs.
    ///
    /// Interrupted sagas keep their status so recovery can resume them.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for entry in &self.active {
            entry.value().cancel();
        }
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        self.workers.shutdown().await;
        info!("saga engine stopped");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(SagaError::new(
                ErrorCode::EngineNotInitialized,
                "engine has been shut down",
            ))
        }
    }

    /// Runs `work` while extending `lock` every half TTL.
    ///
    /// Losing the lock abandons `work`; the saga keeps its persisted status
    /// for recovery.
    async fn holding<T>(
        &self,
        saga_id: SagaId,
        lock: &dyn LockHandle,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let ttl = self.config.lock_ttl();
        let heartbeat = async {
            let mut ticker = tokio::time::interval((ttl / 2).max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = lock.extend(ttl).await {
                    return e.with_saga(saga_id);
                }
            }
        };

        tokio::select! {
            result = work => result,
            lost = heartbeat => {
                warn!(saga_id = %saga_id, error = %lost, "saga lock lost, abandoning run");
                Err(lost)
            }
        }
    }

    async fn release(&self, saga_id: SagaId, lock: &dyn LockHandle) {
        if let Err(e) = lock.unlock().await {
            warn!(saga_id = %saga_id, error = %e, "saga lock was lost before release");
        }
    }
}

fn cancel_change(from: SagaStatus) -> SagaStatusChange {
    let mut change = SagaStatusChange::new(from, SagaStatus::Cancelled, Utc::now());
    change.error = Some("cancelled on request".to_string());
    change.error_code = Some(ErrorCode::SagaCancelled);
    change
}

fn already_finished(saga_id: SagaId, status: SagaStatus) -> SagaError {
    SagaError::new(
        ErrorCode::SagaAlreadyCompleted,
        format!("saga already finished as {status}"),
    )
    .with_saga(saga_id)
}
