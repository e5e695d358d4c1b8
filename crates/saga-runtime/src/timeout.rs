use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use saga_core::{ErrorCode, SagaError};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

/// Which deadline a context is bounded by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineScope {
    Saga,
    Step,
}

impl DeadlineScope {
    fn error_code(self) -> ErrorCode {
        match self {
            Self::Saga => ErrorCode::SagaTimeout,
            Self::Step => ErrorCode::StepTimeout,
        }
    }
}

/// Cancellation and deadline scope handed to every step function.
///
/// Children inherit the parent's cancellation and never outlive its
/// deadline. Step implementations are expected to observe the context and
/// return promptly once it is done.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    token: CancellationToken,
    deadline: Option<(Instant, DeadlineScope)>,
    trace_id: Arc<str>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    /// Root context with no deadline and a fresh trace id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
            trace_id: Arc::from(Uuid::new_v4().to_string()),
        }
    }

    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Arc::from(trace_id.into());
        self
    }

    /// A child cancelled together with `self`, with the same deadline.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            trace_id: Arc::clone(&self.trace_id),
        }
    }

    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.map(|(at, _)| at)
    }

    #[must_use]
    pub fn deadline_scope(&self) -> Option<DeadlineScope> {
        self.deadline.map(|(_, scope)| scope)
    }

    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline()
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.deadline().is_some_and(|at| Instant::now() >= at)
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Fails if the context was cancelled or its deadline has passed.
    ///
    /// # Errors
    ///
    /// `SagaCancelled`, `SagaTimeout` or `StepTimeout`.
    pub fn check(&self) -> Result<(), SagaError> {
        if self.is_cancelled() {
            return Err(cancelled_error());
        }
        match self.deadline {
            Some((at, scope)) if Instant::now() >= at => Err(deadline_error(scope)),
            _ => Ok(()),
        }
    }

    /// Drives `fut` until it finishes, the context is cancelled, or the
    /// deadline passes. An interrupted future is dropped.
    ///
    /// # Errors
    ///
    /// `SagaCancelled`, `SagaTimeout` or `StepTimeout`.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, SagaError> {
        let deadline = self.deadline;
        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(cancelled_error()),
            scope = wait_for_deadline(deadline) => Err(deadline_error(scope)),
            output = fut => Ok(output),
        }
    }

    /// Cancellable sleep used for retry backoff.
    ///
    /// # Errors
    ///
    /// Returns the interrupting condition when the sleep was cut short.
    pub async fn sleep(&self, duration: Duration) -> Result<(), SagaError> {
        self.run(tokio::time::sleep(duration)).await
    }
}

async fn wait_for_deadline(deadline: Option<(Instant, DeadlineScope)>) -> DeadlineScope {
    match deadline {
        Some((at, scope)) => {
            tokio::time::sleep_until(at).await;
            scope
        }
        None => std::future::pending().await,
    }
}

fn cancelled_error() -> SagaError {
    SagaError::new(ErrorCode::SagaCancelled, "execution was cancelled")
}

fn deadline_error(scope: DeadlineScope) -> SagaError {
    match scope {
        DeadlineScope::Saga => SagaError::new(scope.error_code(), "saga deadline exceeded"),
        DeadlineScope::Step => SagaError::new(scope.error_code(), "step deadline exceeded"),
    }
}

/// Derives deadline-bounded contexts for sagas and steps.
#[derive(Debug, Clone)]
pub struct TimeoutManager {
    default_saga_timeout: Duration,
    default_step_timeout: Duration,
}

impl TimeoutManager {
    #[must_use]
    pub fn new(default_saga_timeout: Duration, default_step_timeout: Duration) -> Self {
        Self {
            default_saga_timeout,
            default_step_timeout,
        }
    }

    /// Wraps `parent` with a deadline `timeout` from now.
    ///
    /// The parent's deadline is kept when it is earlier, so a step can never
    /// outlive its saga.
    #[must_use]
    pub fn with_timeout(
        parent: &ExecutionContext,
        timeout: Duration,
        scope: DeadlineScope,
    ) -> ExecutionContext {
        let mut child = parent.child();
        let at = Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(far_future);
        child.deadline = match parent.deadline {
            Some((parent_at, parent_scope)) if parent_at <= at => Some((parent_at, parent_scope)),
            _ => Some((at, scope)),
        };
        child
    }

    #[must_use]
    pub fn saga_context(
        &self,
        parent: &ExecutionContext,
        timeout: Option<Duration>,
    ) -> ExecutionContext {
        Self::with_timeout(
            parent,
            timeout.unwrap_or(self.default_saga_timeout),
            DeadlineScope::Saga,
        )
    }

    #[must_use]
    pub fn step_context(
        &self,
        parent: &ExecutionContext,
        timeout: Option<Duration>,
    ) -> ExecutionContext {
        Self::with_timeout(
            parent,
            timeout.unwrap_or(self.default_step_timeout),
            DeadlineScope::Step,
        )
    }

    /// True when `err`, or anything in its source chain, is a deadline expiry.
    #[must_use]
    pub fn is_timeout_error(err: &(dyn StdError + 'static)) -> bool {
        let mut current = Some(err);
        while let Some(e) = current {
            if e.downcast_ref::<SagaError>().is_some_and(SagaError::is_timeout)
                || e.is::<tokio::time::error::Elapsed>()
            {
                return true;
            }
            current = e.source();
        }
        false
    }
}

// Roughly thirty years; far enough to behave as "no deadline".
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365 * 30)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_returns_output_before_deadline() -> anyhow::Result<()> {
        let ctx = TimeoutManager::with_timeout(
            &ExecutionContext::new(),
            Duration::from_secs(5),
            DeadlineScope::Step,
        );
        let value = ctx.run(async { 7 }).await?;
        assert_eq!(value, 7);
        Ok(())
    }

    #[tokio::test]
    async fn run_reports_step_timeout() {
        let ctx = TimeoutManager::with_timeout(
            &ExecutionContext::new(),
            Duration::from_millis(20),
            DeadlineScope::Step,
        );
        let err = ctx
            .run(tokio::time::sleep(Duration::from_secs(5)))
            .await
            .expect_err("should time out");

        assert_eq!(err.code(), ErrorCode::StepTimeout);
        assert!(TimeoutManager::is_timeout_error(&err));
    }

    #[tokio::test]
    async fn step_inherits_earlier_saga_deadline() {
        let saga = TimeoutManager::with_timeout(
            &ExecutionContext::new(),
            Duration::from_millis(20),
            DeadlineScope::Saga,
        );
        let step = TimeoutManager::with_timeout(&saga, Duration::from_secs(60), DeadlineScope::Step);

        assert_eq!(step.deadline_scope(), Some(DeadlineScope::Saga));
        let err = step
            .run(tokio::time::sleep(Duration::from_secs(5)))
            .await
            .expect_err("saga deadline should fire");
        assert_eq!(err.code(), ErrorCode::SagaTimeout);
    }

    #[tokio::test]
    async fn cancelling_parent_interrupts_child_sleep() {
        let parent = ExecutionContext::new();
        let child = parent.child();

        let canceller = parent.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let err = child
            .sleep(Duration::from_secs(30))
            .await
            .expect_err("sleep should be interrupted");
        assert_eq!(err.code(), ErrorCode::SagaCancelled);
        assert!(!TimeoutManager::is_timeout_error(&err));
    }

    #[tokio::test]
    async fn check_reflects_expiry() {
        let ctx = TimeoutManager::with_timeout(
            &ExecutionContext::new(),
            Duration::ZERO,
            DeadlineScope::Saga,
        );
        assert!(ctx.is_expired());
        let err = ctx.check().expect_err("expired");
        assert_eq!(err.code(), ErrorCode::SagaTimeout);
    }

    #[test]
    fn children_share_trace_id() {
        let root = ExecutionContext::new().with_trace_id("trace-1");
        assert_eq!(root.child().trace_id(), "trace-1");
    }

    #[test]
    fn wrapped_timeouts_are_detected() {
        let err = SagaError::new(ErrorCode::MaxRetriesExceeded, "gave up")
            .with_source(SagaError::new(ErrorCode::StepTimeout, "slow"));
        assert!(TimeoutManager::is_timeout_error(&err));
    }
}
