use std::time::Duration;

use saga_core::{ErrorCode, Result, RetryPolicy, SagaError};
use serde::Deserialize;

const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_LOCK_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_STALE_PENDING_AFTER: Duration = Duration::from_secs(5 * 60);
const DEFAULT_SAGA_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_WORKER_POOL_SIZE: usize = 4;
const DEFAULT_WORKER_QUEUE_CAPACITY: usize = 256;

/// Tunables for an [`Engine`](crate::Engine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    lock_ttl: Duration,
    lock_sweep_interval: Duration,
    stale_pending_after: Duration,
    default_saga_timeout: Duration,
    default_step_timeout: Duration,
    default_retry_policy: RetryPolicy,
    event_queue_capacity: usize,
    worker_pool_size: usize,
    worker_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_ttl: DEFAULT_LOCK_TTL,
            lock_sweep_interval: DEFAULT_LOCK_SWEEP_INTERVAL,
            stale_pending_after: DEFAULT_STALE_PENDING_AFTER,
            default_saga_timeout: DEFAULT_SAGA_TIMEOUT,
            default_step_timeout: DEFAULT_STEP_TIMEOUT,
            default_retry_policy: RetryPolicy::default(),
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            worker_queue_capacity: DEFAULT_WORKER_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEngineConfig {
    lock_ttl_ms: Option<u64>,
    lock_sweep_interval_ms: Option<u64>,
    stale_pending_after_ms: Option<u64>,
    saga_timeout_ms: Option<u64>,
    step_timeout_ms: Option<u64>,
    event_queue_capacity: Option<usize>,
    worker_pool_size: Option<usize>,
    worker_queue_capacity: Option<usize>,
    retry: Option<RetryPolicy>,
}

impl EngineConfig {
    /// Parses a TOML document. Missing keys keep their defaults.
    ///
    /// ```toml
    /// lock_ttl_ms = 300000
    /// saga_timeout_ms = 1800000
    ///
    /// [retry]
    /// max_attempts = 5
    /// initial_delay_ms = 500
    /// ```
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for malformed TOML, unknown keys, or values
    /// rejected by [`EngineConfig::validate`].
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let raw: RawEngineConfig = toml::from_str(input).map_err(|e| {
            SagaError::new(ErrorCode::InvalidInput, "invalid engine configuration").with_source(e)
        })?;

        let mut config = Self::default();
        if let Some(ms) = raw.lock_ttl_ms {
            config.lock_ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.lock_sweep_interval_ms {
            config.lock_sweep_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.stale_pending_after_ms {
            config.stale_pending_after = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.saga_timeout_ms {
            config.default_saga_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.step_timeout_ms {
            config.default_step_timeout = Duration::from_millis(ms);
        }
        if let Some(capacity) = raw.event_queue_capacity {
            config.event_queue_capacity = capacity;
        }
        if let Some(size) = raw.worker_pool_size {
            config.worker_pool_size = size;
        }
        if let Some(capacity) = raw.worker_queue_capacity {
            config.worker_queue_capacity = capacity;
        }
        if let Some(policy) = raw.retry {
            config.default_retry_policy = policy;
        }

        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns `InvalidInput` when a duration or capacity is zero, or the
    /// retry policy is inconsistent.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("lock_ttl", self.lock_ttl),
            ("lock_sweep_interval", self.lock_sweep_interval),
            ("saga_timeout", self.default_saga_timeout),
            ("step_timeout", self.default_step_timeout),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(invalid(format!("{name} must be greater than zero")));
        }

        let sizes = [
            ("event_queue_capacity", self.event_queue_capacity),
            ("worker_pool_size", self.worker_pool_size),
            ("worker_queue_capacity", self.worker_queue_capacity),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, n)| *n == 0) {
            return Err(invalid(format!("{name} must be greater than zero")));
        }

        self.default_retry_policy.validate()
    }

    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        self.lock_ttl
    }

    #[must_use]
    pub fn lock_sweep_interval(&self) -> Duration {
        self.lock_sweep_interval
    }

    /// Age after which a `Pending` saga is picked up by recovery.
    #[must_use]
    pub fn stale_pending_after(&self) -> Duration {
        self.stale_pending_after
    }

    #[must_use]
    pub fn default_saga_timeout(&self) -> Duration {
        self.default_saga_timeout
    }

    #[must_use]
    pub fn default_step_timeout(&self) -> Duration {
        self.default_step_timeout
    }

    #[must_use]
    pub fn default_retry_policy(&self) -> &RetryPolicy {
        &self.default_retry_policy
    }

    #[must_use]
    pub fn event_queue_capacity(&self) -> usize {
        self.event_queue_capacity
    }

    #[must_use]
    pub fn worker_pool_size(&self) -> usize {
        self.worker_pool_size
    }

    #[must_use]
    pub fn worker_queue_capacity(&self) -> usize {
        self.worker_queue_capacity
    }

    #[must_use]
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_lock_sweep_interval(mut self, interval: Duration) -> Self {
        self.lock_sweep_interval = interval;
        self
    }

    #[must_use]
    pub fn with_stale_pending_after(mut self, age: Duration) -> Self {
        self.stale_pending_after = age;
        self
    }

    #[must_use]
    pub fn with_default_saga_timeout(mut self, timeout: Duration) -> Self {
        self.default_saga_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_default_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_retry_policy = policy;
        self
    }

    #[must_use]
    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_worker_pool(mut self, size: usize, queue_capacity: usize) -> Self {
        self.worker_pool_size = size;
        self.worker_queue_capacity = queue_capacity;
        self
    }
}

fn invalid(message: String) -> SagaError {
    SagaError::new(ErrorCode::InvalidInput, message)
}
