use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use saga_core::{ErrorCode, Result, SagaError};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// Non-blocking mutual exclusion keyed by string.
///
/// `acquire_lock` fails immediately when a live lock exists; there is no
/// queueing. A distributed implementation (row lease, lock service) can be
/// swapped in behind the same contract.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// # Errors
    ///
    /// Returns `SagaLockFailed` when `key` is held by a live lock.
    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<Box<dyn LockHandle>>;
}

/// Ownership of one acquired lock.
#[async_trait]
pub trait LockHandle: Send + Sync {
    fn key(&self) -> &str;

    /// # Errors
    ///
    /// Returns `SagaLockFailed` when the lock expired and was taken by someone else.
    async fn unlock(&self) -> Result<()>;

    /// Recomputed against the stored expiry on every call.
    async fn is_locked(&self) -> bool;

    /// # Errors
    ///
    /// Returns `SagaLockFailed` when the lock is no longer held by this handle.
    async fn extend(&self, ttl: Duration) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct LockEntry {
    token: Uuid,
    expires_at: Instant,
}

impl LockEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

type LockTable = DashMap<String, LockEntry>;

/// Single-process [`LockManager`] backed by a concurrent map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockManager {
    locks: Arc<LockTable>,
}

impl InMemoryLockManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops entries whose TTL elapsed without an unlock. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        sweep(&self.locks)
    }

    /// Number of entries currently stored, live or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Periodically reclaims expired entries until the manager is dropped.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let table: Weak<LockTable> = Arc::downgrade(&self.locks);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(locks) = table.upgrade() else {
                    break;
                };
                let removed = sweep(&locks);
                if removed > 0 {
                    debug!(removed, "reclaimed expired locks");
                }
            }
        })
    }
}

fn sweep(locks: &LockTable) -> usize {
    let now = Instant::now();
    let before = locks.len();
    locks.retain(|_, entry| entry.is_live(now));
    before.saturating_sub(locks.len())
}

fn lock_failed(key: &str, reason: &str) -> SagaError {
    SagaError::new(ErrorCode::SagaLockFailed, format!("lock '{key}' {reason}"))
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<Box<dyn LockHandle>> {
        let now = Instant::now();
        let entry = LockEntry {
            token: Uuid::new_v4(),
            expires_at: now + ttl,
        };

        match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Err(lock_failed(key, "is already held"));
                }
                occupied.insert(entry);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }

        debug!(key, ttl = ?ttl, "lock acquired");
        Ok(Box::new(InMemoryLockHandle {
            key: key.to_string(),
            token: entry.token,
            locks: Arc::clone(&self.locks),
            released: AtomicBool::new(false),
        }))
    }
}

/// Releases the lock on drop if it was not unlocked explicitly.
#[derive(Debug)]
pub struct InMemoryLockHandle {
    key: String,
    token: Uuid,
    locks: Arc<LockTable>,
    released: AtomicBool,
}

impl InMemoryLockHandle {
    fn release(&self) -> bool {
        self.released.store(true, Ordering::SeqCst);
        self.locks
            .remove_if(&self.key, |_, entry| entry.token == self.token)
            .is_some()
    }
}

#[async_trait]
impl LockHandle for InMemoryLockHandle {
    fn key(&self) -> &str {
        &self.key
    }

    async fn unlock(&self) -> Result<()> {
        if self.released.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.release() {
            debug!(key = %self.key, "lock released");
            Ok(())
        } else {
            Err(lock_failed(&self.key, "was lost before unlock"))
        }
    }

    async fn is_locked(&self) -> bool {
        if self.released.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        self.locks
            .get(&self.key)
            .is_some_and(|entry| entry.token == self.token && entry.is_live(now))
    }

    async fn extend(&self, ttl: Duration) -> Result<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(lock_failed(&self.key, "was already released"));
        }
        let now = Instant::now();
        match self.locks.get_mut(&self.key) {
            Some(mut entry) if entry.token == self.token && entry.is_live(now) => {
                entry.expires_at = now + ttl;
                Ok(())
            }
            _ => Err(lock_failed(&self.key, "expired before it could be extended")),
        }
    }
}

impl Drop for InMemoryLockHandle {
    fn drop(&mut self) {
        if !self.released.load(Ordering::SeqCst) {
            self.release();
        }
    }
}
