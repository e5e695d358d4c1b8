//! In-memory adapters for the upload ports.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use saga_core::{ErrorCode, Result, SagaError};
use tracing::debug;

use crate::ports::{BlobStore, FileRegistry, Notifier, QuotaLedger, RegisteredFile};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub size_bytes: u64,
    pub checksum: String,
}

#[derive(Debug, Default)]
struct BlobState {
    blobs: BTreeMap<String, StoredBlob>,
    failing_puts: u32,
}

/// Blob store backed by a map. Can be told to fail upcoming writes.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    state: Mutex<BlobState>,
}

impl InMemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` writes fail with a transient storage error.
    pub fn fail_next_puts(&self, count: u32) {
        self.state.lock().failing_puts = count;
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<StoredBlob> {
        self.state.lock().blobs.get(key).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().blobs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &str, size_bytes: u64, checksum: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_puts > 0 {
            state.failing_puts -= 1;
            return Err(SagaError::repository(format!(
                "blob storage unavailable while writing '{key}'"
            )));
        }
        state.blobs.insert(
            key.to_string(),
            StoredBlob {
                size_bytes,
                checksum: checksum.to_string(),
            },
        );
        debug!(key, size_bytes, "stored blob");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if self.state.lock().blobs.remove(key).is_some() {
            debug!(key, "deleted blob");
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryFileRegistry {
    files: Mutex<BTreeMap<String, RegisteredFile>>,
}

impl InMemoryFileRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, file_id: &str) -> Option<RegisteredFile> {
        self.files.lock().get(file_id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FileRegistry for InMemoryFileRegistry {
    async fn register(&self, file: &RegisteredFile) -> Result<()> {
        let mut files = self.files.lock();
        if files
            .get(&file.file_id)
            .is_some_and(|existing| existing.owner != file.owner)
        {
            return Err(SagaError::new(
                ErrorCode::InvalidInput,
                format!("file id '{}' belongs to another owner", file.file_id),
            ));
        }
        files.insert(file.file_id.clone(), file.clone());
        Ok(())
    }

    async fn unregister(&self, file_id: &str) -> Result<()> {
        self.files.lock().remove(file_id);
        Ok(())
    }
}

/// Quota ledger with the same allowance for every owner.
#[derive(Debug)]
pub struct InMemoryQuotaLedger {
    allowance: u64,
    used: Mutex<BTreeMap<String, u64>>,
}

impl InMemoryQuotaLedger {
    #[must_use]
    pub fn with_allowance(allowance: u64) -> Self {
        Self {
            allowance,
            used: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn used(&self, owner: &str) -> u64 {
        self.used.lock().get(owner).copied().unwrap_or(0)
    }
}

#[async_trait]
impl QuotaLedger for InMemoryQuotaLedger {
    async fn charge(&self, owner: &str, bytes: u64) -> Result<()> {
        let mut used = self.used.lock();
        let current = used.entry(owner.to_string()).or_insert(0);
        let next = current.saturating_add(bytes);
        if next > self.allowance {
            return Err(SagaError::new(
                ErrorCode::InvalidInput,
                format!(
                    "quota exceeded for '{owner}': {next} of {} bytes",
                    self.allowance
                ),
            ));
        }
        *current = next;
        Ok(())
    }

    async fn refund(&self, owner: &str, bytes: u64) -> Result<()> {
        if let Some(current) = self.used.lock().get_mut(owner) {
            *current = current.saturating_sub(bytes);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct NotifierState {
    sent: Vec<(String, String)>,
    unavailable: bool,
}

/// Collects notifications instead of delivering them.
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    state: Mutex<NotifierState>,
}

impl InMemoryNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// `(owner, message)` pairs in delivery order.
    #[must_use]
    pub fn sent(&self) -> Vec<(String, String)> {
        self.state.lock().sent.clone()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn notify(&self, owner: &str, message: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(SagaError::repository("notification service unavailable"));
        }
        state.sent.push((owner.to_string(), message.to_string()));
        Ok(())
    }
}
