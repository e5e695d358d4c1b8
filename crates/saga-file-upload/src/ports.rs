//! Collaborators the upload saga drives.
//!
//! Each port is an async trait so the saga can run against real storage
//! services or the in-memory adapters in [`crate::memory`].

use async_trait::async_trait;
use saga_core::Result;

/// Object storage holding file contents.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Writes `size_bytes` of content under `key`, replacing any earlier blob.
    async fn put(&self, key: &str, size_bytes: u64, checksum: &str) -> Result<()>;

    /// Removes the blob. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Catalogue of uploaded files, keyed by file id.
#[async_trait]
pub trait FileRegistry: Send + Sync {
    /// Records the file's metadata and where its content lives.
    async fn register(&self, file: &RegisteredFile) -> Result<()>;

    async fn unregister(&self, file_id: &str) -> Result<()>;
}

/// Per-owner storage allowance.
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    /// Reserves `bytes` against the owner's allowance.
    ///
    /// Fails with `InvalidInput` when the allowance would be exceeded.
    async fn charge(&self, owner: &str, bytes: u64) -> Result<()>;

    async fn refund(&self, owner: &str, bytes: u64) -> Result<()>;
}

/// Tells the owner their upload is available.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, owner: &str, message: &str) -> Result<()>;
}

/// Registry entry for an uploaded file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredFile {
    pub file_id: String,
    pub owner: String,
    pub file_name: String,
    pub blob_key: String,
    pub size_bytes: u64,
}
