//! File upload saga.
//!
//! Runs four steps against pluggable services: store the blob, register the
//! file, charge the owner's quota and notify them. A quota rejection rolls
//! the blob and the registry entry back.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use saga_file_upload::{
//!     FileUploadRequest, FileUploadSaga, InMemoryBlobStore, InMemoryFileRegistry,
//!     InMemoryNotifier, InMemoryQuotaLedger, UploadServices, FILE_UPLOAD_SAGA,
//! };
//!
//! # async fn run(engine: saga_engine::Engine, ctx: saga_runtime::ExecutionContext) -> saga_core::Result<()> {
//! engine.register_definition(Arc::new(FileUploadSaga::new(UploadServices {
//!     blobs: Arc::new(InMemoryBlobStore::new()),
//!     registry: Arc::new(InMemoryFileRegistry::new()),
//!     quota: Arc::new(InMemoryQuotaLedger::with_allowance(1 << 30)),
//!     notifier: Arc::new(InMemoryNotifier::new()),
//! })))?;
//!
//! let request = FileUploadRequest {
//!     file_id: "f-1".to_string(),
//!     owner: "ada".to_string(),
//!     file_name: "notes.txt".to_string(),
//!     size_bytes: 2048,
//!     checksum: "sha256:9f86d0".to_string(),
//! };
//! engine
//!     .start_saga(&ctx, FILE_UPLOAD_SAGA, "upload-f-1", request.to_payload()?)
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod memory;
mod ports;
mod saga;

pub use memory::{
    InMemoryBlobStore, InMemoryFileRegistry, InMemoryNotifier, InMemoryQuotaLedger, StoredBlob,
};
pub use ports::{BlobStore, FileRegistry, Notifier, QuotaLedger, RegisteredFile};
pub use saga::{FILE_UPLOAD_SAGA, FileUploadRequest, FileUploadSaga, UploadServices, UploadTimeouts};
