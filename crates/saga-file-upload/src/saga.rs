use std::sync::Arc;
use std::time::Duration;

use saga_core::{ErrorCode, Payload, Result, RetryPolicy, SagaError};
use saga_engine::{SagaDefinition, SagaStepDefinition, StepInvocation, StepResult};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::ports::{BlobStore, FileRegistry, Notifier, QuotaLedger, RegisteredFile};

/// Name the saga registers under.
pub const FILE_UPLOAD_SAGA: &str = "file_upload";

const MEBIBYTE: u64 = 1024 * 1024;

/// Saga context for one upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUploadRequest {
    pub file_id: String,
    pub owner: String,
    pub file_name: String,
    pub size_bytes: u64,
    pub checksum: String,
}

impl FileUploadRequest {
    #[must_use]
    pub fn blob_key(&self) -> String {
        format!("uploads/{}/{}", self.owner, self.file_id)
    }

    /// # Errors
    ///
    /// Returns `SerializationFailed` if the request cannot be encoded.
    pub fn to_payload(&self) -> Result<Payload> {
        Payload::encode(self)
    }
}

/// How long an upload may take end to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadTimeouts {
    pub base: Duration,
    pub per_mebibyte: Duration,
    pub max: Duration,
}

impl Default for UploadTimeouts {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            per_mebibyte: Duration::from_secs(2),
            max: Duration::from_secs(60 * 60),
        }
    }
}

impl UploadTimeouts {
    /// `base` plus `per_mebibyte` for every started mebibyte, capped at `max`.
    #[must_use]
    pub fn for_size(&self, size_bytes: u64) -> Duration {
        let mebibytes = u32::try_from(size_bytes.div_ceil(MEBIBYTE)).unwrap_or(u32::MAX);
        self.per_mebibyte
            .checked_mul(mebibytes)
            .and_then(|transfer| self.base.checked_add(transfer))
            .map_or(self.max, |total| total.min(self.max))
    }
}

/// Services the upload steps talk to.
#[derive(Clone)]
pub struct UploadServices {
    pub blobs: Arc<dyn BlobStore>,
    pub registry: Arc<dyn FileRegistry>,
    pub quota: Arc<dyn QuotaLedger>,
    pub notifier: Arc<dyn Notifier>,
}

/// Stores a file, registers it, charges the owner's quota and tells them.
///
/// Failing to charge the quota deletes the blob and the registry entry
/// again. Notification is best effort and never rolls the upload back.
pub struct FileUploadSaga {
    steps: Vec<SagaStepDefinition>,
    timeouts: UploadTimeouts,
    max_file_size: u64,
    retry_policy: Option<RetryPolicy>,
}

impl FileUploadSaga {
    #[must_use]
    pub fn new(services: UploadServices) -> Self {
        Self {
            steps: upload_steps(&services),
            timeouts: UploadTimeouts::default(),
            max_file_size: 5 * 1024 * MEBIBYTE,
            retry_policy: None,
        }
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: UploadTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    #[must_use]
    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

impl SagaDefinition for FileUploadSaga {
    fn saga_type(&self) -> &str {
        FILE_UPLOAD_SAGA
    }

    fn steps(&self) -> &[SagaStepDefinition] {
        &self.steps
    }

    fn validate_context(&self, context: &Payload) -> Result<()> {
        let invalid = |message: String| SagaError::new(ErrorCode::InvalidContext, message);
        let request: FileUploadRequest = context
            .decode()
            .map_err(|e| invalid("context is not an upload request".to_string()).with_source(e))?;

        for (field, value) in [
            ("file_id", &request.file_id),
            ("owner", &request.owner),
            ("file_name", &request.file_name),
            ("checksum", &request.checksum),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(format!("{field} must not be empty")));
            }
        }
        if request.size_bytes == 0 {
            return Err(invalid("file is empty".to_string()));
        }
        if request.size_bytes > self.max_file_size {
            return Err(invalid(format!(
                "file is {} bytes, limit is {}",
                request.size_bytes, self.max_file_size
            )));
        }
        Ok(())
    }

    fn calculate_timeout(&self, context: &Payload) -> Duration {
        context
            .decode::<FileUploadRequest>()
            .map_or(self.timeouts.base, |request| {
                self.timeouts.for_size(request.size_bytes)
            })
    }

    fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }
}

fn upload_steps(services: &UploadServices) -> Vec<SagaStepDefinition> {
    let blobs = Arc::clone(&services.blobs);
    let blobs_undo = Arc::clone(&services.blobs);
    let registry = Arc::clone(&services.registry);
    let registry_undo = Arc::clone(&services.registry);
    let quota = Arc::clone(&services.quota);
    let quota_undo = Arc::clone(&services.quota);
    let notifier = Arc::clone(&services.notifier);

    vec![
        SagaStepDefinition::new("store_blob", move |invocation| {
            store_blob(Arc::clone(&blobs), invocation)
        })
        .with_compensation(move |invocation| delete_blob(Arc::clone(&blobs_undo), invocation))
        .with_compensation_description("delete stored blob")
        .idempotent()
        .critical(),
        SagaStepDefinition::new("register_file", move |invocation| {
            register_file(Arc::clone(&registry), invocation)
        })
        .with_compensation(move |invocation| {
            unregister_file(Arc::clone(&registry_undo), invocation)
        })
        .with_compensation_description("remove registry entry")
        .requires("store_blob")
        .idempotent()
        .critical(),
        SagaStepDefinition::new("charge_quota", move |invocation| {
            charge_quota(Arc::clone(&quota), invocation)
        })
        .with_compensation(move |invocation| refund_quota(Arc::clone(&quota_undo), invocation))
        .with_compensation_description("refund charged quota")
        .critical(),
        SagaStepDefinition::new("publish_notification", move |invocation| {
            publish_notification(Arc::clone(&notifier), invocation)
        })
        .requires("register_file")
        .idempotent(),
    ]
}

async fn store_blob(blobs: Arc<dyn BlobStore>, invocation: StepInvocation) -> StepResult<Payload> {
    let request: FileUploadRequest = invocation.input.decode()?;
    let key = request.blob_key();
    blobs
        .put(&key, request.size_bytes, &request.checksum)
        .await?;
    info!(
        saga_id = %invocation.saga_id,
        key = %key,
        size_bytes = request.size_bytes,
        "blob stored"
    );
    Ok(Payload::encode(&json!({ "blob_key": key }))?)
}

async fn delete_blob(blobs: Arc<dyn BlobStore>, invocation: StepInvocation) -> StepResult<()> {
    let request: FileUploadRequest = invocation.input.decode()?;
    blobs.delete(&request.blob_key()).await?;
    Ok(())
}

async fn register_file(
    registry: Arc<dyn FileRegistry>,
    invocation: StepInvocation,
) -> StepResult<Payload> {
    let request: FileUploadRequest = invocation.input.decode()?;
    let file = RegisteredFile {
        blob_key: request.blob_key(),
        file_id: request.file_id,
        owner: request.owner,
        file_name: request.file_name,
        size_bytes: request.size_bytes,
    };
    registry.register(&file).await?;
    Ok(Payload::encode(&json!({ "registered": true }))?)
}

async fn unregister_file(
    registry: Arc<dyn FileRegistry>,
    invocation: StepInvocation,
) -> StepResult<()> {
    let request: FileUploadRequest = invocation.input.decode()?;
    registry.unregister(&request.file_id).await?;
    Ok(())
}

async fn charge_quota(quota: Arc<dyn QuotaLedger>, invocation: StepInvocation) -> StepResult<Payload> {
    let request: FileUploadRequest = invocation.input.decode()?;
    quota.charge(&request.owner, request.size_bytes).await?;
    Ok(Payload::encode(&json!({ "quota_charged": request.size_bytes }))?)
}

async fn refund_quota(quota: Arc<dyn QuotaLedger>, invocation: StepInvocation) -> StepResult<()> {
    let request: FileUploadRequest = invocation.input.decode()?;
    quota.refund(&request.owner, request.size_bytes).await?;
    Ok(())
}

async fn publish_notification(
    notifier: Arc<dyn Notifier>,
    invocation: StepInvocation,
) -> StepResult<Payload> {
    let request: FileUploadRequest = invocation.input.decode()?;
    let message = format!("'{}' is ready", request.file_name);
    let notified = match notifier.notify(&request.owner, &message).await {
        Ok(()) => true,
        Err(e) => {
            warn!(
                saga_id = %invocation.saga_id,
                owner = %request.owner,
                error = %e,
                "upload notification not delivered"
            );
            false
        }
    };
    Ok(Payload::encode(&json!({ "notified": notified }))?)
}
