use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::job::{BlobLocation, ImageJob};
use crate::services::queue::{EnqueueOutcome, JobQueue, QueueError};
use crate::services::storage::{ArtifactStore, StoreError};
use crate::services::validation::{self, ValidationError, ValidationRules};

/// Containers the ingestion side writes to and names in each job.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub raw_container: String,
    pub processed_container: String,
    pub rules: ValidationRules,
}

/// One inbound upload, before validation.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub image: Vec<u8>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub product_sku: String,
    pub facility: String,
    pub metadata: Option<Value>,
}

/// What the caller gets back once the image is stored and queued.
#[derive(Debug, Clone)]
pub struct IngestReceipt {
    pub image_id: Uuid,
    pub raw_location: BlobLocation,
    pub queue: String,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Rejected before anything was written; maps to 4xx.
    #[error(transparent)]
    InvalidInput(#[from] ValidationError),

    /// Store or queue failure; maps to 5xx.
    #[error(transparent)]
    DependencyUnavailable(#[from] DependencyError),
}

#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("failed to store raw image: {0}")]
    Store(#[from] StoreError),

    #[error("failed to enqueue job: {0}")]
    Queue(#[from] QueueError),
}

impl From<StoreError> for IngestError {
    fn from(e: StoreError) -> Self {
        IngestError::DependencyUnavailable(e.into())
    }
}

impl From<QueueError> for IngestError {
    fn from(e: QueueError) -> Self {
        IngestError::DependencyUnavailable(e.into())
    }
}

impl IngestError {
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, IngestError::InvalidInput(_))
    }
}

/// Producer side of the pipeline: validate, write raw, enqueue.
pub struct IngestionService {
    store: Arc<dyn ArtifactStore>,
    queue: Arc<dyn JobQueue>,
    settings: IngestSettings,
}

struct ValidatedUpload {
    mime: &'static str,
    extension: &'static str,
    product_sku: String,
    facility: String,
    metadata: Map<String, Value>,
}

impl IngestionService {
    pub fn new(store: Arc<dyn ArtifactStore>, queue: Arc<dyn JobQueue>, settings: IngestSettings) -> Self {
        Self {
            store,
            queue,
            settings,
        }
    }

    pub fn settings(&self) -> &IngestSettings {
        &self.settings
    }

    fn validate(&self, request: &UploadRequest) -> Result<ValidatedUpload, ValidationError> {
        let rules = &self.settings.rules;
        let format = validation::validate_image(
            &request.image,
            request.content_type.as_deref(),
            request.filename.as_deref(),
            rules.max_image_bytes,
        )?;
        let facility = validation::normalize_facility(&request.facility, &rules.allowed_facilities)?;
        let product_sku =
            validation::normalize_product_sku(&request.product_sku, &rules.allowed_product_skus)?;
        let metadata = validation::validate_metadata(request.metadata.clone())?;

        Ok(ValidatedUpload {
            mime: format.mime(),
            extension: format.extension(),
            product_sku,
            facility,
            metadata,
        })
    }

    /// Validate an upload, write the raw image, then enqueue exactly one job.
    ///
    /// A raw image written before a failed enqueue is left in place.
    pub async fn ingest(&self, request: UploadRequest) -> Result<IngestReceipt, IngestError> {
        let upload = match self.validate(&request) {
            Ok(upload) => upload,
            Err(e) => {
                tracing::info!(reason = %e, "Rejected upload");
                metrics::counter!("ingest_rejected_total").increment(1);
                return Err(e.into());
            }
        };

        let image_id = Uuid::new_v4();
        let job = ImageJob {
            image_id,
            blob_name: format!("{image_id}.{}", upload.extension),
            raw_container: self.settings.raw_container.clone(),
            processed_container: self.settings.processed_container.clone(),
            product_sku: upload.product_sku,
            facility: upload.facility,
            received_at: Utc::now(),
            content_type: upload.mime.to_string(),
            metadata: upload.metadata,
        };
        let raw_location = job.raw_location();

        self.store
            .put(&raw_location, &request.image, upload.mime)
            .await
            .inspect_err(|e| {
                tracing::error!(image_id = %image_id, error = %e, "Failed to write raw image");
            })?;

        let outcome = self.queue.enqueue(&job).await.inspect_err(|e| {
            tracing::error!(
                image_id = %image_id,
                blob = %raw_location,
                error = %e,
                "Enqueue failed after raw write; raw image left orphaned"
            );
        })?;

        if outcome == EnqueueOutcome::Duplicate {
            // Fresh ids never collide; a duplicate here means the queue already holds the job
            tracing::warn!(image_id = %image_id, "Queue reported duplicate message id");
        }

        metrics::counter!("ingest_accepted_total").increment(1);
        tracing::info!(
            image_id = %image_id,
            product_sku = %job.product_sku,
            facility = %job.facility,
            bytes = request.image.len(),
            "Image ingested and queued"
        );

        Ok(IngestReceipt {
            image_id,
            raw_location,
            queue: self.queue.name().to_string(),
            enqueued_at: Utc::now(),
        })
    }
}
