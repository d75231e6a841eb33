use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Address of a blob in the artifact store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BlobLocation {
    pub container: String,
    pub blob_name: String,
}

impl BlobLocation {
    pub fn new(container: impl Into<String>, blob_name: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            blob_name: blob_name.into(),
        }
    }
}

impl std::fmt::Display for BlobLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.container, self.blob_name)
    }
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

/// A defect analysis job, serialized as the queue message body.
///
/// Produced once by the ingestion service and never mutated afterwards; the
/// delivery count lives on the queue envelope, not here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageJob {
    pub image_id: Uuid,
    pub blob_name: String,
    pub raw_container: String,
    pub processed_container: String,
    pub product_sku: String,
    pub facility: String,
    pub received_at: DateTime<Utc>,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ImageJob {
    /// Decode a queue body, rejecting payloads with blank required fields.
    pub fn from_body(body: &str) -> Result<Self, JobDecodeError> {
        let job: ImageJob = serde_json::from_str(body)?;

        let required = [
            ("blob_name", &job.blob_name),
            ("raw_container", &job.raw_container),
            ("processed_container", &job.processed_container),
            ("product_sku", &job.product_sku),
            ("facility", &job.facility),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(JobDecodeError::MissingField(field));
            }
        }

        Ok(job)
    }

    pub fn raw_location(&self) -> BlobLocation {
        BlobLocation::new(&self.raw_container, &self.blob_name)
    }

    pub fn processed_location(&self) -> BlobLocation {
        BlobLocation::new(&self.processed_container, processed_blob_name(self.image_id))
    }
}

/// Canonical name of the processed artifact for an image.
pub fn processed_blob_name(image_id: Uuid) -> String {
    format!("{image_id}.json")
}

#[derive(Debug, thiserror::Error)]
pub enum JobDecodeError {
    #[error("message body is not a valid job: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message body has an empty `{0}` field")]
    MissingField(&'static str),
}
