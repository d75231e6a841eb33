use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JSON form of an upload: base64 image (optionally a data URL) plus metadata.
#[derive(Debug, Deserialize)]
pub struct IngestJsonRequest {
    pub image: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub product_sku: String,
    #[serde(default)]
    pub facility: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Response after an image has been stored and queued.
#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub image_id: Uuid,
    pub blob_name: String,
    pub raw_container: String,
    pub queue: String,
    pub enqueued_at: DateTime<Utc>,
}

/// Response for a processed-result lookup.
#[derive(Debug, Serialize)]
pub struct ResultStatusResponse {
    pub image_id: Uuid,
    pub status: String,
    pub result: Option<serde_json::Value>,
}
