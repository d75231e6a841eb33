use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::defect::DefectFindings;
use crate::models::job::{BlobLocation, ImageJob};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultTimestamps {
    pub ingested_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}

/// Job metadata echoed into the processed artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultMetadata {
    pub product_sku: String,
    pub facility: String,
    pub source_blob: BlobLocation,
    pub content_type: String,
    #[serde(default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The processed artifact written once per image by the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessedResult {
    pub image_id: Uuid,
    pub timestamps: ResultTimestamps,
    pub metadata: ResultMetadata,
    pub defect_findings: DefectFindings,
    pub model_version: String,
}

impl ProcessedResult {
    pub fn new(
        job: &ImageJob,
        findings: DefectFindings,
        model_version: &str,
        processed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            image_id: job.image_id,
            timestamps: ResultTimestamps {
                ingested_at: job.received_at,
                processed_at,
            },
            metadata: ResultMetadata {
                product_sku: job.product_sku.clone(),
                facility: job.facility.clone(),
                source_blob: job.raw_location(),
                content_type: job.content_type.clone(),
                extra: job.metadata.clone(),
            },
            defect_findings: findings,
            model_version: model_version.to_string(),
        }
    }

    /// Schema gate applied before a result is persisted.
    pub fn check_schema(&self) -> Result<(), String> {
        if self.model_version.trim().is_empty() {
            return Err("model_version is empty".to_string());
        }
        self.defect_findings.check_schema()
    }
}
