use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::services::azure_openai::AzureOpenAiClient;
use crate::services::bedrock::BedrockClient;
use crate::services::inference::InferenceClient;
use crate::services::ingestion::IngestSettings;
use crate::services::processor::{ProcessorSettings, RunOptions};
use crate::services::queue::{QueueError, QueueSettings, RedisJobQueue};
use crate::services::storage::{S3ArtifactStore, StoreError};
use crate::services::validation::ValidationRules;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InferenceProvider {
    AzureOpenai,
    Bedrock,
}

/// Settings shared by the API server and the worker, read from the environment.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Ignored by the worker.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Redis connection string for the job queue
    pub redis_url: String,

    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    #[serde(default = "default_visibility_timeout_secs")]
    pub queue_visibility_timeout_secs: u64,

    /// Zero disables duplicate detection
    #[serde(default = "default_duplicate_window_secs")]
    pub queue_duplicate_window_secs: u64,

    /// S3-compatible endpoint URL (AWS, MinIO, R2)
    pub s3_endpoint: String,

    #[serde(default = "default_s3_region")]
    pub s3_region: String,

    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,

    #[serde(default = "default_raw_container")]
    pub raw_container: String,

    #[serde(default = "default_processed_container")]
    pub processed_container: String,

    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,

    /// Comma-separated facility whitelist
    #[serde(default = "default_allowed_facilities")]
    pub allowed_facilities: String,

    /// Comma-separated SKU whitelist; empty accepts any well-formed code
    #[serde(default)]
    pub allowed_product_skus: String,

    /// Required `X-API-Key` value; unset leaves the API open
    pub api_key: Option<String>,

    #[serde(default = "default_max_in_flight")]
    pub worker_max_in_flight: usize,

    #[serde(default = "default_max_delivery_attempts")]
    pub worker_max_delivery_attempts: u32,

    #[serde(default = "default_poll_interval_ms")]
    pub worker_poll_interval_ms: u64,

    pub worker_max_messages: Option<u64>,

    #[serde(default)]
    pub worker_exit_when_idle: bool,

    /// Address for the worker's Prometheus scrape listener
    pub worker_metrics_addr: Option<String>,

    #[serde(default = "default_inference_provider")]
    pub inference_provider: InferenceProvider,

    #[serde(default = "default_inference_timeout_secs")]
    pub inference_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub retry_malformed_responses: bool,

    pub azure_openai_endpoint: Option<String>,
    pub azure_openai_api_key: Option<String>,
    pub azure_openai_deployment: Option<String>,

    #[serde(default = "default_azure_api_version")]
    pub azure_openai_api_version: String,

    pub bedrock_region: Option<String>,
    pub bedrock_model_id: Option<String>,
    pub bedrock_api_key: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_queue_name() -> String {
    "defect-jobs".to_string()
}

fn default_visibility_timeout_secs() -> u64 {
    300
}

fn default_duplicate_window_secs() -> u64 {
    600
}

fn default_s3_region() -> String {
    "auto".to_string()
}

fn default_raw_container() -> String {
    "raw-images".to_string()
}

fn default_processed_container() -> String {
    "processed-images".to_string()
}

fn default_max_image_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_allowed_facilities() -> String {
    "hongkong,shenzhen,yangjiang".to_string()
}

fn default_max_in_flight() -> usize {
    4
}

fn default_max_delivery_attempts() -> u32 {
    5
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_inference_provider() -> InferenceProvider {
    InferenceProvider::AzureOpenai
}

fn default_inference_timeout_secs() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn default_azure_api_version() -> String {
    "2024-10-21".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("{0} must be set for the selected inference provider")]
    Missing(&'static str),

    #[error("Invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn required<'a>(value: &'a Option<String>, var: &'static str) -> Result<&'a str, ConfigError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(var))
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: AppConfig = envy::from_env()?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.worker_max_delivery_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "WORKER_MAX_DELIVERY_ATTEMPTS",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_image_bytes == 0 {
            return Err(ConfigError::Invalid {
                var: "MAX_IMAGE_BYTES",
                reason: "must be positive".to_string(),
            });
        }
        if self.facilities().is_empty() {
            return Err(ConfigError::Invalid {
                var: "ALLOWED_FACILITIES",
                reason: "at least one facility is required".to_string(),
            });
        }
        Ok(())
    }

    pub fn facilities(&self) -> Vec<String> {
        split_list(&self.allowed_facilities)
            .into_iter()
            .map(|f| f.to_lowercase())
            .collect()
    }

    pub fn product_skus(&self) -> Vec<String> {
        split_list(&self.allowed_product_skus)
            .into_iter()
            .map(|s| s.to_uppercase())
            .collect()
    }

    /// The queue's own delivery ceiling equals the worker's, so a message whose
    /// worker dies on every attempt is still dead-lettered.
    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            name: self.queue_name.clone(),
            visibility_timeout: Duration::from_secs(self.queue_visibility_timeout_secs),
            max_delivery_count: self.worker_max_delivery_attempts,
            duplicate_window: Duration::from_secs(self.queue_duplicate_window_secs),
        }
    }

    pub fn ingest_settings(&self) -> IngestSettings {
        IngestSettings {
            raw_container: self.raw_container.clone(),
            processed_container: self.processed_container.clone(),
            rules: ValidationRules {
                max_image_bytes: self.max_image_bytes,
                allowed_facilities: self.facilities(),
                allowed_product_skus: self.product_skus(),
            },
        }
    }

    pub fn processor_settings(&self) -> ProcessorSettings {
        ProcessorSettings {
            max_delivery_attempts: self.worker_max_delivery_attempts,
            inference_timeout: Duration::from_secs(self.inference_timeout_secs),
            retry_malformed_responses: self.retry_malformed_responses,
        }
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            max_in_flight: self.worker_max_in_flight.max(1),
            poll_interval: Duration::from_millis(self.worker_poll_interval_ms),
            max_messages: self.worker_max_messages,
            exit_when_idle: self.worker_exit_when_idle,
        }
    }

    pub fn build_store(&self) -> Result<S3ArtifactStore, StoreError> {
        S3ArtifactStore::new(
            &self.s3_endpoint,
            &self.s3_region,
            self.s3_access_key.as_deref(),
            self.s3_secret_key.as_deref(),
            &self.raw_container,
        )
    }

    pub fn build_queue(&self) -> Result<RedisJobQueue, QueueError> {
        RedisJobQueue::new(&self.redis_url, self.queue_settings())
    }

    /// Build the client for `INFERENCE_PROVIDER`, checking its credentials.
    pub fn build_inference_client(&self) -> Result<Arc<dyn InferenceClient>, ConfigError> {
        let timeout = Duration::from_secs(self.inference_timeout_secs);

        match self.inference_provider {
            InferenceProvider::AzureOpenai => {
                let client = AzureOpenAiClient::new(
                    required(&self.azure_openai_endpoint, "AZURE_OPENAI_ENDPOINT")?,
                    required(&self.azure_openai_deployment, "AZURE_OPENAI_DEPLOYMENT")?,
                    &self.azure_openai_api_version,
                    required(&self.azure_openai_api_key, "AZURE_OPENAI_API_KEY")?,
                    timeout,
                )
                .map_err(|e| ConfigError::Invalid {
                    var: "AZURE_OPENAI_ENDPOINT",
                    reason: e.to_string(),
                })?;
                Ok(Arc::new(client))
            }
            InferenceProvider::Bedrock => {
                let client = BedrockClient::new(
                    required(&self.bedrock_region, "BEDROCK_REGION")?,
                    required(&self.bedrock_model_id, "BEDROCK_MODEL_ID")?,
                    required(&self.bedrock_api_key, "BEDROCK_API_KEY")?,
                    timeout,
                )
                .map_err(|e| ConfigError::Invalid {
                    var: "BEDROCK_REGION",
                    reason: e.to_string(),
                })?;
                Ok(Arc::new(client))
            }
        }
    }
}
