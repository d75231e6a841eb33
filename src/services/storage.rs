use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use crate::models::job::BlobLocation;

/// Durable blob storage for raw uploads and processed results.
///
/// Writes are last-writer-wins per location; there is no conditional put.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, location: &BlobLocation, data: &[u8], content_type: &str) -> Result<(), StoreError>;

    /// Returns `StoreError::NotFound` when nothing is stored at `location`.
    async fn get(&self, location: &BlobLocation) -> Result<Vec<u8>, StoreError>;

    async fn exists(&self, location: &BlobLocation) -> Result<bool, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("artifact not found: {0}")]
    NotFound(BlobLocation),

    #[error("storage returned HTTP {status} for {location}")]
    Status { location: BlobLocation, status: u16 },

    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StoreError::NotFound(_) | StoreError::Config(_))
    }
}

/// S3-compatible object storage; each container maps to a bucket.
pub struct S3ArtifactStore {
    region: Region,
    credentials: Credentials,
    path_style: bool,
    health_container: String,
}

impl S3ArtifactStore {
    pub fn new(
        endpoint: &str,
        region: &str,
        access_key: Option<&str>,
        secret_key: Option<&str>,
        health_container: &str,
    ) -> Result<Self, StoreError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials = Credentials::new(access_key, secret_key, None, None, None)
            .map_err(|e| StoreError::Config(e.to_string()))?;

        Ok(Self {
            region,
            credentials,
            path_style: true,
            health_container: health_container.to_string(),
        })
    }

    fn bucket(&self, container: &str) -> Result<Box<Bucket>, StoreError> {
        let bucket = Bucket::new(container, self.region.clone(), self.credentials.clone())
            .map_err(|e| StoreError::Config(e.to_string()))?;
        Ok(if self.path_style {
            bucket.with_path_style()
        } else {
            bucket
        })
    }
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn put(&self, location: &BlobLocation, data: &[u8], content_type: &str) -> Result<(), StoreError> {
        let response = self
            .bucket(&location.container)?
            .put_object_with_content_type(&location.blob_name, data, content_type)
            .await?;

        let status = response.status_code();
        if !is_success(status) {
            return Err(StoreError::Status { location: location.clone(), status });
        }
        Ok(())
    }

    async fn get(&self, location: &BlobLocation) -> Result<Vec<u8>, StoreError> {
        let response = self
            .bucket(&location.container)?
            .get_object(&location.blob_name)
            .await?;

        match response.status_code() {
            404 => Err(StoreError::NotFound(location.clone())),
            status if is_success(status) => Ok(response.bytes().to_vec()),
            status => Err(StoreError::Status { location: location.clone(), status }),
        }
    }

    async fn exists(&self, location: &BlobLocation) -> Result<bool, StoreError> {
        let (_, status) = self
            .bucket(&location.container)?
            .head_object(&location.blob_name)
            .await?;

        match status {
            404 => Ok(false),
            status if is_success(status) => Ok(true),
            status => Err(StoreError::Status { location: location.clone(), status }),
        }
    }

    /// A HEAD on a sentinel key: 200 or 404 both prove the bucket answers.
    async fn health_check(&self) -> Result<(), StoreError> {
        let location = BlobLocation::new(&self.health_container, ".health");
        let (_, status) = self
            .bucket(&location.container)?
            .head_object(&location.blob_name)
            .await?;

        if status == 404 || is_success(status) {
            Ok(())
        } else {
            Err(StoreError::Status { location, status })
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub data: Vec<u8>,
    pub content_type: String,
}

/// In-process store used by tests and single-process runs.
#[derive(Default)]
pub struct MemoryArtifactStore {
    blobs: Mutex<HashMap<BlobLocation, StoredBlob>>,
    unavailable: AtomicBool,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every operation fails with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn remove(&self, location: &BlobLocation) -> Option<StoredBlob> {
        self.blobs.lock().await.remove(location)
    }

    pub async fn blob(&self, location: &BlobLocation) -> Option<StoredBlob> {
        self.blobs.lock().await.get(location).cloned()
    }

    /// Blob names stored in `container`, sorted.
    pub async fn blob_names(&self, container: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .blobs
            .lock()
            .await
            .keys()
            .filter(|location| location.container == container)
            .map(|location| location.blob_name.clone())
            .collect();
        names.sort();
        names
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, location: &BlobLocation, data: &[u8], content_type: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.blobs.lock().await.insert(
            location.clone(),
            StoredBlob {
                data: data.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn get(&self, location: &BlobLocation) -> Result<Vec<u8>, StoreError> {
        self.check_available()?;
        self.blobs
            .lock()
            .await
            .get(location)
            .map(|blob| blob.data.clone())
            .ok_or_else(|| StoreError::NotFound(location.clone()))
    }

    async fn exists(&self, location: &BlobLocation) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.blobs.lock().await.contains_key(location))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}
