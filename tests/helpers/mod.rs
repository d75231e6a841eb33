//! Test helpers: scripted inference stub, in-memory pipeline and HTTP server

use async_trait::async_trait;
use reqwest::multipart;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use cutlery_inspect::app_state::AppState;
use cutlery_inspect::models::defect::DefectFindings;
use cutlery_inspect::models::job::{BlobLocation, ImageJob};
use cutlery_inspect::models::result::ProcessedResult;
use cutlery_inspect::routes;
use cutlery_inspect::services::inference::{
    parse_model_output, InferenceClient, InferenceError, InferenceRequest,
};
use cutlery_inspect::services::ingestion::{IngestSettings, IngestionService, UploadRequest};
use cutlery_inspect::services::processor::{Disposition, Processor, ProcessorSettings};
use cutlery_inspect::services::queue::{JobQueue, MemoryJobQueue, QueueSettings};
use cutlery_inspect::services::storage::{ArtifactStore, MemoryArtifactStore};
use cutlery_inspect::services::validation::ValidationRules;

use crate::fixtures::JPEG_BYTES;

pub const RAW_CONTAINER: &str = "raw-images";
pub const PROCESSED_CONTAINER: &str = "processed-images";
pub const MODEL_VERSION: &str = "stub-vision-1";

/// One scripted answer from the stub model.
#[derive(Debug, Clone)]
pub enum StubReply {
    /// Raw model text, run through the real output parser.
    Text(String),
    Fail(InferenceError),
    /// Never answers; the processor's timeout has to fire.
    Hang,
}

/// Inference client that replays scripted replies and records call statistics.
pub struct StubInference {
    script: Mutex<VecDeque<StubReply>>,
    fallback: StubReply,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl StubInference {
    /// Always answers with `reply`.
    pub fn always(reply: StubReply) -> Self {
        Self::scripted(Vec::new(), reply)
    }

    /// Answers from `script` in order, then with `fallback`.
    pub fn scripted(script: Vec<StubReply>, fallback: StubReply) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping `analyze` calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self) -> StubReply {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

pub fn text(reply: &str) -> StubReply {
    StubReply::Text(reply.to_string())
}

#[async_trait]
impl InferenceClient for StubInference {
    async fn analyze(&self, _request: &InferenceRequest<'_>) -> Result<DefectFindings, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let reply = self.next_reply();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let result = match reply {
            StubReply::Text(body) => parse_model_output(&body),
            StubReply::Fail(error) => Err(error),
            StubReply::Hang => std::future::pending().await,
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn model_version(&self) -> &str {
        MODEL_VERSION
    }
}

/// In-memory store, queue and stub model wired together like production.
pub struct Pipeline {
    pub store: Arc<MemoryArtifactStore>,
    pub queue: Arc<MemoryJobQueue>,
    pub inference: Arc<StubInference>,
    pub ingestion: IngestionService,
    pub processor_settings: ProcessorSettings,
}

pub fn ingest_settings() -> IngestSettings {
    IngestSettings {
        raw_container: RAW_CONTAINER.to_string(),
        processed_container: PROCESSED_CONTAINER.to_string(),
        rules: ValidationRules {
            max_image_bytes: 64 * 1024,
            allowed_facilities: vec![
                "hongkong".to_string(),
                "shenzhen".to_string(),
                "yangjiang".to_string(),
            ],
            allowed_product_skus: Vec::new(),
        },
    }
}

/// Redelivers immediately so tests can drain retries without waiting.
pub fn instant_redelivery() -> QueueSettings {
    QueueSettings {
        visibility_timeout: Duration::ZERO,
        ..QueueSettings::default()
    }
}

impl Pipeline {
    pub fn new(inference: StubInference) -> Self {
        Self::with_settings(inference, instant_redelivery(), ProcessorSettings::default())
    }

    pub fn with_settings(
        inference: StubInference,
        queue_settings: QueueSettings,
        processor_settings: ProcessorSettings,
    ) -> Self {
        let store = Arc::new(MemoryArtifactStore::new());
        let queue = Arc::new(MemoryJobQueue::new(queue_settings));
        let ingestion = IngestionService::new(store.clone(), queue.clone(), ingest_settings());
        Self {
            store,
            queue,
            inference: Arc::new(inference),
            ingestion,
            processor_settings,
        }
    }

    /// A fresh worker sharing this pipeline's store, queue and model.
    pub fn worker(&self) -> Processor {
        Processor::new(
            self.store.clone(),
            self.queue.clone(),
            self.inference.clone(),
            self.processor_settings.clone(),
        )
    }

    pub async fn ingest_jpeg(&self, product_sku: &str, facility: &str) -> Uuid {
        let receipt = self
            .ingestion
            .ingest(UploadRequest {
                image: JPEG_BYTES.to_vec(),
                filename: Some("sample.jpg".to_string()),
                content_type: Some("image/jpeg".to_string()),
                product_sku: product_sku.to_string(),
                facility: facility.to_string(),
                metadata: None,
            })
            .await
            .expect("ingest failed");
        receipt.image_id
    }

    /// The queued job for `image_id`, decoded from its message body.
    pub async fn queued_job(&self, image_id: Uuid) -> ImageJob {
        let id = image_id.to_string();
        let (_, body) = self
            .queue
            .pending_messages()
            .await
            .into_iter()
            .find(|(message_id, _)| *message_id == id)
            .expect("job not queued");
        ImageJob::from_body(&body).expect("queued body does not decode")
    }

    pub async fn processed(&self, image_id: Uuid) -> Option<ProcessedResult> {
        let location = BlobLocation::new(PROCESSED_CONTAINER, format!("{image_id}.json"));
        let blob = self.store.blob(&location).await?;
        Some(serde_json::from_slice(&blob.data).expect("processed artifact is not a ProcessedResult"))
    }

    /// Process messages one at a time until none is visible.
    pub async fn drain(&self, worker: &Processor) -> Vec<Disposition> {
        let mut dispositions = Vec::new();
        while let Some(disposition) = worker.process_next().await.expect("settlement failed") {
            dispositions.push(disposition);
        }
        dispositions
    }

    /// Serve the real API router on an ephemeral port; returns the base URL.
    pub async fn spawn_server(&self, api_key: Option<&str>) -> String {
        let store: Arc<dyn ArtifactStore> = self.store.clone();
        let queue: Arc<dyn JobQueue> = self.queue.clone();
        let ingestion = IngestionService::new(store.clone(), queue.clone(), ingest_settings());
        let state = AppState::new(store, queue, ingestion, api_key.map(str::to_string));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, routes::api_router(state))
                .await
                .expect("test server failed");
        });
        format!("http://{addr}")
    }
}

/// POST a multipart upload to /ingest.
pub async fn upload_image(
    client: &reqwest::Client,
    base_url: &str,
    image: &[u8],
    filename: &str,
    mime: &str,
    product_sku: &str,
    facility: &str,
) -> reqwest::Response {
    let form = multipart::Form::new()
        .part(
            "image",
            multipart::Part::bytes(image.to_vec())
                .file_name(filename.to_string())
                .mime_str(mime)
                .expect("valid mime"),
        )
        .text("product_sku", product_sku.to_string())
        .text("facility", facility.to_string())
        .text("metadata", r#"{"line": "B3", "shift": "night"}"#);

    client
        .post(format!("{base_url}/ingest"))
        .multipart(form)
        .send()
        .await
        .expect("upload request failed")
}
