mod fixtures;

use cutlery_inspect::{
    config::AppConfig,
    models::job::{BlobLocation, ImageJob},
    services::{
        inference::{build_prompt, InferenceRequest},
        queue::{DeadLetterReason, EnqueueOutcome, JobQueue},
        storage::{ArtifactStore, StoreError},
    },
};
use chrono::Utc;
use tokio_test::assert_ok;
use uuid::Uuid;

use fixtures::JPEG_BYTES;

/// Integration test: storage and queue against real backends
///
/// Requires REDIS_URL, S3_ENDPOINT and credentials in the environment, with
/// the raw and processed buckets already created.
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_store_and_queue_round_trip() {
    let config = AppConfig::from_env().expect("Failed to load config");
    let store = config.build_store().expect("Failed to initialize store");
    let queue = config.build_queue().expect("Failed to initialize queue");

    assert_ok!(store.health_check().await);
    assert_ok!(queue.health_check().await);

    // 1. Raw image upload and download
    let image_id = Uuid::new_v4();
    let raw = BlobLocation::new(&config.raw_container, format!("{image_id}.jpg"));
    store
        .put(&raw, JPEG_BYTES, "image/jpeg")
        .await
        .expect("Upload failed");
    assert!(store.exists(&raw).await.expect("HEAD failed"));
    assert_eq!(store.get(&raw).await.expect("Download failed"), JPEG_BYTES);

    // 2. Missing blobs are NotFound, not a transport error
    let missing = BlobLocation::new(&config.processed_container, format!("{image_id}.json"));
    assert!(!store.exists(&missing).await.expect("HEAD failed"));
    assert!(matches!(store.get(&missing).await, Err(StoreError::NotFound(_))));

    // 3. Enqueue, lease and complete
    let job = ImageJob {
        image_id,
        blob_name: raw.blob_name.clone(),
        raw_container: config.raw_container.clone(),
        processed_container: config.processed_container.clone(),
        product_sku: "WK-KN-200".to_string(),
        facility: "yangjiang".to_string(),
        received_at: Utc::now(),
        content_type: "image/jpeg".to_string(),
        metadata: serde_json::Map::new(),
    };
    assert_eq!(queue.enqueue(&job).await.unwrap(), EnqueueOutcome::Enqueued);
    if config.queue_duplicate_window_secs > 0 {
        assert_eq!(queue.enqueue(&job).await.unwrap(), EnqueueOutcome::Duplicate);
    }

    let message = queue
        .receive()
        .await
        .expect("Receive failed")
        .expect("No message in queue");
    assert_eq!(message.message_id, image_id.to_string());
    assert_eq!(message.delivery_count, 1);
    assert_eq!(ImageJob::from_body(&message.body).unwrap(), job);

    queue.complete(&message).await.expect("Complete failed");
    assert!(queue.complete(&message).await.is_err(), "second settlement must lose the lock");
}

#[tokio::test]
#[ignore]
async fn test_dead_letter_is_listed() {
    let config = AppConfig::from_env().expect("Failed to load config");
    let queue = config.build_queue().expect("Failed to initialize queue");

    let job = ImageJob {
        image_id: Uuid::new_v4(),
        blob_name: "never-uploaded.jpg".to_string(),
        raw_container: config.raw_container.clone(),
        processed_container: config.processed_container.clone(),
        product_sku: "WK-FK-110".to_string(),
        facility: "shenzhen".to_string(),
        received_at: Utc::now(),
        content_type: "image/jpeg".to_string(),
        metadata: serde_json::Map::new(),
    };
    queue.enqueue(&job).await.unwrap();
    let message = queue.receive().await.unwrap().expect("No message in queue");

    queue
        .dead_letter(&message, DeadLetterReason::MissingRawArtifact, "integration test")
        .await
        .expect("Dead-letter failed");

    let records = queue.dead_letters(10).await.unwrap();
    let record = records
        .iter()
        .find(|r| r.message_id == message.message_id)
        .expect("Dead-letter record not listed");
    assert_eq!(record.reason, DeadLetterReason::MissingRawArtifact);
    assert_eq!(record.body, message.body);
}

/// Live model call. Needs provider credentials and INSPECT_SAMPLE_IMAGE
/// pointing at a real product photo.
#[tokio::test]
#[ignore]
async fn test_live_inference_returns_valid_findings() {
    let config = AppConfig::from_env().expect("Failed to load config");
    let client = config
        .build_inference_client()
        .expect("Failed to initialize inference client");
    let path = std::env::var("INSPECT_SAMPLE_IMAGE").expect("INSPECT_SAMPLE_IMAGE not set");
    let image = std::fs::read(&path).expect("Failed to read sample image");

    let metadata = serde_json::Map::new();
    let request = InferenceRequest {
        image: &image,
        media_type: "image/jpeg",
        product_sku: "WK-KN-200",
        facility: "yangjiang",
        metadata: &metadata,
    };
    assert!(build_prompt(request.product_sku, request.facility, request.metadata).contains("WK-KN-200"));

    let findings = client.analyze(&request).await.expect("Inference failed");
    findings.check_schema().expect("Findings violate schema");
    println!("{} -> {findings:?}", client.model_version());
}
