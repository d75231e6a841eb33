//! Queue consumer: turns one job message into one processed artifact.
//!
//! Per message the processor checks for an existing result, fetches the raw
//! image, calls the inference client under a hard timeout, persists the
//! validated result and settles the message. Recoverable failures are handled
//! only by leaving the message unsettled; the queue redelivers it once the
//! visibility timeout expires.

use chrono::Utc;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

use crate::models::job::ImageJob;
use crate::models::result::ProcessedResult;
use crate::services::inference::{InferenceClient, InferenceError, InferenceRequest};
use crate::services::queue::{DeadLetterReason, JobQueue, QueueError, ReceivedMessage};
use crate::services::storage::{ArtifactStore, StoreError};

const DEPTH_REFRESH_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    /// Delivery attempt at which a still-failing message is dead-lettered.
    pub max_delivery_attempts: u32,
    pub inference_timeout: Duration,
    /// Treat unparseable model output as transient (retry) instead of permanent.
    pub retry_malformed_responses: bool,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            max_delivery_attempts: 5,
            inference_timeout: Duration::from_secs(120),
            retry_malformed_responses: true,
        }
    }
}

/// How a message was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Result persisted and message acknowledged.
    Completed,
    /// A result already existed; acknowledged without inference.
    Skipped,
    /// Left unsettled for redelivery.
    Released { attempt: u32 },
    DeadLettered(DeadLetterReason),
}

impl Disposition {
    pub fn label(&self) -> &'static str {
        match self {
            Disposition::Completed => "completed",
            Disposition::Skipped => "skipped",
            Disposition::Released { .. } => "released",
            Disposition::DeadLettered(_) => "dead_lettered",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Failure {
    /// Retrying cannot help; dead-letter now.
    Permanent {
        reason: DeadLetterReason,
        detail: String,
    },
    /// Retry by redelivery until the attempt ceiling.
    Transient { kind: &'static str, detail: String },
}

enum Outcome {
    AlreadyProcessed,
    Persisted { defect_detected: bool },
}

/// Stop conditions and limits for [`Processor::run`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub max_in_flight: usize,
    pub poll_interval: Duration,
    /// Stop receiving after this many messages.
    pub max_messages: Option<u64>,
    /// Stop once the queue is empty and nothing is in flight.
    pub exit_when_idle: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            poll_interval: Duration::from_millis(1000),
            max_messages: None,
            exit_when_idle: false,
        }
    }
}

/// Counts of what a run did, logged on exit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub received: u64,
    pub completed: u64,
    pub skipped: u64,
    pub released: u64,
    pub dead_lettered: u64,
    pub errors: u64,
}

impl RunSummary {
    fn record(&mut self, joined: Result<Result<Disposition, QueueError>, JoinError>) {
        match joined {
            Ok(Ok(Disposition::Completed)) => self.completed += 1,
            Ok(Ok(Disposition::Skipped)) => self.skipped += 1,
            Ok(Ok(Disposition::Released { .. })) => self.released += 1,
            Ok(Ok(Disposition::DeadLettered(_))) => self.dead_lettered += 1,
            Ok(Err(_)) => self.errors += 1,
            Err(e) => {
                tracing::error!(error = %e, "Message task panicked or was cancelled");
                self.errors += 1;
            }
        }
    }
}

/// Shared, cheaply cloneable message processor.
#[derive(Clone)]
pub struct Processor {
    store: Arc<dyn ArtifactStore>,
    queue: Arc<dyn JobQueue>,
    inference: Arc<dyn InferenceClient>,
    settings: Arc<ProcessorSettings>,
}

impl Processor {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        queue: Arc<dyn JobQueue>,
        inference: Arc<dyn InferenceClient>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            store,
            queue,
            inference,
            settings: Arc::new(settings),
        }
    }

    /// Receive and process one message inline.
    /// Returns `Ok(None)` when no message is visible.
    pub async fn process_next(&self) -> Result<Option<Disposition>, QueueError> {
        match self.queue.receive().await? {
            Some(message) => self.process(&message).await.map(Some),
            None => Ok(None),
        }
    }

    /// Process one leased message end to end and settle it.
    ///
    /// An error means settlement itself failed (for example the lease was
    /// lost); the message then follows the queue's redelivery rules.
    pub async fn process(&self, message: &ReceivedMessage) -> Result<Disposition, QueueError> {
        let started = Instant::now();
        tracing::info!(
            message_id = %message.message_id,
            delivery_count = message.delivery_count,
            "Processing message"
        );

        let evaluation = self.evaluate(message).await;
        let disposition = self.settle(message, evaluation).await.inspect_err(|e| {
            tracing::warn!(
                message_id = %message.message_id,
                delivery_count = message.delivery_count,
                error = %e,
                "Failed to settle message"
            );
        })?;

        metrics::counter!("worker_messages_total", "disposition" => disposition.label()).increment(1);
        metrics::histogram!("worker_processing_seconds").record(started.elapsed().as_secs_f64());
        Ok(disposition)
    }

    async fn evaluate(&self, message: &ReceivedMessage) -> Result<Outcome, Failure> {
        let job = ImageJob::from_body(&message.body).map_err(|e| Failure::Permanent {
            reason: DeadLetterReason::InvalidMessage,
            detail: e.to_string(),
        })?;

        let processed = job.processed_location();
        if self.store.exists(&processed).await.map_err(store_failure)? {
            tracing::info!(image_id = %job.image_id, "Processed result exists, skipping inference");
            return Ok(Outcome::AlreadyProcessed);
        }

        let raw = job.raw_location();
        let image = match self.store.get(&raw).await {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound(location)) => {
                return Err(Failure::Permanent {
                    reason: DeadLetterReason::MissingRawArtifact,
                    detail: format!("raw image {location} does not exist"),
                })
            }
            Err(e) => return Err(store_failure(e)),
        };

        let request = InferenceRequest {
            image: &image,
            media_type: &job.content_type,
            product_sku: &job.product_sku,
            facility: &job.facility,
            metadata: &job.metadata,
        };

        let timeout = self.settings.inference_timeout;
        let inference_started = Instant::now();
        let analyzed = tokio::time::timeout(timeout, self.inference.analyze(&request))
            .await
            .unwrap_or(Err(InferenceError::Timeout(timeout)));
        let elapsed = inference_started.elapsed();

        let outcome = match &analyzed {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::histogram!("inference_duration_seconds", "outcome" => outcome)
            .record(elapsed.as_secs_f64());

        let findings = analyzed.map_err(|e| {
            tracing::warn!(
                image_id = %job.image_id,
                delivery_count = message.delivery_count,
                kind = e.kind(),
                error = %e,
                duration_ms = elapsed.as_millis() as u64,
                "Inference failed"
            );
            self.classify(e)
        })?;

        tracing::info!(
            image_id = %job.image_id,
            defect_detected = findings.defect_detected,
            confidence = findings.confidence,
            duration_ms = elapsed.as_millis() as u64,
            "Inference complete"
        );

        let result = ProcessedResult::new(&job, findings, self.inference.model_version(), Utc::now());
        result
            .check_schema()
            .map_err(|reason| self.classify(InferenceError::MalformedResponse(reason)))?;

        let body = serde_json::to_vec_pretty(&result).map_err(|e| Failure::Transient {
            kind: "serialize",
            detail: e.to_string(),
        })?;
        self.store
            .put(&processed, &body, "application/json")
            .await
            .map_err(store_failure)?;

        Ok(Outcome::Persisted {
            defect_detected: result.defect_findings.defect_detected,
        })
    }

    fn classify(&self, error: InferenceError) -> Failure {
        match error {
            InferenceError::Rejected { .. } => Failure::Permanent {
                reason: DeadLetterReason::InferenceRejected,
                detail: error.to_string(),
            },
            InferenceError::MalformedResponse(_) if !self.settings.retry_malformed_responses => {
                Failure::Permanent {
                    reason: DeadLetterReason::MalformedResponse,
                    detail: error.to_string(),
                }
            }
            other => Failure::Transient {
                kind: other.kind(),
                detail: other.to_string(),
            },
        }
    }

    async fn settle(
        &self,
        message: &ReceivedMessage,
        evaluation: Result<Outcome, Failure>,
    ) -> Result<Disposition, QueueError> {
        match evaluation {
            Ok(Outcome::AlreadyProcessed) => {
                self.queue.complete(message).await?;
                Ok(Disposition::Skipped)
            }
            Ok(Outcome::Persisted { defect_detected }) => {
                self.queue.complete(message).await?;
                tracing::info!(
                    message_id = %message.message_id,
                    defect_detected,
                    "Result persisted, message completed"
                );
                Ok(Disposition::Completed)
            }
            Err(Failure::Permanent { reason, detail }) => {
                self.dead_letter(message, reason, &detail).await
            }
            Err(Failure::Transient { kind, detail }) => {
                if message.delivery_count >= self.settings.max_delivery_attempts {
                    let detail = format!(
                        "{kind} on attempt {} of {}: {detail}",
                        message.delivery_count, self.settings.max_delivery_attempts
                    );
                    return self
                        .dead_letter(message, DeadLetterReason::ExhaustedRetries, &detail)
                        .await;
                }

                tracing::info!(
                    message_id = %message.message_id,
                    delivery_count = message.delivery_count,
                    kind,
                    "Transient failure, leaving message for redelivery"
                );
                Ok(Disposition::Released {
                    attempt: message.delivery_count,
                })
            }
        }
    }

    async fn dead_letter(
        &self,
        message: &ReceivedMessage,
        reason: DeadLetterReason,
        detail: &str,
    ) -> Result<Disposition, QueueError> {
        self.queue.dead_letter(message, reason, detail).await?;
        metrics::counter!("worker_dead_lettered_total", "reason" => reason.as_str()).increment(1);
        tracing::warn!(
            message_id = %message.message_id,
            delivery_count = message.delivery_count,
            reason = reason.as_str(),
            detail,
            "Message dead-lettered"
        );
        Ok(Disposition::DeadLettered(reason))
    }

    /// Publish queue depth gauges.
    pub async fn record_queue_depth(&self) {
        match self.queue.depth().await {
            Ok(depth) => {
                metrics::gauge!("queue_pending_messages").set(depth.pending as f64);
                metrics::gauge!("queue_in_flight_messages").set(depth.in_flight as f64);
                metrics::gauge!("queue_dead_letter_messages").set(depth.dead_lettered as f64);
            }
            Err(e) => tracing::warn!(error = %e, "Failed to read queue depth"),
        }
    }

    /// Receive and process messages until `shutdown` resolves or a stop
    /// condition in `options` is met, then drain in-flight tasks.
    ///
    /// A message is received only after an in-flight permit is acquired, so
    /// at most `max_in_flight` inference calls run at once.
    pub async fn run<F>(&self, options: &RunOptions, shutdown: F) -> RunSummary
    where
        F: Future<Output = ()>,
    {
        let semaphore = Arc::new(Semaphore::new(options.max_in_flight.max(1)));
        let mut tasks: JoinSet<Result<Disposition, QueueError>> = JoinSet::new();
        let mut summary = RunSummary::default();
        let mut last_depth: Option<Instant> = None;
        tokio::pin!(shutdown);

        loop {
            while let Some(joined) = tasks.try_join_next() {
                summary.record(joined);
            }

            if last_depth.map_or(true, |at| at.elapsed() >= DEPTH_REFRESH_INTERVAL) {
                self.record_queue_depth().await;
                last_depth = Some(Instant::now());
            }

            if options.max_messages.is_some_and(|max| summary.received >= max) {
                tracing::info!(received = summary.received, "Message limit reached");
                break;
            }

            let permit = tokio::select! {
                _ = shutdown.as_mut() => {
                    tracing::info!("Shutdown requested, no longer receiving");
                    break;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let message = match self.queue.receive().await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    drop(permit);
                    if options.exit_when_idle && tasks.is_empty() {
                        tracing::info!("Queue is empty, exiting");
                        break;
                    }
                    tracing::trace!("No messages available, sleeping");
                    if sleep_or_shutdown(shutdown.as_mut(), options.poll_interval).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(error = %e, "Failed to receive from queue, will retry");
                    if sleep_or_shutdown(shutdown.as_mut(), options.poll_interval).await {
                        break;
                    }
                    continue;
                }
            };

            summary.received += 1;
            let processor = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                processor.process(&message).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            summary.record(joined);
        }
        self.record_queue_depth().await;
        summary
    }
}

/// Sleep for `interval`; true if shutdown fired first.
async fn sleep_or_shutdown<F>(shutdown: Pin<&mut F>, interval: Duration) -> bool
where
    F: Future<Output = ()>,
{
    tokio::select! {
        _ = shutdown => true,
        _ = tokio::time::sleep(interval) => false,
    }
}

fn store_failure(error: StoreError) -> Failure {
    if error.is_retryable() {
        Failure::Transient {
            kind: "storage",
            detail: error.to_string(),
        }
    } else {
        Failure::Permanent {
            reason: DeadLetterReason::StorageRejected,
            detail: error.to_string(),
        }
    }
}
