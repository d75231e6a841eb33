use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use redis::Script;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use strum::IntoStaticStr;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::job::ImageJob;

/// Queue behaviour shared by every backend.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub name: String,
    /// How long a received message stays invisible before it can be redelivered.
    pub visibility_timeout: Duration,
    /// Deliveries allowed before the queue itself dead-letters a message.
    pub max_delivery_count: u32,
    /// Window in which a repeated message id is dropped. Zero disables detection.
    pub duplicate_window: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: "defect-jobs".to_string(),
            visibility_timeout: Duration::from_secs(300),
            max_delivery_count: 5,
            duplicate_window: Duration::from_secs(600),
        }
    }
}

/// A leased message. Only the holder of `lock_token` can settle it.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub sequence: String,
    pub message_id: String,
    pub body: String,
    pub delivery_count: u32,
    pub lock_token: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    Duplicate,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, IntoStaticStr, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum DeadLetterReason {
    MissingRawArtifact,
    InvalidMessage,
    InferenceRejected,
    MalformedResponse,
    /// Storage refused the message's container or blob outright.
    StorageRejected,
    ExhaustedRetries,
    MaxDeliveryCountExceeded,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// A message moved to the dead-letter sink, body untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub sequence: String,
    pub message_id: String,
    pub body: String,
    pub delivery_count: u32,
    pub reason: DeadLetterReason,
    pub description: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct QueueDepth {
    pub pending: u64,
    pub in_flight: u64,
    pub dead_lettered: u64,
}

/// At-least-once job queue with visibility leases and a dead-letter sink.
#[async_trait]
pub trait JobQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Enqueue a job using its `image_id` as the message id.
    async fn enqueue(&self, job: &ImageJob) -> Result<EnqueueOutcome, QueueError>;

    /// Lease the next visible message, if any. Never blocks.
    async fn receive(&self) -> Result<Option<ReceivedMessage>, QueueError>;

    /// Acknowledge and delete a message.
    async fn complete(&self, message: &ReceivedMessage) -> Result<(), QueueError>;

    async fn dead_letter(
        &self,
        message: &ReceivedMessage,
        reason: DeadLetterReason,
        description: &str,
    ) -> Result<(), QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;

    /// Most recent dead-letter records first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("lock lost for message {message_id}: lease expired or already settled")]
    LockLost { message_id: String },

    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

// Reclaims expired leases, then leases the next live message. Messages past
// the delivery ceiling are moved to the dead-letter list instead.
const RECEIVE_SCRIPT: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, seq in ipairs(expired) do
  redis.call('ZREM', KEYS[2], seq)
  redis.call('RPUSH', KEYS[1], seq)
end
while true do
  local seq = redis.call('RPOP', KEYS[1])
  if not seq then
    return false
  end
  local key = ARGV[1] .. ':msg:' .. seq
  if redis.call('EXISTS', key) == 1 then
    local count = redis.call('HINCRBY', key, 'delivery_count', 1)
    local fields = redis.call('HMGET', key, 'message_id', 'body')
    if count > tonumber(ARGV[3]) then
      redis.call('LPUSH', KEYS[3], cjson.encode({
        sequence = seq,
        message_id = fields[1],
        body = fields[2],
        delivery_count = count - 1,
        reason = 'max-delivery-count-exceeded',
        description = 'delivered ' .. ARGV[3] .. ' times without settlement',
        dead_lettered_at = ARGV[5]
      }))
      redis.call('DEL', key)
    else
      redis.call('HSET', key, 'lock_token', ARGV[4])
      redis.call('ZADD', KEYS[2], now + tonumber(ARGV[2]), seq)
      return {seq, fields[1], fields[2], count}
    end
  end
end
"#;

const ENQUEUE_SCRIPT: &str = r#"
if tonumber(ARGV[5]) > 0 then
  if not redis.call('SET', ARGV[1] .. ':dedup:' .. ARGV[3], ARGV[2], 'NX', 'EX', ARGV[5]) then
    return 0
  end
end
redis.call('HSET', ARGV[1] .. ':msg:' .. ARGV[2], 'message_id', ARGV[3], 'body', ARGV[4], 'delivery_count', 0)
redis.call('LPUSH', KEYS[1], ARGV[2])
return 1
"#;

// Deletes a leased message if the caller still holds its lock; an optional
// record is pushed to the dead-letter list in the same step.
const SETTLE_SCRIPT: &str = r#"
local key = ARGV[1] .. ':msg:' .. ARGV[2]
if redis.call('HGET', key, 'lock_token') ~= ARGV[3] then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[2])
redis.call('DEL', key)
if ARGV[4] ~= '' then
  redis.call('LPUSH', KEYS[2], ARGV[4])
end
return 1
"#;

/// Redis-backed job queue.
///
/// Layout under the queue name: `:pending` list of sequence ids,
/// `:inflight` sorted set scored by visibility deadline (ms), `:msg:<seq>`
/// hashes, `:dedup:<message_id>` keys and the `:dead` list.
pub struct RedisJobQueue {
    client: redis::Client,
    settings: QueueSettings,
    receive_script: Script,
    enqueue_script: Script,
    settle_script: Script,
}

impl RedisJobQueue {
    pub fn new(redis_url: &str, settings: QueueSettings) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            settings,
            receive_script: Script::new(RECEIVE_SCRIPT),
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            settle_script: Script::new(SETTLE_SCRIPT),
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.settings.name, suffix)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    async fn settle(&self, message: &ReceivedMessage, record: Option<String>) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let settled: i64 = self
            .settle_script
            .key(self.key("inflight"))
            .key(self.key("dead"))
            .arg(&self.settings.name)
            .arg(&message.sequence)
            .arg(message.lock_token.to_string())
            .arg(record.unwrap_or_default())
            .invoke_async(&mut conn)
            .await?;

        if settled == 0 {
            return Err(QueueError::LockLost {
                message_id: message.message_id.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    fn name(&self) -> &str {
        &self.settings.name
    }

    async fn enqueue(&self, job: &ImageJob) -> Result<EnqueueOutcome, QueueError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(job).map_err(QueueError::Serialize)?;
        let enqueued: i64 = self
            .enqueue_script
            .key(self.key("pending"))
            .arg(&self.settings.name)
            .arg(Uuid::new_v4().to_string())
            .arg(job.image_id.to_string())
            .arg(&payload)
            .arg(self.settings.duplicate_window.as_secs())
            .invoke_async(&mut conn)
            .await?;

        Ok(if enqueued == 1 {
            EnqueueOutcome::Enqueued
        } else {
            EnqueueOutcome::Duplicate
        })
    }

    async fn receive(&self) -> Result<Option<ReceivedMessage>, QueueError> {
        let mut conn = self.connection().await?;
        let lock_token = Uuid::new_v4();
        let leased: Option<(String, String, String, u32)> = self
            .receive_script
            .key(self.key("pending"))
            .key(self.key("inflight"))
            .key(self.key("dead"))
            .arg(&self.settings.name)
            .arg(self.settings.visibility_timeout.as_millis() as u64)
            .arg(self.settings.max_delivery_count)
            .arg(lock_token.to_string())
            .arg(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
            .invoke_async(&mut conn)
            .await?;

        Ok(leased.map(|(sequence, message_id, body, delivery_count)| ReceivedMessage {
            sequence,
            message_id,
            body,
            delivery_count,
            lock_token,
        }))
    }

    async fn complete(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        self.settle(message, None).await
    }

    async fn dead_letter(
        &self,
        message: &ReceivedMessage,
        reason: DeadLetterReason,
        description: &str,
    ) -> Result<(), QueueError> {
        let record = dead_letter_record(message, reason, description);
        let payload = serde_json::to_string(&record).map_err(QueueError::Serialize)?;
        self.settle(message, Some(payload)).await
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let mut conn = self.connection().await?;
        let (pending, in_flight, dead_lettered): (u64, u64, u64) = redis::pipe()
            .llen(self.key("pending"))
            .zcard(self.key("inflight"))
            .llen(self.key("dead"))
            .query_async(&mut conn)
            .await?;
        Ok(QueueDepth {
            pending,
            in_flight,
            dead_lettered,
        })
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(self.key("dead"))
            .arg(0)
            .arg(limit as i64 - 1)
            .query_async(&mut conn)
            .await?;

        raw.iter()
            .map(|entry| serde_json::from_str(entry).map_err(QueueError::Serialize))
            .collect()
    }

    /// Check Redis connectivity (for health checks).
    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

fn dead_letter_record(message: &ReceivedMessage, reason: DeadLetterReason, description: &str) -> DeadLetterRecord {
    DeadLetterRecord {
        sequence: message.sequence.clone(),
        message_id: message.message_id.clone(),
        body: message.body.clone(),
        delivery_count: message.delivery_count,
        reason,
        description: description.to_string(),
        dead_lettered_at: Utc::now(),
    }
}

struct MemoryEntry {
    message_id: String,
    body: String,
    delivery_count: u32,
    lock_token: Option<Uuid>,
    visible_at: Option<Instant>,
}

#[derive(Default)]
struct MemoryQueueState {
    next_sequence: u64,
    pending: VecDeque<u64>,
    entries: HashMap<u64, MemoryEntry>,
    dedup: HashMap<String, Instant>,
    dead: Vec<DeadLetterRecord>,
}

impl MemoryQueueState {
    fn reclaim_expired(&mut self, now: Instant) {
        let mut expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.visible_at.is_some_and(|at| at <= now))
            .map(|(sequence, _)| *sequence)
            .collect();
        expired.sort_unstable();

        for sequence in expired.into_iter().rev() {
            if let Some(entry) = self.entries.get_mut(&sequence) {
                entry.visible_at = None;
            }
            self.pending.push_front(sequence);
        }
    }
}

/// In-process queue with the same lease semantics as [`RedisJobQueue`].
pub struct MemoryJobQueue {
    settings: QueueSettings,
    state: Mutex<MemoryQueueState>,
    unavailable: AtomicBool,
}

impl MemoryJobQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(MemoryQueueState::default()),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// `(message_id, body)` of every message not yet settled, in delivery order.
    pub async fn pending_messages(&self) -> Vec<(String, String)> {
        let state = self.state.lock().await;
        state
            .pending
            .iter()
            .filter_map(|sequence| state.entries.get(sequence))
            .map(|entry| (entry.message_id.clone(), entry.body.clone()))
            .collect()
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("memory queue marked unavailable".to_string()));
        }
        Ok(())
    }

    async fn settle(&self, message: &ReceivedMessage, record: Option<DeadLetterRecord>) -> Result<(), QueueError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let sequence: u64 = message.sequence.parse().map_err(|_| QueueError::LockLost {
            message_id: message.message_id.clone(),
        })?;

        let holds_lock = state
            .entries
            .get(&sequence)
            .is_some_and(|entry| entry.lock_token == Some(message.lock_token));
        if !holds_lock {
            return Err(QueueError::LockLost {
                message_id: message.message_id.clone(),
            });
        }

        state.entries.remove(&sequence);
        state.pending.retain(|pending| *pending != sequence);
        if let Some(record) = record {
            state.dead.push(record);
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    fn name(&self) -> &str {
        &self.settings.name
    }

    async fn enqueue(&self, job: &ImageJob) -> Result<EnqueueOutcome, QueueError> {
        self.check_available()?;
        let body = serde_json::to_string(job)?;
        let message_id = job.image_id.to_string();
        let now = Instant::now();
        let mut state = self.state.lock().await;

        if !self.settings.duplicate_window.is_zero() {
            state.dedup.retain(|_, expires| *expires > now);
            if state.dedup.contains_key(&message_id) {
                return Ok(EnqueueOutcome::Duplicate);
            }
            state
                .dedup
                .insert(message_id.clone(), now + self.settings.duplicate_window);
        }

        state.next_sequence += 1;
        let sequence = state.next_sequence;
        state.entries.insert(
            sequence,
            MemoryEntry {
                message_id,
                body,
                delivery_count: 0,
                lock_token: None,
                visible_at: None,
            },
        );
        state.pending.push_back(sequence);
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn receive(&self) -> Result<Option<ReceivedMessage>, QueueError> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.reclaim_expired(now);

        while let Some(sequence) = state.pending.pop_front() {
            let Some(entry) = state.entries.get_mut(&sequence) else {
                continue;
            };
            entry.delivery_count += 1;

            if entry.delivery_count > self.settings.max_delivery_count {
                let record = DeadLetterRecord {
                    sequence: sequence.to_string(),
                    message_id: entry.message_id.clone(),
                    body: entry.body.clone(),
                    delivery_count: entry.delivery_count - 1,
                    reason: DeadLetterReason::MaxDeliveryCountExceeded,
                    description: format!(
                        "delivered {} times without settlement",
                        self.settings.max_delivery_count
                    ),
                    dead_lettered_at: Utc::now(),
                };
                state.entries.remove(&sequence);
                state.dead.push(record);
                continue;
            }

            let lock_token = Uuid::new_v4();
            entry.lock_token = Some(lock_token);
            entry.visible_at = Some(now + self.settings.visibility_timeout);
            return Ok(Some(ReceivedMessage {
                sequence: sequence.to_string(),
                message_id: entry.message_id.clone(),
                body: entry.body.clone(),
                delivery_count: entry.delivery_count,
                lock_token,
            }));
        }

        Ok(None)
    }

    async fn complete(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        self.settle(message, None).await
    }

    async fn dead_letter(
        &self,
        message: &ReceivedMessage,
        reason: DeadLetterReason,
        description: &str,
    ) -> Result<(), QueueError> {
        self.settle(message, Some(dead_letter_record(message, reason, description)))
            .await
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let in_flight = state
            .entries
            .values()
            .filter(|entry| entry.visible_at.is_some())
            .count() as u64;
        Ok(QueueDepth {
            pending: state.entries.len() as u64 - in_flight,
            in_flight,
            dead_lettered: state.dead.len() as u64,
        })
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.dead.iter().rev().take(limit).cloned().collect())
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> ImageJob {
        let image_id = Uuid::new_v4();
        ImageJob {
            image_id,
            blob_name: format!("{image_id}.jpg"),
            raw_container: "raw-images".to_string(),
            processed_container: "processed-images".to_string(),
            product_sku: "WK-KN-150".to_string(),
            facility: "hongkong".to_string(),
            received_at: Utc::now(),
            content_type: "image/jpeg".to_string(),
            metadata: serde_json::Map::new(),
        }
    }

    fn settings(visibility_timeout: Duration) -> QueueSettings {
        QueueSettings {
            visibility_timeout,
            max_delivery_count: 3,
            ..QueueSettings::default()
        }
    }

    #[tokio::test]
    async fn test_receive_hides_message_until_visibility_expires() {
        let queue = MemoryJobQueue::new(settings(Duration::from_secs(60)));
        queue.enqueue(&job()).await.unwrap();

        let first = queue.receive().await.unwrap().unwrap();
        assert_eq!(first.delivery_count, 1);
        assert!(queue.receive().await.unwrap().is_none());

        let depth = queue.depth().await.unwrap();
        assert_eq!(depth, QueueDepth { pending: 0, in_flight: 1, dead_lettered: 0 });
    }

    #[tokio::test]
    async fn test_unsettled_message_is_redelivered_with_higher_count() {
        let queue = MemoryJobQueue::new(settings(Duration::ZERO));
        queue.enqueue(&job()).await.unwrap();

        let first = queue.receive().await.unwrap().unwrap();
        let second = queue.receive().await.unwrap().unwrap();
        assert_eq!(first.message_id, second.message_id);
        assert_eq!(second.delivery_count, 2);
        assert_ne!(first.lock_token, second.lock_token);

        // The first lease was superseded
        let err = queue.complete(&first).await.unwrap_err();
        assert!(matches!(err, QueueError::LockLost { .. }));
        queue.complete(&second).await.unwrap();
        assert!(queue.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_message_id_is_dropped_within_window() {
        let queue = MemoryJobQueue::new(QueueSettings::default());
        let job = job();
        assert_eq!(queue.enqueue(&job).await.unwrap(), EnqueueOutcome::Enqueued);
        assert_eq!(queue.enqueue(&job).await.unwrap(), EnqueueOutcome::Duplicate);
        assert_eq!(queue.pending_messages().await.len(), 1);
    }

    #[tokio::test]
    async fn test_zero_window_disables_duplicate_detection() {
        let queue = MemoryJobQueue::new(QueueSettings {
            duplicate_window: Duration::ZERO,
            ..QueueSettings::default()
        });
        let job = job();
        queue.enqueue(&job).await.unwrap();
        assert_eq!(queue.enqueue(&job).await.unwrap(), EnqueueOutcome::Enqueued);
        assert_eq!(queue.pending_messages().await.len(), 2);
    }

    #[tokio::test]
    async fn test_queue_dead_letters_after_max_deliveries() {
        let queue = MemoryJobQueue::new(settings(Duration::ZERO));
        queue.enqueue(&job()).await.unwrap();

        for attempt in 1..=3 {
            let message = queue.receive().await.unwrap().unwrap();
            assert_eq!(message.delivery_count, attempt);
        }
        assert!(queue.receive().await.unwrap().is_none());

        let dead = queue.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, DeadLetterReason::MaxDeliveryCountExceeded);
        assert_eq!(dead[0].delivery_count, 3);
    }

    #[tokio::test]
    async fn test_dead_letter_keeps_body_untouched() {
        let queue = MemoryJobQueue::new(QueueSettings::default());
        let job = job();
        queue.enqueue(&job).await.unwrap();
        let message = queue.receive().await.unwrap().unwrap();

        queue
            .dead_letter(&message, DeadLetterReason::MissingRawArtifact, "raw image deleted")
            .await
            .unwrap();

        let dead = queue.dead_letters(1).await.unwrap();
        assert_eq!(dead[0].body, message.body);
        assert_eq!(ImageJob::from_body(&dead[0].body).unwrap(), job);
        assert_eq!(queue.depth().await.unwrap().dead_lettered, 1);
        assert_eq!(queue.depth().await.unwrap().in_flight, 0);
    }

    #[test]
    fn test_dead_letter_reason_labels() {
        assert_eq!(DeadLetterReason::ExhaustedRetries.as_str(), "exhausted-retries");
        let parsed: DeadLetterReason = serde_json::from_str("\"max-delivery-count-exceeded\"").unwrap();
        assert_eq!(parsed, DeadLetterReason::MaxDeliveryCountExceeded);
    }
}
