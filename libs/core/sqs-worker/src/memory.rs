//! In-memory queue service.
//!
//! Behaves like the managed service for everything the worker pool relies on: visibility
//! timeouts, receipt handles, receive counts, redrive to a dead-letter queue, server-assigned
//! ARNs and the batch request contract. Used by tests and by the demo service.

use crate::error::{MqError, MqResult};
use crate::names::MAX_WIRE_NAME_LEN;
use crate::service::{
    BatchEntryError, BatchResult, ChangeVisibilityEntry, DeleteEntry, MAX_BATCH_CHANGE_VISIBILITY_ITEMS,
    MAX_BATCH_DELETE_ITEMS, MAX_BATCH_RECEIVE_ITEMS, MAX_BATCH_SEND_ITEMS, MessageAttributes,
    QueueAttributes, QueueService, QueueSettings, ReceiveRequest, ReceivedMessage, SendEntry,
    validate_visibility_timeout, validate_wait_time,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

const URL_PREFIX: &str = "memory://queues/";
const ARN_PREFIX: &str = "arn:memory:sqs:local:000000000000:";
const LONG_POLL_STEP: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: String,
    attributes: MessageAttributes,
    receive_count: u32,
}

#[derive(Debug)]
struct InFlight {
    message: StoredMessage,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    visible: VecDeque<StoredMessage>,
    in_flight: HashMap<String, InFlight>,
}

impl QueueState {
    /// Return expired in-flight messages to the visible set.
    fn release_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.visible_at <= now)
            .map(|(handle, _)| handle.clone())
            .collect();
        for handle in expired {
            if let Some(f) = self.in_flight.remove(&handle) {
                self.visible.push_back(f.message);
            }
        }
    }
}

#[derive(Debug)]
struct MemoryQueue {
    wire_name: String,
    url: String,
    arn: String,
    created_timestamp: Mutex<i64>,
    settings: Mutex<QueueSettings>,
    state: Mutex<QueueState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn validate_wire_name(name: &str) -> MqResult<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_WIRE_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(MqError::InvalidParameter(format!(
            "queue name [{name}] can only include alphanumeric characters, hyphens, or underscores, 1 to {MAX_WIRE_NAME_LEN} in length"
        )))
    }
}

fn validate_batch<'a>(ids: impl Iterator<Item = &'a str>, count: usize, max: usize) -> MqResult<()> {
    if count == 0 {
        return Err(MqError::EmptyBatch);
    }
    if count > max {
        return Err(MqError::TooManyEntries { count, max });
    }
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(MqError::BatchEntryIdsNotDistinct(id.to_string()));
        }
    }
    Ok(())
}

fn entry_error(id: &str, err: &MqError) -> BatchEntryError {
    BatchEntryError {
        id: id.to_string(),
        code: err.code().to_string(),
        message: err.to_string(),
        sender_fault: true,
    }
}

/// Queue service backed by process memory.
#[derive(Debug, Default)]
pub struct InMemoryQueueService {
    queues: DashMap<String, Arc<MemoryQueue>>,
    urls_by_name: DashMap<String, String>,
}

impl InMemoryQueueService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn queue(&self, queue_url: &str) -> MqResult<Arc<MemoryQueue>> {
        self.queues
            .get(queue_url)
            .map(|q| q.value().clone())
            .ok_or_else(|| MqError::QueueDoesNotExist(queue_url.to_string()))
    }

    fn queue_by_arn(&self, arn: &str) -> Option<Arc<MemoryQueue>> {
        self.queues
            .iter()
            .find(|q| q.value().arn == arn)
            .map(|q| q.value().clone())
    }

    /// Messages currently visible (not in flight) on a queue.
    pub fn visible_count(&self, queue_url: &str) -> usize {
        self.queue(queue_url)
            .map(|q| {
                let mut state = lock(&q.state);
                state.release_expired(Instant::now());
                state.visible.len()
            })
            .unwrap_or(0)
    }

    /// Messages currently in flight on a queue.
    pub fn in_flight_count(&self, queue_url: &str) -> usize {
        self.queue(queue_url)
            .map(|q| lock(&q.state).in_flight.len())
            .unwrap_or(0)
    }

    /// Backdate a queue's creation time; used to exercise temporary queue collection.
    pub fn set_created_timestamp(&self, queue_url: &str, timestamp: i64) -> MqResult<()> {
        let q = self.queue(queue_url)?;
        *lock(&q.created_timestamp) = timestamp;
        Ok(())
    }

    fn enqueue(&self, queue: &MemoryQueue, body: String, attributes: MessageAttributes) -> String {
        let message_id = Uuid::new_v4().to_string();
        lock(&queue.state).visible.push_back(StoredMessage {
            message_id: message_id.clone(),
            body,
            attributes,
            receive_count: 0,
        });
        message_id
    }

    fn delete_in(queue: &MemoryQueue, receipt_handle: &str) -> MqResult<()> {
        let mut state = lock(&queue.state);
        state
            .in_flight
            .remove(receipt_handle)
            .map(|_| ())
            .ok_or_else(|| MqError::ReceiptHandleInvalid(receipt_handle.to_string()))
    }

    fn change_visibility_in(
        queue: &MemoryQueue,
        receipt_handle: &str,
        visibility_timeout: u32,
    ) -> MqResult<()> {
        validate_visibility_timeout(visibility_timeout)
            .map_err(|e| MqError::InvalidParameter(e.to_string()))?;
        let mut state = lock(&queue.state);
        if visibility_timeout == 0 {
            let f = state
                .in_flight
                .remove(receipt_handle)
                .ok_or_else(|| MqError::MessageNotInflight(receipt_handle.to_string()))?;
            state.visible.push_front(f.message);
            return Ok(());
        }
        let f = state
            .in_flight
            .get_mut(receipt_handle)
            .ok_or_else(|| MqError::MessageNotInflight(receipt_handle.to_string()))?;
        f.visible_at = Instant::now() + Duration::from_secs(u64::from(visibility_timeout));
        Ok(())
    }

    /// One non-blocking receive pass, honoring the redrive policy.
    fn receive_once(
        &self,
        queue: &MemoryQueue,
        max_messages: usize,
        visibility_timeout: u32,
    ) -> Vec<ReceivedMessage> {
        let redrive = lock(&queue.settings).redrive_policy.clone();
        let dead_letter = redrive
            .as_ref()
            .and_then(|p| self.queue_by_arn(&p.dead_letter_target_arn));

        let now = Instant::now();
        let mut received = Vec::new();
        let mut redriven = Vec::new();
        {
            let mut state = lock(&queue.state);
            state.release_expired(now);
            while received.len() < max_messages {
                let Some(mut message) = state.visible.pop_front() else {
                    break;
                };
                if let (Some(policy), Some(_)) = (&redrive, &dead_letter)
                    && message.receive_count >= policy.max_receive_count
                {
                    redriven.push(message);
                    continue;
                }
                message.receive_count += 1;
                let receipt_handle = format!("{}#{}", message.message_id, Uuid::new_v4().simple());
                received.push(ReceivedMessage {
                    message_id: message.message_id.clone(),
                    receipt_handle: receipt_handle.clone(),
                    body: message.body.clone(),
                    attributes: message.attributes.clone(),
                    receive_count: message.receive_count,
                });
                state.in_flight.insert(
                    receipt_handle,
                    InFlight {
                        message,
                        visible_at: now + Duration::from_secs(u64::from(visibility_timeout)),
                    },
                );
            }
        }

        if let Some(dlq) = dead_letter
            && !redriven.is_empty()
        {
            debug!(
                queue = %queue.wire_name,
                dead_letter = %dlq.wire_name,
                count = redriven.len(),
                "Redriving messages to dead-letter queue"
            );
            let mut dlq_state = lock(&dlq.state);
            for mut message in redriven {
                message.receive_count = 0;
                dlq_state.visible.push_back(message);
            }
        }

        received
    }
}

#[async_trait]
impl QueueService for InMemoryQueueService {
    async fn create_queue(&self, wire_name: &str, settings: &QueueSettings) -> MqResult<String> {
        validate_wire_name(wire_name)?;
        validate_visibility_timeout(settings.visibility_timeout)?;
        validate_wait_time(settings.receive_wait_time)?;

        let key = wire_name.to_ascii_lowercase();
        if let Some(url) = self.urls_by_name.get(&key).map(|u| u.value().clone())
            && let Ok(existing) = self.queue(&url)
        {
            let current = lock(&existing.settings).clone();
            if current == *settings {
                return Ok(url);
            }
            return Err(MqError::QueueNameExists(wire_name.to_string()));
        }

        let url = format!("{URL_PREFIX}{wire_name}");
        let queue = Arc::new(MemoryQueue {
            wire_name: wire_name.to_string(),
            url: url.clone(),
            arn: format!("{ARN_PREFIX}{wire_name}"),
            created_timestamp: Mutex::new(Utc::now().timestamp()),
            settings: Mutex::new(settings.clone()),
            state: Mutex::new(QueueState::default()),
        });
        self.queues.insert(url.clone(), queue);
        self.urls_by_name.insert(key, url.clone());
        Ok(url)
    }

    async fn get_queue_url(&self, wire_name: &str) -> MqResult<String> {
        self.urls_by_name
            .get(&wire_name.to_ascii_lowercase())
            .map(|u| u.value().clone())
            .ok_or_else(|| MqError::QueueDoesNotExist(wire_name.to_string()))
    }

    async fn get_queue_attributes(&self, queue_url: &str) -> MqResult<QueueAttributes> {
        let q = self.queue(queue_url)?;
        let settings = lock(&q.settings).clone();
        let approximate_number_of_messages = {
            let mut state = lock(&q.state);
            state.release_expired(Instant::now());
            state.visible.len() as u64
        };
        Ok(QueueAttributes {
            visibility_timeout: settings.visibility_timeout,
            receive_wait_time: settings.receive_wait_time,
            created_timestamp: *lock(&q.created_timestamp),
            approximate_number_of_messages,
            queue_arn: q.arn.clone(),
            redrive_policy: settings.redrive_policy,
        })
    }

    async fn set_queue_attributes(
        &self,
        queue_url: &str,
        settings: &QueueSettings,
    ) -> MqResult<()> {
        validate_visibility_timeout(settings.visibility_timeout)?;
        validate_wait_time(settings.receive_wait_time)?;
        let q = self.queue(queue_url)?;
        *lock(&q.settings) = settings.clone();
        Ok(())
    }

    async fn list_queues(&self, prefix: &str) -> MqResult<Vec<String>> {
        let prefix = prefix.to_ascii_lowercase();
        let mut urls: Vec<String> = self
            .queues
            .iter()
            .filter(|q| q.value().wire_name.to_ascii_lowercase().starts_with(&prefix))
            .map(|q| q.value().url.clone())
            .collect();
        urls.sort();
        Ok(urls)
    }

    async fn delete_queue(&self, queue_url: &str) -> MqResult<()> {
        let (_, q) = self
            .queues
            .remove(queue_url)
            .ok_or_else(|| MqError::QueueDoesNotExist(queue_url.to_string()))?;
        self.urls_by_name.remove(&q.wire_name.to_ascii_lowercase());
        Ok(())
    }

    async fn purge_queue(&self, queue_url: &str) -> MqResult<()> {
        let q = self.queue(queue_url)?;
        let mut state = lock(&q.state);
        state.visible.clear();
        state.in_flight.clear();
        Ok(())
    }

    async fn send_message(&self, queue_url: &str, entry: SendEntry) -> MqResult<String> {
        let q = self.queue(queue_url)?;
        Ok(self.enqueue(&q, entry.body, entry.attributes))
    }

    async fn send_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<SendEntry>,
    ) -> MqResult<BatchResult> {
        validate_batch(
            entries.iter().map(|e| e.id.as_str()),
            entries.len(),
            MAX_BATCH_SEND_ITEMS,
        )?;
        let q = self.queue(queue_url)?;
        let mut result = BatchResult::default();
        for entry in entries {
            self.enqueue(&q, entry.body, entry.attributes);
            result.successful.push(entry.id);
        }
        Ok(result)
    }

    async fn receive_message(&self, request: ReceiveRequest) -> MqResult<Vec<ReceivedMessage>> {
        if request.max_messages == 0 || request.max_messages > MAX_BATCH_RECEIVE_ITEMS {
            return Err(MqError::TooManyEntries {
                count: request.max_messages,
                max: MAX_BATCH_RECEIVE_ITEMS,
            });
        }
        let q = self.queue(&request.queue_url)?;
        let visibility_timeout = request
            .visibility_timeout
            .unwrap_or_else(|| lock(&q.settings).visibility_timeout);
        let deadline = Instant::now() + request.wait_time;

        loop {
            let received = self.receive_once(&q, request.max_messages, visibility_timeout);
            if !received.is_empty() || Instant::now() >= deadline {
                return Ok(received);
            }
            tokio::time::sleep(LONG_POLL_STEP).await;
        }
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> MqResult<()> {
        let q = self.queue(queue_url)?;
        Self::delete_in(&q, receipt_handle)
    }

    async fn delete_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<DeleteEntry>,
    ) -> MqResult<BatchResult> {
        validate_batch(
            entries.iter().map(|e| e.id.as_str()),
            entries.len(),
            MAX_BATCH_DELETE_ITEMS,
        )?;
        let q = self.queue(queue_url)?;
        let mut result = BatchResult::default();
        for entry in entries {
            match Self::delete_in(&q, &entry.receipt_handle) {
                Ok(()) => result.successful.push(entry.id),
                Err(e) => result.failed.push(entry_error(&entry.id, &e)),
            }
        }
        Ok(result)
    }

    async fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        visibility_timeout: u32,
    ) -> MqResult<()> {
        let q = self.queue(queue_url)?;
        Self::change_visibility_in(&q, receipt_handle, visibility_timeout)
    }

    async fn change_message_visibility_batch(
        &self,
        queue_url: &str,
        entries: Vec<ChangeVisibilityEntry>,
    ) -> MqResult<BatchResult> {
        validate_batch(
            entries.iter().map(|e| e.id.as_str()),
            entries.len(),
            MAX_BATCH_CHANGE_VISIBILITY_ITEMS,
        )?;
        let q = self.queue(queue_url)?;
        let mut result = BatchResult::default();
        for entry in entries {
            match Self::change_visibility_in(&q, &entry.receipt_handle, entry.visibility_timeout) {
                Ok(()) => result.successful.push(entry.id),
                Err(e) => result.failed.push(entry_error(&entry.id, &e)),
            }
        }
        Ok(result)
    }
}
