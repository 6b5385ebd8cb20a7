//! Remote queue service contract.
//!
//! [`QueueService`] is the managed queue the workers consume from. Everything above it
//! (queue manager, buffers, client facade) only talks to the service through this trait,
//! so the in-memory implementation and a network client are interchangeable.

use crate::error::{MqError, MqResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Most entries accepted by one `send_message_batch` call.
pub const MAX_BATCH_SEND_ITEMS: usize = 10;
/// Most messages returned by one `receive_message` call.
pub const MAX_BATCH_RECEIVE_ITEMS: usize = 10;
/// Most entries accepted by one `delete_message_batch` call.
pub const MAX_BATCH_DELETE_ITEMS: usize = 10;
/// Most entries accepted by one `change_message_visibility_batch` call.
pub const MAX_BATCH_CHANGE_VISIBILITY_ITEMS: usize = 10;
/// Longest visibility timeout, in seconds (12 hours).
pub const MAX_VISIBILITY_TIMEOUT_SECS: u32 = 43_200;
/// Longest receive wait time, in seconds.
pub const MAX_WAIT_TIME_SECS: u32 = 20;
/// Largest `maxReceiveCount` of a redrive policy.
pub const MAX_RECEIVE_COUNT: u32 = 1_000;

/// Rule routing a message to a dead-letter queue after repeated receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedrivePolicy {
    #[serde(rename = "deadLetterTargetArn")]
    pub dead_letter_target_arn: String,
    #[serde(rename = "maxReceiveCount")]
    pub max_receive_count: u32,
}

impl RedrivePolicy {
    pub fn new(dead_letter_target_arn: impl Into<String>, max_receive_count: u32) -> Self {
        Self {
            dead_letter_target_arn: dead_letter_target_arn.into(),
            max_receive_count: max_receive_count.max(1),
        }
    }

    pub fn to_json(&self) -> MqResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> MqResult<Self> {
        let policy: RedrivePolicy = serde_json::from_str(s)?;
        if policy.max_receive_count < 1 || policy.max_receive_count > MAX_RECEIVE_COUNT {
            return Err(MqError::InvalidParameter(format!(
                "maxReceiveCount must be between 1 and {MAX_RECEIVE_COUNT}"
            )));
        }
        Ok(policy)
    }
}

/// Attributes submitted when creating or updating a queue.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueSettings {
    /// Seconds a received message stays hidden from other consumers.
    pub visibility_timeout: u32,
    /// Seconds a receive call may long-poll for messages.
    pub receive_wait_time: u32,
    pub redrive_policy: Option<RedrivePolicy>,
}

/// Full attribute set reported by the service, including server-assigned fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueAttributes {
    pub visibility_timeout: u32,
    pub receive_wait_time: u32,
    /// Unix timestamp (seconds) the queue was created.
    pub created_timestamp: i64,
    pub approximate_number_of_messages: u64,
    pub queue_arn: String,
    pub redrive_policy: Option<RedrivePolicy>,
}

/// Typed message attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "DataType", content = "Value")]
pub enum AttributeValue {
    String(String),
    Number(i64),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            AttributeValue::Number(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            AttributeValue::String(s) => s.parse().ok(),
        }
    }
}

/// Named, typed attributes carried next to a message body.
pub type MessageAttributes = BTreeMap<String, AttributeValue>;

/// One message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendEntry {
    /// Batch entry id, unique within one batch call.
    pub id: String,
    pub body: String,
    pub attributes: MessageAttributes,
}

/// One delivery to delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteEntry {
    pub id: String,
    pub receipt_handle: String,
}

/// One delivery whose visibility changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeVisibilityEntry {
    pub id: String,
    pub receipt_handle: String,
    pub visibility_timeout: u32,
}

/// A failed entry inside an otherwise accepted batch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntryError {
    pub id: String,
    pub code: String,
    pub message: String,
    pub sender_fault: bool,
}

/// Per-entry outcome of a batch call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchResult {
    pub successful: Vec<String>,
    pub failed: Vec<BatchEntryError>,
}

/// Parameters of a receive call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub queue_url: String,
    pub max_messages: usize,
    pub wait_time: Duration,
    pub visibility_timeout: Option<u32>,
}

/// A delivered message instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    pub attributes: MessageAttributes,
    /// How many times this message has been received, this delivery included.
    pub receive_count: u32,
}

/// The managed queue service.
#[async_trait]
pub trait QueueService: Send + Sync {
    /// Create a queue and return its url. Server-assigned attributes are not returned.
    async fn create_queue(&self, wire_name: &str, settings: &QueueSettings) -> MqResult<String>;

    async fn get_queue_url(&self, wire_name: &str) -> MqResult<String>;

    async fn get_queue_attributes(&self, queue_url: &str) -> MqResult<QueueAttributes>;

    async fn set_queue_attributes(&self, queue_url: &str, settings: &QueueSettings)
    -> MqResult<()>;

    /// Urls of every queue whose wire name starts with `prefix` (case-insensitive).
    async fn list_queues(&self, prefix: &str) -> MqResult<Vec<String>>;

    async fn delete_queue(&self, queue_url: &str) -> MqResult<()>;

    async fn purge_queue(&self, queue_url: &str) -> MqResult<()>;

    /// Publish one message, returning the service message id.
    async fn send_message(&self, queue_url: &str, entry: SendEntry) -> MqResult<String>;

    async fn send_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<SendEntry>,
    ) -> MqResult<BatchResult>;

    async fn receive_message(&self, request: ReceiveRequest) -> MqResult<Vec<ReceivedMessage>>;

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> MqResult<()>;

    async fn delete_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<DeleteEntry>,
    ) -> MqResult<BatchResult>;

    async fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        visibility_timeout: u32,
    ) -> MqResult<()>;

    async fn change_message_visibility_batch(
        &self,
        queue_url: &str,
        entries: Vec<ChangeVisibilityEntry>,
    ) -> MqResult<BatchResult>;
}

/// Hands out client handles for the remote service.
pub trait QueueServiceFactory: Send + Sync {
    fn create_client(&self) -> Arc<dyn QueueService>;
}

/// Factory that shares one client handle with every caller.
#[derive(Clone)]
pub struct SharedServiceFactory {
    service: Arc<dyn QueueService>,
}

impl SharedServiceFactory {
    pub fn new(service: Arc<dyn QueueService>) -> Self {
        Self { service }
    }
}

impl QueueServiceFactory for SharedServiceFactory {
    fn create_client(&self) -> Arc<dyn QueueService> {
        self.service.clone()
    }
}

/// Validate a visibility timeout against the service range.
pub fn validate_visibility_timeout(seconds: u32) -> MqResult<()> {
    if seconds > MAX_VISIBILITY_TIMEOUT_SECS {
        return Err(MqError::Config(format!(
            "visibility timeout {seconds}s outside 0..={MAX_VISIBILITY_TIMEOUT_SECS}"
        )));
    }
    Ok(())
}

/// Validate a receive wait time against the service range.
pub fn validate_wait_time(seconds: u32) -> MqResult<()> {
    if seconds > MAX_WAIT_TIME_SECS {
        return Err(MqError::Config(format!(
            "receive wait time {seconds}s outside 0..={MAX_WAIT_TIME_SECS}"
        )));
    }
    Ok(())
}

/// Validate a retry count; it becomes the redrive `maxReceiveCount`.
pub fn validate_retry_count(retry_count: u32) -> MqResult<()> {
    if retry_count > MAX_RECEIVE_COUNT {
        return Err(MqError::Config(format!(
            "retry count {retry_count} outside 0..={MAX_RECEIVE_COUNT}"
        )));
    }
    Ok(())
}
