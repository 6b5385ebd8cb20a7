//! Message envelope
//!
//! A [`Message`] carries a JSON body plus the delivery metadata the worker pool needs:
//! creation time, options, priority, retry attempts, the last error, reply routing and a
//! free-form metadata map. Received messages also carry a [`MessageTag`], which is all that
//! is needed to acknowledge them later.

use crate::error::{MqError, MqResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Option flags of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageOptions(u32);

impl MessageOptions {
    pub const NONE: MessageOptions = MessageOptions(0);
    /// No response is expected; handlers must not publish replies.
    pub const NOTIFY_ONE_WAY: MessageOptions = MessageOptions(1);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: MessageOptions) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for MessageOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Where a received message came from: its queue and receipt handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTag {
    #[serde(rename = "q")]
    pub queue_name: String,
    #[serde(rename = "h")]
    pub receipt_handle: String,
}

impl MessageTag {
    pub fn new(queue_name: impl Into<String>, receipt_handle: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            receipt_handle: receipt_handle.into(),
        }
    }
}

/// Error recorded on a message that failed processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl From<&MqError> for ErrorPayload {
    fn from(err: &MqError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Message envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    /// JSON payload.
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub options: MessageOptions,
    /// Messages with a positive priority go to the priority queue.
    pub priority: i64,
    pub retry_attempts: u32,
    pub error: Option<ErrorPayload>,
    pub reply_to: Option<String>,
    pub reply_id: Option<Uuid>,
    pub meta: Option<BTreeMap<String, String>>,
    /// Set on received messages only.
    pub tag: Option<MessageTag>,
}

impl Message {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            body: body.into(),
            created_at: Utc::now(),
            options: MessageOptions::NONE,
            priority: 0,
            retry_attempts: 0,
            error: None,
            reply_to: None,
            reply_id: None,
            meta: None,
            tag: None,
        }
    }

    /// Envelope around the JSON encoding of `payload`.
    pub fn from_payload<T: Serialize>(payload: &T) -> MqResult<Self> {
        Ok(Self::new(serde_json::to_string(payload)?))
    }

    pub fn decode_body<T: DeserializeOwned>(&self) -> MqResult<T> {
        Ok(serde_json::from_str(&self.body)?)
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_options(mut self, options: MessageOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    pub fn with_reply_id(mut self, reply_id: Uuid) -> Self {
        self.reply_id = Some(reply_id);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn is_one_way(&self) -> bool {
        self.options.contains(MessageOptions::NOTIFY_ONE_WAY)
    }

    /// Copy suitable for publishing again: same content, no delivery tag.
    pub fn for_republish(&self) -> Self {
        Self {
            tag: None,
            ..self.clone()
        }
    }
}

/// A message whose body has been decoded into `T`.
#[derive(Debug, Clone)]
pub struct TypedMessage<T> {
    pub payload: T,
    pub message: Message,
}

impl<T: DeserializeOwned> TypedMessage<T> {
    pub fn decode(message: Message) -> MqResult<Self> {
        let payload = message.decode_body()?;
        Ok(Self { payload, message })
    }
}

impl<T> TypedMessage<T> {
    pub fn retry_attempts(&self) -> u32 {
        self.message.retry_attempts
    }

    pub fn priority(&self) -> i64 {
        self.message.priority
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_message_has_no_tag() {
        let msg = Message::from_payload(&json!({"id": 1})).unwrap();
        assert!(msg.tag.is_none());
        assert_eq!(msg.retry_attempts, 0);
        assert!(!msg.is_one_way());
    }

    #[test]
    fn test_for_republish_clears_tag() {
        let mut msg = Message::new("{}").with_priority(3).with_meta("k", "v");
        msg.tag = Some(MessageTag::new("q", "h"));
        let copy = msg.for_republish();
        assert!(copy.tag.is_none());
        assert_eq!(copy.id, msg.id);
        assert_eq!(copy.priority, 3);
        assert_eq!(copy.meta.unwrap()["k"], "v");
    }

    #[test]
    fn test_options() {
        let opts = MessageOptions::NONE | MessageOptions::NOTIFY_ONE_WAY;
        assert!(opts.contains(MessageOptions::NOTIFY_ONE_WAY));
        assert_eq!(MessageOptions::from_bits(opts.bits()), opts);
    }

    #[test]
    fn test_typed_decode() {
        #[derive(Debug, Deserialize)]
        struct Order {
            id: u32,
        }
        let typed = TypedMessage::<Order>::decode(Message::new(r#"{"id":7}"#)).unwrap();
        assert_eq!(typed.payload.id, 7);
        assert!(TypedMessage::<Order>::decode(Message::new("not json")).is_err());
    }
}
