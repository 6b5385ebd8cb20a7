//! Wire encoding of [`Message`]s.
//!
//! The body travels as the message body; every other envelope field is a typed message
//! attribute. The delivery tag is never encoded: it is rebuilt from the receipt handle on
//! receive.

use crate::error::{MqError, MqResult};
use crate::message::{ErrorPayload, Message, MessageOptions, MessageTag};
use crate::names::QueueName;
use crate::service::{AttributeValue, MessageAttributes, ReceivedMessage};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

const ATTR_ID: &str = "Id";
const ATTR_CREATED: &str = "CreatedDate";
const ATTR_OPTIONS: &str = "Options";
const ATTR_PRIORITY: &str = "Priority";
const ATTR_RETRY_ATTEMPTS: &str = "RetryAttempts";
const ATTR_ERROR: &str = "Error";
const ATTR_REPLY_ID: &str = "ReplyId";
const ATTR_REPLY_TO: &str = "ReplyTo";
const ATTR_META: &str = "Meta";

/// Body and attributes of an outgoing message.
pub fn encode(message: &Message) -> MqResult<(String, MessageAttributes)> {
    let mut attrs = MessageAttributes::new();
    attrs.insert(ATTR_ID.into(), AttributeValue::String(message.id.to_string()));
    attrs.insert(
        ATTR_CREATED.into(),
        AttributeValue::Number(message.created_at.timestamp_millis()),
    );
    attrs.insert(
        ATTR_OPTIONS.into(),
        AttributeValue::Number(i64::from(message.options.bits())),
    );
    attrs.insert(ATTR_PRIORITY.into(), AttributeValue::Number(message.priority));
    attrs.insert(
        ATTR_RETRY_ATTEMPTS.into(),
        AttributeValue::Number(i64::from(message.retry_attempts)),
    );
    if let Some(error) = &message.error {
        attrs.insert(
            ATTR_ERROR.into(),
            AttributeValue::String(serde_json::to_string(error)?),
        );
    }
    if let Some(reply_id) = message.reply_id {
        attrs.insert(ATTR_REPLY_ID.into(), AttributeValue::String(reply_id.to_string()));
    }
    if let Some(reply_to) = &message.reply_to {
        attrs.insert(ATTR_REPLY_TO.into(), AttributeValue::String(reply_to.clone()));
    }
    if let Some(meta) = &message.meta {
        attrs.insert(
            ATTR_META.into(),
            AttributeValue::String(serde_json::to_string(meta)?),
        );
    }
    Ok((message.body.clone(), attrs))
}

/// Rebuild a message from a delivery and tag it with its source queue.
pub fn decode(received: ReceivedMessage, queue: &QueueName) -> MqResult<Message> {
    let attrs = &received.attributes;

    let id = match attrs.get(ATTR_ID).and_then(AttributeValue::as_str) {
        Some(s) => parse_uuid(ATTR_ID, s)?,
        None => Uuid::new_v4(),
    };
    let created_at = number(attrs, ATTR_CREATED)
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);
    let options = MessageOptions::from_bits(
        number(attrs, ATTR_OPTIONS)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0),
    );
    let retry_attempts = number(attrs, ATTR_RETRY_ATTEMPTS)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0);
    let error = match attrs.get(ATTR_ERROR).and_then(AttributeValue::as_str) {
        Some(s) => Some(serde_json::from_str::<ErrorPayload>(s)?),
        None => None,
    };
    let reply_id = match attrs.get(ATTR_REPLY_ID).and_then(AttributeValue::as_str) {
        Some(s) => Some(parse_uuid(ATTR_REPLY_ID, s)?),
        None => None,
    };
    let meta = match attrs.get(ATTR_META).and_then(AttributeValue::as_str) {
        Some(s) => Some(serde_json::from_str::<BTreeMap<String, String>>(s)?),
        None => None,
    };

    Ok(Message {
        id,
        body: received.body,
        created_at,
        options,
        priority: number(attrs, ATTR_PRIORITY).unwrap_or(0),
        retry_attempts,
        error,
        reply_to: attrs
            .get(ATTR_REPLY_TO)
            .and_then(AttributeValue::as_str)
            .map(str::to_string),
        reply_id,
        meta,
        tag: Some(MessageTag::new(queue.logical(), received.receipt_handle)),
    })
}

fn number(attrs: &MessageAttributes, key: &str) -> Option<i64> {
    attrs.get(key).and_then(AttributeValue::as_i64)
}

fn parse_uuid(key: &str, s: &str) -> MqResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| MqError::Serialization(format!("{key}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(body: String, attributes: MessageAttributes) -> ReceivedMessage {
        ReceivedMessage {
            message_id: "m-1".into(),
            receipt_handle: "handle-1".into(),
            body,
            attributes,
            receive_count: 1,
        }
    }

    #[test]
    fn test_envelope_fields_travel_as_attributes() {
        let mut msg = Message::new(r#"{"n":1}"#)
            .with_priority(2)
            .with_reply_to("mq:tmp:abc")
            .with_reply_id(Uuid::new_v4())
            .with_meta("trace", "t-1")
            .with_options(MessageOptions::NOTIFY_ONE_WAY);
        msg.retry_attempts = 1;
        msg.error = Some(ErrorPayload {
            code: "ProcessingError".into(),
            message: "boom".into(),
        });

        let (body, attrs) = encode(&msg).unwrap();
        assert_eq!(body, msg.body);
        assert_eq!(attrs[ATTR_PRIORITY], AttributeValue::Number(2));

        let queue = QueueName::new("mq:Order.inq");
        let decoded = decode(delivery(body, attrs), &queue).unwrap();
        assert_eq!(decoded.id, msg.id);
        assert_eq!(decoded.priority, 2);
        assert_eq!(decoded.retry_attempts, 1);
        assert_eq!(decoded.error, msg.error);
        assert_eq!(decoded.reply_to, msg.reply_to);
        assert_eq!(decoded.reply_id, msg.reply_id);
        assert_eq!(decoded.meta, msg.meta);
        assert!(decoded.is_one_way());
        assert_eq!(
            decoded.created_at.timestamp_millis(),
            msg.created_at.timestamp_millis()
        );
        assert_eq!(
            decoded.tag,
            Some(MessageTag::new("mq:Order.inq", "handle-1"))
        );
    }

    #[test]
    fn test_decode_without_attributes() {
        let decoded = decode(
            delivery("plain".into(), MessageAttributes::new()),
            &QueueName::new("q"),
        )
        .unwrap();
        assert_eq!(decoded.body, "plain");
        assert_eq!(decoded.retry_attempts, 0);
        assert!(decoded.tag.is_some());
    }

    #[test]
    fn test_decode_rejects_bad_uuid() {
        let mut attrs = MessageAttributes::new();
        attrs.insert(ATTR_ID.into(), AttributeValue::String("nope".into()));
        assert!(matches!(
            decode(delivery("{}".into(), attrs), &QueueName::new("q")),
            Err(MqError::Serialization(_))
        ));
    }
}
