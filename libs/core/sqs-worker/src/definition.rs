//! Cached queue metadata.

use crate::names::QueueName;
use crate::service::{MAX_BATCH_SEND_ITEMS, QueueAttributes, RedrivePolicy};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};

/// Per-operation batch thresholds of a buffered queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferSizes {
    pub send: usize,
    pub receive: usize,
    pub delete: usize,
    pub change_visibility: usize,
}

impl BufferSizes {
    /// Same threshold for every operation.
    pub fn uniform(size: usize) -> Self {
        Self {
            send: size,
            receive: size,
            delete: size,
            change_visibility: size,
        }
    }

    /// Thresholds of one, which makes a buffered queue flush on every call.
    pub fn unbuffered() -> Self {
        Self::uniform(1)
    }
}

impl Default for BufferSizes {
    fn default() -> Self {
        Self::uniform(MAX_BATCH_SEND_ITEMS)
    }
}

/// Metadata describing one remote queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueDefinition {
    #[serde(skip)]
    pub name: QueueName,
    pub queue_url: String,
    pub visibility_timeout: u32,
    pub receive_wait_time: u32,
    pub buffer_sizes: BufferSizes,
    pub created_timestamp: i64,
    pub approximate_number_of_messages: u64,
    pub queue_arn: String,
    #[serde(skip)]
    pub redrive_policy: Option<RedrivePolicy>,
}

impl QueueDefinition {
    pub fn from_attributes(
        name: QueueName,
        queue_url: impl Into<String>,
        attributes: QueueAttributes,
        buffer_sizes: BufferSizes,
    ) -> Self {
        let mut definition = Self {
            name,
            queue_url: queue_url.into(),
            visibility_timeout: 0,
            receive_wait_time: 0,
            buffer_sizes,
            created_timestamp: 0,
            approximate_number_of_messages: 0,
            queue_arn: String::new(),
            redrive_policy: None,
        };
        definition.apply_attributes(attributes);
        definition
    }

    /// Overwrite the remote-owned fields with freshly fetched attributes.
    pub fn apply_attributes(&mut self, attributes: QueueAttributes) {
        self.visibility_timeout = attributes.visibility_timeout;
        self.receive_wait_time = attributes.receive_wait_time;
        self.created_timestamp = attributes.created_timestamp;
        self.approximate_number_of_messages = attributes.approximate_number_of_messages;
        self.queue_arn = attributes.queue_arn;
        self.redrive_policy = attributes.redrive_policy;
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }
}

/// Shared handle to a cached [`QueueDefinition`].
///
/// The queue manager hands out clones of the same handle for a logical name; refreshing
/// attributes mutates the shared definition in place.
#[derive(Debug, Clone)]
pub struct DefinitionRef(Arc<RwLock<QueueDefinition>>);

impl DefinitionRef {
    pub fn new(definition: QueueDefinition) -> Self {
        Self(Arc::new(RwLock::new(definition)))
    }

    /// Copy of the current definition.
    pub fn snapshot(&self) -> QueueDefinition {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn queue_url(&self) -> String {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .queue_url
            .clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut QueueDefinition)) {
        let mut guard = self.0.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }

    /// Whether two handles point at the same cached definition.
    pub fn ptr_eq(&self, other: &DefinitionRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attributes(messages: u64) -> QueueAttributes {
        QueueAttributes {
            visibility_timeout: 30,
            receive_wait_time: 0,
            created_timestamp: 1_700_000_000,
            approximate_number_of_messages: messages,
            queue_arn: "arn:memory:sqs:local:000000000000:mq-Order-inq".into(),
            redrive_policy: None,
        }
    }

    #[test]
    fn test_update_is_visible_through_every_handle() {
        let def = DefinitionRef::new(QueueDefinition::from_attributes(
            QueueName::new("mq:Order.inq"),
            "memory://queues/mq-Order-inq",
            attributes(0),
            BufferSizes::default(),
        ));
        let other = def.clone();
        assert!(def.ptr_eq(&other));

        other.update(|d| d.apply_attributes(attributes(7)));
        assert_eq!(def.snapshot().approximate_number_of_messages, 7);
        assert_eq!(def.snapshot().queue_arn, attributes(0).queue_arn);
    }

    #[test]
    fn test_buffer_sizes() {
        assert_eq!(BufferSizes::default().send, 10);
        assert_eq!(BufferSizes::unbuffered().delete, 1);
    }
}
