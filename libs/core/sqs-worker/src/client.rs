//! Message queue client facade.
//!
//! [`MqClient`] combines the [`QueueManager`] and the [`BufferFactory`] into the operations
//! handlers and producers use: publish, get, acknowledge, negative-acknowledge and visibility
//! changes. All remote traffic goes through the per-queue buffers.

use crate::buffer::{BufferFactory, QueueBuffer};
use crate::codec;
use crate::error::{MqError, MqResult};
use crate::handler::QueueMessage;
use crate::message::{ErrorPayload, Message, MessageOptions, MessageTag};
use crate::names::{QueueName, QueueNames};
use crate::queue_manager::QueueManager;
use crate::service::SendEntry;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Publishing side of the client.
#[async_trait]
pub trait MessageProducer: Send + Sync {
    async fn publish(&self, queue: &QueueName, message: &Message) -> MqResult<()>;

    /// Publish a message that expects no response.
    async fn send_one_way(&self, queue: &QueueName, message: &Message) -> MqResult<()>;
}

/// Client bound to a queue manager and buffer factory.
#[derive(Clone)]
pub struct MqClient {
    queue_manager: Arc<QueueManager>,
    buffers: Arc<BufferFactory>,
    queue_name_prefix: String,
    priority_queues: bool,
}

impl MqClient {
    pub fn new(queue_manager: Arc<QueueManager>, buffers: Arc<BufferFactory>) -> Self {
        Self {
            queue_manager,
            buffers,
            queue_name_prefix: String::new(),
            priority_queues: false,
        }
    }

    /// Prefix applied to queue names derived from message types.
    pub fn with_queue_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.queue_name_prefix = prefix.into();
        self
    }

    /// Route messages with a positive priority to the priority queue.
    pub fn with_priority_queues(mut self, enabled: bool) -> Self {
        self.priority_queues = enabled;
        self
    }

    pub fn queue_names<T: QueueMessage>(&self) -> QueueNames {
        QueueNames::with_prefix(&self.queue_name_prefix, T::TYPE_NAME)
    }

    async fn buffer(&self, queue: &QueueName) -> MqResult<Arc<dyn QueueBuffer>> {
        let definition = self.queue_manager.get_or_create(queue).await?;
        Ok(self.buffers.get_or_create(&definition, None))
    }

    fn tag(message: &Message) -> MqResult<&MessageTag> {
        message.tag.as_ref().ok_or_else(|| {
            MqError::InvalidParameter(format!("message {} was not received from a queue", message.id))
        })
    }

    /// Publish `payload` to the queue of its type.
    pub async fn publish_typed<T: QueueMessage>(&self, payload: &T) -> MqResult<Message> {
        let message = Message::from_payload(payload)?;
        self.publish_message::<T>(&message).await?;
        Ok(message)
    }

    /// Publish an envelope carrying a `T` to the input (or priority) queue of `T`.
    pub async fn publish_message<T: QueueMessage>(&self, message: &Message) -> MqResult<()> {
        let names = self.queue_names::<T>();
        let queue = if self.priority_queues && message.priority > 0 {
            names.priority
        } else {
            names.input
        };
        self.publish(&queue, message).await
    }

    /// Next message from `queue`, waiting up to `wait` (the queue's receive wait time when
    /// `None`). Deliveries whose envelope cannot be decoded are moved to the dead-letter
    /// queue and skipped.
    pub async fn get(&self, queue: &QueueName, wait: Option<Duration>) -> MqResult<Option<Message>> {
        let definition = self.queue_manager.get_or_create(queue).await?;
        let wait = wait.unwrap_or_else(|| {
            Duration::from_secs(u64::from(definition.snapshot().receive_wait_time))
        });
        let buffer = self.buffers.get_or_create(&definition, None);

        loop {
            let Some(received) = buffer.receive(wait).await? else {
                return Ok(None);
            };
            let receipt_handle = received.receipt_handle.clone();
            let raw = SendEntry {
                id: received.message_id.clone(),
                body: received.body.clone(),
                attributes: received.attributes.clone(),
            };
            match codec::decode(received, queue) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => {
                    error!(queue = %queue, error = %e, "Undecodable message, moving to dead-letter queue");
                    self.buffer(&queue.dead_letter()).await?.send(raw).await?;
                    buffer.delete(&receipt_handle).await?;
                }
            }
        }
    }

    /// Next message without waiting.
    pub async fn try_get(&self, queue: &QueueName) -> MqResult<Option<Message>> {
        self.get(queue, Some(Duration::ZERO)).await
    }

    /// Delete a received message from its queue.
    pub async fn ack(&self, message: &Message) -> MqResult<()> {
        let tag = Self::tag(message)?;
        self.buffer(&QueueName::new(tag.queue_name.as_str()))
            .await?
            .delete(&tag.receipt_handle)
            .await?;
        Ok(())
    }

    /// Republish a copy of a received message and delete the original.
    ///
    /// The copy goes back to the originating queue when `requeue` is set, otherwise to its
    /// dead-letter queue.
    pub async fn nak(
        &self,
        message: &Message,
        requeue: bool,
        error: Option<&MqError>,
    ) -> MqResult<()> {
        let tag = Self::tag(message)?;
        let source = QueueName::new(tag.queue_name.as_str());
        let target = if requeue {
            source
        } else {
            source.dead_letter()
        };

        let mut copy = message.for_republish();
        if let Some(err) = error {
            copy.error = Some(ErrorPayload::from(err));
        }
        debug!(queue = %target, message_id = %message.id, requeue, "Negative acknowledgement");
        self.publish(&target, &copy).await?;
        self.ack(message).await
    }

    /// Change how long a received message stays hidden.
    pub async fn change_visibility(&self, message: &Message, visibility_timeout: u32) -> MqResult<()> {
        let tag = Self::tag(message)?;
        self.buffer(&QueueName::new(tag.queue_name.as_str()))
            .await?
            .change_visibility(&tag.receipt_handle, visibility_timeout)
            .await?;
        Ok(())
    }

    /// Create a temporary queue, used as a reply address.
    pub async fn create_temp_queue(&self) -> MqResult<QueueName> {
        let name = QueueNames::temp_queue();
        self.queue_manager.get_or_create(&name).await?;
        Ok(name)
    }

    /// Flush every buffer completely.
    pub async fn flush(&self) -> usize {
        self.buffers.drain_all(true, false).await
    }
}

#[async_trait]
impl MessageProducer for MqClient {
    async fn publish(&self, queue: &QueueName, message: &Message) -> MqResult<()> {
        let (body, attributes) = codec::encode(message)?;
        self.buffer(queue)
            .await?
            .send(SendEntry {
                id: message.id.to_string(),
                body,
                attributes,
            })
            .await?;
        Ok(())
    }

    async fn send_one_way(&self, queue: &QueueName, message: &Message) -> MqResult<()> {
        let one_way = message
            .clone()
            .with_options(message.options | MessageOptions::NOTIFY_ONE_WAY);
        self.publish(queue, &one_way).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue_manager::QueueDefaults;
    use crate::test_support::RecordingQueueService;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Order {
        id: u32,
    }

    impl QueueMessage for Order {
        const TYPE_NAME: &'static str = "Order";
    }

    fn client(svc: &Arc<RecordingQueueService>, buffered: bool) -> MqClient {
        let qm = Arc::new(QueueManager::new(svc.factory(), QueueDefaults::default()));
        let buffers = Arc::new(BufferFactory::new(svc.factory(), buffered));
        MqClient::new(qm, buffers)
    }

    #[tokio::test]
    async fn test_publish_get_ack() {
        let svc = RecordingQueueService::new();
        let client = client(&svc, false);

        let sent = client.publish_typed(&Order { id: 1 }).await.unwrap();
        assert!(sent.tag.is_none());

        let names = client.queue_names::<Order>();
        let got = client.try_get(&names.input).await.unwrap().unwrap();
        assert_eq!(got.id, sent.id);
        assert_eq!(got.decode_body::<Order>().unwrap(), Order { id: 1 });
        assert_eq!(got.tag.as_ref().unwrap().queue_name, "mq:Order.inq");

        client.ack(&got).await.unwrap();
        assert!(client.try_get(&names.input).await.unwrap().is_none());
        assert_eq!(svc.count("delete_message"), 1);
    }

    #[tokio::test]
    async fn test_ack_requires_tag() {
        let svc = RecordingQueueService::new();
        let client = client(&svc, false);
        assert!(matches!(
            client.ack(&Message::new("{}")).await,
            Err(MqError::InvalidParameter(_))
        ));
    }

    #[tokio::test]
    async fn test_nak_requeues_or_dead_letters() {
        let svc = RecordingQueueService::new();
        let client = client(&svc, false);
        let names = client.queue_names::<Order>();

        client.publish_typed(&Order { id: 2 }).await.unwrap();
        let got = client.try_get(&names.input).await.unwrap().unwrap();
        client
            .nak(&got, true, Some(&MqError::transient("retry me")))
            .await
            .unwrap();

        let again = client.try_get(&names.input).await.unwrap().unwrap();
        assert_eq!(again.id, got.id);
        assert_ne!(again.tag, got.tag);
        assert_eq!(again.error.as_ref().unwrap().code, "ProcessingError");

        client.nak(&again, false, None).await.unwrap();
        assert!(client.try_get(&names.input).await.unwrap().is_none());
        let dead = client.try_get(&names.dead_letter).await.unwrap().unwrap();
        assert_eq!(dead.id, got.id);
    }

    #[tokio::test]
    async fn test_priority_routing() {
        let svc = RecordingQueueService::new();
        let client = client(&svc, false).with_priority_queues(true);
        let names = client.queue_names::<Order>();

        let msg = Message::from_payload(&Order { id: 3 }).unwrap().with_priority(5);
        client.publish_message::<Order>(&msg).await.unwrap();
        assert!(client.try_get(&names.input).await.unwrap().is_none());
        assert!(client.try_get(&names.priority).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_send_one_way_sets_option() {
        let svc = RecordingQueueService::new();
        let client = client(&svc, false);
        let queue = QueueName::new("mq:Notify.inq");

        client
            .send_one_way(&queue, &Message::new("{}"))
            .await
            .unwrap();
        let got = client.try_get(&queue).await.unwrap().unwrap();
        assert!(got.is_one_way());
    }

    #[tokio::test]
    async fn test_buffered_publish_needs_flush() {
        let svc = RecordingQueueService::new();
        let client = client(&svc, true);
        let names = client.queue_names::<Order>();

        client.publish_typed(&Order { id: 4 }).await.unwrap();
        assert_eq!(svc.count("send_message_batch"), 0);
        assert_eq!(client.flush().await, 1);
        assert!(client.try_get(&names.input).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_temp_queue() {
        let svc = RecordingQueueService::new();
        let client = client(&svc, false);
        let temp = client.create_temp_queue().await.unwrap();
        assert!(temp.is_temporary());
        assert_eq!(svc.count("create_queue"), 1);
    }
}
