//! Message handlers
//!
//! A [`MessageProcessor`] holds the business logic for one message type. The
//! [`TypedMessageHandler`] wraps it with the queue protocol: pull messages, decode them,
//! acknowledge on success, requeue or dead-letter on failure and publish responses.

use crate::client::{MessageProducer, MqClient};
use crate::error::{MqError, MqResult};
use crate::message::{Message, TypedMessage};
use crate::metrics::QueueMetrics;
use crate::names::{QueueName, QueueNames};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, error, warn};

/// A payload type that travels through its own set of queues.
pub trait QueueMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name used to derive the queue names, e.g. `Order` for `mq:Order.inq`.
    const TYPE_NAME: &'static str;
}

/// Business logic for messages of type `T`.
///
/// Returning `Ok(Some(value))` publishes `value` as the response. Returning an error fails
/// the message; [`MqError::Fatal`] additionally takes the worker down for replacement.
#[async_trait]
pub trait MessageProcessor<T: QueueMessage>: Send + Sync + 'static {
    async fn process(&self, message: &TypedMessage<T>) -> MqResult<Option<serde_json::Value>>;

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Predicate workers pass to handlers so long passes stop promptly.
pub type IsRunning<'a> = &'a (dyn Fn() -> bool + Send + Sync);

/// Processes the messages of one queue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn type_name(&self) -> &str;

    /// Pull and process messages from `queue` until it is empty or `is_running` turns false.
    ///
    /// Returns the number of messages processed in this pass.
    async fn process_queue(
        &self,
        client: &MqClient,
        queue: &QueueName,
        is_running: IsRunning<'_>,
    ) -> MqResult<usize>;

    fn stats(&self) -> HandlerStatsSnapshot;
}

/// Point-in-time handler counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerStatsSnapshot {
    pub type_name: String,
    pub received: u64,
    pub priority_received: u64,
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
}

impl HandlerStatsSnapshot {
    /// Sum of two snapshots, keeping the latest processing time.
    pub fn merge(&mut self, other: &HandlerStatsSnapshot) {
        self.received += other.received;
        self.priority_received += other.priority_received;
        self.processed += other.processed;
        self.failed += other.failed;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.last_processed_at = self.last_processed_at.max(other.last_processed_at);
    }
}

#[derive(Default)]
struct HandlerStats {
    received: AtomicU64,
    priority_received: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    last_processed_at: Mutex<Option<DateTime<Utc>>>,
}

impl HandlerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, type_name: &str) -> HandlerStatsSnapshot {
        HandlerStatsSnapshot {
            type_name: type_name.to_string(),
            received: self.received.load(Ordering::Relaxed),
            priority_received: self.priority_received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            last_processed_at: *self
                .last_processed_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }
}

/// Queue protocol around a [`MessageProcessor`].
pub struct TypedMessageHandler<T, P> {
    processor: Arc<P>,
    names: QueueNames,
    retry_count: u32,
    publish_responses_to_out_queue: bool,
    stats: HandlerStats,
    _payload: std::marker::PhantomData<fn() -> T>,
}

impl<T: QueueMessage, P: MessageProcessor<T>> TypedMessageHandler<T, P> {
    pub fn new(processor: Arc<P>, names: QueueNames, retry_count: u32) -> Self {
        Self {
            processor,
            names,
            retry_count,
            publish_responses_to_out_queue: false,
            stats: HandlerStats::default(),
            _payload: std::marker::PhantomData,
        }
    }

    /// Publish responses (or the request itself when there is none) to the out queue when
    /// the message has no reply address.
    pub fn with_out_queue_responses(mut self, enabled: bool) -> Self {
        self.publish_responses_to_out_queue = enabled;
        self
    }

    async fn process_message(
        &self,
        client: &MqClient,
        queue: &QueueName,
        metrics: &QueueMetrics,
        message: Message,
    ) -> MqResult<()> {
        let started = Instant::now();
        HandlerStats::bump(&self.stats.received);
        if *queue == self.names.priority {
            HandlerStats::bump(&self.stats.priority_received);
        }
        metrics.message_received();

        let typed = match TypedMessage::<T>::decode(message.clone()) {
            Ok(typed) => typed,
            Err(e) => {
                error!(queue = %queue, message_id = %message.id, error = %e, "Undecodable message body");
                HandlerStats::bump(&self.stats.failed);
                HandlerStats::bump(&self.stats.dead_lettered);
                metrics.message_failed(e.code());
                metrics.message_dead_lettered();
                return client.nak(&message, false, Some(&e)).await;
            }
        };

        match self.processor.process(&typed).await {
            Ok(response) => {
                client.ack(&message).await?;
                HandlerStats::bump(&self.stats.processed);
                *self
                    .stats
                    .last_processed_at
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
                metrics.message_processed(started.elapsed());
                self.publish_response(client, &message, response).await
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                HandlerStats::bump(&self.stats.failed);
                metrics.message_failed(e.code());

                let requeue = e.should_retry(message.retry_attempts, self.retry_count);
                let mut failed = message;
                failed.retry_attempts += 1;
                if requeue {
                    HandlerStats::bump(&self.stats.retried);
                    metrics.message_retried();
                    debug!(
                        queue = %queue,
                        message_id = %failed.id,
                        attempt = failed.retry_attempts,
                        error = %e,
                        "Message failed, requeueing"
                    );
                } else {
                    HandlerStats::bump(&self.stats.dead_lettered);
                    metrics.message_dead_lettered();
                    warn!(
                        queue = %queue,
                        message_id = %failed.id,
                        attempts = failed.retry_attempts,
                        error = %e,
                        "Message failed, moving to dead-letter queue"
                    );
                }
                client.nak(&failed, requeue, Some(&e)).await
            }
        }
    }

    async fn publish_response(
        &self,
        client: &MqClient,
        request: &Message,
        response: Option<serde_json::Value>,
    ) -> MqResult<()> {
        if request.is_one_way() {
            return Ok(());
        }

        if let Some(reply_to) = &request.reply_to {
            let Some(body) = response else {
                return Ok(());
            };
            let reply = Message::new(serde_json::to_string(&body)?)
                .with_reply_id(request.reply_id.unwrap_or(request.id));
            return client.publish(&QueueName::new(reply_to.as_str()), &reply).await;
        }

        if self.publish_responses_to_out_queue {
            let out = match response {
                Some(body) => Message::new(serde_json::to_string(&body)?).with_reply_id(request.id),
                None => request.for_republish(),
            };
            return client.publish(&self.names.out, &out).await;
        }
        Ok(())
    }
}

#[async_trait]
impl<T: QueueMessage, P: MessageProcessor<T>> MessageHandler for TypedMessageHandler<T, P> {
    fn type_name(&self) -> &str {
        T::TYPE_NAME
    }

    async fn process_queue(
        &self,
        client: &MqClient,
        queue: &QueueName,
        is_running: IsRunning<'_>,
    ) -> MqResult<usize> {
        let metrics = QueueMetrics::new(queue.logical());
        let mut processed = 0;
        while is_running() {
            let Some(message) = client.try_get(queue).await? else {
                break;
            };
            self.process_message(client, queue, &metrics, message).await?;
            processed += 1;
        }
        if processed > 0 {
            debug!(queue = %queue, processor = self.processor.name(), processed, "Queue pass finished");
        }
        Ok(processed)
    }

    fn stats(&self) -> HandlerStatsSnapshot {
        self.stats.snapshot(T::TYPE_NAME)
    }
}
