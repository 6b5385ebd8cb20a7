//! SQS Worker Framework
//!
//! A durable message-queue worker pool over an SQS-style queue service.
//!
//! ## Features
//!
//! - **Typed handlers**: `MessageProcessor<T>` processes any `QueueMessage` type
//! - **Queues per type**: `mq:{Type}.inq`, `.priorityq`, `.outq` and `.dlq`, with redrive to
//!   the dead-letter queue
//! - **Retries**: failed messages are requeued up to the retry count, then dead-lettered
//! - **Batching buffers**: sends, deletes and visibility changes are batched; receives are
//!   prefetched
//! - **Self-healing**: a crashed worker is replaced by a fresh clone
//! - **Prometheus metrics** and K8s-ready health endpoints
//!
//! ## Example
//!
//! ```ignore
//! use sqs_worker::{
//!     FromEnv, InMemoryQueueService, MqServer, MqServerConfig, QueueMessage, SharedServiceFactory,
//! };
//!
//! #[derive(Serialize, Deserialize)]
//! struct Order { id: u32 }
//!
//! impl QueueMessage for Order {
//!     const TYPE_NAME: &'static str = "Order";
//! }
//!
//! let factory = Arc::new(SharedServiceFactory::new(InMemoryQueueService::shared()));
//! let server = MqServer::new(factory, MqServerConfig::from_env()?)?;
//! server.register_handler::<Order, _>(OrderProcessor)?;
//! server.start()?;
//!
//! server.create_client().publish_typed(&Order { id: 1 }).await?;
//! ```

mod buffer;
mod client;
mod codec;
mod config;
mod definition;
mod error;
mod handler;
mod health;
mod memory;
mod message;
pub mod metrics;
mod names;
mod queue_manager;
mod registry;
mod runtime;
mod server;
mod service;
mod status;
#[cfg(test)]
mod test_support;
mod worker;

// Re-export main types
pub use buffer::{
    BatchingBuffer, BufferFactory, ErrorHandler, PassThroughBuffer, QueueBuffer,
    log_error_handler,
};
pub use client::{MessageProducer, MqClient};
pub use config::{ConfigError, Environment, FromEnv, MqServerConfig, env_or_default};
pub use definition::{BufferSizes, DefinitionRef, QueueDefinition};
pub use error::{ErrorCategory, MqError, MqResult};
pub use handler::{
    HandlerStatsSnapshot, IsRunning, MessageHandler, MessageProcessor, QueueMessage,
    TypedMessageHandler,
};
pub use health::{HealthState, health_router};
pub use memory::InMemoryQueueService;
pub use message::{ErrorPayload, Message, MessageOptions, MessageTag, TypedMessage};
pub use metrics::{QueueMetrics, init_metrics};
pub use names::{QueueName, QueueNames};
pub use queue_manager::{QueueDefaults, QueueManager, TypeQueueOptions, TypeQueues};
pub use registry::{HandlerFactory, HandlerOptions, WorkerInfo};
pub use server::{MqServer, MqServerStats};
pub use service::{
    AttributeValue, BatchEntryError, BatchResult, ChangeVisibilityEntry, DeleteEntry,
    MessageAttributes, QueueAttributes, QueueService, QueueServiceFactory, QueueSettings,
    ReceiveRequest, ReceivedMessage, RedrivePolicy, SendEntry, SharedServiceFactory,
};
pub use status::Status;
pub use worker::{Worker, WorkerStats};
