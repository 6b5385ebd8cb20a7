//! Per-queue buffers between callers and the remote service.
//!
//! A [`QueueBuffer`] fronts one queue. [`BatchingBuffer`] batches sends, deletes and
//! visibility changes and prefetches receives; [`PassThroughBuffer`] issues one remote call per
//! operation. [`BufferFactory`] keeps one buffer per queue and drives periodic drains.

mod batching;
mod factory;
mod passthrough;

pub use batching::BatchingBuffer;
pub use factory::BufferFactory;
pub use passthrough::PassThroughBuffer;

use crate::definition::DefinitionRef;
use crate::error::{MqError, MqResult};
use crate::service::{QueueService, QueueServiceFactory, ReceivedMessage, SendEntry};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::warn;

/// Callback receiving failures that are not returned to any caller, such as failed entries of
/// a batch call.
pub type ErrorHandler = Arc<dyn Fn(&MqError) + Send + Sync>;

/// Error handler that logs at warn level.
pub fn log_error_handler() -> ErrorHandler {
    Arc::new(|err: &MqError| warn!(error = %err, code = err.code(), "Queue operation failed"))
}

/// Local front of one remote queue.
///
/// The outbound operations return whether a remote call was made.
#[async_trait]
pub trait QueueBuffer: Send + Sync {
    fn definition(&self) -> &DefinitionRef;

    async fn send(&self, entry: SendEntry) -> MqResult<bool>;

    async fn delete(&self, receipt_handle: &str) -> MqResult<bool>;

    async fn change_visibility(&self, receipt_handle: &str, visibility_timeout: u32)
    -> MqResult<bool>;

    /// Next message, from the prefetch cache when possible.
    async fn receive(&self, wait_time: Duration) -> MqResult<Option<ReceivedMessage>>;

    /// Flush buffered operations; returns the number of remote calls made.
    ///
    /// `full_drain` flushes everything regardless of thresholds. `nak_received` also returns
    /// every prefetched message to the queue by resetting its visibility.
    async fn drain(&self, full_drain: bool, nak_received: bool) -> MqResult<usize>;

    /// Final drain, then release the remote client.
    async fn dispose(&self);
}

/// Lazily created remote client handle.
pub(crate) struct ClientSlot {
    factory: Arc<dyn QueueServiceFactory>,
    client: Mutex<Option<Arc<dyn QueueService>>>,
}

impl ClientSlot {
    pub(crate) fn new(factory: Arc<dyn QueueServiceFactory>) -> Self {
        Self {
            factory,
            client: Mutex::new(None),
        }
    }

    pub(crate) fn get(&self) -> Arc<dyn QueueService> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(|| self.factory.create_client())
            .clone()
    }

    pub(crate) fn release(&self) {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
