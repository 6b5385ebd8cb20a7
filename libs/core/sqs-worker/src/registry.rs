//! Handler registrations.
//!
//! Each registered message type becomes a [`WorkerInfo`]: the handler factory, the queues
//! of the type and the settings its workers and queues are created with.

use crate::config::MqServerConfig;
use crate::definition::BufferSizes;
use crate::error::{MqError, MqResult};
use crate::handler::{MessageHandler, MessageProcessor, QueueMessage, TypedMessageHandler};
use crate::names::QueueNames;
use crate::queue_manager::TypeQueueOptions;
use crate::service::{validate_retry_count, validate_visibility_timeout, validate_wait_time};
use std::fmt;
use std::sync::Arc;

/// Builds a fresh handler for one worker.
pub type HandlerFactory = Arc<dyn Fn() -> Arc<dyn MessageHandler> + Send + Sync>;

/// Per-type overrides of the server defaults.
#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    pub thread_count: Option<usize>,
    pub retry_count: Option<u32>,
    pub visibility_timeout: Option<u32>,
    pub receive_wait_time: Option<u32>,
    pub buffer_sizes: Option<BufferSizes>,
    /// Force batching on or off for this type's queues.
    pub buffered: Option<bool>,
    pub priority_queue: Option<bool>,
}

impl HandlerOptions {
    pub fn with_thread_count(mut self, threads: usize) -> Self {
        self.thread_count = Some(threads);
        self
    }

    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count = Some(retries);
        self
    }

    pub fn with_visibility_timeout(mut self, secs: u32) -> Self {
        self.visibility_timeout = Some(secs);
        self
    }

    pub fn with_receive_wait_time(mut self, secs: u32) -> Self {
        self.receive_wait_time = Some(secs);
        self
    }

    pub fn with_buffer_sizes(mut self, sizes: BufferSizes) -> Self {
        self.buffer_sizes = Some(sizes);
        self
    }

    pub fn with_buffering(mut self, enabled: bool) -> Self {
        self.buffered = Some(enabled);
        self
    }

    pub fn with_priority_queue(mut self, enabled: bool) -> Self {
        self.priority_queue = Some(enabled);
        self
    }
}

/// A validated registration for one message type.
#[derive(Clone)]
pub struct WorkerInfo {
    pub type_name: &'static str,
    pub queue_names: QueueNames,
    pub thread_count: usize,
    pub retry_count: u32,
    pub visibility_timeout: u32,
    pub receive_wait_time: u32,
    pub buffer_sizes: BufferSizes,
    pub buffered: Option<bool>,
    pub priority_queue: bool,
    pub handler_factory: HandlerFactory,
}

impl fmt::Debug for WorkerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerInfo")
            .field("type_name", &self.type_name)
            .field("queue_names", &self.queue_names)
            .field("thread_count", &self.thread_count)
            .field("retry_count", &self.retry_count)
            .field("visibility_timeout", &self.visibility_timeout)
            .field("receive_wait_time", &self.receive_wait_time)
            .field("buffered", &self.buffered)
            .field("priority_queue", &self.priority_queue)
            .finish_non_exhaustive()
    }
}

impl WorkerInfo {
    /// Resolve `options` against the server `config` and validate the result.
    pub fn new<T, P>(processor: P, options: HandlerOptions, config: &MqServerConfig) -> MqResult<Self>
    where
        T: QueueMessage,
        P: MessageProcessor<T>,
    {
        let thread_count = options.thread_count.unwrap_or(1);
        if thread_count == 0 {
            return Err(MqError::Config(format!(
                "{}: thread count must be at least 1",
                T::TYPE_NAME
            )));
        }
        let retry_count = options.retry_count.unwrap_or(config.retry_count);
        let visibility_timeout = options
            .visibility_timeout
            .unwrap_or(config.visibility_timeout);
        let receive_wait_time = options.receive_wait_time.unwrap_or(config.receive_wait_time);
        validate_retry_count(retry_count)?;
        validate_visibility_timeout(visibility_timeout)?;
        validate_wait_time(receive_wait_time)?;

        let queue_names = QueueNames::with_prefix(&config.queue_name_prefix, T::TYPE_NAME);
        let processor = Arc::new(processor);
        let handler_names = queue_names.clone();
        let out_queue = config.publish_responses_to_out_queue;
        let handler_factory: HandlerFactory = Arc::new(move || -> Arc<dyn MessageHandler> {
            Arc::new(
                TypedMessageHandler::new(processor.clone(), handler_names.clone(), retry_count)
                    .with_out_queue_responses(out_queue),
            )
        });

        Ok(Self {
            type_name: T::TYPE_NAME,
            queue_names,
            thread_count,
            retry_count,
            visibility_timeout,
            receive_wait_time,
            buffer_sizes: options.buffer_sizes.unwrap_or(config.buffer_sizes),
            buffered: options.buffered,
            priority_queue: options
                .priority_queue
                .unwrap_or(config.enable_priority_queues),
            handler_factory,
        })
    }

    pub(crate) fn queue_options(&self) -> TypeQueueOptions {
        TypeQueueOptions {
            retry_count: self.retry_count,
            visibility_timeout: self.visibility_timeout,
            receive_wait_time: self.receive_wait_time,
            buffer_sizes: self.buffer_sizes,
            priority_queue: self.priority_queue,
        }
    }
}
