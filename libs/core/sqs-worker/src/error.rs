//! Queue error types and error categorization
//!
//! Errors are categorized to determine retry behavior:
//! - **Transient**: Temporary failures, the worker backs off and polls again
//! - **Permanent**: Unrecoverable errors, the message goes to the dead-letter queue
//! - **RateLimited**: Remote throttling, longer backoff before retry

use thiserror::Error;

/// Category of error for determining retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure - retry with backoff
    Transient,
    /// Unrecoverable error - dead-letter immediately
    Permanent,
    /// Remote service throttled the call - longer backoff
    RateLimited,
}

impl ErrorCategory {
    /// Multiplier applied to the worker backoff step for this category
    pub fn backoff_factor(&self) -> u32 {
        match self {
            ErrorCategory::Transient => 1,
            ErrorCategory::Permanent => 0,
            ErrorCategory::RateLimited => 5,
        }
    }
}

/// Errors raised by the queue service, buffers, workers and the server
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MqError {
    /// The remote queue does not exist
    #[error("Queue does not exist: {0}")]
    QueueDoesNotExist(String),

    /// A queue with the same name exists with different attributes
    #[error("Queue already exists with different attributes: {0}")]
    QueueNameExists(String),

    /// A request parameter is outside what the remote service accepts
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A batch request carried no entries
    #[error("Batch request contains no entries")]
    EmptyBatch,

    /// A batch request exceeded the service maximum
    #[error("Batch of {count} entries exceeds limit of {max}")]
    TooManyEntries { count: usize, max: usize },

    /// Two entries in one batch request share an id
    #[error("Duplicate batch entry id: {0}")]
    BatchEntryIdsNotDistinct(String),

    /// The receipt handle is unknown to the queue
    #[error("Receipt handle is invalid: {0}")]
    ReceiptHandleInvalid(String),

    /// The message for this receipt handle is not in flight anymore
    #[error("Message not in flight: {0}")]
    MessageNotInflight(String),

    /// A single entry of a batch call failed
    #[error("Batch entry {id} failed on {queue}: [{code}] {message}")]
    BatchEntry {
        queue: String,
        id: String,
        code: String,
        message: String,
    },

    /// Transport or service-side failure
    #[error("Queue service error [{code}]: {message}")]
    Service { code: String, message: String },

    /// Remote throttling
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Message processing failed
    #[error("Processing error: {message}")]
    Processing {
        message: String,
        category: ErrorCategory,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation on a disposed object
    #[error("Object disposed: {0}")]
    Disposed(String),

    /// `start()` was called without any registered handler
    #[error("No message handlers were registered")]
    NoHandlersRegistered,

    /// Unrecoverable worker failure; the worker stops and is replaced
    #[error("Fatal worker error: {0}")]
    Fatal(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MqError {
    /// Create a transient processing error
    pub fn transient(message: impl Into<String>) -> Self {
        MqError::Processing {
            message: message.into(),
            category: ErrorCategory::Transient,
        }
    }

    /// Create a permanent processing error
    pub fn permanent(message: impl Into<String>) -> Self {
        MqError::Processing {
            message: message.into(),
            category: ErrorCategory::Permanent,
        }
    }

    /// Create a transient service error
    pub fn service(code: impl Into<String>, message: impl Into<String>) -> Self {
        MqError::Service {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            MqError::Service { .. } => ErrorCategory::Transient,
            MqError::BatchEntry { .. } => ErrorCategory::Transient,
            MqError::RateLimited(_) => ErrorCategory::RateLimited,
            MqError::Processing { category, .. } => *category,
            MqError::QueueDoesNotExist(_)
            | MqError::QueueNameExists(_)
            | MqError::InvalidParameter(_)
            | MqError::EmptyBatch
            | MqError::TooManyEntries { .. }
            | MqError::BatchEntryIdsNotDistinct(_)
            | MqError::ReceiptHandleInvalid(_)
            | MqError::MessageNotInflight(_)
            | MqError::Serialization(_)
            | MqError::Config(_)
            | MqError::Disposed(_)
            | MqError::NoHandlersRegistered
            | MqError::Fatal(_)
            | MqError::Internal(_) => ErrorCategory::Permanent,
        }
    }

    /// Check if a failed message should be requeued after `retry_attempts` attempts
    pub fn should_retry(&self, retry_attempts: u32, retry_count: u32) -> bool {
        self.category() != ErrorCategory::Permanent && retry_attempts < retry_count
    }

    /// "Resource not found" responses are a normal negative result, not a failure
    pub fn is_not_found(&self) -> bool {
        matches!(self, MqError::QueueDoesNotExist(_))
    }

    /// Errors that must take a worker down and hand it to the server for replacement
    pub fn is_fatal(&self) -> bool {
        matches!(self, MqError::Fatal(_))
    }

    /// Short stable code for metrics labels and error payloads
    pub fn code(&self) -> &'static str {
        match self {
            MqError::QueueDoesNotExist(_) => "QueueDoesNotExist",
            MqError::QueueNameExists(_) => "QueueNameExists",
            MqError::InvalidParameter(_) => "InvalidParameter",
            MqError::EmptyBatch => "EmptyBatchRequest",
            MqError::TooManyEntries { .. } => "TooManyEntriesInBatchRequest",
            MqError::BatchEntryIdsNotDistinct(_) => "BatchEntryIdsNotDistinct",
            MqError::ReceiptHandleInvalid(_) => "ReceiptHandleIsInvalid",
            MqError::MessageNotInflight(_) => "MessageNotInflight",
            MqError::BatchEntry { .. } => "BatchEntryFailed",
            MqError::Service { .. } => "ServiceError",
            MqError::RateLimited(_) => "RateLimited",
            MqError::Serialization(_) => "SerializationError",
            MqError::Processing { .. } => "ProcessingError",
            MqError::Config(_) => "ConfigError",
            MqError::Disposed(_) => "ObjectDisposed",
            MqError::NoHandlersRegistered => "NoHandlersRegistered",
            MqError::Fatal(_) => "Fatal",
            MqError::Internal(_) => "InternalError",
        }
    }
}

impl From<serde_json::Error> for MqError {
    fn from(err: serde_json::Error) -> Self {
        MqError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for MqError {
    fn from(err: std::io::Error) -> Self {
        MqError::Internal(err.to_string())
    }
}

/// Convenience result alias
pub type MqResult<T> = Result<T, MqError>;
