//! Queue naming.
//!
//! Logical queue names follow the `mq:{Type}.{suffix}` convention and may contain characters
//! the remote service rejects. [`QueueName`] pairs a logical name with its wire-safe form;
//! equality and hashing use the logical name only, case-insensitively.

use std::fmt;
use std::hash::{Hash, Hasher};

/// Prefix of every logical queue name.
pub const MQ_PREFIX: &str = "mq:";

/// Prefix of temporary (reply) queues.
pub const TEMP_MQ_PREFIX: &str = "mq:tmp:";

/// Longest wire name the remote service accepts.
pub const MAX_WIRE_NAME_LEN: usize = 80;

const IN_SUFFIX: &str = ".inq";
const PRIORITY_SUFFIX: &str = ".priorityq";
const OUT_SUFFIX: &str = ".outq";
const DLQ_SUFFIX: &str = ".dlq";

/// Map a logical queue name to the wire-safe form.
///
/// Every character outside `[A-Za-z0-9_-]` becomes `-` and the result is truncated to
/// [`MAX_WIRE_NAME_LEN`]. Applying it to an already-sanitized name returns it unchanged.
pub fn wire_name(logical: &str) -> String {
    logical
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .take(MAX_WIRE_NAME_LEN)
        .collect()
}

/// Wire-name prefix shared by all temporary queues.
pub fn temp_wire_prefix() -> String {
    wire_name(TEMP_MQ_PREFIX)
}

/// Logical name plus its wire-safe form.
#[derive(Debug, Clone)]
pub struct QueueName {
    logical: String,
    wire: String,
}

impl QueueName {
    pub fn new(logical: impl Into<String>) -> Self {
        let logical = logical.into();
        let wire = wire_name(&logical);
        Self { logical, wire }
    }

    /// The name used by callers (`mq:Order.inq`).
    pub fn logical(&self) -> &str {
        &self.logical
    }

    /// The name sent to the remote service (`mq-Order-inq`).
    pub fn wire(&self) -> &str {
        &self.wire
    }

    pub fn is_temporary(&self) -> bool {
        self.logical
            .get(..TEMP_MQ_PREFIX.len())
            .is_some_and(|p| p.eq_ignore_ascii_case(TEMP_MQ_PREFIX))
            || self.wire.starts_with(&temp_wire_prefix())
    }

    /// Dead-letter queue belonging to this queue.
    ///
    /// `mq:Order.inq` and `mq:Order.priorityq` map to `mq:Order.dlq`; names outside the
    /// convention get a `.dlq` suffix.
    pub fn dead_letter(&self) -> QueueName {
        for suffix in [IN_SUFFIX, PRIORITY_SUFFIX, OUT_SUFFIX] {
            if let Some(stem) = self.logical.strip_suffix(suffix) {
                return QueueName::new(format!("{stem}{DLQ_SUFFIX}"));
            }
        }
        if self.logical.ends_with(DLQ_SUFFIX) {
            return self.clone();
        }
        QueueName::new(format!("{}{DLQ_SUFFIX}", self.logical))
    }

    fn key(&self) -> String {
        self.logical.to_ascii_lowercase()
    }
}

impl PartialEq for QueueName {
    fn eq(&self, other: &Self) -> bool {
        self.logical.eq_ignore_ascii_case(&other.logical)
    }
}

impl Eq for QueueName {}

impl Hash for QueueName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.logical)
    }
}

impl From<&str> for QueueName {
    fn from(value: &str) -> Self {
        QueueName::new(value)
    }
}

impl From<String> for QueueName {
    fn from(value: String) -> Self {
        QueueName::new(value)
    }
}

/// The queue set derived for one message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub input: QueueName,
    pub priority: QueueName,
    pub out: QueueName,
    pub dead_letter: QueueName,
}

impl QueueNames {
    /// Queue names for `type_name`, e.g. `mq:Order.inq`.
    pub fn for_type(type_name: &str) -> Self {
        Self::with_prefix("", type_name)
    }

    /// Queue names with an extra environment prefix, e.g. `mq:staging-Order.inq`.
    pub fn with_prefix(prefix: &str, type_name: &str) -> Self {
        let stem = format!("{MQ_PREFIX}{prefix}{type_name}");
        Self {
            input: QueueName::new(format!("{stem}{IN_SUFFIX}")),
            priority: QueueName::new(format!("{stem}{PRIORITY_SUFFIX}")),
            out: QueueName::new(format!("{stem}{OUT_SUFFIX}")),
            dead_letter: QueueName::new(format!("{stem}{DLQ_SUFFIX}")),
        }
    }

    /// A fresh temporary queue name, used for reply queues.
    pub fn temp_queue() -> QueueName {
        QueueName::new(format!("{TEMP_MQ_PREFIX}{}", uuid::Uuid::new_v4().simple()))
    }
}
