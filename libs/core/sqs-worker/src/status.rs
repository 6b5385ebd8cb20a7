//! Lifecycle status shared by the server and its workers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Status {
    Stopped = 0,
    Starting = 1,
    Started = 2,
    Stopping = 3,
    Disposed = 4,
}

impl Status {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Status::Stopped,
            1 => Status::Starting,
            2 => Status::Started,
            3 => Status::Stopping,
            _ => Status::Disposed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Stopped => "stopped",
            Status::Starting => "starting",
            Status::Started => "started",
            Status::Stopping => "stopping",
            Status::Disposed => "disposed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status cell updated with compare-and-swap.
#[derive(Debug)]
pub(crate) struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    pub(crate) fn new(status: Status) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub(crate) fn get(&self) -> Status {
        Status::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move from `from` to `to`; false when the current status is not `from`.
    pub(crate) fn transition(&self, from: Status, to: Status) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to `Disposed` from whatever the current status is; false when already disposed.
    pub(crate) fn dispose(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current == Status::Disposed as u8 {
                return false;
            }
            match self.0.compare_exchange(
                current,
                Status::Disposed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn is(&self, status: Status) -> bool {
        self.get() == status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_only_from_expected() {
        let status = AtomicStatus::new(Status::Stopped);
        assert!(status.transition(Status::Stopped, Status::Starting));
        assert!(!status.transition(Status::Stopped, Status::Starting));
        assert_eq!(status.get(), Status::Starting);

        assert!(status.dispose());
        assert!(!status.dispose());
        assert!(status.is(Status::Disposed));
        assert!(!status.transition(Status::Started, Status::Stopping));
        assert!(!status.transition(Status::Disposed, Status::Stopped));
    }

    #[test]
    fn test_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Status::Started).unwrap(), "\"started\"");
        assert_eq!(Status::Stopping.to_string(), "stopping");
    }
}
