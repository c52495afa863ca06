//! Error type shared by the readiness channel and the queue.
//!
//! A full queue and an empty queue are ordinary outcomes and never appear
//! here: see [`Push::Full`](crate::queue::Push::Full) and the `Ok(None)`
//! returned by [`pop_front`](crate::queue::EpollableBoundedQueue::pop_front).

use rustix::io::Errno;
use thiserror::Error;

/// Result alias for queue and channel operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Failures reported by [`ReadinessChannel`](crate::channel::ReadinessChannel)
/// and [`EpollableBoundedQueue`](crate::queue::EpollableBoundedQueue).
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue (or its channel) has been closed.
    #[error("queue is closed")]
    Closed,
    /// The OS refused to allocate or configure the channel descriptors.
    #[error("failed to set up readiness channel ({op}): {source}")]
    Resource {
        op: &'static str,
        #[source]
        source: Errno,
    },
    /// The requested capacity cannot be backed by the channel buffer.
    #[error("capacity {capacity} is outside the readiness channel limit of 1..={limit} tokens")]
    InvalidCapacity { capacity: usize, limit: usize },
    /// A read or write on the channel failed with something other than `EINTR`.
    #[error("readiness channel {op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: Errno,
    },
}

impl QueueError {
    /// Returns `true` for construction-time resource failures.
    #[must_use]
    pub const fn is_resource(&self) -> bool {
        matches!(self, Self::Resource { .. } | Self::InvalidCapacity { .. })
    }

    /// Returns `true` if the failure is due to the queue being closed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl From<QueueError> for std::io::Error {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Closed => Self::new(std::io::ErrorKind::BrokenPipe, err),
            QueueError::InvalidCapacity { .. } => {
                Self::new(std::io::ErrorKind::InvalidInput, err)
            }
            QueueError::Resource { source, .. } | QueueError::Io { source, .. } => source.into(),
        }
    }
}
