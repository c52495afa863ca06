//! Bounded FIFO containers.
//!
//! [`RawFifo`] is the minimal container contract the queue depends on. It is
//! deliberately single-threaded: [`GuardedFifo`] adds the lock, and
//! [`EpollableBoundedQueue`](crate::queue::EpollableBoundedQueue) adds the
//! readiness channel on top.
//!
//! Two backing stores are provided:
//! - [`RingFifo`] - fixed slot array, no allocation after construction
//! - [`ListFifo`] - linked list, allocates per element

pub mod guarded;
pub mod list;
pub mod ring;

pub use guarded::GuardedFifo;
pub use list::ListFifo;
pub use ring::RingFifo;

/// Single-threaded bounded FIFO capability.
pub trait RawFifo {
    /// Element type.
    type Item;

    /// Creates an empty container holding at most `capacity` elements.
    fn with_capacity(capacity: usize) -> Self;

    /// Appends `item` at the tail.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the container is full.
    fn push_back(&mut self, item: Self::Item) -> Result<(), Self::Item>;

    /// Removes and returns the head, or `None` if empty.
    fn pop_front(&mut self) -> Option<Self::Item>;

    /// Borrows the head without removing it.
    fn front(&self) -> Option<&Self::Item>;

    /// Number of stored elements.
    fn len(&self) -> usize;

    /// Maximum number of elements.
    fn capacity(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }
}
