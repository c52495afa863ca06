//! A [`RawFifo`] behind one exclusive lock.
//!
//! Every operation holds the lock for its whole check-and-mutate sequence:
//! the full test and the enqueue in [`push_back`](GuardedFifo::push_back),
//! the empty test and the dequeue in [`pop_front`](GuardedFifo::pop_front),
//! are never split across two critical sections.

use std::sync::{Mutex, MutexGuard, PoisonError};

use super::RawFifo;
use crate::error::{QueueError, Result};

/// Outcome of a push against a bounded container.
///
/// A full container is an expected outcome, not an error, so it is reported
/// here and the rejected element is handed back.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Push<T> {
    /// The element was enqueued.
    Accepted,
    /// The container was full; the element is returned untouched.
    Full(T),
}

impl<T> Push<T> {
    /// Returns `true` if the element was enqueued.
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    /// Returns the rejected element, if any.
    #[must_use]
    pub fn into_rejected(self) -> Option<T> {
        match self {
            Self::Accepted => None,
            Self::Full(item) => Some(item),
        }
    }
}

#[derive(Debug)]
struct State<C> {
    raw: C,
    /// Head elements reserved by poppers that are waiting for their token.
    claimed: usize,
    closed: bool,
}

impl<C: RawFifo> State<C> {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    fn unclaimed(&self) -> usize {
        self.raw.len() - self.claimed
    }
}

/// Thread-safe bounded FIFO.
///
/// Once [`close`](Self::close)d the contents are frozen: every push, pop and
/// peek fails with [`QueueError::Closed`].
#[derive(Debug)]
pub struct GuardedFifo<C> {
    state: Mutex<State<C>>,
}

impl<C: RawFifo> GuardedFifo<C> {
    /// Creates an empty FIFO holding at most `capacity` elements.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::from_raw(C::with_capacity(capacity))
    }

    /// Wraps an existing container.
    #[must_use]
    pub const fn from_raw(raw: C) -> Self {
        Self {
            state: Mutex::new(State {
                raw,
                claimed: 0,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<C>> {
        // Each mutation is a single container call, so a panic elsewhere
        // never leaves the state half-updated.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `item` unless the FIFO is full.
    ///
    /// # Errors
    ///
    /// [`QueueError::Closed`] once closed.
    pub fn push_back(&self, item: C::Item) -> Result<Push<C::Item>> {
        let mut state = self.lock();
        state.check_open()?;
        Ok(match state.raw.push_back(item) {
            Ok(()) => Push::Accepted,
            Err(item) => Push::Full(item),
        })
    }

    /// Removes the head, or returns `None` if no element is available.
    ///
    /// Elements claimed by a waiting popper are not available.
    ///
    /// # Errors
    ///
    /// [`QueueError::Closed`] once closed.
    pub fn pop_front(&self) -> Result<Option<C::Item>> {
        let mut state = self.lock();
        state.check_open()?;
        if state.unclaimed() == 0 {
            return Ok(None);
        }
        Ok(state.raw.pop_front())
    }

    /// Copies the head without removing it.
    ///
    /// # Errors
    ///
    /// [`QueueError::Closed`] once closed.
    pub fn front(&self) -> Result<Option<C::Item>>
    where
        C::Item: Clone,
    {
        let state = self.lock();
        state.check_open()?;
        Ok(state.raw.front().cloned())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().raw.len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.lock().raw.capacity()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().raw.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.lock().raw.is_full()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Freezes the FIFO. Returns `true` for the call that performed the
    /// transition.
    pub fn close(&self) -> bool {
        let mut state = self.lock();
        !std::mem::replace(&mut state.closed, true)
    }

    /// Reserves one unclaimed element for the caller.
    ///
    /// Returns `false` if every stored element is already claimed.
    pub(crate) fn claim(&self) -> Result<bool> {
        let mut state = self.lock();
        state.check_open()?;
        if state.unclaimed() == 0 {
            return Ok(false);
        }
        state.claimed += 1;
        Ok(true)
    }

    /// Dequeues the head on behalf of a successful [`claim`](Self::claim).
    ///
    /// The claim is released whether or not the FIFO was closed meanwhile.
    pub(crate) fn take_claimed(&self) -> Result<Option<C::Item>> {
        let mut state = self.lock();
        state.claimed -= 1;
        state.check_open()?;
        let item = state.raw.pop_front();
        debug_assert!(item.is_some(), "claimed element missing");
        Ok(item)
    }

    /// Drops a claim without dequeuing.
    pub(crate) fn release_claim(&self) {
        self.lock().claimed -= 1;
    }
}
