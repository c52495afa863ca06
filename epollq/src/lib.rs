//! Bounded, thread-safe FIFO queue that a reactor can poll like a socket.
//!
//! Producer threads push into an [`EpollableBoundedQueue`]; a single-threaded
//! reactor registers the queue's readiness descriptor next to its sockets and
//! pops when it fires. No polling thread, busy loop or condition variable is
//! involved: a pipe acts as a counting semaphore whose token count always
//! equals the number of undelivered elements.
//!
//! - [`channel`]: the pipe-backed [`ReadinessChannel`]
//! - [`fifo`]: the [`RawFifo`] container contract, its ring and list
//!   implementations, and the locked [`GuardedFifo`]
//! - [`queue`]: [`EpollableBoundedQueue`], composing the two
//! - [`dispatch`]: the [`MessageSink`] capability and a mio-driven
//!   [`Dispatcher`] thread
//!
//! Logging goes through `tracing` when the `tracing` feature is enabled and
//! compiles away otherwise; see [`init_tracing`].

#![cfg(unix)]

pub mod channel;
pub mod dispatch;
pub mod error;
pub mod fifo;
pub mod queue;
mod trace;

pub use channel::ReadinessChannel;
pub use dispatch::{DispatchError, Dispatcher, DispatcherConfig, MessageSink};
pub use error::{QueueError, Result};
pub use fifo::{GuardedFifo, ListFifo, RawFifo, RingFifo};
pub use queue::{EpollableBoundedQueue, Push, QueueConfig};
pub use trace::init_tracing;
