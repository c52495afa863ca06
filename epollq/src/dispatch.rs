//! Delivering popped elements to the message-routing layer.
//!
//! - [`MessageSink`] - the single "accept an inbound message" capability
//! - [`Dispatcher`] - a reactor thread that waits on a queue's descriptor
//!   with [`mio`] and drains it into a sink
//!
//! # Shutdown
//!
//! [`Dispatcher::shutdown`] sets a stop flag and rings a [`mio::Waker`]
//! registered in the same `Poll` as the queue. The reactor drains once more
//! before exiting, so every element whose push completed before the call is
//! delivered.
//!
//! The reactor also exits on its own when the queue is closed. It registers
//! a [`notification_handle`](EpollableBoundedQueue::notification_handle)
//! rather than the queue's descriptor: the duplicate stays in the `Poll`
//! after close and reports hang-up, and the following drain sees `Closed`.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::error::QueueError;
use crate::fifo::RawFifo;
use crate::queue::EpollableBoundedQueue;
use crate::trace::{debug, error, info, trace, warn};

const QUEUE: Token = Token(0);
const WAKER: Token = Token(1);

/// Receives each element popped from a queue.
pub trait MessageSink<T> {
    /// Takes ownership of `message` and routes it.
    fn accept(&self, message: T);
}

impl<T, F: Fn(T)> MessageSink<T> for F {
    fn accept(&self, message: T) {
        self(message);
    }
}

/// Reactor thread settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name given to the spawned thread.
    pub thread_name: String,
    /// Capacity of the `mio::Events` buffer.
    pub events_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            thread_name: "epollq-dispatch".into(),
            events_capacity: 64,
        }
    }
}

/// Error starting or running a [`Dispatcher`].
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Creating the poller, the waker, or registering the queue failed.
    #[error("poller error: {0}")]
    Poll(io::Error),
    /// The reactor thread could not be spawned.
    #[error("failed to spawn dispatcher thread: {0}")]
    Spawn(io::Error),
    /// Popping from the queue failed.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    /// The sink panicked on the reactor thread.
    #[error("dispatcher thread panicked")]
    Panicked,
}

/// Handle to a running reactor thread.
///
/// Dropping the handle signals shutdown but does not join. Use
/// [`Dispatcher::shutdown`] to wait for the thread and collect its count.
pub struct Dispatcher {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    handle: Option<JoinHandle<Result<u64, DispatchError>>>,
}

impl Dispatcher {
    /// Starts a reactor thread delivering `queue`'s elements to `sink`.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Queue`] if the queue is already closed or its
    ///   descriptor cannot be duplicated.
    /// - [`DispatchError::Poll`] if the poller cannot be set up.
    /// - [`DispatchError::Spawn`] if the thread cannot be started.
    pub fn spawn<T, C, S>(
        queue: Arc<EpollableBoundedQueue<T, C>>,
        sink: S,
        config: DispatcherConfig,
    ) -> Result<Self, DispatchError>
    where
        T: 'static,
        C: RawFifo<Item = T> + Send + 'static,
        S: MessageSink<T> + Send + 'static,
    {
        let handle = queue.notification_handle()?;
        let poll = Poll::new().map_err(DispatchError::Poll)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER).map_err(DispatchError::Poll)?);
        poll.registry()
            .register(
                &mut SourceFd(&handle.as_raw_fd()),
                QUEUE,
                Interest::READABLE,
            )
            .map_err(DispatchError::Poll)?;

        let stop = Arc::new(AtomicBool::new(false));
        let reactor = Reactor {
            poll,
            events: Events::with_capacity(config.events_capacity),
            handle,
            stop: Arc::clone(&stop),
        };

        debug!(thread = %config.thread_name, "spawning dispatcher thread");
        let join = thread::Builder::new()
            .name(config.thread_name)
            .spawn(move || {
                info!("dispatcher started");
                let result = reactor.run(&queue, &sink);
                log_exit(&result);
                result
            })
            .map_err(DispatchError::Spawn)?;

        Ok(Self {
            stop,
            waker,
            handle: Some(join),
        })
    }

    /// Stops the reactor thread and waits for it.
    ///
    /// Returns the number of elements delivered over the thread's lifetime.
    ///
    /// # Errors
    ///
    /// The error the reactor stopped with, or [`DispatchError::Panicked`].
    pub fn shutdown(mut self) -> Result<u64, DispatchError> {
        self.signal_stop();
        let handle = self.handle.take().ok_or(DispatchError::Panicked)?;
        handle.join().map_err(|_| DispatchError::Panicked)?
    }

    /// Returns `true` once the reactor thread has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            error!(error = %e, "failed to wake dispatcher");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.signal_stop();
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("stop", &self.stop.load(Ordering::Relaxed))
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
fn log_exit(result: &Result<u64, DispatchError>) {
    match result {
        Ok(delivered) => {
            info!(delivered, "dispatcher exiting");
        }
        Err(e) => {
            error!(error = %e, "dispatcher failed");
        }
    }
}

struct Reactor {
    poll: Poll,
    events: Events,
    /// Duplicate of the queue's read end; hangs up when the queue closes.
    handle: OwnedFd,
    stop: Arc<AtomicBool>,
}

impl Reactor {
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    fn run<T, C, S>(
        mut self,
        queue: &EpollableBoundedQueue<T, C>,
        sink: &S,
    ) -> Result<u64, DispatchError>
    where
        C: RawFifo<Item = T>,
        S: MessageSink<T>,
    {
        let mut delivered = 0u64;
        loop {
            // Edge-triggered registration: drain fully on every pass. Counted
            // per element so a close mid-drain keeps the tally exact.
            loop {
                match queue.pop_front() {
                    Ok(Some(message)) => {
                        sink.accept(message);
                        delivered += 1;
                    }
                    Ok(None) => break,
                    Err(QueueError::Closed) => {
                        debug!(delivered, "queue closed under dispatcher");
                        return Ok(delivered);
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if self.stop.load(Ordering::Acquire) {
                let raw = self.handle.as_raw_fd();
                if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&raw)) {
                    warn!(error = %e, "failed to deregister queue from dispatcher poll");
                }
                return Ok(delivered);
            }

            if let Err(e) = self.poll.poll(&mut self.events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(DispatchError::Poll(e));
            }
            for event in &self.events {
                if event.token() == QUEUE && event.is_read_closed() {
                    debug!("queue channel hung up");
                } else {
                    trace!(token = event.token().0, "dispatcher woke");
                }
            }
        }
    }
}
