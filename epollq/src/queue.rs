//! Bounded MPMC queue whose "has data" state is a pollable descriptor.
//!
//! # Overview
//!
//! [`EpollableBoundedQueue`] pairs a [`GuardedFifo`] with a
//! [`ReadinessChannel`]. Every accepted push posts exactly one token and
//! every delivered pop consumes exactly one, so the channel's read end is
//! readable precisely while elements are waiting. A reactor registers that
//! descriptor next to its sockets and drains the queue when it fires.
//!
//! ```text
//!   producer ──push_back──> [ GuardedFifo ] ──signal──> pipe ──> reactor wakes
//!                                                                   │
//!   sink <──accept── pop_front <── take_claimed <── wait_and_consume ┘
//! ```
//!
//! # Example
//!
//! ```
//! use epollq::{EpollableBoundedQueue, Push};
//!
//! let queue = EpollableBoundedQueue::<u32>::new(2)?;
//! assert_eq!(queue.push_back(1)?, Push::Accepted);
//! assert_eq!(queue.push_back(2)?, Push::Accepted);
//! assert_eq!(queue.push_back(3)?, Push::Full(3));
//!
//! assert_eq!(queue.pop_front()?, Some(1));
//! assert_eq!(queue.pop_front()?, Some(2));
//! assert_eq!(queue.pop_front()?, None);
//! # Ok::<(), epollq::QueueError>(())
//! ```
//!
//! # Readiness
//!
//! The pipe is level-triggered in the kernel: it stays readable while tokens
//! remain. [`mio`] registers descriptors edge-triggered, so a reactor built on
//! it must drain with [`pop_front`](EpollableBoundedQueue::pop_front) until it
//! returns `Ok(None)` on every wakeup ([`drain_into`] does exactly that).
//!
//! [`drain_into`]: EpollableBoundedQueue::drain_into

use std::io;
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use mio::event::Source;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};

use crate::channel::ReadinessChannel;
use crate::dispatch::MessageSink;
use crate::error::{QueueError, Result};
use crate::fifo::{GuardedFifo, RawFifo, RingFifo};
use crate::trace::{debug, error, info, trace};

pub use crate::fifo::guarded::Push;

/// Construction parameters for [`EpollableBoundedQueue`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of queued elements. Must be at least 1 and fit in the
    /// readiness channel's buffer.
    pub capacity: usize,
    /// Enlarge the pipe buffer when `capacity` exceeds the default (Linux).
    pub grow_channel: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            grow_channel: true,
        }
    }
}

/// Thread-safe bounded FIFO observable through a readiness descriptor.
///
/// `C` selects the backing store; the default is a [`RingFifo`].
///
/// # Thread Safety
///
/// Any number of producers and consumers may share the queue through an
/// `Arc`. Each element is delivered to exactly one `pop_front` caller.
pub struct EpollableBoundedQueue<T, C = RingFifo<T>> {
    fifo: GuardedFifo<C>,
    channel: ReadinessChannel,
    _item: PhantomData<fn() -> T>,
}

impl<T, C: RawFifo<Item = T>> EpollableBoundedQueue<T, C> {
    /// Creates a queue holding at most `capacity` elements.
    ///
    /// # Errors
    ///
    /// [`QueueError::Resource`] if the pipe cannot be allocated, or
    /// [`QueueError::InvalidCapacity`] if `capacity` is zero or exceeds the
    /// channel buffer even after trying to grow it.
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_config(QueueConfig {
            capacity,
            ..QueueConfig::default()
        })
    }

    /// Creates a queue from an explicit configuration.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn with_config(config: QueueConfig) -> Result<Self> {
        let channel = ReadinessChannel::open_for(config.capacity, config.grow_channel)?;
        info!(
            capacity = config.capacity,
            buffer_tokens = channel.buffer_tokens(),
            "queue created"
        );
        Ok(Self {
            fifo: GuardedFifo::new(config.capacity),
            channel,
            _item: PhantomData,
        })
    }

    /// Appends `item` and posts one readiness token.
    ///
    /// Returns [`Push::Full`] with the element when the queue is at
    /// capacity; no token is posted and nothing changes.
    ///
    /// A push that enqueues before a concurrent [`close`](Self::close)
    /// reports [`Push::Accepted`] even when the close beats its token: the
    /// element is in the queue and frozen with the rest of its contents.
    ///
    /// # Errors
    ///
    /// - [`QueueError::Closed`] if the queue was closed before the element
    ///   could be enqueued. The element is dropped.
    /// - [`QueueError::Io`] if posting the token fails. The element stays
    ///   enqueued and the queue is closed, since the element and token counts
    ///   no longer match.
    pub fn push_back(&self, item: T) -> Result<Push<T>> {
        if let full @ Push::Full(_) = self.fifo.push_back(item)? {
            trace!("push rejected: queue full");
            return Ok(full);
        }
        match self.channel.signal() {
            Ok(()) => Ok(Push::Accepted),
            Err(QueueError::Closed) => {
                debug!("queue closed between enqueue and signal");
                Ok(Push::Accepted)
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    /// Removes the head element.
    ///
    /// Returns `Ok(None)` at once, without touching the channel, when no
    /// element is available. Otherwise the element is claimed, its token is
    /// consumed (briefly waiting if the producer's token is still in
    /// flight), and the head is dequeued.
    ///
    /// # Errors
    ///
    /// - [`QueueError::Closed`] after [`close`](Self::close), including when
    ///   the close happens while this call waits for its token.
    /// - [`QueueError::Io`] if consuming the token fails; the queue is
    ///   closed in that case.
    pub fn pop_front(&self) -> Result<Option<T>> {
        if !self.fifo.claim()? {
            return Ok(None);
        }
        if let Err(err) = self.channel.wait_and_consume() {
            self.fifo.release_claim();
            self.fail(&err);
            return Err(err);
        }
        self.fifo.take_claimed()
    }

    /// Copies the head element without removing it or consuming a token.
    ///
    /// # Errors
    ///
    /// [`QueueError::Closed`] after [`close`](Self::close).
    pub fn front(&self) -> Result<Option<T>>
    where
        T: Clone,
    {
        self.fifo.front()
    }

    /// Pops until empty, handing every element to `sink`.
    ///
    /// Returns the number of delivered elements.
    ///
    /// # Errors
    ///
    /// Propagates the first [`pop_front`](Self::pop_front) error; elements
    /// delivered before it are not rolled back.
    pub fn drain_into<S: MessageSink<T> + ?Sized>(&self, sink: &S) -> Result<usize> {
        let mut delivered = 0;
        while let Some(item) = self.pop_front()? {
            sink.accept(item);
            delivered += 1;
        }
        if delivered > 0 {
            trace!(delivered, "queue drained");
        }
        Ok(delivered)
    }

    /// Current number of queued elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fifo.len()
    }

    /// Maximum number of queued elements.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.fifo.capacity()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fifo.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.fifo.is_full()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.fifo.is_closed()
    }

    /// Read descriptor to register for readability with a multiplexer, or
    /// `None` once closed.
    ///
    /// The descriptor must never be read directly; only
    /// [`pop_front`](Self::pop_front) may consume tokens.
    #[must_use]
    pub fn notification_descriptor(&self) -> Option<RawFd> {
        self.channel.read_fd()
    }

    /// Owned duplicate of the read descriptor, for reactors that must
    /// notice the queue closing.
    ///
    /// Unlike [`notification_descriptor`](Self::notification_descriptor) it
    /// stays valid after [`close`](Self::close), and reports hang-up
    /// (`is_read_closed` in mio) once the queue is closed. It must never be
    /// read directly.
    ///
    /// # Errors
    ///
    /// [`QueueError::Closed`] after close, [`QueueError::Resource`] if the
    /// descriptor cannot be duplicated.
    pub fn notification_handle(&self) -> Result<OwnedFd> {
        self.channel.duplicate_read_fd()
    }

    /// Number of unread tokens in the channel. Diagnostic only.
    ///
    /// # Errors
    ///
    /// [`QueueError::Closed`] after close, [`QueueError::Io`] if the query
    /// fails.
    pub fn pending_tokens(&self) -> Result<usize> {
        self.channel.pending_tokens()
    }

    /// Closes the queue. Idempotent.
    ///
    /// Remaining elements are not drained. Subsequent pushes and pops fail
    /// with [`QueueError::Closed`], and poppers blocked on their token wake
    /// with the same error. Returns once the channel descriptors have been
    /// released.
    ///
    /// Deregister the queue from any poller before closing it. A reactor
    /// that must observe the close registers a
    /// [`notification_handle`](Self::notification_handle) instead.
    pub fn close(&self) {
        if self.fifo.close() {
            info!(abandoned = self.fifo.len(), "queue closed");
        }
        self.channel.close();
    }

    fn fail(&self, err: &QueueError) {
        if err.is_closed() {
            debug!("channel closed under an in-flight operation");
            return;
        }
        error!(error = %err, "readiness channel failed; closing queue");
        self.close();
    }
}

impl<T, C> std::fmt::Debug for EpollableBoundedQueue<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpollableBoundedQueue")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

// The channel's read end is registered by shared reference, so a queue
// behind an `Arc` can sit in a `Poll` while other threads push into it.
impl<T, C> Source for &EpollableBoundedQueue<T, C> {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.channel
            .with_read_fd(|fd| SourceFd(&fd.as_raw_fd()).register(registry, token, interests))?
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.channel
            .with_read_fd(|fd| SourceFd(&fd.as_raw_fd()).reregister(registry, token, interests))?
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.channel
            .with_read_fd(|fd| SourceFd(&fd.as_raw_fd()).deregister(registry))?
    }
}

impl<T, C> Source for EpollableBoundedQueue<T, C> {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        let mut this: &Self = self;
        this.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        let mut this: &Self = self;
        this.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        let mut this: &Self = self;
        this.deregister(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fifo::ListFifo;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex, mpsc};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn capacity_two_scenario() {
        let queue = EpollableBoundedQueue::<char>::new(2).unwrap();

        assert_eq!(queue.push_back('A').unwrap(), Push::Accepted);
        assert_eq!(queue.push_back('B').unwrap(), Push::Accepted);
        assert_eq!(queue.push_back('C').unwrap(), Push::Full('C'));
        assert_eq!(queue.pop_front().unwrap(), Some('A'));
        assert_eq!(queue.push_back('C').unwrap(), Push::Accepted);
        assert_eq!(queue.pop_front().unwrap(), Some('B'));
        assert_eq!(queue.pop_front().unwrap(), Some('C'));
        assert_eq!(queue.pop_front().unwrap(), None);
    }

    #[test]
    fn tokens_track_occupancy() {
        let queue = EpollableBoundedQueue::<u32>::new(3).unwrap();
        for i in 0..3 {
            assert!(queue.push_back(i).unwrap().is_accepted());
            assert_eq!(queue.pending_tokens().unwrap(), queue.len());
        }

        // Rejected push leaves tokens and order alone.
        assert_eq!(queue.push_back(99).unwrap(), Push::Full(99));
        assert_eq!(queue.pending_tokens().unwrap(), 3);
        assert_eq!(queue.front().unwrap(), Some(0));

        while queue.pop_front().unwrap().is_some() {
            assert_eq!(queue.pending_tokens().unwrap(), queue.len());
        }
        assert_eq!(queue.pending_tokens().unwrap(), 0);
    }

    #[test]
    fn front_consumes_nothing() {
        let queue = EpollableBoundedQueue::<String>::new(2).unwrap();
        assert_eq!(queue.front().unwrap(), None);
        assert!(queue.push_back("x".into()).unwrap().is_accepted());

        assert_eq!(queue.front().unwrap().as_deref(), Some("x"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pending_tokens().unwrap(), 1);
    }

    #[test]
    fn empty_pop_returns_immediately() {
        let queue = Arc::new(EpollableBoundedQueue::<u32>::new(4).unwrap());
        let popper = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop_front())
        };
        assert_eq!(popper.join().unwrap().unwrap(), None);
    }

    #[test]
    fn list_backed_queue_keeps_fifo_order() {
        let queue = EpollableBoundedQueue::<u32, ListFifo<u32>>::new(16).unwrap();
        for i in 0..16 {
            assert!(queue.push_back(i).unwrap().is_accepted());
        }
        assert!(queue.is_full());
        let popped: Vec<_> = std::iter::from_fn(|| queue.pop_front().unwrap()).collect();
        assert_eq!(popped, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn invalid_capacity_rejected() {
        let err = EpollableBoundedQueue::<u32>::new(0).unwrap_err();
        assert!(err.is_resource());

        let err = EpollableBoundedQueue::<u32>::with_config(QueueConfig {
            capacity: usize::MAX / 2,
            grow_channel: true,
        })
        .unwrap_err();
        assert!(matches!(err, QueueError::InvalidCapacity { .. }));
    }

    #[test]
    fn closed_queue_rejects_everything() {
        let queue = EpollableBoundedQueue::<u32>::new(4).unwrap();
        assert!(queue.push_back(1).unwrap().is_accepted());
        queue.close();
        queue.close();

        assert!(queue.is_closed());
        assert!(queue.notification_descriptor().is_none());
        assert!(matches!(queue.push_back(2), Err(QueueError::Closed)));
        assert!(matches!(queue.pop_front(), Err(QueueError::Closed)));
        assert!(matches!(queue.front(), Err(QueueError::Closed)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn drain_into_delivers_in_order() {
        let queue = EpollableBoundedQueue::<u32>::new(8).unwrap();
        for i in 0..5 {
            assert!(queue.push_back(i).unwrap().is_accepted());
        }

        let received = Mutex::new(Vec::new());
        let delivered = queue
            .drain_into(&|item: u32| received.lock().unwrap().push(item))
            .unwrap();

        assert_eq!(delivered, 5);
        assert_eq!(received.into_inner().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.drain_into(&|_: u32| {}).unwrap(), 0);
    }

    #[test]
    fn spsc_preserves_push_order() {
        let queue = Arc::new(EpollableBoundedQueue::<u64>::new(32).unwrap());
        let n = 5_000;

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..n {
                    let mut item = i;
                    loop {
                        match queue.push_back(item).unwrap() {
                            Push::Accepted => break,
                            Push::Full(back) => item = back,
                        }
                        thread::yield_now();
                    }
                }
            })
        };

        let mut expected = 0;
        while expected < n {
            match queue.pop_front().unwrap() {
                Some(item) => {
                    assert_eq!(item, expected);
                    expected += 1;
                }
                None => thread::yield_now(),
            }
        }
        producer.join().unwrap();
        assert_eq!(queue.pending_tokens().unwrap(), 0);
    }

    #[test]
    fn concurrent_consumers_receive_each_item_once() {
        let queue = Arc::new(EpollableBoundedQueue::<usize>::new(64).unwrap());
        let producers = 4;
        let per_producer = 500;
        let total = producers * per_producer;
        let received = Arc::new(Mutex::new(Vec::with_capacity(total)));

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let received = Arc::clone(&received);
                thread::spawn(move || {
                    loop {
                        if received.lock().unwrap().len() == total {
                            return;
                        }
                        match queue.pop_front().unwrap() {
                            Some(item) => received.lock().unwrap().push(item),
                            None => thread::yield_now(),
                        }
                    }
                })
            })
            .collect();

        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..per_producer {
                        let mut item = p * 10_000 + i;
                        loop {
                            assert!(queue.len() <= queue.capacity());
                            match queue.push_back(item).unwrap() {
                                Push::Accepted => break,
                                Push::Full(back) => item = back,
                            }
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        for c in consumers {
            c.join().unwrap();
        }

        let received = received.lock().unwrap();
        let unique: HashSet<_> = received.iter().copied().collect();
        assert_eq!(received.len(), total);
        assert_eq!(unique.len(), total);
        assert_eq!(queue.pending_tokens().unwrap(), 0);
    }

    #[test]
    fn producer_never_blocks_at_buffer_limit() {
        let limit = ReadinessChannel::open().unwrap().buffer_tokens();
        let queue = Arc::new(
            EpollableBoundedQueue::<usize>::with_config(QueueConfig {
                capacity: limit,
                grow_channel: false,
            })
            .unwrap(),
        );
        for i in 0..limit {
            assert!(queue.push_back(i).unwrap().is_accepted());
        }

        // Hold occupancy at capacity while the pipe's head page drains.
        let rounds = 2 * rustix::param::page_size();
        let (done_tx, done_rx) = mpsc::channel();
        let worker = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..rounds {
                    assert_eq!(queue.pop_front().unwrap(), Some(i));
                    assert!(queue.push_back(limit + i).unwrap().is_accepted());
                }
                done_tx.send(()).unwrap();
            })
        };
        done_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("push blocked with occupancy at capacity");
        worker.join().unwrap();
        assert_eq!(queue.pending_tokens().unwrap(), limit);
    }

    #[test]
    fn push_racing_close_reports_truthfully() {
        for _ in 0..20 {
            let queue = Arc::new(EpollableBoundedQueue::<u32>::new(4096).unwrap());
            let producers: Vec<_> = (0..4)
                .map(|_| {
                    let queue = Arc::clone(&queue);
                    thread::spawn(move || {
                        let mut accepted = 0;
                        loop {
                            match queue.push_back(accepted) {
                                Ok(Push::Accepted) => accepted += 1,
                                Ok(Push::Full(_)) => thread::yield_now(),
                                Err(QueueError::Closed) => return accepted,
                                Err(e) => panic!("unexpected push failure: {e}"),
                            }
                        }
                    })
                })
                .collect();

            thread::sleep(Duration::from_millis(2));
            queue.close();

            let accepted: u32 = producers.into_iter().map(|p| p.join().unwrap()).sum();
            // Every accepted element is in the frozen queue; no refused one is.
            assert_eq!(queue.len(), accepted as usize);
        }
    }

    #[test]
    fn channel_failure_closes_queue() {
        let queue = EpollableBoundedQueue::<u32>::new(4).unwrap();
        queue.channel.drop_read_end();

        let err = queue.push_back(1).unwrap_err();
        assert!(matches!(err, QueueError::Io { op: "write", .. }));
        assert!(queue.is_closed());
        assert_eq!(queue.len(), 1);
        assert!(matches!(queue.push_back(2), Err(QueueError::Closed)));
        assert!(matches!(queue.pop_front(), Err(QueueError::Closed)));
    }

    #[test]
    fn notification_handle_outlives_close() {
        let queue = EpollableBoundedQueue::<u32>::new(4).unwrap();
        let handle = queue.notification_handle().unwrap();
        queue.close();

        assert!(queue.notification_descriptor().is_none());
        assert!(matches!(queue.notification_handle(), Err(QueueError::Closed)));
        // Write end gone: reading the duplicate hits end-of-file.
        let mut byte = [0u8; 1];
        assert_eq!(rustix::io::read(&handle, &mut byte[..]).unwrap(), 0);
    }

    #[test]
    fn close_wakes_popper_waiting_for_token() {
        let queue = Arc::new(EpollableBoundedQueue::<u32>::new(4).unwrap());

        // Claim an element whose token was never posted, so the pop blocks.
        assert!(queue.fifo.push_back(7).unwrap().is_accepted());
        let popper = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop_front())
        };

        thread::sleep(Duration::from_millis(50));
        queue.close();
        assert!(matches!(popper.join().unwrap(), Err(QueueError::Closed)));
    }
}
