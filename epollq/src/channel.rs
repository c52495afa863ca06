//! Pipe-backed readiness channel.
//!
//! A [`ReadinessChannel`] never carries payload. Each one-byte write is a
//! *token* announcing that one element is waiting in the queue, and each
//! one-byte read consumes exactly one announcement. The read end is what a
//! reactor registers: it is readable for as long as tokens are pending.
//!
//! # Shutdown
//!
//! ```text
//!   close()                         blocked wait_and_consume()
//!   ───────                         ──────────────────────────
//!   take write lock on writer  ──┐
//!   drop write end               └─> read() returns 0 (EOF) -> Closed
//!   take write lock on reader  <──── reader guard released
//!   drop read end
//! ```
//!
//! Dropping the write end first is what wakes blocked readers: once no write
//! end exists, a blocked `read()` returns end-of-file. The read end is only
//! released after every reader has left `read()`, so its descriptor number is
//! never recycled underneath a thread still using it.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rustix::io::{self, Errno};

use crate::error::{QueueError, Result};
use crate::trace::{debug, error, trace, warn};

const TOKEN: [u8; 1] = [b'X'];

/// Counting semaphore over a pipe, observable by an external multiplexer.
#[derive(Debug)]
pub struct ReadinessChannel {
    reader: RwLock<Option<OwnedFd>>,
    writer: RwLock<Option<OwnedFd>>,
    buffer_tokens: usize,
}

impl ReadinessChannel {
    /// Allocates the descriptor pair with the platform's default buffer.
    ///
    /// # Errors
    ///
    /// [`QueueError::Resource`] if the OS denies the pipe (e.g. `EMFILE`).
    pub fn open() -> Result<Self> {
        let (reader, writer) = open_pipe()?;
        let buffer_tokens = buffer_limit(writer.as_fd(), 0, false)?;
        Ok(Self::from_parts(reader, writer, buffer_tokens))
    }

    /// Allocates a channel that can hold `tokens` pending tokens without a
    /// writer ever blocking.
    ///
    /// With `grow` set, the pipe buffer is enlarged when the default is too
    /// small (Linux only; bounded by `/proc/sys/fs/pipe-max-size`).
    ///
    /// # Errors
    ///
    /// - [`QueueError::Resource`] if the pipe cannot be allocated or queried.
    /// - [`QueueError::InvalidCapacity`] if `tokens` is zero or larger than
    ///   the buffer that could be obtained.
    pub fn open_for(tokens: usize, grow: bool) -> Result<Self> {
        let (reader, writer) = open_pipe()?;
        let limit = buffer_limit(writer.as_fd(), tokens, grow)?;
        if tokens == 0 || tokens > limit {
            warn!(tokens, limit, "rejecting channel capacity");
            return Err(QueueError::InvalidCapacity {
                capacity: tokens,
                limit,
            });
        }
        Ok(Self::from_parts(reader, writer, limit))
    }

    fn from_parts(reader: OwnedFd, writer: OwnedFd, buffer_tokens: usize) -> Self {
        debug!(
            read_fd = reader.as_raw_fd(),
            write_fd = writer.as_raw_fd(),
            buffer_tokens,
            "readiness channel opened"
        );
        Self {
            reader: RwLock::new(Some(reader)),
            writer: RwLock::new(Some(writer)),
            buffer_tokens,
        }
    }

    /// Number of tokens the channel holds before a writer would block.
    #[must_use]
    pub const fn buffer_tokens(&self) -> usize {
        self.buffer_tokens
    }

    /// Posts one token.
    ///
    /// # Errors
    ///
    /// [`QueueError::Closed`] after [`close`](Self::close), otherwise
    /// [`QueueError::Io`] for any failure other than `EINTR`.
    pub fn signal(&self) -> Result<()> {
        let guard = read_lock(&self.writer);
        let fd = guard.as_ref().ok_or(QueueError::Closed)?;
        loop {
            match io::write(fd, &TOKEN) {
                Ok(_) => {
                    trace!("token posted");
                    return Ok(());
                }
                Err(Errno::INTR) => {}
                Err(source) => {
                    error!(error = %source, "readiness channel write failed");
                    return Err(QueueError::Io {
                        op: "write",
                        source,
                    });
                }
            }
        }
    }

    /// Blocks until one token is available and consumes it.
    ///
    /// # Errors
    ///
    /// [`QueueError::Closed`] if the channel is closed before or while
    /// waiting, otherwise [`QueueError::Io`] for any failure other than
    /// `EINTR`.
    pub fn wait_and_consume(&self) -> Result<()> {
        let guard = read_lock(&self.reader);
        let fd = guard.as_ref().ok_or(QueueError::Closed)?;
        let mut token = [0u8; 1];
        loop {
            match io::read(fd, &mut token[..]) {
                Ok(0) => {
                    debug!("write end gone while waiting for a token");
                    return Err(QueueError::Closed);
                }
                Ok(_) => {
                    trace!("token consumed");
                    return Ok(());
                }
                Err(Errno::INTR) => {}
                Err(source) => {
                    error!(error = %source, "readiness channel read failed");
                    return Err(QueueError::Io { op: "read", source });
                }
            }
        }
    }

    /// Number of unread tokens currently buffered in the pipe.
    ///
    /// # Errors
    ///
    /// [`QueueError::Closed`] after close, [`QueueError::Io`] if `FIONREAD`
    /// fails.
    pub fn pending_tokens(&self) -> Result<usize> {
        let guard = read_lock(&self.reader);
        let fd = guard.as_ref().ok_or(QueueError::Closed)?;
        let pending = io::ioctl_fionread(fd).map_err(|source| QueueError::Io {
            op: "FIONREAD",
            source,
        })?;
        Ok(usize::try_from(pending).unwrap_or(usize::MAX))
    }

    /// Raw read descriptor for registration with a multiplexer, or `None`
    /// once closed. Callers must never read from it.
    #[must_use]
    pub fn read_fd(&self) -> Option<RawFd> {
        read_lock(&self.reader).as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Duplicates the read descriptor (close-on-exec).
    ///
    /// The duplicate outlives [`close`](Self::close): once the write end is
    /// gone it reports hang-up, which lets a multiplexer observe the close.
    /// Callers must never read from it.
    ///
    /// # Errors
    ///
    /// [`QueueError::Closed`] after close, [`QueueError::Resource`] if the
    /// descriptor cannot be duplicated.
    pub fn duplicate_read_fd(&self) -> Result<OwnedFd> {
        let guard = read_lock(&self.reader);
        let fd = guard.as_ref().ok_or(QueueError::Closed)?;
        io::fcntl_dupfd_cloexec(fd, 0).map_err(|source| QueueError::Resource {
            op: "F_DUPFD_CLOEXEC",
            source,
        })
    }

    /// Drops only the read end, leaving writers with a pipe nobody reads.
    #[cfg(test)]
    pub(crate) fn drop_read_end(&self) {
        write_lock(&self.reader).take();
    }

    /// Runs `f` with the read descriptor borrowed for the duration of the
    /// call. Used for registration with a poller.
    pub(crate) fn with_read_fd<R>(&self, f: impl FnOnce(BorrowedFd<'_>) -> R) -> Result<R> {
        let guard = read_lock(&self.reader);
        let fd = guard.as_ref().ok_or(QueueError::Closed)?;
        Ok(f(fd.as_fd()))
    }

    /// Returns `true` once [`close`](Self::close) has released the write end.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        read_lock(&self.writer).is_none()
    }

    /// Releases both descriptors. Idempotent.
    ///
    /// Wakes every thread blocked in [`wait_and_consume`](Self::wait_and_consume)
    /// with [`QueueError::Closed`] and returns once they have all left the
    /// read, so no descriptor is closed while in use.
    pub fn close(&self) {
        let writer = write_lock(&self.writer).take();
        let Some(writer) = writer else {
            return;
        };
        drop(writer);

        let reader = write_lock(&self.reader).take();
        drop(reader);
        debug!("readiness channel closed");
    }
}

impl Drop for ReadinessChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn open_pipe() -> Result<(OwnedFd, OwnedFd)> {
    use rustix::pipe::{PipeFlags, pipe_with};

    pipe_with(PipeFlags::CLOEXEC).map_err(|source| {
        error!(error = %source, "pipe allocation failed");
        QueueError::Resource { op: "pipe", source }
    })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn open_pipe() -> Result<(OwnedFd, OwnedFd)> {
    use rustix::io::{FdFlags, fcntl_setfd};

    let (reader, writer) = rustix::pipe::pipe().map_err(|source| {
        error!(error = %source, "pipe allocation failed");
        QueueError::Resource { op: "pipe", source }
    })?;
    for fd in [&reader, &writer] {
        fcntl_setfd(fd, FdFlags::CLOEXEC).map_err(|source| QueueError::Resource {
            op: "F_SETFD",
            source,
        })?;
    }
    Ok((reader, writer))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
fn buffer_limit(fd: BorrowedFd<'_>, tokens: usize, grow: bool) -> Result<usize> {
    use rustix::param::page_size;
    use rustix::pipe::{fcntl_getpipe_size, fcntl_setpipe_size};

    let page = page_size();
    let query = |fd| {
        fcntl_getpipe_size(fd)
            .map(|bytes| guaranteed_tokens(bytes, page))
            .map_err(|source| QueueError::Resource {
                op: "F_GETPIPE_SZ",
                source,
            })
    };

    let current = query(fd)?;
    if tokens <= current || !grow {
        return Ok(current);
    }
    let wanted = tokens.div_ceil(page).saturating_add(1).saturating_mul(page);
    match fcntl_setpipe_size(fd, wanted) {
        Ok(_) => query(fd),
        Err(source) => {
            // EPERM above pipe-max-size for unprivileged users.
            warn!(tokens, current, error = %source, "could not grow pipe buffer");
            Ok(current)
        }
    }
}

/// Tokens a pipe buffer of `bytes` holds with no write ever blocking.
///
/// The kernel stores pipe data in page-sized slots and only appends to the
/// tail slot. Once the head slot is partly read and every slot is in use, a
/// one-byte write needs a fresh slot even though fewer than `bytes` bytes
/// are buffered, so one slot is never counted.
#[cfg(any(target_os = "linux", target_os = "android"))]
const fn guaranteed_tokens(bytes: usize, page: usize) -> usize {
    (bytes / page).saturating_sub(1) * page
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn buffer_limit(_fd: BorrowedFd<'_>, _tokens: usize, _grow: bool) -> Result<usize> {
    Ok(rustix::pipe::PIPE_BUF)
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
