//! Byte-Stream I/O
//!
//! Single blocking `read`/`write` calls on a connected socket. Neither
//! primitive loops: a read returns whatever one call produced, a write
//! may be short and the caller decides whether to continue.
//!
//! The `std::io::Read`/`Write` impls make the usual helpers
//! (`read_exact`, `write_all`, `io::copy`) available on top.

use std::io;
use std::os::fd::AsFd;

use crate::error::{Syscall, TransportError};
use crate::socket::Socket;
use crate::sys;

/// Result of one read
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// This many bytes were placed into the buffer.
    ///
    /// `Data(0)` happens when zero bytes were requested, or on a datagram
    /// socket when an empty datagram arrived.
    Data(usize),
    /// The peer closed its write half (stream sockets only)
    EndOfStream,
}

impl ReadOutcome {
    /// Bytes read, `None` at end of stream
    #[must_use]
    pub fn bytes(self) -> Option<usize> {
        match self {
            Self::Data(n) => Some(n),
            Self::EndOfStream => None,
        }
    }

    /// Whether the peer closed the connection
    #[must_use]
    pub fn is_end_of_stream(self) -> bool {
        matches!(self, Self::EndOfStream)
    }
}

pub(crate) fn check_range(
    capacity: usize,
    offset: usize,
    len: usize,
) -> Result<std::ops::Range<usize>, TransportError> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(offset..end),
        _ => Err(TransportError::OutOfBounds {
            offset,
            len,
            capacity,
        }),
    }
}

impl Socket {
    /// Read up to `max_len` bytes into `buf[offset..]` with one blocking call.
    ///
    /// A zero-byte read is [`ReadOutcome::EndOfStream`] on a stream socket.
    /// Datagram sockets have no end of stream: an empty datagram reads as
    /// `Data(0)`.
    ///
    /// # Errors
    ///
    /// - `OutOfBounds` if `offset + max_len` exceeds the buffer
    /// - `System { op: Read }` if the kernel read fails
    pub fn read_into(
        &self,
        buf: &mut [u8],
        offset: usize,
        max_len: usize,
    ) -> Result<ReadOutcome, TransportError> {
        let range = check_range(buf.len(), offset, max_len)?;
        if range.is_empty() {
            return Ok(ReadOutcome::Data(0));
        }

        let count = sys::read(self.as_fd(), &mut buf[range])
            .map_err(|e| TransportError::system(Syscall::Read, e))?;
        Ok(self.outcome(count))
    }

    /// Classify a completed read of `count` bytes
    pub(crate) fn outcome(&self, count: usize) -> ReadOutcome {
        if count == 0 && self.kind().is_connection_oriented() {
            tracing::trace!(fd = ?self, "end of stream");
            ReadOutcome::EndOfStream
        } else {
            ReadOutcome::Data(count)
        }
    }

    /// Write up to `len` bytes from `buf[offset..]` with one blocking call.
    ///
    /// Returns the number of bytes the kernel accepted, which may be less
    /// than `len`.
    ///
    /// # Errors
    ///
    /// - `OutOfBounds` if `offset + len` exceeds the buffer
    /// - `System { op: Write }` if the kernel write fails
    pub fn write_from(&self, buf: &[u8], offset: usize, len: usize) -> Result<usize, TransportError> {
        let range = check_range(buf.len(), offset, len)?;
        sys::write(self.as_fd(), &buf[range]).map_err(|e| TransportError::system(Syscall::Write, e))
    }
}

impl io::Read for &Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len();
        match self.read_into(buf, 0, len)? {
            ReadOutcome::Data(n) => Ok(n),
            ReadOutcome::EndOfStream => Ok(0),
        }
    }
}

impl io::Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }
}

impl io::Write for &Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.write_from(buf, 0, buf.len())?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
