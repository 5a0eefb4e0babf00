//! Transport Errors
//!
//! A single error type covers every failure the transport can surface.
//! Syscall failures carry the step that failed so diagnostics can tell a
//! failed `bind` from a failed `accept` on the same path.
//!
//! Interruption (`EINTR`) has no variant: it is retried inside the
//! transport and never reaches a caller.

use std::fmt;
use std::io;

use thiserror::Error;

/// The syscall step that failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Syscall {
    /// `socket(2)`
    Create,
    /// `bind(2)`
    Bind,
    /// `listen(2)`
    Listen,
    /// `accept(2)`
    Accept,
    /// `connect(2)`
    Connect,
    /// `read(2)`
    Read,
    /// `write(2)`
    Write,
    /// `close(2)`
    Close,
    /// `shutdown(2)`
    Shutdown,
    /// `unlink(2)`
    Unlink,
    /// `sendmsg(2)`
    Send,
    /// `recvmsg(2)`
    Recv,
    /// `socketpair(2)`
    SocketPair,
    /// `setsockopt(2)` / `getsockopt(2)`
    SockOpt,
}

impl Syscall {
    /// Lowercase name of the step, as used in log fields
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Bind => "bind",
            Self::Listen => "listen",
            Self::Accept => "accept",
            Self::Connect => "connect",
            Self::Read => "read",
            Self::Write => "write",
            Self::Close => "close",
            Self::Shutdown => "shutdown",
            Self::Unlink => "unlink",
            Self::Send => "send",
            Self::Recv => "recv",
            Self::SocketPair => "socketpair",
            Self::SockOpt => "sockopt",
        }
    }
}

impl fmt::Display for Syscall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by the transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket path does not fit into `sun_path`
    #[error("socket path is {len} bytes, limit is {max}")]
    PathTooLong {
        /// Length of the rejected path in bytes
        len: usize,
        /// Longest accepted path in bytes
        max: usize,
    },

    /// Socket path is empty or contains a NUL byte
    #[error("invalid socket path: {0}")]
    InvalidPath(String),

    /// A specific syscall failed
    #[error("{op} failed: {source}")]
    System {
        /// The failing step
        op: Syscall,
        /// The OS error
        #[source]
        source: io::Error,
    },

    /// A send failed after the kernel had already accepted part of the message.
    ///
    /// The byte ordering of the connection can no longer be trusted; the
    /// socket must be closed.
    #[error("send failed after {sent} of {total} bytes: {source}")]
    PartialSend {
        /// Bytes accepted before the failure
        sent: usize,
        /// Bytes the message should have carried
        total: usize,
        /// The OS error of the failing call
        #[source]
        source: io::Error,
    },

    /// A marshalled value is not one of the five segment kinds
    #[error("unsupported segment type at index {index}")]
    UnsupportedSegmentType {
        /// Position of the value in the input list
        index: usize,
    },

    /// Operation does not apply to this kind of socket
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Offset and length do not describe a range of the buffer
    #[error("range {offset}+{len} out of bounds for buffer of {capacity} bytes")]
    OutOfBounds {
        /// Requested start offset
        offset: usize,
        /// Requested length
        len: usize,
        /// Buffer length
        capacity: usize,
    },

    /// Record header carries a message type this transport does not know
    #[error("unknown message type {0}")]
    UnknownMessageType(u16),

    /// Record field is larger than the configured limit
    #[error("{field} of {len} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Which field overflowed
        field: &'static str,
        /// Declared length
        len: u64,
        /// Configured limit
        max: u64,
    },

    /// Record bytes do not follow the fixed-field layout
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

impl TransportError {
    /// Build a `System` error from the last OS error
    pub(crate) fn last_os(op: Syscall) -> Self {
        Self::System {
            op,
            source: io::Error::last_os_error(),
        }
    }

    /// Wrap an I/O error as a failure of `op`
    pub(crate) fn system(op: Syscall, source: io::Error) -> Self {
        Self::System { op, source }
    }

    /// The failing syscall step, if this is a syscall failure
    #[must_use]
    pub fn syscall(&self) -> Option<Syscall> {
        match self {
            Self::System { op, .. } => Some(*op),
            Self::PartialSend { .. } => Some(Syscall::Send),
            _ => None,
        }
    }

    /// Whether the connection's byte stream is left in an unknown state
    #[must_use]
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(self, Self::PartialSend { .. })
    }
}

impl From<TransportError> for io::Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::System { source, .. } | TransportError::PartialSend { source, .. } => {
                source
            }
            TransportError::PathTooLong { .. }
            | TransportError::InvalidPath(_)
            | TransportError::OutOfBounds { .. }
            | TransportError::UnsupportedSegmentType { .. } => {
                io::Error::new(io::ErrorKind::InvalidInput, err)
            }
            TransportError::Unsupported(_) => io::Error::new(io::ErrorKind::Unsupported, err),
            TransportError::UnknownMessageType(_)
            | TransportError::FrameTooLarge { .. }
            | TransportError::MalformedFrame(_) => io::Error::new(io::ErrorKind::InvalidData, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_error_names_step() {
        let err = TransportError::system(
            Syscall::Connect,
            io::Error::from_raw_os_error(libc::ECONNREFUSED),
        );
        assert_eq!(err.syscall(), Some(Syscall::Connect));
        assert!(err.to_string().starts_with("connect failed"));
    }

    #[test]
    fn test_partial_send_is_fatal() {
        let err = TransportError::PartialSend {
            sent: 4,
            total: 20,
            source: io::Error::from_raw_os_error(libc::EPIPE),
        };
        assert!(err.is_fatal_for_connection());
        assert_eq!(err.syscall(), Some(Syscall::Send));
    }

    #[test]
    fn test_into_io_error_keeps_os_code() {
        let err = TransportError::system(Syscall::Read, io::Error::from_raw_os_error(libc::EBADF));
        let io_err: io::Error = err.into();
        assert_eq!(io_err.raw_os_error(), Some(libc::EBADF));
    }
}
