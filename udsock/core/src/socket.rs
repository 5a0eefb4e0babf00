//! Socket Lifecycle
//!
//! Creation, binding, listening, accepting, connecting, half-closing and
//! closing of Unix-domain sockets.
//!
//! # Ownership
//!
//! A [`Socket`] owns exactly one descriptor. Dropping it closes the
//! descriptor; [`Socket::close`] does the same but reports the error.
//! There is no process-wide registry of sockets and no "invalid" socket
//! value: a `Socket` that exists is open.
//!
//! # States
//!
//! ```text
//! stream server:  Created -> Bound -> Listening -> (accept) -> Connected
//! datagram:       Created -> Bound
//! client:         Created -> Connected
//! ```
//!
//! Binding creates the socket file. Closing does not remove it; the binding
//! side calls [`unlink`] once it is done.

use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::address::SocketAddress;
use crate::error::{Syscall, TransportError};
use crate::sys::{self, PeerCredentials};

/// Socket type
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketKind {
    /// `SOCK_DGRAM`: message oriented, no listen/accept
    Datagram,
    /// `SOCK_STREAM`: connection oriented byte stream
    #[default]
    Stream,
}

impl SocketKind {
    fn as_raw(self) -> libc::c_int {
        match self {
            Self::Datagram => libc::SOCK_DGRAM,
            Self::Stream => libc::SOCK_STREAM,
        }
    }

    /// Whether `listen`/`accept` apply to this kind
    #[must_use]
    pub fn is_connection_oriented(self) -> bool {
        matches!(self, Self::Stream)
    }
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Datagram => write!(f, "datagram"),
            Self::Stream => write!(f, "stream"),
        }
    }
}

impl std::str::FromStr for SocketKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "datagram" | "dgram" => Ok(Self::Datagram),
            "stream" => Ok(Self::Stream),
            other => Err(format!("unknown socket kind '{other}'")),
        }
    }
}

/// An open Unix-domain socket
pub struct Socket {
    fd: OwnedFd,
    kind: SocketKind,
}

impl Socket {
    fn create(kind: SocketKind) -> Result<Self, TransportError> {
        let fd = sys::socket(kind.as_raw()).map_err(|e| TransportError::system(Syscall::Create, e))?;
        Ok(Self { fd, kind })
    }

    fn bind(&self, addr: &SocketAddress) -> Result<(), TransportError> {
        sys::bind(self.fd.as_fd(), addr).map_err(|e| TransportError::system(Syscall::Bind, e))?;
        debug!(path = ?addr.path(), kind = %self.kind, "socket bound");
        Ok(())
    }

    fn listen_backlog(&self, backlog: i32) -> Result<(), TransportError> {
        sys::listen(self.fd.as_fd(), backlog)
            .map_err(|e| TransportError::system(Syscall::Listen, e))
    }

    /// Create a socket, bind it to `path` and, for stream sockets, accept
    /// exactly one connection.
    ///
    /// Streams listen with a backlog of 0 and block in `accept`; the
    /// listening socket is closed once the connection is accepted and the
    /// accepted socket is returned. Datagram sockets are returned bound.
    ///
    /// # Errors
    ///
    /// `System` naming the failing step (create, bind, listen or accept),
    /// or an address resolution error.
    pub fn create_and_accept(path: impl AsRef<Path>, kind: SocketKind) -> Result<Self, TransportError> {
        let listener = Self::listen(path, kind, 0)?;
        match kind {
            SocketKind::Datagram => Ok(listener),
            SocketKind::Stream => listener.accept(),
        }
    }

    /// Create a socket and bind it to `path`; stream sockets also start
    /// listening with `backlog`.
    ///
    /// No connection is accepted. For datagram sockets the backlog is
    /// ignored and the bound socket is returned.
    ///
    /// # Errors
    ///
    /// `System` naming the failing step (create, bind or listen), or an
    /// address resolution error.
    pub fn listen(
        path: impl AsRef<Path>,
        kind: SocketKind,
        backlog: i32,
    ) -> Result<Self, TransportError> {
        let addr = SocketAddress::resolve(path)?;
        let socket = Self::create(kind)?;
        socket.bind(&addr)?;
        if kind.is_connection_oriented() {
            socket.listen_backlog(backlog)?;
            debug!(path = ?addr.path(), backlog, "socket listening");
        }
        Ok(socket)
    }

    /// Block until a connection arrives on this listening socket.
    ///
    /// # Errors
    ///
    /// - `Unsupported` for datagram sockets
    /// - `System { op: Accept }` if the kernel rejects the call
    pub fn accept(&self) -> Result<Self, TransportError> {
        if !self.kind.is_connection_oriented() {
            return Err(TransportError::Unsupported("accept on a datagram socket"));
        }
        let fd = sys::accept(self.fd.as_fd()).map_err(|e| TransportError::system(Syscall::Accept, e))?;
        debug!(listener = self.as_raw_fd(), fd = fd.as_raw_fd(), "connection accepted");
        Ok(Self {
            fd,
            kind: self.kind,
        })
    }

    /// Connect to the socket bound at `path`.
    ///
    /// If the connection fails the freshly created descriptor is closed
    /// before the error is returned.
    ///
    /// # Errors
    ///
    /// `System { op: Connect }` if nothing is listening, or the step that
    /// failed before it.
    pub fn open(path: impl AsRef<Path>, kind: SocketKind) -> Result<Self, TransportError> {
        let addr = SocketAddress::resolve(path)?;
        let socket = Self::create(kind)?;
        if let Err(source) = sys::connect(socket.fd.as_fd(), &addr) {
            if let Err(close_err) = sys::close(socket.fd) {
                warn!(error = %close_err, "failed to close socket after connect error");
            }
            return Err(TransportError::system(Syscall::Connect, source));
        }
        debug!(path = ?addr.path(), kind = %kind, "socket connected");
        Ok(socket)
    }

    /// A connected pair of anonymous sockets
    ///
    /// # Errors
    ///
    /// `System { op: SocketPair }` if the kernel refuses.
    pub fn pair(kind: SocketKind) -> Result<(Self, Self), TransportError> {
        let (a, b) =
            sys::socketpair(kind.as_raw()).map_err(|e| TransportError::system(Syscall::SocketPair, e))?;
        Ok((Self { fd: a, kind }, Self { fd: b, kind }))
    }

    /// Close the socket, reporting any error from `close(2)`.
    ///
    /// # Errors
    ///
    /// `System { op: Close }`; the descriptor is released either way.
    pub fn close(self) -> Result<(), TransportError> {
        sys::close(self.fd).map_err(|e| TransportError::system(Syscall::Close, e))
    }

    /// Shut down the read half; writes stay usable
    ///
    /// # Errors
    ///
    /// `System { op: Shutdown }`
    pub fn close_read(&self) -> Result<(), TransportError> {
        sys::shutdown(self.fd.as_fd(), libc::SHUT_RD)
            .map_err(|e| TransportError::system(Syscall::Shutdown, e))
    }

    /// Shut down the write half; the peer sees end-of-stream, reads stay usable
    ///
    /// # Errors
    ///
    /// `System { op: Shutdown }`
    pub fn close_write(&self) -> Result<(), TransportError> {
        sys::shutdown(self.fd.as_fd(), libc::SHUT_WR)
            .map_err(|e| TransportError::system(Syscall::Shutdown, e))
    }

    /// Socket type
    #[must_use]
    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    /// Set `SO_SNDBUF`. The kernel may round the value.
    ///
    /// # Errors
    ///
    /// `System { op: SockOpt }`
    pub fn set_send_buffer_size(&self, bytes: usize) -> Result<(), TransportError> {
        sys::set_send_buffer_size(self.fd.as_fd(), bytes)
            .map_err(|e| TransportError::system(Syscall::SockOpt, e))
    }

    /// Credentials of the connected peer (Linux `SO_PEERCRED`)
    ///
    /// # Errors
    ///
    /// `System { op: SockOpt }`, including on platforms without `SO_PEERCRED`.
    pub fn peer_credentials(&self) -> Result<PeerCredentials, TransportError> {
        sys::peer_credentials(self.fd.as_fd()).map_err(|e| TransportError::system(Syscall::SockOpt, e))
    }
}

/// Remove the socket file at `path`.
///
/// # Errors
///
/// `System { op: Unlink }`, for example when the file does not exist.
pub fn unlink(path: impl AsRef<Path>) -> Result<(), TransportError> {
    let path = path.as_ref();
    std::fs::remove_file(path).map_err(|e| TransportError::system(Syscall::Unlink, e))?;
    debug!(path = ?path, "socket file removed");
    Ok(())
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("fd", &self.fd.as_raw_fd())
            .field("kind", &self.kind)
            .finish()
    }
}

impl AsFd for Socket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl IntoRawFd for Socket {
    fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

impl From<Socket> for OwnedFd {
    fn from(socket: Socket) -> Self {
        socket.fd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_socket_kind_parse() {
        assert_eq!("stream".parse::<SocketKind>().unwrap(), SocketKind::Stream);
        assert_eq!("DGRAM".parse::<SocketKind>().unwrap(), SocketKind::Datagram);
        assert!("seqpacket".parse::<SocketKind>().is_err());
    }

    #[test]
    fn test_listen_creates_socket_file() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("listen.sock");

        let listener = Socket::listen(&socket_path, SocketKind::Stream, 4).unwrap();
        assert!(socket_path.exists());

        listener.close().unwrap();
        // Closing leaves the file behind
        assert!(socket_path.exists());

        unlink(&socket_path).unwrap();
        assert!(!socket_path.exists());
    }

    #[test]
    fn test_bind_twice_reports_bind_step() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("twice.sock");

        let _first = Socket::listen(&socket_path, SocketKind::Stream, 1).unwrap();
        let second = Socket::listen(&socket_path, SocketKind::Stream, 1);
        assert_eq!(second.unwrap_err().syscall(), Some(Syscall::Bind));
    }

    #[test]
    fn test_accept_on_datagram_unsupported() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("dgram.sock");

        let bound = Socket::listen(&socket_path, SocketKind::Datagram, 10).unwrap();
        assert!(matches!(
            bound.accept(),
            Err(TransportError::Unsupported(_))
        ));
    }

    #[test]
    fn test_datagram_create_and_accept_returns_bound() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("bound.sock");

        let bound = Socket::create_and_accept(&socket_path, SocketKind::Datagram).unwrap();
        assert_eq!(bound.kind(), SocketKind::Datagram);
        assert!(socket_path.exists());
    }

    #[test]
    fn test_open_without_listener_fails_on_connect() {
        let temp_dir = TempDir::new().unwrap();
        let socket_path = temp_dir.path().join("nobody.sock");

        let err = Socket::open(&socket_path, SocketKind::Stream).unwrap_err();
        assert_eq!(err.syscall(), Some(Syscall::Connect));
    }

    #[test]
    fn test_unlink_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let err = unlink(temp_dir.path().join("missing.sock")).unwrap_err();
        assert_eq!(err.syscall(), Some(Syscall::Unlink));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_peer_credentials_same_process() {
        let (a, _b) = Socket::pair(SocketKind::Stream).unwrap();
        let cred = a.peer_credentials().unwrap();
        assert_eq!(cred.pid as u32, std::process::id());
    }
}
