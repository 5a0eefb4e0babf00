//! udsock Core - Blocking Unix-Domain Socket Transport
//!
//! Local interprocess messaging over `AF_UNIX` sockets: socket lifecycle,
//! byte-stream I/O, and a scatter-gather sender that delivers multi-part
//! records intact across short and interrupted `sendmsg` calls.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │   Producer                                Receiver           │
//! │                                                              │
//! │   Record / Segment[]                      RecordDecoder      │
//! │        │                                       ▲             │
//! │        ▼                                       │             │
//! │   sender::send_all  ── PendingVector ──►  read_into /        │
//! │   (drain loop, EINTR retry,               recv_with_fds      │
//! │    SCM_RIGHTS on first call)                   │             │
//! │        │                                       │             │
//! │        └──────────── Socket (OwnedFd) ─────────┘             │
//! │                           │                                  │
//! │                     sys (libc calls)                         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Socket`]: one open socket; closes on drop
//! - [`SocketAddress`]: a bound-checked `sockaddr_un`
//! - [`Record`]: an outgoing fixed-field record
//! - [`RecordDecoder`]: reassembles records from received bytes
//! - [`Segment`]: one typed piece of a generic message
//! - [`TransportError`]: every failure, with the failing syscall step
//!
//! # Quick Start
//!
//! ```ignore
//! use udsock_core::{MessageType, Record, RecordDecoder, Socket, SocketKind};
//!
//! // Producer
//! let socket = Socket::open("/run/user/1000/udsock/udsock.sock", SocketKind::Stream)?;
//! socket.send_record(&Record::new(MessageType::Log, b"disk full", b"<meta/>"))?;
//!
//! // Receiver
//! let mut decoder = RecordDecoder::new();
//! let mut buf = vec![0u8; 64 * 1024];
//! while let Some(n) = connection.read_into(&mut buf, 0, buf.len())?.bytes() {
//!     decoder.push(&buf[..n]);
//!     while let Some(record) = decoder.decode()? {
//!         // handle record
//!     }
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`address`]: socket path resolution
//! - [`socket`]: socket lifecycle
//! - [`stream`]: single-call reads and writes
//! - [`pending`]: the not-yet-sent remainder of a message
//! - [`segment`]: typed message segments
//! - [`sender`]: the drain loop and both framings
//! - [`framing`]: record layout and decoding
//! - [`ancillary`]: descriptor passing
//! - [`config`]: TOML, environment and CLI configuration
//! - [`error`]: error types

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod address;
pub mod ancillary;
pub mod config;
pub mod error;
pub mod framing;
pub mod pending;
pub mod segment;
pub mod sender;
pub mod socket;
pub mod stream;
mod sys;

pub use address::{SocketAddress, MAX_PATH_LEN};
pub use ancillary::{ControlBuffer, MAX_FDS_PER_MESSAGE};
pub use error::{Syscall, TransportError};
pub use framing::{
    ConnectionHeader, DecodedRecord, MessageType, Record, RecordDecoder, RecordLimits, BREAK,
    HEADER_LEN, MAX_FIELD_LIMIT, PROTOCOL_VERSION,
};
pub use pending::{PendingVector, MAX_IOVECS};
pub use segment::{to_wire_bytes, Segment};
pub use sender::{
    send_all, send_dynamic, send_record, send_record_streaming, send_record_with_fds,
    send_segments, send_segments_once, MessageSink,
};
pub use socket::{unlink, Socket, SocketKind};
pub use stream::ReadOutcome;
pub use sys::PeerCredentials;

// Config exports
pub use config::{
    default_config_path, default_socket_path, load_config, load_config_from_path, ConfigError,
    ConfigOverrides, ConfigSource, TransportConfig,
};
