//! Receiver Server Implementation
//!
//! This module provides the core server loop for the udsock daemon:
//! - Accepts connections on a Unix socket
//! - Spawns one handler thread per connection
//! - Tracks active connections in a `DashMap`
//! - Decodes records and hands them to a [`RecordHandler`]
//! - Supports graceful shutdown
//!
//! ```text
//!                     DaemonServer
//!                          │
//!          ┌───────────────┼───────────────┐
//!          │               │               │
//!      producer        producer        producer
//!      (conn-1)        (conn-2)        (conn-3)
//!          │               │               │
//!    RecordDecoder   RecordDecoder   RecordDecoder
//!          └───────────────┴───────────────┘
//!                          │
//!                    RecordHandler
//! ```
//!
//! In datagram mode there is no accept loop: every datagram on the bound
//! socket carries exactly one record.

use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::fd::OwnedFd;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use udsock_core::{
    unlink, DecodedRecord, MessageType, PeerCredentials, ReadOutcome, RecordDecoder,
    RecordLimits, Socket, SocketKind, TransportConfig, TransportError,
};

/// Byte sent to wake a blocked datagram receive
const WAKE_DATAGRAM: &[u8] = b"\0";

/// Identifier of one accepted connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A decoded record together with its origin
#[derive(Debug)]
pub struct ReceivedRecord {
    /// Connection the record arrived on
    pub conn_id: ConnectionId,
    /// The record itself
    pub record: DecodedRecord,
    /// Descriptor passed with a journal-fd record
    pub journal: Option<OwnedFd>,
}

/// Consumer of decoded records
///
/// Called from connection handler threads, possibly concurrently.
pub trait RecordHandler: Send + Sync {
    /// Take one record
    fn handle(&self, received: ReceivedRecord);
}

/// Logs every record; journal descriptors are read to their announced length
#[derive(Debug, Default)]
pub struct LoggingHandler;

impl RecordHandler for LoggingHandler {
    fn handle(&self, received: ReceivedRecord) {
        let header = received.record.header;
        info!(
            conn_id = %received.conn_id,
            message_type = %header.message_type,
            data_len = header.data_len,
            meta_len = header.meta_len,
            "Record received"
        );

        if let Some(fd) = received.journal {
            match read_journal(fd, header.data_len) {
                Ok(read) if read == header.data_len => {
                    debug!(conn_id = %received.conn_id, bytes = read, "Journal descriptor read");
                }
                Ok(read) => warn!(
                    conn_id = %received.conn_id,
                    expected = header.data_len,
                    read,
                    "Journal descriptor shorter than announced"
                ),
                Err(e) => warn!(conn_id = %received.conn_id, error = %e, "Failed to read journal"),
            }
        }
    }
}

/// Read up to `data_len` bytes from a passed journal descriptor, returning the count
fn read_journal(fd: OwnedFd, data_len: u64) -> io::Result<u64> {
    let mut journal = File::from(fd).take(data_len);
    io::copy(&mut journal, &mut io::sink())
}

/// Connection state tracking
struct ConnectionState {
    /// When the connection was established
    connected_at: Instant,
    /// Remote peer credentials (from SO_PEERCRED)
    peer: Option<PeerCredentials>,
    /// Shared with the handler so shutdown can unblock its read
    socket: Arc<Socket>,
    /// Records decoded so far
    records: u64,
}

/// Configuration for the daemon server
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Descriptors accepted per receive
    pub max_fds_per_read: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_fds_per_read: 16,
        }
    }
}

/// The main daemon server
pub struct DaemonServer {
    /// Transport settings (socket path, kind, limits)
    config: TransportConfig,
    /// Server configuration
    server_config: ServerConfig,
    /// Active connection state
    connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
    /// Connection handler threads
    handlers: Vec<JoinHandle<()>>,
    next_id: AtomicU64,
    handler: Arc<dyn RecordHandler>,
}

impl DaemonServer {
    /// Create a new daemon server
    pub fn new(config: TransportConfig, handler: Arc<dyn RecordHandler>) -> Self {
        Self {
            config,
            server_config: ServerConfig::default(),
            connection_states: Arc::new(DashMap::new()),
            handlers: Vec::new(),
            next_id: AtomicU64::new(1),
            handler,
        }
    }

    fn allocate_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Prepare the socket path (create directory, remove stale socket)
    fn prepare_socket(&self) -> Result<()> {
        let socket_path = &self.config.socket_path;
        if let Some(parent) = socket_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create socket directory: {parent:?}"))?;
                info!(path = ?parent, "Created socket directory");
            }
        }

        if socket_path.exists() {
            warn!(path = ?socket_path, "Removing stale socket file");
            unlink(socket_path)
                .with_context(|| format!("Failed to remove stale socket: {socket_path:?}"))?;
        }

        Ok(())
    }

    /// Set socket permissions (owner-only)
    fn restrict_permissions(&self) -> Result<()> {
        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(&self.config.socket_path, perms)
            .with_context(|| format!("Failed to set permissions on {:?}", self.config.socket_path))
    }

    /// Run until `shutdown` is set and the server is woken with [`wake`]
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        self.prepare_socket()?;

        let result = match self.config.kind {
            SocketKind::Stream => self.run_stream(shutdown),
            SocketKind::Datagram => self.run_datagram(shutdown),
        };

        let cleanup = self.shutdown();
        result.and(cleanup)
    }

    fn run_stream(&mut self, shutdown: &AtomicBool) -> Result<()> {
        let listener = Socket::listen(&self.config.socket_path, SocketKind::Stream, self.config.backlog)
            .with_context(|| format!("Failed to listen on {:?}", self.config.socket_path))?;
        self.restrict_permissions()?;

        info!(
            path = ?self.config.socket_path,
            backlog = self.config.backlog,
            "Listening for connections"
        );

        loop {
            if shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested, stopping accept loop");
                break;
            }

            let socket = match listener.accept() {
                Ok(socket) => socket,
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
            };

            if shutdown.load(Ordering::SeqCst) {
                debug!("Woken for shutdown");
                break;
            }

            self.reap_handlers();

            if self.connection_count() >= self.server_config.max_connections {
                warn!("Connection limit reached, rejecting new connection");
                continue;
            }

            let peer = match socket.peer_credentials() {
                Ok(peer) => Some(peer),
                Err(e) => {
                    debug!(error = %e, "Peer credentials unavailable");
                    None
                }
            };
            if let Some(peer) = peer {
                if !peer_allowed(peer.uid) {
                    warn!(
                        peer_uid = peer.uid,
                        peer_pid = peer.pid,
                        "Rejecting connection from different user"
                    );
                    continue;
                }
            }

            self.spawn_handler(socket, peer)?;
        }

        Ok(())
    }

    fn spawn_handler(&mut self, socket: Socket, peer: Option<PeerCredentials>) -> Result<()> {
        let conn_id = self.allocate_id();
        let socket = Arc::new(socket);

        info!(
            conn_id = %conn_id,
            peer_uid = ?peer.map(|p| p.uid),
            peer_pid = ?peer.map(|p| p.pid),
            active_connections = self.connection_count() + 1,
            "New connection accepted"
        );

        self.connection_states.insert(
            conn_id,
            ConnectionState {
                connected_at: Instant::now(),
                peer,
                socket: Arc::clone(&socket),
                records: 0,
            },
        );

        let context = HandlerContext {
            conn_id,
            limits: self.config.limits(),
            read_buffer_size: self.config.read_buffer_size,
            max_fds: self.server_config.max_fds_per_read,
            connection_states: Arc::clone(&self.connection_states),
            handler: Arc::clone(&self.handler),
        };

        let spawned = thread::Builder::new()
            .name(format!("udsock-{conn_id}"))
            .spawn(move || context.handle_connection(&socket));

        match spawned {
            Ok(handle) => {
                self.handlers.push(handle);
                Ok(())
            }
            Err(e) => {
                self.connection_states.remove(&conn_id);
                Err(e).context("Failed to spawn connection handler")
            }
        }
    }

    /// Join handler threads that already finished
    fn reap_handlers(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) =
            self.handlers.drain(..).partition(JoinHandle::is_finished);
        self.handlers = running;
        for handle in finished {
            if handle.join().is_err() {
                warn!("Connection handler panicked");
            }
        }
    }

    fn run_datagram(&mut self, shutdown: &AtomicBool) -> Result<()> {
        let socket = Socket::listen(&self.config.socket_path, SocketKind::Datagram, 0)
            .with_context(|| format!("Failed to bind {:?}", self.config.socket_path))?;
        self.restrict_permissions()?;

        info!(path = ?self.config.socket_path, "Receiving datagrams");

        let context = HandlerContext {
            conn_id: self.allocate_id(),
            limits: self.config.limits(),
            read_buffer_size: self.config.read_buffer_size,
            max_fds: self.server_config.max_fds_per_read,
            connection_states: Arc::clone(&self.connection_states),
            handler: Arc::clone(&self.handler),
        };
        let mut buf = vec![0u8; context.read_buffer_size];

        loop {
            let received = socket.recv_with_fds(&mut buf, context.max_fds);

            if shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested, stopping receive loop");
                break;
            }

            match received {
                Ok((ReadOutcome::Data(0) | ReadOutcome::EndOfStream, _)) => {
                    debug!("Empty datagram ignored");
                }
                Ok((ReadOutcome::Data(n), fds)) => context.handle_datagram(&buf[..n], fds),
                Err(e) => error!(error = %e, "Receive failed"),
            }
        }

        Ok(())
    }

    /// Graceful shutdown
    fn shutdown(&mut self) -> Result<()> {
        info!("Initiating graceful shutdown");

        let open: Vec<(ConnectionId, Arc<Socket>)> = self
            .connection_states
            .iter()
            .map(|entry| {
                let state = entry.value();
                info!(
                    conn_id = %entry.key(),
                    peer_uid = ?state.peer.map(|p| p.uid),
                    records = state.records,
                    uptime_secs = state.connected_at.elapsed().as_secs(),
                    "Closing connection"
                );
                (*entry.key(), Arc::clone(&state.socket))
            })
            .collect();

        for (conn_id, socket) in open {
            if let Err(e) = socket.close_read() {
                debug!(conn_id = %conn_id, error = %e, "Failed to shut down read half");
            }
        }

        for handle in self.handlers.drain(..) {
            if handle.join().is_err() {
                warn!("Connection handler panicked");
            }
        }

        if self.config.socket_path.exists() {
            unlink(&self.config.socket_path).with_context(|| {
                format!("Failed to remove socket: {:?}", self.config.socket_path)
            })?;
            info!(path = ?self.config.socket_path, "Socket file removed");
        }

        info!("Shutdown complete");
        Ok(())
    }

    /// Get number of active connections
    pub fn connection_count(&self) -> usize {
        self.connection_states.len()
    }
}

/// Everything a handler thread needs
struct HandlerContext {
    conn_id: ConnectionId,
    limits: RecordLimits,
    read_buffer_size: usize,
    max_fds: usize,
    connection_states: Arc<DashMap<ConnectionId, ConnectionState>>,
    handler: Arc<dyn RecordHandler>,
}

impl HandlerContext {
    /// Handle a single client connection until it closes
    fn handle_connection(self, socket: &Socket) {
        let _span = tracing::info_span!("connection", conn_id = %self.conn_id).entered();
        info!("Connection handler started");

        let mut decoder = RecordDecoder::with_limits(self.limits);
        let mut fds = VecDeque::new();
        let mut buf = vec![0u8; self.read_buffer_size];

        loop {
            match socket.recv_with_fds(&mut buf, self.max_fds) {
                Ok((ReadOutcome::EndOfStream, _)) => {
                    info!("Client disconnected (EOF)");
                    break;
                }
                Ok((ReadOutcome::Data(n), received)) => {
                    fds.extend(received);
                    decoder.push(&buf[..n]);
                    if let Err(e) = self.drain_records(&mut decoder, &mut fds) {
                        warn!(error = %e, "Failed to decode record, closing connection");
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Read error");
                    break;
                }
            }
        }

        if decoder.available() > 0 {
            warn!(bytes = decoder.available(), "Connection closed mid-record");
        }
        if !fds.is_empty() {
            warn!(count = fds.len(), "Closing descriptors no record claimed");
        }

        self.connection_states.remove(&self.conn_id);
        info!(
            active_connections = self.connection_states.len(),
            "Connection handler finished"
        );
    }

    /// One datagram, one record
    fn handle_datagram(&self, datagram: &[u8], fds: Vec<OwnedFd>) {
        let mut decoder = RecordDecoder::with_limits(self.limits);
        let mut fds = VecDeque::from(fds);
        decoder.push(datagram);

        match self.drain_records(&mut decoder, &mut fds) {
            Ok(()) if decoder.available() > 0 => {
                warn!(bytes = decoder.available(), "Discarding incomplete record in datagram");
            }
            Ok(()) => {}
            Err(e) => warn!(error = %e, "Discarding malformed datagram"),
        }
    }

    /// Hand every complete record to the handler
    fn drain_records(
        &self,
        decoder: &mut RecordDecoder,
        fds: &mut VecDeque<OwnedFd>,
    ) -> Result<(), TransportError> {
        while let Some(record) = decoder.decode()? {
            let journal = if record.header.message_type == MessageType::JournalFd {
                let fd = fds.pop_front();
                if fd.is_none() {
                    warn!("Journal-fd record arrived without a descriptor");
                }
                fd
            } else {
                None
            };

            if let Some(mut state) = self.connection_states.get_mut(&self.conn_id) {
                state.records += 1;
            }

            self.handler.handle(ReceivedRecord {
                conn_id: self.conn_id,
                record,
                journal,
            });
        }
        Ok(())
    }
}

/// Same user as the daemon, or root
fn peer_allowed(uid: u32) -> bool {
    uid == nix::unistd::getuid().as_raw() || uid == 0
}

/// Unblock a server waiting in `accept` or `recv` so it notices shutdown
pub fn wake(path: &Path, kind: SocketKind) {
    match Socket::open(path, kind) {
        Ok(socket) => {
            if kind == SocketKind::Datagram {
                if let Err(e) = socket.write_from(WAKE_DATAGRAM, 0, WAKE_DATAGRAM.len()) {
                    debug!(error = %e, "Failed to send wake datagram");
                }
            }
        }
        Err(e) => debug!(error = %e, "Wake connection failed, server already gone"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};
    use std::os::fd::AsFd;
    use std::path::PathBuf;
    use std::sync::mpsc;
    use std::sync::Mutex;
    use std::time::Duration;

    use tempfile::{NamedTempFile, TempDir};
    use udsock_core::Record;

    /// Forwards records to a channel
    struct ChannelHandler(Mutex<mpsc::Sender<ReceivedRecord>>);

    impl RecordHandler for ChannelHandler {
        fn handle(&self, received: ReceivedRecord) {
            let _ = self.0.lock().unwrap().send(received);
        }
    }

    struct Running {
        path: PathBuf,
        kind: SocketKind,
        shutdown: Arc<AtomicBool>,
        thread: JoinHandle<Result<()>>,
        records: mpsc::Receiver<ReceivedRecord>,
        _dir: TempDir,
    }

    impl Running {
        fn start(kind: SocketKind) -> Self {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("run").join("udsockd.sock");
            let mut config = TransportConfig::default();
            config.socket_path = path.clone();
            config.kind = kind;

            let (tx, rx) = mpsc::channel();
            let mut server = DaemonServer::new(config, Arc::new(ChannelHandler(Mutex::new(tx))));
            let shutdown = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&shutdown);
            let thread = thread::spawn(move || server.run(&flag));

            Self {
                path,
                kind,
                shutdown,
                thread,
                records: rx,
                _dir: dir,
            }
        }

        fn connect(&self) -> Socket {
            for _ in 0..200 {
                if let Ok(socket) = Socket::open(&self.path, self.kind) {
                    return socket;
                }
                thread::sleep(Duration::from_millis(10));
            }
            panic!("server never came up");
        }

        fn next_record(&self) -> ReceivedRecord {
            self.records.recv_timeout(Duration::from_secs(5)).unwrap()
        }

        fn stop(self) -> PathBuf {
            self.shutdown.store(true, Ordering::SeqCst);
            wake(&self.path, self.kind);
            self.thread.join().unwrap().unwrap();
            self.path
        }
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId(7).to_string(), "conn-7");
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.max_fds_per_read, 16);
    }

    #[test]
    fn test_peer_allowed() {
        assert!(peer_allowed(nix::unistd::getuid().as_raw()));
        assert!(peer_allowed(0));
    }

    #[test]
    fn test_stream_records_reach_handler() {
        let running = Running::start(SocketKind::Stream);

        let client = running.connect();
        client
            .send_record(&Record::new(MessageType::Log, b"first", b"m1"))
            .unwrap();
        client
            .send_record(&Record::new(MessageType::Audit, b"second", b"m2"))
            .unwrap();

        let first = running.next_record();
        let second = running.next_record();
        assert_eq!(first.record.payload, b"first");
        assert_eq!(second.record.header.message_type, MessageType::Audit);
        assert_eq!(second.record.metadata, b"m2");
        assert_eq!(first.conn_id, second.conn_id);
        assert!(first.journal.is_none());

        // Shutdown must unblock the handler still reading from `client`.
        let path = running.stop();
        assert!(!path.exists());
        drop(client);
    }

    #[test]
    fn test_journal_fd_descriptor_handed_over() {
        let running = Running::start(SocketKind::Stream);

        let mut journal = NamedTempFile::new().unwrap();
        journal.write_all(b"journal").unwrap();

        let client = running.connect();
        client
            .send_record_with_fds(&Record::journal_fd(7, b"meta"), &[journal.as_file().as_fd()])
            .unwrap();
        drop(client);

        let received = running.next_record();
        assert_eq!(received.record.header.data_len, 7);
        let mut file = File::from(received.journal.unwrap());
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "journal");

        running.stop();
    }

    #[test]
    fn test_malformed_stream_closes_connection() {
        let running = Running::start(SocketKind::Stream);

        let client = running.connect();
        let mut header = udsock_core::ConnectionHeader::new(MessageType::Log, 0, 0).to_bytes();
        header[2..4].copy_from_slice(&99u16.to_ne_bytes());
        client.send_all(&[&header]).unwrap();

        // The server drops the connection without delivering anything.
        let mut buf = [0u8; 1];
        assert_eq!(client.read_into(&mut buf, 0, 1).unwrap(), ReadOutcome::EndOfStream);
        assert!(running.records.try_recv().is_err());

        running.stop();
    }

    #[test]
    fn test_datagram_mode() {
        let running = Running::start(SocketKind::Datagram);

        let client = running.connect();
        client
            .send_record(&Record::new(MessageType::Journal, b"dgram payload", b""))
            .unwrap();

        let received = running.next_record();
        assert_eq!(received.record.payload, b"dgram payload");

        let path = running.stop();
        assert!(!path.exists());
    }
}
