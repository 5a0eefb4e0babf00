//! udsock-send - Record Producer
//!
//! Sends one record to a running `udsockd`.
//!
//! ```bash
//! # Log record from stdin
//! echo "hello" | udsock-send log
//!
//! # Audit record with metadata read from a file
//! udsock-send audit --payload event.xml --metadata meta.xml
//!
//! # Large journal streamed in chunks instead of read into memory
//! udsock-send journal --payload journal.bin --stream
//!
//! # Hand the journal file itself to the daemon
//! udsock-send journal-fd --payload journal.bin
//! ```

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{debug, info};

use udsock_core::{
    default_config_path, load_config_from_path, send_record_streaming, ConfigOverrides,
    MessageType, Record, Socket, SocketKind,
};

/// Send one record to the udsock daemon
#[derive(Parser, Debug)]
#[command(name = "udsock-send")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Record type (log, audit, journal, journal-fd)
    message_type: MessageType,

    /// Payload file (stdin when omitted; required for journal-fd)
    #[arg(short = 'p', long, value_name = "FILE")]
    payload: Option<PathBuf>,

    /// Metadata file
    #[arg(short = 'm', long, value_name = "FILE")]
    metadata: Option<PathBuf>,

    /// Daemon socket path
    #[arg(short = 's', long, value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "UDSOCK_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Socket kind (stream or datagram)
    #[arg(short = 'k', long, value_name = "KIND")]
    kind: Option<SocketKind>,

    /// Requested SO_SNDBUF size in bytes
    #[arg(long, value_name = "BYTES")]
    send_buffer: Option<usize>,

    /// Stream the payload file in chunks
    #[arg(long, requires = "payload")]
    stream: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "UDSOCK_LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("udsock_send={level},udsock_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(true)
        .init();
}

fn read_source(path: Option<&Path>) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    match path {
        Some(path) => {
            File::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?
                .read_to_end(&mut buf)
                .with_context(|| format!("Failed to read {}", path.display()))?;
        }
        None => {
            io::stdin()
                .lock()
                .read_to_end(&mut buf)
                .context("Failed to read stdin")?;
        }
    }
    Ok(buf)
}

fn open_payload(path: &Path) -> Result<(File, u64)> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let len = file
        .metadata()
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .len();
    Ok((file, len))
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config =
        load_config_from_path(config_path.as_deref()).context("Failed to load configuration")?;
    let mut overrides = ConfigOverrides::new();
    if let Some(ref path) = args.socket_path {
        overrides = overrides.with_socket_path(path.clone());
    }
    if let Some(kind) = args.kind {
        overrides = overrides.with_kind(kind);
    }
    overrides.apply(&mut config);

    let metadata = match args.metadata {
        Some(ref path) => read_source(Some(path))?,
        None => Vec::new(),
    };

    let mut socket = Socket::open(&config.socket_path, config.kind)
        .with_context(|| format!("Failed to connect to {}", config.socket_path.display()))?;
    if let Some(bytes) = args.send_buffer {
        socket
            .set_send_buffer_size(bytes)
            .context("Failed to set send buffer size")?;
    }
    debug!(socket_path = ?config.socket_path, kind = %config.kind, "Connected");

    let sent = if args.message_type == MessageType::JournalFd {
        let Some(ref path) = args.payload else {
            bail!("journal-fd records need --payload naming the journal file");
        };
        let (file, len) = open_payload(path)?;
        let record = Record::journal_fd(len, &metadata);
        socket.send_record_with_fds(&record, &[file.as_fd()])?
    } else if args.stream {
        let Some(ref path) = args.payload else {
            bail!("--stream needs --payload");
        };
        let (file, len) = open_payload(path)?;
        send_record_streaming(&mut socket, args.message_type, len, file, &metadata)?
    } else {
        let payload = read_source(args.payload.as_deref())?;
        socket.send_record(&Record::new(args.message_type, &payload, &metadata))?
    };

    info!(
        message_type = %args.message_type,
        bytes = sent,
        "Record sent"
    );
    socket.close()?;
    Ok(())
}
