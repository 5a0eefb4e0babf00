//! udsock Daemon - Record Receiver
//!
//! Listens on a Unix socket, decodes fixed-field records from every
//! producer that connects, and logs them.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults
//! udsockd
//!
//! # Custom socket path
//! udsockd --socket-path /tmp/udsock.sock
//!
//! # Datagram mode with a config file
//! udsockd --kind datagram --config /etc/udsock/udsock.toml
//!
//! # Verbose logging
//! RUST_LOG=debug udsockd
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod server;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::signal::{SigSet, Signal};
use tracing::{error, info};

use udsock_core::{
    default_config_path, load_config_from_path, ConfigOverrides, SocketKind, TransportConfig,
};

use server::{wake, DaemonServer, LoggingHandler};

/// udsock Daemon - receives records over a Unix socket
#[derive(Parser, Debug)]
#[command(name = "udsockd")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Unix socket path to listen on
    #[arg(short = 's', long, value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "UDSOCK_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Socket kind (stream or datagram)
    #[arg(short = 'k', long, value_name = "KIND")]
    kind: Option<SocketKind>,

    /// Listen backlog for stream sockets
    #[arg(short = 'b', long, value_name = "N")]
    backlog: Option<i32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "UDSOCK_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Initialize logging
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("udsockd={level},udsock_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    Ok(())
}

/// Merge file, environment and command line into one configuration
fn resolve_config(args: &Args) -> Result<TransportConfig> {
    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(config_path.as_deref())
        .context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(ref path) = args.socket_path {
        overrides = overrides.with_socket_path(path.clone());
    }
    if let Some(kind) = args.kind {
        overrides = overrides.with_kind(kind);
    }
    if let Some(backlog) = args.backlog {
        overrides = overrides.with_backlog(backlog);
    }
    overrides.apply(&mut config);

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Block SIGINT/SIGTERM in every thread and wait for them on a dedicated one.
///
/// Must run before any other thread is spawned so the mask is inherited.
fn spawn_signal_thread(shutdown: Arc<AtomicBool>, config: &TransportConfig) -> Result<()> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.thread_block().context("Failed to block shutdown signals")?;

    let socket_path = config.socket_path.clone();
    let kind = config.kind;
    thread::Builder::new()
        .name("udsock-signals".to_string())
        .spawn(move || match mask.wait() {
            Ok(signal) => {
                info!(signal = %signal, "Received signal, initiating shutdown");
                shutdown.store(true, Ordering::SeqCst);
                wake(&socket_path, kind);
            }
            Err(e) => error!(error = %e, "Waiting for signals failed"),
        })
        .context("Failed to spawn signal thread")?;

    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first
    init_logging(&args.log_level)?;

    info!("udsock daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let config = resolve_config(&args)?;
    info!(
        socket_path = ?config.socket_path,
        kind = %config.kind,
        source = %config.source(),
        "Configuration resolved"
    );
    if let Some(ref path) = config.config_file_path {
        info!(config_path = ?path, "Config file");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_signal_thread(Arc::clone(&shutdown), &config)?;

    let mut server = DaemonServer::new(config, Arc::new(LoggingHandler));
    let result = server.run(&shutdown);

    match result {
        Ok(()) => {
            info!("udsock daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
