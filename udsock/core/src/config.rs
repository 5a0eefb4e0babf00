//! TOML Configuration File Support
//!
//! Transport settings shared by the receiver daemon and the producer CLI,
//! read from `$XDG_CONFIG_HOME/udsock/udsock.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (applied by the binaries through [`ConfigOverrides`])
//! 2. Environment variables (`UDSOCK_SOCKET`, `UDSOCK_KIND`, `UDSOCK_BACKLOG`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [transport]
//! socket_path = "/run/user/1000/udsock/udsock.sock"
//! kind = "stream"
//! backlog = 16
//! read_buffer_size = 65536
//! max_payload_len = 10485760
//! max_metadata_len = 10485760
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::MAX_PATH_LEN;
use crate::framing::{RecordLimits, DEFAULT_MAX_FIELD_LEN, MAX_FIELD_LIMIT};
use crate::socket::SocketKind;
use crate::sys;

/// Environment variable overriding the socket path
pub const ENV_SOCKET: &str = "UDSOCK_SOCKET";
/// Environment variable overriding the socket kind
pub const ENV_KIND: &str = "UDSOCK_KIND";
/// Environment variable overriding the listen backlog
pub const ENV_BACKLOG: &str = "UDSOCK_BACKLOG";

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

/// `[transport]` table of the configuration file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportToml {
    /// Socket file path
    pub socket_path: Option<PathBuf>,
    /// `"stream"` or `"datagram"`
    pub kind: Option<SocketKind>,
    /// Pending-connection queue length for stream listeners
    pub backlog: Option<i32>,
    /// Bytes read per call on the receiving side
    pub read_buffer_size: Option<usize>,
    /// Largest accepted inline payload
    pub max_payload_len: Option<u64>,
    /// Largest accepted metadata block
    pub max_metadata_len: Option<u64>,
}

/// Root of the configuration file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UdsockToml {
    /// Transport settings
    pub transport: TransportToml,
}

/// Resolved transport settings
#[derive(Clone, Debug, PartialEq)]
pub struct TransportConfig {
    /// Socket file path
    pub socket_path: PathBuf,
    /// Socket kind
    pub kind: SocketKind,
    /// Listen backlog (stream only)
    pub backlog: i32,
    /// Bytes read per call on the receiving side
    pub read_buffer_size: usize,
    /// Largest accepted inline payload
    pub max_payload_len: u64,
    /// Largest accepted metadata block
    pub max_metadata_len: u64,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            kind: SocketKind::Stream,
            backlog: 16,
            read_buffer_size: 64 * 1024,
            max_payload_len: DEFAULT_MAX_FIELD_LEN,
            max_metadata_len: DEFAULT_MAX_FIELD_LEN,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl TransportConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the highest-priority source that set a value
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Decoder limits for this configuration
    #[must_use]
    pub fn limits(&self) -> RecordLimits {
        RecordLimits {
            max_payload_len: self.max_payload_len,
            max_metadata_len: self.max_metadata_len,
        }
    }

    /// Check values that would otherwise fail later at a syscall.
    ///
    /// # Errors
    ///
    /// `ValidationError` naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let path_len = self.socket_path.as_os_str().len();
        if path_len == 0 {
            return Err(ConfigError::ValidationError(
                "socket_path must not be empty".to_string(),
            ));
        }
        if path_len > MAX_PATH_LEN {
            return Err(ConfigError::ValidationError(format!(
                "socket_path is {path_len} bytes, limit is {MAX_PATH_LEN}"
            )));
        }
        if self.backlog < 0 {
            return Err(ConfigError::ValidationError(format!(
                "backlog must not be negative, got {}",
                self.backlog
            )));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "read_buffer_size must be greater than zero".to_string(),
            ));
        }
        for (name, value) in [
            ("max_payload_len", self.max_payload_len),
            ("max_metadata_len", self.max_metadata_len),
        ] {
            if value > MAX_FIELD_LIMIT {
                return Err(ConfigError::ValidationError(format!(
                    "{name} is {value}, limit is {MAX_FIELD_LIMIT}"
                )));
            }
        }
        Ok(())
    }
}

/// Get the default socket path
///
/// `$XDG_RUNTIME_DIR/udsock/udsock.sock`, or `/tmp/udsock-$UID/udsock.sock`
/// when no runtime directory is set.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    match dirs::runtime_dir() {
        Some(runtime_dir) => runtime_dir.join("udsock").join("udsock.sock"),
        None => PathBuf::from(format!("/tmp/udsock-{}/udsock.sock", sys::current_uid())),
    }
}

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/udsock/udsock.toml` or
/// `~/.config/udsock/udsock.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("udsock").join("udsock.toml"))
}

/// Load configuration from the default file, environment and defaults
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<TransportConfig, ConfigError> {
    load_config_from_path(default_config_path().as_deref())
}

/// Load configuration from a specific path
///
/// If `path` is `None`, only defaults and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<&Path>) -> Result<TransportConfig, ConfigError> {
    let mut config = TransportConfig::default();

    if let Some(config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.to_path_buf(),
                    source: e,
                })?;

            let toml_config: UdsockToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config.transport);
            config.config_file_path = Some(config_path.to_path_buf());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

fn apply_toml_config(config: &mut TransportConfig, toml: &TransportToml) {
    if let Some(ref path) = toml.socket_path {
        config.socket_path = path.clone();
    }
    if let Some(kind) = toml.kind {
        config.kind = kind;
    }
    if let Some(backlog) = toml.backlog {
        config.backlog = backlog;
    }
    if let Some(size) = toml.read_buffer_size {
        config.read_buffer_size = size;
    }
    if let Some(len) = toml.max_payload_len {
        config.max_payload_len = len;
    }
    if let Some(len) = toml.max_metadata_len {
        config.max_metadata_len = len;
    }
}

/// Apply environment overrides read through `lookup`.
///
/// Unparseable values are logged and ignored.
fn apply_env_config(config: &mut TransportConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(path) = lookup(ENV_SOCKET).filter(|p| !p.is_empty()) {
        config.socket_path = PathBuf::from(path);
        config.source = ConfigSource::Env;
    }
    if let Some(kind) = lookup(ENV_KIND) {
        match kind.parse::<SocketKind>() {
            Ok(kind) => {
                config.kind = kind;
                config.source = ConfigSource::Env;
            }
            Err(e) => tracing::warn!(var = ENV_KIND, error = %e, "Ignoring invalid value"),
        }
    }
    if let Some(backlog) = lookup(ENV_BACKLOG) {
        match backlog.parse::<i32>() {
            Ok(backlog) => {
                config.backlog = backlog;
                config.source = ConfigSource::Env;
            }
            Err(e) => tracing::warn!(var = ENV_BACKLOG, error = %e, "Ignoring invalid value"),
        }
    }
}

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Socket path override
    pub socket_path: Option<PathBuf>,
    /// Socket kind override
    pub kind: Option<SocketKind>,
    /// Backlog override
    pub backlog: Option<i32>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set socket path override
    #[must_use]
    pub fn with_socket_path(mut self, path: PathBuf) -> Self {
        self.socket_path = Some(path);
        self
    }

    /// Set socket kind override
    #[must_use]
    pub fn with_kind(mut self, kind: SocketKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Set backlog override
    #[must_use]
    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut TransportConfig) {
        if self.socket_path.is_some() || self.kind.is_some() || self.backlog.is_some() {
            config.source = ConfigSource::Cli;
        }
        if let Some(ref path) = self.socket_path {
            config.socket_path = path.clone();
        }
        if let Some(kind) = self.kind {
            config.kind = kind;
        }
        if let Some(backlog) = self.backlog {
            config.backlog = backlog;
        }
    }
}
