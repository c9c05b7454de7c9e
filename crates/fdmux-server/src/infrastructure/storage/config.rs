//! TOML-based configuration for the server.
//!
//! The file lives at `$XDG_CONFIG_HOME/fdmux/server.toml`, or
//! `~/.config/fdmux/server.toml` when `XDG_CONFIG_HOME` is unset.  A
//! different file can be named with `--config`.
//!
//! # File format (for beginners)
//!
//! Every key is optional; a missing key takes its default:
//!
//! ```toml
//! backend = "epoll"
//! max_clients = 20
//! buffer_capacity = 1024
//! backlog = 20
//! wait_timeout_secs = 10
//! log_level = "info"
//! ```
//!
//! `wait_timeout_secs = 0` means the event loop waits without a timeout.
//! Command-line flags are applied on top of whatever the file says.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fdmux_core::{DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_CLIENTS};
use fdmux_net::socket::DEFAULT_BACKLOG;
use fdmux_net::BackendKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File name inside the platform config directory.
pub const CONFIG_FILE_NAME: &str = "server.toml";

/// Largest accepted `max_clients`.
pub const MAX_CLIENTS_CEILING: usize = 65_536;

/// Descriptors kept for stdio, the console and the listener when sizing the
/// table against a backend's descriptor limit.
const RESERVED_DESCRIPTORS: usize = 16;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value parsed but is not usable.
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Config schema ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    /// Readiness backend: `"select"`, `"poll"` or `"epoll"`.
    #[serde(default)]
    pub backend: BackendKind,
    /// Connection table capacity.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Bytes read from a connection per readiness event.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// `listen(2)` backlog.
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Multiplexer wait timeout; `0` waits forever.
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
    /// `tracing` level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_max_clients() -> usize {
    DEFAULT_MAX_CLIENTS
}
fn default_buffer_capacity() -> usize {
    DEFAULT_BUFFER_CAPACITY
}
fn default_backlog() -> i32 {
    DEFAULT_BACKLOG
}
fn default_wait_timeout_secs() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            max_clients: default_max_clients(),
            buffer_capacity: default_buffer_capacity(),
            backlog: default_backlog(),
            wait_timeout_secs: default_wait_timeout_secs(),
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// The event loop wait timeout, `None` for "forever".
    pub fn wait_timeout(&self) -> Option<Duration> {
        match self.wait_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Rejects values the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_clients == 0 {
            return Err(invalid("max_clients", "must be at least 1"));
        }
        if self.max_clients > MAX_CLIENTS_CEILING {
            return Err(invalid(
                "max_clients",
                format!("must be at most {MAX_CLIENTS_CEILING}"),
            ));
        }
        if let Some(limit) = self.backend.descriptor_limit() {
            let usable = limit.saturating_sub(RESERVED_DESCRIPTORS);
            if self.max_clients > usable {
                return Err(invalid(
                    "max_clients",
                    format!("the {} backend can serve at most {usable} clients", self.backend),
                ));
            }
        }
        if self.buffer_capacity == 0 {
            return Err(invalid("buffer_capacity", "must be at least 1"));
        }
        if self.backlog <= 0 {
            return Err(invalid("backlog", "must be positive"));
        }
        if !self.backend.is_supported() {
            return Err(invalid(
                "backend",
                format!("`{}` is not available on this platform", self.backend),
            ));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when neither
/// `XDG_CONFIG_HOME` nor `HOME` is set.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the default config file.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Loads the configuration.
///
/// With `Some(path)` the file must exist.  With `None` the platform default
/// is tried and a missing file yields [`ServerConfig::default`].
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors, [`ConfigError::Parse`]
/// if the TOML is malformed, and [`ConfigError::Invalid`] if a value fails
/// [`ServerConfig::validate`].
pub fn load_config(explicit: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let config = match explicit {
        Some(path) => read_config(path)?,
        None => match config_file_path() {
            Ok(path) => match read_config(&path) {
                Err(ConfigError::Io { source, .. })
                    if source.kind() == std::io::ErrorKind::NotFound =>
                {
                    ServerConfig::default()
                }
                other => other?,
            },
            Err(ConfigError::NoPlatformConfigDir) => ServerConfig::default(),
            Err(e) => return Err(e),
        },
    };
    config.validate()?;
    Ok(config)
}

fn read_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&content)?)
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config_to(config: &ServerConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    // XDG_CONFIG_HOME or ~/.config
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
    Some(base.join("fdmux"))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
