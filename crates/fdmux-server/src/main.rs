//! fdmux-server entry point.
//!
//! A single-threaded server that multiplexes an operator console and many
//! client connections with `select`, `poll` or `epoll`.
//!
//! # Usage
//!
//! ```text
//! fdmux-server [OPTIONS] <COMMAND>
//!
//! Commands:
//!   tcp    <PORT>  Serve many TCP clients
//!   unix   <PATH>  Serve many Unix-domain clients
//!   single <PORT>  Exchange length-prefixed frames with exactly one TCP client
//!   udp    <PORT>  Exchange datagrams with the most recent UDP peer
//!
//! Options:
//!   --config       <PATH>  TOML config file
//!   --backend      <NAME>  select | poll | epoll
//!   --max-clients  <N>     Connection table capacity
//!   --wait-timeout <SECS>  Multiplexer wait timeout, 0 = forever
//!   --log-level    <LVL>   Log level when RUST_LOG is unset
//! ```
//!
//! # Operator console (tcp and unix modes)
//!
//! Type a client number, then the message for that client on the next line.
//! `list` prints the connected clients and `shutdown` stops the server.
//!
//! # Environment variable overrides
//!
//! | Variable              | Overrides        |
//! |-----------------------|------------------|
//! | `FDMUX_CONFIG`        | `--config`       |
//! | `FDMUX_BACKEND`       | `--backend`      |
//! | `FDMUX_MAX_CLIENTS`   | `--max-clients`  |
//! | `FDMUX_WAIT_TIMEOUT`  | `--wait-timeout` |
//! | `FDMUX_LOG_LEVEL`     | `--log-level`    |
//!
//! Command-line values win over environment variables, which win over the
//! config file.  Logs go to stderr; stdout carries only operator output.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use fdmux_core::ExitStatus;
use fdmux_net::{BackendKind, Endpoint};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fdmux_server::application::{serve_connections, serve_datagrams, serve_single, ServerError};
use fdmux_server::infrastructure::storage::config::{load_config, ConfigError, ServerConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "fdmux-server",
    about = "Readiness-multiplexed console-driven socket server",
    version
)]
struct Cli {
    /// Configuration file.  Defaults to `$XDG_CONFIG_HOME/fdmux/server.toml`.
    #[arg(long, global = true, env = "FDMUX_CONFIG")]
    config: Option<PathBuf>,

    /// Readiness backend: select, poll, or epoll.
    #[arg(long, global = true, env = "FDMUX_BACKEND")]
    backend: Option<BackendKind>,

    /// Maximum number of simultaneous clients.
    #[arg(long, global = true, env = "FDMUX_MAX_CLIENTS")]
    max_clients: Option<usize>,

    /// Multiplexer wait timeout in seconds; 0 waits forever.
    #[arg(long, global = true, env = "FDMUX_WAIT_TIMEOUT")]
    wait_timeout: Option<u64>,

    /// Log level used when `RUST_LOG` is unset.
    #[arg(long, global = true, env = "FDMUX_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve many TCP clients.
    Tcp {
        port: u16,
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
    },
    /// Serve many Unix-domain clients on a filesystem path.
    Unix { path: PathBuf },
    /// Exchange length-prefixed frames with exactly one TCP client.
    Single {
        port: u16,
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
    },
    /// Exchange datagrams with the most recent UDP peer.
    Udp {
        port: u16,
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
    },
}

/// What the parsed command asks the server to do.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Connections(Endpoint),
    Single(SocketAddr),
    Datagrams(SocketAddr),
}

fn socket_addr(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let ip: IpAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address: '{bind}'"))?;
    Ok(SocketAddr::new(ip, port))
}

impl Cli {
    /// Resolves the subcommand into a serving mode.
    ///
    /// # Errors
    ///
    /// Returns an error if `--bind` is not a valid IP address.
    fn mode(&self) -> anyhow::Result<Mode> {
        Ok(match &self.command {
            Command::Tcp { port, bind } => Mode::Connections(Endpoint::Tcp(socket_addr(bind, *port)?)),
            Command::Unix { path } => Mode::Connections(Endpoint::Unix(path.clone())),
            Command::Single { port, bind } => Mode::Single(socket_addr(bind, *port)?),
            Command::Udp { port, bind } => Mode::Datagrams(socket_addr(bind, *port)?),
        })
    }

    /// Applies command-line and environment overrides on top of `config`.
    fn apply_overrides(&self, config: &mut ServerConfig) {
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(max_clients) = self.max_clients {
            config.max_clients = max_clients;
        }
        if let Some(secs) = self.wait_timeout {
            config.wait_timeout_secs = secs;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }

    /// Loads the config file and layers the overrides on top.
    fn resolve_config(&self) -> Result<ServerConfig, ConfigError> {
        let mut config = load_config(self.config.as_deref())?;
        self.apply_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }
}

// ── Startup helpers ───────────────────────────────────────────────────────────

fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();
}

/// Registers SIGINT and SIGTERM to set the returned flag.
fn install_shutdown_flag() -> anyhow::Result<Arc<AtomicBool>> {
    use signal_hook::consts::signal::{SIGINT, SIGTERM};
    use signal_hook::flag;

    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGINT, Arc::clone(&shutdown)).context("failed to register SIGINT handler")?;
    flag::register(SIGTERM, Arc::clone(&shutdown)).context("failed to register SIGTERM handler")?;
    Ok(shutdown)
}

fn run(mode: Mode, config: &ServerConfig, shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    match mode {
        Mode::Connections(endpoint) => {
            let reason = serve_connections(&endpoint, config, shutdown)
                .with_context(|| format!("server on {endpoint} failed"))?;
            info!(?reason, "server stopped");
        }
        Mode::Single(addr) => {
            let (end, summary) = serve_single(addr, config, shutdown)
                .with_context(|| format!("single-client server on {addr} failed"))?;
            info!(?end, received = summary.received, sent = summary.sent, "exchange finished");
        }
        Mode::Datagrams(addr) => {
            serve_datagrams(addr, config, shutdown)
                .with_context(|| format!("datagram server on {addr} failed"))?;
        }
    }
    Ok(())
}

fn exit_status_of(err: &anyhow::Error) -> ExitStatus {
    err.downcast_ref::<ServerError>()
        .map(ServerError::exit_status)
        .unwrap_or(ExitStatus::Runtime)
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Program entry point.
///
/// # What happens at startup
///
/// 1. Arguments are parsed; a parse failure prints usage and exits with
///    [`ExitStatus::Usage`].
/// 2. The config file is loaded and the overrides applied; a failure exits
///    with [`ExitStatus::Config`].
/// 3. Logging is initialised at the configured level.
/// 4. SIGINT and SIGTERM are wired to a shared shutdown flag.
/// 5. The selected mode runs until it stops.
fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitStatus::Usage.into()
            } else {
                ExitStatus::Success.into()
            };
        }
    };

    let mode = match cli.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("fdmux-server: {e:#}");
            return ExitStatus::Usage.into();
        }
    };

    let config = match cli.resolve_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fdmux-server: {e}");
            return ExitStatus::Config.into();
        }
    };

    init_logging(&config.log_level);

    let shutdown = match install_shutdown_flag() {
        Ok(flag) => flag,
        Err(e) => {
            error!("{e:#}");
            return ExitStatus::Startup.into();
        }
    };

    match run(mode, &config, shutdown) {
        Ok(()) => ExitStatus::Success.into(),
        Err(e) => {
            error!("{e:#}");
            exit_status_of(&e).into()
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cli_tcp_defaults_bind_all_interfaces() {
        // Arrange
        let cli = Cli::parse_from(["fdmux-server", "tcp", "5000"]);

        // Act
        let mode = cli.mode().unwrap();

        // Assert
        assert_eq!(
            mode,
            Mode::Connections(Endpoint::Tcp("0.0.0.0:5000".parse().unwrap()))
        );
    }

    #[test]
    fn test_cli_unix_takes_a_path() {
        let cli = Cli::parse_from(["fdmux-server", "unix", "/tmp/fdmux.sock"]);
        assert_eq!(
            cli.mode().unwrap(),
            Mode::Connections(Endpoint::Unix(PathBuf::from("/tmp/fdmux.sock")))
        );
    }

    #[test]
    fn test_cli_single_with_bind_override() {
        let cli = Cli::parse_from(["fdmux-server", "single", "7000", "--bind", "127.0.0.1"]);
        assert_eq!(cli.mode().unwrap(), Mode::Single("127.0.0.1:7000".parse().unwrap()));
    }

    #[test]
    fn test_cli_udp_mode() {
        let cli = Cli::parse_from(["fdmux-server", "udp", "9000"]);
        assert_eq!(cli.mode().unwrap(), Mode::Datagrams("0.0.0.0:9000".parse().unwrap()));
    }

    #[test]
    fn test_cli_ipv6_bind_builds_bracketed_address() {
        // Arrange
        let cli = Cli::parse_from(["fdmux-server", "tcp", "7000", "--bind", "::"]);

        // Act
        let mode = cli.mode().unwrap();

        // Assert
        assert_eq!(mode, Mode::Connections(Endpoint::Tcp("[::]:7000".parse().unwrap())));
    }

    #[test]
    fn test_cli_invalid_bind_returns_error() {
        let cli = Cli::parse_from(["fdmux-server", "tcp", "5000", "--bind", "not.an.ip"]);
        assert!(cli.mode().is_err());
    }

    #[test]
    fn test_cli_missing_port_is_a_usage_error() {
        let err = Cli::try_parse_from(["fdmux-server", "tcp"]).unwrap_err();
        assert!(err.use_stderr());
    }

    #[test]
    fn test_cli_missing_subcommand_is_a_usage_error() {
        assert!(Cli::try_parse_from(["fdmux-server"]).is_err());
    }

    #[test]
    fn test_cli_unknown_backend_is_rejected() {
        let result = Cli::try_parse_from(["fdmux-server", "--backend", "kqueue", "tcp", "5000"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_global_options_after_subcommand() {
        let cli = Cli::parse_from([
            "fdmux-server",
            "tcp",
            "5000",
            "--backend",
            "select",
            "--max-clients",
            "3",
        ]);
        assert_eq!(cli.backend, Some(BackendKind::Select));
        assert_eq!(cli.max_clients, Some(3));
    }

    #[test]
    fn test_apply_overrides_replaces_only_given_fields() {
        // Arrange
        let cli = Cli::parse_from([
            "fdmux-server",
            "--wait-timeout",
            "0",
            "--log-level",
            "debug",
            "tcp",
            "5000",
        ]);
        let mut config = ServerConfig::default();

        // Act
        cli.apply_overrides(&mut config);

        // Assert
        assert_eq!(config.wait_timeout(), None);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.max_clients, 20);
    }

    #[test]
    fn test_resolve_config_rejects_zero_max_clients_override() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "wait_timeout_secs = 3\n").unwrap();
        let path_arg = path.to_string_lossy().into_owned();
        let cli = Cli::parse_from([
            "fdmux-server",
            "--config",
            path_arg.as_str(),
            "--max-clients",
            "0",
            "tcp",
            "5000",
        ]);

        let err = cli.resolve_config().unwrap_err();

        assert!(matches!(err, ConfigError::Invalid { field: "max_clients", .. }));
    }

    #[test]
    fn test_resolve_config_reads_file_then_overrides() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "wait_timeout_secs = 3\nmax_clients = 4\n").unwrap();
        let path_arg = path.to_string_lossy().into_owned();
        let cli = Cli::parse_from([
            "fdmux-server",
            "--config",
            path_arg.as_str(),
            "--max-clients",
            "8",
            "unix",
            "/tmp/x.sock",
        ]);

        let config = cli.resolve_config().unwrap();

        assert_eq!(config.max_clients, 8);
        assert_eq!(config.wait_timeout(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_exit_status_of_startup_error_through_context() {
        let bind_err = ServerError::Multiplexer {
            backend: BackendKind::Epoll,
            source: std::io::Error::from(std::io::ErrorKind::Unsupported),
        };
        let err = anyhow::Error::new(bind_err).context("server on tcp://0.0.0.0:1 failed");

        assert_eq!(exit_status_of(&err), ExitStatus::Startup);
    }

    #[test]
    fn test_exit_status_of_unknown_error_is_runtime() {
        let err = anyhow::anyhow!("something else");
        assert_eq!(exit_status_of(&err), ExitStatus::Runtime);
    }
}
