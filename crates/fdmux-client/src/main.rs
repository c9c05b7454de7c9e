//! fdmux-client entry point.
//!
//! Talks to an `fdmux-server` in the matching mode.
//!
//! # Usage
//!
//! ```text
//! fdmux-client [OPTIONS] <COMMAND>
//!
//! Commands:
//!   tcp    <HOST> <PORT>  Interactive session over TCP
//!   unix   <PATH>         Interactive session over a Unix-domain socket
//!   single <HOST> <PORT>  Framed request/reply with a single-client server
//!   udp    <HOST> <PORT>  One datagram per line, one reply per datagram
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable                  | Default | Description                        |
//! |---------------------------|---------|------------------------------------|
//! | `FDMUX_BACKEND`           | `poll`  | Readiness backend                  |
//! | `FDMUX_CONNECT_TIMEOUT`   | `10`    | Seconds allowed per connect attempt|
//! | `FDMUX_CONNECT_ATTEMPTS`  | `5`     | Connect attempts before giving up  |
//! | `FDMUX_WAIT_TIMEOUT`      | `10`    | Session wait timeout, 0 = forever  |
//! | `FDMUX_BUFFER_CAPACITY`   | `1024`  | Bytes read per readiness event     |
//! | `FDMUX_REPLY_TIMEOUT`     | `5`     | Seconds to wait for a UDP reply    |
//! | `FDMUX_LOG_LEVEL`         | `info`  | Log level when `RUST_LOG` is unset |
//!
//! CLI args take precedence when both are present.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use fdmux_core::ExitStatus;
use fdmux_net::{BackendKind, ConnectOptions, Endpoint};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fdmux_client::application::{
    run_datagrams, run_interactive, run_single, ClientError, ClientSettings,
};

// ── CLI argument definitions ──────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "fdmux-client",
    about = "Console client for the fdmux servers",
    version
)]
struct Cli {
    /// Readiness backend: select, poll, or epoll.
    #[arg(long, global = true, default_value = "poll", env = "FDMUX_BACKEND")]
    backend: BackendKind,

    /// Seconds allowed for one TCP connect attempt.
    #[arg(long, global = true, default_value_t = 10, env = "FDMUX_CONNECT_TIMEOUT")]
    connect_timeout: u64,

    /// Number of TCP connect attempts.
    #[arg(long, global = true, default_value_t = 5, env = "FDMUX_CONNECT_ATTEMPTS")]
    attempts: u32,

    /// Session wait timeout in seconds; 0 waits forever.
    #[arg(long, global = true, default_value_t = 10, env = "FDMUX_WAIT_TIMEOUT")]
    wait_timeout: u64,

    /// Bytes read from the server per readiness event.
    #[arg(long, global = true, default_value_t = 1024, env = "FDMUX_BUFFER_CAPACITY")]
    buffer_capacity: usize,

    /// Seconds to wait for a reply datagram.
    #[arg(long, global = true, default_value_t = 5, env = "FDMUX_REPLY_TIMEOUT")]
    reply_timeout: u64,

    /// Log level used when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info", env = "FDMUX_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive session over TCP.
    Tcp { host: IpAddr, port: u16 },
    /// Interactive session over a Unix-domain socket.
    Unix { path: PathBuf },
    /// Framed request/reply with a single-client server.
    Single { host: IpAddr, port: u16 },
    /// One datagram per console line.
    Udp { host: IpAddr, port: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Interactive(Endpoint),
    Single(SocketAddr),
    Datagrams(SocketAddr),
}

impl Cli {
    fn mode(&self) -> Mode {
        match &self.command {
            Command::Tcp { host, port } => {
                Mode::Interactive(Endpoint::Tcp(SocketAddr::new(*host, *port)))
            }
            Command::Unix { path } => Mode::Interactive(Endpoint::Unix(path.clone())),
            Command::Single { host, port } => Mode::Single(SocketAddr::new(*host, *port)),
            Command::Udp { host, port } => Mode::Datagrams(SocketAddr::new(*host, *port)),
        }
    }

    /// Converts the parsed CLI arguments into [`ClientSettings`].
    fn to_settings(&self) -> ClientSettings {
        ClientSettings {
            connect: ConnectOptions {
                attempts: self.attempts.max(1),
                timeout: Duration::from_secs(self.connect_timeout),
                backend: self.backend,
                ..ConnectOptions::default()
            },
            wait_timeout: match self.wait_timeout {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            buffer_capacity: self.buffer_capacity.max(1),
            reply_timeout: Duration::from_secs(self.reply_timeout),
        }
    }
}

fn install_shutdown_flag() -> anyhow::Result<Arc<AtomicBool>> {
    use signal_hook::consts::signal::{SIGINT, SIGTERM};
    use signal_hook::flag;

    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGINT, Arc::clone(&shutdown)).context("failed to register SIGINT handler")?;
    flag::register(SIGTERM, Arc::clone(&shutdown)).context("failed to register SIGTERM handler")?;
    Ok(shutdown)
}

fn run(mode: Mode, settings: &ClientSettings) -> anyhow::Result<()> {
    match mode {
        Mode::Interactive(endpoint) => {
            let shutdown = install_shutdown_flag()?;
            let end = run_interactive(&endpoint, settings, shutdown)
                .with_context(|| format!("session with {endpoint} failed"))?;
            info!(?end, "session finished");
        }
        Mode::Single(addr) => {
            let (end, summary) = run_single(addr, settings)
                .with_context(|| format!("framed exchange with {addr} failed"))?;
            info!(?end, sent = summary.sent, received = summary.received, "exchange finished");
        }
        Mode::Datagrams(addr) => {
            let summary = run_datagrams(addr, settings)
                .with_context(|| format!("datagram exchange with {addr} failed"))?;
            info!(
                sent = summary.sent,
                replies = summary.replies,
                timeouts = summary.timeouts,
                "datagram exchange finished"
            );
        }
    }
    Ok(())
}

fn exit_status_of(err: &anyhow::Error) -> ExitStatus {
    err.downcast_ref::<ClientError>()
        .map(ClientError::exit_status)
        .unwrap_or(ExitStatus::Startup)
}

// ── Entry point ───────────────────────────────────────────────────────────────

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

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = cli.to_settings();
    match run(cli.mode(), &settings) {
        Ok(()) => ExitStatus::Success.into(),
        Err(e) => {
            error!("{e:#}");
            exit_status_of(&e).into()
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
