//! Application layer of the server: the three serving modes and the glue
//! that builds them from a [`ServerConfig`].
//!
//! | Mode          | Transport        | Loop                          |
//! |---------------|------------------|-------------------------------|
//! | `tcp`, `unix` | stream, many     | [`event_loop::EventLoop`]     |
//! | `single`      | TCP, exactly one | [`exchange::respond_loop`]    |
//! | `udp`         | datagrams        | [`datagram::DatagramServer`]  |

pub mod datagram;
pub mod event_loop;
pub mod exchange;
pub mod notice;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use fdmux_core::{ConnectionTable, ExitStatus};
use fdmux_net::socket::{bind_and_listen, bind_datagram, BindError, Endpoint};
use fdmux_net::{create, BackendKind, Console, Multiplexer};
use thiserror::Error;
use tracing::info;

use crate::infrastructure::storage::config::ServerConfig;
use datagram::DatagramServer;
use event_loop::{EventLoop, LoopError, LoopSettings, StopReason};
use exchange::{respond_loop, wait_for_client, ExchangeEnd, ExchangeError, ExchangeSummary};

/// How often `single` mode checks the shutdown flag while waiting for its
/// client.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("failed to create the {backend} multiplexer: {source}")]
    Multiplexer {
        backend: BackendKind,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Loop(#[from] LoopError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

impl ServerError {
    /// Startup failures and runtime failures exit differently.
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            ServerError::Bind(_) | ServerError::Multiplexer { .. } => ExitStatus::Startup,
            ServerError::Loop(_) | ServerError::Exchange(_) => ExitStatus::Runtime,
        }
    }
}

fn multiplexer(kind: BackendKind) -> Result<Box<dyn Multiplexer>, ServerError> {
    create(kind).map_err(|source| ServerError::Multiplexer {
        backend: kind,
        source,
    })
}

/// Serves many stream clients on `endpoint` until `shutdown` is set or the
/// operator types `shutdown`.
///
/// # Errors
///
/// Returns [`ServerError::Bind`] or [`ServerError::Multiplexer`] when startup
/// fails and [`ServerError::Loop`] when the loop dies.
pub fn serve_connections(
    endpoint: &Endpoint,
    config: &ServerConfig,
    shutdown: Arc<AtomicBool>,
) -> Result<StopReason, ServerError> {
    let mux = multiplexer(config.backend)?;
    let listener = bind_and_listen(endpoint, config.backlog)?;
    info!(
        %endpoint,
        backend = %config.backend,
        max_clients = config.max_clients,
        "listening"
    );

    let table = ConnectionTable::new(config.max_clients, config.buffer_capacity);
    let settings = LoopSettings {
        wait_timeout: config.wait_timeout(),
    };
    let mut event_loop = EventLoop::new(mux, listener, table, Some(Console::stdin()), settings)
        .with_shutdown_flag(shutdown);
    Ok(event_loop.run()?)
}

/// Serves exactly one framed TCP client.
///
/// # Errors
///
/// Returns [`ServerError::Exchange`] for protocol and I/O failures once the
/// listener is up.
pub fn serve_single(
    addr: SocketAddr,
    config: &ServerConfig,
    shutdown: Arc<AtomicBool>,
) -> Result<(ExchangeEnd, ExchangeSummary), ServerError> {
    let mut mux = multiplexer(config.backend)?;
    let listener = bind_and_listen(&Endpoint::Tcp(addr), config.backlog)?;
    info!(%addr, "waiting for a single client");

    let accepted = wait_for_client(&listener, &mut mux, &shutdown, ACCEPT_POLL_INTERVAL)?;
    drop(listener);
    let Some((mut connection, _peer)) = accepted else {
        return Ok((ExchangeEnd::Cancelled, ExchangeSummary::default()));
    };

    let stdin = io::stdin();
    let stdout = io::stdout();
    Ok(respond_loop(
        &mut connection,
        &mut stdin.lock(),
        &mut stdout.lock(),
    )?)
}

/// Serves UDP datagrams on `addr` until `shutdown` is set.
///
/// # Errors
///
/// Returns [`ServerError::Bind`] when the socket cannot be bound.
pub fn serve_datagrams(
    addr: SocketAddr,
    config: &ServerConfig,
    shutdown: Arc<AtomicBool>,
) -> Result<(), ServerError> {
    let mux = multiplexer(config.backend)?;
    let socket = bind_datagram(addr)?;
    info!(%addr, backend = %config.backend, "datagram socket bound");

    let mut server = DatagramServer::new(
        mux,
        socket,
        Some(Console::stdin()),
        config.wait_timeout(),
        config.buffer_capacity,
    )
    .with_shutdown_flag(shutdown);
    Ok(server.run()?)
}
