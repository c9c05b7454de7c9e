//! Application layer of the client: the three client modes that pair with
//! the server's modes, plus the settings they share.
//!
//! | Mode          | Pairs with             | Loop                                |
//! |---------------|------------------------|-------------------------------------|
//! | `tcp`, `unix` | `fdmux-server tcp/unix`| [`session::InteractiveSession`]     |
//! | `single`      | `fdmux-server single`  | [`exchange::request_loop`]          |
//! | `udp`         | `fdmux-server udp`     | [`datagram::DatagramClient`]        |

pub mod datagram;
pub mod exchange;
pub mod session;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use fdmux_core::{ExitStatus, DEFAULT_BUFFER_CAPACITY};
use fdmux_net::{
    connect_tcp, connect_unix, create, BackendKind, ConnectError, ConnectOptions, Connection,
    Console, Endpoint,
};
use thiserror::Error;
use tracing::info;

use datagram::{DatagramClient, DatagramError, DatagramSummary, DEFAULT_REPLY_TIMEOUT};
use exchange::{request_loop, ExchangeEnd, ExchangeError, ExchangeSummary};
use session::{InteractiveSession, SessionEnd, SessionError};

/// Everything the client modes can be tuned with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub connect: ConnectOptions,
    /// Session wait timeout; `None` waits forever.  Also bounds the drain
    /// after `quit`.
    pub wait_timeout: Option<Duration>,
    pub buffer_capacity: usize,
    pub reply_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect: ConnectOptions::default(),
            wait_timeout: Some(Duration::from_secs(10)),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("failed to create the {backend} multiplexer: {source}")]
    Multiplexer {
        backend: BackendKind,
        #[source]
        source: io::Error,
    },

    #[error("failed to configure the connection: {0}")]
    Configure(#[source] io::Error),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Datagram(#[from] DatagramError),
}

impl ClientError {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            ClientError::Connect(_)
            | ClientError::Multiplexer { .. }
            | ClientError::Configure(_)
            | ClientError::Datagram(DatagramError::Bind(_)) => ExitStatus::Startup,
            ClientError::Session(_) | ClientError::Exchange(_) | ClientError::Datagram(_) => {
                ExitStatus::Runtime
            }
        }
    }
}

fn connect(endpoint: &Endpoint, settings: &ClientSettings) -> Result<Connection, ClientError> {
    Ok(match endpoint {
        Endpoint::Tcp(addr) => connect_tcp(*addr, &settings.connect)?,
        Endpoint::Unix(path) => connect_unix(path)?,
    })
}

/// Connects to `endpoint` and runs an interactive session on stdin/stdout.
///
/// # Errors
///
/// Returns [`ClientError::Connect`] when every connect attempt fails and
/// [`ClientError::Session`] when the session dies.
pub fn run_interactive(
    endpoint: &Endpoint,
    settings: &ClientSettings,
    shutdown: Arc<AtomicBool>,
) -> Result<SessionEnd, ClientError> {
    let backend = settings.connect.backend;
    let mux = create(backend).map_err(|source| ClientError::Multiplexer { backend, source })?;
    let connection = connect(endpoint, settings)?;
    info!(%endpoint, "type a message and press enter; `quit` leaves");

    let mut session = InteractiveSession::new(
        mux,
        connection,
        Console::stdin(),
        settings.wait_timeout,
        settings.buffer_capacity,
    )
    .with_shutdown_flag(shutdown);
    Ok(session.run()?)
}

/// Connects to a `single`-mode server and runs the framed exchange.
pub fn run_single(
    addr: SocketAddr,
    settings: &ClientSettings,
) -> Result<(ExchangeEnd, ExchangeSummary), ClientError> {
    let mut connection = connect_tcp(addr, &settings.connect)?;
    connection
        .set_nonblocking(false)
        .map_err(ClientError::Configure)?;

    let stdin = io::stdin();
    let stdout = io::stdout();
    Ok(request_loop(
        &mut connection,
        &mut stdin.lock(),
        &mut stdout.lock(),
    )?)
}

/// Exchanges datagrams with a `udp`-mode server.
pub fn run_datagrams(
    server: SocketAddr,
    settings: &ClientSettings,
) -> Result<DatagramSummary, ClientError> {
    let client = DatagramClient::bind(server, settings.reply_timeout, settings.buffer_capacity)?;
    let stdin = io::stdin();
    let stdout = io::stdout();
    Ok(client.run(&mut stdin.lock(), &mut stdout.lock())?)
}
