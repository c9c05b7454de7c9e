//! Outbound connections.
//!
//! TCP connects are non-blocking: `connect` normally returns `EINPROGRESS`,
//! the socket is watched for writability through a multiplexer, and the
//! pending socket error (`SO_ERROR`) decides whether the handshake
//! succeeded.  A failed or timed-out attempt throws its socket away and the
//! next attempt starts with a fresh one, because a socket whose connect
//! failed cannot portably be reused.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::multiplexer::{self, BackendKind, Interest, Token};
use crate::socket::Connection;

/// Default number of connect attempts.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 5;

/// Default time allowed for one attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub attempts: u32,
    pub timeout: Duration,
    /// Pause between a failed attempt and the next one.
    pub retry_delay: Duration,
    pub backend: BackendKind,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_CONNECT_ATTEMPTS,
            timeout: DEFAULT_CONNECT_TIMEOUT,
            retry_delay: Duration::from_millis(500),
            backend: BackendKind::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to create socket: {0}")]
    Socket(#[source] io::Error),

    #[error("failed to create {backend} multiplexer: {source}")]
    Multiplexer {
        backend: BackendKind,
        #[source]
        source: io::Error,
    },

    #[error("could not connect to {target} after {attempts} attempt(s): {last}")]
    Exhausted {
        target: String,
        attempts: u32,
        #[source]
        last: io::Error,
    },
}

fn connect_in_progress(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    ) || err.raw_os_error() == Some(libc::EINPROGRESS)
}

/// Connects to `addr`, retrying per `options`.  The returned connection is
/// non-blocking.
pub fn connect_tcp(addr: SocketAddr, options: &ConnectOptions) -> Result<Connection, ConnectError> {
    let attempts = options.attempts.max(1);
    let mut last = io::Error::new(io::ErrorKind::TimedOut, "no attempt made");

    for attempt in 1..=attempts {
        if attempt > 1 && !options.retry_delay.is_zero() {
            thread::sleep(options.retry_delay);
        }
        debug!(%addr, attempt, attempts, "connecting");

        match attempt_tcp(addr, options)? {
            Ok(stream) => {
                info!(%addr, attempt, "connected");
                return Ok(Connection::Tcp(stream));
            }
            Err(e) => {
                warn!(%addr, attempt, error = %e, "connect failed, retrying");
                last = e;
            }
        }
    }

    Err(ConnectError::Exhausted {
        target: addr.to_string(),
        attempts,
        last,
    })
}

/// One connect attempt on a fresh socket.
///
/// The outer `Result` carries errors that stop all retries; the inner one
/// carries a failure of this attempt only.
fn attempt_tcp(
    addr: SocketAddr,
    options: &ConnectOptions,
) -> Result<io::Result<TcpStream>, ConnectError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(ConnectError::Socket)?;
    socket.set_nonblocking(true).map_err(ConnectError::Socket)?;

    match socket.connect(&SockAddr::from(addr)) {
        Ok(()) => return Ok(Ok(socket.into())),
        Err(e) if connect_in_progress(&e) => {}
        Err(e) => return Ok(Err(e)),
    }

    let mut mux = multiplexer::create(options.backend).map_err(|source| {
        ConnectError::Multiplexer {
            backend: options.backend,
            source,
        }
    })?;
    if let Err(e) = mux.register(socket.as_raw_fd(), Token::Socket, Interest::WRITABLE) {
        return Ok(Err(e));
    }

    let deadline = Instant::now() + options.timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", options.timeout),
            )));
        }
        let events = match mux.wait(Some(remaining)) {
            Ok(events) => events,
            Err(e) => return Ok(Err(e)),
        };
        if events.iter().any(|e| e.writable || e.error || e.hangup) {
            break;
        }
    }

    let _ = mux.deregister(socket.as_raw_fd());
    drop(mux);

    if let Some(err) = socket.take_error().map_err(ConnectError::Socket)? {
        return Ok(Err(err));
    }
    match socket.peer_addr() {
        Ok(_) => Ok(Ok(socket.into())),
        Err(e) => Ok(Err(e)),
    }
}

/// Connects to a Unix-domain socket at `path` and switches the stream to
/// non-blocking.  Local connects complete or fail immediately.
pub fn connect_unix(path: &Path) -> Result<Connection, ConnectError> {
    let stream = UnixStream::connect(path).map_err(|last| ConnectError::Exhausted {
        target: path.display().to_string(),
        attempts: 1,
        last,
    })?;
    stream.set_nonblocking(true).map_err(ConnectError::Socket)?;
    info!(path = %path.display(), "connected");
    Ok(Connection::Unix(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn quick_options() -> ConnectOptions {
        ConnectOptions {
            attempts: 2,
            timeout: Duration::from_secs(2),
            retry_delay: Duration::ZERO,
            backend: BackendKind::Poll,
        }
    }

    #[test]
    fn test_connect_tcp_succeeds_against_listening_socket() {
        // Arrange
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        // Act
        let conn = connect_tcp(addr, &quick_options()).unwrap();

        // Assert
        let (_accepted, peer) = listener.accept().unwrap();
        assert_eq!(
            conn.peer_address().unwrap(),
            fdmux_core::PeerAddress::Inet(addr)
        );
        assert!(peer.ip().is_loopback());
    }

    #[test]
    fn test_connect_tcp_to_closed_port_exhausts_attempts() {
        // Bind then drop to find a port with nothing listening.
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();

        let err = connect_tcp(addr, &quick_options()).unwrap_err();

        match err {
            ConnectError::Exhausted { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_connect_unix_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = connect_unix(&dir.path().join("nobody.sock")).unwrap_err();
        assert!(matches!(err, ConnectError::Exhausted { attempts: 1, .. }));
    }
}
