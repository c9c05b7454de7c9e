//! Listening sockets.
//!
//! [`bind_and_listen`] builds the socket with `socket2` so the backlog and
//! address reuse can be set explicitly, then leaves it non-blocking so
//! [`Listener::accept_one`] never stalls the event loop.
//!
//! Unix-domain listeners remove a stale socket file before binding and remove
//! their own file again when dropped.

use std::fmt;
use std::fs;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use fdmux_core::PeerAddress;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use thiserror::Error;
use tracing::{debug, warn};

use super::Connection;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: i32 = 20;

/// Where a listener accepts connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Errors that prevent a listener from starting.  All of them are fatal.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("failed to create socket for {endpoint}: {source}")]
    Socket {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to remove stale socket file {path}: {source}")]
    StalePath {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen on {endpoint}: {source}")]
    Listen {
        endpoint: String,
        #[source]
        source: io::Error,
    },
}

/// A failed accept that is not a transient condition.
#[derive(Debug, Error)]
#[error("accept failed on {endpoint}: {source}")]
pub struct AcceptError {
    pub endpoint: Endpoint,
    #[source]
    pub source: io::Error,
}

/// A bound, listening, non-blocking socket.
#[derive(Debug)]
pub struct Listener {
    socket: Socket,
    endpoint: Endpoint,
}

/// Creates, binds, and listens on `endpoint`.
///
/// TCP listeners enable `SO_REUSEADDR`.  Unix-domain listeners unlink any
/// existing file at the path first.  Nothing is retried.
pub fn bind_and_listen(endpoint: &Endpoint, backlog: i32) -> Result<Listener, BindError> {
    let name = endpoint.to_string();
    let socket_err = |source| BindError::Socket {
        endpoint: name.clone(),
        source,
    };

    let (socket, address) = match endpoint {
        Endpoint::Tcp(addr) => {
            let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))
                .map_err(socket_err)?;
            socket.set_reuse_address(true).map_err(socket_err)?;
            (socket, SockAddr::from(*addr))
        }
        Endpoint::Unix(path) => {
            remove_stale(path)?;
            let socket = Socket::new(Domain::UNIX, Type::STREAM, None).map_err(socket_err)?;
            let address = SockAddr::unix(path).map_err(socket_err)?;
            (socket, address)
        }
    };

    socket.bind(&address).map_err(|source| BindError::Bind {
        endpoint: name.clone(),
        source,
    })?;
    socket.listen(backlog).map_err(|source| BindError::Listen {
        endpoint: name.clone(),
        source,
    })?;
    socket.set_nonblocking(true).map_err(socket_err)?;

    debug!(%endpoint, backlog, fd = socket.as_raw_fd(), "listening");
    Ok(Listener {
        socket,
        endpoint: endpoint.clone(),
    })
}

fn remove_stale(path: &Path) -> Result<(), BindError> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed stale socket file");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(BindError::StalePath {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
    ) || err.raw_os_error() == Some(libc::EPROTO)
}

impl Listener {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The bound TCP address, which differs from the requested one when
    /// port 0 was used.  `None` for Unix-domain listeners.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()?.as_socket()
    }

    /// Accepts one pending connection.
    ///
    /// Returns `Ok(None)` when nothing is pending, the accept was interrupted,
    /// or the peer aborted before the accept completed.  Accepted connections
    /// are switched to non-blocking; one that cannot be is closed and
    /// reported as `Ok(None)`.
    pub fn accept_one(&self) -> Result<Option<(Connection, PeerAddress)>, AcceptError> {
        let (socket, address) = match self.socket.accept() {
            Ok(pair) => pair,
            Err(e) if is_transient(&e) => return Ok(None),
            Err(source) => {
                return Err(AcceptError {
                    endpoint: self.endpoint.clone(),
                    source,
                })
            }
        };

        if let Err(e) = socket.set_nonblocking(true) {
            warn!(error = %e, "could not make accepted socket non-blocking; closing it");
            return Ok(None);
        }

        let (connection, peer) = match &self.endpoint {
            Endpoint::Tcp(_) => {
                let peer = match address.as_socket() {
                    Some(addr) => PeerAddress::Inet(addr),
                    None => PeerAddress::Local(None),
                };
                (Connection::Tcp(TcpStream::from(socket)), peer)
            }
            Endpoint::Unix(_) => {
                let connection = Connection::Unix(UnixStream::from(socket));
                let peer = connection
                    .peer_address()
                    .unwrap_or(PeerAddress::Local(None));
                (connection, peer)
            }
        };
        Ok(Some((connection, peer)))
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Endpoint::Unix(path) = &self.endpoint {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "could not remove socket file");
                }
            }
        }
    }
}
