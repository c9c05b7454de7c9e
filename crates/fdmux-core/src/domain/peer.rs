//! Remote endpoint of an accepted connection.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

/// The remote endpoint of a connection, as presented to the operator.
///
/// TCP peers have an IP address and port.  Unix-domain peers usually connect
/// from an unnamed socket, so their address is opaque; when the peer did bind
/// a path it is kept for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddress {
    /// An IPv4 or IPv6 endpoint.
    Inet(SocketAddr),
    /// A Unix-domain endpoint, with its filesystem path when it has one.
    Local(Option<PathBuf>),
}

impl PeerAddress {
    /// Returns `true` for TCP/UDP peers.
    pub fn is_inet(&self) -> bool {
        matches!(self, PeerAddress::Inet(_))
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        PeerAddress::Inet(addr)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddress::Inet(addr) => write!(f, "{addr}"),
            PeerAddress::Local(Some(path)) => write!(f, "{}", path.display()),
            PeerAddress::Local(None) => write!(f, "unnamed local peer"),
        }
    }
}
