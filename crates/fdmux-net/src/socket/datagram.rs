//! UDP sockets for the datagram server.

use std::net::{SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use super::BindError;

/// Binds a non-blocking UDP socket with `SO_REUSEADDR` set.
pub fn bind_datagram(addr: SocketAddr) -> Result<UdpSocket, BindError> {
    let endpoint = format!("udp://{addr}");
    let socket_err = |source| BindError::Socket {
        endpoint: endpoint.clone(),
        source,
    };

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(socket_err)?;
    socket.set_reuse_address(true).map_err(socket_err)?;
    socket
        .bind(&SockAddr::from(addr))
        .map_err(|source| BindError::Bind {
            endpoint: endpoint.clone(),
            source,
        })?;
    socket.set_nonblocking(true).map_err(socket_err)?;
    Ok(UdpSocket::from(socket))
}
