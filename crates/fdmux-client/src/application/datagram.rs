//! UDP client for the server's `udp` mode.
//!
//! The socket is unconnected.  Each console line goes out as one datagram
//! and the client then waits, at most `reply_timeout`, for a reply from the
//! server's address.  Datagrams from anyone else are ignored.

use std::io::{self, BufRead, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use fdmux_net::next_message;
use thiserror::Error;
use tracing::{debug, info};

/// Default time to wait for a reply datagram.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DatagramError {
    #[error("failed to bind a local UDP socket: {0}")]
    Bind(#[source] io::Error),

    #[error("failed to send datagram to {server}: {source}")]
    Send {
        server: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to receive datagram: {0}")]
    Receive(#[source] io::Error),

    #[error("console read failed: {0}")]
    Console(#[source] io::Error),

    #[error("output failed: {0}")]
    Output(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatagramSummary {
    pub sent: usize,
    pub replies: usize,
    pub timeouts: usize,
}

#[derive(Debug)]
pub struct DatagramClient {
    socket: UdpSocket,
    server: SocketAddr,
    reply_timeout: Duration,
    buffer_capacity: usize,
}

impl DatagramClient {
    /// Binds an ephemeral local socket of the server's address family.
    pub fn bind(
        server: SocketAddr,
        reply_timeout: Duration,
        buffer_capacity: usize,
    ) -> Result<Self, DatagramError> {
        let local: SocketAddr = match server {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).map_err(DatagramError::Bind)?;
        Ok(Self {
            socket,
            server,
            reply_timeout,
            buffer_capacity: buffer_capacity.max(1),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Sends `body` and waits for one reply from the server.
    ///
    /// Returns `Ok(None)` when no reply arrives within the reply timeout.
    pub fn send_and_await(&self, body: &[u8]) -> Result<Option<Vec<u8>>, DatagramError> {
        self.socket
            .send_to(body, self.server)
            .map_err(|source| DatagramError::Send {
                server: self.server,
                source,
            })?;

        let deadline = Instant::now() + self.reply_timeout;
        let mut buf = vec![0u8; self.buffer_capacity];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.socket
                .set_read_timeout(Some(remaining))
                .map_err(DatagramError::Receive)?;
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) if from == self.server => return Ok(Some(buf[..n].to_vec())),
                Ok((_, from)) => debug!(%from, "ignoring datagram from unexpected source"),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Ok(None)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                // An ICMP port-unreachable from an earlier send; no reply is coming.
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => return Ok(None),
                Err(e) => return Err(DatagramError::Receive(e)),
            }
        }
    }

    /// Sends every console line and prints each reply until the console
    /// ends.
    pub fn run<I: BufRead, O: Write>(
        &self,
        console: &mut I,
        out: &mut O,
    ) -> Result<DatagramSummary, DatagramError> {
        let mut summary = DatagramSummary::default();
        while let Some(body) = next_message(console, out).map_err(DatagramError::Console)? {
            let reply = self.send_and_await(&body)?;
            summary.sent += 1;
            let printed = match reply {
                Some(bytes) => {
                    summary.replies += 1;
                    writeln!(out, "RX: {}", String::from_utf8_lossy(&bytes))
                }
                None => {
                    summary.timeouts += 1;
                    writeln!(out, "no reply within {:?}", self.reply_timeout)
                }
            };
            printed
                .and_then(|_| out.flush())
                .map_err(DatagramError::Output)?;
        }
        info!(sent = summary.sent, replies = summary.replies, "console closed");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::thread;

    fn echo_server() -> (SocketAddr, thread::JoinHandle<()>) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (n, from) = socket.recv_from(&mut buf).unwrap();
            socket.send_to(&buf[..n], from).unwrap();
        });
        (addr, handle)
    }

    #[test]
    fn test_send_and_await_receives_reply() {
        // Arrange
        let (server, handle) = echo_server();
        let client = DatagramClient::bind(server, Duration::from_secs(2), 1024).unwrap();

        // Act
        let reply = client.send_and_await(b"ping").unwrap();

        // Assert
        assert_eq!(reply, Some(b"ping".to_vec()));
        handle.join().unwrap();
    }

    #[test]
    fn test_send_and_await_times_out_without_reply() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let client = DatagramClient::bind(
            silent.local_addr().unwrap(),
            Duration::from_millis(100),
            1024,
        )
        .unwrap();

        let reply = client.send_and_await(b"anyone?").unwrap();

        assert_eq!(reply, None);
    }

    #[test]
    fn test_run_prints_reply_and_reports_empty_lines() {
        let (server, handle) = echo_server();
        let client = DatagramClient::bind(server, Duration::from_secs(2), 1024).unwrap();
        let mut console = Cursor::new(b"\nhello\n".to_vec());
        let mut out = Vec::new();

        let summary = client.run(&mut console, &mut out).unwrap();

        handle.join().unwrap();
        assert_eq!(
            summary,
            DatagramSummary {
                sent: 1,
                replies: 1,
                timeouts: 0
            }
        );
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "input is empty; nothing sent\nRX: hello\n"
        );
    }
}
