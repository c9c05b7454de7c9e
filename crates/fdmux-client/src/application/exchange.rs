//! Framed request/reply client for the server's `single` mode.
//!
//! The client speaks first: read a console line, send it as a frame, wait
//! for one reply frame, print it, repeat.  Connection I/O is blocking.

use std::io::{self, BufRead, Read, Write};

use fdmux_core::{read_frame, write_frame, FrameError};
use fdmux_net::next_message;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("console read failed: {0}")]
    Console(#[source] io::Error),

    #[error("output failed: {0}")]
    Output(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeEnd {
    PeerClosed,
    ConsoleClosed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeSummary {
    pub sent: usize,
    pub received: usize,
}

/// Runs the send-then-receive alternation until the console or the server
/// closes.
pub fn request_loop<S, I, O>(
    stream: &mut S,
    console: &mut I,
    out: &mut O,
) -> Result<(ExchangeEnd, ExchangeSummary), ExchangeError>
where
    S: Read + Write,
    I: BufRead,
    O: Write,
{
    let mut summary = ExchangeSummary::default();
    loop {
        let Some(request) = next_message(console, out).map_err(ExchangeError::Console)? else {
            info!("console closed");
            return Ok((ExchangeEnd::ConsoleClosed, summary));
        };
        let wire = write_frame(stream, &request)?;
        summary.sent += 1;
        debug!(wire, "request sent");

        let reply = loop {
            match read_frame(stream)? {
                None => {
                    info!("server closed the connection");
                    return Ok((ExchangeEnd::PeerClosed, summary));
                }
                Some(payload) if payload.is_empty() => debug!("skipping zero-length frame"),
                Some(payload) => break payload,
            }
        };
        summary.received += 1;
        writeln!(out, "RX: {}", String::from_utf8_lossy(&reply))
            .and_then(|_| out.flush())
            .map_err(ExchangeError::Output)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdmux_core::encode_frame;
    use std::io::Cursor;
    use std::os::unix::net::UnixStream;
    use std::thread;

    #[test]
    fn test_request_loop_sends_then_prints_reply() {
        // Arrange: a server that echoes one frame in upper case, then closes.
        let (mut client_end, mut server_end) = UnixStream::pair().unwrap();
        let server = thread::spawn(move || {
            let request = read_frame(&mut server_end).unwrap().unwrap();
            write_frame(&mut server_end, &request.to_ascii_uppercase()).unwrap();
            let next = read_frame(&mut server_end).unwrap().unwrap();
            drop(server_end);
            next
        });
        let mut console = Cursor::new(b"hello\n\nagain\n".to_vec());
        let mut out = Vec::new();

        // Act
        let (end, summary) = request_loop(&mut client_end, &mut console, &mut out).unwrap();

        // Assert
        assert_eq!(end, ExchangeEnd::PeerClosed);
        assert_eq!(summary, ExchangeSummary { sent: 2, received: 1 });
        assert_eq!(server.join().unwrap(), b"again");
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "RX: HELLO\ninput is empty; nothing sent\n"
        );
    }

    #[test]
    fn test_request_loop_skips_zero_length_reply() {
        let (mut client_end, mut server_end) = UnixStream::pair().unwrap();
        server_end.write_all(&encode_frame(b"").unwrap()).unwrap();
        server_end.write_all(&encode_frame(b"ok").unwrap()).unwrap();
        let mut console = Cursor::new(b"ping\n".to_vec());
        let mut out = Vec::new();

        let (end, summary) = request_loop(&mut client_end, &mut console, &mut out).unwrap();

        assert_eq!(end, ExchangeEnd::ConsoleClosed);
        assert_eq!(summary.received, 1);
        assert_eq!(String::from_utf8(out).unwrap(), "RX: ok\n");
    }

    #[test]
    fn test_request_loop_reports_truncated_reply() {
        let (mut client_end, mut server_end) = UnixStream::pair().unwrap();
        server_end.write_all(&[0, 0, 0, 9, b'x']).unwrap();
        server_end.shutdown(std::net::Shutdown::Write).unwrap();

        let err = request_loop(
            &mut client_end,
            &mut Cursor::new(b"ping\n".to_vec()),
            &mut Vec::new(),
        )
        .unwrap_err();

        assert!(matches!(err, ExchangeError::Frame(FrameError::Truncated)));
    }
}
