//! Point-to-point framed exchange with exactly one client.
//!
//! The server waits for one connection, closes its listener, and then
//! strictly alternates with the client: receive a frame, print it, read one
//! console line, send it back as a frame.  All I/O on the connection is
//! blocking.  Zero-length frames are skipped without taking a console turn.

use std::io::{self, BufRead, Read, Write};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fdmux_core::{read_frame, write_frame, FrameError, PeerAddress};
use fdmux_net::socket::{AcceptError, Connection, Listener};
use fdmux_net::{next_message, Interest, Multiplexer, Token};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("console read failed: {0}")]
    Console(#[source] io::Error),

    #[error("operator output failed: {0}")]
    Output(#[source] io::Error),

    #[error("waiting for a client failed: {0}")]
    Wait(#[source] io::Error),

    #[error(transparent)]
    Accept(#[from] AcceptError),
}

/// Why an exchange ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeEnd {
    PeerClosed,
    ConsoleClosed,
    /// The shutdown flag was set before a client arrived.
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeSummary {
    pub received: usize,
    pub sent: usize,
}

/// Waits for the first client on `listener`, checking `shutdown` every
/// `poll_interval`.  The returned connection is blocking.
pub fn wait_for_client<M: Multiplexer + ?Sized>(
    listener: &Listener,
    mux: &mut M,
    shutdown: &AtomicBool,
    poll_interval: Duration,
) -> Result<Option<(Connection, PeerAddress)>, ExchangeError> {
    mux.register(listener.as_raw_fd(), Token::Listener, Interest::READABLE)
        .map_err(ExchangeError::Wait)?;

    let outcome = loop {
        if shutdown.load(Ordering::Relaxed) {
            break None;
        }
        let events = mux.wait(Some(poll_interval)).map_err(ExchangeError::Wait)?;
        if events.is_empty() {
            continue;
        }
        if let Some(pair) = listener.accept_one()? {
            break Some(pair);
        }
    };

    let _ = mux.deregister(listener.as_raw_fd());
    if let Some((connection, peer)) = &outcome {
        connection
            .set_nonblocking(false)
            .map_err(ExchangeError::Wait)?;
        info!(%peer, "client connected");
    }
    Ok(outcome)
}

/// Runs the receive-then-reply alternation until the peer or the console
/// closes.
pub fn respond_loop<S, I, O>(
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
        let payload = match read_frame(stream)? {
            None => {
                info!("client closed the connection");
                return Ok((ExchangeEnd::PeerClosed, summary));
            }
            Some(payload) if payload.is_empty() => {
                debug!("skipping zero-length frame");
                continue;
            }
            Some(payload) => payload,
        };
        summary.received += 1;
        writeln!(out, "RX: {}", String::from_utf8_lossy(&payload))
            .and_then(|_| out.flush())
            .map_err(ExchangeError::Output)?;

        let Some(reply) = next_message(console, out).map_err(ExchangeError::Console)? else {
            info!("console closed");
            return Ok((ExchangeEnd::ConsoleClosed, summary));
        };
        let wire = write_frame(stream, &reply)?;
        summary.sent += 1;
        debug!(wire, "reply sent");
    }
}
