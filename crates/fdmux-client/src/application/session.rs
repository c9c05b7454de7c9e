//! Interactive multiplexed client session.
//!
//! One loop watches the console and the server connection:
//!
//! - a console line is sent to the server as-is (without its newline);
//! - data from the server is printed as it arrives;
//! - end-of-stream or a read error from the server ends the session.
//!
//! # Leaving with `quit` (for beginners)
//!
//! Closing the socket right after sending `quit` could discard replies the
//! server is still sending.  Instead the client sends the line, half-closes
//! its write side so the server sees end-of-stream, stops reading the
//! console, and keeps printing whatever the server sends until the server
//! closes too or one wait times out.  Console end-of-file is handled the same
//! way, minus the `quit` line.

use std::fmt;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fdmux_core::{compose_message, is_quit};
use fdmux_net::{session, Connection, Console, Interest, InterestSet, Multiplexer, Token};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{backend} wait failed: {source}")]
    Wait {
        backend: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to update {backend} registrations: {source}")]
    Register {
        backend: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("send to server failed: {0}")]
    Send(#[source] io::Error),

    #[error("receive from server failed: {0}")]
    Receive(#[source] io::Error),

    #[error("half-close failed: {0}")]
    HalfClose(#[source] io::Error),
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The server closed the connection while the console was still open.
    ServerClosed,
    /// The user typed `quit` (or the console ended) and the drain finished.
    Quit,
    /// The shutdown flag was set.
    Interrupted,
}

/// Something shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    Received(Vec<u8>),
    EmptyMessage,
    ShortWrite { sent: usize, requested: usize },
    Draining,
    ServerClosed,
}

impl fmt::Display for SessionNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionNotice::Received(bytes) => write!(f, "RX: {}", String::from_utf8_lossy(bytes)),
            SessionNotice::EmptyMessage => write!(f, "input is empty; nothing sent"),
            SessionNotice::ShortWrite { sent, requested } => {
                write!(f, "short write: sent {sent} of {requested} bytes")
            }
            SessionNotice::Draining => write!(f, "waiting for the server to finish"),
            SessionNotice::ServerClosed => write!(f, "server closed the connection"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub timed_out: bool,
    /// Bytes accepted by the kernel per send.
    pub sent: Vec<usize>,
    pub notices: Vec<SessionNotice>,
    pub finished: Option<SessionEnd>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Draining,
    Finished(SessionEnd),
}

pub struct InteractiveSession<M, C> {
    mux: M,
    connection: Connection,
    console: Option<Console<C>>,
    out: Box<dyn Write>,
    shutdown: Arc<AtomicBool>,
    wait_timeout: Option<Duration>,
    buffer_capacity: usize,
    phase: Phase,
}

impl<M: Multiplexer, C: Read + AsRawFd> InteractiveSession<M, C> {
    /// `connection` must already be non-blocking.
    pub fn new(
        mux: M,
        connection: Connection,
        console: Console<C>,
        wait_timeout: Option<Duration>,
        buffer_capacity: usize,
    ) -> Self {
        Self {
            mux,
            connection,
            console: Some(console),
            out: Box::new(io::stdout()),
            shutdown: Arc::new(AtomicBool::new(false)),
            wait_timeout,
            buffer_capacity: buffer_capacity.max(1),
            phase: Phase::Active,
        }
    }

    pub fn with_output(mut self, out: Box<dyn Write>) -> Self {
        self.out = out;
        self
    }

    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    pub fn is_draining(&self) -> bool {
        self.phase == Phase::Draining
    }

    pub fn run(&mut self) -> Result<SessionEnd, SessionError> {
        info!(backend = self.mux.name(), "session started");
        loop {
            if let Some(end) = self.run_once()?.finished {
                info!(?end, "session ended");
                return Ok(end);
            }
        }
    }

    pub fn run_once(&mut self) -> Result<SessionReport, SessionError> {
        let mut report = SessionReport::default();
        if let Phase::Finished(end) = self.phase {
            report.finished = Some(end);
            return Ok(report);
        }
        if self.shutdown.load(Ordering::Relaxed) {
            self.finish(SessionEnd::Interrupted, &mut report);
            return Ok(report);
        }

        let mut interest = InterestSet::new();
        if self.phase == Phase::Active {
            if let Some(console) = self.console.as_ref().filter(|c| !c.is_closed()) {
                interest.add(console.descriptor(), Token::Console, Interest::READABLE);
            }
        }
        interest.add(self.connection.as_raw_fd(), Token::Socket, Interest::READABLE);
        self.mux.sync(&interest).map_err(|source| SessionError::Register {
            backend: self.mux.name(),
            source,
        })?;

        let events = self
            .mux
            .wait(self.wait_timeout)
            .map_err(|source| SessionError::Wait {
                backend: self.mux.name(),
                source,
            })?;
        if events.is_empty() {
            trace!("wait timed out");
            report.timed_out = true;
            if self.phase == Phase::Draining {
                debug!("drain timed out");
                self.finish(SessionEnd::Quit, &mut report);
            }
            return Ok(report);
        }

        let console_ready = events.iter().any(|e| e.token == Token::Console && e.readable);
        let socket_ready = events.iter().any(|e| e.token == Token::Socket && e.readable);

        if console_ready && self.phase == Phase::Active {
            self.dispatch_console(&mut report)?;
        }
        if socket_ready {
            self.dispatch_socket(&mut report)?;
        }
        report.finished = match self.phase {
            Phase::Finished(end) => Some(end),
            _ => None,
        };
        Ok(report)
    }

    fn emit(&mut self, notice: SessionNotice, report: &mut SessionReport) {
        if let Err(e) = writeln!(self.out, "{notice}").and_then(|_| self.out.flush()) {
            debug!(error = %e, "output failed");
        }
        report.notices.push(notice);
    }

    fn finish(&mut self, end: SessionEnd, report: &mut SessionReport) {
        self.phase = Phase::Finished(end);
        report.finished = Some(end);
    }

    fn start_drain(&mut self, report: &mut SessionReport) -> Result<(), SessionError> {
        self.connection
            .shutdown_write()
            .map_err(SessionError::HalfClose)?;
        self.console = None;
        self.phase = Phase::Draining;
        self.emit(SessionNotice::Draining, report);
        Ok(())
    }

    fn dispatch_console(&mut self, report: &mut SessionReport) -> Result<(), SessionError> {
        let Some(console) = self.console.as_mut() else {
            return Ok(());
        };
        let input = match console.read_available() {
            Ok(input) => input,
            Err(e) => {
                warn!(error = %e, "console read failed");
                return self.start_drain(report);
            }
        };

        for line in &input.lines {
            let Some(body) = compose_message(line) else {
                self.emit(SessionNotice::EmptyMessage, report);
                continue;
            };
            let sent = session::send(&mut self.connection, &body).map_err(SessionError::Send)?;
            report.sent.push(sent);
            if sent < body.len() {
                self.emit(
                    SessionNotice::ShortWrite {
                        sent,
                        requested: body.len(),
                    },
                    report,
                );
            }
            if is_quit(&body) {
                info!("quit requested");
                return self.start_drain(report);
            }
        }

        if input.closed {
            info!("console reached end of input");
            return self.start_drain(report);
        }
        Ok(())
    }

    fn dispatch_socket(&mut self, report: &mut SessionReport) -> Result<(), SessionError> {
        let received = session::receive(&mut self.connection, self.buffer_capacity)
            .map_err(SessionError::Receive)?;
        if !received.bytes.is_empty() {
            self.emit(SessionNotice::Received(received.bytes), report);
        }
        if received.end_of_stream {
            let end = match self.phase {
                Phase::Draining => SessionEnd::Quit,
                _ => {
                    self.emit(SessionNotice::ServerClosed, report);
                    SessionEnd::ServerClosed
                }
            };
            self.finish(end, report);
        }
        Ok(())
    }
}
