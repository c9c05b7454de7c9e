//! UDP datagram server.
//!
//! Multiplexes the console and one non-blocking UDP socket.  Every received
//! datagram is printed and its source remembered; every console line is sent
//! as one datagram to the most recently seen source.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fdmux_core::compose_message;
use fdmux_net::{Console, Interest, InterestSet, Multiplexer, Token};
use tracing::{debug, info, trace, warn};

use super::event_loop::LoopError;
use super::notice::Notice;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatagramReport {
    pub timed_out: bool,
    pub received: Vec<(SocketAddr, Vec<u8>)>,
    pub sent: Vec<(SocketAddr, usize)>,
    pub notices: Vec<Notice>,
}

pub struct DatagramServer<M, C> {
    mux: M,
    socket: UdpSocket,
    console: Option<Console<C>>,
    last_peer: Option<SocketAddr>,
    operator: Box<dyn Write>,
    shutdown: Arc<AtomicBool>,
    wait_timeout: Option<Duration>,
    buffer_capacity: usize,
    stopped: bool,
}

impl<M: Multiplexer, C: Read + AsRawFd> DatagramServer<M, C> {
    pub fn new(
        mux: M,
        socket: UdpSocket,
        console: Option<Console<C>>,
        wait_timeout: Option<Duration>,
        buffer_capacity: usize,
    ) -> Self {
        Self {
            mux,
            socket,
            console,
            last_peer: None,
            operator: Box::new(io::stdout()),
            shutdown: Arc::new(AtomicBool::new(false)),
            wait_timeout,
            buffer_capacity,
            stopped: false,
        }
    }

    pub fn with_operator_output(mut self, out: Box<dyn Write>) -> Self {
        self.operator = out;
        self
    }

    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    pub fn last_peer(&self) -> Option<SocketAddr> {
        self.last_peer
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serves until the shutdown flag is set or the multiplexer fails.
    pub fn run(&mut self) -> Result<(), LoopError> {
        info!(backend = self.mux.name(), "datagram server started");
        while !self.stopped {
            self.run_once()?;
        }
        info!("datagram server stopped");
        Ok(())
    }

    pub fn run_once(&mut self) -> Result<DatagramReport, LoopError> {
        let mut report = DatagramReport::default();
        if self.stopped {
            return Err(LoopError::Stopped);
        }
        if self.shutdown.load(Ordering::Relaxed) {
            self.stopped = true;
            self.emit(Notice::ShuttingDown, &mut report);
            return Ok(report);
        }

        let mut interest = InterestSet::new();
        if let Some(console) = self.console.as_ref().filter(|c| !c.is_closed()) {
            interest.add(console.descriptor(), Token::Console, Interest::READABLE);
        }
        interest.add(self.socket.as_raw_fd(), Token::Socket, Interest::READABLE);
        if let Err(source) = self.mux.sync(&interest) {
            self.stopped = true;
            return Err(LoopError::Register {
                backend: self.mux.name(),
                source,
            });
        }

        let events = match self.mux.wait(self.wait_timeout) {
            Ok(events) => events,
            Err(source) => {
                self.stopped = true;
                return Err(LoopError::Wait {
                    backend: self.mux.name(),
                    source,
                });
            }
        };
        if events.is_empty() {
            trace!("wait timed out");
            report.timed_out = true;
            return Ok(report);
        }

        let console_ready = events.iter().any(|e| e.token == Token::Console && e.readable);
        let socket_ready = events.iter().any(|e| e.token == Token::Socket && e.readable);

        if console_ready {
            self.dispatch_console(&mut report);
        }
        if socket_ready {
            self.drain_socket(&mut report);
        }
        Ok(report)
    }

    fn emit(&mut self, notice: Notice, report: &mut DatagramReport) {
        if let Err(e) = writeln!(self.operator, "{notice}").and_then(|_| self.operator.flush()) {
            debug!(error = %e, "operator output failed");
        }
        report.notices.push(notice);
    }

    fn dispatch_console(&mut self, report: &mut DatagramReport) {
        let Some(console) = self.console.as_mut() else {
            return;
        };
        let input = match console.read_available() {
            Ok(input) => input,
            Err(e) => {
                warn!(error = %e, "console read failed; ignoring further console input");
                self.console = None;
                self.emit(Notice::ConsoleClosed, report);
                return;
            }
        };

        for line in &input.lines {
            let Some(body) = compose_message(line) else {
                self.emit(Notice::EmptyMessage, report);
                continue;
            };
            let Some(peer) = self.last_peer else {
                self.emit(Notice::NoPeer, report);
                continue;
            };
            match self.socket.send_to(&body, peer) {
                Ok(sent) => {
                    debug!(%peer, sent, "datagram sent");
                    report.sent.push((peer, sent));
                }
                Err(e) => warn!(%peer, error = %e, "datagram send failed"),
            }
        }

        if input.closed {
            info!("console reached end of input");
            self.emit(Notice::ConsoleClosed, report);
        }
    }

    fn drain_socket(&mut self, report: &mut DatagramReport) {
        let mut buf = vec![0u8; self.buffer_capacity.max(1)];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    let bytes = buf[..n].to_vec();
                    self.last_peer = Some(from);
                    report.received.push((from, bytes.clone()));
                    self.emit(Notice::DatagramReceived { from, bytes }, report);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // ICMP errors from an earlier send surface here; they do
                    // not affect the socket.
                    debug!(error = %e, "datagram receive failed");
                    break;
                }
            }
        }
    }
}
