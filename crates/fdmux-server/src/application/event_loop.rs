//! The readiness-driven event loop of the multi-client servers.
//!
//! # State machine
//!
//! ```text
//!   Idle ──► Waiting ──► Dispatching ──► Waiting ──► …
//!                 │             │
//!                 └─────────────┴──► Stopped
//! ```
//!
//! Each call to [`EventLoop::run_once`] is one trip around the loop:
//!
//! 1. Rebuild the interest set: the console (while open), the listener, and
//!    every live connection in the table.
//! 2. Wait on the multiplexer with the configured timeout.
//! 3. Dispatch, in a fixed order: console first, then the listener, then the
//!    ready connections in ascending slot order.
//!
//! A wait that times out dispatches nothing and changes nothing.
//!
//! # Console protocol
//!
//! The console alternates between two phases.  At the target prompt a line
//! is a client number, `list`, or `shutdown`.  After a valid client number
//! the next line is the message body, which is sent raw to that client.  The
//! target is checked again when the body arrives, since the client may have
//! disconnected in between.
//!
//! # Stopping
//!
//! The loop stops on an operator `shutdown`, when the shared shutdown flag is
//! set (by a signal handler), or on a multiplexer or listener failure.  On
//! stop every live connection is deregistered and closed.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fdmux_core::domain::command::validate_target;
use fdmux_core::{compose_message, parse_command, ConnectionTable, OperatorCommand, SlotId};
use fdmux_net::socket::{AcceptError, Connection, Listener};
use fdmux_net::{session, Console, Interest, InterestSet, Multiplexer, Token};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use super::notice::Notice;

/// Upper bound on accepts handled for one listener readiness event.
const MAX_ACCEPTS_PER_EVENT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Waiting,
    Dispatching,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The operator typed `shutdown`.
    Operator,
    /// The shared shutdown flag was set.
    Signal,
}

#[derive(Debug, Error)]
pub enum LoopError {
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

    #[error(transparent)]
    Accept(#[from] AcceptError),

    #[error("the event loop has already stopped")]
    Stopped,
}

/// What happened during one iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterationReport {
    /// Number of ready sources the multiplexer reported.
    pub ready: usize,
    pub timed_out: bool,
    pub accepted: Vec<SlotId>,
    pub rejected: usize,
    pub removed: Vec<SlotId>,
    pub received: Vec<(SlotId, Vec<u8>)>,
    /// Bytes accepted by the kernel per send.
    pub sent: Vec<(SlotId, usize)>,
    pub notices: Vec<Notice>,
}

/// Tunables for [`EventLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    /// `None` waits forever.
    pub wait_timeout: Option<Duration>,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            wait_timeout: Some(Duration::from_secs(10)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsolePhase {
    AwaitingTarget,
    AwaitingBody(SlotId),
}

pub struct EventLoop<M, C> {
    mux: M,
    listener: Listener,
    table: ConnectionTable<Connection>,
    console: Option<Console<C>>,
    phase: ConsolePhase,
    operator: Box<dyn Write>,
    shutdown: Arc<AtomicBool>,
    settings: LoopSettings,
    state: LoopState,
    stop_reason: Option<StopReason>,
    listing_dirty: bool,
}

impl<M: Multiplexer, C: Read + AsRawFd> EventLoop<M, C> {
    pub fn new(
        mux: M,
        listener: Listener,
        table: ConnectionTable<Connection>,
        console: Option<Console<C>>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            mux,
            listener,
            table,
            console,
            phase: ConsolePhase::AwaitingTarget,
            operator: Box::new(io::stdout()),
            shutdown: Arc::new(AtomicBool::new(false)),
            settings,
            state: LoopState::Idle,
            stop_reason: None,
            listing_dirty: false,
        }
    }

    /// Sends operator notices to `out` instead of stdout.
    pub fn with_operator_output(mut self, out: Box<dyn Write>) -> Self {
        self.operator = out;
        self
    }

    /// Stops the loop before the next wait once `flag` becomes `true`.
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    pub fn table(&self) -> &ConnectionTable<Connection> {
        &self.table
    }

    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    pub fn multiplexer(&self) -> &M {
        &self.mux
    }

    /// Runs iterations until the loop stops.
    pub fn run(&mut self) -> Result<StopReason, LoopError> {
        info!(
            backend = self.mux.name(),
            endpoint = %self.listener.endpoint(),
            capacity = self.table.capacity(),
            "event loop started"
        );
        loop {
            self.run_once()?;
            if self.state == LoopState::Stopped {
                let reason = self.stop_reason.unwrap_or(StopReason::Signal);
                info!(?reason, "event loop stopped");
                return Ok(reason);
            }
        }
    }

    /// Runs exactly one wait-and-dispatch iteration.
    pub fn run_once(&mut self) -> Result<IterationReport, LoopError> {
        let mut report = IterationReport::default();
        if self.state == LoopState::Stopped {
            return Err(LoopError::Stopped);
        }
        if self.shutdown.load(Ordering::Relaxed) {
            self.stop(StopReason::Signal, &mut report);
            return Ok(report);
        }

        let interest = self.interest_set();
        if let Err(source) = self.mux.sync(&interest) {
            return Err(self.fail(LoopError::Register {
                backend: self.mux.name(),
                source,
            }));
        }

        self.state = LoopState::Waiting;
        let events = match self.mux.wait(self.settings.wait_timeout) {
            Ok(events) => events,
            Err(source) => {
                return Err(self.fail(LoopError::Wait {
                    backend: self.mux.name(),
                    source,
                }))
            }
        };

        report.ready = events.len();
        if events.is_empty() {
            trace!("wait timed out");
            report.timed_out = true;
            return Ok(report);
        }

        self.state = LoopState::Dispatching;
        let mut console_ready = false;
        let mut listener_ready = false;
        let mut connections = BTreeMap::new();
        for event in events.into_iter().filter(|e| e.readable) {
            match event.token {
                Token::Console => console_ready = true,
                Token::Listener => listener_ready = true,
                Token::Connection(slot) => {
                    connections.insert(slot, event);
                }
                Token::Socket => {}
            }
        }

        let mut removed_now = BTreeSet::new();

        if console_ready {
            self.dispatch_console(&mut report, &mut removed_now);
        }
        if listener_ready && self.stop_reason.is_none() {
            if let Err(err) = self.accept_pending(&mut report) {
                return Err(self.fail(err.into()));
            }
        }
        for slot in connections.into_keys() {
            if self.stop_reason.is_some() {
                break;
            }
            if removed_now.contains(&slot) {
                continue;
            }
            self.dispatch_connection(slot, &mut report, &mut removed_now);
        }

        if self.listing_dirty {
            self.listing_dirty = false;
            let listing = self.listing();
            self.emit(listing, &mut report);
        }

        match self.stop_reason {
            Some(reason) => self.stop(reason, &mut report),
            None => self.state = LoopState::Waiting,
        }
        Ok(report)
    }

    fn interest_set(&self) -> InterestSet {
        let mut set = InterestSet::new();
        if let Some(console) = self.console.as_ref().filter(|c| !c.is_closed()) {
            set.add(console.descriptor(), Token::Console, Interest::READABLE);
        }
        set.add(self.listener.as_raw_fd(), Token::Listener, Interest::READABLE);
        for (slot, entry) in self.table.live() {
            set.add(entry.descriptor(), Token::Connection(slot), Interest::READABLE);
        }
        set
    }

    fn listing(&self) -> Notice {
        Notice::Listing {
            clients: self
                .table
                .live()
                .map(|(slot, entry)| (slot, entry.peer().clone()))
                .collect(),
            capacity: self.table.capacity(),
        }
    }

    fn emit(&mut self, notice: Notice, report: &mut IterationReport) {
        if let Err(e) = writeln!(self.operator, "{notice}").and_then(|_| self.operator.flush()) {
            debug!(error = %e, "operator output failed");
        }
        report.notices.push(notice);
    }

    // ── Console ──────────────────────────────────────────────────────────────

    fn dispatch_console(&mut self, report: &mut IterationReport, removed_now: &mut BTreeSet<SlotId>) {
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

        for line in input.lines {
            self.handle_console_line(&line, report, removed_now);
            if self.stop_reason.is_some() {
                return;
            }
        }

        if input.closed {
            info!("console reached end of input");
            self.emit(Notice::ConsoleClosed, report);
        }
    }

    fn handle_console_line(
        &mut self,
        line: &str,
        report: &mut IterationReport,
        removed_now: &mut BTreeSet<SlotId>,
    ) {
        match self.phase {
            ConsolePhase::AwaitingTarget => match parse_command(line) {
                Ok(OperatorCommand::Blank) => {}
                Ok(OperatorCommand::List) => {
                    let listing = self.listing();
                    self.emit(listing, report);
                }
                Ok(OperatorCommand::Shutdown) => {
                    info!("shutdown requested from console");
                    self.stop_reason = Some(StopReason::Operator);
                }
                Ok(OperatorCommand::Select(slot)) => match validate_target(slot, &self.table) {
                    Ok(slot) => {
                        self.phase = ConsolePhase::AwaitingBody(slot);
                        self.emit(Notice::AwaitingBody { slot }, report);
                    }
                    Err(err) => self.emit(Notice::InvalidSelection(err), report),
                },
                Err(err) => self.emit(Notice::InvalidSelection(err), report),
            },
            ConsolePhase::AwaitingBody(slot) => {
                self.phase = ConsolePhase::AwaitingTarget;
                let Some(body) = compose_message(line) else {
                    self.emit(Notice::EmptyMessage, report);
                    return;
                };
                if let Err(err) = validate_target(slot, &self.table) {
                    self.emit(Notice::InvalidSelection(err), report);
                    return;
                }
                self.send_to(slot, &body, report, removed_now);
            }
        }
    }

    fn send_to(
        &mut self,
        slot: SlotId,
        body: &[u8],
        report: &mut IterationReport,
        removed_now: &mut BTreeSet<SlotId>,
    ) {
        let Some(entry) = self.table.get_mut(slot) else {
            return;
        };
        match session::send(entry.handle_mut(), body) {
            Ok(sent) => {
                debug!(%slot, sent, requested = body.len(), "sent to client");
                report.sent.push((slot, sent));
                if sent < body.len() {
                    self.emit(
                        Notice::ShortWrite {
                            slot,
                            sent,
                            requested: body.len(),
                        },
                        report,
                    );
                }
            }
            Err(e) => {
                warn!(%slot, error = %e, "send failed; dropping client");
                self.remove_slot(slot, report, removed_now);
            }
        }
    }

    // ── Listener ─────────────────────────────────────────────────────────────

    fn accept_pending(&mut self, report: &mut IterationReport) -> Result<(), AcceptError> {
        for _ in 0..MAX_ACCEPTS_PER_EVENT {
            let Some((connection, peer)) = self.listener.accept_one()? else {
                break;
            };
            let fd = connection.as_raw_fd();
            if !self.mux.accepts(fd) {
                let backend = self.mux.name();
                warn!(%peer, fd, backend, "descriptor out of backend range; closed new client");
                drop(connection);
                report.rejected += 1;
                self.emit(Notice::Unwatchable { peer, backend }, report);
                continue;
            }
            match self.table.insert(connection, peer.clone()) {
                Ok(slot) => {
                    info!(%slot, %peer, fd, "client connected");
                    report.accepted.push(slot);
                    self.listing_dirty = true;
                    self.emit(Notice::Accepted { slot, peer }, report);
                }
                Err(err) => {
                    warn!(%peer, error = %err, "too many connections; closed new client");
                    report.rejected += 1;
                    let capacity = self.table.capacity();
                    self.emit(Notice::Rejected { peer, capacity }, report);
                }
            }
        }
        Ok(())
    }

    // ── Connections ──────────────────────────────────────────────────────────

    fn dispatch_connection(
        &mut self,
        slot: SlotId,
        report: &mut IterationReport,
        removed_now: &mut BTreeSet<SlotId>,
    ) {
        let capacity = self.table.buffer_capacity();
        let Some(entry) = self.table.get_mut(slot) else {
            return;
        };
        let peer = entry.peer().clone();
        let result = {
            let (connection, buffer) = entry.io_parts();
            session::receive_into(connection, buffer, capacity)
        };
        let bytes = entry.take_received();

        if !bytes.is_empty() {
            debug!(%slot, len = bytes.len(), "received from client");
            report.received.push((slot, bytes.clone()));
            self.emit(Notice::Received { slot, peer, bytes }, report);
        }

        match result {
            Ok(outcome) if outcome.end_of_stream => self.remove_slot(slot, report, removed_now),
            Ok(_) => {}
            Err(e) => {
                debug!(%slot, error = %e, "receive failed; dropping client");
                self.remove_slot(slot, report, removed_now);
            }
        }
    }

    /// Deregisters, then closes, the connection in `slot`.
    fn remove_slot(
        &mut self,
        slot: SlotId,
        report: &mut IterationReport,
        removed_now: &mut BTreeSet<SlotId>,
    ) {
        let Some(fd) = self.table.get(slot).map(|entry| entry.descriptor()) else {
            return;
        };
        if let Err(e) = self.mux.deregister(fd) {
            debug!(%slot, fd, error = %e, "deregister before close failed");
        }
        if let Some(peer) = self.table.remove(slot) {
            info!(%slot, %peer, "client disconnected");
            removed_now.insert(slot);
            report.removed.push(slot);
            self.listing_dirty = true;
            self.emit(Notice::Closed { slot, peer }, report);
        }
    }

    // ── Stopping ─────────────────────────────────────────────────────────────

    fn stop(&mut self, reason: StopReason, report: &mut IterationReport) {
        self.stop_reason = Some(reason);
        self.emit(Notice::ShuttingDown, report);
        self.close_all();
        self.state = LoopState::Stopped;
    }

    fn fail(&mut self, err: LoopError) -> LoopError {
        warn!(error = %err, "event loop failed");
        self.close_all();
        self.state = LoopState::Stopped;
        err
    }

    fn close_all(&mut self) {
        for fd in self.table.descriptors() {
            let _ = self.mux.deregister(fd);
        }
        let closed = self.table.clear();
        if closed > 0 {
            info!(closed, "closed remaining clients");
        }
    }
}
