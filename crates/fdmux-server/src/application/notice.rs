//! Operator-facing notices.
//!
//! Everything the server tells the operator (client listings, received
//! messages, rejected selections) is a [`Notice`].  The event loop writes each
//! notice to the operator output as one line (a listing spans several) and
//! also records it in the iteration report, so tests can assert on exactly
//! what the operator would have seen.

use std::fmt;
use std::net::SocketAddr;

use fdmux_core::{PeerAddress, SelectionError, SlotId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Snapshot of the live clients in slot order.
    Listing {
        clients: Vec<(SlotId, PeerAddress)>,
        capacity: usize,
    },
    Accepted {
        slot: SlotId,
        peer: PeerAddress,
    },
    /// The table was full; the connection was closed immediately.
    Rejected {
        peer: PeerAddress,
        capacity: usize,
    },
    /// The backend cannot watch the new descriptor; the connection was
    /// closed immediately.
    Unwatchable {
        peer: PeerAddress,
        backend: &'static str,
    },
    Closed {
        slot: SlotId,
        peer: PeerAddress,
    },
    Received {
        slot: SlotId,
        peer: PeerAddress,
        bytes: Vec<u8>,
    },
    /// The operator picked a target; the next console line is the body.
    AwaitingBody {
        slot: SlotId,
    },
    InvalidSelection(SelectionError),
    EmptyMessage,
    ShortWrite {
        slot: SlotId,
        sent: usize,
        requested: usize,
    },
    ConsoleClosed,
    DatagramReceived {
        from: SocketAddr,
        bytes: Vec<u8>,
    },
    /// A console line arrived before any datagram peer was known.
    NoPeer,
    ShuttingDown,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Listing { clients, capacity } => {
                write!(f, "clients ({}/{capacity}):", clients.len())?;
                if clients.is_empty() {
                    write!(f, "\n  (none)")?;
                }
                for (slot, peer) in clients {
                    write!(f, "\n  [{slot}] {peer}")?;
                }
                Ok(())
            }
            Notice::Accepted { slot, peer } => write!(f, "client {slot} connected from {peer}"),
            Notice::Rejected { peer, capacity } => write!(
                f,
                "too many connections ({capacity}); closed connection from {peer}"
            ),
            Notice::Unwatchable { peer, backend } => write!(
                f,
                "{backend} cannot watch another descriptor; closed connection from {peer}"
            ),
            Notice::Closed { slot, peer } => write!(f, "client {slot} ({peer}) disconnected"),
            Notice::Received { slot, peer, bytes } => write!(
                f,
                "[client {slot} {peer}] RX: {}",
                String::from_utf8_lossy(bytes)
            ),
            Notice::AwaitingBody { slot } => write!(f, "message for client {slot}:"),
            Notice::InvalidSelection(err) => write!(f, "{err}"),
            Notice::EmptyMessage => write!(f, "input is empty; nothing sent"),
            Notice::ShortWrite {
                slot,
                sent,
                requested,
            } => write!(f, "client {slot}: only {sent} of {requested} bytes sent"),
            Notice::ConsoleClosed => write!(f, "console closed; serving without operator input"),
            Notice::DatagramReceived { from, bytes } => {
                write!(f, "[{from}] RX: {}", String::from_utf8_lossy(bytes))
            }
            Notice::NoPeer => write!(f, "no peer yet; nothing sent"),
            Notice::ShuttingDown => write!(f, "shutting down"),
        }
    }
}
