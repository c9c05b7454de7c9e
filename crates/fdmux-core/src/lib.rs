//! # fdmux-core
//!
//! Shared library for the fdmux servers and clients containing the connection
//! table, operator command parsing, the point-to-point frame codec, and the
//! process exit codes.
//!
//! This crate is used by the server, the client, and the network layer.
//! It never opens a socket or waits on a descriptor itself.
//!
//! # Architecture overview (for beginners)
//!
//! fdmux is a family of single-threaded programs that watch several I/O
//! sources at once (the console, a listening socket, and every connected
//! client) and react to whichever one becomes ready first.  This technique is
//! called *readiness multiplexing*.
//!
//! This crate (`fdmux-core`) is the shared foundation.  It defines:
//!
//! - **`domain`** – The bounded [`ConnectionTable`] that owns every live client
//!   socket, the [`PeerAddress`] shown to the operator, and the parsing of
//!   console commands such as "send to client 3".
//!
//! - **`protocol`** – The 4-byte length-prefixed framing used by the
//!   point-to-point TCP pair.  The multiplexed servers exchange raw bytes and
//!   do not use it.
//!
//! - **`exit`** – The small fixed set of process exit codes.

pub mod domain;
pub mod exit;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `fdmux_core::ConnectionTable` instead of `fdmux_core::domain::table::ConnectionTable`.
pub use domain::command::{
    compose_message, is_quit, parse_command, select_target, strip_line_ending, OperatorCommand,
    SelectionError,
};
pub use domain::peer::PeerAddress;
pub use domain::table::{
    ConnectionSlot, ConnectionTable, SlotId, TableError, DEFAULT_BUFFER_CAPACITY,
    DEFAULT_MAX_CLIENTS,
};
pub use exit::ExitStatus;
pub use protocol::frame::{
    decode_frame, encode_frame, read_frame, write_frame, FrameError, MAX_FRAME_PAYLOAD,
};
