//! # fdmux-net
//!
//! Operating-system facing building blocks shared by the fdmux server and
//! client: readiness multiplexers, socket handles, the listener, the
//! non-blocking connector, per-connection session I/O, and the console line
//! reader.
//!
//! # Layering (for beginners)
//!
//! `fdmux-core` decides *what* should happen (which slot is live, which
//! target the operator chose).  This crate knows *how* to talk to the kernel:
//! it wraps `select(2)`, `poll(2)` and `epoll(7)` behind one
//! [`Multiplexer`](multiplexer::Multiplexer) trait and wraps every descriptor
//! in an owning Rust type so it is closed exactly once.
//!
//! All sockets handed out by this crate are non-blocking unless a function
//! says otherwise.

pub mod connector;
pub mod console;
pub mod multiplexer;
pub mod session;
pub mod socket;

pub use connector::{connect_tcp, connect_unix, ConnectError, ConnectOptions};
pub use console::{next_message, Console, ConsoleInput, LineBuffer, StdinSource};
pub use multiplexer::{
    create, BackendKind, Event, Interest, InterestSet, Multiplexer, Registration, Token,
};
pub use session::{receive, receive_into, send, ReadOutcome, Received};
pub use socket::{
    bind_and_listen, bind_datagram, AcceptError, BindError, Connection, Endpoint, Listener,
};
