//! Owned socket handles.
//!
//! Every descriptor handed out by this module is wrapped in a type whose
//! `Drop` closes it, so there is exactly one place a socket is released: the
//! end of its owner's lifetime.

mod connection;
mod datagram;
mod listener;

pub use connection::Connection;
pub use datagram::bind_datagram;
pub use listener::{bind_and_listen, AcceptError, BindError, Endpoint, Listener, DEFAULT_BACKLOG};
