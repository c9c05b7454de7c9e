//! Infrastructure layer of the server.
//!
//! Only configuration storage lives here; sockets and multiplexers come from
//! `fdmux-net`.

pub mod storage;
