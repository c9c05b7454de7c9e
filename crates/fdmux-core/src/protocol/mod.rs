//! Wire protocol used by the point-to-point TCP pair.
//!
//! The multiplexed servers send raw bytes without any framing; only the
//! single-client exchange uses [`frame`].

pub mod frame;
