//! Domain entities for fdmux.
//!
//! This module contains the rules that decide which connections exist and
//! what the operator is allowed to do with them.  It owns socket handles
//! through the generic [`table::ConnectionTable`], but it never performs I/O
//! on them: reading, writing, and waiting all live in `fdmux-net`.
//!
//! # Why keep the table free of I/O? (for beginners)
//!
//! The connection table is the piece with the strictest invariants: the live
//! count must always match the number of occupied slots, and no descriptor
//! may ever appear twice.  Keeping it generic over the handle type means the
//! tests can use lightweight fake handles that count how many times they were
//! closed, which is how "closed exactly once" is verified.

/// Operator console commands: target selection and message composition.
pub mod command;

/// Remote endpoint descriptions shown in client listings.
pub mod peer;

/// The bounded, slot-indexed registry of live connections.
pub mod table;
