//! Operator console commands.
//!
//! The multiplexed servers read the console one line at a time.  At the
//! target prompt a line is one of:
//!
//! - a client number, selecting the slot that receives the next line,
//! - `list`, printing the current client listing,
//! - `shutdown`, stopping the server,
//! - an empty line, which is ignored.
//!
//! The line after a selection is the message body.  Its trailing newline is
//! stripped by [`compose_message`] and the remaining bytes are sent as-is.

use std::os::fd::AsRawFd;

use thiserror::Error;

use super::table::{ConnectionTable, SlotId};

/// Console keyword that prints the client listing.
pub const LIST_COMMAND: &str = "list";

/// Console keyword that stops the server.
pub const SHUTDOWN_COMMAND: &str = "shutdown";

/// Client-side keyword that ends an interactive session.
pub const QUIT_COMMAND: &str = "quit";

/// A line typed at the server's target prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Send the next console line to this slot.
    Select(SlotId),
    /// Print the client listing.
    List,
    /// Stop the event loop.
    Shutdown,
    /// Nothing was typed.
    Blank,
}

/// Why an operator-typed target was refused.
///
/// None of these end the event loop; they are reported and the console
/// returns to the target prompt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("invalid selection: `{0}` is not a client number")]
    NotANumber(String),

    #[error("invalid selection: client {index} is out of range (0..{capacity})")]
    OutOfRange { index: usize, capacity: usize },

    #[error("invalid selection: client {0} is not connected")]
    FreeSlot(SlotId),
}

/// Strips one trailing `\n` or `\r\n` from a console line.
pub fn strip_line_ending(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

/// Classifies a line typed at the target prompt.
///
/// Only syntax is checked here.  Use [`select_target`] to also require that
/// the chosen slot is live.
pub fn parse_command(line: &str) -> Result<OperatorCommand, SelectionError> {
    let token = strip_line_ending(line).trim();
    match token {
        "" => Ok(OperatorCommand::Blank),
        LIST_COMMAND => Ok(OperatorCommand::List),
        SHUTDOWN_COMMAND => Ok(OperatorCommand::Shutdown),
        _ => token
            .parse::<usize>()
            .map(|index| OperatorCommand::Select(SlotId::new(index)))
            .map_err(|_| SelectionError::NotANumber(token.to_string())),
    }
}

/// Checks that `slot` names an occupied slot of `table`.
pub fn validate_target<H: AsRawFd>(
    slot: SlotId,
    table: &ConnectionTable<H>,
) -> Result<SlotId, SelectionError> {
    if slot.index() >= table.capacity() {
        return Err(SelectionError::OutOfRange {
            index: slot.index(),
            capacity: table.capacity(),
        });
    }
    if !table.is_live(slot) {
        return Err(SelectionError::FreeSlot(slot));
    }
    Ok(slot)
}

/// Parses an operator-typed client number and validates it against `table`.
///
/// The table is never mutated.
pub fn select_target<H: AsRawFd>(
    line: &str,
    table: &ConnectionTable<H>,
) -> Result<SlotId, SelectionError> {
    let token = strip_line_ending(line).trim();
    let index = token
        .parse::<usize>()
        .map_err(|_| SelectionError::NotANumber(token.to_string()))?;
    validate_target(SlotId::new(index), table)
}

/// Turns a console line into the bytes to send.
///
/// Returns `None` for an empty line, which the caller reports instead of
/// sending.
pub fn compose_message(line: &str) -> Option<Vec<u8>> {
    let body = strip_line_ending(line);
    if body.is_empty() {
        None
    } else {
        Some(body.as_bytes().to_vec())
    }
}

/// Returns `true` when a composed message is the client `quit` keyword.
pub fn is_quit(body: &[u8]) -> bool {
    body == QUIT_COMMAND.as_bytes()
}
