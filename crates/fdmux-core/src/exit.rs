//! Process exit codes shared by every fdmux binary.

use std::process::ExitCode;

/// Named exit status of an fdmux process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitStatus {
    /// Normal termination (operator shutdown, signal, or peer closed).
    Success = 0,
    /// A multiplexer, listener, or session failure after startup.
    Runtime = 1,
    /// Missing or invalid command-line arguments.
    Usage = 2,
    /// Socket, bind, connect, or multiplexer creation failed.
    Startup = 3,
    /// The configuration file could not be read or parsed.
    Config = 4,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        ExitCode::from(status.code())
    }
}
