//! Operator console input as a multiplexed source.
//!
//! The console is watched by the same multiplexer as the sockets, so it must
//! never be read through a user-space buffer: bytes sitting in a
//! `BufReader` are invisible to `select`/`poll`/`epoll`, and the next wait
//! would block even though a whole line is already in memory.  Instead each
//! readiness event triggers exactly one raw `read`, and a [`LineBuffer`]
//! splits the result into lines.

use std::io::{self, BufRead, Read, Write};
use std::os::fd::{AsRawFd, RawFd};

use fdmux_core::compose_message;

/// Longest line kept before it is flushed without a newline.
pub const MAX_LINE_LEN: usize = 4096;

/// Splits a byte stream into text lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns every complete line, without its line
    /// ending.  A run longer than [`MAX_LINE_LEN`] with no newline is
    /// returned as a line of its own.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();

        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(to_line(&raw[..raw.len() - 1]));
        }
        while self.pending.len() > MAX_LINE_LEN {
            let raw: Vec<u8> = self.pending.drain(..MAX_LINE_LEN).collect();
            lines.push(to_line(&raw));
        }
        lines
    }

    /// Returns the unterminated remainder, if any.  Called at end-of-file.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(to_line(&raw))
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

fn to_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Standard input read with raw `read(2)` calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinSource;

impl Read for StdinSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buf is a valid writable slice of buf.len() bytes for the
        // duration of the call; descriptor 0 is owned by the process.
        let rc = unsafe {
            libc::read(
                libc::STDIN_FILENO,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }
}

impl AsRawFd for StdinSource {
    fn as_raw_fd(&self) -> RawFd {
        libc::STDIN_FILENO
    }
}

/// Lines produced by one console read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsoleInput {
    pub lines: Vec<String>,
    /// End-of-file was reached; the console should leave the interest set.
    pub closed: bool,
}

/// A console source plus its line buffer.
#[derive(Debug)]
pub struct Console<R> {
    source: R,
    lines: LineBuffer,
    closed: bool,
}

impl Console<StdinSource> {
    pub fn stdin() -> Self {
        Self::new(StdinSource)
    }
}

impl<R: Read + AsRawFd> Console<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            lines: LineBuffer::new(),
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn descriptor(&self) -> RawFd {
        self.source.as_raw_fd()
    }

    /// Performs one read and returns the complete lines it produced.
    ///
    /// Call only after the multiplexer reported the console readable, since
    /// the source may be a blocking descriptor.
    pub fn read_available(&mut self) -> io::Result<ConsoleInput> {
        if self.closed {
            return Ok(ConsoleInput {
                lines: Vec::new(),
                closed: true,
            });
        }

        let mut chunk = [0u8; 1024];
        match self.source.read(&mut chunk) {
            Ok(0) => {
                self.closed = true;
                Ok(ConsoleInput {
                    lines: self.lines.finish().into_iter().collect(),
                    closed: true,
                })
            }
            Ok(n) => Ok(ConsoleInput {
                lines: self.lines.push(&chunk[..n]),
                closed: false,
            }),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) =>
            {
                Ok(ConsoleInput::default())
            }
            Err(e) => Err(e),
        }
    }
}

/// Blocking read of the next non-empty console line, for the programs that
/// do not multiplex their console.
///
/// Empty lines are reported on `out` and skipped.  Returns `Ok(None)` at
/// end-of-file.
pub fn next_message<I: BufRead, O: Write>(input: &mut I, out: &mut O) -> io::Result<Option<Vec<u8>>> {
    let mut line = String::new();
    loop {
        line.clear();
        if input.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        match compose_message(&line) {
            Some(body) => return Ok(Some(body)),
            None => {
                writeln!(out, "input is empty; nothing sent")?;
                out.flush()?;
            }
        }
    }
}
