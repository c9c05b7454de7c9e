//! Per-connection receive and send on non-blocking sockets.
//!
//! # Receive
//!
//! A readiness event only promises that *some* data (or end-of-stream) is
//! waiting.  [`receive_into`] keeps reading until one of:
//!
//! - the buffer reaches its capacity (the rest is picked up on the next,
//!   level-triggered, readiness event),
//! - the socket reports would-block,
//! - the peer closed its write side (`read` returned 0).
//!
//! Bytes read before end-of-stream stay in the buffer so the caller can
//! deliver them before tearing the connection down.
//!
//! # Send
//!
//! [`send`] makes a single write attempt.  A short write is returned as-is
//! and is not retried; a would-block is a zero-length short write.

use std::io::{self, Read, Write};

/// Result of one [`receive_into`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Bytes appended to the buffer by this call.
    pub appended: usize,
    /// The peer closed its write side.
    pub end_of_stream: bool,
}

/// Bytes gathered by [`receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub bytes: Vec<u8>,
    pub end_of_stream: bool,
}

/// Reads from `reader` into `buf` until `buf.len() == capacity`,
/// would-block, or end-of-stream.
///
/// Interrupted reads are retried.  Any other error is returned; bytes
/// appended before the error remain in `buf`.
pub fn receive_into<R: Read>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    capacity: usize,
) -> io::Result<ReadOutcome> {
    let start = buf.len();
    let mut end_of_stream = false;

    while buf.len() < capacity {
        let filled = buf.len();
        buf.resize(capacity, 0);
        let result = reader.read(&mut buf[filled..]);
        match result {
            Ok(0) => {
                buf.truncate(filled);
                end_of_stream = true;
                break;
            }
            Ok(n) => buf.truncate(filled + n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => buf.truncate(filled),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                buf.truncate(filled);
                break;
            }
            Err(e) => {
                buf.truncate(filled);
                return Err(e);
            }
        }
    }

    Ok(ReadOutcome {
        appended: buf.len() - start,
        end_of_stream,
    })
}

/// Convenience wrapper around [`receive_into`] with a fresh buffer.
pub fn receive<R: Read>(reader: &mut R, capacity: usize) -> io::Result<Received> {
    let mut bytes = Vec::with_capacity(capacity);
    let outcome = receive_into(reader, &mut bytes, capacity)?;
    Ok(Received {
        bytes,
        end_of_stream: outcome.end_of_stream,
    })
}

/// Writes `bytes` with a single attempt and returns how many were accepted.
///
/// Short writes are not retried.  Would-block returns `Ok(0)`.  Interrupted
/// writes are retried since nothing was transferred.
pub fn send<W: Write>(writer: &mut W, bytes: &[u8]) -> io::Result<usize> {
    if bytes.is_empty() {
        return Ok(0);
    }
    loop {
        match writer.write(bytes) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
            Err(e) => return Err(e),
        }
    }
}
