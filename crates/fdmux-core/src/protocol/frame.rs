//! Length-prefixed framing.
//!
//! # Frame layout
//!
//! ```text
//! ┌──────────────────────────┬─────────────────────────────┐
//! │ payload length (4 bytes) │ payload (0..=1024 bytes)    │
//! │ big-endian u32           │                             │
//! └──────────────────────────┴─────────────────────────────┘
//! ```
//!
//! A zero-length frame is legal on the wire and carries no data.  A length
//! above [`MAX_FRAME_PAYLOAD`] is a protocol error and ends the session.

use std::io::{self, Read, Write};

use thiserror::Error;

/// Size of the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest payload a frame may carry.
pub const MAX_FRAME_PAYLOAD: usize = 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame payload of {len} bytes exceeds the {max}-byte limit")]
    Oversized { len: usize, max: usize },

    #[error("connection closed in the middle of a frame")]
    Truncated,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Encodes `payload` as a complete frame.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    check_len(payload.len())?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Decodes one frame from the front of `bytes`.
///
/// Returns the payload and the number of bytes consumed, or `Ok(None)` when
/// `bytes` does not yet hold a complete frame.
pub fn decode_frame(bytes: &[u8]) -> Result<Option<(Vec<u8>, usize)>, FrameError> {
    let Some(header) = bytes.get(..FRAME_HEADER_LEN) else {
        return Ok(None);
    };
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    check_len(len)?;

    let end = FRAME_HEADER_LEN + len;
    match bytes.get(FRAME_HEADER_LEN..end) {
        Some(payload) => Ok(Some((payload.to_vec(), end))),
        None => Ok(None),
    }
}

/// Writes `payload` as one frame and returns the number of bytes put on the
/// wire, header included.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<usize, FrameError> {
    let frame = encode_frame(payload)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(frame.len())
}

/// Reads the next frame from a blocking reader.
///
/// Returns `Ok(None)` on a clean end-of-stream before any header byte.
/// End-of-stream inside a frame is [`FrameError::Truncated`].  Zero-length
/// frames are returned as empty payloads; skipping them is the caller's job.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(FrameError::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let len = u32::from_be_bytes(header) as usize;
    check_len(len)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => FrameError::Truncated,
        _ => FrameError::Io(e),
    })?;
    Ok(Some(payload))
}

fn check_len(len: usize) -> Result<(), FrameError> {
    if len > MAX_FRAME_PAYLOAD {
        return Err(FrameError::Oversized {
            len,
            max: MAX_FRAME_PAYLOAD,
        });
    }
    Ok(())
}
