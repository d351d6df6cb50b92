//! Control-channel framing.
//!
//! Every message exchanged with the host process is a UTF-8 JSON document
//! wrapped in a 2-byte big-endian length prefix. The codec performs no I/O:
//! the embedder feeds raw bytes in and pulls complete frames out.
//!
//! ```text
//!  0                   1
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5
//! ---------------------------------
//! |             LENGTH            |  JSON payload ...
//! ---------------------------------
//! ```

use crate::error::{Error, Result};

/// Length of the framing header (2 bytes for length prefix).
pub const FRAMING_HEADER_LEN: usize = 2;

/// Maximum message size that can be framed.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Adds the length prefix to a message.
pub fn frame_message(buf: &[u8]) -> Result<Vec<u8>> {
    if buf.len() > MAX_FRAME_SIZE {
        return Err(Error::ErrFrameTooLarge);
    }

    let mut framed = Vec::with_capacity(FRAMING_HEADER_LEN + buf.len());
    framed.extend_from_slice(&(buf.len() as u16).to_be_bytes());
    framed.extend_from_slice(buf);
    Ok(framed)
}

/// Incremental decoder for framed messages.
///
/// Feed inbound bytes with [`FrameDecoder::extend_from_slice`] and drain
/// complete frames with [`FrameDecoder::next_frame`]. Partial frames are kept
/// until the remaining bytes arrive.
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Returns the next complete frame payload, or `None` if more bytes are
    /// needed.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < FRAMING_HEADER_LEN {
            return None;
        }

        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < FRAMING_HEADER_LEN + len {
            return None;
        }

        let frame = self.buf[FRAMING_HEADER_LEN..FRAMING_HEADER_LEN + len].to_vec();
        self.buf.drain(..FRAMING_HEADER_LEN + len);
        Some(frame)
    }

    /// Number of buffered bytes not yet consumed as frames.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}
