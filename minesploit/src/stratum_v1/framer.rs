//! Newline framing for the Stratum byte stream.
//!
//! A TCP read can deliver half a message, several messages, or a message
//! and a half. [`LineFramer`] accumulates bytes and yields one frame per
//! `\n`, excluding the newline itself. Frames made only of whitespace are
//! dropped. Anything else, including a trailing `\r`, is handed out exactly
//! as received so relays can forward frames without touching them.
//!
//! The framer is usable two ways:
//!
//! - push-style through [`LineFramer::feed`], convenient for tests and for
//!   callers that already own a read loop
//! - as a [`Decoder`] under [`FramedRead`](tokio_util::codec::FramedRead),
//!   which is how every socket in this crate is read

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::tracing::prelude::*;

/// Accumulates raw bytes and splits them into newline-terminated frames.
///
/// There is no line-length limit; a peer that never sends `\n` grows the
/// buffer until the connection ends.
#[derive(Debug, Default)]
pub struct LineFramer {
    /// Bytes received through `feed` that do not yet form a complete frame.
    /// Unused in `Decoder` mode, where the caller owns the buffer.
    pending: BytesMut,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `data` and return every frame it completed, in order.
    ///
    /// Never blocks. The trailing partial frame, if any, stays buffered for
    /// the next call.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = next_frame(&mut self.pending) {
            frames.push(frame);
        }
        frames
    }

    /// Number of buffered bytes not yet part of a complete frame.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Signal end of input. Discards the buffered partial frame and returns
    /// how many bytes were thrown away.
    pub fn finish(&mut self) -> usize {
        let discarded = self.pending.len();
        if discarded > 0 {
            debug!(bytes = discarded, "Discarding unterminated frame at end of stream");
        }
        self.pending.clear();
        discarded
    }
}

/// Split the next non-blank frame off the front of `src`.
fn next_frame(src: &mut BytesMut) -> Option<Bytes> {
    loop {
        let newline = src.iter().position(|b| *b == b'\n')?;
        let mut line = src.split_to(newline + 1);
        line.truncate(newline);

        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        return Some(line.freeze());
    }
}

impl Decoder for LineFramer {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(next_frame(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = next_frame(src) {
            return Ok(Some(frame));
        }

        // A partial frame at EOF is never parsed
        if !src.is_empty() {
            debug!(bytes = src.len(), "Discarding unterminated frame at end of stream");
            src.clear();
        }
        Ok(None)
    }
}
