//! Terminal-style codec for ELM327 adapters
//!
//! The adapter speaks an interactive AT-command convention with no length
//! prefix:
//! ```text
//! outbound: <command text>\r
//! inbound:  <response text>[\r|\n]*\r>
//! ```
//!
//! Inbound notification chunks are accumulated as text. A frame is complete
//! as soon as the buffer holds a prompt (`>`) or a carriage return; the whole
//! buffer is then normalized into one response and cleared.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Prompt printed by the adapter when it is ready for the next command
pub const PROMPT: u8 = b'>';

/// Command terminator
pub const CARRIAGE_RETURN: u8 = b'\r';

/// Maximum unterminated text kept before the buffer is discarded
pub const MAX_FRAME_SIZE: usize = 4096;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes without terminator (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),
}

/// Encode a command for the adapter: its text followed by a carriage return
pub fn encode_command(command: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(command.len() + 1);
    buf.put_slice(command.as_bytes());
    buf.put_u8(CARRIAGE_RETURN);
    buf.freeze()
}

/// Strip line terminators, prompts and surrounding whitespace from a raw frame
pub fn normalize(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, '\r' | '\n' | '>'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Accumulates notification chunks into complete responses
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256),
        }
    }

    /// Add a notification chunk to the buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to take a complete response from the buffer
    ///
    /// Returns:
    /// - `Ok(Some(text))` if a terminator arrived and the normalized text is non-empty
    /// - `Ok(None)` if more data is needed, or the completed frame was blank
    /// - `Err(...)` if the buffer grew past `MAX_FRAME_SIZE` without a terminator
    ///   (the buffer is discarded)
    pub fn decode_next(&mut self) -> Result<Option<String>, CodecError> {
        let complete = self
            .buffer
            .iter()
            .any(|&b| b == PROMPT || b == CARRIAGE_RETURN);

        if !complete {
            if self.buffer.len() > MAX_FRAME_SIZE {
                let len = self.buffer.len();
                self.buffer.clear();
                return Err(CodecError::FrameTooLarge(len));
            }
            return Ok(None);
        }

        let raw = self.buffer.split();
        let text = normalize(&String::from_utf8_lossy(&raw));

        if text.is_empty() {
            Ok(None)
        } else {
            Ok(Some(text))
        }
    }

    /// Drop any partial frame
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Get the current buffer length (for debugging)
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}
