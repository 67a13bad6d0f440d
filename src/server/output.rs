//! Terminal output framing
//!
//! PTY reads split multi-byte characters at arbitrary points. The encoder
//! carries an incomplete UTF-8 tail over to the next chunk so text stays
//! text; chunks that are not valid UTF-8 at all go out base64-encoded.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::ServerMessage;

/// Stateful encoder for one output stream
#[derive(Debug, Default)]
pub struct OutputEncoder {
    pending: Vec<u8>,
}

impl OutputEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a chunk; `None` when everything was held back
    pub fn encode(&mut self, chunk: &[u8]) -> Option<ServerMessage> {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(chunk);
        if buf.is_empty() {
            return None;
        }

        match std::str::from_utf8(&buf) {
            Ok(text) => Some(ServerMessage::output_text(text)),
            // Truncated sequence at the end: emit the valid prefix, keep the rest
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                self.pending = buf.split_off(valid);
                if buf.is_empty() {
                    return None;
                }
                Some(ServerMessage::output_text(String::from_utf8_lossy(&buf)))
            }
            Err(_) => Some(ServerMessage::output_base64(STANDARD.encode(&buf))),
        }
    }

    /// Emit whatever is still held back
    pub fn flush(&mut self) -> Option<ServerMessage> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(ServerMessage::output_base64(STANDARD.encode(rest)))
    }
}
