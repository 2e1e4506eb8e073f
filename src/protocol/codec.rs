//! Newline-delimited JSON framing.
//!
//! One envelope per line, LF-terminated. Readers keep a growing byte
//! buffer: each inbound chunk is appended, complete lines are parsed,
//! and the trailing partial fragment waits for the next chunk. Empty
//! lines are ignored.

use thiserror::Error;

use super::Envelope;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Encode one envelope as a single line.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(envelope)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode a single line (without the terminator).
pub fn decode_line(line: &str) -> Result<Envelope, DecodeError> {
    Ok(serde_json::from_str(line)?)
}

/// Incremental decoder for a byte stream split at arbitrary chunk
/// boundaries.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns a decode result per complete line.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Envelope, DecodeError>> {
        self.buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            match std::str::from_utf8(line) {
                Ok(text) => {
                    let text = text.trim();
                    if text.is_empty() {
                        continue;
                    }
                    out.push(decode_line(text));
                }
                Err(err) => out.push(Err(DecodeError::Utf8(err))),
            }
        }
        out
    }

    /// Bytes held back waiting for a line terminator.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Kind, Role};
    use serde_json::json;

    fn envelope(n: u64) -> Envelope {
        let mut envelope = Envelope::new(
            Kind::Yap,
            "agent-1",
            Role::Producer,
            json!({"id": format!("y{n}"), "message": "m", "timestamp": n}),
        );
        envelope.sequence = Some(n);
        envelope
    }

    #[test]
    fn reassembles_across_arbitrary_chunk_boundaries() {
        let envelopes: Vec<Envelope> = (0..5).map(envelope).collect();
        let mut wire = Vec::new();
        for e in &envelopes {
            wire.extend_from_slice(&encode(e).unwrap());
        }

        // Feed in every chunk size from one byte up to the whole blob.
        for chunk_size in 1..=wire.len() {
            let mut decoder = LineDecoder::new();
            let mut parsed = Vec::new();
            for chunk in wire.chunks(chunk_size) {
                for item in decoder.push(chunk) {
                    parsed.push(item.unwrap());
                }
            }
            assert_eq!(parsed, envelopes, "chunk size {chunk_size}");
            assert_eq!(decoder.pending_len(), 0);
        }
    }

    #[test]
    fn partial_line_is_retained() {
        let mut decoder = LineDecoder::new();
        let bytes = encode(&envelope(1)).unwrap();
        let (head, tail) = bytes.split_at(bytes.len() / 2);

        assert!(decoder.push(head).is_empty());
        assert!(decoder.pending_len() > 0);

        let items = decoder.push(tail);
        assert_eq!(items.len(), 1);
        assert!(items[0].is_ok());
    }

    #[test]
    fn empty_lines_are_ignored() {
        let mut decoder = LineDecoder::new();
        let items = decoder.push(b"\n\n  \n");
        assert!(items.is_empty());
    }

    #[test]
    fn malformed_line_yields_error_and_stream_continues() {
        let mut decoder = LineDecoder::new();
        let mut wire = b"{not json}\n".to_vec();
        wire.extend_from_slice(&encode(&envelope(2)).unwrap());

        let items = decoder.push(&wire);
        assert_eq!(items.len(), 2);
        assert!(items[0].is_err());
        assert!(items[1].is_ok());
    }
}
