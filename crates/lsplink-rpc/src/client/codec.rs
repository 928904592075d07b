//! `Content-Length` frame encoding and incremental decoding.
//!
//! The decoder never assumes a full frame per read: bytes arrive in
//! whatever chunks the transport produces, accumulate in an internal
//! buffer, and complete frames are extracted as they become available. The
//! trailing partial frame, if any, stays buffered for the next read.

use serde_json::Value;

use crate::error::{LspLinkError, Result};

const HEADER_PREFIX: &[u8] = b"Content-Length: ";
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

// A length longer than this is garbled input, not a frame.
const MAX_LENGTH_DIGITS: usize = 23;

/// Serialize `payload` into one wire frame.
///
/// `serde_json` keeps object keys sorted, so equal payloads encode to
/// identical bytes.
pub fn encode_frame(payload: &Value) -> Vec<u8> {
    let body = payload.to_string();
    let mut frame =
        Vec::with_capacity(HEADER_PREFIX.len() + HEADER_TERMINATOR.len() + 20 + body.len());
    frame.extend_from_slice(HEADER_PREFIX);
    frame.extend_from_slice(body.len().to_string().as_bytes());
    frame.extend_from_slice(HEADER_TERMINATOR);
    frame.extend_from_slice(body.as_bytes());
    frame
}

/// Incremental decoder for `Content-Length`-delimited JSON frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes read from the transport.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes currently buffered, decoded or not.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Extract the next complete frame, if the buffer holds one.
    ///
    /// `Ok(None)` means "incomplete, wait for more data"; protocol errors
    /// are unrecoverable for the stream.
    pub fn next_frame(&mut self) -> Result<Option<Value>> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        let have = self.buf.len().min(HEADER_PREFIX.len());
        if self.buf[..have] != HEADER_PREFIX[..have] {
            return Err(LspLinkError::Protocol(
                "frame does not start with Content-Length header".to_string(),
            ));
        }
        if self.buf.len() < HEADER_PREFIX.len() {
            return Ok(None);
        }

        let digits_start = HEADER_PREFIX.len();
        let mut pos = digits_start;
        while pos < self.buf.len() && self.buf[pos].is_ascii_digit() {
            pos += 1;
            if pos - digits_start > MAX_LENGTH_DIGITS {
                return Err(LspLinkError::Protocol(format!(
                    "content length exceeds {MAX_LENGTH_DIGITS} digits"
                )));
            }
        }
        if pos == self.buf.len() {
            return Ok(None);
        }
        if pos == digits_start {
            return Err(LspLinkError::Protocol(
                "content length is missing".to_string(),
            ));
        }

        let term_have = (self.buf.len() - pos).min(HEADER_TERMINATOR.len());
        if self.buf[pos..pos + term_have] != HEADER_TERMINATOR[..term_have] {
            return Err(LspLinkError::Protocol(
                "content length header is unterminated".to_string(),
            ));
        }
        if term_have < HEADER_TERMINATOR.len() {
            return Ok(None);
        }

        let digits = std::str::from_utf8(&self.buf[digits_start..pos])
            .map_err(LspLinkError::protocol)?;
        let length: usize = digits
            .parse()
            .map_err(|_| LspLinkError::Protocol(format!("content length {digits} overflows")))?;

        let body_start = pos + HEADER_TERMINATOR.len();
        let total = body_start
            .checked_add(length)
            .ok_or_else(|| LspLinkError::Protocol(format!("content length {digits} overflows")))?;
        if self.buf.len() < total {
            return Ok(None);
        }

        let payload = serde_json::from_slice(&self.buf[body_start..total])
            .map_err(|err| LspLinkError::Protocol(format!("invalid JSON body: {err}")))?;
        self.buf.drain(..total);
        Ok(Some(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_all(decoder: &mut FrameDecoder) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Some(frame) = decoder.next_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_round_trip() {
        let payload = json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}});
        let mut decoder = FrameDecoder::new();
        decoder.push(&encode_frame(&payload));
        assert_eq!(decode_all(&mut decoder), vec![payload]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_encoding_is_byte_reproducible() {
        let payload = json!({"b": 2, "a": 1});
        assert_eq!(encode_frame(&payload), encode_frame(&payload));
        assert_eq!(
            encode_frame(&payload),
            b"Content-Length: 13\r\n\r\n{\"a\":1,\"b\":2}".to_vec()
        );
    }

    #[test]
    fn test_frame_split_across_two_reads() {
        let wire = b"Content-Length: 13\r\n\r\n{\"a\":1,\"b\":2}";
        let mut decoder = FrameDecoder::new();

        decoder.push(&wire[..wire.len() / 2]);
        assert!(decoder.next_frame().unwrap().is_none());

        decoder.push(&wire[wire.len() / 2..]);
        assert_eq!(
            decoder.next_frame().unwrap(),
            Some(json!({"a": 1, "b": 2}))
        );
    }

    #[test]
    fn test_single_byte_delivery() {
        let payload = json!({"jsonrpc": "2.0", "method": "initialized", "params": {}});
        let wire = encode_frame(&payload);
        let mut decoder = FrameDecoder::new();

        let mut frames = Vec::new();
        for byte in wire {
            decoder.push(&[byte]);
            while let Some(frame) = decoder.next_frame().unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames, vec![payload]);
    }

    #[test]
    fn test_two_frames_in_one_push() {
        let first = json!({"id": 1});
        let second = json!({"id": 2});
        let mut wire = encode_frame(&first);
        wire.extend_from_slice(&encode_frame(&second));

        let mut decoder = FrameDecoder::new();
        decoder.push(&wire);
        assert_eq!(decode_all(&mut decoder), vec![first, second]);
    }

    #[test]
    fn test_remainder_stays_buffered() {
        let first = json!({"id": 1});
        let mut wire = encode_frame(&first);
        wire.extend_from_slice(b"Content-Len");

        let mut decoder = FrameDecoder::new();
        decoder.push(&wire);
        assert_eq!(decoder.next_frame().unwrap(), Some(first));
        assert!(decoder.next_frame().unwrap().is_none());
        assert_eq!(decoder.buffered(), b"Content-Len".len());
    }

    #[test]
    fn test_bad_header_prefix_is_rejected_early() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"Content-Type");
        assert!(matches!(
            decoder.next_frame(),
            Err(LspLinkError::Protocol(_))
        ));
    }

    #[test]
    fn test_length_digit_run_is_bounded() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"Content-Length: 111111111111111111111111");
        assert!(matches!(
            decoder.next_frame(),
            Err(LspLinkError::Protocol(_))
        ));
    }

    #[test]
    fn test_missing_length_is_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"Content-Length: \r\n\r\n");
        assert!(matches!(
            decoder.next_frame(),
            Err(LspLinkError::Protocol(_))
        ));
    }

    #[test]
    fn test_bad_terminator_is_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"Content-Length: 2\r\nXX{}");
        assert!(matches!(
            decoder.next_frame(),
            Err(LspLinkError::Protocol(_))
        ));
    }

    #[test]
    fn test_unparsable_body_is_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"Content-Length: 4\r\n\r\nnope");
        assert!(matches!(
            decoder.next_frame(),
            Err(LspLinkError::Protocol(_))
        ));
    }

    #[test]
    fn test_utf8_body_length_is_in_bytes() {
        let payload = json!({"text": "héllo"});
        let wire = encode_frame(&payload);
        let mut decoder = FrameDecoder::new();
        decoder.push(&wire);
        assert_eq!(decoder.next_frame().unwrap(), Some(payload));
    }
}
