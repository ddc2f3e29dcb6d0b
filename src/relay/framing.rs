//! Length-prefixed frame codec.
//!
//! Every channel (client sessions and the worker control socket) carries the
//! same framing:
//!
//! ```text
//! [u32 LE length] [u8 type] [payload: length-1 bytes]
//! ```
//!
//! This layer only splits the byte stream; [`super::protocol`] gives the type
//! byte and payload their meaning.

use crate::constants::DEFAULT_MAX_FRAME_SIZE;
use crate::error::{Error, Result};

/// Bytes of the length prefix.
pub const HEADER_LEN: usize = 4;

/// One undecoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Frame type byte.
    pub kind: u8,
    /// Payload following the type byte.
    pub payload: Vec<u8>,
}

/// Encode a raw frame with type byte and payload.
pub fn encode_raw(kind: u8, payload: &[u8]) -> Vec<u8> {
    let length = (payload.len() + 1) as u32; // +1 for type byte
    let mut buf = Vec::with_capacity(HEADER_LEN + 1 + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.push(kind);
    buf.extend_from_slice(payload);
    buf
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and extract complete frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_size: u32,
}

impl FrameDecoder {
    /// Create a decoder using the default maximum frame size.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a decoder rejecting frames longer than `max_frame_size`.
    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_size,
        }
    }

    /// Feed bytes into the decoder and extract all complete frames.
    ///
    /// Incomplete data is buffered for the next call.
    ///
    /// # Errors
    ///
    /// [`Error::FrameCorrupt`] on a zero or oversize length prefix. The
    /// decoder is unusable afterwards; the channel must be closed.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<RawFrame>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        let mut consumed = 0;

        loop {
            let rest = &self.buf[consumed..];
            if rest.len() < HEADER_LEN {
                break;
            }

            let length = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
            if length == 0 {
                return Err(Error::corrupt("zero length frame"));
            }
            if length > self.max_frame_size {
                return Err(Error::corrupt(format!(
                    "frame too large: {length} bytes (max {})",
                    self.max_frame_size
                )));
            }

            let total = HEADER_LEN + length as usize;
            if rest.len() < total {
                break; // Incomplete frame, wait for more data
            }

            frames.push(RawFrame {
                kind: rest[HEADER_LEN],
                payload: rest[HEADER_LEN + 1..total].to_vec(),
            });
            consumed += total;
        }

        self.buf.drain(..consumed);
        Ok(frames)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Take the buffered, not yet decoded bytes.
    ///
    /// Used when a connection is handed from one owner to another mid-stream.
    pub fn take_buffered(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiple_frames_in_single_feed() {
        let mut buf = encode_raw(0x10, b"one");
        buf.extend_from_slice(&encode_raw(0x06, b""));
        buf.extend_from_slice(&encode_raw(0x12, b"three"));

        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&buf).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], RawFrame { kind: 0x10, payload: b"one".to_vec() });
        assert_eq!(frames[1], RawFrame { kind: 0x06, payload: Vec::new() });
        assert_eq!(frames[2].payload, b"three");
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_partial_frame_reassembly() {
        let encoded = encode_raw(0x10, b"split across reads");
        let mut decoder = FrameDecoder::new();

        let mid = encoded.len() / 2;
        assert!(decoder.feed(&encoded[..mid]).unwrap().is_empty());
        assert!(decoder.has_partial());

        let frames = decoder.feed(&encoded[mid..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"split across reads");
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_byte_at_a_time() {
        let encoded = encode_raw(0x07, b"xy");
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in &encoded {
            frames.extend(decoder.feed(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(frames, vec![RawFrame { kind: 0x07, payload: b"xy".to_vec() }]);
    }

    #[test]
    fn test_zero_length_is_corrupt() {
        let mut decoder = FrameDecoder::new();
        let err = decoder.feed(&[0, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, Error::FrameCorrupt(_)));
    }

    #[test]
    fn test_oversize_frame_is_corrupt() {
        let mut decoder = FrameDecoder::with_max_frame_size(8);
        let err = decoder.feed(&encode_raw(0x10, &[0u8; 16])).unwrap_err();
        assert!(matches!(err, Error::FrameCorrupt(_)));
    }

    #[test]
    fn test_take_buffered_returns_partial_tail() {
        let mut bytes = encode_raw(0x08, b"join");
        bytes.extend_from_slice(&[5, 0]);
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.feed(&bytes).unwrap().len(), 1);
        assert_eq!(decoder.take_buffered(), vec![5, 0]);
        assert!(!decoder.has_partial());
    }
}
