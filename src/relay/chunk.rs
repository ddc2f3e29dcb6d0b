//! Chunking of large payloads.
//!
//! A payload above the chunk size travels as one `ChunkHeader` followed by
//! `count` raw `Chunk` frames. The sender encodes the whole sequence as one
//! unit so a per-destination queue can append it atomically; the receiver
//! reassembles it with a [`ChunkAssembler`], which refuses anything that is
//! not the next chunk of the message in progress.

use super::protocol::Frame;
use crate::error::{Error, Result};

/// Encode `data` for `session` as one wire unit: a single `Message` frame,
/// or a `ChunkHeader` plus chunks when `data` exceeds `chunk_size`.
///
/// The returned frames must be enqueued together and in order.
pub fn encode_message_unit(session: u32, seq: u64, data: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    let chunk_size = chunk_size.max(1);
    if data.len() <= chunk_size {
        return vec![Frame::Message { session, seq, data: data.to_vec() }.encode()];
    }

    let count = data.len().div_ceil(chunk_size);
    let mut unit = Vec::with_capacity(count + 1);
    unit.push(
        Frame::ChunkHeader {
            session,
            seq,
            total: data.len() as u32,
            count: count as u32,
        }
        .encode(),
    );
    unit.extend(data.chunks(chunk_size).map(|c| Frame::Chunk(c.to_vec()).encode()));
    unit
}

#[derive(Debug)]
struct Partial {
    session: u32,
    seq: u64,
    total: usize,
    remaining: u32,
    data: Vec<u8>,
}

/// Reassembles chunked messages from a single source channel.
///
/// Frames that are not part of a chunked message pass through unchanged.
#[derive(Debug)]
pub struct ChunkAssembler {
    partial: Option<Partial>,
    max_total: usize,
}

impl ChunkAssembler {
    /// Create an assembler that refuses messages larger than `max_total` bytes.
    pub fn new(max_total: usize) -> Self {
        Self { partial: None, max_total }
    }

    /// Whether a chunked message is in progress.
    pub fn in_progress(&self) -> bool {
        self.partial.is_some()
    }

    /// Feed one decoded frame.
    ///
    /// Returns `Some(frame)` when a frame is complete: either a pass-through
    /// frame or the reassembled [`Frame::Message`].
    ///
    /// # Errors
    ///
    /// [`Error::FrameCorrupt`] if a chunk arrives without a header, another
    /// frame interrupts a chunked message, or the chunk sizes do not add up.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Frame>> {
        match frame {
            Frame::ChunkHeader { session, seq, total, count } => {
                if self.partial.is_some() {
                    return Err(Error::corrupt("chunk header inside a chunked message"));
                }
                let total = total as usize;
                if total > self.max_total {
                    return Err(Error::corrupt(format!(
                        "chunked message of {total} bytes exceeds limit of {}",
                        self.max_total
                    )));
                }
                if count == 0 {
                    if total != 0 {
                        return Err(Error::corrupt("chunk header announces data but no chunks"));
                    }
                    return Ok(Some(Frame::Message { session, seq, data: Vec::new() }));
                }
                self.partial = Some(Partial {
                    session,
                    seq,
                    total,
                    remaining: count,
                    data: Vec::with_capacity(total),
                });
                Ok(None)
            }
            Frame::Chunk(bytes) => {
                let Some(partial) = self.partial.as_mut() else {
                    return Err(Error::corrupt("chunk without header"));
                };
                if partial.data.len() + bytes.len() > partial.total {
                    return Err(Error::corrupt("chunks exceed announced length"));
                }
                partial.data.extend_from_slice(&bytes);
                partial.remaining -= 1;
                if partial.remaining > 0 {
                    return Ok(None);
                }
                let Some(done) = self.partial.take() else {
                    return Ok(None);
                };
                if done.data.len() != done.total {
                    return Err(Error::corrupt(format!(
                        "chunked message ended at {} of {} bytes",
                        done.data.len(),
                        done.total
                    )));
                }
                Ok(Some(Frame::Message { session: done.session, seq: done.seq, data: done.data }))
            }
            other => {
                if self.partial.is_some() {
                    return Err(Error::corrupt("frame interleaved inside a chunked message"));
                }
                Ok(Some(other))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::framing::FrameDecoder;

    fn decode_unit(unit: &[Vec<u8>]) -> Vec<Frame> {
        let mut decoder = FrameDecoder::new();
        unit.iter()
            .flat_map(|bytes| decoder.feed(bytes).unwrap())
            .map(|raw| Frame::decode(&raw).unwrap())
            .collect()
    }

    #[test]
    fn test_small_payload_is_single_message() {
        let unit = encode_message_unit(1, 1, b"small", 16);
        assert_eq!(unit.len(), 1);
        assert_eq!(
            decode_unit(&unit),
            vec![Frame::Message { session: 1, seq: 1, data: b"small".to_vec() }]
        );
    }

    #[test]
    fn test_large_payload_is_header_plus_chunks() {
        let data: Vec<u8> = (0..100u8).collect();
        let unit = encode_message_unit(2, 7, &data, 30);
        let frames = decode_unit(&unit);
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[0], Frame::ChunkHeader { session: 2, seq: 7, total: 100, count: 4 });

        let mut assembler = ChunkAssembler::new(1024);
        let mut out = Vec::new();
        for frame in frames {
            if let Some(done) = assembler.push(frame).unwrap() {
                out.push(done);
            }
        }
        assert_eq!(out, vec![Frame::Message { session: 2, seq: 7, data }]);
        assert!(!assembler.in_progress());
    }

    #[test]
    fn test_chunk_without_header_is_corrupt() {
        let mut assembler = ChunkAssembler::new(1024);
        assert!(matches!(assembler.push(Frame::Chunk(vec![1])), Err(Error::FrameCorrupt(_))));
    }

    #[test]
    fn test_interleaved_frame_is_corrupt() {
        let mut assembler = ChunkAssembler::new(1024);
        assembler
            .push(Frame::ChunkHeader { session: 1, seq: 1, total: 4, count: 2 })
            .unwrap();
        assembler.push(Frame::Chunk(vec![1, 2])).unwrap();
        let err = assembler
            .push(Frame::Message { session: 2, seq: 1, data: vec![9] })
            .unwrap_err();
        assert!(matches!(err, Error::FrameCorrupt(_)));
    }

    #[test]
    fn test_length_mismatch_is_corrupt() {
        let mut assembler = ChunkAssembler::new(1024);
        assembler
            .push(Frame::ChunkHeader { session: 1, seq: 1, total: 10, count: 1 })
            .unwrap();
        assert!(assembler.push(Frame::Chunk(vec![0; 4])).is_err());
    }

    #[test]
    fn test_oversize_announcement_is_corrupt() {
        let mut assembler = ChunkAssembler::new(8);
        let err = assembler
            .push(Frame::ChunkHeader { session: 1, seq: 1, total: 9, count: 1 })
            .unwrap_err();
        assert!(matches!(err, Error::FrameCorrupt(_)));
    }

    #[test]
    fn test_control_frames_pass_through() {
        let mut assembler = ChunkAssembler::new(8);
        assert_eq!(assembler.push(Frame::Ping).unwrap(), Some(Frame::Ping));
    }
}
