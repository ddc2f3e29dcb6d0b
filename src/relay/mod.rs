//! Message relay between client sessions and the document worker.
//!
//! The relay moves opaque payloads. It understands only the small control
//! vocabulary the broker needs (join, leave, save-ack, error, liveness); every
//! edit and view payload is forwarded verbatim, chunked when large.
//!
//! Ordering comes from two things: each destination has exactly one
//! [`OutboundQueue`] drained in enqueue order, and a chunked message is
//! enqueued as one unit.

pub mod chunk;
pub mod framing;
pub mod protocol;
pub mod queue;

use crate::error::{Error, Result};
use chunk::{encode_message_unit, ChunkAssembler};
use framing::FrameDecoder;
use protocol::{Frame, BROADCAST};
use queue::OutboundQueue;

/// Decode every complete frame in `bytes`, reassembling chunked messages.
///
/// # Errors
///
/// [`Error::FrameCorrupt`] on the first malformed frame; frames decoded
/// before it are lost with the channel.
pub fn decode_frames(decoder: &mut FrameDecoder, assembler: &mut ChunkAssembler, bytes: &[u8]) -> Result<Vec<Frame>> {
    let mut frames = Vec::new();
    for raw in decoder.feed(bytes)? {
        if let Some(frame) = assembler.push(Frame::decode(&raw)?)? {
            frames.push(frame);
        }
    }
    Ok(frames)
}

/// A session as seen by the relay.
pub trait SessionSink {
    /// Session id.
    fn session_id(&self) -> u32;
    /// Next outbound sequence number for this session.
    fn next_outbound_seq(&mut self) -> u64;
    /// Outbound queue of the session socket.
    fn outbound(&mut self) -> &mut OutboundQueue;
}

/// Where a worker payload goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Every attached session.
    Broadcast,
    /// One session.
    Session(u32),
}

/// A worker frame after routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Payload for one or more sessions.
    Deliver {
        /// Destination.
        target: Target,
        /// Opaque payload.
        data: Vec<u8>,
    },
    /// Control frame for the broker state machine.
    Control(Frame),
}

/// Stateless relay configured with the chunk size.
#[derive(Debug, Clone, Copy)]
pub struct Relay {
    chunk_size: usize,
}

impl Relay {
    /// Create a relay that chunks payloads larger than `chunk_size`.
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }

    /// Chunk size in use.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Forward `data` from `session` (sequence `seq`) to the worker queue.
    ///
    /// # Errors
    ///
    /// [`Error::BackpressureOverflow`] if the worker queue is past its cap.
    pub fn relay_to_worker(&self, worker: &mut OutboundQueue, session: u32, seq: u64, data: &[u8]) -> Result<()> {
        worker.enqueue(encode_message_unit(session, seq, data, self.chunk_size))
    }

    /// Forward `data` to every session accepted by `predicate`.
    ///
    /// Returns the sessions whose queue overflowed; the caller disconnects
    /// them. Other sessions are unaffected by one slow consumer.
    pub fn relay_to_sessions<'a, S, I, P>(&self, sessions: I, data: &[u8], predicate: P) -> Vec<(u32, Error)>
    where
        S: SessionSink + 'a,
        I: IntoIterator<Item = &'a mut S>,
        P: Fn(&S) -> bool,
    {
        let mut failed = Vec::new();
        for session in sessions {
            if !predicate(&*session) {
                continue;
            }
            let id = session.session_id();
            let seq = session.next_outbound_seq();
            let unit = encode_message_unit(id, seq, data, self.chunk_size);
            if let Err(e) = session.outbound().enqueue(unit) {
                log::warn!("[relay] Session {id} dropped: {e}");
                failed.push((id, e));
            }
        }
        failed
    }

    /// Route one reassembled frame received from the worker.
    pub fn relay_from_worker(&self, frame: Frame) -> Routed {
        match frame {
            Frame::Message { session, data, .. } => Routed::Deliver {
                target: if session == BROADCAST { Target::Broadcast } else { Target::Session(session) },
                data,
            },
            other => Routed::Control(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::framing::FrameDecoder;

    #[derive(Debug)]
    struct FakeSession {
        id: u32,
        seq: u64,
        queue: OutboundQueue,
    }

    impl FakeSession {
        fn new(id: u32, cap: usize) -> Self {
            Self { id, seq: 0, queue: OutboundQueue::new(cap, cap) }
        }

        fn drain(&mut self) -> Vec<Frame> {
            let mut bytes = Vec::new();
            self.queue.flush(&mut bytes).unwrap();
            FrameDecoder::new()
                .feed(&bytes)
                .unwrap()
                .iter()
                .map(|raw| Frame::decode(raw).unwrap())
                .collect()
        }
    }

    impl SessionSink for FakeSession {
        fn session_id(&self) -> u32 {
            self.id
        }
        fn next_outbound_seq(&mut self) -> u64 {
            self.seq += 1;
            self.seq
        }
        fn outbound(&mut self) -> &mut OutboundQueue {
            &mut self.queue
        }
    }

    #[test]
    fn test_interleaved_chunked_messages_stay_contiguous() {
        let relay = Relay::new(8);
        let mut worker = OutboundQueue::new(1 << 20, 1 << 20);
        let big_a = vec![b'a'; 40];
        let big_b = vec![b'b'; 40];
        relay.relay_to_worker(&mut worker, 1, 1, &big_a).unwrap();
        relay.relay_to_worker(&mut worker, 2, 1, &big_b).unwrap();
        relay.relay_to_worker(&mut worker, 1, 2, b"tail").unwrap();

        let mut bytes = Vec::new();
        worker.flush(&mut bytes).unwrap();
        let frames: Vec<Frame> = FrameDecoder::new()
            .feed(&bytes)
            .unwrap()
            .iter()
            .map(|raw| Frame::decode(raw).unwrap())
            .collect();

        // header + 5 chunks of 'a', then header + 5 chunks of 'b', then the small message
        assert_eq!(frames.len(), 13);
        assert_eq!(frames[0], Frame::ChunkHeader { session: 1, seq: 1, total: 40, count: 5 });
        assert!(frames[1..6].iter().all(|f| f == &Frame::Chunk(vec![b'a'; 8])));
        assert_eq!(frames[6], Frame::ChunkHeader { session: 2, seq: 1, total: 40, count: 5 });
        assert!(frames[7..12].iter().all(|f| f == &Frame::Chunk(vec![b'b'; 8])));
        assert_eq!(frames[12], Frame::Message { session: 1, seq: 2, data: b"tail".to_vec() });
    }

    #[test]
    fn test_relay_to_sessions_honors_predicate() {
        let relay = Relay::new(64);
        let mut sessions = vec![FakeSession::new(1, 1024), FakeSession::new(2, 1024)];
        let failed = relay.relay_to_sessions(sessions.iter_mut(), b"view", |s| s.id != 1);
        assert!(failed.is_empty());
        assert!(sessions[0].drain().is_empty());
        assert_eq!(
            sessions[1].drain(),
            vec![Frame::Message { session: 2, seq: 1, data: b"view".to_vec() }]
        );
    }

    #[test]
    fn test_slow_consumer_reported_without_affecting_others() {
        let relay = Relay::new(64);
        let mut sessions = vec![FakeSession::new(1, 8), FakeSession::new(2, 1024)];
        let failed = relay.relay_to_sessions(sessions.iter_mut(), b"more than eight bytes", |_| true);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, 1);
        assert_eq!(sessions[1].drain().len(), 1);
    }

    #[test]
    fn test_relay_from_worker_routing() {
        let relay = Relay::new(64);
        assert_eq!(
            relay.relay_from_worker(Frame::Message { session: 0, seq: 4, data: b"all".to_vec() }),
            Routed::Deliver { target: Target::Broadcast, data: b"all".to_vec() }
        );
        assert_eq!(
            relay.relay_from_worker(Frame::Message { session: 9, seq: 4, data: b"one".to_vec() }),
            Routed::Deliver { target: Target::Session(9), data: b"one".to_vec() }
        );
        assert_eq!(
            relay.relay_from_worker(Frame::SaveAck { ok: true }),
            Routed::Control(Frame::SaveAck { ok: true })
        );
    }
}
