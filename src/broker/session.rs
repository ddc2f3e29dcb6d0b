//! One client's attachment to a document.

use std::time::{Duration, Instant};

use mio::Token;

use crate::relay::chunk::ChunkAssembler;
use crate::relay::framing::FrameDecoder;
use crate::relay::protocol::{DisconnectReason, Frame};
use crate::relay::queue::OutboundQueue;
use crate::relay::SessionSink;

/// A client session held by a [`DocumentBroker`](super::DocumentBroker).
#[derive(Debug)]
pub struct Session {
    /// Session id, unique within the broker. Never 0.
    pub id: u32,
    /// Token of the client socket in the broker's poll engine.
    pub token: Token,
    /// Whether edits from this session are refused.
    pub view_only: bool,
    /// Frames waiting to be written to the client.
    pub outbound: OutboundQueue,
    /// Decoder for bytes read from the client.
    pub decoder: FrameDecoder,
    /// Reassembles chunked client payloads.
    pub assembler: ChunkAssembler,
    /// When the session was admitted.
    pub joined_at: Instant,
    /// Last inbound frame.
    pub last_activity: Instant,
    /// The current worker has been told about this session.
    pub attached: bool,
    /// Reading from the client is paused.
    pub read_paused: bool,
    /// Set once a disconnect was decided; the socket closes after the final
    /// notice is written or the deadline passes.
    pub closing: Option<Closing>,
    /// Since when the outbound queue has been at or above high water.
    pub congested_since: Option<Instant>,
    outbound_seq: u64,
}

/// A session on its way out.
#[derive(Debug, Clone, Copy)]
pub struct Closing {
    /// Reason sent to the client.
    pub reason: DisconnectReason,
    /// Force-close after this instant even if the notice is still queued.
    pub deadline: Instant,
}

impl Session {
    /// A freshly admitted session.
    pub fn new(id: u32, token: Token, view_only: bool, outbound: OutboundQueue, max_frame_size: u32, now: Instant) -> Self {
        Self {
            id,
            token,
            view_only,
            outbound,
            decoder: FrameDecoder::with_max_frame_size(max_frame_size),
            assembler: ChunkAssembler::new(max_frame_size as usize),
            joined_at: now,
            last_activity: now,
            attached: false,
            read_paused: false,
            closing: None,
            congested_since: None,
            outbound_seq: 0,
        }
    }

    /// Time since the last inbound frame.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Queue a control frame.
    ///
    /// Returns `false` if the queue is past its cap; the caller disconnects.
    pub fn send(&mut self, frame: &Frame) -> bool {
        self.outbound.enqueue_frame(frame.encode()).is_ok()
    }

    /// Mark the session for disconnect with `reason` and queue the notice.
    ///
    /// Anything still queued for the client except a half-written frame is
    /// dropped when the queue cannot take the notice.
    pub fn begin_close(&mut self, reason: DisconnectReason, message: &str, deadline: Instant) {
        if self.closing.is_some() {
            return;
        }
        let notice = Frame::error(reason, message);
        if !self.send(&notice) {
            let dropped = self.outbound.discard_pending();
            log::debug!("[broker] Session {} dropped {dropped} queued bytes", self.id);
            let _ = self.send(&notice);
        }
        self.closing = Some(Closing { reason, deadline });
    }
}

impl SessionSink for Session {
    fn session_id(&self) -> u32 {
        self.id
    }

    fn next_outbound_seq(&mut self) -> u64 {
        self.outbound_seq += 1;
        self.outbound_seq
    }

    fn outbound(&mut self) -> &mut OutboundQueue {
        &mut self.outbound
    }
}
