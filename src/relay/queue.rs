//! Per-destination outbound queue.
//!
//! Frames are written strictly in enqueue order. A unit (one frame, or a
//! chunk header plus all its chunks) is appended in one call, so frames of two
//! logical messages never interleave on the wire.
//!
//! Two watermarks bound memory:
//! - `high_water`: the destination is congested; callers stop feeding it
//!   (pause the source socket) until the queue drains.
//! - `hard_cap`: an enqueue that would cross it fails with
//!   [`Error::BackpressureOverflow`] and the destination is dropped.

use std::collections::VecDeque;
use std::io::{self, Write};

use crate::error::{Error, Result};

/// Outbound byte queue for one socket.
#[derive(Debug)]
pub struct OutboundQueue {
    frames: VecDeque<Vec<u8>>,
    /// Bytes of the front frame already written.
    offset: usize,
    buffered: usize,
    high_water: usize,
    hard_cap: usize,
}

impl OutboundQueue {
    /// Create an empty queue with the given watermarks.
    pub fn new(high_water: usize, hard_cap: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            offset: 0,
            buffered: 0,
            high_water,
            hard_cap: hard_cap.max(high_water),
        }
    }

    /// Bytes waiting to be written.
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Whether the queue has reached its high-water mark.
    pub fn is_congested(&self) -> bool {
        self.buffered >= self.high_water
    }

    /// Append a single encoded frame.
    pub fn enqueue_frame(&mut self, frame: Vec<u8>) -> Result<()> {
        self.enqueue(vec![frame])
    }

    /// Append every frame of `unit`, or none of them.
    ///
    /// # Errors
    ///
    /// [`Error::BackpressureOverflow`] if the unit would push the queue past
    /// its hard cap. The queue is left unchanged.
    pub fn enqueue(&mut self, unit: Vec<Vec<u8>>) -> Result<()> {
        let incoming: usize = unit.iter().map(Vec::len).sum();
        if self.buffered + incoming > self.hard_cap {
            return Err(Error::BackpressureOverflow {
                buffered: self.buffered,
                incoming,
                cap: self.hard_cap,
            });
        }
        self.buffered += incoming;
        self.frames.extend(unit.into_iter().filter(|f| !f.is_empty()));
        Ok(())
    }

    /// Drop every queued frame except a partially written one, so the
    /// stream stays on a frame boundary. Returns the bytes dropped.
    pub fn discard_pending(&mut self) -> usize {
        let keep = if self.offset > 0 { 1 } else { 0 };
        let dropped: usize = self.frames.iter().skip(keep).map(Vec::len).sum();
        self.frames.truncate(keep);
        self.buffered -= dropped;
        dropped
    }

    /// Write as much as the non-blocking `writer` accepts.
    ///
    /// Returns `Ok(true)` once the queue is empty, `Ok(false)` if the writer
    /// would block with data still pending.
    pub fn flush(&mut self, writer: &mut impl Write) -> io::Result<bool> {
        while let Some(front) = self.frames.front() {
            match writer.write(&front[self.offset..]) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "peer stopped accepting data")),
                Ok(n) => {
                    self.offset += n;
                    self.buffered -= n;
                    if self.offset == front.len() {
                        self.frames.pop_front();
                        self.offset = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}
