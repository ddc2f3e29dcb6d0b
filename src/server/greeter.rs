//! Connection greeting.
//!
//! A freshly accepted client must send one `JOIN` frame naming the document
//! and carrying its token. The greeter reads it on the acceptor engine,
//! authorizes it, and hands the connection to the registry together with any
//! bytes that arrived after the join.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::broker::registry::{reject, BrokerRegistry, PendingJoin};
use crate::constants::READ_BUDGET;
use crate::context::ProcessContext;
use crate::error::Error;
use crate::poll::{Disposition, PollContext, SocketHandler};
use crate::relay::framing::{encode_raw, FrameDecoder};
use crate::relay::protocol::{DisconnectReason, Frame, JoinRequest};
use crate::socket::{read_available, Stream};

/// Longest document identifier accepted in a join.
const MAX_DOCUMENT_ID: usize = 255;

/// Waits for a client's join frame.
#[derive(Debug)]
pub(crate) struct Greeter {
    stream: Option<Stream>,
    decoder: FrameDecoder,
    registry: BrokerRegistry,
    process: Arc<ProcessContext>,
    deadline: Instant,
    settled: Arc<AtomicBool>,
    peer_closed: bool,
}

impl Greeter {
    pub(crate) fn new(
        stream: Stream,
        registry: BrokerRegistry,
        process: Arc<ProcessContext>,
        deadline: Instant,
        settled: Arc<AtomicBool>,
    ) -> Self {
        let decoder = FrameDecoder::with_max_frame_size(process.config.max_frame_size);
        Self {
            stream: Some(stream),
            decoder,
            registry,
            process,
            deadline,
            settled,
            peer_closed: false,
        }
    }

    fn refuse(&mut self, reason: DisconnectReason, message: &str) -> Disposition {
        if let Some(stream) = self.stream.take() {
            log::info!("[server] Refusing connection: {message}");
            reject(stream, &Error::rejected(reason, message));
        }
        Disposition::Close
    }

    fn admit(&mut self, join: JoinRequest, leftover: Vec<u8>) -> Disposition {
        if join.document.is_empty() || join.document.len() > MAX_DOCUMENT_ID {
            return self.refuse(DisconnectReason::ProtocolError, "invalid document identifier");
        }
        let decision = self.process.authorizer.authorize(&join.document, &join.token);
        if !decision.allowed {
            return self.refuse(DisconnectReason::Unauthorized, "not authorized for this document");
        }
        let Some(stream) = self.stream.take() else {
            return Disposition::Close;
        };
        log::debug!("[server] Join for {} (view_only={})", join.document, decision.view_only);
        self.registry.dispatch(PendingJoin {
            document: join.document,
            decision,
            stream,
            leftover,
        });
        Disposition::Close
    }
}

impl SocketHandler for Greeter {
    fn raw_fd(&self) -> RawFd {
        self.stream.as_ref().map_or(-1, AsRawFd::as_raw_fd)
    }

    fn on_readable(&mut self, _ctx: &mut PollContext) -> io::Result<Disposition> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(Disposition::Close);
        };
        let mut buf = Vec::new();
        let status = read_available(stream, &mut buf, READ_BUDGET)?;

        let frames = match self.decoder.feed(&buf) {
            Ok(frames) => frames,
            Err(e) => return Ok(self.refuse(DisconnectReason::ProtocolError, &e.to_string())),
        };
        let mut frames = frames.into_iter();
        let Some(first) = frames.next() else {
            if status.eof {
                self.peer_closed = true;
                return Ok(Disposition::Close);
            }
            return Ok(if status.exhausted_budget { Disposition::Again } else { Disposition::Continue });
        };

        let join = match Frame::decode(&first) {
            Ok(Frame::Join(join)) => join,
            Ok(other) => {
                let message = format!("expected JOIN, got frame type 0x{:02x}", other.kind());
                return Ok(self.refuse(DisconnectReason::ProtocolError, &message));
            }
            Err(e) => return Ok(self.refuse(DisconnectReason::ProtocolError, &e.to_string())),
        };

        let mut leftover = Vec::new();
        for raw in frames {
            leftover.extend(encode_raw(raw.kind, &raw.payload));
        }
        leftover.extend(self.decoder.take_buffered());
        Ok(self.admit(join, leftover))
    }

    fn on_disconnect(&mut self, ctx: &mut PollContext) {
        self.settled.store(true, Ordering::Release);
        let Some(stream) = self.stream.take() else {
            return;
        };
        if self.peer_closed {
            stream.shutdown();
        } else if ctx.now() >= self.deadline {
            reject(stream, &Error::rejected(DisconnectReason::ProtocolError, "no join received in time"));
        } else {
            reject(stream, &Error::rejected(DisconnectReason::ServerShuttingDown, "server is shutting down"));
        }
    }
}
