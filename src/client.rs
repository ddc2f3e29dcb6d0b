//! Blocking client for the document server.
//!
//! Used by the `client` subcommand and by end-to-end tests. One connection is
//! one session on one document.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::constants::DEFAULT_CHUNK_SIZE;
use crate::error::{Error, Result};
use crate::relay::chunk::{encode_message_unit, ChunkAssembler};
use crate::relay::decode_frames;
use crate::relay::framing::FrameDecoder;
use crate::relay::protocol::{Frame, JoinRequest};
use crate::socket::Stream;

/// A joined session.
#[derive(Debug)]
pub struct DocumentClient {
    stream: Stream,
    decoder: FrameDecoder,
    assembler: ChunkAssembler,
    pending: VecDeque<Frame>,
    session: u32,
    view_only: bool,
    chunk_size: usize,
    seq: u64,
}

impl DocumentClient {
    /// Connect to `addr` and join `document`.
    ///
    /// `addr` is `host:port` for TCP, or a filesystem path (anything
    /// containing `/`) for a Unix socket.
    ///
    /// # Errors
    ///
    /// Connection failures, or [`Error::SessionRejected`] carrying the
    /// server's reason.
    pub fn connect(addr: &str, document: &str, token: &str) -> Result<Self> {
        let stream = if addr.contains('/') {
            Stream::Unix(UnixStream::connect(addr)?)
        } else {
            Stream::Tcp(TcpStream::connect(addr)?)
        };
        Self::join(stream, document, token)
    }

    /// Join `document` over an already connected stream.
    ///
    /// # Errors
    ///
    /// See [`connect`](Self::connect).
    pub fn join(mut stream: Stream, document: &str, token: &str) -> Result<Self> {
        let join = Frame::Join(JoinRequest {
            document: document.to_string(),
            token: token.to_string(),
        });
        stream.write_all(&join.encode())?;

        let mut client = Self {
            stream,
            decoder: FrameDecoder::new(),
            assembler: ChunkAssembler::new(usize::MAX),
            pending: VecDeque::new(),
            session: 0,
            view_only: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            seq: 0,
        };
        match client.recv()? {
            Some(Frame::Joined { session, view_only }) => {
                client.session = session;
                client.view_only = view_only;
                log::debug!("[client] Joined {document} as session {session}");
                Ok(client)
            }
            Some(Frame::Error(notice)) => Err(Error::rejected(notice.reason, notice.message)),
            Some(other) => Err(Error::corrupt(format!("expected JOINED, got frame type 0x{:02x}", other.kind()))),
            None => Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
        }
    }

    /// Session id assigned by the broker.
    pub fn session(&self) -> u32 {
        self.session
    }

    /// Whether the session is view-only.
    pub fn view_only(&self) -> bool {
        self.view_only
    }

    /// Chunk outgoing payloads larger than `size`.
    pub fn set_chunk_size(&mut self, size: usize) {
        self.chunk_size = size.max(1);
    }

    /// Bound every blocking read.
    ///
    /// # Errors
    ///
    /// If the socket rejects the option.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.stream {
            Stream::Tcp(s) => s.set_read_timeout(timeout)?,
            Stream::Unix(s) => s.set_read_timeout(timeout)?,
        }
        Ok(())
    }

    /// Send an opaque edit.
    ///
    /// # Errors
    ///
    /// Write failures.
    pub fn send_edit(&mut self, data: &[u8]) -> Result<()> {
        self.seq += 1;
        for frame in encode_message_unit(self.session, self.seq, data, self.chunk_size) {
            self.stream.write_all(&frame)?;
        }
        Ok(())
    }

    /// Send a control frame.
    ///
    /// # Errors
    ///
    /// Write failures.
    pub fn send(&mut self, frame: &Frame) -> Result<()> {
        self.stream.write_all(&frame.encode())?;
        Ok(())
    }

    /// Ask the worker to save.
    ///
    /// # Errors
    ///
    /// Write failures.
    pub fn save(&mut self) -> Result<()> {
        self.send(&Frame::Save)
    }

    /// Store a blob and return its key.
    ///
    /// # Errors
    ///
    /// I/O failures, or the server closing the session.
    pub fn put_blob(&mut self, data: &[u8]) -> Result<String> {
        self.send(&Frame::BlobPut(data.to_vec()))?;
        match self.wait_for(|f| matches!(f, Frame::BlobRef(_) | Frame::Error(_)))? {
            Frame::BlobRef(key) => Ok(key),
            Frame::Error(notice) => Err(Error::rejected(notice.reason, notice.message)),
            _ => Err(Error::corrupt("unexpected blob reply")),
        }
    }

    /// Fetch a blob. `None` if the server does not have it.
    ///
    /// # Errors
    ///
    /// I/O failures, or the server closing the session.
    pub fn get_blob(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        self.send(&Frame::BlobGet(key.to_string()))?;
        match self.wait_for(|f| matches!(f, Frame::BlobData(_) | Frame::Error(_)))? {
            Frame::BlobData(data) => Ok(Some(data)),
            _ => Ok(None),
        }
    }

    /// Next frame from the server, `None` once it closed the connection.
    ///
    /// # Errors
    ///
    /// Read failures (including a read timeout) and corrupt frames.
    pub fn recv(&mut self) -> Result<Option<Frame>> {
        let mut buf = [0u8; 16 * 1024];
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }
            let n = match self.stream.read(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => 0,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                return Ok(None);
            }
            let frames = decode_frames(&mut self.decoder, &mut self.assembler, &buf[..n])?;
            self.pending.extend(frames);
        }
    }

    /// Next edit or view payload, skipping control frames. `None` once the
    /// connection closed.
    ///
    /// # Errors
    ///
    /// See [`recv`](Self::recv).
    pub fn recv_message(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.recv()? {
                Some(Frame::Message { data, .. }) => return Ok(Some(data)),
                Some(_) => {}
                None => return Ok(None),
            }
        }
    }

    /// Read until a frame matches `want`; earlier frames are kept for
    /// [`recv`](Self::recv).
    fn wait_for(&mut self, want: impl Fn(&Frame) -> bool) -> Result<Frame> {
        let mut skipped = VecDeque::new();
        let found = loop {
            match self.recv()? {
                Some(frame) if want(&frame) => break frame,
                Some(frame) => skipped.push_back(frame),
                None => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            }
        };
        skipped.append(&mut self.pending);
        self.pending = skipped;
        Ok(found)
    }

    /// Leave the document and close the connection.
    ///
    /// # Errors
    ///
    /// Write failures.
    pub fn leave(mut self) -> Result<()> {
        let session = self.session;
        self.send(&Frame::Leave { session })?;
        self.stream.shutdown();
        Ok(())
    }
}
