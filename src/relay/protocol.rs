//! Relay protocol types and wire encoding.
//!
//! Wire format (see [`super::framing`]):
//!
//! ```text
//! [u32 LE: payload_len + 1] [u8: frame_type] [payload_bytes]
//! ```
//!
//! Frame types:
//! - `0x01` `Ready`       : `[u32 LE pid]` (worker → broker, readiness handshake)
//! - `0x02` `Shutdown`    : empty (broker → worker)
//! - `0x03` `ShutdownAck` : empty (worker → broker)
//! - `0x04` `Save`        : empty (client → broker, broker → worker)
//! - `0x05` `SaveAck`     : `[u8 ok]` (worker → broker → clients)
//! - `0x06` `Ping` / `0x07` `Pong`: empty, liveness
//! - `0x08` `Join`        : JSON [`JoinRequest`] (client → server)
//! - `0x09` `Joined`      : `[u32 LE session][u8 view_only]` (broker → client, broker → worker)
//! - `0x0A` `Leave`       : `[u32 LE session]` (client → broker, broker → worker)
//! - `0x0B` `Resync`      : empty (broker → client after a worker respawn)
//! - `0x0C` `Error`       : JSON [`ErrorNotice`] (broker → client)
//! - `0x10` `Message`     : `[u32 LE session][u64 LE seq][bytes]`
//! - `0x11` `ChunkHeader` : `[u32 LE session][u64 LE seq][u32 LE total][u32 LE count]`
//! - `0x12` `Chunk`       : `[bytes]`, follows a `ChunkHeader`
//! - `0x13` `BlobPut` / `0x16` `BlobData`: `[bytes]`
//! - `0x14` `BlobRef` / `0x15` `BlobGet` : ASCII hex key
//!
//! ## Session addressing
//!
//! On client channels the session field of `Message` is informational; the
//! broker stamps the sender's own id before relaying. On the worker channel,
//! session `0` in a worker-originated `Message` means "every session".

// Rust guideline compliant 2026-02

use serde::{Deserialize, Serialize};

use super::framing::{encode_raw, RawFrame};
use crate::error::{Error, Result};

/// Session id that addresses every session of a document.
pub const BROADCAST: u32 = 0;

// ─── Frame type constants ──────────────────────────────────────────────────

/// Frame type byte constants.
pub mod frame_type {
    /// Worker readiness handshake.
    pub const READY: u8 = 0x01;
    /// Shutdown request.
    pub const SHUTDOWN: u8 = 0x02;
    /// Shutdown acknowledgement.
    pub const SHUTDOWN_ACK: u8 = 0x03;
    /// Save request.
    pub const SAVE: u8 = 0x04;
    /// Save completion.
    pub const SAVE_ACK: u8 = 0x05;
    /// Liveness probe.
    pub const PING: u8 = 0x06;
    /// Liveness reply.
    pub const PONG: u8 = 0x07;
    /// Session join request.
    pub const JOIN: u8 = 0x08;
    /// Session admitted.
    pub const JOINED: u8 = 0x09;
    /// Session left.
    pub const LEAVE: u8 = 0x0A;
    /// Resynchronize state after a worker respawn.
    pub const RESYNC: u8 = 0x0B;
    /// Structured error / disconnect notice.
    pub const ERROR: u8 = 0x0C;
    /// Opaque edit or view payload.
    pub const MESSAGE: u8 = 0x10;
    /// Header announcing a chunked message.
    pub const CHUNK_HEADER: u8 = 0x11;
    /// One chunk of a chunked message.
    pub const CHUNK: u8 = 0x12;
    /// Store a blob.
    pub const BLOB_PUT: u8 = 0x13;
    /// Key of a stored blob.
    pub const BLOB_REF: u8 = 0x14;
    /// Fetch a blob.
    pub const BLOB_GET: u8 = 0x15;
    /// Blob contents.
    pub const BLOB_DATA: u8 = 0x16;
}

// ─── Control payloads ──────────────────────────────────────────────────────

/// Join request sent by a client as its first frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Document identifier.
    pub document: String,
    /// Authorization token.
    #[serde(default)]
    pub token: String,
}

/// Reason a client was disconnected or a request refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Authorization failed.
    Unauthorized,
    /// The worker died and could not be recovered.
    WorkerCrashed,
    /// Unsaved document state was lost.
    SavedContextLost,
    /// The server is shutting down.
    ServerShuttingDown,
    /// The document is unloading; reconnect to reopen it.
    DocumentUnloading,
    /// The client did not read fast enough.
    SlowConsumer,
    /// The client sent a malformed frame.
    ProtocolError,
    /// The document has reached its session cap.
    DocumentFull,
}

impl DisconnectReason {
    /// Stable snake_case name, as sent on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::WorkerCrashed => "worker_crashed",
            Self::SavedContextLost => "saved_context_lost",
            Self::ServerShuttingDown => "server_shutting_down",
            Self::DocumentUnloading => "document_unloading",
            Self::SlowConsumer => "slow_consumer",
            Self::ProtocolError => "protocol_error",
            Self::DocumentFull => "document_full",
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error notice payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    /// Machine-readable reason.
    pub reason: DisconnectReason,
    /// Human-readable detail.
    pub message: String,
}

// ─── Frame ─────────────────────────────────────────────────────────────────

/// A decoded relay frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Worker readiness handshake.
    Ready {
        /// Pid the worker reports for itself.
        pid: u32,
    },
    /// Ask the worker to exit.
    Shutdown,
    /// Worker is about to exit.
    ShutdownAck,
    /// Request a save.
    Save,
    /// Save finished.
    SaveAck {
        /// Whether the save succeeded.
        ok: bool,
    },
    /// Liveness probe.
    Ping,
    /// Liveness reply.
    Pong,
    /// Attach to a document.
    Join(JoinRequest),
    /// Session admitted.
    Joined {
        /// Assigned session id.
        session: u32,
        /// Whether the session is view-only.
        view_only: bool,
    },
    /// Session left.
    Leave {
        /// Session that left.
        session: u32,
    },
    /// Re-send unacknowledged edits and reload state.
    Resync,
    /// Structured error notice.
    Error(ErrorNotice),
    /// Opaque payload.
    Message {
        /// Source or target session.
        session: u32,
        /// Per-session sequence number.
        seq: u64,
        /// Payload bytes, never interpreted by the relay.
        data: Vec<u8>,
    },
    /// Announces `count` [`Frame::Chunk`]s carrying `total` bytes.
    ChunkHeader {
        /// Source or target session.
        session: u32,
        /// Per-session sequence number.
        seq: u64,
        /// Total payload length.
        total: u32,
        /// Number of chunks that follow.
        count: u32,
    },
    /// One chunk of a chunked message.
    Chunk(Vec<u8>),
    /// Store a blob.
    BlobPut(Vec<u8>),
    /// Key of a stored blob.
    BlobRef(String),
    /// Fetch a blob by key.
    BlobGet(String),
    /// Blob contents.
    BlobData(Vec<u8>),
}

impl Frame {
    /// Build an error notice frame.
    pub fn error(reason: DisconnectReason, message: impl Into<String>) -> Self {
        Self::Error(ErrorNotice {
            reason,
            message: message.into(),
        })
    }

    /// Frame type byte.
    pub fn kind(&self) -> u8 {
        match self {
            Self::Ready { .. } => frame_type::READY,
            Self::Shutdown => frame_type::SHUTDOWN,
            Self::ShutdownAck => frame_type::SHUTDOWN_ACK,
            Self::Save => frame_type::SAVE,
            Self::SaveAck { .. } => frame_type::SAVE_ACK,
            Self::Ping => frame_type::PING,
            Self::Pong => frame_type::PONG,
            Self::Join(_) => frame_type::JOIN,
            Self::Joined { .. } => frame_type::JOINED,
            Self::Leave { .. } => frame_type::LEAVE,
            Self::Resync => frame_type::RESYNC,
            Self::Error(_) => frame_type::ERROR,
            Self::Message { .. } => frame_type::MESSAGE,
            Self::ChunkHeader { .. } => frame_type::CHUNK_HEADER,
            Self::Chunk(_) => frame_type::CHUNK,
            Self::BlobPut(_) => frame_type::BLOB_PUT,
            Self::BlobRef(_) => frame_type::BLOB_REF,
            Self::BlobGet(_) => frame_type::BLOB_GET,
            Self::BlobData(_) => frame_type::BLOB_DATA,
        }
    }

    /// Encode this frame into wire-format bytes.
    pub fn encode(&self) -> Vec<u8> {
        let kind = self.kind();
        match self {
            Self::Ready { pid } => encode_raw(kind, &pid.to_le_bytes()),
            Self::Shutdown | Self::ShutdownAck | Self::Save | Self::Ping | Self::Pong | Self::Resync => {
                encode_raw(kind, &[])
            }
            Self::SaveAck { ok } => encode_raw(kind, &[u8::from(*ok)]),
            Self::Join(req) => {
                let payload = serde_json::to_vec(req).expect("serializable");
                encode_raw(kind, &payload)
            }
            Self::Joined { session, view_only } => {
                let mut payload = Vec::with_capacity(5);
                payload.extend_from_slice(&session.to_le_bytes());
                payload.push(u8::from(*view_only));
                encode_raw(kind, &payload)
            }
            Self::Leave { session } => encode_raw(kind, &session.to_le_bytes()),
            Self::Error(notice) => {
                let payload = serde_json::to_vec(notice).expect("serializable");
                encode_raw(kind, &payload)
            }
            Self::Message { session, seq, data } => {
                let mut payload = Vec::with_capacity(12 + data.len());
                payload.extend_from_slice(&session.to_le_bytes());
                payload.extend_from_slice(&seq.to_le_bytes());
                payload.extend_from_slice(data);
                encode_raw(kind, &payload)
            }
            Self::ChunkHeader { session, seq, total, count } => {
                let mut payload = Vec::with_capacity(20);
                payload.extend_from_slice(&session.to_le_bytes());
                payload.extend_from_slice(&seq.to_le_bytes());
                payload.extend_from_slice(&total.to_le_bytes());
                payload.extend_from_slice(&count.to_le_bytes());
                encode_raw(kind, &payload)
            }
            Self::Chunk(data) | Self::BlobPut(data) | Self::BlobData(data) => encode_raw(kind, data),
            Self::BlobRef(key) | Self::BlobGet(key) => encode_raw(kind, key.as_bytes()),
        }
    }

    /// Decode a raw frame.
    ///
    /// # Errors
    ///
    /// [`Error::FrameCorrupt`] for an unknown type byte, a short payload or
    /// malformed JSON.
    pub fn decode(raw: &RawFrame) -> Result<Self> {
        let p = raw.payload.as_slice();
        let frame = match raw.kind {
            frame_type::READY => Self::Ready { pid: read_u32(p, 0, "ready")? },
            frame_type::SHUTDOWN => Self::Shutdown,
            frame_type::SHUTDOWN_ACK => Self::ShutdownAck,
            frame_type::SAVE => Self::Save,
            frame_type::SAVE_ACK => {
                let ok = *p.first().ok_or_else(|| Error::corrupt("save ack frame too short"))?;
                Self::SaveAck { ok: ok != 0 }
            }
            frame_type::PING => Self::Ping,
            frame_type::PONG => Self::Pong,
            frame_type::JOIN => Self::Join(
                serde_json::from_slice(p).map_err(|e| Error::corrupt(format!("invalid join frame: {e}")))?,
            ),
            frame_type::JOINED => {
                let session = read_u32(p, 0, "joined")?;
                let view_only = *p.get(4).ok_or_else(|| Error::corrupt("joined frame too short"))?;
                Self::Joined { session, view_only: view_only != 0 }
            }
            frame_type::LEAVE => Self::Leave { session: read_u32(p, 0, "leave")? },
            frame_type::RESYNC => Self::Resync,
            frame_type::ERROR => Self::Error(
                serde_json::from_slice(p).map_err(|e| Error::corrupt(format!("invalid error frame: {e}")))?,
            ),
            frame_type::MESSAGE => {
                let session = read_u32(p, 0, "message")?;
                let seq = read_u64(p, 4, "message")?;
                Self::Message { session, seq, data: p[12..].to_vec() }
            }
            frame_type::CHUNK_HEADER => Self::ChunkHeader {
                session: read_u32(p, 0, "chunk header")?,
                seq: read_u64(p, 4, "chunk header")?,
                total: read_u32(p, 12, "chunk header")?,
                count: read_u32(p, 16, "chunk header")?,
            },
            frame_type::CHUNK => Self::Chunk(p.to_vec()),
            frame_type::BLOB_PUT => Self::BlobPut(p.to_vec()),
            frame_type::BLOB_REF => Self::BlobRef(read_key(p)?),
            frame_type::BLOB_GET => Self::BlobGet(read_key(p)?),
            frame_type::BLOB_DATA => Self::BlobData(p.to_vec()),
            other => return Err(Error::corrupt(format!("unknown frame type: 0x{other:02x}"))),
        };
        Ok(frame)
    }
}

fn read_u32(p: &[u8], at: usize, what: &str) -> Result<u32> {
    p.get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| Error::corrupt(format!("{what} frame too short: {} bytes", p.len())))
}

fn read_u64(p: &[u8], at: usize, what: &str) -> Result<u64> {
    p.get(at..at + 8)
        .map(|b| u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
        .ok_or_else(|| Error::corrupt(format!("{what} frame too short: {} bytes", p.len())))
}

fn read_key(p: &[u8]) -> Result<String> {
    if p.is_empty() || !p.iter().all(u8::is_ascii_hexdigit) {
        return Err(Error::corrupt("blob key must be non-empty ASCII hex"));
    }
    Ok(String::from_utf8_lossy(p).into_owned())
}
