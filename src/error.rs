//! Error taxonomy for the document server.
//!
//! Every failure that can reach a client or a broker state transition is one
//! of these variants. Application edges (`main`, config loading, server
//! bootstrap) wrap them in `anyhow` with context; inside the engine they are
//! matched on to decide between a session-level disconnect and a broker-level
//! unload.

// Rust guideline compliant 2026-02

use std::io;

use thiserror::Error;

use crate::relay::protocol::DisconnectReason;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Error raised by the poll engine, supervisor, broker or relay.
#[derive(Debug, Error)]
pub enum Error {
    /// The worker did not send its readiness handshake in time.
    #[error("worker {pid} did not complete handshake within {timeout_secs}s")]
    SpawnTimeout {
        /// Process id of the worker that timed out.
        pid: u32,
        /// Configured handshake timeout.
        timeout_secs: u64,
    },

    /// A second worker was requested while one is still live.
    #[error("document {document} already has a live worker (pid {pid})")]
    SpawnRejected {
        /// Document the spawn was requested for.
        document: String,
        /// Pid of the worker that is still live.
        pid: u32,
    },

    /// The worker process could not be started.
    #[error("could not start worker for {document}: {source}")]
    SpawnFailed {
        /// Document the worker was for.
        document: String,
        /// Launcher failure.
        source: io::Error,
    },

    /// The syscall sandbox mechanism is not available on this host.
    #[error("syscall sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    /// The worker process exited or was killed unexpectedly.
    #[error("worker {pid} crashed")]
    WorkerCrashed {
        /// Process id of the dead worker.
        pid: u32,
    },

    /// The worker spoke before or instead of its readiness handshake.
    #[error("handshake protocol violation: {0}")]
    HandshakeProtocolViolation(String),

    /// Session admission refused.
    #[error("session rejected: {message}")]
    SessionRejected {
        /// Reason code sent to the client.
        reason: DisconnectReason,
        /// Human-readable detail.
        message: String,
    },

    /// A destination exceeded its outbound buffer cap.
    #[error("outbound buffer overflow: {buffered} + {incoming} bytes exceeds cap of {cap}")]
    BackpressureOverflow {
        /// Bytes already buffered for the destination.
        buffered: usize,
        /// Size of the unit that was refused.
        incoming: usize,
        /// Configured hard cap.
        cap: usize,
    },

    /// Length prefix or control opcode is malformed.
    #[error("corrupt frame: {0}")]
    FrameCorrupt(String),

    /// Underlying socket or process I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Shorthand for [`Error::FrameCorrupt`].
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::FrameCorrupt(msg.into())
    }

    /// Shorthand for [`Error::SessionRejected`].
    pub fn rejected(reason: DisconnectReason, msg: impl Into<String>) -> Self {
        Self::SessionRejected {
            reason,
            message: msg.into(),
        }
    }

    /// Structured reason sent to a client disconnected because of this error.
    #[must_use]
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            Self::SpawnTimeout { .. } | Self::WorkerCrashed { .. } => DisconnectReason::WorkerCrashed,
            Self::SpawnRejected { .. } | Self::SpawnFailed { .. } | Self::HandshakeProtocolViolation(_) => {
                DisconnectReason::WorkerCrashed
            }
            Self::SandboxUnavailable(_) => DisconnectReason::ServerShuttingDown,
            Self::SessionRejected { reason, .. } => *reason,
            Self::BackpressureOverflow { .. } => DisconnectReason::SlowConsumer,
            Self::FrameCorrupt(_) => DisconnectReason::ProtocolError,
            Self::Io(_) => DisconnectReason::SavedContextLost,
        }
    }

    /// Whether the caller may retry the failed operation once.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SpawnTimeout { .. } | Self::WorkerCrashed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_reason_mapping() {
        assert_eq!(
            Error::BackpressureOverflow { buffered: 10, incoming: 5, cap: 12 }.disconnect_reason(),
            DisconnectReason::SlowConsumer
        );
        assert_eq!(Error::corrupt("bad").disconnect_reason(), DisconnectReason::ProtocolError);
        assert_eq!(
            Error::rejected(DisconnectReason::Unauthorized, "no").disconnect_reason(),
            DisconnectReason::Unauthorized
        );
        assert_eq!(
            Error::WorkerCrashed { pid: 7 }.disconnect_reason(),
            DisconnectReason::WorkerCrashed
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::SpawnTimeout { pid: 1, timeout_secs: 30 }.is_transient());
        assert!(Error::WorkerCrashed { pid: 1 }.is_transient());
        assert!(!Error::corrupt("x").is_transient());
        assert!(!Error::SandboxUnavailable("none".into()).is_transient());
        let failed = Error::SpawnFailed {
            document: "doc".into(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert!(!failed.is_transient());
        assert_eq!(failed.disconnect_reason(), DisconnectReason::WorkerCrashed);
    }

    #[test]
    fn test_display_includes_detail() {
        let err = Error::SpawnRejected { document: "doc-a".into(), pid: 42 };
        let text = err.to_string();
        assert!(text.contains("doc-a"));
        assert!(text.contains("42"));
    }
}
