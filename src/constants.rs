//! Default values shared across modules.
//!
//! Everything here can be overridden through [`crate::config::Config`];
//! these are the values used when nothing else is configured.

/// Default TCP address the client listener binds to.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:9980";

/// Number of poll engines hosting document brokers.
pub const DEFAULT_DOCUMENT_ENGINES: usize = 2;

/// Housekeeping tick of every poll engine, in milliseconds.
pub const DEFAULT_POLL_TICK_MS: u64 = 250;

/// Time a freshly spawned worker has to send its readiness handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;

/// Grace period between a shutdown request and a forced kill.
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 5;

/// How long a broker with zero sessions waits before unloading.
pub const DEFAULT_LINGER_SECS: u64 = 10;

/// Silence after which a live worker is pinged.
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 15;

/// Silence after which a live worker is considered unresponsive.
pub const DEFAULT_UNRESPONSIVE_AFTER_SECS: u64 = 45;

/// Buffered outbound bytes at which a destination stops accepting enqueues.
pub const DEFAULT_OUTBOUND_HIGH_WATER: usize = 1024 * 1024;

/// Buffered outbound bytes a destination may never exceed.
pub const DEFAULT_OUTBOUND_HARD_CAP: usize = 16 * 1024 * 1024;

/// Payloads larger than this are split into a chunk header plus raw chunks.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Maximum size of a single frame (type byte + payload).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum concurrently attached sessions per document.
pub const DEFAULT_MAX_SESSIONS_PER_DOCUMENT: usize = 64;

/// Capacity of the in-memory blob store, in bytes.
pub const DEFAULT_BLOB_CAPACITY: usize = 64 * 1024 * 1024;

/// Bytes read from one socket per callback before yielding to other sockets.
pub const READ_BUDGET: usize = 256 * 1024;

/// File descriptor number the worker's control socket is installed at.
pub const WORKER_CONTROL_FD: i32 = 3;

/// Maximum path length for a Unix domain socket (macOS kernel limit).
pub const MAX_SOCKET_PATH: usize = 104;

/// Delay before a crashed worker is respawned, in milliseconds.
pub const RESPAWN_BACKOFF_MS: u64 = 500;
