//! Configuration loading.
//!
//! Reads an optional JSON file and applies `COLLABD_*` environment variable
//! overrides on top. Every field has a default, so a missing file is not an
//! error.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::fs;

use crate::auth::TokenGrant;
use crate::constants;
use crate::env::Environment;

/// Configuration for the document server.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    /// TCP address the client listener binds to.
    pub listen_addr: String,
    /// Optional Unix socket path accepting clients as well.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    /// Number of poll engines hosting document brokers.
    pub document_engines: usize,
    /// Housekeeping tick of every poll engine, in milliseconds.
    pub poll_tick_ms: u64,
    /// Worker readiness handshake timeout.
    pub handshake_timeout_secs: u64,
    /// Grace period before a terminating worker is killed.
    pub grace_period_secs: u64,
    /// Time a broker with no sessions waits before unloading.
    pub linger_secs: u64,
    /// Silence after which a worker is pinged.
    pub ping_interval_secs: u64,
    /// Silence after which a worker is marked unresponsive.
    pub unresponsive_after_secs: u64,
    /// Respawn a crashed worker once per broker lifetime.
    pub respawn_on_crash: bool,
    /// Buffered outbound bytes at which a destination stops accepting work.
    pub outbound_high_water: usize,
    /// Buffered outbound bytes a destination may never exceed.
    pub outbound_hard_cap: usize,
    /// Payloads above this size are chunked.
    pub chunk_size: usize,
    /// Largest frame accepted from any peer.
    pub max_frame_size: u32,
    /// Session cap per document.
    pub max_sessions_per_document: usize,
    /// Capacity of the in-memory blob store, in bytes.
    pub blob_capacity: usize,
    /// Resource-limit directives applied inside every worker,
    /// e.g. `"limit_virt_mem_mb 2048"`.
    pub worker_limits: Vec<String>,
    /// Executable used for workers. Defaults to the current executable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_bin: Option<PathBuf>,
    /// Directory documents are read from (`<dir>/<document id>`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_root: Option<PathBuf>,
    /// Static token table. Empty means every token is accepted outside production.
    pub tokens: HashMap<String, TokenGrant>,
    /// Whether an unavailable sandbox is fatal. Resolved from the environment.
    #[serde(skip)]
    pub sandbox_required: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: constants::DEFAULT_LISTEN_ADDR.to_string(),
            socket_path: None,
            document_engines: constants::DEFAULT_DOCUMENT_ENGINES,
            poll_tick_ms: constants::DEFAULT_POLL_TICK_MS,
            handshake_timeout_secs: constants::DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            grace_period_secs: constants::DEFAULT_GRACE_PERIOD_SECS,
            linger_secs: constants::DEFAULT_LINGER_SECS,
            ping_interval_secs: constants::DEFAULT_PING_INTERVAL_SECS,
            unresponsive_after_secs: constants::DEFAULT_UNRESPONSIVE_AFTER_SECS,
            respawn_on_crash: true,
            outbound_high_water: constants::DEFAULT_OUTBOUND_HIGH_WATER,
            outbound_hard_cap: constants::DEFAULT_OUTBOUND_HARD_CAP,
            chunk_size: constants::DEFAULT_CHUNK_SIZE,
            max_frame_size: constants::DEFAULT_MAX_FRAME_SIZE,
            max_sessions_per_document: constants::DEFAULT_MAX_SESSIONS_PER_DOCUMENT,
            blob_capacity: constants::DEFAULT_BLOB_CAPACITY,
            worker_limits: Vec::new(),
            worker_bin: None,
            document_root: None,
            tokens: HashMap::new(),
            sandbox_required: Environment::current().sandbox_required(),
        }
    }
}

impl Config {
    /// Returns the default configuration file path
    /// (`<platform config dir>/collabd/config.json`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("collabd").join("config.json"))
    }

    /// Loads configuration from `path` (or the default location when `None`),
    /// then applies environment variable overrides.
    ///
    /// An explicitly named file must exist; the default location is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::load_from_file(p)?,
            None => match Self::default_path() {
                Some(p) if p.exists() => Self::load_from_file(&p)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.sandbox_required = Environment::current().sandbox_required();
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Applies `COLLABD_*` overrides using `lookup` to read variables.
    ///
    /// Unparseable numeric values are ignored and logged.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = lookup("COLLABD_LISTEN") {
            self.listen_addr = listen;
        }

        if let Some(socket) = lookup("COLLABD_SOCKET") {
            self.socket_path = if socket.is_empty() { None } else { Some(PathBuf::from(socket)) };
        }

        if let Some(bin) = lookup("COLLABD_WORKER_BIN") {
            self.worker_bin = Some(PathBuf::from(bin));
        }

        if let Some(root) = lookup("COLLABD_DOCUMENT_ROOT") {
            self.document_root = Some(PathBuf::from(root));
        }

        parse_override(&lookup, "COLLABD_DOCUMENT_ENGINES", &mut self.document_engines);
        parse_override(&lookup, "COLLABD_LINGER_SECS", &mut self.linger_secs);
        parse_override(&lookup, "COLLABD_POLL_TICK_MS", &mut self.poll_tick_ms);
        parse_override(&lookup, "COLLABD_HANDSHAKE_TIMEOUT_SECS", &mut self.handshake_timeout_secs);
        parse_override(&lookup, "COLLABD_GRACE_PERIOD_SECS", &mut self.grace_period_secs);
        parse_override(&lookup, "COLLABD_CHUNK_SIZE", &mut self.chunk_size);

        if let Some(respawn) = lookup("COLLABD_RESPAWN") {
            match respawn.as_str() {
                "1" | "true" | "yes" => self.respawn_on_crash = true,
                "0" | "false" | "no" => self.respawn_on_crash = false,
                other => log::warn!("[config] Ignoring COLLABD_RESPAWN={other:?}"),
            }
        }
    }

    /// Rejects combinations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.document_engines > 0, "document_engines must be at least 1");
        anyhow::ensure!(self.poll_tick_ms > 0, "poll_tick_ms must be positive");
        anyhow::ensure!(self.chunk_size > 0, "chunk_size must be positive");
        anyhow::ensure!(
            self.outbound_high_water <= self.outbound_hard_cap,
            "outbound_high_water ({}) exceeds outbound_hard_cap ({})",
            self.outbound_high_water,
            self.outbound_hard_cap
        );
        anyhow::ensure!(
            (self.chunk_size as u64) + 64 <= u64::from(self.max_frame_size),
            "chunk_size must leave room for frame headers under max_frame_size"
        );
        if let Some(path) = &self.socket_path {
            anyhow::ensure!(
                path.as_os_str().len() < constants::MAX_SOCKET_PATH,
                "socket_path is longer than {} bytes",
                constants::MAX_SOCKET_PATH
            );
        }
        Ok(())
    }

    /// Poll engine tick.
    pub fn poll_tick(&self) -> Duration {
        Duration::from_millis(self.poll_tick_ms)
    }

    /// Worker handshake timeout.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Grace period for terminating workers.
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    /// Broker linger window.
    pub fn linger(&self) -> Duration {
        Duration::from_secs(self.linger_secs)
    }

    /// Worker ping interval.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Worker unresponsiveness threshold.
    pub fn unresponsive_after(&self) -> Duration {
        Duration::from_secs(self.unresponsive_after_secs)
    }

    /// Executable used to launch workers.
    pub fn worker_binary(&self) -> Result<PathBuf> {
        match &self.worker_bin {
            Some(bin) => Ok(bin.clone()),
            None => std::env::current_exe().context("Could not determine current executable"),
        }
    }
}

fn parse_override<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(raw) = lookup(key) {
        match raw.parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => log::warn!("[config] Ignoring unparseable {key}={raw:?}"),
        }
    }
}
