//! Client listener and composition root.
//!
//! [`Server::start`] builds the running system out of a [`ProcessContext`]:
//! `document_engines` poll engines hosting brokers, one acceptor engine
//! owning the listeners and greeting new connections, and the registry that
//! maps documents onto brokers. Nothing here is global; two servers can run
//! side by side in one process.

// Rust guideline compliant 2026-02

mod greeter;
mod listener;

use std::net::{SocketAddr, TcpListener};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::broker::registry::BrokerRegistry;
use crate::broker::BrokerSummary;
use crate::constants::MAX_SOCKET_PATH;
use crate::context::ProcessContext;
use crate::poll::{Interest, PollEngine};
use crate::relay::protocol::DisconnectReason;
use listener::{Bound, Listener};

/// A running document server.
#[derive(Debug)]
pub struct Server {
    process: Arc<ProcessContext>,
    registry: BrokerRegistry,
    acceptor: Option<PollEngine>,
    documents: Vec<PollEngine>,
    local_addr: SocketAddr,
    socket_path: Option<PathBuf>,
}

impl Server {
    /// Bind the listeners and start every poll engine.
    ///
    /// # Errors
    ///
    /// If a listener cannot be bound or an engine thread cannot start.
    pub fn start(process: ProcessContext) -> Result<Self> {
        let process = Arc::new(process);
        let config = &process.config;
        let tick = config.poll_tick();

        let documents = (0..config.document_engines)
            .map(|i| PollEngine::start(&format!("doc-{i}"), tick))
            .collect::<std::io::Result<Vec<_>>>()
            .context("Failed to start document engines")?;
        let registry = BrokerRegistry::new(Arc::clone(&process), documents.iter().map(PollEngine::handle).collect());

        let tcp = TcpListener::bind(&config.listen_addr)
            .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
        tcp.set_nonblocking(true)?;
        let local_addr = tcp.local_addr()?;

        let unix = config.socket_path.as_deref().map(bind_unix).transpose()?;

        let acceptor = PollEngine::start("acceptor", tick).context("Failed to start acceptor engine")?;
        let handle = acceptor.handle();
        handle.register_socket(
            Box::new(Listener::new(Bound::Tcp(tcp), registry.clone(), Arc::clone(&process))),
            Interest::READABLE,
        );
        if let Some(unix) = unix {
            handle.register_socket(
                Box::new(Listener::new(Bound::Unix(unix), registry.clone(), Arc::clone(&process))),
                Interest::READABLE,
            );
        }

        log::info!(
            "[server] Listening on {local_addr}{} with {} document engines",
            config
                .socket_path
                .as_ref()
                .map(|p| format!(" and {}", p.display()))
                .unwrap_or_default(),
            config.document_engines
        );

        Ok(Self {
            socket_path: config.socket_path.clone(),
            process,
            registry,
            acceptor: Some(acceptor),
            documents,
            local_addr,
        })
    }

    /// Bound TCP address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bound Unix socket path, if any.
    pub fn socket_path(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }

    /// Per-document snapshot.
    pub fn summaries(&self) -> Vec<BrokerSummary> {
        self.registry.summaries()
    }

    /// Stop accepting, disconnect every session with `ServerShuttingDown`,
    /// let workers exit within the grace period, then stop the engines.
    ///
    /// # Errors
    ///
    /// If an engine's multiplexer failed while running.
    pub fn shutdown(mut self) -> Result<()> {
        log::info!("[server] Shutting down");
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.join().context("Acceptor engine failed")?;
        }

        for summary in self.registry.summaries() {
            log::info!(
                "[server] {}: {} with {} sessions (worker {:?})",
                summary.document,
                summary.state,
                summary.sessions,
                summary.worker_pid
            );
        }
        self.registry.close_all(DisconnectReason::ServerShuttingDown);

        let config = &self.process.config;
        let deadline = Instant::now() + config.grace_period() + config.poll_tick() * 4 + Duration::from_secs(1);
        while !self.registry.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        if !self.registry.is_empty() {
            log::warn!("[server] {} documents still open at shutdown", self.registry.len());
        }

        let mut result = Ok(());
        for engine in self.documents.drain(..) {
            if let Err(e) = engine.join() {
                log::error!("[server] Document engine failed: {e}");
                result = Err(e).context("Document engine failed");
            }
        }
        if let Some(path) = self.socket_path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                log::debug!("[server] Could not remove {}: {e}", path.display());
            }
        }
        log::info!("[server] Stopped");
        result
    }
}

/// Bind a Unix listener at `path`, replacing a stale socket file, owner-only.
fn bind_unix(path: &Path) -> Result<UnixListener> {
    let path_len = path.as_os_str().len();
    if path_len >= MAX_SOCKET_PATH {
        anyhow::bail!(
            "Socket path too long ({path_len} bytes, max {}): {}",
            MAX_SOCKET_PATH - 1,
            path.display()
        );
    }
    if path.exists() {
        std::fs::remove_file(path).with_context(|| format!("Failed to remove stale socket: {}", path.display()))?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(path).with_context(|| format!("Failed to bind socket: {}", path.display()))?;
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    listener.set_nonblocking(true)?;
    Ok(listener)
}
