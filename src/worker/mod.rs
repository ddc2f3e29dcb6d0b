//! Worker process supervision.
//!
//! One worker per document. The [`Supervisor`] starts it through a
//! [`WorkerLauncher`], hands back a [`WorkerProcessRecord`] that the owning
//! broker keeps, and decides on every housekeeping tick whether the worker
//! is still alive:
//!
//! ```text
//! Starting ──READY──► Ready ◄──► Busy
//!    │                  │          │
//!    │ handshake        │ silent   │
//!    │ timeout          ▼          ▼
//!    │             Unresponsive ───┘ (heard again)
//!    │                  │ grace
//!    ▼                  ▼
//!   Dead ◄──────────── kill / exit / EOF
//! ```

pub mod child;
pub mod launcher;
pub mod renderer;

use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::Token;
use uuid::Uuid;

use crate::config::Config;
use crate::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FRAME_SIZE};
use crate::error::{Error, Result};
use crate::relay::chunk::ChunkAssembler;
use crate::relay::framing::FrameDecoder;
use crate::relay::protocol::Frame;
use crate::relay::queue::OutboundQueue;
use crate::sandbox::SandboxRole;
pub use launcher::{InProcessLauncher, LaunchedWorker, ProcessLauncher, WorkerLauncher, WorkerProcess};

/// Frame limits of a control channel. Supervisor and worker must agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLimits {
    /// Payloads larger than this are split into chunks.
    pub chunk_size: usize,
    /// Largest frame either side accepts.
    pub max_frame_size: u32,
}

impl Default for ChannelLimits {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ChannelLimits {
    /// Limits configured for the server.
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk_size: config.chunk_size,
            max_frame_size: config.max_frame_size,
        }
    }

    /// Decoder enforcing these limits.
    pub fn decoder(&self) -> FrameDecoder {
        FrameDecoder::with_max_frame_size(self.max_frame_size)
    }

    /// Chunk reassembler enforcing these limits.
    pub fn assembler(&self) -> ChunkAssembler {
        ChunkAssembler::new(self.max_frame_size as usize)
    }
}

/// What a worker is started for.
#[derive(Debug, Clone)]
pub struct DocumentContext {
    /// Document identifier.
    pub document: String,
    /// File opened by the worker before lockdown.
    pub document_path: Option<PathBuf>,
    /// Resource-limit directives applied inside the worker.
    pub limits: Vec<String>,
    /// Whether the worker must refuse to run unsandboxed.
    pub sandbox_required: bool,
    /// Identifier of this worker instance.
    pub jail_id: Uuid,
    /// Frame limits of the control channel.
    pub channel: ChannelLimits,
}

impl DocumentContext {
    /// Context for `document` with no file, no limits, and no sandbox requirement.
    pub fn new(document: impl Into<String>) -> Self {
        Self {
            document: document.into(),
            document_path: None,
            limits: Vec::new(),
            sandbox_required: false,
            jail_id: Uuid::new_v4(),
            channel: ChannelLimits::default(),
        }
    }

    /// Context for `document` under `config`. Documents map to files under
    /// `document_root` when one is configured and the file exists.
    pub fn from_config(document: &str, config: &Config) -> Self {
        let plain_name = !document.is_empty()
            && document != "."
            && document != ".."
            && !document.contains(['/', '\\', '\0']);
        let document_path = config
            .document_root
            .as_ref()
            .filter(|_| plain_name)
            .map(|root| root.join(document))
            .filter(|p| p.is_file());
        Self {
            document: document.to_string(),
            document_path,
            limits: config.worker_limits.clone(),
            sandbox_required: config.sandbox_required,
            jail_id: Uuid::new_v4(),
            channel: ChannelLimits::from_config(config),
        }
    }

    /// Same document, fresh jail id.
    pub fn respawned(&self) -> Self {
        Self { jail_id: Uuid::new_v4(), ..self.clone() }
    }
}

/// Liveness state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Spawned, handshake pending.
    Starting,
    /// Idle and healthy.
    Ready,
    /// Has queued input or a pending save.
    Busy,
    /// Silent past the unresponsive threshold.
    Unresponsive,
    /// Gone.
    Dead,
}

impl WorkerState {
    /// Whether a record in this state blocks another spawn.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Ready | Self::Busy)
    }
}

/// Outcome of a liveness check.
#[derive(Debug)]
pub enum Liveness {
    /// Nothing to do.
    Healthy,
    /// A ping was queued on the control channel; flush it.
    PingQueued,
    /// A graceful stop ran out of time and the worker was killed.
    Terminated,
    /// The worker is dead; the error says why.
    Died(Error),
}

/// One live (or formerly live) worker, owned by its broker.
#[derive(Debug)]
pub struct WorkerProcessRecord {
    /// Process id.
    pub pid: u32,
    /// Random per-instance id used in logs and the process title.
    pub jail_id: Uuid,
    /// Liveness state.
    pub state: WorkerState,
    /// Sandbox profile the worker was started with.
    pub profile: SandboxRole,
    /// When the process was spawned.
    pub spawned_at: Instant,
    /// Last time any frame arrived from the worker.
    pub last_heard: Instant,
    /// Poll engine token of the control socket once registered.
    pub token: Option<Token>,
    /// Frames waiting to be written to the worker.
    pub outbound: OutboundQueue,
    /// Decoder for bytes read from the worker.
    pub decoder: FrameDecoder,
    /// Reassembles chunked worker output.
    pub assembler: ChunkAssembler,
    /// A save was requested and not yet acknowledged.
    pub save_pending: bool,
    control: Option<UnixStream>,
    process: Box<dyn WorkerProcess>,
    ping_sent_at: Option<Instant>,
    unresponsive_since: Option<Instant>,
    terminate_deadline: Option<Instant>,
}

impl WorkerProcessRecord {
    /// Take the control socket for registration with a poll engine.
    pub fn take_control(&mut self) -> Option<UnixStream> {
        self.control.take()
    }

    /// Whether a graceful stop is in progress.
    pub fn is_terminating(&self) -> bool {
        self.terminate_deadline.is_some()
    }

    /// Re-derive Ready/Busy from queued input and the pending save.
    pub fn refresh_busy(&mut self) {
        if matches!(self.state, WorkerState::Ready | WorkerState::Busy) {
            self.state = if self.save_pending || !self.outbound.is_empty() {
                WorkerState::Busy
            } else {
                WorkerState::Ready
            };
        }
    }

    /// Record that a frame arrived from the worker.
    ///
    /// The first frame must be the readiness handshake.
    ///
    /// # Errors
    ///
    /// [`Error::HandshakeProtocolViolation`] if a starting worker sends
    /// anything other than `READY`.
    pub fn on_frame(&mut self, frame: &Frame, now: Instant) -> Result<()> {
        self.last_heard = now;
        self.ping_sent_at = None;
        match (self.state, frame) {
            (WorkerState::Starting, Frame::Ready { pid }) => {
                if *pid != self.pid {
                    log::debug!("[supervisor] Worker {} reports pid {pid}", self.pid);
                }
                log::info!(
                    "[supervisor] Worker {} ready after {:?}",
                    self.pid,
                    now.saturating_duration_since(self.spawned_at)
                );
                self.state = WorkerState::Ready;
            }
            (WorkerState::Starting, other) => {
                return Err(Error::HandshakeProtocolViolation(format!(
                    "worker {} sent frame type 0x{:02x} before READY",
                    self.pid,
                    other.kind()
                )));
            }
            (_, Frame::Ready { .. }) => {
                return Err(Error::HandshakeProtocolViolation(format!(
                    "worker {} sent a second READY",
                    self.pid
                )));
            }
            (WorkerState::Unresponsive, _) => {
                log::info!("[supervisor] Worker {} responsive again", self.pid);
                self.unresponsive_since = None;
                self.state = WorkerState::Ready;
            }
            _ => {}
        }
        if let Frame::SaveAck { .. } = frame {
            self.save_pending = false;
        }
        self.refresh_busy();
        Ok(())
    }

    /// Mark dead after the control channel closed or failed, and reap.
    pub fn mark_dead(&mut self) {
        if self.state != WorkerState::Dead {
            if let Err(e) = self.process.kill() {
                log::warn!("[supervisor] Failed to kill worker {}: {e}", self.pid);
            }
            self.state = WorkerState::Dead;
        }
    }
}

/// Starts, watches, and stops workers.
#[derive(Debug, Clone)]
pub struct Supervisor {
    launcher: Arc<dyn WorkerLauncher>,
    handshake_timeout: Duration,
    grace_period: Duration,
    ping_interval: Duration,
    unresponsive_after: Duration,
    high_water: usize,
    hard_cap: usize,
}

impl Supervisor {
    /// Supervisor with timeouts and buffer limits from `config`.
    pub fn new(config: &Config, launcher: Arc<dyn WorkerLauncher>) -> Self {
        Self {
            launcher,
            handshake_timeout: config.handshake_timeout(),
            grace_period: config.grace_period(),
            ping_interval: config.ping_interval(),
            unresponsive_after: config.unresponsive_after(),
            high_water: config.outbound_high_water,
            hard_cap: config.outbound_hard_cap,
        }
    }

    /// Start a worker for `document`.
    ///
    /// # Errors
    ///
    /// [`Error::SpawnRejected`] if `existing` is still live;
    /// [`Error::SpawnFailed`] if the process could not be started.
    pub fn spawn_worker(
        &self,
        existing: Option<&WorkerProcessRecord>,
        document: &DocumentContext,
        now: Instant,
    ) -> Result<WorkerProcessRecord> {
        if let Some(record) = existing.filter(|r| r.state.is_live()) {
            return Err(Error::SpawnRejected {
                document: document.document.clone(),
                pid: record.pid,
            });
        }

        let launched = self.launcher.launch(document).map_err(|source| Error::SpawnFailed {
            document: document.document.clone(),
            source,
        })?;
        Ok(WorkerProcessRecord {
            pid: launched.process.pid(),
            jail_id: document.jail_id,
            state: WorkerState::Starting,
            profile: SandboxRole::Renderer,
            spawned_at: now,
            last_heard: now,
            token: None,
            outbound: OutboundQueue::new(self.high_water, self.hard_cap),
            decoder: document.channel.decoder(),
            assembler: document.channel.assembler(),
            save_pending: false,
            control: Some(launched.control),
            process: launched.process,
            ping_sent_at: None,
            unresponsive_since: None,
            terminate_deadline: None,
        })
    }

    /// Stop a worker.
    ///
    /// Graceful termination queues `SHUTDOWN` and allows the grace period
    /// before [`check_liveness`](Self::check_liveness) kills it. A worker
    /// that never finished its handshake cannot be asked and is killed.
    pub fn terminate(&self, record: &mut WorkerProcessRecord, graceful: bool, now: Instant) {
        if record.state == WorkerState::Dead || record.is_terminating() {
            return;
        }
        let can_ask = graceful && record.state != WorkerState::Starting && record.token.is_some();
        if can_ask && record.outbound.enqueue_frame(Frame::Shutdown.encode()).is_ok() {
            log::info!(
                "[supervisor] Asking worker {} to shut down (grace {:?})",
                record.pid,
                self.grace_period
            );
            record.terminate_deadline = Some(now + self.grace_period);
            return;
        }
        log::info!("[supervisor] Killing worker {}", record.pid);
        record.mark_dead();
    }

    /// Periodic liveness check, run from the housekeeping tick.
    pub fn check_liveness(&self, record: &mut WorkerProcessRecord, now: Instant) -> Liveness {
        if record.state == WorkerState::Dead {
            return Liveness::Healthy;
        }

        match record.process.try_exit() {
            Ok(Some(status)) => {
                record.state = WorkerState::Dead;
                if record.is_terminating() {
                    log::info!("[supervisor] Worker {} exited ({status})", record.pid);
                    return Liveness::Terminated;
                }
                log::warn!("[supervisor] Worker {} exited unexpectedly ({status})", record.pid);
                return Liveness::Died(Error::WorkerCrashed { pid: record.pid });
            }
            Ok(None) => {}
            Err(e) => log::warn!("[supervisor] Failed to poll worker {}: {e}", record.pid),
        }

        if let Some(deadline) = record.terminate_deadline {
            if now >= deadline {
                log::warn!("[supervisor] Worker {} ignored shutdown, killing", record.pid);
                record.mark_dead();
                return Liveness::Terminated;
            }
            return Liveness::Healthy;
        }

        if record.state == WorkerState::Starting {
            if now.saturating_duration_since(record.spawned_at) >= self.handshake_timeout {
                log::error!(
                    "[supervisor] Worker {} missed its {:?} handshake deadline",
                    record.pid,
                    self.handshake_timeout
                );
                record.mark_dead();
                return Liveness::Died(Error::SpawnTimeout {
                    pid: record.pid,
                    timeout_secs: self.handshake_timeout.as_secs(),
                });
            }
            return Liveness::Healthy;
        }

        if let Some(since) = record.unresponsive_since {
            if now.saturating_duration_since(since) >= self.grace_period {
                log::error!("[supervisor] Worker {} unresponsive past grace, killing", record.pid);
                record.mark_dead();
                return Liveness::Died(Error::WorkerCrashed { pid: record.pid });
            }
            return Liveness::Healthy;
        }

        let silent = now.saturating_duration_since(record.last_heard);
        if silent >= self.unresponsive_after {
            log::warn!("[supervisor] Worker {} silent for {silent:?}", record.pid);
            record.state = WorkerState::Unresponsive;
            record.unresponsive_since = Some(now);
            return Liveness::Healthy;
        }

        let ping_due = record
            .ping_sent_at
            .map_or(true, |sent| now.saturating_duration_since(sent) >= self.ping_interval);
        if silent >= self.ping_interval && ping_due && record.token.is_some() {
            if record.outbound.enqueue_frame(Frame::Ping.encode()).is_ok() {
                record.ping_sent_at = Some(now);
                return Liveness::PingQueued;
            }
        }
        Liveness::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Read};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// A launcher whose processes never run anything.
    #[derive(Debug, Default)]
    struct StubLauncher {
        launches: AtomicU32,
        exited: Arc<AtomicBool>,
    }

    #[derive(Debug)]
    struct StubProcess {
        pid: u32,
        exited: Arc<AtomicBool>,
        killed: bool,
    }

    impl WorkerProcess for StubProcess {
        fn pid(&self) -> u32 {
            self.pid
        }
        fn try_exit(&mut self) -> io::Result<Option<String>> {
            Ok((self.killed || self.exited.load(Ordering::SeqCst)).then(|| "stub".to_string()))
        }
        fn kill(&mut self) -> io::Result<()> {
            self.killed = true;
            Ok(())
        }
    }

    impl WorkerLauncher for StubLauncher {
        fn launch(&self, _document: &DocumentContext) -> io::Result<LaunchedWorker> {
            let pid = 1000 + self.launches.fetch_add(1, Ordering::SeqCst);
            let (control, _peer) = UnixStream::pair()?;
            Ok(LaunchedWorker {
                process: Box::new(StubProcess { pid, exited: Arc::clone(&self.exited), killed: false }),
                control,
            })
        }
    }

    fn supervisor(launcher: Arc<StubLauncher>) -> Supervisor {
        let config = Config {
            handshake_timeout_secs: 2,
            ping_interval_secs: 1,
            unresponsive_after_secs: 3,
            grace_period_secs: 1,
            ..Config::default()
        };
        Supervisor::new(&config, launcher)
    }

    fn ready(sup: &Supervisor, now: Instant) -> WorkerProcessRecord {
        let mut rec = sup.spawn_worker(None, &DocumentContext::new("doc"), now).unwrap();
        rec.token = Some(Token(7));
        rec.on_frame(&Frame::Ready { pid: rec.pid }, now).unwrap();
        rec
    }

    #[test]
    fn test_second_spawn_is_rejected_while_live() {
        let launcher = Arc::new(StubLauncher::default());
        let sup = supervisor(Arc::clone(&launcher));
        let now = Instant::now();
        let mut rec = sup.spawn_worker(None, &DocumentContext::new("doc"), now).unwrap();
        assert_eq!(rec.state, WorkerState::Starting);

        let err = sup.spawn_worker(Some(&rec), &DocumentContext::new("doc"), now).unwrap_err();
        assert!(matches!(err, Error::SpawnRejected { pid, .. } if pid == rec.pid));
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);

        rec.mark_dead();
        assert!(sup.spawn_worker(Some(&rec), &DocumentContext::new("doc"), now).is_ok());
    }

    #[test]
    fn test_handshake_timeout_kills_worker() {
        let sup = supervisor(Arc::new(StubLauncher::default()));
        let t0 = Instant::now();
        let mut rec = sup.spawn_worker(None, &DocumentContext::new("doc"), t0).unwrap();
        assert!(matches!(sup.check_liveness(&mut rec, t0 + Duration::from_secs(1)), Liveness::Healthy));
        assert!(matches!(
            sup.check_liveness(&mut rec, t0 + Duration::from_secs(2)),
            Liveness::Died(Error::SpawnTimeout { timeout_secs: 2, .. })
        ));
        assert_eq!(rec.state, WorkerState::Dead);
    }

    #[test]
    fn test_frame_before_ready_violates_handshake() {
        let sup = supervisor(Arc::new(StubLauncher::default()));
        let now = Instant::now();
        let mut rec = sup.spawn_worker(None, &DocumentContext::new("doc"), now).unwrap();
        let err = rec.on_frame(&Frame::Pong, now).unwrap_err();
        assert!(matches!(err, Error::HandshakeProtocolViolation(_)));
    }

    #[test]
    fn test_exit_is_reported_as_crash() {
        let launcher = Arc::new(StubLauncher::default());
        let sup = supervisor(Arc::clone(&launcher));
        let now = Instant::now();
        let mut rec = ready(&sup, now);
        launcher.exited.store(true, Ordering::SeqCst);
        assert!(matches!(sup.check_liveness(&mut rec, now), Liveness::Died(Error::WorkerCrashed { .. })));
        assert_eq!(rec.state, WorkerState::Dead);
    }

    #[test]
    fn test_ping_then_unresponsive_then_killed() {
        let sup = supervisor(Arc::new(StubLauncher::default()));
        let t0 = Instant::now();
        let mut rec = ready(&sup, t0);

        assert!(matches!(sup.check_liveness(&mut rec, t0 + Duration::from_secs(1)), Liveness::PingQueued));
        assert_eq!(rec.outbound.buffered(), Frame::Ping.encode().len());
        assert!(matches!(sup.check_liveness(&mut rec, t0 + Duration::from_millis(1500)), Liveness::Healthy));

        sup.check_liveness(&mut rec, t0 + Duration::from_secs(3));
        assert_eq!(rec.state, WorkerState::Unresponsive);
        assert!(!rec.state.is_live());

        assert!(matches!(
            sup.check_liveness(&mut rec, t0 + Duration::from_secs(4)),
            Liveness::Died(Error::WorkerCrashed { .. })
        ));
    }

    #[test]
    fn test_hearing_back_clears_unresponsive() {
        let sup = supervisor(Arc::new(StubLauncher::default()));
        let t0 = Instant::now();
        let mut rec = ready(&sup, t0);
        sup.check_liveness(&mut rec, t0 + Duration::from_secs(3));
        assert_eq!(rec.state, WorkerState::Unresponsive);

        rec.on_frame(&Frame::Pong, t0 + Duration::from_secs(3)).unwrap();
        assert_eq!(rec.state, WorkerState::Ready);
        assert!(matches!(sup.check_liveness(&mut rec, t0 + Duration::from_secs(4)), Liveness::PingQueued));
    }

    #[test]
    fn test_graceful_terminate_escalates_after_grace() {
        let sup = supervisor(Arc::new(StubLauncher::default()));
        let t0 = Instant::now();
        let mut rec = ready(&sup, t0);
        sup.terminate(&mut rec, true, t0);
        assert!(rec.is_terminating());

        let mut written = Vec::new();
        rec.outbound.flush(&mut written).unwrap();
        let mut dec = FrameDecoder::new();
        let frames = dec.feed(&written).unwrap();
        assert_eq!(Frame::decode(&frames[0]).unwrap(), Frame::Shutdown);

        assert!(matches!(sup.check_liveness(&mut rec, t0 + Duration::from_secs(1)), Liveness::Terminated));
        assert_eq!(rec.state, WorkerState::Dead);
    }

    #[test]
    fn test_save_keeps_worker_busy_until_acked() {
        let sup = supervisor(Arc::new(StubLauncher::default()));
        let now = Instant::now();
        let mut rec = ready(&sup, now);
        rec.save_pending = true;
        rec.refresh_busy();
        assert_eq!(rec.state, WorkerState::Busy);
        rec.on_frame(&Frame::SaveAck { ok: true }, now).unwrap();
        assert_eq!(rec.state, WorkerState::Ready);
    }

    #[test]
    fn test_document_paths_stay_under_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("report.odt"), b"x").unwrap();
        let config = Config { document_root: Some(dir.path().to_path_buf()), ..Config::default() };

        let ctx = DocumentContext::from_config("report.odt", &config);
        assert_eq!(ctx.document_path, Some(dir.path().join("report.odt")));
        assert_eq!(DocumentContext::from_config("../report.odt", &config).document_path, None);
        assert_eq!(DocumentContext::from_config("missing.odt", &config).document_path, None);
        assert_ne!(ctx.respawned().jail_id, ctx.jail_id);
    }

    #[test]
    fn test_in_process_worker_handshake() {
        let sup = Supervisor::new(&Config::default(), Arc::new(InProcessLauncher));
        let now = Instant::now();
        let mut rec = sup.spawn_worker(None, &DocumentContext::new("doc"), now).unwrap();
        let mut control = rec.take_control().unwrap();
        let mut buf = [0u8; 64];
        let n = control.read(&mut buf).unwrap();
        let frames = rec.decoder.feed(&buf[..n]).unwrap();
        let frame = Frame::decode(&frames[0]).unwrap();
        rec.on_frame(&frame, now).unwrap();
        assert_eq!(rec.state, WorkerState::Ready);
        sup.terminate(&mut rec, false, now);
        assert_eq!(rec.state, WorkerState::Dead);
    }
}
