//! Per-document session broker.
//!
//! A [`DocumentBroker`] owns the sessions attached to one document, the
//! record of its single worker, and the relay between them. It lives on one
//! poll engine: every socket it owns is registered there, and every method
//! below runs on that engine's thread with the broker's mutex held.
//!
//! # State machine
//!
//! ```text
//! Loading ──worker READY──► Live ◄──SAVE_ACK── Saving
//!    ▲                       │  └──save──────────┘
//!    │ respawn (once)        │ linger expired / worker lost / close-all
//!    └──── worker lost ──────┤
//!                            ▼
//!                        Unloading ──worker gone, sessions drained──► Destroyed
//! ```
//!
//! Edits from sessions go through one inbound queue before reaching the
//! worker, so they keep their per-session order across `Loading`, `Saving`
//! and worker congestion.

// Rust guideline compliant 2026-02

pub mod handler;
pub mod registry;
pub mod session;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::auth::AuthDecision;
use crate::blob::BlobStore;
use crate::constants::RESPAWN_BACKOFF_MS;
use crate::context::ProcessContext;
use crate::error::{Error, Result};
use crate::poll::{Disposition, Interest, PollContext};
use crate::relay::protocol::{DisconnectReason, Frame};
use crate::relay::queue::OutboundQueue;
use crate::relay::{decode_frames, Routed, Target};
use crate::socket::Stream;
use crate::worker::{DocumentContext, Liveness, WorkerProcessRecord, WorkerState};
use handler::{BrokerSocket, Endpoint};
use session::Session;

/// A broker shared between its sockets and the registry.
pub type SharedBroker = Arc<Mutex<DocumentBroker>>;

/// Lifecycle state of a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerState {
    /// Waiting for the worker handshake.
    Loading,
    /// Relaying.
    Live,
    /// A save is in flight; edits are held.
    Saving,
    /// Tearing down.
    Unloading,
    /// Gone.
    Destroyed,
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Loading => "loading",
            Self::Live => "live",
            Self::Saving => "saving",
            Self::Unloading => "unloading",
            Self::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSummary {
    /// Document identifier.
    pub document: String,
    /// Broker state.
    pub state: BrokerState,
    /// Attached sessions, including ones being disconnected.
    pub sessions: usize,
    /// Pid of the current worker.
    pub worker_pid: Option<u32>,
    /// State of the current worker.
    pub worker_state: Option<WorkerState>,
    /// Whether the one allowed respawn has been used.
    pub respawned: bool,
    /// Time since the least recently active session sent anything.
    pub longest_idle: Option<Duration>,
}

/// An entry in the inbound queue.
#[derive(Debug)]
enum Held {
    Edit { session: u32, data: Vec<u8> },
    Leave { session: u32 },
}

impl Held {
    fn len(&self) -> usize {
        match self {
            Self::Edit { data, .. } => data.len(),
            Self::Leave { .. } => 0,
        }
    }
}

/// Orchestrates one open document.
#[derive(Debug)]
pub struct DocumentBroker {
    me: Weak<Mutex<DocumentBroker>>,
    process: Arc<ProcessContext>,
    context: DocumentContext,
    state: BrokerState,
    sessions: HashMap<u32, Session>,
    worker: Option<WorkerProcessRecord>,
    held: VecDeque<Held>,
    held_bytes: usize,
    next_session_id: u32,
    next_seq: u64,
    edits_since_save: u64,
    edits_in_save: u64,
    respawned: bool,
    respawn_at: Option<Instant>,
    resync_pending: bool,
    linger_since: Option<Instant>,
    worker_read_paused: bool,
    unload_cause: Option<(DisconnectReason, String)>,
}

impl DocumentBroker {
    /// Create a broker for `document` in the `Loading` state. Nothing runs
    /// until [`start`](Self::start) is called on its poll engine.
    pub fn create(process: Arc<ProcessContext>, document: &str, now: Instant) -> SharedBroker {
        let context = DocumentContext::from_config(document, &process.config);
        Arc::new_cyclic(|me| {
            Mutex::new(Self {
                me: me.clone(),
                process,
                context,
                state: BrokerState::Loading,
                sessions: HashMap::new(),
                worker: None,
                held: VecDeque::new(),
                held_bytes: 0,
                next_session_id: 1,
                next_seq: 0,
                edits_since_save: 0,
                edits_in_save: 0,
                respawned: false,
                respawn_at: None,
                resync_pending: false,
                linger_since: Some(now),
                worker_read_paused: false,
                unload_cause: None,
            })
        })
    }

    /// Document identifier.
    pub fn document(&self) -> &str {
        &self.context.document
    }

    /// Current state.
    pub fn state(&self) -> BrokerState {
        self.state
    }

    /// Number of attached sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Attached session ids, unordered.
    pub fn session_ids(&self) -> Vec<u32> {
        self.sessions.keys().copied().collect()
    }

    /// Why the broker is unloading, when the worker failed.
    pub fn unload_cause(&self) -> Option<(DisconnectReason, &str)> {
        self.unload_cause.as_ref().map(|(reason, message)| (*reason, message.as_str()))
    }

    /// The current worker record.
    pub fn worker(&self) -> Option<&WorkerProcessRecord> {
        self.worker.as_ref()
    }

    /// Snapshot for diagnostics.
    pub fn summary(&self) -> BrokerSummary {
        self.summary_at(Instant::now())
    }

    /// Snapshot for diagnostics, with idle times measured at `now`.
    pub fn summary_at(&self, now: Instant) -> BrokerSummary {
        BrokerSummary {
            document: self.context.document.clone(),
            state: self.state,
            sessions: self.sessions.len(),
            worker_pid: self.worker.as_ref().map(|w| w.pid),
            worker_state: self.worker.as_ref().map(|w| w.state),
            respawned: self.respawned,
            longest_idle: self.sessions.values().map(|s| s.idle_for(now)).max(),
        }
    }

    // ─── Lifecycle ─────────────────────────────────────────────────────────

    /// Spawn the worker. Runs once, on the broker's engine.
    pub fn start(&mut self, ctx: &mut PollContext) {
        if self.state == BrokerState::Loading && self.worker.is_none() && self.respawn_at.is_none() {
            self.spawn_worker(ctx);
        }
        self.apply_backpressure(ctx);
    }

    fn spawn_worker(&mut self, ctx: &mut PollContext) {
        let now = ctx.now();
        let spawned = self.process.supervisor.spawn_worker(self.worker.as_ref(), &self.context, now);
        match spawned {
            Ok(mut record) => match self.register_worker(ctx, &mut record) {
                Ok(()) => {
                    log::info!(
                        "[broker {}] Worker {} starting (jail {})",
                        self.context.document,
                        record.pid,
                        record.jail_id
                    );
                    self.worker_read_paused = false;
                    self.worker = Some(record);
                }
                Err(e) => {
                    record.mark_dead();
                    self.handle_worker_death(ctx, Error::Io(e));
                }
            },
            Err(e) => {
                log::error!("[broker {}] Failed to spawn worker: {e}", self.context.document);
                self.handle_worker_death(ctx, e);
            }
        }
    }

    fn register_worker(&self, ctx: &mut PollContext, record: &mut WorkerProcessRecord) -> io::Result<()> {
        let control = record
            .take_control()
            .ok_or_else(|| io::Error::other("worker control channel already taken"))?;
        control.set_nonblocking(true)?;
        let me = self.me.upgrade().ok_or_else(|| io::Error::other("broker dropped"))?;
        let handler = BrokerSocket::new(me, Endpoint::Worker(record.pid), Stream::Unix(control));
        record.token = Some(ctx.register(Box::new(handler), Interest::BOTH));
        Ok(())
    }

    /// React to the loss of the worker: respawn once, otherwise unload.
    fn handle_worker_death(&mut self, ctx: &mut PollContext, err: Error) {
        let now = ctx.now();
        if let Some(mut record) = self.worker.take() {
            record.mark_dead();
            if let Some(token) = record.token {
                ctx.deregister(token);
            }
        }

        if matches!(self.state, BrokerState::Unloading | BrokerState::Destroyed) {
            self.check_unloaded(ctx);
            return;
        }

        // A save the worker never acknowledged did not happen.
        self.edits_since_save += std::mem::take(&mut self.edits_in_save);

        let attached = self.sessions.values().filter(|s| s.closing.is_none()).count();
        if attached > 0 && err.is_transient() && self.process.config.respawn_on_crash && !self.respawned {
            log::warn!(
                "[broker {}] Worker lost ({err}); respawning once for {attached} sessions",
                self.context.document
            );
            self.respawned = true;
            self.state = BrokerState::Loading;
            self.resync_pending = true;
            self.context = self.context.respawned();
            for session in self.sessions.values_mut() {
                session.attached = false;
            }
            self.respawn_at = Some(now + Duration::from_millis(RESPAWN_BACKOFF_MS));
            return;
        }

        log::error!("[broker {}] Worker lost ({err}); unloading", self.context.document);
        let (reason, message) = (err.disconnect_reason(), err.to_string());
        self.begin_unload(ctx, reason, &message);
        self.unload_cause = Some((reason, message));
    }

    /// Enter `Unloading`: notify sessions, stop the worker.
    fn begin_unload(&mut self, ctx: &mut PollContext, reason: DisconnectReason, message: &str) {
        if matches!(self.state, BrokerState::Unloading | BrokerState::Destroyed) {
            return;
        }
        let now = ctx.now();
        log::info!(
            "[broker {}] Unloading ({reason}) with {} sessions",
            self.context.document,
            self.sessions.len()
        );
        self.state = BrokerState::Unloading;
        self.respawn_at = None;
        self.held.clear();
        self.held_bytes = 0;

        let deadline = now + self.process.config.grace_period();
        for session in self.sessions.values_mut() {
            session.begin_close(reason, message, deadline);
            ctx.schedule(session.token, Interest::WRITABLE);
        }

        if let Some(record) = self.worker.as_mut() {
            let graceful = matches!(record.state, WorkerState::Ready | WorkerState::Busy);
            self.process.supervisor.terminate(record, graceful, now);
            if let Some(token) = record.token {
                ctx.schedule(token, Interest::WRITABLE);
            }
        }
        self.check_unloaded(ctx);
    }

    /// Finish unloading once every session is gone and the worker is dead.
    fn check_unloaded(&mut self, ctx: &mut PollContext) {
        if self.state != BrokerState::Unloading || !self.sessions.is_empty() {
            return;
        }
        if self.worker.as_ref().is_some_and(|w| w.state != WorkerState::Dead) {
            return;
        }
        if let Some(record) = self.worker.take() {
            if let Some(token) = record.token {
                ctx.deregister(token);
            }
        }
        self.state = BrokerState::Destroyed;
        log::info!("[broker {}] Destroyed", self.context.document);
    }

    /// Disconnect every session with `reason` and unload.
    pub fn close_all(&mut self, ctx: &mut PollContext, reason: DisconnectReason) {
        self.begin_unload(ctx, reason, "document closed");
        self.apply_backpressure(ctx);
    }

    /// Housekeeping tick: worker liveness, respawn backoff, linger, and
    /// sessions stuck closing.
    pub fn tick(&mut self, ctx: &mut PollContext) {
        let now = ctx.now();

        if let Some(record) = self.worker.as_mut() {
            match self.process.supervisor.check_liveness(record, now) {
                Liveness::Healthy | Liveness::Terminated => {}
                Liveness::PingQueued => {
                    if let Some(token) = record.token {
                        ctx.schedule(token, Interest::WRITABLE);
                    }
                }
                Liveness::Died(err) => self.handle_worker_death(ctx, err),
            }
        }

        if self.respawn_at.is_some_and(|at| now >= at) {
            self.respawn_at = None;
            if self.state == BrokerState::Loading {
                self.spawn_worker(ctx);
            }
        }

        let grace = self.process.config.grace_period();
        let mut slow = Vec::new();
        for session in self.sessions.values() {
            if session.closing.is_some_and(|c| now >= c.deadline) {
                log::debug!("[broker {}] Session {} did not drain, closing", self.context.document, session.id);
                ctx.close(session.token);
            } else if session.congested_since.is_some_and(|t| now.saturating_duration_since(t) >= grace) {
                slow.push(session.id);
            }
        }
        for id in slow {
            self.disconnect_session(ctx, id, DisconnectReason::SlowConsumer, "client is not reading");
        }

        if matches!(self.state, BrokerState::Live | BrokerState::Loading) && self.sessions.is_empty() {
            let linger = self.process.config.linger();
            if self.linger_since.is_some_and(|since| now.saturating_duration_since(since) >= linger) {
                self.begin_unload(ctx, DisconnectReason::DocumentUnloading, "no sessions left");
            }
        }

        self.check_unloaded(ctx);
        self.apply_backpressure(ctx);
    }

    // ─── Sessions ──────────────────────────────────────────────────────────

    /// Whether a session with `decision` would be admitted now.
    ///
    /// # Errors
    ///
    /// [`Error::SessionRejected`] with `DocumentUnloading` (the caller should
    /// open a new broker), `Unauthorized`, or `DocumentFull`.
    pub fn check_admission(&self, decision: AuthDecision) -> Result<()> {
        if matches!(self.state, BrokerState::Unloading | BrokerState::Destroyed) {
            return Err(Error::rejected(DisconnectReason::DocumentUnloading, "document is unloading"));
        }
        if !decision.allowed {
            return Err(Error::rejected(DisconnectReason::Unauthorized, "not authorized for this document"));
        }
        if self.sessions.len() >= self.process.config.max_sessions_per_document {
            return Err(Error::rejected(DisconnectReason::DocumentFull, "too many sessions"));
        }
        Ok(())
    }

    /// Admit a client. `leftover` holds bytes the client sent after its
    /// join frame.
    ///
    /// # Errors
    ///
    /// Admission errors from [`check_admission`](Self::check_admission), or
    /// I/O errors preparing the socket.
    pub fn add_session(
        &mut self,
        ctx: &mut PollContext,
        stream: Stream,
        leftover: &[u8],
        decision: AuthDecision,
    ) -> Result<u32> {
        self.check_admission(decision)?;
        stream.set_nonblocking(true)?;
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| Error::rejected(DisconnectReason::DocumentUnloading, "broker dropped"))?;

        let id = self.next_session_id;
        self.next_session_id = self.next_session_id.checked_add(1).unwrap_or(1);

        let paused = self.inbound_blocked();
        let interest = if paused { Interest::WRITABLE } else { Interest::BOTH };
        let token = ctx.register(Box::new(BrokerSocket::new(me, Endpoint::Session(id), stream)), interest);

        let config = &self.process.config;
        let mut session = Session::new(
            id,
            token,
            decision.view_only,
            OutboundQueue::new(config.outbound_high_water, config.outbound_hard_cap),
            config.max_frame_size,
            ctx.now(),
        );
        session.read_paused = paused;
        session.send(&Frame::Joined { session: id, view_only: decision.view_only });
        ctx.schedule(token, Interest::WRITABLE);

        self.sessions.insert(id, session);
        self.linger_since = None;
        log::info!(
            "[broker {}] Session {id} joined ({} attached{})",
            self.context.document,
            self.sessions.len(),
            if decision.view_only { ", view-only" } else { "" }
        );

        if self.worker_ready() {
            self.attach(ctx, id);
        }
        if !leftover.is_empty() && self.on_session_input(ctx, id, leftover, false) == Disposition::Close {
            ctx.close(token);
        }
        self.apply_backpressure(ctx);
        Ok(id)
    }

    /// Forget session `id`. Starts the linger timer when it was the last one.
    pub fn remove_session(&mut self, ctx: &mut PollContext, id: u32) {
        let Some(session) = self.sessions.remove(&id) else {
            return;
        };
        log::info!(
            "[broker {}] Session {id} left ({} remaining)",
            self.context.document,
            self.sessions.len()
        );

        if session.attached && self.state != BrokerState::Unloading {
            self.held.push_back(Held::Leave { session: id });
            self.pump_held(ctx);
        }

        if self.sessions.is_empty() {
            self.linger_since = Some(ctx.now());
            if self.edits_since_save > 0 && self.request_save(ctx) {
                log::info!("[broker {}] Autosaving after last session left", self.context.document);
            }
        }
        self.check_unloaded(ctx);
        self.apply_backpressure(ctx);
    }

    fn disconnect_session(&mut self, ctx: &mut PollContext, id: u32, reason: DisconnectReason, message: &str) {
        let deadline = ctx.now() + self.process.config.grace_period();
        if let Some(session) = self.sessions.get_mut(&id) {
            log::info!("[broker {}] Disconnecting session {id}: {message}", self.context.document);
            session.begin_close(reason, message, deadline);
            ctx.schedule(session.token, Interest::WRITABLE);
        }
    }

    fn worker_ready(&self) -> bool {
        matches!(self.state, BrokerState::Live | BrokerState::Saving)
            && self
                .worker
                .as_ref()
                .is_some_and(|w| !matches!(w.state, WorkerState::Starting | WorkerState::Dead))
    }

    /// Tell the worker about session `id`.
    fn attach(&mut self, ctx: &mut PollContext, id: u32) {
        let (Some(record), Some(session)) = (self.worker.as_mut(), self.sessions.get_mut(&id)) else {
            return;
        };
        if session.attached || session.closing.is_some() {
            return;
        }
        let joined = Frame::Joined { session: id, view_only: session.view_only };
        if record.outbound.enqueue_frame(joined.encode()).is_ok() {
            session.attached = true;
            record.refresh_busy();
            if let Some(token) = record.token {
                ctx.schedule(token, Interest::WRITABLE);
            }
        }
    }

    /// Bytes arrived from session `id`.
    pub fn on_session_input(&mut self, ctx: &mut PollContext, id: u32, bytes: &[u8], eof: bool) -> Disposition {
        let now = ctx.now();
        let Some(session) = self.sessions.get_mut(&id) else {
            return Disposition::Close;
        };
        if session.closing.is_some() {
            return if eof { Disposition::Close } else { Disposition::Continue };
        }
        if !bytes.is_empty() {
            session.last_activity = now;
        }

        let frames = match decode_frames(&mut session.decoder, &mut session.assembler, bytes) {
            Ok(frames) => frames,
            Err(e) => {
                self.disconnect_session(ctx, id, DisconnectReason::ProtocolError, &e.to_string());
                self.apply_backpressure(ctx);
                return Disposition::Continue;
            }
        };

        let mut leaving = eof;
        for frame in frames {
            if self.handle_session_frame(ctx, id, frame) == Disposition::Close {
                leaving = true;
                break;
            }
        }
        self.pump_held(ctx);
        self.apply_backpressure(ctx);

        if leaving {
            Disposition::Close
        } else {
            Disposition::Continue
        }
    }

    fn handle_session_frame(&mut self, ctx: &mut PollContext, id: u32, frame: Frame) -> Disposition {
        let blobs = Arc::clone(&self.process.blobs);
        let Some(session) = self.sessions.get_mut(&id) else {
            return Disposition::Close;
        };
        if session.closing.is_some() {
            return Disposition::Continue;
        }

        let reply = match frame {
            Frame::Message { data, .. } => {
                if session.view_only {
                    log::warn!("[broker {}] Dropping edit from view-only session {id}", self.context.document);
                    Some(Frame::error(DisconnectReason::Unauthorized, "view-only session cannot edit"))
                } else {
                    self.edits_since_save += 1;
                    self.held_bytes += data.len();
                    self.held.push_back(Held::Edit { session: id, data });
                    None
                }
            }
            Frame::Save => {
                if session.view_only {
                    Some(Frame::error(DisconnectReason::Unauthorized, "view-only session cannot save"))
                } else {
                    // Edits still held are not in this save; they mark the document dirty again.
                    self.pump_held(ctx);
                    if !self.request_save(ctx) {
                        log::debug!("[broker {}] Save from session {id} deferred", self.context.document);
                    }
                    None
                }
            }
            Frame::Ping => Some(Frame::Pong),
            Frame::Leave { .. } => return Disposition::Close,
            Frame::BlobPut(data) => Some(Frame::BlobRef(blobs.put(&data))),
            Frame::BlobGet(key) => Some(match blobs.get(&key) {
                Some(data) => Frame::BlobData(data.to_vec()),
                None => Frame::error(DisconnectReason::ProtocolError, format!("unknown blob {key}")),
            }),
            other => {
                let message = format!("unexpected frame type 0x{:02x}", other.kind());
                self.disconnect_session(ctx, id, DisconnectReason::ProtocolError, &message);
                return Disposition::Continue;
            }
        };

        if let Some(reply) = reply {
            if let Some(session) = self.sessions.get_mut(&id) {
                if session.send(&reply) {
                    ctx.schedule(session.token, Interest::WRITABLE);
                } else {
                    self.disconnect_session(ctx, id, DisconnectReason::SlowConsumer, "outbound buffer full");
                }
            }
        }
        Disposition::Continue
    }

    // ─── Worker ────────────────────────────────────────────────────────────

    /// Ask the worker to save. Returns whether a save was started.
    pub fn request_save(&mut self, ctx: &mut PollContext) -> bool {
        if self.state != BrokerState::Live || !self.worker_ready() {
            return false;
        }
        let Some(record) = self.worker.as_mut() else {
            return false;
        };
        if record.outbound.enqueue_frame(Frame::Save.encode()).is_err() {
            return false;
        }
        record.save_pending = true;
        record.refresh_busy();
        if let Some(token) = record.token {
            ctx.schedule(token, Interest::WRITABLE);
        }
        self.state = BrokerState::Saving;
        self.edits_in_save = std::mem::take(&mut self.edits_since_save);
        true
    }

    /// Bytes arrived from the worker with pid `pid`.
    pub fn on_worker_input(&mut self, ctx: &mut PollContext, pid: u32, bytes: &[u8], eof: bool) -> Disposition {
        let now = ctx.now();
        let Some(record) = self.worker.as_mut().filter(|w| w.pid == pid) else {
            return Disposition::Close;
        };

        let frames = match decode_frames(&mut record.decoder, &mut record.assembler, bytes) {
            Ok(frames) => frames,
            Err(e) => {
                self.handle_worker_death(ctx, e);
                self.apply_backpressure(ctx);
                return Disposition::Continue;
            }
        };

        for frame in frames {
            let Some(record) = self.worker.as_mut().filter(|w| w.pid == pid) else {
                break;
            };
            if let Err(e) = record.on_frame(&frame, now) {
                self.handle_worker_death(ctx, e);
                break;
            }
            match self.process.relay.relay_from_worker(frame) {
                Routed::Deliver { target, data } => self.deliver(ctx, target, &data),
                Routed::Control(Frame::Ready { .. }) => self.on_worker_ready(ctx),
                Routed::Control(Frame::SaveAck { ok }) => self.on_save_ack(ctx, ok),
                Routed::Control(Frame::ShutdownAck) => {
                    log::debug!("[broker {}] Worker {pid} acknowledged shutdown", self.context.document);
                }
                Routed::Control(Frame::Pong) => {}
                Routed::Control(other) => log::warn!(
                    "[broker {}] Ignoring frame type 0x{:02x} from worker",
                    self.context.document,
                    other.kind()
                ),
            }
        }
        self.apply_backpressure(ctx);

        if eof {
            Disposition::Close
        } else {
            Disposition::Continue
        }
    }

    fn on_worker_ready(&mut self, ctx: &mut PollContext) {
        if self.state != BrokerState::Loading {
            return;
        }
        self.state = BrokerState::Live;
        log::info!("[broker {}] Live", self.context.document);

        let ids: Vec<u32> = self.sessions.keys().copied().collect();
        for id in ids {
            self.attach(ctx, id);
        }
        if std::mem::take(&mut self.resync_pending) {
            for session in self.sessions.values_mut().filter(|s| s.closing.is_none()) {
                if session.send(&Frame::Resync) {
                    ctx.schedule(session.token, Interest::WRITABLE);
                }
            }
        }
        self.pump_held(ctx);
    }

    fn on_save_ack(&mut self, ctx: &mut PollContext, ok: bool) {
        if ok {
            log::info!("[broker {}] Saved", self.context.document);
        } else {
            log::warn!("[broker {}] Save failed", self.context.document);
            self.edits_since_save += self.edits_in_save;
        }
        self.edits_in_save = 0;
        if self.state == BrokerState::Saving {
            self.state = BrokerState::Live;
            self.pump_held(ctx);
        }
    }

    /// Deliver a worker payload to sessions.
    fn deliver(&mut self, ctx: &mut PollContext, target: Target, data: &[u8]) {
        let relay = self.process.relay;
        let failed = match target {
            Target::Broadcast => relay.relay_to_sessions(self.sessions.values_mut(), data, |s: &Session| {
                s.closing.is_none()
            }),
            Target::Session(id) => relay.relay_to_sessions(self.sessions.values_mut(), data, |s: &Session| {
                s.id == id && s.closing.is_none()
            }),
        };
        for session in self.sessions.values().filter(|s| !s.outbound.is_empty()) {
            ctx.schedule(session.token, Interest::WRITABLE);
        }
        for (id, err) in failed {
            self.disconnect_session(ctx, id, err.disconnect_reason(), &err.to_string());
        }
    }

    /// Move held edits to the worker queue while the worker can take them.
    fn pump_held(&mut self, ctx: &mut PollContext) {
        if self.state != BrokerState::Live || !self.worker_ready() {
            return;
        }
        let relay = self.process.relay;
        let Some(record) = self.worker.as_mut() else {
            return;
        };
        let mut rejected = Vec::new();
        while !record.outbound.is_congested() {
            let Some(entry) = self.held.pop_front() else {
                break;
            };
            self.held_bytes -= entry.len();
            match entry {
                Held::Edit { session, data } => {
                    self.next_seq += 1;
                    if let Err(e) = relay.relay_to_worker(&mut record.outbound, session, self.next_seq, &data) {
                        log::error!("[broker {}] Edit from session {session} refused: {e}", self.context.document);
                        rejected.push((session, e));
                    }
                }
                Held::Leave { session } => {
                    if let Err(e) = record.outbound.enqueue_frame(Frame::Leave { session }.encode()) {
                        log::warn!("[broker {}] Could not forward leave of {session}: {e}", self.context.document);
                    }
                }
            }
        }
        record.refresh_busy();
        if let Some(token) = record.token.filter(|_| !record.outbound.is_empty()) {
            ctx.schedule(token, Interest::WRITABLE);
        }
        for (id, err) in rejected {
            self.disconnect_session(ctx, id, err.disconnect_reason(), &err.to_string());
        }
    }

    // ─── Sockets ───────────────────────────────────────────────────────────

    /// Write what is queued for `endpoint`.
    ///
    /// # Errors
    ///
    /// Write failures; the engine closes the socket.
    pub fn flush_endpoint(&mut self, ctx: &mut PollContext, endpoint: Endpoint, stream: &mut Stream) -> io::Result<Disposition> {
        match endpoint {
            Endpoint::Session(id) => {
                let Some(session) = self.sessions.get_mut(&id) else {
                    return Ok(Disposition::Close);
                };
                let drained = session.outbound.flush(stream)?;
                if drained && session.closing.is_some() {
                    return Ok(Disposition::Close);
                }
            }
            Endpoint::Worker(pid) => {
                let Some(record) = self.worker.as_mut().filter(|w| w.pid == pid) else {
                    return Ok(Disposition::Close);
                };
                record.outbound.flush(stream)?;
                record.refresh_busy();
                self.pump_held(ctx);
            }
        }
        self.apply_backpressure(ctx);
        Ok(Disposition::Continue)
    }

    /// A socket owned by this broker was closed by the engine.
    pub fn endpoint_closed(&mut self, ctx: &mut PollContext, endpoint: Endpoint) {
        match endpoint {
            Endpoint::Session(id) => self.remove_session(ctx, id),
            Endpoint::Worker(pid) => {
                let Some(record) = self.worker.as_mut().filter(|w| w.pid == pid) else {
                    return;
                };
                if record.is_terminating() || self.state == BrokerState::Unloading {
                    record.mark_dead();
                    self.check_unloaded(ctx);
                } else {
                    log::warn!("[broker {}] Worker {pid} closed its control channel", self.context.document);
                    self.handle_worker_death(ctx, Error::WorkerCrashed { pid });
                }
                self.apply_backpressure(ctx);
            }
        }
    }

    // ─── Back-pressure ─────────────────────────────────────────────────────

    fn inbound_blocked(&self) -> bool {
        self.held_bytes >= self.process.config.outbound_high_water
            || self.worker.as_ref().is_some_and(|w| w.outbound.is_congested())
    }

    /// Pause reading from sessions while the worker cannot keep up, and from
    /// the worker while any session cannot.
    fn apply_backpressure(&mut self, ctx: &mut PollContext) {
        let blocked = self.inbound_blocked();
        for session in self.sessions.values_mut() {
            let pause = blocked || session.closing.is_some();
            if pause != session.read_paused {
                session.read_paused = pause;
                ctx.update_interest(session.token, if pause { Interest::WRITABLE } else { Interest::BOTH });
            }
        }

        let now = ctx.now();
        let mut congested = false;
        for session in self.sessions.values_mut() {
            if session.closing.is_none() && session.outbound.is_congested() {
                congested = true;
                session.congested_since.get_or_insert(now);
            } else {
                session.congested_since = None;
            }
        }
        if let Some(token) = self.worker.as_ref().and_then(|w| w.token) {
            if congested != self.worker_read_paused {
                self.worker_read_paused = congested;
                ctx.update_interest(token, if congested { Interest::WRITABLE } else { Interest::BOTH });
            }
        }
    }

    #[cfg(test)]
    fn session_mut(&mut self, id: u32) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    #[cfg(test)]
    fn worker_token(&self) -> Option<mio::Token> {
        self.worker.as_ref().and_then(|w| w.token)
    }
}
