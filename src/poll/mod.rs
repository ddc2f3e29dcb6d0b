//! Multiplexing poll engine.
//!
//! One engine is one dedicated thread blocking in `epoll`/`kqueue` (through
//! `mio`) over a dynamic set of sockets. Readiness is dispatched synchronously
//! to each socket's [`SocketHandler`] on that thread; a periodic tick runs
//! housekeeping closures (liveness checks, linger expiry) even when idle.
//!
//! # Threading
//!
//! ```text
//! foreign thread ──PollHandle::register_socket──► pending queue (Mutex) ──wake──┐
//!                                                                              ▼
//! engine thread:  apply pending ─► poll(tick) ─► dispatch ready ─► apply ops ─► tick
//! ```
//!
//! Registration from another thread goes through the lock-protected pending
//! queue and is adopted at the start of the next cycle. Callbacks on the
//! engine thread record requests in their [`PollContext`] instead, which the
//! engine applies as soon as the callback returns.
//!
//! Sockets are registered edge-triggered. A handler that stops reading early
//! (read budget) returns [`Disposition::Again`] and is re-dispatched next
//! cycle after the sockets that became ready in the meantime.
//!
//! # Failure
//!
//! An error returned by a handler closes that socket only. The thread exits
//! on [`PollHandle::request_shutdown`] or when the multiplexer itself fails;
//! the latter is returned from [`PollEngine::join`].

// Rust guideline compliant 2026-02

mod context;

pub use context::{Callback, Disposition, Housekeeping, Interest, PollContext, SocketHandler};
pub use mio::Token;

use context::Op;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Poll, Waker};

/// Token reserved for the engine's own wake primitive.
const WAKE_TOKEN: Token = Token(0);

/// Upper bound on drain passes at shutdown, in case `on_disconnect`
/// handlers keep registering sockets.
const MAX_DRAIN_ROUNDS: usize = 8;

static DETACHED_TOKENS: AtomicUsize = AtomicUsize::new(1_000_000_000);

pub(crate) fn detached_token() -> Token {
    Token(DETACHED_TOKENS.fetch_add(1, Ordering::Relaxed))
}

// ─── Handle ────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Shared {
    name: String,
    pending: Mutex<Vec<Op>>,
    waker: Waker,
    next_token: AtomicUsize,
    shutdown: AtomicBool,
    stopped: AtomicBool,
}

/// Thread-safe handle to a [`PollEngine`].
///
/// Cheap to clone; every request is queued and applied by the engine thread.
#[derive(Clone)]
pub struct PollHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for PollHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollHandle").field("name", &self.shared.name).finish()
    }
}

impl PollHandle {
    /// Engine name used in logs and the thread name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether the engine thread has finished draining.
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn next_token(&self) -> Token {
        Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Queue `op`; returns `false` if the engine has already stopped.
    fn push(&self, op: Op) -> bool {
        if self.is_stopped() {
            log::debug!("[poll:{}] Dropping {op:?}: engine stopped", self.shared.name);
            return false;
        }
        let was_empty = {
            let mut pending = self.shared.pending.lock().expect("poll pending queue poisoned");
            let was_empty = pending.is_empty();
            pending.push(op);
            was_empty
        };
        if was_empty {
            if let Err(e) = self.shared.waker.wake() {
                log::error!("[poll:{}] Failed to wake engine: {e}", self.shared.name);
            }
        }
        true
    }

    fn take_pending(&self) -> Vec<Op> {
        std::mem::take(&mut *self.shared.pending.lock().expect("poll pending queue poisoned"))
    }

    /// Register a socket from any thread. It is adopted on the next cycle.
    pub fn register_socket(&self, handler: Box<dyn SocketHandler>, interest: Interest) -> Token {
        let token = self.next_token();
        self.push(Op::Register { token, handler, interest });
        token
    }

    /// Change the readiness a socket is polled for.
    pub fn update_interest(&self, token: Token, interest: Interest) {
        self.push(Op::Update { token, interest });
    }

    /// Remove a socket without running its `on_disconnect`.
    pub fn deregister(&self, token: Token) {
        self.push(Op::Deregister(token));
    }

    /// Run `f` on the engine thread. Returns `false` if the engine stopped,
    /// in which case `f` is dropped without running.
    pub fn add_callback(&self, f: impl FnOnce(&mut PollContext) + Send + 'static) -> bool {
        self.push(Op::Callback(Box::new(f)))
    }

    /// Run `f` on every tick until it returns `false`.
    pub fn add_housekeeping(&self, f: impl FnMut(&mut PollContext) -> bool + Send + 'static) -> bool {
        self.push(Op::Housekeeping(Box::new(f)))
    }

    /// Ask the engine to drain and exit. Idempotent.
    pub fn request_shutdown(&self) {
        if !self.shared.shutdown.swap(true, Ordering::AcqRel) {
            log::debug!("[poll:{}] Shutdown requested", self.shared.name);
        }
        if let Err(e) = self.shared.waker.wake() {
            log::error!("[poll:{}] Failed to wake engine: {e}", self.shared.name);
        }
    }
}

// ─── Engine ────────────────────────────────────────────────────────────────

/// An owned poll engine thread. Dropping it shuts it down and joins.
pub struct PollEngine {
    handle: PollHandle,
    thread: Option<thread::JoinHandle<io::Result<()>>>,
}

impl fmt::Debug for PollEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollEngine")
            .field("name", &self.handle.name())
            .field("running", &self.thread.is_some())
            .finish()
    }
}

impl PollEngine {
    /// Start an engine thread named `poll-<name>` with the given tick.
    pub fn start(name: &str, tick: Duration) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let handle = PollHandle {
            shared: Arc::new(Shared {
                name: name.to_string(),
                pending: Mutex::new(Vec::new()),
                waker,
                next_token: AtomicUsize::new(WAKE_TOKEN.0 + 1),
                shutdown: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        };

        let mut engine = Engine {
            poll,
            handle: handle.clone(),
            tick,
            slots: HashMap::new(),
            housekeeping: Vec::new(),
            ready: VecDeque::new(),
            deferred: Vec::new(),
            shutdown: false,
            now: Instant::now(),
        };

        let thread = thread::Builder::new()
            .name(format!("poll-{name}"))
            .spawn(move || {
                log::info!("[poll:{}] Engine started (tick {:?})", engine.name(), engine.tick);
                let result = engine.run();
                engine.drain();
                match &result {
                    Ok(()) => log::info!("[poll:{}] Engine stopped", engine.name()),
                    Err(e) => log::error!("[poll:{}] Engine failed: {e}", engine.name()),
                }
                result
            })?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    /// Handle for registering sockets and posting work.
    pub fn handle(&self) -> PollHandle {
        self.handle.clone()
    }

    /// Request shutdown and wait for the thread to drain and exit.
    ///
    /// # Errors
    ///
    /// The multiplexer error that stopped the engine, or a panic in a callback.
    pub fn join(mut self) -> io::Result<()> {
        self.shutdown_and_join()
    }

    fn shutdown_and_join(&mut self) -> io::Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.handle.request_shutdown();
        if thread.thread().id() == thread::current().id() {
            return Err(io::Error::other("poll engine cannot join itself"));
        }
        thread
            .join()
            .map_err(|_| io::Error::other(format!("poll engine {} panicked", self.handle.name())))?
    }
}

impl Drop for PollEngine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown_and_join() {
            log::error!("[poll:{}] {e}", self.handle.name());
        }
    }
}

struct Slot {
    handler: Box<dyn SocketHandler>,
    interest: Interest,
    fd: RawFd,
    in_poll: bool,
}

struct Engine {
    poll: Poll,
    handle: PollHandle,
    tick: Duration,
    slots: HashMap<Token, Slot>,
    housekeeping: Vec<Housekeeping>,
    /// Work for the current cycle.
    ready: VecDeque<(Token, Interest)>,
    /// Sockets that asked to run again next cycle.
    deferred: Vec<(Token, Interest)>,
    shutdown: bool,
    now: Instant,
}

impl Engine {
    fn name(&self) -> &str {
        self.handle.name()
    }

    fn ctx(&self, current: Option<Token>) -> PollContext {
        PollContext::new(self.now, current, self.handle.clone())
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown || self.handle.shared.shutdown.load(Ordering::Acquire)
    }

    fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(256);
        let mut next_tick = Instant::now() + self.tick;

        loop {
            self.now = Instant::now();
            let pending = self.handle.take_pending();
            self.apply(pending);
            if self.shutdown_requested() {
                return Ok(());
            }

            let timeout = if self.ready.is_empty() && self.deferred.is_empty() {
                next_tick.saturating_duration_since(Instant::now())
            } else {
                Duration::ZERO
            };

            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
            self.now = Instant::now();

            for event in &events {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                let ready = Interest {
                    readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                    writable: event.is_writable() || event.is_write_closed() || event.is_error(),
                };
                self.ready.push_back((event.token(), ready));
            }
            self.ready.extend(self.deferred.drain(..));

            while let Some((token, ready)) = self.ready.pop_front() {
                self.dispatch(token, ready);
                if self.shutdown_requested() {
                    return Ok(());
                }
            }

            if self.now >= next_tick {
                self.run_housekeeping();
                next_tick = self.now + self.tick;
            }
        }
    }

    fn dispatch(&mut self, token: Token, ready: Interest) {
        let Some(mut slot) = self.slots.remove(&token) else {
            return;
        };
        let mut ctx = self.ctx(Some(token));
        let mut close = false;
        let mut again = Interest::NONE;

        if ready.readable && slot.interest.readable {
            match slot.handler.on_readable(&mut ctx) {
                Ok(Disposition::Continue) => {}
                Ok(Disposition::Again) => again.readable = true,
                Ok(Disposition::Close) => close = true,
                Err(e) => {
                    log::warn!("[poll:{}] Socket {} read failed, closing: {e}", self.name(), token.0);
                    close = true;
                }
            }
        }
        if !close && ready.writable && slot.interest.writable {
            match slot.handler.on_writable(&mut ctx) {
                Ok(Disposition::Continue) => {}
                Ok(Disposition::Again) => again.writable = true,
                Ok(Disposition::Close) => close = true,
                Err(e) => {
                    log::warn!("[poll:{}] Socket {} write failed, closing: {e}", self.name(), token.0);
                    close = true;
                }
            }
        }

        if close {
            slot.handler.on_disconnect(&mut ctx);
            self.unhook(token, &slot);
        } else {
            if !again.is_none() {
                self.deferred.push((token, again));
            }
            self.slots.insert(token, slot);
        }
        let ops = ctx.take_ops();
        self.apply(ops);
    }

    fn apply(&mut self, ops: Vec<Op>) {
        let mut queue: VecDeque<Op> = ops.into();
        while let Some(op) = queue.pop_front() {
            match op {
                Op::Register { token, handler, interest } => {
                    let fd = handler.raw_fd();
                    let mut slot = Slot { handler, interest, fd, in_poll: false };
                    if let Some(mio_interest) = interest.to_mio() {
                        if let Err(e) = self.poll.registry().register(&mut SourceFd(&fd), token, mio_interest) {
                            log::warn!("[poll:{}] Failed to register fd {fd}: {e}", self.name());
                            let mut ctx = self.ctx(Some(token));
                            slot.handler.on_disconnect(&mut ctx);
                            queue.extend(ctx.take_ops());
                            continue;
                        }
                        slot.in_poll = true;
                    }
                    log::trace!("[poll:{}] Registered socket {} (fd {fd})", self.name(), token.0);
                    self.slots.insert(token, slot);
                }
                Op::Update { token, interest } => {
                    if let Some(slot) = self.slots.get_mut(&token) {
                        slot.interest = interest;
                        let registry = self.poll.registry();
                        let result = match (interest.to_mio(), slot.in_poll) {
                            (Some(i), true) => registry.reregister(&mut SourceFd(&slot.fd), token, i),
                            (Some(i), false) => registry.register(&mut SourceFd(&slot.fd), token, i),
                            (None, true) => registry.deregister(&mut SourceFd(&slot.fd)),
                            (None, false) => Ok(()),
                        };
                        match result {
                            Ok(()) => slot.in_poll = interest.to_mio().is_some(),
                            Err(e) => {
                                log::warn!("[poll:{}] Failed to update socket {}: {e}", self.handle.name(), token.0);
                                queue.push_back(Op::Close(token));
                            }
                        }
                    }
                }
                Op::Deregister(token) => {
                    if let Some(slot) = self.slots.remove(&token) {
                        self.unhook(token, &slot);
                    }
                }
                Op::Close(token) => {
                    if let Some(mut slot) = self.slots.remove(&token) {
                        let mut ctx = self.ctx(Some(token));
                        slot.handler.on_disconnect(&mut ctx);
                        self.unhook(token, &slot);
                        queue.extend(ctx.take_ops());
                    }
                }
                Op::Schedule { token, ready } => self.ready.push_back((token, ready)),
                Op::Callback(f) => {
                    let mut ctx = self.ctx(None);
                    f(&mut ctx);
                    queue.extend(ctx.take_ops());
                }
                Op::Housekeeping(f) => self.housekeeping.push(f),
                Op::Shutdown => self.shutdown = true,
            }
        }
    }

    /// Remove `slot` from the multiplexer. The fd itself closes when the
    /// handler is dropped, which happens after this.
    fn unhook(&self, token: Token, slot: &Slot) {
        if slot.in_poll {
            if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&slot.fd)) {
                log::debug!("[poll:{}] Deregister of socket {} failed: {e}", self.name(), token.0);
            }
        }
        log::trace!("[poll:{}] Removed socket {}", self.name(), token.0);
    }

    fn run_housekeeping(&mut self) {
        let mut tasks = std::mem::take(&mut self.housekeeping);
        let mut ctx = self.ctx(None);
        tasks.retain_mut(|task| task(&mut ctx));
        // Tasks added while running were pushed to `self.housekeeping`.
        tasks.append(&mut self.housekeeping);
        self.housekeeping = tasks;
        let ops = ctx.take_ops();
        self.apply(ops);
    }

    /// Apply what is still pending, then close every socket.
    fn drain(&mut self) {
        self.now = Instant::now();
        let pending = self.handle.take_pending();
        self.apply(pending);

        for _ in 0..MAX_DRAIN_ROUNDS {
            if self.slots.is_empty() {
                break;
            }
            let tokens: Vec<Token> = self.slots.keys().copied().collect();
            for token in tokens {
                self.apply(vec![Op::Close(token)]);
            }
            let pending = self.handle.take_pending();
            self.apply(pending);
        }

        self.handle.shared.stopped.store(true, Ordering::Release);
        // Anything that raced in before `stopped` was visible.
        let late = self.handle.take_pending();
        drop(late);

        if !self.slots.is_empty() {
            log::warn!("[poll:{}] {} sockets still registered after drain", self.name(), self.slots.len());
            self.slots.clear();
        }
        self.housekeeping.clear();
        self.ready.clear();
        self.deferred.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc;

    struct Echo {
        stream: UnixStream,
    }

    impl SocketHandler for Echo {
        fn raw_fd(&self) -> RawFd {
            self.stream.as_raw_fd()
        }

        fn on_readable(&mut self, _ctx: &mut PollContext) -> io::Result<Disposition> {
            let mut buf = [0u8; 256];
            loop {
                match self.stream.read(&mut buf) {
                    Ok(0) => return Ok(Disposition::Close),
                    Ok(n) => self.stream.write_all(&buf[..n])?,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Disposition::Continue),
                    Err(e) => return Err(e),
                }
            }
        }
    }

    #[test]
    fn test_register_from_foreign_thread_and_echo() {
        let engine = PollEngine::start("test-echo", Duration::from_millis(50)).unwrap();
        let (mut client, server) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        engine.handle().register_socket(Box::new(Echo { stream: server }), Interest::READABLE);

        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        engine.join().unwrap();
    }

    #[test]
    fn test_callback_runs_on_engine_thread() {
        let engine = PollEngine::start("test-callback", Duration::from_millis(50)).unwrap();
        let (tx, rx) = mpsc::channel();
        assert!(engine.handle().add_callback(move |_ctx| {
            tx.send(thread::current().name().map(str::to_string)).unwrap();
        }));
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("poll-test-callback"));
    }

    #[test]
    fn test_housekeeping_runs_until_false() {
        let engine = PollEngine::start("test-tick", Duration::from_millis(10)).unwrap();
        let (tx, rx) = mpsc::channel();
        let mut runs = 0;
        engine.handle().add_housekeeping(move |_ctx| {
            runs += 1;
            tx.send(runs).unwrap();
            runs < 3
        });
        for expected in 1..=3 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), expected);
        }
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    struct Notify {
        stream: UnixStream,
        tx: mpsc::Sender<&'static str>,
    }

    impl SocketHandler for Notify {
        fn raw_fd(&self) -> RawFd {
            self.stream.as_raw_fd()
        }

        fn on_readable(&mut self, _ctx: &mut PollContext) -> io::Result<Disposition> {
            Err(io::Error::other("boom"))
        }

        fn on_disconnect(&mut self, _ctx: &mut PollContext) {
            let _ = self.tx.send("disconnected");
        }
    }

    #[test]
    fn test_handler_error_closes_only_that_socket() {
        let engine = PollEngine::start("test-error", Duration::from_millis(50)).unwrap();
        let (tx, rx) = mpsc::channel();
        let (mut bad_peer, bad) = UnixStream::pair().unwrap();
        bad.set_nonblocking(true).unwrap();
        engine.handle().register_socket(Box::new(Notify { stream: bad, tx }), Interest::READABLE);

        let (mut good_peer, good) = UnixStream::pair().unwrap();
        good.set_nonblocking(true).unwrap();
        engine.handle().register_socket(Box::new(Echo { stream: good }), Interest::READABLE);

        bad_peer.write_all(b"x").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "disconnected");

        good_peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        good_peer.write_all(b"still here").unwrap();
        let mut buf = [0u8; 10];
        good_peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"still here");
    }

    #[test]
    fn test_shutdown_disconnects_remaining_sockets() {
        let engine = PollEngine::start("test-drain", Duration::from_millis(50)).unwrap();
        let (tx, rx) = mpsc::channel();
        let (_peer, sock) = UnixStream::pair().unwrap();
        sock.set_nonblocking(true).unwrap();
        let handle = engine.handle();
        handle.register_socket(Box::new(Notify { stream: sock, tx }), Interest::READABLE);
        engine.join().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "disconnected");
        assert!(handle.is_stopped());
        assert!(!handle.add_callback(|_| {}));
    }

    #[test]
    fn test_detached_context_records_requests() {
        let mut ctx = PollContext::detached(Instant::now());
        let (_a, b) = UnixStream::pair().unwrap();
        let token = ctx.register(Box::new(Echo { stream: b }), Interest::READABLE);
        ctx.close(token);
        assert_eq!(ctx.registered_tokens(), vec![token]);
        assert_eq!(ctx.removed_tokens(), vec![token]);
        assert!(ctx.handle().is_none());
    }
}
