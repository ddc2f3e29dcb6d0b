//! Callback-side view of a poll engine.
//!
//! Handlers never touch the engine's registration table directly. Everything
//! they ask for is recorded in the [`PollContext`] they are handed and applied
//! by the engine thread once the callback returns.

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Instant;

use mio::Token;

use super::PollHandle;

/// Readiness a socket is interested in, or was reported with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    /// Readable.
    pub readable: bool,
    /// Writable.
    pub writable: bool,
}

impl Interest {
    /// No readiness. The socket stays in the table but is not polled.
    pub const NONE: Self = Self { readable: false, writable: false };
    /// Readable only.
    pub const READABLE: Self = Self { readable: true, writable: false };
    /// Writable only.
    pub const WRITABLE: Self = Self { readable: false, writable: true };
    /// Readable and writable.
    pub const BOTH: Self = Self { readable: true, writable: true };

    /// Whether neither direction is set.
    pub fn is_none(self) -> bool {
        !self.readable && !self.writable
    }

    pub(crate) fn to_mio(self) -> Option<mio::Interest> {
        match (self.readable, self.writable) {
            (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// What the engine should do with a socket after a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep the socket; wait for the next readiness edge.
    Continue,
    /// Keep the socket and dispatch the same callback again next cycle.
    ///
    /// Returned by handlers that stopped early to let other sockets run.
    Again,
    /// Close the socket: `on_disconnect` runs, then it is deregistered.
    Close,
}

/// Capability set of a registered socket.
///
/// Callbacks run on the engine thread and must not block.
pub trait SocketHandler: Send {
    /// Descriptor to multiplex on. Must stay valid while registered.
    fn raw_fd(&self) -> RawFd;

    /// The socket is readable (or hung up).
    fn on_readable(&mut self, ctx: &mut PollContext) -> io::Result<Disposition>;

    /// The socket is writable.
    fn on_writable(&mut self, _ctx: &mut PollContext) -> io::Result<Disposition> {
        Ok(Disposition::Continue)
    }

    /// The socket is being closed by the engine: a callback returned
    /// [`Disposition::Close`] or an error, or the engine is shutting down.
    fn on_disconnect(&mut self, _ctx: &mut PollContext) {}
}

/// One-shot closure run on the engine thread.
pub type Callback = Box<dyn FnOnce(&mut PollContext) + Send>;

/// Periodic closure run on every tick; returning `false` removes it.
pub type Housekeeping = Box<dyn FnMut(&mut PollContext) -> bool + Send>;

/// Deferred request recorded by a callback or posted from another thread.
pub(crate) enum Op {
    Register {
        token: Token,
        handler: Box<dyn SocketHandler>,
        interest: Interest,
    },
    Update {
        token: Token,
        interest: Interest,
    },
    /// Remove silently; the handler is dropped without `on_disconnect`.
    Deregister(Token),
    /// Remove through `on_disconnect`.
    Close(Token),
    /// Dispatch a callback in the current cycle without waiting for an edge.
    Schedule {
        token: Token,
        ready: Interest,
    },
    Callback(Callback),
    Housekeeping(Housekeeping),
    Shutdown,
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register { token, interest, .. } => write!(f, "Register({}, {interest:?})", token.0),
            Self::Update { token, interest } => write!(f, "Update({}, {interest:?})", token.0),
            Self::Deregister(token) => write!(f, "Deregister({})", token.0),
            Self::Close(token) => write!(f, "Close({})", token.0),
            Self::Schedule { token, ready } => write!(f, "Schedule({}, {ready:?})", token.0),
            Self::Callback(_) => f.write_str("Callback"),
            Self::Housekeeping(_) => f.write_str("Housekeeping"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Per-callback context handed to handlers, callbacks and housekeeping.
#[derive(Debug)]
pub struct PollContext {
    now: Instant,
    current: Option<Token>,
    handle: Option<PollHandle>,
    ops: Vec<Op>,
}

impl PollContext {
    pub(crate) fn new(now: Instant, current: Option<Token>, handle: PollHandle) -> Self {
        Self {
            now,
            current,
            handle: Some(handle),
            ops: Vec::new(),
        }
    }

    /// A context not attached to any engine.
    ///
    /// Requests are recorded but never applied; tokens are still unique.
    /// Used to drive handlers and brokers directly in tests.
    pub fn detached(now: Instant) -> Self {
        Self {
            now,
            current: None,
            handle: None,
            ops: Vec::new(),
        }
    }

    /// Time the current cycle woke up.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Token of the socket whose callback is running, if any.
    pub fn current_token(&self) -> Option<Token> {
        self.current
    }

    /// Handle of the owning engine. `None` for detached contexts.
    pub fn handle(&self) -> Option<&PollHandle> {
        self.handle.as_ref()
    }

    /// Register a socket; it is adopted once the callback returns.
    pub fn register(&mut self, handler: Box<dyn SocketHandler>, interest: Interest) -> Token {
        let token = match &self.handle {
            Some(h) => h.next_token(),
            None => super::detached_token(),
        };
        self.ops.push(Op::Register { token, handler, interest });
        token
    }

    /// Change the readiness a socket is polled for. Always re-arms the
    /// edge, so data that arrived while paused is reported again.
    pub fn update_interest(&mut self, token: Token, interest: Interest) {
        self.ops.push(Op::Update { token, interest });
    }

    /// Remove a socket without running its `on_disconnect`.
    pub fn deregister(&mut self, token: Token) {
        self.ops.push(Op::Deregister(token));
    }

    /// Close a socket through its `on_disconnect`.
    pub fn close(&mut self, token: Token) {
        self.ops.push(Op::Close(token));
    }

    /// Dispatch `ready` callbacks for `token` in this cycle.
    pub fn schedule(&mut self, token: Token, ready: Interest) {
        self.ops.push(Op::Schedule { token, ready });
    }

    /// Run `f` on the engine thread after the current callback.
    pub fn add_callback(&mut self, f: impl FnOnce(&mut PollContext) + Send + 'static) {
        self.ops.push(Op::Callback(Box::new(f)));
    }

    /// Run `f` on every tick until it returns `false`.
    pub fn add_housekeeping(&mut self, f: impl FnMut(&mut PollContext) -> bool + Send + 'static) {
        self.ops.push(Op::Housekeeping(Box::new(f)));
    }

    /// Stop the owning engine.
    pub fn request_shutdown(&mut self) {
        self.ops.push(Op::Shutdown);
    }

    /// Tokens registered through this context, in order.
    pub fn registered_tokens(&self) -> Vec<Token> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::Register { token, .. } => Some(*token),
                _ => None,
            })
            .collect()
    }

    /// Tokens deregistered or closed through this context, in order.
    pub fn removed_tokens(&self) -> Vec<Token> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::Deregister(token) | Op::Close(token) => Some(*token),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn take_ops(&mut self) -> Vec<Op> {
        std::mem::take(&mut self.ops)
    }
}
