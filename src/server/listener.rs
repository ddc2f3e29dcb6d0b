//! Listening sockets on the acceptor engine.

use std::io;
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::greeter::Greeter;
use crate::broker::registry::BrokerRegistry;
use crate::context::ProcessContext;
use crate::poll::{Disposition, Interest, PollContext, SocketHandler};
use crate::socket::Stream;

/// A bound, non-blocking listener.
#[derive(Debug)]
pub(crate) enum Bound {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Bound {
    fn accept(&self) -> io::Result<Stream> {
        match self {
            Self::Tcp(l) => l.accept().map(|(s, _)| Stream::Tcp(s)),
            Self::Unix(l) => l.accept().map(|(s, _)| Stream::Unix(s)),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Tcp(_) => "tcp",
            Self::Unix(_) => "unix",
        }
    }
}

/// Accepts clients and registers a [`Greeter`] for each.
#[derive(Debug)]
pub(crate) struct Listener {
    bound: Bound,
    registry: BrokerRegistry,
    process: Arc<ProcessContext>,
}

impl Listener {
    pub(crate) fn new(bound: Bound, registry: BrokerRegistry, process: Arc<ProcessContext>) -> Self {
        Self { bound, registry, process }
    }

    fn greet(&self, ctx: &mut PollContext, stream: Stream) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        let deadline = ctx.now() + self.process.config.handshake_timeout();
        let settled = Arc::new(AtomicBool::new(false));
        let greeter = Greeter::new(
            stream,
            self.registry.clone(),
            Arc::clone(&self.process),
            deadline,
            Arc::clone(&settled),
        );
        let token = ctx.register(Box::new(greeter), Interest::READABLE);

        ctx.add_housekeeping(move |ctx| {
            if settled.load(Ordering::Acquire) {
                return false;
            }
            if ctx.now() >= deadline {
                ctx.close(token);
                return false;
            }
            true
        });
        Ok(())
    }
}

impl SocketHandler for Listener {
    fn raw_fd(&self) -> RawFd {
        match &self.bound {
            Bound::Tcp(l) => l.as_raw_fd(),
            Bound::Unix(l) => l.as_raw_fd(),
        }
    }

    fn on_readable(&mut self, ctx: &mut PollContext) -> io::Result<Disposition> {
        loop {
            match self.bound.accept() {
                Ok(stream) => {
                    if let Err(e) = self.greet(ctx, stream) {
                        log::warn!("[server] Could not prepare {} client: {e}", self.bound.kind());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Disposition::Continue),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(e) => {
                    // Out of descriptors and similar. The next connection re-arms the edge.
                    log::error!("[server] Accept on {} listener failed: {e}", self.bound.kind());
                    return Ok(Disposition::Continue);
                }
            }
        }
    }
}
