//! Poll engine handler for every socket a broker owns.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use super::SharedBroker;
use crate::constants::READ_BUDGET;
use crate::poll::{Disposition, PollContext, SocketHandler};
use crate::socket::{read_available, Stream};

/// Which broker endpoint a socket is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// A client session.
    Session(u32),
    /// The control channel of the worker with this pid.
    Worker(u32),
}

/// Owns one stream and forwards its readiness to the broker.
#[derive(Debug)]
pub(crate) struct BrokerSocket {
    broker: SharedBroker,
    endpoint: Endpoint,
    stream: Stream,
    buf: Vec<u8>,
}

impl BrokerSocket {
    pub(crate) fn new(broker: SharedBroker, endpoint: Endpoint, stream: Stream) -> Self {
        Self {
            broker,
            endpoint,
            stream,
            buf: Vec::new(),
        }
    }
}

impl SocketHandler for BrokerSocket {
    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn on_readable(&mut self, ctx: &mut PollContext) -> io::Result<Disposition> {
        self.buf.clear();
        let status = read_available(&mut self.stream, &mut self.buf, READ_BUDGET)?;

        let mut broker = self.broker.lock().expect("broker mutex poisoned");
        let disposition = match self.endpoint {
            Endpoint::Session(id) => broker.on_session_input(ctx, id, &self.buf, status.eof),
            Endpoint::Worker(pid) => broker.on_worker_input(ctx, pid, &self.buf, status.eof),
        };
        if disposition == Disposition::Continue && status.exhausted_budget {
            return Ok(Disposition::Again);
        }
        Ok(disposition)
    }

    fn on_writable(&mut self, ctx: &mut PollContext) -> io::Result<Disposition> {
        let mut broker = self.broker.lock().expect("broker mutex poisoned");
        broker.flush_endpoint(ctx, self.endpoint, &mut self.stream)
    }

    fn on_disconnect(&mut self, ctx: &mut PollContext) {
        self.stream.shutdown();
        let mut broker = self.broker.lock().expect("broker mutex poisoned");
        broker.endpoint_closed(ctx, self.endpoint);
    }
}
