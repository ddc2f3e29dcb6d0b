//! Socket handles shared by the listener, the brokers and the worker channel.
//!
//! Client connections arrive over TCP or a Unix socket; the worker control
//! channel is always a Unix socketpair. [`Stream`] hides the difference so the
//! broker handles both the same way. All streams registered with a poll
//! engine are non-blocking; [`read_available`] drains them up to a budget.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

/// A connected byte stream.
#[derive(Debug)]
pub enum Stream {
    /// TCP client connection.
    Tcp(TcpStream),
    /// Unix domain socket (client connection or worker control channel).
    Unix(UnixStream),
}

impl Stream {
    /// Switch the stream to non-blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Self::Tcp(s) => {
                s.set_nodelay(true)?;
                s.set_nonblocking(nonblocking)
            }
            Self::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    /// Shut down both directions, ignoring "not connected".
    pub fn shutdown(&self) {
        let result = match self {
            Self::Tcp(s) => s.shutdown(std::net::Shutdown::Both),
            Self::Unix(s) => s.shutdown(std::net::Shutdown::Both),
        };
        if let Err(e) = result {
            if e.kind() != io::ErrorKind::NotConnected {
                log::debug!("[socket] shutdown failed: {e}");
            }
        }
    }
}

impl From<TcpStream> for Stream {
    fn from(s: TcpStream) -> Self {
        Self::Tcp(s)
    }
}

impl From<UnixStream> for Stream {
    fn from(s: UnixStream) -> Self {
        Self::Unix(s)
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Unix(s) => s.flush(),
        }
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(s) => s.as_raw_fd(),
            Self::Unix(s) => s.as_raw_fd(),
        }
    }
}

/// Result of draining a non-blocking reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadStatus {
    /// Bytes appended to the buffer.
    pub bytes: usize,
    /// The peer closed its end.
    pub eof: bool,
    /// Stopped because the budget ran out; more data may be pending.
    pub exhausted_budget: bool,
}

/// Read from a non-blocking `reader` into `buf` until it would block, hits
/// EOF, or `budget` bytes have been read.
///
/// With edge-triggered readiness a socket that still has data after the
/// budget runs out will not fire again, so callers must re-dispatch it
/// themselves when `exhausted_budget` is set.
pub fn read_available(reader: &mut impl Read, buf: &mut Vec<u8>, budget: usize) -> io::Result<ReadStatus> {
    let mut status = ReadStatus::default();
    let mut chunk = [0u8; 16 * 1024];
    while status.bytes < budget {
        let want = chunk.len().min(budget - status.bytes);
        match reader.read(&mut chunk[..want]) {
            Ok(0) => {
                status.eof = true;
                return Ok(status);
            }
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                status.bytes += n;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(status),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    status.exhausted_budget = true;
    Ok(status)
}
