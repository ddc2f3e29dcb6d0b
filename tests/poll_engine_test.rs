//! Integration tests for the poll engine.
//!
//! These drive real engine threads over Unix socket pairs and observe
//! dispatch from the outside through channels.

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::mpsc;
use std::time::Duration;

use collabd::poll::{Disposition, Interest, PollContext, PollEngine, SocketHandler};

const WAIT: Duration = Duration::from_secs(5);

fn pair() -> (UnixStream, UnixStream) {
    let (peer, sock) = UnixStream::pair().unwrap();
    sock.set_nonblocking(true).unwrap();
    peer.set_read_timeout(Some(WAIT)).unwrap();
    (peer, sock)
}

fn drain(stream: &mut UnixStream) -> io::Result<Option<Vec<u8>>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Some(out)),
            Err(e) => return Err(e),
        }
    }
}

/// Records which callbacks ran.
struct Recorder {
    stream: UnixStream,
    tx: mpsc::Sender<String>,
    pause_after_read: bool,
}

impl SocketHandler for Recorder {
    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn on_readable(&mut self, ctx: &mut PollContext) -> io::Result<Disposition> {
        let Some(data) = drain(&mut self.stream)? else {
            return Ok(Disposition::Close);
        };
        let _ = self.tx.send(format!("read:{}", String::from_utf8_lossy(&data)));
        if let Some(token) = ctx.current_token() {
            if self.pause_after_read {
                ctx.update_interest(token, Interest::NONE);
            } else {
                ctx.update_interest(token, Interest::BOTH);
                ctx.schedule(token, Interest::WRITABLE);
            }
        }
        Ok(Disposition::Continue)
    }

    fn on_writable(&mut self, ctx: &mut PollContext) -> io::Result<Disposition> {
        let _ = self.tx.send("write".to_string());
        self.stream.write_all(b"ack")?;
        if let Some(token) = ctx.current_token() {
            ctx.update_interest(token, Interest::READABLE);
        }
        Ok(Disposition::Continue)
    }

    fn on_disconnect(&mut self, _ctx: &mut PollContext) {
        let _ = self.tx.send("disconnect".to_string());
    }
}

#[test]
fn test_scheduled_write_runs_in_same_cycle() {
    let engine = PollEngine::start("it-schedule", Duration::from_millis(50)).unwrap();
    let (tx, rx) = mpsc::channel();
    let (mut peer, sock) = pair();
    engine.handle().register_socket(
        Box::new(Recorder { stream: sock, tx, pause_after_read: false }),
        Interest::READABLE,
    );

    peer.write_all(b"hello").unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "read:hello");
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "write");
    let mut ack = [0u8; 3];
    peer.read_exact(&mut ack).unwrap();
    assert_eq!(&ack, b"ack");
    engine.join().unwrap();
}

#[test]
fn test_paused_socket_resumes_with_buffered_data() {
    let engine = PollEngine::start("it-pause", Duration::from_millis(20)).unwrap();
    let handle = engine.handle();
    let (tx, rx) = mpsc::channel();
    let (mut peer, sock) = pair();
    let token = handle.register_socket(
        Box::new(Recorder { stream: sock, tx, pause_after_read: true }),
        Interest::READABLE,
    );

    peer.write_all(b"one").unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "read:one");

    peer.write_all(b"two").unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err(), "paused socket was dispatched");

    handle.update_interest(token, Interest::READABLE);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "read:two");
    engine.join().unwrap();
}

#[test]
fn test_deregister_skips_disconnect_and_close_runs_it() {
    let engine = PollEngine::start("it-remove", Duration::from_millis(20)).unwrap();
    let handle = engine.handle();
    let (tx, rx) = mpsc::channel();

    let (_quiet_peer, quiet) = pair();
    let quiet_token = handle.register_socket(
        Box::new(Recorder { stream: quiet, tx: tx.clone(), pause_after_read: false }),
        Interest::READABLE,
    );
    handle.deregister(quiet_token);
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    let (peer, sock) = pair();
    handle.register_socket(Box::new(Recorder { stream: sock, tx, pause_after_read: false }), Interest::READABLE);
    drop(peer);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), "disconnect");
    engine.join().unwrap();
}

#[test]
fn test_tokens_are_never_reused() {
    let engine = PollEngine::start("it-tokens", Duration::from_millis(20)).unwrap();
    let handle = engine.handle();
    let (tx, _rx) = mpsc::channel();
    let mut last = 0;
    for _ in 0..16 {
        let (_peer, sock) = pair();
        let token = handle.register_socket(
            Box::new(Recorder { stream: sock, tx: tx.clone(), pause_after_read: false }),
            Interest::READABLE,
        );
        assert!(token.0 > last, "token {} after {last}", token.0);
        last = token.0;
        handle.deregister(token);
    }
    engine.join().unwrap();
}

/// Asks to run again a fixed number of times without a new edge.
struct Repeater {
    stream: UnixStream,
    remaining: usize,
    tx: mpsc::Sender<usize>,
}

impl SocketHandler for Repeater {
    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn on_readable(&mut self, _ctx: &mut PollContext) -> io::Result<Disposition> {
        let _ = self.tx.send(self.remaining);
        if self.remaining == 0 {
            let _ = drain(&mut self.stream)?;
            return Ok(Disposition::Continue);
        }
        self.remaining -= 1;
        Ok(Disposition::Again)
    }
}

#[test]
fn test_again_redispatches_without_new_data() {
    let engine = PollEngine::start("it-again", Duration::from_millis(50)).unwrap();
    let (tx, rx) = mpsc::channel();
    let (mut peer, sock) = pair();
    engine
        .handle()
        .register_socket(Box::new(Repeater { stream: sock, remaining: 3, tx }), Interest::READABLE);

    peer.write_all(b"x").unwrap();
    let seen: Vec<usize> = (0..4).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    assert_eq!(seen, [3, 2, 1, 0]);
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    engine.join().unwrap();
}

#[test]
fn test_handle_rejects_work_after_join() {
    let engine = PollEngine::start("it-stopped", Duration::from_millis(20)).unwrap();
    let handle = engine.handle();
    engine.join().unwrap();
    assert!(handle.is_stopped());
    assert!(!handle.add_housekeeping(|_| true));
}
