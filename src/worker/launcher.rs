//! Starting worker processes.
//!
//! [`ProcessLauncher`] re-executes the current binary as
//! `collabd worker --document-id <id> ...` with one end of a socketpair
//! installed at [`WORKER_CONTROL_FD`]. [`InProcessLauncher`] runs the worker
//! loop on a thread instead, for embedding and tests.

// Rust guideline compliant 2026-02

use std::fmt;
use std::io;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::JoinHandle;

use super::DocumentContext;
use crate::constants::WORKER_CONTROL_FD;

/// A running worker, as the supervisor sees it.
pub trait WorkerProcess: Send + fmt::Debug {
    /// Operating-system process id (or a synthetic id for in-process workers).
    fn pid(&self) -> u32;

    /// Non-blocking exit check. `Some(description)` once the worker is gone.
    fn try_exit(&mut self) -> io::Result<Option<String>>;

    /// Stop the worker immediately and reap it.
    fn kill(&mut self) -> io::Result<()>;
}

/// A freshly started worker and the supervisor's end of its control socket.
#[derive(Debug)]
pub struct LaunchedWorker {
    /// The process handle.
    pub process: Box<dyn WorkerProcess>,
    /// Connected control channel; blocking mode.
    pub control: UnixStream,
}

/// Starts workers for documents.
pub trait WorkerLauncher: Send + Sync + fmt::Debug {
    /// Start a worker for `document`.
    ///
    /// # Errors
    ///
    /// Any failure to create the control channel or the process.
    fn launch(&self, document: &DocumentContext) -> io::Result<LaunchedWorker>;
}

// ─── Child processes ───

/// Launches workers as child processes of a binary that has a `worker`
/// subcommand.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    binary: PathBuf,
}

impl ProcessLauncher {
    /// Launch workers from `binary`.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }

    fn command(&self, document: &DocumentContext) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("worker")
            .arg("--document-id")
            .arg(&document.document)
            .arg("--jail-id")
            .arg(document.jail_id.to_string())
            .arg("--chunk-size")
            .arg(document.channel.chunk_size.to_string())
            .arg("--max-frame-size")
            .arg(document.channel.max_frame_size.to_string());
        if let Some(path) = &document.document_path {
            cmd.arg("--document").arg(path);
        }
        for limit in &document.limits {
            cmd.arg("--limit").arg(limit);
        }
        if !document.sandbox_required {
            cmd.arg("--allow-unsandboxed");
        }
        cmd.stdin(Stdio::null());
        cmd
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, document: &DocumentContext) -> io::Result<LaunchedWorker> {
        let (parent, child_end) = UnixStream::pair()?;
        let child_fd = child_end.as_raw_fd();

        let mut cmd = self.command(document);
        // SAFETY: the hook only calls async-signal-safe functions (dup2, fcntl).
        unsafe {
            cmd.pre_exec(move || {
                if child_fd == WORKER_CONTROL_FD {
                    // Already in place; dup2 would be a no-op that keeps CLOEXEC.
                    let flags = libc::fcntl(child_fd, libc::F_GETFD);
                    if flags < 0 || libc::fcntl(child_fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                } else if libc::dup2(child_fd, WORKER_CONTROL_FD) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn()?;
        drop(child_end);

        log::info!(
            "[supervisor] Spawned worker pid {} for document {} (jail {})",
            child.id(),
            document.document,
            document.jail_id
        );
        Ok(LaunchedWorker {
            process: Box::new(ChildProcess { child, reaped: false }),
            control: parent,
        })
    }
}

/// A worker child process. Killed and reaped on drop if still running.
#[derive(Debug)]
struct ChildProcess {
    child: Child,
    reaped: bool,
}

impl WorkerProcess for ChildProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn try_exit(&mut self) -> io::Result<Option<String>> {
        if self.reaped {
            return Ok(Some("reaped".to_string()));
        }
        let status = self.child.try_wait()?;
        if status.is_some() {
            self.reaped = true;
        }
        Ok(status.map(|s| s.to_string()))
    }

    fn kill(&mut self) -> io::Result<()> {
        if self.reaped {
            return Ok(());
        }
        match self.child.kill() {
            Ok(()) => {}
            // Already exited, still needs reaping.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e),
        }
        self.child.wait()?;
        self.reaped = true;
        Ok(())
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if !self.reaped {
            if let Err(e) = self.kill() {
                log::warn!("[supervisor] Failed to reap worker pid {}: {e}", self.child.id());
            }
        }
    }
}

// ─── In-process workers ───

/// Synthetic pids for in-process workers; far above any real pid_max.
static NEXT_THREAD_PID: AtomicU32 = AtomicU32::new(0x4000_0000);

/// Runs the worker loop with an [`EchoRenderer`](super::renderer::EchoRenderer)
/// on a thread of the current process. No sandbox is applied.
#[derive(Debug, Clone, Copy, Default)]
pub struct InProcessLauncher;

impl WorkerLauncher for InProcessLauncher {
    fn launch(&self, document: &DocumentContext) -> io::Result<LaunchedWorker> {
        let (parent, child_end) = UnixStream::pair()?;
        let shutdown_end = child_end.try_clone()?;
        let pid = NEXT_THREAD_PID.fetch_add(1, Ordering::Relaxed);
        let name = document.document.clone();
        let limits = document.channel;

        let handle = std::thread::Builder::new()
            .name(format!("worker-{pid}"))
            .spawn(move || {
                let mut renderer = super::renderer::EchoRenderer::new(name, &[]);
                if let Err(e) = super::child::serve(child_end, &mut renderer, pid, limits) {
                    log::debug!("[worker] In-process worker {pid} ended: {e}");
                }
            })?;

        Ok(LaunchedWorker {
            process: Box::new(ThreadProcess {
                pid,
                handle: Some(handle),
                socket: shutdown_end,
            }),
            control: parent,
        })
    }
}

/// An in-process worker thread. Killing it severs its socket.
#[derive(Debug)]
struct ThreadProcess {
    pid: u32,
    handle: Option<JoinHandle<()>>,
    socket: UnixStream,
}

impl WorkerProcess for ThreadProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_exit(&mut self) -> io::Result<Option<String>> {
        match &self.handle {
            None => Ok(Some("joined".to_string())),
            Some(h) if h.is_finished() => {
                if let Some(h) = self.handle.take() {
                    let _ = h.join();
                }
                Ok(Some("finished".to_string()))
            }
            Some(_) => Ok(None),
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
        Ok(())
    }
}

impl Drop for ThreadProcess {
    fn drop(&mut self) {
        let _ = self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::framing::FrameDecoder;
    use crate::relay::protocol::Frame;
    use std::io::Read;

    fn document() -> DocumentContext {
        DocumentContext::new("doc-a")
    }

    #[test]
    fn test_in_process_worker_announces_ready() {
        let mut launched = InProcessLauncher.launch(&document()).unwrap();
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 256];
        let n = launched.control.read(&mut buf).unwrap();
        let frames = decoder.feed(&buf[..n]).unwrap();
        let ready = Frame::decode(&frames[0]).unwrap();
        assert_eq!(ready, Frame::Ready { pid: launched.process.pid() });

        launched.process.kill().unwrap();
        assert!(launched.process.try_exit().unwrap().is_some());
    }

    #[test]
    fn test_command_line_carries_document_and_limits() {
        let mut doc = document();
        doc.document_path = Some(PathBuf::from("/tmp/a.odt"));
        doc.limits = vec!["limit_cpu 30".to_string()];
        doc.sandbox_required = false;
        doc.channel.chunk_size = 4096;
        let cmd = ProcessLauncher::new("/bin/collabd").command(&doc);
        let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args[0], "worker");
        assert!(args.windows(2).any(|w| w[0] == "--document-id" && w[1] == "doc-a"));
        assert!(args.windows(2).any(|w| w[0] == "--document" && w[1] == "/tmp/a.odt"));
        assert!(args.windows(2).any(|w| w[0] == "--limit" && w[1] == "limit_cpu 30"));
        assert!(args.iter().any(|a| a == "--allow-unsandboxed"));
        assert!(args.windows(2).any(|w| w[0] == "--chunk-size" && w[1] == "4096"));
        assert!(args
            .windows(2)
            .any(|w| w[0] == "--max-frame-size" && w[1] == doc.channel.max_frame_size.to_string()));
    }

    #[test]
    fn test_failed_exec_is_reported() {
        let err = ProcessLauncher::new("/nonexistent/collabd").launch(&document()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
