//! Worker side of the control channel.
//!
//! [`run`] is the body of `collabd worker`: it takes over the control socket
//! at [`WORKER_CONTROL_FD`], opens the document, applies resource limits,
//! locks itself down, and only then reads document bytes and announces
//! readiness. [`serve`] is the blocking frame loop that follows.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::FromRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use anyhow::{bail, Context};

use super::renderer::{EchoRenderer, Outgoing, Renderer};
use super::ChannelLimits;
use crate::constants::WORKER_CONTROL_FD;
use crate::relay::chunk::encode_message_unit;
use crate::relay::protocol::Frame;
use crate::relay::decode_frames;
use crate::sandbox::{self, rlimit, SandboxRole};

/// Options of the `worker` subcommand.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// Document identifier, for logs and the process title.
    pub document_id: String,
    /// Jail id assigned by the supervisor.
    pub jail_id: Option<String>,
    /// Document file to pre-open before lockdown.
    pub document: Option<PathBuf>,
    /// Resource-limit directives.
    pub limits: Vec<String>,
    /// Continue if the sandbox cannot be installed.
    pub allow_unsandboxed: bool,
    /// Frame limits shared with the supervisor.
    pub channel: ChannelLimits,
}

/// Run a worker process to completion.
///
/// # Errors
///
/// Fails if the control channel is missing, the document cannot be opened,
/// the sandbox is required but unavailable, or the control channel breaks.
pub fn run(opts: WorkerOptions) -> anyhow::Result<()> {
    let jail = opts.jail_id.as_deref().unwrap_or("-");
    proctitle::set_title(format!("collabd-worker {} [{jail}]", opts.document_id));

    // SAFETY: F_GETFD only inspects the descriptor table.
    if unsafe { libc::fcntl(WORKER_CONTROL_FD, libc::F_GETFD) } < 0 {
        bail!("control channel fd {WORKER_CONTROL_FD} is not open; workers are started by `collabd serve`");
    }
    // SAFETY: the launcher installed our end of the socketpair at this fd and
    // nothing else in this process owns it.
    let control = unsafe { UnixStream::from_raw_fd(WORKER_CONTROL_FD) };

    let document = opts
        .document
        .as_ref()
        .map(|p| File::open(p).with_context(|| format!("opening document {}", p.display())))
        .transpose()?;

    for line in &opts.limits {
        if !rlimit::handle_directive_line(line) {
            log::warn!("[worker] Ignoring unrecognized limit directive {line:?}");
        }
    }

    sandbox::enforce(SandboxRole::Renderer, !opts.allow_unsandboxed)?;

    let mut content = Vec::new();
    if let Some(mut file) = document {
        file.read_to_end(&mut content).context("reading document")?;
    }
    log::info!(
        "[worker] {} loaded {} bytes (jail {jail})",
        opts.document_id,
        content.len()
    );

    let mut renderer = EchoRenderer::new(opts.document_id, &content);
    serve(control, &mut renderer, std::process::id(), opts.channel)?;
    Ok(())
}

/// Announce readiness, then serve control frames until shutdown or EOF.
///
/// Replies are chunked and incoming frames bounded by `limits`, which must
/// match the supervisor's end of the channel.
///
/// # Errors
///
/// I/O errors on the channel and malformed frames.
pub fn serve<S: Read + Write>(
    mut stream: S,
    renderer: &mut impl Renderer,
    pid: u32,
    limits: ChannelLimits,
) -> crate::Result<()> {
    stream.write_all(&Frame::Ready { pid }.encode())?;

    let mut decoder = limits.decoder();
    let mut assembler = limits.assembler();
    let mut seq = 0u64;
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => {
                log::info!("[worker] Control channel closed, exiting");
                return Ok(());
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };

        for frame in decode_frames(&mut decoder, &mut assembler, &buf[..n])? {
            let replies = match frame {
                Frame::Shutdown => {
                    stream.write_all(&Frame::ShutdownAck.encode())?;
                    log::info!("[worker] Shutdown requested");
                    return Ok(());
                }
                Frame::Ping => {
                    stream.write_all(&Frame::Pong.encode())?;
                    continue;
                }
                Frame::Save => {
                    let ok = renderer.save();
                    stream.write_all(&Frame::SaveAck { ok }.encode())?;
                    continue;
                }
                Frame::Joined { session, view_only } => renderer.session_joined(session, view_only),
                Frame::Leave { session } => {
                    renderer.session_left(session);
                    continue;
                }
                Frame::Message { session, data, .. } => renderer.handle_message(session, &data),
                other => {
                    log::debug!("[worker] Ignoring frame type 0x{:02x}", other.kind());
                    continue;
                }
            };
            send(&mut stream, &mut seq, replies, limits.chunk_size)?;
        }
    }
}

fn send<W: Write>(stream: &mut W, seq: &mut u64, replies: Vec<Outgoing>, chunk_size: usize) -> io::Result<()> {
    for out in replies {
        *seq += 1;
        for frame in encode_message_unit(out.session, *seq, &out.data, chunk_size) {
            stream.write_all(&frame)?;
        }
    }
    Ok(())
}
