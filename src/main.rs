//! Collabd - collaborative document server.
//!
//! This is the main binary entry point. See the `collabd` library for the
//! core functionality.

use anyhow::{Context, Result};
use collabd::client::DocumentClient;
use collabd::context::ProcessContext;
use collabd::env::Environment;
use collabd::relay::protocol::Frame;
use collabd::sandbox::{self, SandboxRole};
use collabd::worker::child::{self, WorkerOptions};
use collabd::worker::ChannelLimits;
use collabd::{Config, Server};
use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Version of this build.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Global flag for signal-triggered shutdown (as Arc for signal-hook compatibility)
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

/// Runs the server until SIGINT or SIGTERM.
fn run_server(config_path: Option<PathBuf>) -> Result<()> {
    use signal_hook::consts::signal::{SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;

    let environment = Environment::current();
    let config = Config::load(config_path.as_deref())?;
    log::info!("Collabd v{VERSION} starting ({environment})");

    // The front-end runs under the wide Supervisor profile; workers lock
    // themselves down separately after exec.
    sandbox::enforce(SandboxRole::Supervisor, config.sandbox_required)
        .context("Supervisor sandbox is required in production")?;

    let process = ProcessContext::from_config(config, environment)?;
    let server = Server::start(process)?;
    println!("collabd listening on {}", server.local_addr());

    let mut last_report = Instant::now();
    while !SHUTDOWN_FLAG.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
        if last_report.elapsed() >= Duration::from_secs(60) {
            last_report = Instant::now();
            let summaries = server.summaries();
            log::info!("[server] {} documents open", summaries.len());
            for s in &summaries {
                log::debug!(
                    "[server] {} {} sessions={} worker={:?} longest_idle={:?}",
                    s.document,
                    s.state,
                    s.sessions,
                    s.worker_pid,
                    s.longest_idle
                );
            }
        }
    }

    println!("Shutting down...");
    server.shutdown()
}

/// Joins a document, sends `messages` as edits and prints what comes back.
fn run_client(connect: &str, document: &str, token: &str, messages: &[String], wait: Duration) -> Result<()> {
    let mut client = DocumentClient::connect(connect, document, token)
        .with_context(|| format!("Failed to join {document} at {connect}"))?;
    println!(
        "joined {document} as session {}{}",
        client.session(),
        if client.view_only() { " (view only)" } else { "" }
    );
    client.set_read_timeout(Some(wait))?;

    for message in messages {
        client.send_edit(message.as_bytes())?;
    }

    loop {
        match client.recv() {
            Ok(Some(Frame::Message { data, .. })) => println!("{}", String::from_utf8_lossy(&data)),
            Ok(Some(Frame::Error(notice))) => println!("error: {} ({})", notice.reason, notice.message),
            Ok(Some(Frame::Resync)) => println!("resync"),
            Ok(Some(other)) => log::debug!("Ignoring frame type 0x{:02x}", other.kind()),
            Ok(None) => {
                println!("disconnected");
                return Ok(());
            }
            Err(collabd::Error::Io(e))
                if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) =>
            {
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    client.leave()?;
    Ok(())
}

// CLI
#[derive(Parser)]
#[command(name = "collabd")]
#[command(version = VERSION)]
#[command(about = "Collaborative document server with sandboxed per-document workers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the document server
    Serve {
        /// Path to a JSON config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run a document worker (started by the server)
    #[command(hide = true)]
    Worker {
        /// Document identifier
        #[arg(long)]
        document_id: String,
        /// Jail id assigned by the supervisor
        #[arg(long)]
        jail_id: Option<String>,
        /// Document file to open before lockdown
        #[arg(long)]
        document: Option<PathBuf>,
        /// Resource-limit directive, e.g. "limit_cpu 30"
        #[arg(long = "limit")]
        limits: Vec<String>,
        /// Keep running if the sandbox cannot be installed
        #[arg(long)]
        allow_unsandboxed: bool,
        /// Chunk size of the control channel
        #[arg(long, default_value_t = collabd::constants::DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
        /// Largest control channel frame
        #[arg(long, default_value_t = collabd::constants::DEFAULT_MAX_FRAME_SIZE)]
        max_frame_size: u32,
    },
    /// Join a document, send edits, print the broadcasts
    Client {
        /// Server address (host:port) or Unix socket path
        #[arg(long, default_value = collabd::constants::DEFAULT_LISTEN_ADDR)]
        connect: String,
        /// Document to join
        #[arg(long)]
        document: String,
        /// Authorization token
        #[arg(long, default_value = "")]
        token: String,
        /// Edit payload to send; repeatable
        #[arg(long = "message")]
        messages: Vec<String>,
        /// Seconds to wait for more frames
        #[arg(long, default_value_t = 2)]
        wait_secs: u64,
    },
}

fn init_logging() {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    if let Ok(path) = std::env::var("COLLABD_LOG_FILE") {
        match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Could not open log file {path}: {e}; logging to stderr"),
        }
    }
    builder.init();
}

fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => run_server(config)?,
        Commands::Worker {
            document_id,
            jail_id,
            document,
            limits,
            allow_unsandboxed,
            chunk_size,
            max_frame_size,
        } => child::run(WorkerOptions {
            document_id,
            jail_id,
            document,
            limits,
            allow_unsandboxed,
            channel: ChannelLimits {
                chunk_size,
                max_frame_size,
            },
        })?,
        Commands::Client {
            connect,
            document,
            token,
            messages,
            wait_secs,
        } => run_client(&connect, &document, &token, &messages, Duration::from_secs(wait_secs))?,
    }

    Ok(())
}
