//! Child Bridge Worker
//!
//! Launched by the child bridge supervisor. The message channel is inherited
//! on the fd named by `CHILD_BRIDGE_CHANNEL_FD`; stdout and stderr are
//! forwarded by the parent, so logs go to stderr.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};

use child_bridge::ipc::{IpcReader, IpcWriter};
use child_bridge::process::CHANNEL_FD_ENV;
use child_bridge_worker::{PluginRegistry, WorkerRuntime};

/// Flags forwarded by the supervisor
#[derive(Parser, Debug)]
#[command(name = "child-bridge-worker")]
struct Args {
    #[arg(short = 'D')]
    debug: bool,

    #[arg(short = 'C')]
    color: bool,

    #[arg(short = 'I')]
    insecure: bool,

    #[arg(short = 'T')]
    no_timestamp: bool,

    #[arg(short = 'K')]
    keep_orphans: bool,

    #[arg(short = 'Q')]
    no_qrcode: bool,

    #[arg(short = 'U')]
    user_storage_path: Option<PathBuf>,

    #[arg(short = 'P')]
    plugin_path: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(args.color)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()));
    if args.no_timestamp {
        builder.without_time().init();
    } else {
        builder.init();
    }

    let fd: i32 = std::env::var(CHANNEL_FD_ENV)
        .with_context(|| format!("{} is not set", CHANNEL_FD_ENV))?
        .parse()
        .with_context(|| format!("{} is not a file descriptor", CHANNEL_FD_ENV))?;

    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;

    rt.block_on(async {
        let (reader, writer) = open_channel(fd)?;
        info!("Worker {} started", std::process::id());
        log_flags(&args);

        let runtime = WorkerRuntime::new(PluginRegistry::with_builtin());
        runtime.run(IpcReader::new(reader), IpcWriter::new(writer)).await?;
        Ok::<(), anyhow::Error>(())
    })
}

fn log_flags(args: &Args) {
    if args.insecure {
        info!("Insecure access enabled");
    }
    if args.keep_orphans {
        info!("Keeping orphaned cached accessories");
    }
    if args.no_qrcode {
        debug!("Setup QR code hidden");
    }
    if let Some(path) = &args.user_storage_path {
        info!("Storage path: {}", path.display());
    }
    if let Some(path) = &args.plugin_path {
        info!("Plugin path: {}", path.display());
    }
}

#[cfg(unix)]
fn open_channel(fd: i32) -> Result<(tokio::net::unix::OwnedReadHalf, tokio::net::unix::OwnedWriteHalf)> {
    use std::os::fd::FromRawFd;

    // SAFETY: the fd is handed to us by the parent and owned by nothing else in this process.
    let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
    stream.set_nonblocking(true)?;
    let stream = tokio::net::UnixStream::from_std(stream).context("Failed to attach channel")?;
    Ok(stream.into_split())
}

#[cfg(not(unix))]
fn open_channel(_fd: i32) -> Result<(tokio::io::Empty, tokio::io::Sink)> {
    anyhow::bail!("Child bridge workers require a unix platform")
}
