//! Worker process handle
//!
//! Owns one worker: its message channel, its exit notification and the means
//! to signal it. Reads and writes run on background tasks so the supervisor
//! never blocks on the channel.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::ipc::{ChildMessage, IpcError, IpcReader, IpcWriter, decode};

/// Environment variable telling the worker which fd carries the channel
pub const CHANNEL_FD_ENV: &str = "CHILD_BRIDGE_CHANNEL_FD";

/// File descriptor the channel is attached to inside the worker
pub const CHANNEL_FD: i32 = 3;

/// Name of the worker executable
pub const WORKER_BINARY: &str = "child-bridge-worker";

/// How a worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl WorkerExit {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    /// Exit whose status could not be observed
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Signals delivered to a worker process
pub trait ProcessControl: Send + 'static {
    /// Ask the worker to terminate (SIGTERM)
    fn terminate(&mut self) -> io::Result<()>;

    /// Force the worker down (SIGKILL)
    fn kill(&mut self) -> io::Result<()>;
}

/// Something that happened to a worker
#[derive(Debug)]
pub enum WorkerEvent {
    /// A well-formed message arrived
    Message(ChildMessage),
    /// A frame arrived that is not one of the known messages
    Malformed(IpcError),
    /// The process exited and its output streams closed
    Exited(WorkerExit),
}

/// Launches worker processes
pub trait Launcher: Send + Sync + 'static {
    fn launch(&self, args: &[String]) -> io::Result<ProcessHandle>;
}

/// Handle to one running worker
pub struct ProcessHandle {
    pid: Option<u32>,
    connected: Arc<AtomicBool>,
    outgoing: mpsc::UnboundedSender<ChildMessage>,
    incoming: mpsc::UnboundedReceiver<Result<ChildMessage, IpcError>>,
    incoming_open: bool,
    exit: Option<oneshot::Receiver<WorkerExit>>,
    control: Box<dyn ProcessControl>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl ProcessHandle {
    /// Assemble a handle from a byte channel, an exit notification and a signaller
    pub fn from_parts<R, W>(
        pid: Option<u32>,
        reader: R,
        writer: W,
        exit: oneshot::Receiver<WorkerExit>,
        control: Box<dyn ProcessControl>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let connected = Arc::new(AtomicBool::new(true));
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming) = mpsc::unbounded_channel();

        let reader_task = tokio::spawn(read_loop(IpcReader::new(reader), incoming_tx, Arc::clone(&connected)));
        let writer_task = tokio::spawn(write_loop(IpcWriter::new(writer), outgoing_rx, Arc::clone(&connected)));

        Self {
            pid,
            connected,
            outgoing,
            incoming,
            incoming_open: true,
            exit: Some(exit),
            control,
            reader_task,
            writer_task,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the message channel is still usable
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Queue a message for the worker.
    ///
    /// Returns `false` when the channel is disconnected and the message was
    /// dropped. There is no acknowledgement and no retry.
    pub fn send(&self, msg: ChildMessage) -> bool {
        if !self.is_connected() {
            debug!("Channel disconnected, dropping '{}' message", msg.id());
            return false;
        }
        self.outgoing.send(msg).is_ok()
    }

    /// Wait for the next event. Messages already received win over the exit.
    pub async fn next_event(&mut self) -> WorkerEvent {
        loop {
            tokio::select! {
                biased;
                item = self.incoming.recv(), if self.incoming_open => match item {
                    Some(Ok(msg)) => return WorkerEvent::Message(msg),
                    Some(Err(err)) => return WorkerEvent::Malformed(err),
                    None => self.incoming_open = false,
                },
                exit = wait_exit(&mut self.exit) => return WorkerEvent::Exited(exit),
            }
        }
    }

    /// Send SIGTERM
    pub fn terminate(&mut self) {
        if let Err(e) = self.control.terminate() {
            warn!("Failed to signal worker {:?}: {}", self.pid, e);
        }
    }

    /// Send SIGKILL
    pub fn kill(&mut self) {
        if let Err(e) = self.control.kill() {
            warn!("Failed to kill worker {:?}: {}", self.pid, e);
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn wait_exit(exit: &mut Option<oneshot::Receiver<WorkerExit>>) -> WorkerExit {
    let Some(rx) = exit.as_mut() else {
        return std::future::pending().await;
    };
    let status = rx.await.unwrap_or_else(|_| WorkerExit::unknown());
    *exit = None;
    status
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: IpcReader<R>,
    tx: mpsc::UnboundedSender<Result<ChildMessage, IpcError>>,
    connected: Arc<AtomicBool>,
) {
    loop {
        match reader.recv_frame().await {
            Ok(Some(frame)) => {
                if tx.send(decode(&frame)).is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("Worker closed its channel");
                break;
            }
            Err(e) => {
                debug!("Error reading from worker channel: {}", e);
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: IpcWriter<W>,
    mut rx: mpsc::UnboundedReceiver<ChildMessage>,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = writer.send(&msg).await {
            debug!("Failed to send '{}' to worker: {}", msg.id(), e);
            connected.store(false, Ordering::SeqCst);
            break;
        }
    }
}

/// Locate the worker executable: next to the current executable, else `PATH`
pub fn default_worker_path() -> PathBuf {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join(WORKER_BINARY);
            if candidate.exists() {
                return candidate;
            }
        }
    }
    PathBuf::from(WORKER_BINARY)
}

#[cfg(unix)]
pub use os::OsLauncher;

#[cfg(unix)]
mod os {
    use std::io;
    use std::os::fd::{AsRawFd, RawFd};
    use std::path::{Path, PathBuf};
    use std::process::Stdio;

    use nix::fcntl::{FcntlArg, FdFlag, fcntl};
    use nix::sys::signal::{self, Signal};
    use nix::unistd::{Pid, dup2};
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio::process::Command;
    use tokio::sync::oneshot;
    use tracing::{debug, warn};

    use super::{CHANNEL_FD, CHANNEL_FD_ENV, Launcher, ProcessControl, ProcessHandle, WorkerExit};

    /// Spawns real worker processes
    #[derive(Debug, Clone)]
    pub struct OsLauncher {
        program: PathBuf,
        base_args: Vec<String>,
    }

    impl OsLauncher {
        pub fn new(program: impl Into<PathBuf>) -> Self {
            Self {
                program: program.into(),
                base_args: Vec::new(),
            }
        }

        /// Arguments placed before the option flags
        pub fn with_base_args(mut self, args: Vec<String>) -> Self {
            self.base_args = args;
            self
        }

        pub fn program(&self) -> &Path {
            &self.program
        }
    }

    impl Launcher for OsLauncher {
        fn launch(&self, args: &[String]) -> io::Result<ProcessHandle> {
            let (parent_end, child_end) = std::os::unix::net::UnixStream::pair()?;
            parent_end.set_nonblocking(true)?;
            let channel = tokio::net::UnixStream::from_std(parent_end)?;
            let child_fd = child_end.as_raw_fd();

            let mut cmd = Command::new(&self.program);
            cmd.args(&self.base_args)
                .args(args)
                .env(CHANNEL_FD_ENV, CHANNEL_FD.to_string())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            // SAFETY: the hook only calls dup2/fcntl, which are async-signal-safe.
            unsafe {
                cmd.pre_exec(move || attach_channel(child_fd));
            }

            let mut child = cmd.spawn()?;
            drop(child_end);

            let pid = child.id();
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            let (exit_tx, exit_rx) = oneshot::channel();

            tokio::spawn(async move {
                let out = stdout.map(|s| tokio::spawn(forward(s, tokio::io::stdout())));
                let err = stderr.map(|s| tokio::spawn(forward(s, tokio::io::stderr())));

                let exit = match child.wait().await {
                    Ok(status) => WorkerExit::from_status(status),
                    Err(e) => {
                        warn!("Failed to wait for worker {:?}: {}", pid, e);
                        WorkerExit::unknown()
                    }
                };

                // The exit event is only reported once both streams have closed
                for task in [out, err].into_iter().flatten() {
                    let _ = task.await;
                }
                let _ = exit_tx.send(exit);
            });

            let (read_half, write_half) = channel.into_split();
            Ok(ProcessHandle::from_parts(
                pid,
                read_half,
                write_half,
                exit_rx,
                Box::new(SignalControl { pid }),
            ))
        }
    }

    /// Make `fd` available as the channel fd in the child, without close-on-exec
    fn attach_channel(fd: RawFd) -> io::Result<()> {
        if fd == CHANNEL_FD {
            fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
        } else {
            dup2(fd, CHANNEL_FD)?;
        }
        Ok(())
    }

    async fn forward<R, W>(mut src: R, mut dst: W)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if let Err(e) = tokio::io::copy(&mut src, &mut dst).await {
            debug!("Worker output forwarding stopped: {}", e);
        }
    }

    struct SignalControl {
        pid: Option<u32>,
    }

    impl SignalControl {
        fn send(&self, sig: Signal) -> io::Result<()> {
            let Some(pid) = self.pid else {
                return Ok(());
            };
            signal::kill(Pid::from_raw(pid as i32), sig)?;
            Ok(())
        }
    }

    impl ProcessControl for SignalControl {
        fn terminate(&mut self) -> io::Result<()> {
            self.send(Signal::SIGTERM)
        }

        fn kill(&mut self) -> io::Result<()> {
            self.send(Signal::SIGKILL)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    struct NoopControl;

    impl ProcessControl for NoopControl {
        fn terminate(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn kill(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Worker {
        reader: IpcReader<ReadHalf<DuplexStream>>,
        writer: IpcWriter<WriteHalf<DuplexStream>>,
        exit: oneshot::Sender<WorkerExit>,
    }

    fn pair() -> (ProcessHandle, Worker) {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (our_read, our_write) = tokio::io::split(ours);
        let (their_read, their_write) = tokio::io::split(theirs);
        let (exit_tx, exit_rx) = oneshot::channel();

        let handle = ProcessHandle::from_parts(Some(42), our_read, our_write, exit_rx, Box::new(NoopControl));
        let worker = Worker {
            reader: IpcReader::new(their_read),
            writer: IpcWriter::new(their_write),
            exit: exit_tx,
        };
        (handle, worker)
    }

    #[tokio::test]
    async fn test_send_reaches_worker() {
        let (handle, mut worker) = pair();

        assert!(handle.send(ChildMessage::Start));
        assert_eq!(worker.reader.recv().await.unwrap(), Some(ChildMessage::Start));
        assert_eq!(handle.pid(), Some(42));
    }

    #[tokio::test]
    async fn test_messages_then_exit() {
        let (mut handle, mut worker) = pair();

        worker.writer.send(&ChildMessage::Ready).await.unwrap();
        worker.writer.send_frame(br#"{"id":"unknown"}"#).await.unwrap();

        assert!(matches!(handle.next_event().await, WorkerEvent::Message(ChildMessage::Ready)));
        assert!(matches!(handle.next_event().await, WorkerEvent::Malformed(_)));

        worker.exit.send(WorkerExit { code: Some(1), signal: None }).unwrap();
        match handle.next_event().await {
            WorkerEvent::Exited(exit) => assert_eq!(exit.code, Some(1)),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_eof_disconnects_and_drops_sends() {
        let (mut handle, worker) = pair();
        let Worker { reader, writer, exit } = worker;
        drop(writer);
        drop(reader);

        // Exit comes after the channel closes
        let waiter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = exit.send(WorkerExit::unknown());
        });

        assert!(matches!(handle.next_event().await, WorkerEvent::Exited(_)));
        assert!(!handle.is_connected());
        assert!(!handle.send(ChildMessage::Start));
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_exit_sender_is_unknown_exit() {
        let (mut handle, worker) = pair();
        drop(worker);

        match handle.next_event().await {
            WorkerEvent::Exited(exit) => assert_eq!(exit, WorkerExit::unknown()),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_exit_display() {
        assert_eq!(WorkerExit { code: Some(2), signal: None }.to_string(), "code 2");
        assert_eq!(WorkerExit { code: None, signal: Some(15) }.to_string(), "signal 15");
        assert_eq!(WorkerExit::unknown().to_string(), "unknown status");
        assert!(WorkerExit { code: Some(0), signal: None }.success());
    }

    #[cfg(unix)]
    mod os {
        use super::*;

        fn shell(script: &str) -> OsLauncher {
            OsLauncher::new("/bin/sh").with_base_args(vec!["-c".into(), script.into()])
        }

        async fn exit_of(handle: &mut ProcessHandle) -> WorkerExit {
            loop {
                if let WorkerEvent::Exited(exit) = handle.next_event().await {
                    return exit;
                }
            }
        }

        #[tokio::test]
        async fn test_exit_code_reported() {
            let mut handle = shell("exit 3").launch(&[]).unwrap();

            let exit = tokio::time::timeout(Duration::from_secs(10), exit_of(&mut handle))
                .await
                .unwrap();
            assert_eq!(exit.code, Some(3));
        }

        #[tokio::test]
        async fn test_channel_on_fd_three() {
            let script = r#"[ "$CHILD_BRIDGE_CHANNEL_FD" = 3 ] || exit 9; printf '\000\000\000\016{"id":"ready"}' >&3"#;
            let mut handle = shell(script).launch(&[]).unwrap();

            let event = tokio::time::timeout(Duration::from_secs(10), handle.next_event())
                .await
                .unwrap();
            assert!(matches!(event, WorkerEvent::Message(ChildMessage::Ready)));

            let exit = tokio::time::timeout(Duration::from_secs(10), exit_of(&mut handle))
                .await
                .unwrap();
            assert!(exit.success());
        }

        #[tokio::test]
        async fn test_terminate_sends_sigterm() {
            let mut handle = shell("exec sleep 30").launch(&[]).unwrap();
            assert!(handle.pid().is_some());

            handle.terminate();

            let exit = tokio::time::timeout(Duration::from_secs(10), exit_of(&mut handle))
                .await
                .unwrap();
            assert_eq!(exit.signal, Some(15));
        }
    }
}
