//! PTY process management
//!
//! Handles spawning processes with PTY terminal emulation, including:
//! - Ordered output and exit delivery over a single event channel
//! - Non-blocking stdin through a dedicated writer thread
//! - Terminal resize support
//! - Idempotent termination

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;
use uuid::Uuid;

/// Capacity of the output event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Read buffer size for the PTY master
const READ_BUFFER_SIZE: usize = 4096;

/// Errors that can occur during PTY operations
#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open PTY: {0}")]
    OpenFailed(String),

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Failed to resize PTY: {0}")]
    ResizeFailed(String),

    #[error("PTY system error: {0}")]
    SystemError(String),
}

/// Result type for PTY operations
pub type PtyResult<T> = Result<T, PtyError>;

/// Terminal size configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Convert to portable-pty PtySize
    fn to_pty_size(self) -> PtySize {
        PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Everything needed to start a process under a PTY
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    /// Program to execute
    pub program: String,
    /// Program arguments
    pub args: Vec<String>,
    /// Working directory, inherited when unset
    pub cwd: Option<PathBuf>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    /// Create a spec for a program with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Set the argument list
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the working directory
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Event emitted when a process exits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code reported by the process (1 when killed by a signal)
    pub code: i32,
    /// Exit reason
    pub reason: ExitReason,
}

/// Reason for process exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Process exited on its own
    Normal,
    /// Process was killed by request
    Killed,
    /// Exit status could not be collected
    Unknown,
}

/// Events produced by a PTY process, in the order they happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// Bytes read from the PTY master
    Output(Vec<u8>),
    /// The process terminated; always the last event
    Exit(ProcessExit),
}

/// Handle to a running PTY process
///
/// Output and exit are not read from the handle itself: `spawn` returns the
/// receiving end of the event channel so the owning task can consume it while
/// other tasks keep the handle for writes, resizes and termination.
pub struct PtyProcess {
    /// Unique identifier
    id: Uuid,
    /// The master PTY handle
    master: Mutex<Box<dyn MasterPty + Send>>,
    /// Current terminal size
    size: Mutex<TerminalSize>,
    /// Queue feeding the writer thread
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    /// Kill switch for the child process
    killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,
    /// Set once termination was requested
    closing: Arc<AtomicBool>,
}

impl PtyProcess {
    /// Spawn a new process with PTY
    ///
    /// Returns the process handle together with the receiver of its events.
    /// Output chunks arrive in read order and are followed by exactly one
    /// [`PtyEvent::Exit`].
    pub fn spawn(
        spec: &CommandSpec,
        size: TerminalSize,
    ) -> PtyResult<(Self, mpsc::Receiver<PtyEvent>)> {
        let id = Uuid::new_v4();

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(size.to_pty_size())
            .map_err(|e| PtyError::OpenFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            cmd.cwd(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        // Drop the slave - we only need the master
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SystemError(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SystemError(e.to_string()))?;
        let killer = child.clone_killer();

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let closing = Arc::new(AtomicBool::new(false));

        let reader_closing = Arc::clone(&closing);
        std::thread::spawn(move || {
            Self::reader_loop(reader, child, event_tx, reader_closing, id);
        });
        std::thread::spawn(move || {
            Self::writer_loop(writer, input_rx, id);
        });

        debug!("Spawned PTY process {} ({})", id, spec.program);

        Ok((
            Self {
                id,
                master: Mutex::new(pair.master),
                size: Mutex::new(size),
                input_tx,
                killer: StdMutex::new(killer),
                closing,
            },
            event_rx,
        ))
    }

    /// Reader loop that runs in a separate thread
    ///
    /// Forwards output until EOF, then reaps the child and reports its exit.
    fn reader_loop(
        mut reader: Box<dyn Read + Send>,
        mut child: Box<dyn portable_pty::Child + Send + Sync>,
        event_tx: mpsc::Sender<PtyEvent>,
        closing: Arc<AtomicBool>,
        id: Uuid,
    ) {
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        let mut receiver_alive = true;

        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    if receiver_alive
                        && event_tx
                            .blocking_send(PtyEvent::Output(buffer[..n].to_vec()))
                            .is_err()
                    {
                        // Keep draining so the child is never blocked on a full PTY
                        receiver_alive = false;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                // EIO on Linux once the slave side is gone
                Err(_) => break,
            }
        }

        let killed = closing.load(Ordering::SeqCst);
        let exit = match child.wait() {
            Ok(status) => ProcessExit {
                code: i32::try_from(status.exit_code()).unwrap_or(i32::MAX),
                reason: if killed {
                    ExitReason::Killed
                } else {
                    ExitReason::Normal
                },
            },
            Err(_) => ProcessExit {
                code: -1,
                reason: ExitReason::Unknown,
            },
        };

        debug!("PTY process {} exited: {:?}", id, exit);
        let _ = event_tx.blocking_send(PtyEvent::Exit(exit));
    }

    /// Writer loop that runs in a separate thread
    fn writer_loop(
        mut writer: Box<dyn Write + Send>,
        mut input_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        id: Uuid,
    ) {
        while let Some(data) = input_rx.blocking_recv() {
            if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                debug!("PTY process {} stopped accepting input: {}", id, e);
                break;
            }
        }
    }

    /// Get the process ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the current terminal size
    pub async fn size(&self) -> TerminalSize {
        *self.size.lock().await
    }

    /// Check if termination was requested
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Queue input for the process stdin
    ///
    /// Never blocks; input is silently dropped once the process is closing.
    pub fn write(&self, data: &[u8]) {
        if self.is_closing() || data.is_empty() {
            return;
        }
        let _ = self.input_tx.send(data.to_vec());
    }

    /// Resize the terminal
    ///
    /// Returns `false` when the size is unchanged or the process is closing.
    pub async fn resize(&self, cols: u16, rows: u16) -> PtyResult<bool> {
        if self.is_closing() {
            return Ok(false);
        }

        let new_size = TerminalSize::new(cols, rows);
        let mut size = self.size.lock().await;
        if *size == new_size {
            return Ok(false);
        }

        let master = self.master.lock().await;
        master
            .resize(new_size.to_pty_size())
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))?;
        *size = new_size;

        Ok(true)
    }

    /// Kill the process
    ///
    /// Idempotent. The exit event is delivered by the reader thread once the
    /// process is gone.
    pub fn kill(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Ok(mut killer) = self.killer.lock() {
            if let Err(e) = killer.kill() {
                // Already exited on its own
                debug!("Kill of PTY process {} ignored: {}", self.id, e);
            }
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    /// Collect events until the exit event arrives
    async fn drain(rx: &mut mpsc::Receiver<PtyEvent>) -> (Vec<u8>, Option<ProcessExit>) {
        let mut output = Vec::new();
        while let Ok(Some(event)) = timeout(Duration::from_secs(5), rx.recv()).await {
            match event {
                PtyEvent::Output(data) => output.extend(data),
                PtyEvent::Exit(exit) => return (output, Some(exit)),
            }
        }
        (output, None)
    }

    #[test]
    fn test_terminal_size_default() {
        let size = TerminalSize::default();
        assert_eq!(size.cols, 80);
        assert_eq!(size.rows, 24);
    }

    #[test]
    fn test_command_spec_builder() {
        let spec = CommandSpec::new("tmux")
            .with_args(["attach-session", "-t", "dev"])
            .with_cwd("/tmp")
            .with_env("TERM", "xterm-256color");
        assert_eq!(spec.program, "tmux");
        assert_eq!(spec.args, vec!["attach-session", "-t", "dev"]);
        assert_eq!(spec.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(spec.env, vec![("TERM".to_string(), "xterm-256color".to_string())]);
    }

    #[tokio::test]
    async fn test_output_then_exit() {
        let spec = CommandSpec::new("echo").with_args(["hello"]).with_cwd("/tmp");
        let (_process, mut rx) = PtyProcess::spawn(&spec, TerminalSize::default()).unwrap();

        let (output, exit) = drain(&mut rx).await;
        assert!(String::from_utf8_lossy(&output).contains("hello"));

        let exit = exit.expect("exit event");
        assert_eq!(exit.code, 0);
        assert_eq!(exit.reason, ExitReason::Normal);

        // Nothing follows the exit event
        assert!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_nonzero_exit_code() {
        let spec = CommandSpec::new("sh").with_args(["-c", "exit 3"]);
        let (_process, mut rx) = PtyProcess::spawn(&spec, TerminalSize::default()).unwrap();

        let (_, exit) = drain(&mut rx).await;
        assert_eq!(exit.unwrap().code, 3);
    }

    #[tokio::test]
    async fn test_write_is_echoed() {
        let (process, mut rx) =
            PtyProcess::spawn(&CommandSpec::new("cat"), TerminalSize::default()).unwrap();

        process.write(b"test input\n");

        let mut seen = Vec::new();
        while let Ok(Some(PtyEvent::Output(data))) =
            timeout(Duration::from_secs(2), rx.recv()).await
        {
            seen.extend(data);
            if String::from_utf8_lossy(&seen).contains("test input") {
                break;
            }
        }
        assert!(String::from_utf8_lossy(&seen).contains("test input"));
        process.kill();
    }

    #[tokio::test]
    async fn test_resize_noop_when_unchanged() {
        let (process, _rx) =
            PtyProcess::spawn(&CommandSpec::new("cat"), TerminalSize::default()).unwrap();

        assert!(!process.resize(80, 24).await.unwrap());
        assert!(process.resize(120, 40).await.unwrap());
        assert_eq!(process.size().await, TerminalSize::new(120, 40));
        assert!(!process.resize(120, 40).await.unwrap());

        process.kill();
    }

    #[tokio::test]
    async fn test_kill_is_idempotent_and_exits_once() {
        let (process, mut rx) =
            PtyProcess::spawn(&CommandSpec::new("cat"), TerminalSize::default()).unwrap();

        process.kill();
        process.kill();
        assert!(process.is_closing());

        // Writes after kill are dropped silently
        process.write(b"ignored\n");
        assert!(!process.resize(100, 30).await.unwrap());

        let (_, exit) = drain(&mut rx).await;
        assert_eq!(exit.unwrap().reason, ExitReason::Killed);
        assert!(timeout(Duration::from_secs(1), rx.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let result = PtyProcess::spawn(
            &CommandSpec::new("/nonexistent/program/for/test"),
            TerminalSize::default(),
        );
        assert!(matches!(result, Err(PtyError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_spawn_with_env() {
        let spec = CommandSpec::new("sh")
            .with_args(["-c", "echo $TEST_VAR"])
            .with_env("TEST_VAR", "test_value");
        let (_process, mut rx) = PtyProcess::spawn(&spec, TerminalSize::default()).unwrap();

        let (output, _) = drain(&mut rx).await;
        assert!(String::from_utf8_lossy(&output).contains("test_value"));
    }
}
