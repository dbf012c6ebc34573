//! PTY attachment process
//!
//! Spawns one process under a pseudo-terminal and streams everything it does
//! as an ordered sequence of [`PtyEvent`]s:
//! - output chunks, in the order the process produced them
//! - a clean exit, with the exit code when it can be reaped
//! - a read failure while the process is still alive, which callers may treat
//!   as recoverable

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// How many times a read failure waits for the child to be reaped
const EXIT_POLL_ATTEMPTS: u32 = 10;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Errors that can occur during PTY operations
#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open PTY: {0}")]
    OpenFailed(String),

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Failed to write to PTY: {0}")]
    WriteFailed(String),

    #[error("Failed to resize PTY: {0}")]
    ResizeFailed(String),

    #[error("PTY system error: {0}")]
    SystemError(String),
}

/// Result type for PTY operations
pub type PtyResult<T> = Result<T, PtyError>;

/// Terminal size configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
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

/// Everything needed to launch an attachment process
#[derive(Debug, Clone)]
pub struct SpawnRequest<'a> {
    pub program: &'a str,
    pub args: &'a [String],
    pub cwd: &'a Path,
    pub env: &'a HashMap<String, String>,
    pub size: TerminalSize,
}

/// Ordered stream of things a PTY process does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Output(Vec<u8>),
    /// Process ended, with its exit code when it could be reaped
    Exited(Option<i32>),
    /// Read failed while the process was still running
    ReadError(String),
}

/// Handle to a running PTY process
pub struct PtyProcess {
    pid: Option<u32>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    /// Taken once by whoever consumes the event stream
    events: Option<mpsc::Receiver<PtyEvent>>,
    /// Set when the owner has let go; the reader stops forwarding
    shutdown: Arc<AtomicBool>,
}

impl PtyProcess {
    /// Spawn a new process with PTY
    pub fn spawn(request: SpawnRequest<'_>) -> PtyResult<Self> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(request.size.to_pty_size())
            .map_err(|e| PtyError::OpenFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(request.program);
        cmd.args(request.args);
        cmd.cwd(request.cwd);
        for (key, value) in request.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        // Drop the slave - we only need the master
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SystemError(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SystemError(e.to_string()))?;

        let (events_tx, events_rx) = mpsc::channel(1024);
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = Arc::clone(&shutdown);

        std::thread::Builder::new()
            .name(format!("pty-reader-{}", pid.unwrap_or_default()))
            .spawn(move || Self::reader_loop(reader, child, events_tx, shutdown_clone, pid))
            .map_err(|e| PtyError::SystemError(e.to_string()))?;

        Ok(Self {
            pid,
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            killer,
            events: Some(events_rx),
            shutdown,
        })
    }

    /// Blocking reader that runs on its own thread
    fn reader_loop(
        mut reader: Box<dyn Read + Send>,
        mut child: Box<dyn Child + Send + Sync>,
        events_tx: mpsc::Sender<PtyEvent>,
        shutdown: Arc<AtomicBool>,
        pid: Option<u32>,
    ) {
        let mut buffer = [0u8; 4096];

        let last = loop {
            if shutdown.load(Ordering::SeqCst) {
                break None;
            }

            match reader.read(&mut buffer) {
                Ok(0) => {
                    let exit_code = child.wait().ok().map(|s| s.exit_code() as i32);
                    break Some(PtyEvent::Exited(exit_code));
                }
                Ok(n) => {
                    if events_tx
                        .blocking_send(PtyEvent::Output(buffer[..n].to_vec()))
                        .is_err()
                    {
                        break None;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    // On Linux a closed slave reads as EIO, so only a child that
                    // is still alive turns this into a read failure.
                    break Some(match Self::reap_exit(child.as_mut()) {
                        Some(exit_code) => PtyEvent::Exited(Some(exit_code)),
                        None => PtyEvent::ReadError(e.to_string()),
                    });
                }
            }
        };

        if let Some(event) = last {
            if !shutdown.load(Ordering::SeqCst) {
                let _ = events_tx.blocking_send(event);
            }
        }
        debug!(pid = ?pid, "PTY reader finished");
    }

    /// Give the child a brief chance to be reaped
    fn reap_exit(child: &mut (dyn Child + Send + Sync)) -> Option<i32> {
        for _ in 0..EXIT_POLL_ATTEMPTS {
            if let Ok(Some(status)) = child.try_wait() {
                return Some(status.exit_code() as i32);
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }
        None
    }

    /// OS process id, when the platform reports one
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the event stream; only the first call returns it
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<PtyEvent>> {
        self.events.take()
    }

    /// Write input to the PTY (stdin)
    pub async fn write(&self, data: &[u8]) -> PtyResult<()> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;

        Ok(())
    }

    /// Resize the terminal
    pub async fn resize(&self, size: TerminalSize) -> PtyResult<()> {
        let master = self.master.lock().await;

        master
            .resize(size.to_pty_size())
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))?;

        Ok(())
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        // Stop forwarding and hang up the child so the reader thread unblocks
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.killer.kill();
    }
}
