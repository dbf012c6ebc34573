//! Session handle
//!
//! One attachment process connected to one external multiplexer session.
//! The handle owns the process reference exclusively: it is set only when the
//! handle becomes `active` and taken exactly once on any transition away.
//!
//! A supervisor task consumes the process event stream in order. Output is
//! buffered and published; a clean exit detaches the handle; a read failure
//! while the process is alive triggers one bounded reconnect attempt.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::buffer::{OutputBuffer, OutputChunk, DEFAULT_BUFFER_CAPACITY};
use super::echo::EchoFilter;
use super::state::SessionState;
use crate::pty::{PtyError, PtyEvent, PtyProcess, SpawnRequest, TerminalSize};
use crate::tmux::{attach_environment, Multiplexer, MultiplexerError, DETACH_SEQUENCE};

/// Errors that can occur during session handle operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Terminal already started")]
    AlreadyStarted,

    #[error("Terminal not active (state: {state})")]
    NotActive { state: SessionState },

    #[error("Failed to start terminal: {0}")]
    CreateFailed(String),

    #[error("Failed to reconnect terminal: {0}")]
    ReconnectFailed(String),

    #[error("Session has been killed")]
    Killed,

    #[error("Multiplexer error: {0}")]
    Multiplexer(#[from] MultiplexerError),

    #[error("PTY error: {0}")]
    Pty(#[from] PtyError),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Per-session launch options supplied by the caller
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub size: TerminalSize,
}

impl SessionOptions {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            env: HashMap::new(),
            size: TerminalSize::default(),
        }
    }

    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.size = TerminalSize::new(cols, rows);
        self
    }
}

/// Tunables shared by every handle of a registry
#[derive(Debug, Clone)]
pub struct HandleSettings {
    pub buffer_capacity: usize,
    /// Wait before re-checking the external session after a read failure
    pub reconnect_delay: Duration,
    /// Wait before capturing the pane after a reconnect
    pub resync_delay: Duration,
    pub echo_suppression: bool,
}

impl Default for HandleSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            reconnect_delay: Duration::from_secs(1),
            resync_delay: Duration::from_millis(500),
            echo_suppression: false,
        }
    }
}

/// Events a handle publishes, in production order
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Output {
        session_id: String,
        /// Sequence number of the buffered chunk carrying the same bytes
        seq: u64,
        data: Vec<u8>,
        timestamp: DateTime<Utc>,
    },
    /// Pane snapshot captured after a reconnect
    Resync {
        session_id: String,
        data: String,
        timestamp: DateTime<Utc>,
    },
    /// Attachment process ended
    Exited {
        session_id: String,
        exit_code: Option<i32>,
        timestamp: DateTime<Utc>,
    },
    Error {
        session_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
}

/// Result of starting or reattaching a handle
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionDescriptor {
    pub session_id: String,
    pub external_name: String,
    pub pid: Option<u32>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub reconnected: bool,
}

/// Point-in-time status snapshot
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionStatus {
    pub session_id: String,
    pub external_name: String,
    pub state: SessionState,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub uptime_secs: i64,
    pub size: TerminalSize,
    pub cwd: String,
    pub buffer_len: usize,
    pub promoted: bool,
}

/// State and process reference, always changed together
struct Lifecycle {
    state: SessionState,
    process: Option<PtyProcess>,
    pid: Option<u32>,
}

impl Lifecycle {
    /// Move away from `active`, dropping the process reference
    fn release(&mut self, next: SessionState) -> Option<PtyProcess> {
        self.state = next;
        self.pid = None;
        self.process.take()
    }
}

/// Why the supervisor stopped pumping one process
enum PumpOutcome {
    Exited(Option<i32>),
    ReadError(String),
    Closed,
}

struct Inner {
    id: String,
    external_name: String,
    multiplexer: Arc<dyn Multiplexer>,
    cwd: PathBuf,
    env: HashMap<String, String>,
    settings: HandleSettings,
    created_at: DateTime<Utc>,
    lifecycle: Mutex<Lifecycle>,
    /// Bumped on every attach; stale supervisors compare against it
    generation: AtomicU64,
    dimensions: RwLock<TerminalSize>,
    last_activity: RwLock<DateTime<Utc>>,
    /// Output is pushed and published under this lock, so a subscriber taken
    /// under it sees exactly the chunks the buffer does not yet hold
    buffer: Arc<Mutex<OutputBuffer>>,
    echo: Mutex<EchoFilter>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    error_reported: AtomicBool,
    promoted: AtomicBool,
    teardown: AtomicBool,
}

/// Cloneable reference to one session handle
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<Inner>,
}

impl SessionHandle {
    pub fn new(
        id: impl Into<String>,
        external_name: impl Into<String>,
        multiplexer: Arc<dyn Multiplexer>,
        options: SessionOptions,
        settings: HandleSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        let now = Utc::now();
        let echo = EchoFilter::new(settings.echo_suppression);
        let buffer = OutputBuffer::new(settings.buffer_capacity);

        Self {
            inner: Arc::new(Inner {
                id: id.into(),
                external_name: external_name.into(),
                multiplexer,
                cwd: options.cwd,
                env: options.env,
                settings,
                created_at: now,
                lifecycle: Mutex::new(Lifecycle {
                    state: SessionState::Inactive,
                    process: None,
                    pid: None,
                }),
                generation: AtomicU64::new(0),
                dimensions: RwLock::new(options.size),
                last_activity: RwLock::new(now),
                buffer: Arc::new(Mutex::new(buffer)),
                echo: Mutex::new(echo),
                events,
                cancel: CancellationToken::new(),
                error_reported: AtomicBool::new(false),
                promoted: AtomicBool::new(false),
                teardown: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn external_name(&self) -> &str {
        &self.inner.external_name
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lifecycle.lock().await.state
    }

    pub async fn is_active(&self) -> bool {
        self.state().await.is_active()
    }

    pub async fn pid(&self) -> Option<u32> {
        self.inner.lifecycle.lock().await.pid
    }

    pub async fn dimensions(&self) -> TerminalSize {
        *self.inner.dimensions.read().await
    }

    pub async fn last_activity(&self) -> DateTime<Utc> {
        *self.inner.last_activity.read().await
    }

    /// Subscribe to output and lifecycle events.
    ///
    /// Also returns the sequence number of the first output chunk the receiver
    /// will get; every earlier chunk is already in the buffer.
    pub async fn subscribe_at(&self) -> (broadcast::Receiver<SessionEvent>, u64) {
        let buffer = self.inner.buffer.lock().await;
        (self.inner.events.subscribe(), buffer.next_seq())
    }

    /// Shared output buffer, for replaying history to late subscribers
    pub fn buffer(&self) -> Arc<Mutex<OutputBuffer>> {
        Arc::clone(&self.inner.buffer)
    }

    /// Whether two references point at the same handle
    pub fn same_handle(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn mark_promoted(&self) {
        self.inner.promoted.store(true, Ordering::SeqCst);
    }

    pub fn is_promoted(&self) -> bool {
        self.inner.promoted.load(Ordering::SeqCst)
    }

    /// Kill this session's external session when the host shuts down
    pub fn mark_for_teardown(&self) {
        self.inner.teardown.store(true, Ordering::SeqCst);
    }

    pub fn teardown_requested(&self) -> bool {
        self.inner.teardown.load(Ordering::SeqCst)
    }

    pub async fn set_echo_suppression(&self, enabled: bool) {
        self.inner.echo.lock().await.set_enabled(enabled);
    }

    /// Copy of the last `lines` buffered output chunks
    pub async fn recent_output(&self, lines: usize) -> Vec<OutputChunk> {
        self.inner.buffer.lock().await.recent(lines)
    }

    /// Start the handle.
    ///
    /// With `reconnect = false` the external session is created first when it
    /// does not exist; with `reconnect = true` it is assumed to exist and only
    /// a new attachment is spawned. A handle starts at most once; a failed
    /// start leaves it in `error` and it must be discarded.
    pub async fn start(&self, reconnect: bool) -> SessionResult<SessionDescriptor> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.state != SessionState::Inactive || lifecycle.process.is_some() {
            return Err(SessionError::AlreadyStarted);
        }

        info!(
            session_id = %self.inner.id,
            external = %self.inner.external_name,
            cwd = %self.inner.cwd.display(),
            "{} tmux terminal session",
            if reconnect { "Reconnecting to" } else { "Starting" }
        );

        let rx = match self.inner.attach_locked(&mut lifecycle, reconnect).await {
            Ok(rx) => rx,
            Err(e) => {
                lifecycle.state = SessionState::Error;
                error!(session_id = %self.inner.id, "Failed to start terminal session: {}", e);
                return Err(match e {
                    SessionError::CreateFailed(msg) => SessionError::CreateFailed(msg),
                    other => SessionError::CreateFailed(other.to_string()),
                });
            }
        };

        let generation = self.inner.generation.load(Ordering::SeqCst);
        tokio::spawn(supervise(Arc::clone(&self.inner), generation, rx));

        let descriptor = SessionDescriptor {
            session_id: self.inner.id.clone(),
            external_name: self.inner.external_name.clone(),
            pid: lifecycle.pid,
            state: lifecycle.state,
            created_at: self.inner.created_at,
            reconnected: reconnect,
        };

        info!(
            session_id = %self.inner.id,
            pid = ?descriptor.pid,
            "Tmux terminal session started"
        );
        Ok(descriptor)
    }

    /// Forward input to the attachment process
    pub async fn write(&self, data: &[u8]) -> SessionResult<()> {
        let lifecycle = self.inner.lifecycle.lock().await;
        let process = match (&lifecycle.state, lifecycle.process.as_ref()) {
            (SessionState::Active, Some(process)) => process,
            _ => {
                return Err(SessionError::NotActive {
                    state: lifecycle.state,
                })
            }
        };

        self.inner.echo.lock().await.remember_input(data);
        *self.inner.last_activity.write().await = Utc::now();

        let result = process.write(data).await;
        if let Err(e) = result {
            drop(lifecycle);
            self.inner.fail(e.to_string()).await;
            return Err(e.into());
        }

        debug!(
            session_id = %self.inner.id,
            bytes = data.len(),
            "Terminal input"
        );
        Ok(())
    }

    /// Resize the attachment process and remember the new dimensions
    pub async fn resize(&self, cols: u16, rows: u16) -> SessionResult<TerminalSize> {
        let lifecycle = self.inner.lifecycle.lock().await;
        let process = match (&lifecycle.state, lifecycle.process.as_ref()) {
            (SessionState::Active, Some(process)) => process,
            _ => {
                return Err(SessionError::NotActive {
                    state: lifecycle.state,
                })
            }
        };

        let size = TerminalSize::new(cols, rows);
        process.resize(size).await?;
        *self.inner.dimensions.write().await = size;

        debug!(session_id = %self.inner.id, "Terminal resized to {}x{}", cols, rows);
        Ok(size)
    }

    /// Detach from the external session, leaving it running.
    ///
    /// Returns `false` when there was nothing to detach.
    pub async fn detach(&self) -> SessionResult<bool> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.inner.detach_locked(&mut lifecycle).await
    }

    /// Detach if attached, then destroy the external session. Terminal.
    pub async fn kill(&self) -> SessionResult<()> {
        self.inner.cancel.cancel();
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.state.is_terminal() {
            return Ok(());
        }

        self.inner.detach_locked(&mut lifecycle).await?;
        self.inner
            .multiplexer
            .kill_session(&self.inner.external_name)
            .await?;
        lifecycle.state = SessionState::Killed;

        info!(
            session_id = %self.inner.id,
            external = %self.inner.external_name,
            "Tmux session killed"
        );
        Ok(())
    }

    pub async fn status(&self) -> SessionStatus {
        let (state, pid) = {
            let lifecycle = self.inner.lifecycle.lock().await;
            (lifecycle.state, lifecycle.pid)
        };
        let now = Utc::now();

        SessionStatus {
            session_id: self.inner.id.clone(),
            external_name: self.inner.external_name.clone(),
            state,
            pid,
            created_at: self.inner.created_at,
            last_activity: *self.inner.last_activity.read().await,
            uptime_secs: (now - self.inner.created_at).num_seconds(),
            size: *self.inner.dimensions.read().await,
            cwd: self.inner.cwd.display().to_string(),
            buffer_len: self.inner.buffer.lock().await.len(),
            promoted: self.is_promoted(),
        }
    }
}

impl Inner {
    /// Ensure the external session (unless reconnecting) and spawn an attachment
    async fn attach_locked(
        self: &Arc<Self>,
        lifecycle: &mut Lifecycle,
        reconnect: bool,
    ) -> SessionResult<mpsc::Receiver<PtyEvent>> {
        if !reconnect && !self.multiplexer.has_session(&self.external_name).await? {
            self.multiplexer
                .create_session(&self.external_name, &self.cwd)
                .await?;
        }

        let command = self.multiplexer.attach_command(&self.external_name);
        let env = attach_environment(&self.env);
        let size = *self.dimensions.read().await;

        let mut process = PtyProcess::spawn(SpawnRequest {
            program: &command.program,
            args: &command.args,
            cwd: &self.cwd,
            env: &env,
            size,
        })
        .map_err(|e| SessionError::CreateFailed(e.to_string()))?;

        let rx = process
            .take_events()
            .ok_or_else(|| SessionError::CreateFailed("event stream unavailable".to_string()))?;

        self.generation.fetch_add(1, Ordering::SeqCst);
        lifecycle.pid = process.pid();
        lifecycle.process = Some(process);
        lifecycle.state = SessionState::Active;
        *self.last_activity.write().await = Utc::now();

        if reconnect {
            self.schedule_resync();
        }
        Ok(rx)
    }

    /// Capture the visible pane shortly after reattaching
    fn schedule_resync(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.cancel.cancelled() => return,
                _ = tokio::time::sleep(inner.settings.resync_delay) => {}
            }
            match inner.multiplexer.capture_pane(&inner.external_name, false).await {
                Ok(content) if !content.is_empty() => {
                    let _ = inner.events.send(SessionEvent::Resync {
                        session_id: inner.id.clone(),
                        data: content,
                        timestamp: Utc::now(),
                    });
                }
                Ok(_) => {}
                Err(e) => warn!(session_id = %inner.id, "Failed to capture pane content: {}", e),
            }
        });
    }

    async fn detach_locked(&self, lifecycle: &mut Lifecycle) -> SessionResult<bool> {
        match lifecycle.state {
            SessionState::Active => {
                if let Some(process) = lifecycle.process.as_ref() {
                    if let Err(e) = process.write(DETACH_SEQUENCE).await {
                        // Dropping the process still hangs up the client
                        warn!(session_id = %self.id, "Failed to send detach sequence: {}", e);
                    }
                }
                lifecycle.release(SessionState::Detached);
                info!(
                    session_id = %self.id,
                    external = %self.external_name,
                    "Detached from tmux session"
                );
                Ok(true)
            }
            // Abandon a pending reconnect
            SessionState::Reconnecting => {
                lifecycle.state = SessionState::Detached;
                Ok(true)
            }
            SessionState::Killed => Err(SessionError::Killed),
            _ => Ok(false),
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    async fn handle_output(&self, generation: u64, data: &[u8]) {
        if !self.is_current(generation) {
            return;
        }
        let now = Utc::now();
        *self.last_activity.write().await = now;

        let processed = self.echo.lock().await.filter(data).into_owned();
        if processed.is_empty() {
            return;
        }

        let mut buffer = self.buffer.lock().await;
        let seq = buffer.push(now, processed.clone());
        let _ = self.events.send(SessionEvent::Output {
            session_id: self.id.clone(),
            seq,
            data: processed,
            timestamp: now,
        });
    }

    /// Attachment exited: optimistic detach, then best-effort confirmation
    async fn on_exit(&self, generation: u64, exit_code: Option<i32>) {
        {
            let mut lifecycle = self.lifecycle.lock().await;
            if !self.is_current(generation) || lifecycle.state != SessionState::Active {
                return;
            }
            lifecycle.release(SessionState::Detached);
        }

        info!(session_id = %self.id, exit_code = ?exit_code, "Tmux attach process exited");
        let _ = self.events.send(SessionEvent::Exited {
            session_id: self.id.clone(),
            exit_code,
            timestamp: Utc::now(),
        });

        match self.multiplexer.has_session(&self.external_name).await {
            Ok(false) => {
                let mut lifecycle = self.lifecycle.lock().await;
                if self.is_current(generation) && lifecycle.state == SessionState::Detached {
                    lifecycle.state = SessionState::Exited;
                    info!(session_id = %self.id, "External session is gone");
                }
            }
            Ok(true) => {}
            Err(e) => debug!(session_id = %self.id, "Could not confirm external session: {}", e),
        }
    }

    /// Read failure while the process lives: wait, re-check, reattach once
    async fn recover(
        self: &Arc<Self>,
        generation: u64,
        reason: String,
    ) -> Option<mpsc::Receiver<PtyEvent>> {
        {
            let mut lifecycle = self.lifecycle.lock().await;
            if !self.is_current(generation) || lifecycle.state != SessionState::Active {
                return None;
            }
            lifecycle.release(SessionState::Reconnecting);
        }
        warn!(session_id = %self.id, "Attachment read failed, reconnecting: {}", reason);

        tokio::select! {
            _ = self.cancel.cancelled() => return None,
            _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
        }

        let attempt = async {
            if !self.multiplexer.has_session(&self.external_name).await? {
                return Err(SessionError::ReconnectFailed(
                    "external session no longer exists".to_string(),
                ));
            }
            let mut lifecycle = self.lifecycle.lock().await;
            if lifecycle.state != SessionState::Reconnecting {
                // Detached or killed while waiting
                return Ok(None);
            }
            self.attach_locked(&mut lifecycle, true).await.map(Some)
        };

        match attempt.await {
            Ok(Some(rx)) => {
                info!(session_id = %self.id, "Reconnected to tmux session");
                Some(rx)
            }
            Ok(None) => None,
            Err(e) => {
                {
                    let mut lifecycle = self.lifecycle.lock().await;
                    if lifecycle.state == SessionState::Reconnecting {
                        lifecycle.state = SessionState::Error;
                    }
                }
                let message = match e {
                    SessionError::ReconnectFailed(msg) => msg,
                    other => other.to_string(),
                };
                self.report_error(format!("Reconnect failed: {}", message));
                None
            }
        }
    }

    /// Unrecoverable process-level failure
    async fn fail(&self, message: String) {
        {
            let mut lifecycle = self.lifecycle.lock().await;
            if lifecycle.state != SessionState::Active {
                return;
            }
            lifecycle.release(SessionState::Error);
        }
        self.report_error(message);
    }

    /// Publish the error notification, at most once per handle
    fn report_error(&self, message: String) {
        if self.error_reported.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(session_id = %self.id, "Terminal session error: {}", message);
        let _ = self.events.send(SessionEvent::Error {
            session_id: self.id.clone(),
            message,
            timestamp: Utc::now(),
        });
    }
}

/// Pump one process's events until it stops producing them
async fn pump(inner: &Inner, generation: u64, rx: &mut mpsc::Receiver<PtyEvent>) -> PumpOutcome {
    while let Some(event) = rx.recv().await {
        match event {
            PtyEvent::Output(data) => inner.handle_output(generation, &data).await,
            PtyEvent::Exited(exit_code) => return PumpOutcome::Exited(exit_code),
            PtyEvent::ReadError(reason) => return PumpOutcome::ReadError(reason),
        }
    }
    PumpOutcome::Closed
}

/// Supervisor task: owns the event stream across reconnects
async fn supervise(inner: Arc<Inner>, mut generation: u64, mut rx: mpsc::Receiver<PtyEvent>) {
    loop {
        match pump(&inner, generation, &mut rx).await {
            PumpOutcome::Exited(code) => {
                inner.on_exit(generation, code).await;
                return;
            }
            PumpOutcome::ReadError(reason) => match inner.recover(generation, reason).await {
                Some(next) => {
                    generation = inner.generation.load(Ordering::SeqCst);
                    rx = next;
                }
                None => return,
            },
            PumpOutcome::Closed => return,
        }
    }
}
