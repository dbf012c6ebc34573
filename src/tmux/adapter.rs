//! Multiplexer adapter
//!
//! Thin stateless interface over the external tmux binary. Every operation is
//! one fresh invocation bounded by its own timeout. Existence checks are retried
//! on transient failures (timeouts, spawn errors); a non-zero exit status is an
//! answer, not a transient failure.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::naming::SessionNaming;

/// Default per-invocation timeout
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Default attempt count for retried checks
pub const DEFAULT_RETRIES: u32 = 3;

/// Default scrollback kept by created sessions
pub const DEFAULT_HISTORY_LIMIT: u32 = 10_000;

/// Native detach key sequence (prefix `C-b`, then `d`)
pub const DETACH_SEQUENCE: &[u8] = b"\x02d";

/// Errors from external multiplexer invocations
#[derive(Error, Debug)]
pub enum MultiplexerError {
    #[error("No multiplexer server running")]
    NoServer,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("`{command}` failed with status {status:?}: {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Failed to run multiplexer: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Unexpected multiplexer output: {0}")]
    InvalidOutput(String),

    #[error("No free sequence number for project {0}")]
    SequenceExhausted(String),
}

impl MultiplexerError {
    /// "Not found" family: the expected outcome of probing a missing session
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            MultiplexerError::NoServer | MultiplexerError::SessionNotFound(_)
        )
    }

    /// Failures worth retrying locally
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MultiplexerError::Timeout { .. } | MultiplexerError::Spawn(_)
        )
    }
}

/// Result type for multiplexer operations
pub type MultiplexerResult<T> = Result<T, MultiplexerError>;

/// Cursor position inside the active pane
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorPosition {
    pub x: u16,
    pub y: u16,
}

/// Metadata the multiplexer reports about one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalSessionInfo {
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub attached: bool,
}

/// Program and arguments that attach a client to a named session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Operations the session layer needs from the external multiplexer
#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Naming scheme for sessions this adapter owns
    fn naming(&self) -> &SessionNaming;

    /// Command that attaches a terminal client to `name`
    fn attach_command(&self, name: &str) -> AttachCommand;

    async fn has_session(&self, name: &str) -> MultiplexerResult<bool>;

    /// Create a detached session and apply the persistence options
    async fn create_session(&self, name: &str, cwd: &Path) -> MultiplexerResult<()>;

    /// Names of sessions carrying the naming prefix
    async fn list_sessions(&self) -> MultiplexerResult<Vec<String>>;

    async fn session_info(&self, name: &str) -> MultiplexerResult<Option<ExternalSessionInfo>>;

    /// Kill a session; a session that is already gone counts as success
    async fn kill_session(&self, name: &str) -> MultiplexerResult<bool>;

    async fn capture_pane(&self, name: &str, include_history: bool) -> MultiplexerResult<String>;

    async fn send_keys(&self, name: &str, keys: &[&str]) -> MultiplexerResult<bool>;

    async fn cursor_position(&self, name: &str) -> MultiplexerResult<CursorPosition>;

    async fn is_in_copy_mode(&self, name: &str) -> MultiplexerResult<bool>;

    async fn enter_copy_mode(&self, name: &str) -> MultiplexerResult<()>;

    async fn set_status_bar(&self, name: &str, visible: bool) -> MultiplexerResult<()>;

    async fn exit_copy_mode(&self, name: &str) -> MultiplexerResult<()> {
        self.send_keys(name, &["q"]).await.map(|_| ())
    }

    async fn scroll_up(&self, name: &str, key: &str, repeat: u32) -> MultiplexerResult<()> {
        for _ in 0..repeat.max(1) {
            self.send_keys(name, &[key]).await?;
        }
        Ok(())
    }

    async fn scroll_down(&self, name: &str, key: &str, repeat: u32) -> MultiplexerResult<()> {
        for _ in 0..repeat.max(1) {
            self.send_keys(name, &[key]).await?;
        }
        Ok(())
    }

    /// Next free sequence number for `project_id`, defaulting to 1
    async fn next_sequence_number(&self, project_id: &str) -> MultiplexerResult<u64> {
        let sessions = self.list_sessions().await?;
        self.naming()
            .next_sequence(sessions.iter().map(String::as_str), project_id)
            .ok_or_else(|| MultiplexerError::SequenceExhausted(project_id.to_string()))
    }
}

/// Options for the tmux-backed adapter
#[derive(Debug, Clone)]
pub struct TmuxOptions {
    pub binary: String,
    pub prefix: String,
    pub timeout: Duration,
    pub retries: u32,
    pub history_limit: u32,
}

impl Default for TmuxOptions {
    fn default() -> Self {
        Self {
            binary: "tmux".to_string(),
            prefix: super::naming::DEFAULT_PREFIX.to_string(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            retries: DEFAULT_RETRIES,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Output of a finished tmux invocation
struct CommandOutput {
    status: Option<i32>,
    stdout: String,
    stderr: String,
}

impl CommandOutput {
    fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Adapter over the real tmux binary
pub struct TmuxAdapter {
    options: TmuxOptions,
    naming: SessionNaming,
}

/// Exact-match session target, so `demo-1` never resolves to `demo-10`
fn session_target(name: &str) -> String {
    format!("={}", name)
}

/// Active pane of the exactly-matched session
fn pane_target(name: &str) -> String {
    format!("={}:", name)
}

fn is_no_server(stderr: &str) -> bool {
    stderr.contains("no server running")
        || stderr.contains("No such file or directory")
        || stderr.contains("error connecting to")
}

fn is_missing_session(stderr: &str) -> bool {
    stderr.contains("can't find session") || stderr.contains("session not found")
}

impl TmuxAdapter {
    pub fn new(options: TmuxOptions) -> Self {
        let naming = SessionNaming::new(options.prefix.clone());
        Self { options, naming }
    }

    /// Run one tmux invocation under the configured timeout
    async fn run(&self, args: &[&str]) -> MultiplexerResult<CommandOutput> {
        let command = format!("{} {}", self.options.binary, args.join(" "));
        debug!(command = %command, "Running multiplexer command");

        let mut cmd = Command::new(&self.options.binary);
        cmd.args(args).kill_on_drop(true);

        let output = tokio::time::timeout(self.options.timeout, cmd.output())
            .await
            .map_err(|_| MultiplexerError::Timeout {
                command: command.clone(),
                timeout: self.options.timeout,
            })??;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Run an invocation that must succeed
    async fn run_checked(&self, args: &[&str]) -> MultiplexerResult<String> {
        let output = self.run(args).await?;
        if output.success() {
            return Ok(output.stdout);
        }
        if is_no_server(&output.stderr) {
            return Err(MultiplexerError::NoServer);
        }
        if is_missing_session(&output.stderr) {
            let target = args
                .iter()
                .skip_while(|a| **a != "-t")
                .nth(1)
                .map(|t| t.trim_start_matches('=').trim_end_matches(':').to_string())
                .unwrap_or_default();
            return Err(MultiplexerError::SessionNotFound(target));
        }
        Err(MultiplexerError::CommandFailed {
            command: format!("{} {}", self.options.binary, args.join(" ")),
            status: output.status,
            stderr: output.stderr,
        })
    }

    async fn has_session_once(&self, name: &str) -> MultiplexerResult<bool> {
        let target = session_target(name);
        let output = self.run(&["has-session", "-t", &target]).await?;
        Ok(output.success())
    }

    async fn set_session_option(&self, name: &str, option: &str, value: &str) -> MultiplexerResult<()> {
        let target = session_target(name);
        self.run_checked(&["set-option", "-t", &target, option, value])
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Multiplexer for TmuxAdapter {
    fn naming(&self) -> &SessionNaming {
        &self.naming
    }

    fn attach_command(&self, name: &str) -> AttachCommand {
        AttachCommand {
            program: self.options.binary.clone(),
            args: vec![
                "attach-session".to_string(),
                "-t".to_string(),
                session_target(name),
            ],
        }
    }

    async fn has_session(&self, name: &str) -> MultiplexerResult<bool> {
        let attempts = self.options.retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.has_session_once(name).await {
                Ok(exists) => return Ok(exists),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        session = %name,
                        attempt,
                        "Session existence check failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn create_session(&self, name: &str, cwd: &Path) -> MultiplexerResult<()> {
        let cwd = cwd.to_string_lossy();
        self.run_checked(&["new-session", "-d", "-s", name, "-c", &cwd])
            .await?;

        let target = session_target(name);
        let history = self.options.history_limit.to_string();

        self.set_status_bar(name, false).await?;
        self.run_checked(&["set-option", "-w", "-t", &target, "remain-on-exit", "on"])
            .await?;
        self.set_session_option(name, "destroy-unattached", "off").await?;
        self.set_session_option(name, "detach-on-destroy", "off").await?;
        self.run_checked(&["set-option", "-s", "exit-empty", "off"])
            .await?;
        self.set_session_option(name, "history-limit", &history).await?;
        self.run_checked(&["set-environment", "-t", &target, "TMOUT", ""])
            .await?;
        self.run_checked(&["set-environment", "-t", &target, "TERM", "xterm-256color"])
            .await?;

        info!(session = %name, "Created persistent tmux session");
        Ok(())
    }

    async fn list_sessions(&self) -> MultiplexerResult<Vec<String>> {
        match self
            .run_checked(&["list-sessions", "-F", "#{session_name}"])
            .await
        {
            Ok(stdout) => Ok(stdout
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && self.naming.is_owned(line))
                .map(String::from)
                .collect()),
            Err(MultiplexerError::NoServer) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn session_info(&self, name: &str) -> MultiplexerResult<Option<ExternalSessionInfo>> {
        let stdout = match self
            .run_checked(&[
                "list-sessions",
                "-F",
                "#{session_name}:#{session_created}:#{session_attached}",
            ])
            .await
        {
            Ok(stdout) => stdout,
            Err(MultiplexerError::NoServer) => return Ok(None),
            Err(e) => return Err(e),
        };

        Ok(stdout.lines().find_map(|line| parse_session_info(line, name)))
    }

    async fn kill_session(&self, name: &str) -> MultiplexerResult<bool> {
        let target = session_target(name);
        match self.run_checked(&["kill-session", "-t", &target]).await {
            Ok(_) => {
                info!(session = %name, "Killed tmux session");
                Ok(true)
            }
            Err(e) if e.is_not_found() => {
                debug!(session = %name, "Tmux session already gone");
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    async fn capture_pane(&self, name: &str, include_history: bool) -> MultiplexerResult<String> {
        let target = pane_target(name);
        let mut args = vec!["capture-pane", "-t", target.as_str(), "-e", "-p"];
        if include_history {
            args.extend(["-S", "-"]);
        }
        let stdout = self.run_checked(&args).await?;
        Ok(trim_trailing_newlines(&stdout))
    }

    async fn send_keys(&self, name: &str, keys: &[&str]) -> MultiplexerResult<bool> {
        let target = pane_target(name);
        let mut args = vec!["send-keys", "-t", target.as_str()];
        args.extend_from_slice(keys);
        self.run_checked(&args).await?;
        Ok(true)
    }

    async fn cursor_position(&self, name: &str) -> MultiplexerResult<CursorPosition> {
        let target = pane_target(name);
        let stdout = self
            .run_checked(&["display-message", "-t", &target, "-p", "#{cursor_x} #{cursor_y}"])
            .await?;
        parse_cursor_position(&stdout)
    }

    async fn is_in_copy_mode(&self, name: &str) -> MultiplexerResult<bool> {
        let target = pane_target(name);
        let stdout = self
            .run_checked(&["display-message", "-t", &target, "-p", "#{pane_in_mode}"])
            .await?;
        Ok(stdout.trim() == "1")
    }

    async fn enter_copy_mode(&self, name: &str) -> MultiplexerResult<()> {
        let target = pane_target(name);
        self.run_checked(&["copy-mode", "-t", &target]).await?;
        debug!(session = %name, "Entered copy mode");
        Ok(())
    }

    async fn set_status_bar(&self, name: &str, visible: bool) -> MultiplexerResult<()> {
        self.set_session_option(name, "status", if visible { "on" } else { "off" })
            .await
    }
}

/// Parse one `name:created:attached` line, if it belongs to `name`
fn parse_session_info(line: &str, name: &str) -> Option<ExternalSessionInfo> {
    let mut parts = line.trim().rsplitn(3, ':');
    let attached = parts.next()?;
    let created = parts.next()?;
    let session = parts.next()?;
    if session != name {
        return None;
    }
    Some(ExternalSessionInfo {
        name: session.to_string(),
        created_at: created
            .parse::<i64>()
            .ok()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        attached: attached != "0",
    })
}

fn parse_cursor_position(stdout: &str) -> MultiplexerResult<CursorPosition> {
    let parts: Vec<&str> = stdout.split_whitespace().collect();
    match parts.as_slice() {
        [x, y] => {
            let x = x
                .parse()
                .map_err(|_| MultiplexerError::InvalidOutput(stdout.to_string()))?;
            let y = y
                .parse()
                .map_err(|_| MultiplexerError::InvalidOutput(stdout.to_string()))?;
            Ok(CursorPosition { x, y })
        }
        _ => Err(MultiplexerError::InvalidOutput(stdout.to_string())),
    }
}

/// Collapse a run of three or more trailing newlines into one
fn trim_trailing_newlines(text: &str) -> String {
    let trimmed = text.trim_end_matches('\n');
    let removed = text.len() - trimmed.len();
    if removed >= 3 {
        format!("{}\n", trimmed)
    } else {
        text.to_string()
    }
}

/// Environment applied to every attachment process
pub fn attach_environment(extra: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env = HashMap::from([
        ("TERM".to_string(), "xterm-256color".to_string()),
        ("COLORTERM".to_string(), "truecolor".to_string()),
    ]);
    env.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.insert("TERM".to_string(), "xterm-256color".to_string());
    env
}
