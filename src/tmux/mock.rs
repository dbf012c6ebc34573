//! In-memory multiplexer used by tests
//!
//! Tracks a set of live session names and records every call. Attachment is a
//! plain `cat`, so handles drive a real PTY without needing tmux installed.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::adapter::{
    AttachCommand, CursorPosition, ExternalSessionInfo, Multiplexer, MultiplexerError,
    MultiplexerResult,
};
use super::naming::SessionNaming;

#[derive(Default)]
pub struct MockMultiplexer {
    naming: SessionNaming,
    sessions: Mutex<BTreeSet<String>>,
    copy_mode: Mutex<BTreeSet<String>>,
    calls: Mutex<Vec<String>>,
    kills: AtomicUsize,
    fail_kill: AtomicBool,
    kill_delay: Mutex<Duration>,
    pane: Mutex<String>,
    cursor: Mutex<CursorPosition>,
}

impl MockMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend an external session already exists
    pub fn insert_session(&self, name: &str) {
        self.sessions.lock().unwrap().insert(name.to_string());
    }

    /// Pretend an external session vanished out-of-band
    pub fn remove_session(&self, name: &str) {
        self.sessions.lock().unwrap().remove(name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sessions.lock().unwrap().contains(name)
    }

    pub fn session_names(&self) -> Vec<String> {
        self.sessions.lock().unwrap().iter().cloned().collect()
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Make the next `kill_session` fail without touching the session
    pub fn fail_next_kill(&self) {
        self.fail_kill.store(true, Ordering::SeqCst);
    }

    pub fn set_kill_delay(&self, delay: Duration) {
        *self.kill_delay.lock().unwrap() = delay;
    }

    pub fn set_cursor(&self, x: u16, y: u16) {
        *self.cursor.lock().unwrap() = CursorPosition { x, y };
    }

    pub fn set_pane(&self, content: &str) {
        *self.pane.lock().unwrap() = content.to_string();
    }

    pub fn set_copy_mode(&self, name: &str, on: bool) {
        let mut modes = self.copy_mode.lock().unwrap();
        if on {
            modes.insert(name.to_string());
        } else {
            modes.remove(name);
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Multiplexer for MockMultiplexer {
    fn naming(&self) -> &SessionNaming {
        &self.naming
    }

    fn attach_command(&self, _name: &str) -> AttachCommand {
        AttachCommand {
            program: "cat".to_string(),
            args: Vec::new(),
        }
    }

    async fn has_session(&self, name: &str) -> MultiplexerResult<bool> {
        self.record(format!("has-session {}", name));
        Ok(self.contains(name))
    }

    async fn create_session(&self, name: &str, _cwd: &Path) -> MultiplexerResult<()> {
        self.record(format!("new-session {}", name));
        self.insert_session(name);
        Ok(())
    }

    async fn list_sessions(&self) -> MultiplexerResult<Vec<String>> {
        self.record("list-sessions".to_string());
        Ok(self
            .session_names()
            .into_iter()
            .filter(|name| self.naming.is_owned(name))
            .collect())
    }

    async fn session_info(&self, name: &str) -> MultiplexerResult<Option<ExternalSessionInfo>> {
        Ok(self.contains(name).then(|| ExternalSessionInfo {
            name: name.to_string(),
            created_at: None,
            attached: false,
        }))
    }

    async fn kill_session(&self, name: &str) -> MultiplexerResult<bool> {
        self.record(format!("kill-session {}", name));
        let delay = *self.kill_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_kill.swap(false, Ordering::SeqCst) {
            return Err(MultiplexerError::CommandFailed {
                command: format!("tmux kill-session -t ={}", name),
                status: Some(1),
                stderr: "server busy".to_string(),
            });
        }
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.remove_session(name);
        Ok(true)
    }

    async fn capture_pane(&self, name: &str, _include_history: bool) -> MultiplexerResult<String> {
        self.record(format!("capture-pane {}", name));
        Ok(self.pane.lock().unwrap().clone())
    }

    async fn send_keys(&self, name: &str, keys: &[&str]) -> MultiplexerResult<bool> {
        self.record(format!("send-keys {} {}", name, keys.join(" ")));
        if keys == ["q"] {
            self.set_copy_mode(name, false);
        }
        Ok(true)
    }

    async fn cursor_position(&self, name: &str) -> MultiplexerResult<CursorPosition> {
        self.record(format!("cursor {}", name));
        Ok(*self.cursor.lock().unwrap())
    }

    async fn is_in_copy_mode(&self, name: &str) -> MultiplexerResult<bool> {
        Ok(self.copy_mode.lock().unwrap().contains(name))
    }

    async fn enter_copy_mode(&self, name: &str) -> MultiplexerResult<()> {
        self.record(format!("copy-mode {}", name));
        self.set_copy_mode(name, true);
        Ok(())
    }

    async fn set_status_bar(&self, name: &str, visible: bool) -> MultiplexerResult<()> {
        self.record(format!("status {} {}", name, visible));
        Ok(())
    }
}
