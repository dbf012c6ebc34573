//! Session handle lifecycle states

use serde::{Deserialize, Serialize};

/// Lifecycle state of a session handle
///
/// ```text
/// inactive -> active -> {detached, exited, error} -> reconnecting -> active | error
/// any -> killed (terminal)
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, never started
    Inactive,
    /// Owns a live attachment process
    Active,
    /// Attachment gone, external session believed alive
    Detached,
    /// Attachment failed and recovery is exhausted
    Error,
    /// External session confirmed gone
    Exited,
    /// Waiting to reattach after a recoverable read failure
    Reconnecting,
    /// External session destroyed on request
    Killed,
}

impl SessionState {
    pub fn is_active(self) -> bool {
        self == SessionState::Active
    }

    /// No further transitions are permitted
    pub fn is_terminal(self) -> bool {
        self == SessionState::Killed
    }

    /// Whether idle cleanup may drop the handle from memory
    pub fn is_reapable(self) -> bool {
        matches!(
            self,
            SessionState::Detached
                | SessionState::Exited
                | SessionState::Error
                | SessionState::Killed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Inactive => "inactive",
            SessionState::Active => "active",
            SessionState::Detached => "detached",
            SessionState::Error => "error",
            SessionState::Exited => "exited",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Killed => "killed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
