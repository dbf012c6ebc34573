//! Protocol message definitions
//!
//! Defines the message types exchanged between terminal clients and the bridge.
//! All messages are JSON-encoded and include version information for compatibility.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bridge::{BridgeEvent, ScrollAmount, ScrollDirection, Utf8Decoder};
use crate::registry::{RegistryError, SessionReport};
use crate::session::{OutputChunk, SessionDescriptor, SessionError, SessionState};

/// Current protocol version
/// Increment when making breaking changes to message format
pub const PROTOCOL_VERSION: u32 = 1;

/// Minimum supported protocol version
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Maximum terminal dimensions
pub const MAX_TERMINAL_COLS: u16 = 500;
pub const MAX_TERMINAL_ROWS: u16 = 200;

/// Maximum input length (1MB)
pub const MAX_INPUT_LENGTH: usize = 1024 * 1024;

/// Maximum path length
pub const MAX_PATH_LENGTH: usize = 4096;

/// Maximum session, project and room identifier length
pub const MAX_IDENTIFIER_LENGTH: usize = 256;

/// Default number of history chunks returned
pub const DEFAULT_HISTORY_LINES: usize = 100;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Protocol version {0} not supported (min: {MIN_PROTOCOL_VERSION}, current: {PROTOCOL_VERSION})")]
    UnsupportedVersion(u32),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Message Envelope
// ============================================================================

/// Protocol envelope wrapping all client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
    /// Protocol version used by the client
    #[serde(default = "default_version")]
    pub version: u32,
    /// The actual message payload
    #[serde(flatten)]
    pub message: ClientMessage,
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

fn default_history_lines() -> usize {
    DEFAULT_HISTORY_LINES
}

impl ClientEnvelope {
    /// Parse and validate a client envelope from JSON
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let envelope: Self = serde_json::from_str(json)?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn validate(&self) -> ProtocolResult<()> {
        if self.version < MIN_PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(self.version));
        }
        self.message.validate()
    }
}

#[cfg(test)]
impl ClientEnvelope {
    pub fn new(message: ClientMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message,
        }
    }

    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Client Messages
// ============================================================================

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Connection keepalive ping
    Ping { seq: u64 },

    /// Resume the session for an id, or create it
    CreateSession {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },

    /// Start an additional parallel session for a project
    CreateNewSession {
        project_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },

    /// Resume or create a project's managed session rooted at its path
    CreateManagedSession {
        project_id: String,
        project_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },

    /// Keystrokes for a session
    TerminalInput { session_id: String, input: String },

    ResizeTerminal {
        session_id: String,
        cols: u16,
        rows: u16,
    },

    /// Drop the in-process handle, keep the tmux session
    DetachSession { session_id: String },

    /// Kill the tmux session
    DestroySession { session_id: String },

    /// Best-effort kill so the next create starts clean
    ForceRestart { session_id: String },

    /// Kill this session when the bridge shuts down
    MarkForTeardown { session_id: String },

    GetStatus { session_id: String },

    ListSessions,

    GetOutputHistory {
        session_id: String,
        #[serde(default = "default_history_lines")]
        lines: usize,
    },

    Scroll {
        session_id: String,
        direction: ScrollDirection,
        #[serde(default)]
        amount: ScrollAmount,
    },

    /// Jump to the bottom of history and leave copy mode
    GoToBottom { session_id: String },

    CopyMode { session_id: String, enabled: bool },

    /// Cursor position in the session's active pane
    GetCursor { session_id: String },

    SetEchoSuppression { session_id: String, enabled: bool },

    JoinRoom { room: String },

    LeaveRoom { room: String },
}

fn validate_identifier(field: &str, value: &str) -> ProtocolResult<()> {
    if value.is_empty() {
        return Err(ProtocolError::ValidationError(format!(
            "{} cannot be empty",
            field
        )));
    }
    if value.len() > MAX_IDENTIFIER_LENGTH {
        return Err(ProtocolError::ValidationError(format!(
            "{} exceeds maximum length of {} characters",
            field, MAX_IDENTIFIER_LENGTH
        )));
    }
    Ok(())
}

/// Session and project ids become part of tmux session names
fn validate_session_name(field: &str, value: &str) -> ProtocolResult<()> {
    validate_identifier(field, value)?;
    if value
        .chars()
        .any(|c| c == ':' || c == '.' || c.is_whitespace() || c.is_control())
    {
        return Err(ProtocolError::ValidationError(format!(
            "{} contains characters not allowed in session names",
            field
        )));
    }
    Ok(())
}

fn validate_path(field: &str, value: &str) -> ProtocolResult<()> {
    if value.is_empty() {
        return Err(ProtocolError::ValidationError(format!(
            "{} cannot be empty",
            field
        )));
    }
    if value.len() > MAX_PATH_LENGTH {
        return Err(ProtocolError::ValidationError(format!(
            "{} exceeds maximum length of {} characters",
            field, MAX_PATH_LENGTH
        )));
    }
    Ok(())
}

fn validate_dimensions(cols: Option<u16>, rows: Option<u16>) -> ProtocolResult<()> {
    if let Some(c) = cols {
        if c == 0 || c > MAX_TERMINAL_COLS {
            return Err(ProtocolError::ValidationError(format!(
                "cols must be between 1 and {}",
                MAX_TERMINAL_COLS
            )));
        }
    }
    if let Some(r) = rows {
        if r == 0 || r > MAX_TERMINAL_ROWS {
            return Err(ProtocolError::ValidationError(format!(
                "rows must be between 1 and {}",
                MAX_TERMINAL_ROWS
            )));
        }
    }
    Ok(())
}

impl ClientMessage {
    /// Validate message contents
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            ClientMessage::Ping { .. } | ClientMessage::ListSessions => Ok(()),

            ClientMessage::CreateSession {
                session_id,
                cwd,
                cols,
                rows,
            } => {
                validate_session_name("session_id", session_id)?;
                if let Some(cwd) = cwd {
                    validate_path("cwd", cwd)?;
                }
                validate_dimensions(*cols, *rows)
            }

            ClientMessage::CreateNewSession {
                project_id,
                cwd,
                cols,
                rows,
            } => {
                validate_session_name("project_id", project_id)?;
                if let Some(cwd) = cwd {
                    validate_path("cwd", cwd)?;
                }
                validate_dimensions(*cols, *rows)
            }

            ClientMessage::CreateManagedSession {
                project_id,
                project_path,
                cols,
                rows,
            } => {
                validate_session_name("project_id", project_id)?;
                validate_path("project_path", project_path)?;
                validate_dimensions(*cols, *rows)
            }

            ClientMessage::TerminalInput { session_id, input } => {
                validate_identifier("session_id", session_id)?;
                if input.len() > MAX_INPUT_LENGTH {
                    return Err(ProtocolError::ValidationError(format!(
                        "input exceeds maximum length of {} bytes",
                        MAX_INPUT_LENGTH
                    )));
                }
                Ok(())
            }

            ClientMessage::ResizeTerminal {
                session_id,
                cols,
                rows,
            } => {
                validate_identifier("session_id", session_id)?;
                validate_dimensions(Some(*cols), Some(*rows))
            }

            ClientMessage::Scroll {
                session_id, amount, ..
            } => {
                validate_identifier("session_id", session_id)?;
                if let ScrollAmount::Lines(n) = amount {
                    if *n == 0 || *n > u32::from(MAX_TERMINAL_ROWS) {
                        return Err(ProtocolError::ValidationError(format!(
                            "lines must be between 1 and {}",
                            MAX_TERMINAL_ROWS
                        )));
                    }
                }
                Ok(())
            }

            ClientMessage::DetachSession { session_id }
            | ClientMessage::DestroySession { session_id }
            | ClientMessage::ForceRestart { session_id }
            | ClientMessage::MarkForTeardown { session_id }
            | ClientMessage::GetStatus { session_id }
            | ClientMessage::GetOutputHistory { session_id, .. }
            | ClientMessage::GoToBottom { session_id }
            | ClientMessage::CopyMode { session_id, .. }
            | ClientMessage::GetCursor { session_id }
            | ClientMessage::SetEchoSuppression { session_id, .. } => {
                validate_identifier("session_id", session_id)
            }

            ClientMessage::JoinRoom { room } | ClientMessage::LeaveRoom { room } => {
                validate_identifier("room", room)
            }
        }
    }
}

#[cfg(test)]
impl ClientMessage {
    pub fn ping(seq: u64) -> Self {
        ClientMessage::Ping { seq }
    }

    pub fn create_session(session_id: impl Into<String>) -> Self {
        ClientMessage::CreateSession {
            session_id: session_id.into(),
            cwd: None,
            cols: None,
            rows: None,
        }
    }

    pub fn terminal_input(session_id: impl Into<String>, input: impl Into<String>) -> Self {
        ClientMessage::TerminalInput {
            session_id: session_id.into(),
            input: input.into(),
        }
    }

    pub fn resize_terminal(session_id: impl Into<String>, cols: u16, rows: u16) -> Self {
        ClientMessage::ResizeTerminal {
            session_id: session_id.into(),
            cols,
            rows,
        }
    }
}

// ============================================================================
// Server Messages
// ============================================================================

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Welcome message sent on connection
    Welcome {
        version: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        server_id: Option<String>,
    },

    Pong { seq: u64 },

    /// Session started or reattached; the caller has joined `room`
    SessionCreated {
        session_id: String,
        external_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        state: SessionState,
        created_at: DateTime<Utc>,
        reconnected: bool,
        room: String,
    },

    /// Terminal output (may contain ANSI escape sequences)
    Output {
        session_id: String,
        data: String,
        timestamp: DateTime<Utc>,
    },

    /// Attachment process ended
    Ended {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        timestamp: DateTime<Utc>,
    },

    Resized {
        session_id: String,
        cols: u16,
        rows: u16,
    },

    /// Request completed with nothing else to report
    Ack {
        action: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },

    Status { session: SessionSummary },

    SessionList { sessions: Vec<SessionSummary> },

    OutputHistory {
        session_id: String,
        chunks: Vec<HistoryChunk>,
    },

    /// Zero-based cursor column and row
    Cursor { session_id: String, x: u16, y: u16 },

    /// Error response
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

/// Session status as seen by clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSummary {
    pub session_id: String,
    /// An in-process handle exists
    pub exists: bool,
    pub active: bool,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_name: Option<String>,
    pub external_exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    #[serde(default)]
    pub promoted: bool,
}

/// One buffered output chunk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryChunk {
    pub timestamp: DateTime<Utc>,
    pub data: String,
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Invalid message format
    InvalidMessage,
    /// Maximum sessions reached; retry later
    ServiceOverloaded,
    SessionNotFound,
    /// Terminal not active
    NotActive,
    AlreadyStarted,
    CreateFailed,
    ReconnectFailed,
    /// Events were dropped because the session outpaced the bridge
    OutputOverflow,
    /// tmux invocation failed
    MultiplexerError,
    /// Internal server error
    InternalError,
    /// Unsupported protocol version
    UnsupportedVersion,
}

impl ServerMessage {
    pub fn welcome_with_id(server_id: impl Into<String>) -> Self {
        ServerMessage::Welcome {
            version: PROTOCOL_VERSION,
            server_id: Some(server_id.into()),
        }
    }

    pub fn pong(seq: u64) -> Self {
        ServerMessage::Pong { seq }
    }

    pub fn session_created(descriptor: SessionDescriptor, room: impl Into<String>) -> Self {
        ServerMessage::SessionCreated {
            session_id: descriptor.session_id,
            external_name: descriptor.external_name,
            pid: descriptor.pid,
            state: descriptor.state,
            created_at: descriptor.created_at,
            reconnected: descriptor.reconnected,
            room: room.into(),
        }
    }

    pub fn ack(action: impl Into<String>, session_id: Option<&str>) -> Self {
        ServerMessage::Ack {
            action: action.into(),
            session_id: session_id.map(str::to_string),
            detail: None,
        }
    }

    pub fn ack_with_detail(
        action: impl Into<String>,
        session_id: &str,
        detail: impl Into<String>,
    ) -> Self {
        ServerMessage::Ack {
            action: action.into(),
            session_id: Some(session_id.to_string()),
            detail: Some(detail.into()),
        }
    }

    /// Buffered chunks decoded as one stream, so a character split between
    /// two reads stays intact
    pub fn output_history(session_id: impl Into<String>, chunks: &[OutputChunk]) -> Self {
        let mut decoder = Utf8Decoder::new();
        let mut history: Vec<HistoryChunk> = chunks
            .iter()
            .map(|chunk| HistoryChunk {
                timestamp: chunk.timestamp,
                data: decoder.decode(&chunk.data),
            })
            .collect();
        if let Some(last) = history.last_mut() {
            last.data.push_str(&decoder.finish());
        }
        history.retain(|chunk| !chunk.data.is_empty());

        ServerMessage::OutputHistory {
            session_id: session_id.into(),
            chunks: history,
        }
    }

    pub fn error_with_code(message: impl Into<String>, code: ErrorCode) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: Some(code),
            session_id: None,
        }
    }

    /// Create an Error message for a specific session
    pub fn session_error(session_id: &str, message: impl Into<String>, code: ErrorCode) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: Some(code),
            session_id: Some(session_id.to_string()),
        }
    }

    /// Map a registry failure to a user-facing error
    pub fn registry_error(session_id: &str, err: &RegistryError) -> Self {
        let message = match err {
            RegistryError::Session(SessionError::NotActive { .. }) => {
                "Terminal not active".to_string()
            }
            other => other.to_string(),
        };
        ServerMessage::session_error(session_id, message, ErrorCode::from(err))
    }
}

// ============================================================================
// Conversion Traits
// ============================================================================

impl From<ProtocolError> for ServerMessage {
    fn from(err: ProtocolError) -> Self {
        let code = match &err {
            ProtocolError::SerializationError(_) => ErrorCode::InvalidMessage,
            ProtocolError::UnsupportedVersion(_) => ErrorCode::UnsupportedVersion,
            ProtocolError::ValidationError(_) => ErrorCode::InvalidMessage,
        };
        ServerMessage::error_with_code(err.to_string(), code)
    }
}

impl From<&RegistryError> for ErrorCode {
    fn from(err: &RegistryError) -> Self {
        match err {
            RegistryError::CapacityExceeded { .. } => ErrorCode::ServiceOverloaded,
            RegistryError::NotFound(_) => ErrorCode::SessionNotFound,
            RegistryError::Session(SessionError::NotActive { .. }) => ErrorCode::NotActive,
            RegistryError::Session(SessionError::AlreadyStarted) => ErrorCode::AlreadyStarted,
            RegistryError::Session(SessionError::CreateFailed(_)) => ErrorCode::CreateFailed,
            RegistryError::Session(SessionError::ReconnectFailed(_)) => ErrorCode::ReconnectFailed,
            RegistryError::Session(SessionError::Multiplexer(_)) | RegistryError::Multiplexer(_) => {
                ErrorCode::MultiplexerError
            }
            _ => ErrorCode::InternalError,
        }
    }
}

impl From<BridgeEvent> for ServerMessage {
    fn from(event: BridgeEvent) -> Self {
        match event {
            BridgeEvent::Output {
                session_id,
                data,
                timestamp,
            } => ServerMessage::Output {
                session_id,
                data,
                timestamp,
            },
            BridgeEvent::Ended {
                session_id,
                exit_code,
                timestamp,
            } => ServerMessage::Ended {
                session_id,
                exit_code,
                timestamp,
            },
            BridgeEvent::Error {
                session_id,
                message,
                ..
            } => ServerMessage::session_error(&session_id, message, ErrorCode::ReconnectFailed),
            BridgeEvent::Overflow {
                session_id,
                skipped,
                ..
            } => ServerMessage::session_error(
                &session_id,
                format!("Output overflow, {} events skipped", skipped),
                ErrorCode::OutputOverflow,
            ),
        }
    }
}

impl From<&SessionReport> for SessionSummary {
    fn from(report: &SessionReport) -> Self {
        let handle = report.handle.as_ref();
        SessionSummary {
            session_id: report.session_id.clone(),
            exists: report.exists,
            active: report.active,
            state: report.state,
            external_name: report.external_name.clone(),
            external_exists: report.external_exists,
            pid: handle.and_then(|h| h.pid),
            created_at: handle.map(|h| h.created_at),
            last_activity: handle.map(|h| h.last_activity),
            cols: handle.map(|h| h.size.cols),
            rows: handle.map(|h| h.size.rows),
            promoted: handle.is_some_and(|h| h.promoted),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // Client Message Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_ping_serialization() {
        let msg = ClientMessage::ping(42);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"ping\""));
        assert!(json.contains("\"seq\":42"));

        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_parse_minimal_create_session() {
        let json = r#"{"type": "create_session", "session_id": "demo"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg, ClientMessage::create_session("demo"));
    }

    #[test]
    fn test_parse_full_create_managed_session() {
        let json = r#"{"type": "create_managed_session", "project_id": "web", "project_path": "/src/web", "cols": 120, "rows": 40}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::CreateManagedSession {
                project_id,
                project_path,
                cols,
                rows,
            } => {
                assert_eq!(project_id, "web");
                assert_eq!(project_path, "/src/web");
                assert_eq!(cols, Some(120));
                assert_eq!(rows, Some(40));
            }
            _ => panic!("Expected CreateManagedSession"),
        }
    }

    #[test]
    fn test_parse_scroll_defaults() {
        let json = r#"{"type": "scroll", "session_id": "demo", "direction": "up"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Scroll {
                session_id: "demo".to_string(),
                direction: ScrollDirection::Up,
                amount: ScrollAmount::Line,
            }
        );

        let json = r#"{"type": "scroll", "session_id": "demo", "direction": "down", "amount": "page"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::Scroll {
                amount: ScrollAmount::Page,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_history_default_lines() {
        let json = r#"{"type": "get_output_history", "session_id": "demo"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            ClientMessage::GetOutputHistory {
                session_id: "demo".to_string(),
                lines: DEFAULT_HISTORY_LINES,
            }
        );
    }

    #[test]
    fn test_terminal_input_serialization() {
        let msg = ClientMessage::terminal_input("demo", "ls -la\r");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"terminal_input\""));

        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_list_sessions_serialization() {
        let json = serde_json::to_string(&ClientMessage::ListSessions).unwrap();
        assert_eq!(json, r#"{"type":"list_sessions"}"#);
    }

    // -------------------------------------------------------------------------
    // Server Message Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_welcome_serialization() {
        let msg = ServerMessage::welcome_with_id("conn-1");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"welcome\""));
        assert!(json.contains(&format!("\"version\":{}", PROTOCOL_VERSION)));
        assert!(json.contains("\"server_id\":\"conn-1\""));

        let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_session_created_serialization() {
        let descriptor = SessionDescriptor {
            session_id: "demo".to_string(),
            external_name: "claude-web-demo-1".to_string(),
            pid: Some(1234),
            state: SessionState::Active,
            created_at: Utc::now(),
            reconnected: true,
        };
        let msg = ServerMessage::session_created(descriptor, "session:demo");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"session_created\""));
        assert!(json.contains("\"state\":\"active\""));
        assert!(json.contains("\"reconnected\":true"));
        assert!(json.contains("\"room\":\"session:demo\""));

        let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_output_and_ended_are_distinct() {
        let now = Utc::now();
        let output = ServerMessage::from(BridgeEvent::Output {
            session_id: "demo".to_string(),
            data: "text".to_string(),
            timestamp: now,
        });
        let ended = ServerMessage::from(BridgeEvent::Ended {
            session_id: "demo".to_string(),
            exit_code: Some(0),
            timestamp: now,
        });

        let output_json = serde_json::to_value(&output).unwrap();
        let ended_json = serde_json::to_value(&ended).unwrap();
        assert_eq!(output_json["type"], "output");
        assert_eq!(ended_json["type"], "ended");
        assert_eq!(ended_json["exit_code"], 0);
    }

    #[test]
    fn test_error_serialization() {
        let msg = ServerMessage::session_error("demo", "Terminal not active", ErrorCode::NotActive);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("\"code\":\"not_active\""));
        assert!(json.contains("\"session_id\":\"demo\""));

        let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    fn chunk(seq: u64, data: &[u8]) -> OutputChunk {
        OutputChunk {
            seq,
            timestamp: Utc::now(),
            data: data.to_vec(),
        }
    }

    fn history_text(msg: ServerMessage) -> Vec<String> {
        match msg {
            ServerMessage::OutputHistory { chunks, .. } => {
                chunks.into_iter().map(|chunk| chunk.data).collect()
            }
            _ => panic!("Expected OutputHistory"),
        }
    }

    #[test]
    fn test_history_replaces_invalid_bytes() {
        let msg = ServerMessage::output_history("demo", &[chunk(0, &[b'o', b'k', 0xff])]);
        assert_eq!(history_text(msg), vec!["ok\u{FFFD}"]);
    }

    #[test]
    fn test_history_keeps_character_split_across_chunks() {
        let chunks = [chunk(0, &[b'a', 0xC3]), chunk(1, &[0xA9, b'b'])];
        let msg = ServerMessage::output_history("demo", &chunks);
        assert_eq!(history_text(msg), vec!["a", "éb"]);

        // A chunk that is only the lead byte produces no entry of its own
        let chunks = [chunk(0, &[0xC3]), chunk(1, &[0xA9])];
        let msg = ServerMessage::output_history("demo", &chunks);
        assert_eq!(history_text(msg), vec!["é"]);
    }

    #[test]
    fn test_history_flushes_truncated_tail() {
        let msg = ServerMessage::output_history("demo", &[chunk(0, &[b'x', 0xE2, 0x82])]);
        assert_eq!(history_text(msg), vec!["x\u{FFFD}"]);
    }

    #[test]
    fn test_overflow_has_its_own_code() {
        let msg = ServerMessage::from(BridgeEvent::Overflow {
            session_id: "demo".to_string(),
            skipped: 12,
            timestamp: Utc::now(),
        });
        match msg {
            ServerMessage::Error { message, code, .. } => {
                assert_eq!(code, Some(ErrorCode::OutputOverflow));
                assert!(message.contains("12 events skipped"));
            }
            _ => panic!("Expected Error message"),
        }

        let msg = ServerMessage::from(BridgeEvent::Error {
            session_id: "demo".to_string(),
            message: "attach failed".to_string(),
            timestamp: Utc::now(),
        });
        assert!(matches!(
            msg,
            ServerMessage::Error {
                code: Some(ErrorCode::ReconnectFailed),
                ..
            }
        ));
    }

    #[test]
    fn test_cursor_messages() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type": "get_cursor", "session_id": "demo"}"#).unwrap();
        assert!(msg.validate().is_ok());
        let empty = ClientMessage::GetCursor {
            session_id: String::new(),
        };
        assert!(empty.validate().is_err());

        let json = serde_json::to_value(ServerMessage::Cursor {
            session_id: "demo".to_string(),
            x: 4,
            y: 2,
        })
        .unwrap();
        assert_eq!(json["type"], "cursor");
        assert_eq!(json["x"], 4);
        assert_eq!(json["y"], 2);
    }

    // -------------------------------------------------------------------------
    // Envelope Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_client_envelope_serialization() {
        let envelope = ClientEnvelope::new(ClientMessage::ping(1));
        let json = envelope.to_json().unwrap();
        assert!(json.contains(&format!("\"version\":{}", PROTOCOL_VERSION)));
        assert!(json.contains("\"type\":\"ping\""));

        let parsed = ClientEnvelope::from_json(&json).unwrap();
        assert_eq!(parsed.version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_envelope_without_version_defaults() {
        let parsed = ClientEnvelope::from_json(r#"{"type": "list_sessions"}"#).unwrap();
        assert_eq!(parsed.version, PROTOCOL_VERSION);
        assert_eq!(parsed.message, ClientMessage::ListSessions);
    }

    #[test]
    fn test_envelope_version_validation() {
        let json = r#"{"version": 0, "type": "ping", "seq": 1}"#;
        let result = ClientEnvelope::from_json(json);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("not supported"));
    }

    // -------------------------------------------------------------------------
    // Validation Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_empty_session_id_rejected() {
        let result = ClientMessage::create_session("").validate();
        assert!(result.unwrap_err().to_string().contains("cannot be empty"));
    }

    #[test]
    fn test_session_id_characters() {
        assert!(ClientMessage::create_session("web-app_2").validate().is_ok());
        assert!(ClientMessage::create_session("a:b").validate().is_err());
        assert!(ClientMessage::create_session("a.b").validate().is_err());
        assert!(ClientMessage::create_session("a b").validate().is_err());
    }

    #[test]
    fn test_session_id_max_length() {
        let long = "x".repeat(MAX_IDENTIFIER_LENGTH + 1);
        let result = ClientMessage::create_session(long).validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("exceeds maximum length"));
    }

    #[test]
    fn test_resize_terminal_bounds() {
        assert!(ClientMessage::resize_terminal("demo", 0, 24).validate().is_err());
        assert!(ClientMessage::resize_terminal("demo", 80, 0).validate().is_err());
        assert!(ClientMessage::resize_terminal("demo", MAX_TERMINAL_COLS + 1, 24)
            .validate()
            .is_err());
        assert!(ClientMessage::resize_terminal("demo", 80, MAX_TERMINAL_ROWS + 1)
            .validate()
            .is_err());
        assert!(ClientMessage::resize_terminal("demo", 80, 24).validate().is_ok());
    }

    #[test]
    fn test_create_dimensions_validated() {
        let msg = ClientMessage::CreateSession {
            session_id: "demo".to_string(),
            cwd: None,
            cols: Some(0),
            rows: None,
        };
        assert!(msg.validate().unwrap_err().to_string().contains("cols must be"));
    }

    #[test]
    fn test_terminal_input_max_length() {
        let large_input = "x".repeat(MAX_INPUT_LENGTH + 1);
        let result = ClientMessage::terminal_input("demo", large_input).validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("exceeds maximum length"));
    }

    #[test]
    fn test_scroll_lines_bounds() {
        let msg = ClientMessage::Scroll {
            session_id: "demo".to_string(),
            direction: ScrollDirection::Up,
            amount: ScrollAmount::Lines(0),
        };
        assert!(msg.validate().is_err());
    }

    // -------------------------------------------------------------------------
    // Error Conversion Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_protocol_error_to_server_message() {
        let err = ProtocolError::ValidationError("test error".to_string());
        let msg: ServerMessage = err.into();

        match msg {
            ServerMessage::Error { message, code, .. } => {
                assert!(message.contains("test error"));
                assert_eq!(code, Some(ErrorCode::InvalidMessage));
            }
            _ => panic!("Expected Error message"),
        }
    }

    #[test]
    fn test_registry_error_codes() {
        let err = RegistryError::CapacityExceeded { max: 10 };
        assert_eq!(ErrorCode::from(&err), ErrorCode::ServiceOverloaded);

        let err = RegistryError::NotFound("demo".to_string());
        assert_eq!(ErrorCode::from(&err), ErrorCode::SessionNotFound);

        let err = RegistryError::Session(SessionError::NotActive {
            state: SessionState::Detached,
        });
        match ServerMessage::registry_error("demo", &err) {
            ServerMessage::Error {
                message,
                code,
                session_id,
            } => {
                assert_eq!(message, "Terminal not active");
                assert_eq!(code, Some(ErrorCode::NotActive));
                assert_eq!(session_id.as_deref(), Some("demo"));
            }
            _ => panic!("Expected Error message"),
        }
    }

    #[test]
    fn test_capacity_message_mentions_maximum() {
        let err = RegistryError::CapacityExceeded { max: 2 };
        match ServerMessage::registry_error("c", &err) {
            ServerMessage::Error { message, .. } => {
                assert!(message.contains("Maximum sessions reached"));
            }
            _ => panic!("Expected Error message"),
        }
    }
}
