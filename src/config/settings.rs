//! Bridge configuration
//!
//! Loaded from a TOML file; every field has a default so a partial (or
//! missing) file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::{RegistryOptions, DEFAULT_MAX_SESSIONS};
use crate::session::{HandleSettings, DEFAULT_BUFFER_CAPACITY};
use crate::tmux::{
    TmuxOptions, DEFAULT_COMMAND_TIMEOUT, DEFAULT_HISTORY_LIMIT, DEFAULT_PREFIX, DEFAULT_RETRIES,
};

/// Default configuration file name
pub const CONFIG_FILE: &str = "tmux-bridge.toml";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Bind address
    pub bind: String,
    pub port: u16,
    /// Maximum concurrent in-process sessions
    pub max_sessions: usize,
    /// Prefix of every tmux session this bridge owns
    pub session_prefix: String,
    pub tmux_binary: String,
    pub command_timeout_ms: u64,
    /// Attempts for existence checks that time out or fail to spawn
    pub command_retries: u32,
    pub reconnect_delay_ms: u64,
    /// Output chunks kept per session
    pub output_buffer_capacity: usize,
    pub echo_suppression: bool,
    pub metadata_path: PathBuf,
    /// Seconds between idle handle sweeps; 0 disables the sweep
    pub cleanup_interval_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub default_cols: u16,
    pub default_rows: u16,
    /// tmux scrollback for new sessions
    pub history_limit: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 9000,
            max_sessions: DEFAULT_MAX_SESSIONS,
            session_prefix: DEFAULT_PREFIX.to_string(),
            tmux_binary: "tmux".to_string(),
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT.as_millis() as u64,
            command_retries: DEFAULT_RETRIES,
            reconnect_delay_ms: 1000,
            output_buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            echo_suppression: false,
            metadata_path: PathBuf::from("tmux-sessions.json"),
            cleanup_interval_secs: 300,
            shutdown_timeout_secs: 10,
            default_cols: 80,
            default_rows: 24,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from `path`; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("max_sessions", self.max_sessions == 0),
            ("output_buffer_capacity", self.output_buffer_capacity == 0),
            ("command_timeout_ms", self.command_timeout_ms == 0),
            ("shutdown_timeout_secs", self.shutdown_timeout_secs == 0),
            ("default_cols", self.default_cols == 0),
            ("default_rows", self.default_rows == 0),
        ];
        if let Some((field, _)) = nonzero.iter().find(|(_, zero)| *zero) {
            return Err(ConfigError::Invalid(format!("{} must be greater than 0", field)));
        }
        if self.session_prefix.is_empty() || self.session_prefix.contains([':', '.', ' ']) {
            return Err(ConfigError::Invalid(
                "session_prefix must be a non-empty tmux-safe name".to_string(),
            ));
        }
        if self.tmux_binary.is_empty() {
            return Err(ConfigError::Invalid("tmux_binary cannot be empty".to_string()));
        }
        Ok(())
    }

    pub fn tmux_options(&self) -> TmuxOptions {
        TmuxOptions {
            binary: self.tmux_binary.clone(),
            prefix: self.session_prefix.clone(),
            timeout: Duration::from_millis(self.command_timeout_ms),
            retries: self.command_retries,
            history_limit: self.history_limit,
        }
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            max_sessions: self.max_sessions,
            handle: HandleSettings {
                buffer_capacity: self.output_buffer_capacity,
                reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
                echo_suppression: self.echo_suppression,
                ..HandleSettings::default()
            },
        }
    }

    pub fn cleanup_interval(&self) -> Option<Duration> {
        (self.cleanup_interval_secs > 0).then(|| Duration::from_secs(self.cleanup_interval_secs))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
