//! Command echo suppression
//!
//! When enabled, the line that merely echoes the last written command is
//! removed from the next output chunk. Only the first non-blank line of a chunk
//! is inspected, and at most one line is ever removed.

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;

fn ansi_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("ANSI pattern is valid"))
}

fn prompt_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[^$#>:]*[$#>:]\s*").expect("prompt pattern is valid"))
}

/// Remove CSI escape sequences
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    ansi_pattern().replace_all(text, "")
}

/// Prompt delimiters a shell may print before the echoed command
const PROMPT_DELIMITERS: [char; 4] = ['$', '#', '>', ':'];

/// Whether a cleaned line is the echo of `command`
fn is_echo_of(line: &str, command: &str) -> bool {
    if line == command {
        return true;
    }
    if PROMPT_DELIMITERS
        .iter()
        .any(|d| line.ends_with(&format!("{} {}", d, command)))
    {
        return true;
    }
    line.contains(command) && prompt_pattern().replace(line, "") == command
}

/// Remembers the last written command and strips its echo from output
#[derive(Debug, Clone, Default)]
pub struct EchoFilter {
    enabled: bool,
    last_command: Option<String>,
}

impl EchoFilter {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            last_command: None,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.last_command = None;
        }
    }

    /// Record the command carried by written input, if it ends a line
    pub fn remember_input(&mut self, data: &[u8]) {
        let Ok(text) = std::str::from_utf8(data) else {
            return;
        };
        let Some(end) = text.find(['\n', '\r']) else {
            return;
        };
        let command = text[..end].trim();
        if !command.is_empty() {
            self.last_command = Some(command.to_string());
        }
    }

    /// Filter one output chunk
    pub fn filter<'a>(&mut self, data: &'a [u8]) -> Cow<'a, [u8]> {
        if !self.enabled {
            return Cow::Borrowed(data);
        }
        let Some(command) = self.last_command.as_deref() else {
            return Cow::Borrowed(data);
        };
        let Ok(text) = std::str::from_utf8(data) else {
            return Cow::Borrowed(data);
        };

        let lines: Vec<&str> = text.split_inclusive('\n').collect();
        let mut echo_index = None;
        for (i, line) in lines.iter().enumerate() {
            let cleaned = strip_ansi(line);
            let cleaned = cleaned.trim();
            if cleaned.is_empty() {
                continue;
            }
            if is_echo_of(cleaned, command) {
                echo_index = Some(i);
            }
            // Single-shot: only the first non-blank line is compared
            break;
        }

        match echo_index {
            Some(index) => {
                self.last_command = None;
                let kept: String = lines
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != index)
                    .map(|(_, line)| *line)
                    .collect();
                Cow::Owned(kept.into_bytes())
            }
            None => Cow::Borrowed(data),
        }
    }
}
