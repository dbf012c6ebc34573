//! External session naming
//!
//! Sessions are named `<prefix>-<projectId>-<suffix>`. The suffix is either a
//! per-project sequence number or a creation timestamp in milliseconds. The two
//! generators share one format with no discriminating tag, so a parsed suffix
//! is classified by magnitude: anything at or above [`TIMESTAMP_THRESHOLD`] is
//! treated as a timestamp.

use std::collections::BTreeSet;

use regex::Regex;

/// Suffixes at or above this value are creation timestamps, not sequence numbers.
///
/// A 13-digit millisecond timestamp is always far above it; a sequence number
/// never gets close.
pub const TIMESTAMP_THRESHOLD: u64 = 1_000_000_000;

/// Default naming prefix for sessions owned by the bridge
pub const DEFAULT_PREFIX: &str = "claude-web";

/// Classified suffix of a parsed session name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameSuffix {
    /// Monotonic per-project sequence number
    Sequence(u64),
    /// Creation time in milliseconds since the epoch
    Timestamp(u64),
}

impl NameSuffix {
    /// Classify a raw numeric suffix
    pub fn classify(value: u64) -> Self {
        if value >= TIMESTAMP_THRESHOLD {
            NameSuffix::Timestamp(value)
        } else {
            NameSuffix::Sequence(value)
        }
    }
}

/// A session name split back into its parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub project_id: String,
    pub suffix: NameSuffix,
}

impl ParsedName {
    /// Logical session identifier this external name belongs to.
    ///
    /// Timestamp-suffixed sessions are the single resumable session of a
    /// project and map to the bare project id; sequence-numbered sessions are
    /// parallel sessions and map to `projectId-N`.
    pub fn logical_id(&self) -> String {
        match self.suffix {
            NameSuffix::Timestamp(_) => self.project_id.clone(),
            NameSuffix::Sequence(n) => sequence_id(&self.project_id, n),
        }
    }
}

/// Generates and parses session names for one prefix
#[derive(Debug, Clone)]
pub struct SessionNaming {
    prefix: String,
    pattern: Regex,
}

impl SessionNaming {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        // Greedy project group so `a-b-3` parses as project `a-b`, suffix 3
        let pattern = Regex::new(&format!(r"^{}-(.+)-(\d+)$", regex::escape(&prefix)))
            .expect("session name pattern is valid");
        Self { prefix, pattern }
    }

    /// Name carrying a sequence number
    pub fn sequence_name(&self, project_id: &str, sequence: u64) -> String {
        format!("{}-{}-{}", self.prefix, project_id, sequence)
    }

    /// Name carrying a creation timestamp (milliseconds)
    pub fn timestamp_name(&self, project_id: &str, timestamp_ms: u64) -> String {
        format!("{}-{}-{}", self.prefix, project_id, timestamp_ms)
    }

    /// Whether a name carries this prefix at all
    pub fn is_owned(&self, name: &str) -> bool {
        name.starts_with(&self.prefix)
    }

    pub fn parse(&self, name: &str) -> Option<ParsedName> {
        let caps = self.pattern.captures(name)?;
        let project_id = caps.get(1)?.as_str().to_string();
        let value: u64 = caps.get(2)?.as_str().parse().ok()?;
        Some(ParsedName {
            project_id,
            suffix: NameSuffix::classify(value),
        })
    }

    /// Next free sequence number for `project_id` given the existing names.
    ///
    /// Returns `max(N) + 1` over sequence suffixes, or 1 when there are none.
    /// Zero and timestamp-sized suffixes are ignored. When `max(N) + 1` would
    /// read back as a timestamp, the lowest unused number is returned instead;
    /// `None` means every number below the threshold is taken.
    pub fn next_sequence<'a, I>(&self, names: I, project_id: &str) -> Option<u64>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let used: BTreeSet<u64> = names
            .into_iter()
            .filter_map(|name| self.parse(name))
            .filter(|parsed| parsed.project_id == project_id)
            .filter_map(|parsed| match parsed.suffix {
                NameSuffix::Sequence(n) if n > 0 => Some(n),
                _ => None,
            })
            .collect();

        match used.last() {
            None => Some(1),
            Some(&max) if max + 1 < TIMESTAMP_THRESHOLD => Some(max + 1),
            Some(_) => (1..TIMESTAMP_THRESHOLD).find(|n| !used.contains(n)),
        }
    }
}

impl Default for SessionNaming {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

/// Logical identifier of the `sequence`-th parallel session of a project
pub fn sequence_id(project_id: &str, sequence: u64) -> String {
    format!("{}-{}", project_id, sequence)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_names() {
        let naming = SessionNaming::default();
        assert_eq!(naming.sequence_name("demo", 3), "claude-web-demo-3");
        assert_eq!(
            naming.timestamp_name("demo", 1_700_000_000_000),
            "claude-web-demo-1700000000000"
        );
    }

    #[test]
    fn test_parse_sequence_name() {
        let naming = SessionNaming::default();
        let parsed = naming.parse("claude-web-demo-2").unwrap();
        assert_eq!(parsed.project_id, "demo");
        assert_eq!(parsed.suffix, NameSuffix::Sequence(2));
        assert_eq!(parsed.logical_id(), "demo-2");
    }

    #[test]
    fn test_parse_timestamp_name() {
        let naming = SessionNaming::default();
        let parsed = naming.parse("claude-web-demo-1700000000000").unwrap();
        assert_eq!(parsed.suffix, NameSuffix::Timestamp(1_700_000_000_000));
        assert_eq!(parsed.logical_id(), "demo");
    }

    #[test]
    fn test_parse_hyphenated_project() {
        let naming = SessionNaming::default();
        let parsed = naming.parse("claude-web-my-app-7").unwrap();
        assert_eq!(parsed.project_id, "my-app");
        assert_eq!(parsed.suffix, NameSuffix::Sequence(7));
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        let naming = SessionNaming::default();
        assert!(naming.parse("other-demo-1").is_none());
        assert!(naming.parse("claude-web-demo").is_none());
        assert!(naming.parse("claude-web-demo-x").is_none());
        assert!(naming.parse("0").is_none());
    }

    #[test]
    fn test_prefix_is_escaped() {
        let naming = SessionNaming::new("a.b");
        assert!(naming.parse("a.b-demo-1").is_some());
        assert!(naming.parse("axb-demo-1").is_none());
    }

    #[test]
    fn test_threshold_boundaries() {
        assert_eq!(NameSuffix::classify(1), NameSuffix::Sequence(1));
        assert_eq!(
            NameSuffix::classify(TIMESTAMP_THRESHOLD - 1),
            NameSuffix::Sequence(999_999_999)
        );
        assert_eq!(
            NameSuffix::classify(TIMESTAMP_THRESHOLD),
            NameSuffix::Timestamp(1_000_000_000)
        );
        assert_eq!(
            NameSuffix::classify(TIMESTAMP_THRESHOLD + 1),
            NameSuffix::Timestamp(1_000_000_001)
        );
    }

    #[test]
    fn test_next_sequence_skips_timestamps() {
        let naming = SessionNaming::default();
        let names = [
            "claude-web-demo-1",
            "claude-web-demo-3",
            "claude-web-demo-1712345678901",
            "claude-web-other-9",
        ];
        assert_eq!(naming.next_sequence(names, "demo"), Some(4));
    }

    #[test]
    fn test_next_sequence_defaults_to_one() {
        let naming = SessionNaming::default();
        assert_eq!(naming.next_sequence([], "demo"), Some(1));

        let only_timestamp = ["claude-web-demo-1712345678901"];
        assert_eq!(naming.next_sequence(only_timestamp, "demo"), Some(1));

        let only_zero = ["claude-web-demo-0"];
        assert_eq!(naming.next_sequence(only_zero, "demo"), Some(1));
    }

    #[test]
    fn test_next_sequence_stays_below_threshold() {
        let naming = SessionNaming::default();
        let names = [
            "claude-web-demo-1",
            "claude-web-demo-2",
            "claude-web-demo-999999999",
            "claude-web-demo-1000000000",
        ];
        let next = naming.next_sequence(names, "demo").unwrap();
        assert_eq!(next, 3);
        assert_eq!(NameSuffix::classify(next), NameSuffix::Sequence(3));

        let name = naming.sequence_name("demo", next);
        assert_eq!(naming.parse(&name).unwrap().logical_id(), "demo-3");
    }

    #[test]
    fn test_next_sequence_just_below_threshold() {
        let naming = SessionNaming::default();
        let names = ["claude-web-demo-999999998"];
        assert_eq!(naming.next_sequence(names, "demo"), Some(999_999_999));
    }

    #[test]
    fn test_is_owned() {
        let naming = SessionNaming::default();
        assert!(naming.is_owned("claude-web-demo-1"));
        assert!(!naming.is_owned("scratch"));
    }
}
