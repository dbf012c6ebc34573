//! Persisted session metadata
//!
//! Maps logical session ids to the external session names backing them so a
//! restarted bridge can reconnect instead of creating fresh sessions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur reading or writing the metadata file
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Failed to read metadata file: {0}")]
    Read(#[source] std::io::Error),

    #[error("Failed to write metadata file: {0}")]
    Write(#[source] std::io::Error),

    #[error("Failed to parse metadata file: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("Failed to serialize metadata: {0}")]
    Serialize(#[source] serde_json::Error),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// What is remembered about one logical session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub external_name: String,
    pub project_id: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(external_name: impl Into<String>, project_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            external_name: external_name.into(),
            project_id: project_id.into(),
            created_at: now,
            last_seen: now,
        }
    }
}

/// On-disk layout
#[derive(Debug, Default, Serialize, Deserialize)]
struct MetadataFile {
    #[serde(default)]
    sessions: BTreeMap<String, SessionRecord>,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
}

/// Session records, optionally backed by a JSON file
#[derive(Debug, Default)]
pub struct MetadataStore {
    path: Option<PathBuf>,
    sessions: BTreeMap<String, SessionRecord>,
}

impl MetadataStore {
    /// Store that is never written to disk
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from `path`; a missing file yields an empty store
    pub fn load(path: impl Into<PathBuf>) -> MetadataResult<Self> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self {
                path: Some(path),
                sessions: BTreeMap::new(),
            });
        }

        let content = std::fs::read_to_string(&path).map_err(MetadataError::Read)?;
        let file: MetadataFile = serde_json::from_str(&content).map_err(MetadataError::Parse)?;
        debug!(
            path = %path.display(),
            count = file.sessions.len(),
            "Loaded session metadata"
        );

        Ok(Self {
            path: Some(path),
            sessions: file.sessions,
        })
    }

    /// Like [`load`](Self::load), but an unreadable file starts empty
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::load(path.clone()) {
            Ok(store) => store,
            Err(e) => {
                warn!(path = %path.display(), "Ignoring session metadata: {}", e);
                Self {
                    path: Some(path),
                    sessions: BTreeMap::new(),
                }
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&SessionRecord> {
        self.sessions.get(id)
    }

    /// Logical id whose record points at `external_name`
    pub fn find_by_external(&self, external_name: &str) -> Option<&str> {
        self.sessions
            .iter()
            .find(|(_, record)| record.external_name == external_name)
            .map(|(id, _)| id.as_str())
    }

    /// Insert or replace; a replaced record for the same external session
    /// keeps its original creation time
    pub fn upsert(&mut self, id: impl Into<String>, mut record: SessionRecord) {
        let id = id.into();
        if let Some(existing) = self.sessions.get(&id) {
            if existing.external_name == record.external_name {
                record.created_at = existing.created_at;
            }
        }
        self.sessions.insert(id, record);
    }

    pub fn remove(&mut self, id: &str) -> Option<SessionRecord> {
        self.sessions.remove(id)
    }

    pub fn touch(&mut self, id: &str) {
        if let Some(record) = self.sessions.get_mut(id) {
            record.last_seen = Utc::now();
        }
    }

    /// Drop every record whose external session is not in `live`
    pub fn retain_live(&mut self, live: &[String]) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, record| live.iter().any(|name| *name == record.external_name));
        before - self.sessions.len()
    }

    /// Write to the backing file, if any.
    ///
    /// The new content goes to a sibling temp file that is then renamed over
    /// the old one, so a crash mid-write never leaves a truncated file.
    pub fn save(&self) -> MetadataResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(MetadataError::Write)?;
            }
        }

        let file = MetadataFile {
            sessions: self.sessions.clone(),
            last_updated: Some(Utc::now()),
        };
        let content = serde_json::to_string_pretty(&file).map_err(MetadataError::Serialize)?;
        let staging = staging_path(path);
        std::fs::write(&staging, content).map_err(MetadataError::Write)?;
        if let Err(e) = std::fs::rename(&staging, path) {
            let _ = std::fs::remove_file(&staging);
            return Err(MetadataError::Write(e));
        }

        Ok(())
    }
}

/// `sessions.json` -> `sessions.json.tmp`, in the same directory
fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
