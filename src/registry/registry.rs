//! Session registry
//!
//! Single owner of every session handle. Keeps the id -> handle map, enforces
//! the concurrent session limit, reconnects to surviving external sessions and
//! reports external sessions that have no in-process handle.
//!
//! Operations on one id are serialized by a per-id lock so that replacing a
//! handle (detach old, install new) is atomic for other callers of that id.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::{RegistryError, RegistryResult};
use super::metadata::{MetadataStore, SessionRecord};
use crate::pty::TerminalSize;
use crate::session::{
    HandleSettings, OutputChunk, SessionDescriptor, SessionHandle, SessionOptions, SessionState,
    SessionStatus,
};
use crate::tmux::{sequence_id, Multiplexer};

/// Default maximum number of concurrent handles
pub const DEFAULT_MAX_SESSIONS: usize = 10;

/// Environment exported to managed sessions
pub const PROJECT_ID_ENV: &str = "SESSION_PROJECT_ID";
pub const WORKING_DIR_ENV: &str = "SESSION_WORKING_DIR";

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub max_sessions: usize,
    pub handle: HandleSettings,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            max_sessions: DEFAULT_MAX_SESSIONS,
            handle: HandleSettings::default(),
        }
    }
}

/// Status of one logical session, in-process or discovered
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionReport {
    pub session_id: String,
    /// An in-process handle exists
    pub exists: bool,
    pub active: bool,
    pub state: SessionState,
    pub external_name: Option<String>,
    pub external_exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<SessionStatus>,
}

/// Outcome of reconciling metadata against live external sessions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub live: usize,
    pub discovered: usize,
    pub pruned: usize,
}

/// Outcome of a shutdown pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownSummary {
    pub killed: usize,
    pub detached: usize,
}

/// Handles plus ids being created, counted together against the limit
#[derive(Default)]
struct Slots {
    handles: HashMap<String, SessionHandle>,
    pending: HashSet<String>,
}

impl Slots {
    fn occupied_excluding(&self, id: &str) -> usize {
        let mut ids: HashSet<&str> = self.handles.keys().map(String::as_str).collect();
        ids.extend(self.pending.iter().map(String::as_str));
        ids.remove(id);
        ids.len()
    }
}

/// Owner of all session handles
pub struct SessionRegistry {
    multiplexer: Arc<dyn Multiplexer>,
    options: RegistryOptions,
    slots: Mutex<Slots>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    metadata: Mutex<MetadataStore>,
}

impl SessionRegistry {
    pub fn new(
        multiplexer: Arc<dyn Multiplexer>,
        options: RegistryOptions,
        metadata: MetadataStore,
    ) -> Self {
        Self {
            multiplexer,
            options,
            slots: Mutex::new(Slots::default()),
            locks: DashMap::new(),
            metadata: Mutex::new(metadata),
        }
    }

    pub fn multiplexer(&self) -> &Arc<dyn Multiplexer> {
        &self.multiplexer
    }

    pub fn max_sessions(&self) -> usize {
        self.options.max_sessions
    }

    /// Number of in-process handles
    pub async fn len(&self) -> usize {
        self.slots.lock().await.handles.len()
    }

    pub async fn get(&self, id: &str) -> Option<SessionHandle> {
        self.slots.lock().await.handles.get(id).cloned()
    }

    /// Copy of the id -> handle map
    async fn snapshot(&self) -> Vec<(String, SessionHandle)> {
        self.slots
            .lock()
            .await
            .handles
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect()
    }

    async fn require(&self, id: &str) -> RegistryResult<SessionHandle> {
        self.get(id)
            .await
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Run `op` holding the lock for `key`.
    ///
    /// The lock entry is dropped again once no other caller holds or waits
    /// on it, so the map only contains keys with work in flight.
    async fn with_id_lock<T, F, Fut>(&self, key: &str, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.locks.entry(key.to_string()).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            op().await
        };
        drop(lock);
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Reserve a slot for `id`, failing fast when the registry is full
    async fn reserve(&self, id: &str) -> RegistryResult<()> {
        let mut slots = self.slots.lock().await;
        if slots.occupied_excluding(id) >= self.options.max_sessions {
            warn!(
                session_id = %id,
                max = self.options.max_sessions,
                "Maximum sessions reached"
            );
            return Err(RegistryError::CapacityExceeded {
                max: self.options.max_sessions,
            });
        }
        slots.pending.insert(id.to_string());
        Ok(())
    }

    /// Release the reservation and install the handle, if one was started
    async fn settle(&self, id: &str, handle: Option<SessionHandle>) {
        let mut slots = self.slots.lock().await;
        slots.pending.remove(id);
        if let Some(handle) = handle {
            slots.handles.insert(id.to_string(), handle);
        }
    }

    /// Apply a metadata change and persist it; write failures are logged
    async fn persist<F>(&self, change: F)
    where
        F: FnOnce(&mut MetadataStore),
    {
        let mut metadata = self.metadata.lock().await;
        change(&mut metadata);
        if let Err(e) = metadata.save() {
            warn!("Failed to save session metadata: {}", e);
        }
    }

    async fn is_alive(&self, name: &str) -> bool {
        match self.multiplexer.has_session(name).await {
            Ok(alive) => alive,
            Err(e) => {
                warn!(external = %name, "Session existence check failed: {}", e);
                false
            }
        }
    }

    /// Reconnect to the session recorded for `id`, or create a new one.
    ///
    /// An existing in-process handle for `id` is detached, never killed,
    /// before its replacement is installed.
    pub async fn create_or_attach(
        &self,
        id: &str,
        options: SessionOptions,
    ) -> RegistryResult<SessionDescriptor> {
        self.with_id_lock(id, || async move {
            self.reserve(id).await?;
            let result = self.create_or_attach_locked(id, options).await;
            let installed = result.as_ref().ok().map(|(handle, _)| handle.clone());
            self.settle(id, installed).await;

            result.map(|(_, descriptor)| descriptor)
        })
        .await
    }

    async fn create_or_attach_locked(
        &self,
        id: &str,
        options: SessionOptions,
    ) -> RegistryResult<(SessionHandle, SessionDescriptor)> {
        if let Some(previous) = self.get(id).await {
            match previous.detach().await {
                Ok(_) => debug!(session_id = %id, "Detached previous handle"),
                Err(e) => warn!(session_id = %id, "Failed to detach previous handle: {}", e),
            }
        }

        let recorded = self.metadata.lock().await.get(id).cloned();
        let (external_name, project_id, reconnect) = match recorded {
            Some(record) if self.is_alive(&record.external_name).await => {
                info!(
                    session_id = %id,
                    external = %record.external_name,
                    "Found existing tmux session, reconnecting"
                );
                (record.external_name, record.project_id, true)
            }
            _ => {
                let timestamp = Utc::now().timestamp_millis().max(0) as u64;
                let name = self.multiplexer.naming().timestamp_name(id, timestamp);
                (name, id.to_string(), false)
            }
        };

        let handle = SessionHandle::new(
            id,
            external_name.clone(),
            Arc::clone(&self.multiplexer),
            options,
            self.options.handle.clone(),
        );
        let descriptor = handle.start(reconnect).await?;

        self.persist(|metadata| {
            metadata.upsert(id, SessionRecord::new(external_name, project_id));
        })
        .await;

        Ok((handle, descriptor))
    }

    /// Always start a fresh sequence-numbered session for `project_id`
    pub async fn create_new(
        &self,
        project_id: &str,
        options: SessionOptions,
    ) -> RegistryResult<SessionDescriptor> {
        // Serializes sequence allocation per project
        self.with_id_lock(&format!("new:{}", project_id), || async move {
            let sequence = self.multiplexer.next_sequence_number(project_id).await?;
            let id = sequence_id(project_id, sequence);
            self.with_id_lock(&id, || {
                self.create_new_locked(project_id, sequence, &id, options)
            })
            .await
        })
        .await
    }

    async fn create_new_locked(
        &self,
        project_id: &str,
        sequence: u64,
        id: &str,
        options: SessionOptions,
    ) -> RegistryResult<SessionDescriptor> {
        let external_name = self
            .multiplexer
            .naming()
            .sequence_name(project_id, sequence);
        self.reserve(id).await?;

        let handle = SessionHandle::new(
            id,
            external_name.clone(),
            Arc::clone(&self.multiplexer),
            options,
            self.options.handle.clone(),
        );
        let result = handle.start(false).await;
        match result {
            Ok(descriptor) => {
                if let Some(previous) = self.get(id).await {
                    if let Err(e) = previous.detach().await {
                        warn!(session_id = %id, "Failed to detach previous handle: {}", e);
                    }
                }
                self.settle(id, Some(handle)).await;
                self.persist(|metadata| {
                    metadata.upsert(id, SessionRecord::new(external_name, project_id));
                })
                .await;
                info!(session_id = %id, project = %project_id, "Created new session");
                Ok(descriptor)
            }
            Err(e) => {
                self.settle(id, None).await;
                Err(e.into())
            }
        }
    }

    /// Create or attach a project's managed session rooted at its path
    pub async fn create_managed(
        &self,
        project_id: &str,
        project_path: &Path,
        mut options: SessionOptions,
    ) -> RegistryResult<SessionDescriptor> {
        options.cwd = project_path.to_path_buf();
        options
            .env
            .insert(PROJECT_ID_ENV.to_string(), project_id.to_string());
        options.env.insert(
            WORKING_DIR_ENV.to_string(),
            project_path.display().to_string(),
        );

        let descriptor = self.create_or_attach(project_id, options).await?;
        if let Some(handle) = self.get(project_id).await {
            handle.mark_promoted();
        }
        Ok(descriptor)
    }

    /// Kill and forget a session.
    ///
    /// The handle and its record are dropped only once the kill succeeded, so
    /// a failed destroy can be retried. Without a handle, the external session
    /// the id maps to is still killed and `NotFound` is returned.
    pub async fn destroy(&self, id: &str) -> RegistryResult<()> {
        self.with_id_lock(id, || self.destroy_locked(id)).await
    }

    async fn destroy_locked(&self, id: &str) -> RegistryResult<()> {
        let recorded = self
            .metadata
            .lock()
            .await
            .get(id)
            .map(|record| record.external_name.clone());

        let Some(handle) = self.get(id).await else {
            let target = match recorded {
                Some(name) => Some(name),
                None => self.find_external(id).await,
            };
            if let Some(name) = target {
                self.multiplexer.kill_session(&name).await?;
                self.persist(|metadata| {
                    metadata.remove(id);
                })
                .await;
                info!(session_id = %id, external = %name, "Killed tmux session without a handle");
            }
            return Err(RegistryError::NotFound(id.to_string()));
        };

        handle.kill().await?;
        if let Some(name) = recorded.filter(|name| name != handle.external_name()) {
            self.multiplexer.kill_session(&name).await?;
        }

        self.slots.lock().await.handles.remove(id);
        self.persist(|metadata| {
            metadata.remove(id);
        })
        .await;
        info!(session_id = %id, "Session destroyed");
        Ok(())
    }

    /// Live owned session whose name maps back to `id`
    async fn find_external(&self, id: &str) -> Option<String> {
        let live = match self.multiplexer.list_sessions().await {
            Ok(names) => names,
            Err(e) => {
                warn!("Failed to list tmux sessions: {}", e);
                return None;
            }
        };
        let naming = self.multiplexer.naming();
        live.into_iter().find(|name| {
            naming
                .parse(name)
                .is_some_and(|parsed| parsed.logical_id() == id)
        })
    }

    async fn kill_external(&self, name: &str) {
        if let Err(e) = self.multiplexer.kill_session(name).await {
            warn!(external = %name, "Failed to kill tmux session: {}", e);
        }
    }

    /// Best-effort kill of the handle and the external session. Never fails.
    pub async fn force_restart(&self, id: &str) {
        self.with_id_lock(id, || async move {
            let handle = self.slots.lock().await.handles.remove(id);
            let mut record = None;
            self.persist(|metadata| record = metadata.remove(id)).await;

            let mut killed = HashSet::new();
            if let Some(handle) = handle {
                match handle.kill().await {
                    Ok(()) => {
                        killed.insert(handle.external_name().to_string());
                    }
                    Err(e) => warn!(session_id = %id, "Force restart: handle kill failed: {}", e),
                }
            }
            if let Some(record) = record {
                if !killed.contains(&record.external_name) {
                    self.kill_external(&record.external_name).await;
                }
            }

            info!(session_id = %id, "Session force restarted");
        })
        .await
    }

    /// Detach and forget the in-process handle; the external session stays
    pub async fn detach(&self, id: &str) -> RegistryResult<()> {
        self.with_id_lock(id, || async move {
            let handle = self
                .slots
                .lock()
                .await
                .handles
                .remove(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            if let Err(e) = handle.detach().await {
                warn!(session_id = %id, "Detach failed: {}", e);
            }
            self.persist(|metadata| metadata.touch(id)).await;

            info!(session_id = %id, "Session detached, tmux session left running");
            Ok(())
        })
        .await
    }

    pub async fn write(&self, id: &str, data: &[u8]) -> RegistryResult<()> {
        let handle = self.require(id).await?;
        handle.write(data).await?;
        Ok(())
    }

    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> RegistryResult<TerminalSize> {
        let handle = self.require(id).await?;
        Ok(handle.resize(cols, rows).await?)
    }

    /// Point-in-time copy of a session's recent output
    pub async fn output_history(&self, id: &str, lines: usize) -> RegistryResult<Vec<OutputChunk>> {
        let handle = self.require(id).await?;
        Ok(handle.recent_output(lines).await)
    }

    /// Kill this session's external session during shutdown
    pub async fn mark_for_teardown(&self, id: &str) -> RegistryResult<()> {
        self.require(id).await?.mark_for_teardown();
        Ok(())
    }

    async fn report_for(&self, id: &str, handle: &SessionHandle, external_exists: bool) -> SessionReport {
        let status = handle.status().await;
        SessionReport {
            session_id: id.to_string(),
            exists: true,
            active: status.state.is_active(),
            state: status.state,
            external_name: Some(handle.external_name().to_string()),
            external_exists,
            handle: Some(status),
        }
    }

    /// Status of one id, whether or not it has a handle
    pub async fn status(&self, id: &str) -> SessionReport {
        if let Some(handle) = self.get(id).await {
            let external_exists = self.is_alive(handle.external_name()).await;
            return self.report_for(id, &handle, external_exists).await;
        }

        let recorded = self
            .metadata
            .lock()
            .await
            .get(id)
            .map(|record| record.external_name.clone());
        let external_exists = match &recorded {
            Some(name) => self.is_alive(name).await,
            None => false,
        };

        SessionReport {
            session_id: id.to_string(),
            exists: false,
            active: false,
            state: if external_exists {
                SessionState::Detached
            } else {
                SessionState::Inactive
            },
            external_name: recorded,
            external_exists,
            handle: None,
        }
    }

    /// Every in-process handle plus every owned external session without one
    pub async fn list_all(&self) -> BTreeMap<String, SessionReport> {
        let live = match self.multiplexer.list_sessions().await {
            Ok(names) => Some(names),
            Err(e) => {
                warn!("Failed to list tmux sessions: {}", e);
                None
            }
        };

        let handles = self.snapshot().await;

        let mut reports = BTreeMap::new();
        let mut claimed = HashSet::new();
        for (id, handle) in handles {
            let external_exists = match &live {
                Some(names) => names.iter().any(|n| n == handle.external_name()),
                None => true,
            };
            claimed.insert(handle.external_name().to_string());
            let report = self.report_for(&id, &handle, external_exists).await;
            reports.insert(id, report);
        }

        let Some(live) = live else {
            return reports;
        };

        let metadata = self.metadata.lock().await;
        let naming = self.multiplexer.naming();
        for name in live.into_iter().filter(|n| !claimed.contains(n)) {
            let id = metadata
                .find_by_external(&name)
                .map(str::to_string)
                .or_else(|| naming.parse(&name).map(|parsed| parsed.logical_id()))
                .unwrap_or_else(|| name.clone());
            if reports.contains_key(&id) {
                continue;
            }
            reports.insert(
                id.clone(),
                SessionReport {
                    session_id: id,
                    exists: false,
                    active: false,
                    state: SessionState::Detached,
                    external_name: Some(name),
                    external_exists: true,
                    handle: None,
                },
            );
        }

        reports
    }

    /// Drop non-active handles from memory. Never touches external sessions.
    ///
    /// States are read without holding the slot map, and a handle is only
    /// removed if it is still the one installed for its id.
    pub async fn cleanup_idle(&self) -> usize {
        let mut reapable = Vec::new();
        for (id, handle) in self.snapshot().await {
            if handle.state().await.is_reapable() {
                reapable.push((id, handle));
            }
        }

        let mut removed = 0;
        {
            let mut slots = self.slots.lock().await;
            for (id, handle) in &reapable {
                if slots
                    .handles
                    .get(id)
                    .is_some_and(|current| current.same_handle(handle))
                {
                    slots.handles.remove(id);
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(count = removed, "Removed idle session handles");
        }
        removed
    }

    /// Reconcile persisted metadata with the live external sessions
    pub async fn discover(&self) -> RegistryResult<DiscoveryReport> {
        let live = self.multiplexer.list_sessions().await?;
        let naming = self.multiplexer.naming();
        let mut report = DiscoveryReport {
            live: live.len(),
            ..DiscoveryReport::default()
        };

        let mut additions = Vec::new();
        {
            let metadata = self.metadata.lock().await;
            for name in &live {
                if metadata.find_by_external(name).is_some() {
                    continue;
                }
                let Some(parsed) = naming.parse(name) else {
                    continue;
                };
                let id = parsed.logical_id();
                // Keep a record whose session is still alive
                if let Some(existing) = metadata.get(&id) {
                    if live.contains(&existing.external_name) {
                        continue;
                    }
                }
                additions.push((id, name.clone(), parsed.project_id));
            }
        }

        let mut created: HashMap<String, Option<DateTime<Utc>>> = HashMap::new();
        for (_, name, _) in &additions {
            let created_at = match self.multiplexer.session_info(name).await {
                Ok(info) => info.and_then(|info| info.created_at),
                Err(e) => {
                    debug!(external = %name, "No session info: {}", e);
                    None
                }
            };
            created.insert(name.clone(), created_at);
        }

        self.persist(|metadata| {
            report.pruned = metadata.retain_live(&live);
            for name in &live {
                if let Some(id) = metadata.find_by_external(name).map(str::to_string) {
                    metadata.touch(&id);
                }
            }
            for (id, name, project_id) in additions {
                let mut record = SessionRecord::new(name.clone(), project_id);
                if let Some(Some(created_at)) = created.get(&name) {
                    record.created_at = *created_at;
                }
                metadata.upsert(id, record);
                report.discovered += 1;
            }
        })
        .await;

        info!(
            live = report.live,
            discovered = report.discovered,
            pruned = report.pruned,
            "Reconciled tmux sessions"
        );
        Ok(report)
    }

    /// Kill handles marked for teardown and detach the rest, within `deadline`
    pub async fn shutdown(&self, deadline: Duration) -> RegistryResult<ShutdownSummary> {
        tokio::time::timeout(deadline, self.shutdown_inner())
            .await
            .map_err(|_| RegistryError::DeadlineExceeded(deadline))
    }

    async fn shutdown_inner(&self) -> ShutdownSummary {
        let handles: Vec<(String, SessionHandle)> = self
            .slots
            .lock()
            .await
            .handles
            .drain()
            .collect();

        let mut summary = ShutdownSummary::default();
        let mut forgotten = Vec::new();
        for (id, handle) in handles {
            if handle.teardown_requested() {
                match handle.kill().await {
                    Ok(()) => summary.killed += 1,
                    Err(e) => warn!(session_id = %id, "Failed to kill session on shutdown: {}", e),
                }
                forgotten.push(id);
            } else {
                match handle.detach().await {
                    Ok(_) => summary.detached += 1,
                    Err(e) => warn!(session_id = %id, "Failed to detach session on shutdown: {}", e),
                }
            }
        }

        self.persist(|metadata| {
            for id in &forgotten {
                metadata.remove(id);
            }
        })
        .await;

        info!(
            killed = summary.killed,
            detached = summary.detached,
            "Session registry shut down"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmux::mock::MockMultiplexer;
    use tempfile::TempDir;

    fn settings() -> HandleSettings {
        HandleSettings {
            reconnect_delay: Duration::from_millis(50),
            resync_delay: Duration::from_millis(10),
            ..HandleSettings::default()
        }
    }

    fn registry_with(mux: &Arc<MockMultiplexer>, max_sessions: usize) -> SessionRegistry {
        let multiplexer: Arc<dyn Multiplexer> = mux.clone();
        SessionRegistry::new(
            multiplexer,
            RegistryOptions {
                max_sessions,
                handle: settings(),
            },
            MetadataStore::in_memory(),
        )
    }

    fn options() -> SessionOptions {
        SessionOptions::new(std::env::temp_dir())
    }

    async fn wait_until_detached(handle: &SessionHandle) {
        for _ in 0..100 {
            if !handle.is_active().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn test_fresh_create_is_active() {
        let mux = Arc::new(MockMultiplexer::new());
        let registry = registry_with(&mux, 10);

        let descriptor = registry.create_or_attach("demo", options()).await.unwrap();
        assert_eq!(descriptor.state, SessionState::Active);
        assert!(!descriptor.reconnected);
        assert!(descriptor.external_name.starts_with("claude-web-demo-"));

        let status = registry.status("demo").await;
        assert!(status.exists);
        assert!(status.active);
        assert!(status.external_exists);
        assert_eq!(status.state, SessionState::Active);

        registry.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_reattach_after_out_of_band_exit() {
        let mux = Arc::new(MockMultiplexer::new());
        let registry = registry_with(&mux, 10);

        let first = registry.create_or_attach("demo", options()).await.unwrap();
        let handle = registry.get("demo").await.unwrap();
        std::process::Command::new("kill")
            .arg(first.pid.unwrap().to_string())
            .status()
            .unwrap();
        wait_until_detached(&handle).await;
        assert!(mux.contains(&first.external_name));

        let second = registry.create_or_attach("demo", options()).await.unwrap();
        assert!(second.reconnected);
        assert_eq!(second.state, SessionState::Active);
        assert_eq!(second.external_name, first.external_name);
        assert_eq!(mux.kill_count(), 0);

        registry.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_existing_handle_is_detached_not_killed() {
        let mux = Arc::new(MockMultiplexer::new());
        let registry = registry_with(&mux, 10);

        registry.create_or_attach("demo", options()).await.unwrap();
        let old = registry.get("demo").await.unwrap();

        let second = registry.create_or_attach("demo", options()).await.unwrap();
        assert!(second.reconnected);
        assert_eq!(old.state().await, SessionState::Detached);
        assert_eq!(mux.kill_count(), 0);

        let current = registry.get("demo").await.unwrap();
        assert!(!current.same_handle(&old));
        assert!(current.is_active().await);

        registry.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_create_same_id_leaves_one_handle() {
        let mux = Arc::new(MockMultiplexer::new());
        let registry = Arc::new(registry_with(&mux, 10));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                registry.create_or_attach("demo", options()).await
            }));
        }
        let mut fresh = 0;
        for task in tasks {
            let descriptor = task.await.unwrap().unwrap();
            if !descriptor.reconnected {
                fresh += 1;
            }
        }

        assert_eq!(fresh, 1);
        assert_eq!(registry.len().await, 1);
        assert!(registry.get("demo").await.unwrap().is_active().await);
        assert_eq!(mux.session_names().len(), 1);
        assert_eq!(mux.kill_count(), 0);

        registry.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let mux = Arc::new(MockMultiplexer::new());
        let registry = registry_with(&mux, 2);

        registry.create_or_attach("a", options()).await.unwrap();
        registry.create_or_attach("b", options()).await.unwrap();

        let result = registry.create_or_attach("c", options()).await;
        assert!(matches!(
            result,
            Err(RegistryError::CapacityExceeded { max: 2 })
        ));
        assert!(registry.get("c").await.is_none());
        assert!(registry.get("a").await.unwrap().is_active().await);
        assert!(registry.get("b").await.unwrap().is_active().await);

        // Replacing an existing id does not need a new slot
        let again = registry.create_or_attach("a", options()).await.unwrap();
        assert!(again.reconnected);

        registry.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_respect_capacity() {
        let mux = Arc::new(MockMultiplexer::new());
        let registry = Arc::new(registry_with(&mux, 2));

        let tasks: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|id| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.create_or_attach(id, options()).await })
            })
            .collect();

        let mut created = 0;
        let mut rejected = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => created += 1,
                Err(RegistryError::CapacityExceeded { max: 2 }) => rejected += 1,
                Err(e) => panic!("Unexpected error: {}", e),
            }
        }

        assert_eq!(created, 2);
        assert_eq!(rejected, 1);
        assert!(registry.slots.lock().await.pending.is_empty());
        assert_eq!(registry.len().await, 2);
        assert_eq!(mux.session_names().len(), 2);

        registry.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_id_locks_do_not_accumulate() {
        let mux = Arc::new(MockMultiplexer::new());
        let registry = registry_with(&mux, 1);

        registry.create_or_attach("a", options()).await.unwrap();
        for id in ["b", "c", "d"] {
            assert!(registry.create_or_attach(id, options()).await.is_err());
        }
        registry.detach("a").await.unwrap();
        registry.create_new("proj", options()).await.unwrap();
        registry.destroy("proj-1").await.unwrap();
        registry.force_restart("a").await;
        let _ = registry.destroy("ghost").await;

        assert!(registry.locks.is_empty());
    }

    #[tokio::test]
    async fn test_failed_kill_keeps_session_destroyable() {
        let mux = Arc::new(MockMultiplexer::new());
        let registry = registry_with(&mux, 10);

        let descriptor = registry.create_or_attach("demo", options()).await.unwrap();
        mux.fail_next_kill();

        let result = registry.destroy("demo").await;
        assert!(result.is_err());
        assert!(!matches!(result, Err(RegistryError::NotFound(_))));
        assert!(mux.contains(&descriptor.external_name));
        assert!(registry.get("demo").await.is_some());
        assert_eq!(
            registry.status("demo").await.external_name.as_deref(),
            Some(descriptor.external_name.as_str())
        );

        registry.destroy("demo").await.unwrap();
        assert!(!mux.contains(&descriptor.external_name));
        assert!(registry.get("demo").await.is_none());
        assert!(registry.status("demo").await.external_name.is_none());
    }

    #[tokio::test]
    async fn test_destroy_without_record_kills_matching_session() {
        let mux = Arc::new(MockMultiplexer::new());
        mux.insert_session("claude-web-ghost-1700000000000");
        mux.insert_session("claude-web-ghost-2");
        let registry = registry_with(&mux, 10);

        let result = registry.destroy("ghost").await;
        assert!(matches!(result, Err(RegistryError::NotFound(_))));
        assert!(!mux.contains("claude-web-ghost-1700000000000"));
        assert!(mux.contains("claude-web-ghost-2"));
    }

    #[tokio::test]
    async fn test_cleanup_idle_does_not_stall_other_callers() {
        let mux = Arc::new(MockMultiplexer::new());
        let registry = Arc::new(registry_with(&mux, 10));
        registry.create_or_attach("slow", options()).await.unwrap();
        registry.create_or_attach("other", options()).await.unwrap();

        // A kill in progress holds the handle's lifecycle lock
        mux.set_kill_delay(Duration::from_millis(600));
        let slow = registry.get("slow").await.unwrap();
        let killing = tokio::spawn(async move { slow.kill().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let cleanup = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.cleanup_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let len = tokio::time::timeout(Duration::from_millis(200), registry.len()).await;
        assert_eq!(len.ok(), Some(2));

        killing.await.unwrap().unwrap();
        assert_eq!(cleanup.await.unwrap(), 1);
        assert!(registry.get("slow").await.is_none());
        assert!(registry.get("other").await.is_some());

        mux.set_kill_delay(Duration::ZERO);
        registry.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_idle_never_kills() {
        let mux = Arc::new(MockMultiplexer::new());
        let registry = registry_with(&mux, 10);

        let descriptor = registry.create_or_attach("demo", options()).await.unwrap();
        registry.create_or_attach("busy", options()).await.unwrap();
        registry.get("demo").await.unwrap().detach().await.unwrap();

        let removed = registry.cleanup_idle().await;
        assert_eq!(removed, 1);
        assert!(registry.get("demo").await.is_none());
        assert!(registry.get("busy").await.is_some());

        assert_eq!(mux.kill_count(), 0);
        assert!(mux.has_session(&descriptor.external_name).await.unwrap());

        registry.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_new_uses_sequence_numbers() {
        let mux = Arc::new(MockMultiplexer::new());
        mux.insert_session("claude-web-demo-1");
        mux.insert_session("claude-web-demo-3");
        mux.insert_session("claude-web-demo-1700000000000");
        let registry = registry_with(&mux, 10);

        let descriptor = registry.create_new("demo", options()).await.unwrap();
        assert_eq!(descriptor.session_id, "demo-4");
        assert_eq!(descriptor.external_name, "claude-web-demo-4");
        assert!(!descriptor.reconnected);

        let next = registry.create_new("demo", options()).await.unwrap();
        assert_eq!(next.session_id, "demo-5");

        registry.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_managed_marks_promoted() {
        let mux = Arc::new(MockMultiplexer::new());
        let registry = registry_with(&mux, 10);
        let temp = TempDir::new().unwrap();

        registry
            .create_managed("proj", temp.path(), options())
            .await
            .unwrap();

        let handle = registry.get("proj").await.unwrap();
        assert!(handle.is_promoted());
        let status = handle.status().await;
        assert_eq!(status.cwd, temp.path().display().to_string());

        registry.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy() {
        let mux = Arc::new(MockMultiplexer::new());
        let registry = registry_with(&mux, 10);

        let descriptor = registry.create_or_attach("demo", options()).await.unwrap();
        registry.destroy("demo").await.unwrap();
        assert!(registry.get("demo").await.is_none());
        assert!(!mux.contains(&descriptor.external_name));

        let result = registry.destroy("demo").await;
        assert!(matches!(result, Err(RegistryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_destroy_unknown_handle_kills_recorded_session() {
        let mux = Arc::new(MockMultiplexer::new());
        let registry = registry_with(&mux, 10);

        let descriptor = registry.create_or_attach("demo", options()).await.unwrap();
        registry.detach("demo").await.unwrap();
        assert!(mux.contains(&descriptor.external_name));

        let result = registry.destroy("demo").await;
        assert!(matches!(result, Err(RegistryError::NotFound(_))));
        assert!(!mux.contains(&descriptor.external_name));
    }

    #[tokio::test]
    async fn test_force_restart_never_fails() {
        let mux = Arc::new(MockMultiplexer::new());
        let registry = registry_with(&mux, 10);

        registry.force_restart("missing").await;

        let descriptor = registry.create_or_attach("demo", options()).await.unwrap();
        registry.force_restart("demo").await;
        assert!(registry.get("demo").await.is_none());
        assert!(!mux.contains(&descriptor.external_name));

        let fresh = registry.create_or_attach("demo", options()).await.unwrap();
        assert!(!fresh.reconnected);

        registry.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_and_resize_routing() {
        let mux = Arc::new(MockMultiplexer::new());
        let registry = registry_with(&mux, 10);

        assert!(matches!(
            registry.write("demo", b"ls\n").await,
            Err(RegistryError::NotFound(_))
        ));

        registry.create_or_attach("demo", options()).await.unwrap();
        registry.write("demo", b"hello\n").await.unwrap();
        let size = registry.resize("demo", 100, 30).await.unwrap();
        assert_eq!(size, TerminalSize::new(100, 30));

        registry.get("demo").await.unwrap().detach().await.unwrap();
        assert!(matches!(
            registry.write("demo", b"ls\n").await,
            Err(RegistryError::Session(crate::session::SessionError::NotActive { .. }))
        ));

        registry.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_all_includes_discovered() {
        let mux = Arc::new(MockMultiplexer::new());
        mux.insert_session("claude-web-other-2");
        mux.insert_session("unrelated");
        let registry = registry_with(&mux, 10);

        registry.create_or_attach("demo", options()).await.unwrap();

        let all = registry.list_all().await;
        assert_eq!(all.len(), 2);
        assert!(all["demo"].exists);
        assert!(all["demo"].active);

        let discovered = &all["other-2"];
        assert!(!discovered.exists);
        assert!(!discovered.active);
        assert_eq!(discovered.state, SessionState::Detached);
        assert_eq!(discovered.external_name.as_deref(), Some("claude-web-other-2"));

        registry.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_discover_and_reconnect_after_restart() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("sessions.json");
        let mux = Arc::new(MockMultiplexer::new());
        mux.insert_session("claude-web-demo-1700000000000");
        mux.insert_session("claude-web-demo-2");

        let multiplexer: Arc<dyn Multiplexer> = mux.clone();
        let registry = SessionRegistry::new(
            multiplexer,
            RegistryOptions::default(),
            MetadataStore::open(&path),
        );
        let report = registry.discover().await.unwrap();
        assert_eq!(report.live, 2);
        assert_eq!(report.discovered, 2);

        // Metadata survived on disk
        let stored = MetadataStore::load(&path).unwrap();
        assert_eq!(
            stored.get("demo").unwrap().external_name,
            "claude-web-demo-1700000000000"
        );
        assert_eq!(stored.get("demo-2").unwrap().external_name, "claude-web-demo-2");

        let descriptor = registry.create_or_attach("demo", options()).await.unwrap();
        assert!(descriptor.reconnected);
        assert_eq!(descriptor.external_name, "claude-web-demo-1700000000000");

        registry.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_discover_prunes_dead_records() {
        let mux = Arc::new(MockMultiplexer::new());
        let registry = registry_with(&mux, 10);

        let descriptor = registry.create_or_attach("demo", options()).await.unwrap();
        registry.detach("demo").await.unwrap();
        mux.remove_session(&descriptor.external_name);

        let report = registry.discover().await.unwrap();
        assert_eq!(report.pruned, 1);

        let status = registry.status("demo").await;
        assert!(!status.exists);
        assert!(!status.external_exists);
        assert_eq!(status.state, SessionState::Inactive);
    }

    #[tokio::test]
    async fn test_output_history() {
        let mux = Arc::new(MockMultiplexer::new());
        let registry = registry_with(&mux, 10);

        assert!(matches!(
            registry.output_history("demo", 10).await,
            Err(RegistryError::NotFound(_))
        ));

        registry.create_or_attach("demo", options()).await.unwrap();
        registry.write("demo", b"history line\n").await.unwrap();

        let mut chunks = Vec::new();
        for _ in 0..40 {
            chunks = registry.output_history("demo", 10).await.unwrap();
            if !chunks.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!chunks.is_empty());

        registry.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_kills_only_marked() {
        let mux = Arc::new(MockMultiplexer::new());
        let registry = registry_with(&mux, 10);

        let keep = registry.create_or_attach("keep", options()).await.unwrap();
        let doomed = registry.create_or_attach("doomed", options()).await.unwrap();
        registry.mark_for_teardown("doomed").await.unwrap();

        let summary = registry.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(summary, ShutdownSummary { killed: 1, detached: 1 });
        assert!(mux.contains(&keep.external_name));
        assert!(!mux.contains(&doomed.external_name));
        assert_eq!(registry.len().await, 0);
    }
}
