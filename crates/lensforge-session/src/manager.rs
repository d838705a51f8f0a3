//! Session registry and lifecycle.
//!
//! [`StateManager`] owns every live session and its snapshots. Registry
//! operations are synchronous; only persistence suspends. The auto-save and
//! cleanup timers are started by [`StateManager::initialize`] and stopped by
//! [`StateManager::shutdown`].

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use lensforge_core::{
    ArchivedData, Config, ContextEntry, DateRange, MetricUpdate, Session, SessionState,
    SessionUpdate, StateSnapshot,
};
use lensforge_core::session::MAX_MADNESS;
use lensforge_metrics::{SessionAnalytics, SessionHealth, SessionReport};

use crate::context::{ContextManager, ContextUsage};
use crate::export::{ExportDocument, ExportedSnapshot, EXPORT_FORMAT_VERSION};
use crate::persistence::{PersistenceError, PersistenceHandler};

/// Storage key holding every session and snapshot.
pub const STATE_KEY: &str = "state";
/// Prefix of the per-session redundancy keys.
pub const SESSION_KEY_PREFIX: &str = "session_";
/// Prefix of snapshot archive records.
pub const ARCHIVE_KEY_PREFIX: &str = "archive_";

const STATE_FORMAT_VERSION: u32 = 1;
const CLOCK_SKEW_SECS: i64 = 60;

/// Errors raised by [`StateManager`] operations.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    #[error("Invalid export document: {0}")]
    ImportFormat(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StateError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StateError::SessionNotFound(_) | StateError::SnapshotNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StateError>;

fn invalid_update(err: lensforge_core::Error) -> StateError {
    match err {
        lensforge_core::Error::Validation(msg) | lensforge_core::Error::Config(msg) => {
            StateError::InvalidUpdate(msg)
        }
    }
}

/// One failed structural check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrityIssue {
    pub field: &'static str,
    pub message: String,
}

impl IntegrityIssue {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub sessions: usize,
    pub snapshots: usize,
    pub total_context_bytes: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedState {
    version: u32,
    saved_at: DateTime<Utc>,
    sessions: Vec<Session>,
    #[serde(default)]
    snapshots: Vec<StateSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionRecord {
    session: Session,
    #[serde(default)]
    snapshots: Vec<StateSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotArchive {
    session_id: String,
    archived_at: DateTime<Utc>,
    summary: ArchivedData,
}

fn session_key(id: &str) -> String {
    format!("{}{}", SESSION_KEY_PREFIX, id)
}

/// Owner of all live sessions and their snapshots.
pub struct StateManager {
    config: Config,
    sessions: RwLock<HashMap<String, Session>>,
    snapshots: RwLock<HashMap<String, Vec<StateSnapshot>>>,
    persistence: PersistenceHandler,
    context_manager: ContextManager,
    analytics: SessionAnalytics,
    /// Serializes `save_state` and `load_state`
    persist_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StateManager {
    /// Create a manager with the backend selected by `config`.
    pub fn new(config: Config) -> Self {
        let persistence = PersistenceHandler::new(&config.persistence);
        Self::with_persistence(config, persistence)
    }

    pub fn with_persistence(config: Config, persistence: PersistenceHandler) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            persistence,
            context_manager: ContextManager::new(),
            analytics: SessionAnalytics::new(),
            persist_lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn persistence(&self) -> &PersistenceHandler {
        &self.persistence
    }

    pub fn context_manager(&self) -> &ContextManager {
        &self.context_manager
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Restore persisted state and start the background timers.
    ///
    /// Calling this again while timers are running only returns the current
    /// session count. A manager cannot be re-initialized after `shutdown`.
    pub async fn initialize(self: &Arc<Self>) -> Result<usize> {
        if !self.tasks.lock().is_empty() {
            warn!("State manager already initialized");
            return Ok(self.sessions.read().len());
        }

        let restored = self.load_state().await?;

        let mut handles = Vec::new();
        let save_every = self.config.persistence.auto_save_interval();
        if let Some(handle) = self.spawn_timer("auto-save", save_every, |manager| async move {
            manager.run_auto_save().await;
        }) {
            handles.push(handle);
        }
        let sweep_every = self.config.cleanup.run_interval();
        if let Some(handle) = self.spawn_timer("cleanup", sweep_every, |manager| async move {
            manager.run_cleanup();
        }) {
            handles.push(handle);
        }
        self.tasks.lock().extend(handles);

        info!(
            sessions = restored,
            backend = self.persistence.backend_name(),
            "State manager initialized"
        );
        Ok(restored)
    }

    /// Stop the timers and write a final save.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Timer task ended abnormally");
            }
        }
        let saved = self.save_state().await?;
        info!(sessions = saved, "State manager shut down");
        Ok(())
    }

    /// Spawn a periodic task. The task holds only a weak reference so a
    /// dropped manager stops its own timers.
    fn spawn_timer<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        period: Duration,
        tick: F,
    ) -> Option<JoinHandle<()>>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if period.is_zero() {
            debug!(timer = name, "Timer disabled");
            return None;
        }
        let weak = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = weak.upgrade() else { break };
                        tick(manager).await;
                    }
                }
            }
            debug!(timer = name, "Timer stopped");
        }))
    }

    async fn run_auto_save(&self) {
        if let Err(e) = self.save_state().await {
            error!(error = %e, "Auto-save failed");
        }
    }

    fn run_cleanup(&self) {
        let inactive = self.cleanup_inactive_sessions(self.config.cleanup.inactive_threshold_ms);
        let expired = self.cleanup_expired_sessions();
        if inactive + expired > 0 {
            info!(inactive, expired, "Cleanup sweep removed sessions");
        }
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Create and register a new session.
    ///
    /// At capacity, the session with the oldest `last_activity` is evicted
    /// first, together with its snapshots.
    pub fn create_session(&self, user_id: &str, initial_problem: Option<&str>) -> Session {
        let session = Session::new(user_id, initial_problem);
        self.insert_session(session.clone());
        info!(session_id = %session.id, user_id, "Created session");
        session
    }

    fn insert_session(&self, session: Session) {
        let max_sessions = self.config.limits.max_sessions.max(1);
        let mut sessions = self.sessions.write();
        let mut snapshots = self.snapshots.write();
        while sessions.len() >= max_sessions {
            let oldest = sessions
                .values()
                .min_by_key(|s| s.last_activity)
                .map(|s| s.id.clone());
            let Some(oldest) = oldest else { break };
            sessions.remove(&oldest);
            snapshots.remove(&oldest);
            info!(session_id = %oldest, "Evicted least recently active session");
        }
        sessions.insert(session.id.clone(), session);
    }

    pub fn get_session(&self, id: &str) -> Option<Session> {
        self.sessions.read().get(id).cloned()
    }

    /// All live sessions, in no particular order.
    pub fn get_all_sessions(&self) -> Vec<Session> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Validate and apply a partial update, then bump `last_activity`.
    pub fn update_session(&self, id: &str, update: SessionUpdate) -> Result<Session> {
        update.validate().map_err(invalid_update)?;
        self.mutate(id, |session| update.apply_to(session))
    }

    /// Lifecycle state of `id`. Ids not in the registry report `Deleted`.
    pub fn session_state(&self, id: &str) -> SessionState {
        let threshold = i64::try_from(self.config.cleanup.inactive_threshold_ms).unwrap_or(i64::MAX);
        match self.sessions.read().get(id) {
            Some(session) => {
                session.state_at(Utc::now(), chrono::Duration::milliseconds(threshold))
            }
            None => SessionState::Deleted,
        }
    }

    pub fn delete_session(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write();
        let removed = sessions.remove(id).is_some();
        self.snapshots.write().remove(id);
        if removed {
            info!(session_id = %id, "Deleted session");
        }
        removed
    }

    /// Record a lens, evolution stage or hybrid attempt.
    pub fn add_to_context(&self, id: &str, entry: ContextEntry) -> Result<()> {
        let kind = entry.kind();
        self.mutate(id, |session| entry.apply_to(&mut session.context))?;
        debug!(session_id = %id, ?kind, "Added context entry");
        Ok(())
    }

    /// Record one metric event.
    ///
    /// A `MadnessIndex` reading divides by the current generation count, so
    /// callers record `TotalGenerations` first for the same generation.
    /// A non-finite reading is rejected before the session is touched.
    pub fn update_metrics(&self, id: &str, metric: MetricUpdate) -> Result<()> {
        metric.validate().map_err(invalid_update)?;
        self.mutate(id, |session| metric.apply_to(&mut session.metrics))
            .map(|_| ())
    }

    /// Apply `f`, touch the session and enforce the context size limit.
    fn mutate(&self, id: &str, f: impl FnOnce(&mut Session)) -> Result<Session> {
        let max_context = self.config.limits.max_context_size;
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StateError::SessionNotFound(id.to_string()))?;
        f(session);
        session.touch();

        let size = session.context.serialized_size();
        if size > max_context {
            session.context = self
                .context_manager
                .trim_context(&session.context, max_context);
            debug!(
                session_id = %id,
                before = size,
                after = session.context.serialized_size(),
                "Trimmed oversized context"
            );
        }
        Ok(session.clone())
    }

    /// Current context size against the configured ceiling.
    pub fn context_usage(&self, id: &str) -> Option<ContextUsage> {
        let sessions = self.sessions.read();
        let session = sessions.get(id)?;
        Some(
            self.context_manager
                .usage(&session.context, self.config.limits.max_context_size),
        )
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Capture a checksummed copy of a session.
    pub fn create_snapshot(&self, id: &str) -> Result<StateSnapshot> {
        let max_snapshots = self.config.limits.max_snapshots.max(1);
        let sessions = self.sessions.read();
        let state = sessions
            .get(id)
            .cloned()
            .ok_or_else(|| StateError::SessionNotFound(id.to_string()))?;
        let checksum = PersistenceHandler::checksum(&state)?;
        let snapshot = StateSnapshot {
            id: Uuid::new_v4().to_string(),
            session_id: id.to_string(),
            timestamp: Utc::now(),
            state,
            checksum,
        };

        let mut snapshots = self.snapshots.write();
        let list = snapshots.entry(id.to_string()).or_default();
        list.push(snapshot.clone());
        if list.len() > max_snapshots {
            let excess = list.len() - max_snapshots;
            list.drain(..excess);
            debug!(session_id = %id, dropped = excess, "Dropped oldest snapshots");
        }
        Ok(snapshot)
    }

    /// Snapshots of a session, oldest first.
    pub fn list_snapshots(&self, id: &str) -> Vec<StateSnapshot> {
        self.snapshots.read().get(id).cloned().unwrap_or_default()
    }

    /// Replace a session with the state captured in a snapshot.
    pub fn rollback_to_snapshot(&self, snapshot_id: &str) -> Result<Session> {
        let mut sessions = self.sessions.write();
        let snapshots = self.snapshots.read();
        let snapshot = snapshots
            .values()
            .flatten()
            .find(|s| s.id == snapshot_id)
            .ok_or_else(|| StateError::SnapshotNotFound(snapshot_id.to_string()))?;

        let mut restored = snapshot.state.clone();
        restored.touch();
        sessions.insert(restored.id.clone(), restored.clone());
        info!(session_id = %restored.id, snapshot_id, "Rolled back session");
        Ok(restored)
    }

    /// Whether a snapshot's checksum still matches its state.
    pub fn verify_snapshot(&self, snapshot: &StateSnapshot) -> bool {
        PersistenceHandler::checksum(&snapshot.state)
            .map(|sum| sum == snapshot.checksum)
            .unwrap_or(false)
    }

    /// Keep the `keep_last` most recent snapshots and archive a summary of
    /// the rest. The discarded snapshots cannot be restored.
    ///
    /// Snapshots are only removed once the archive record is stored; a
    /// failed write leaves the list as it was.
    pub async fn compress_old_snapshots(
        &self,
        id: &str,
        keep_last: usize,
    ) -> Result<Option<ArchivedData>> {
        let discarded: Vec<StateSnapshot> = {
            let sessions = self.sessions.read();
            if !sessions.contains_key(id) {
                return Err(StateError::SessionNotFound(id.to_string()));
            }
            let snapshots = self.snapshots.read();
            match snapshots.get(id) {
                Some(list) if list.len() > keep_last => {
                    let excess = list.len() - keep_last;
                    list[..excess].to_vec()
                }
                _ => return Ok(None),
            }
        };

        let summary = summarize_snapshots(&discarded);
        let archived_at = Utc::now();
        let key = format!(
            "{}{}_{}_{}",
            ARCHIVE_KEY_PREFIX,
            id,
            archived_at.timestamp_millis(),
            Uuid::new_v4().simple()
        );
        let record = SnapshotArchive {
            session_id: id.to_string(),
            archived_at,
            summary: summary.clone(),
        };
        self.persistence.save(&key, &record).await?;

        let archived: HashSet<&str> = discarded.iter().map(|s| s.id.as_str()).collect();
        if let Some(list) = self.snapshots.write().get_mut(id) {
            list.retain(|s| !archived.contains(s.id.as_str()));
        }
        info!(session_id = %id, archived = discarded.len(), key = %key, "Archived old snapshots");
        Ok(Some(summary))
    }

    // ------------------------------------------------------------------
    // Integrity
    // ------------------------------------------------------------------

    /// `true` when the session exists and passes every structural check.
    pub fn validate_session_integrity(&self, id: &str) -> bool {
        self.integrity_issues(id)
            .map(|issues| issues.is_empty())
            .unwrap_or(false)
    }

    pub fn integrity_issues(&self, id: &str) -> Result<Vec<IntegrityIssue>> {
        let sessions = self.sessions.read();
        let session = sessions
            .get(id)
            .ok_or_else(|| StateError::SessionNotFound(id.to_string()))?;
        Ok(check_integrity(session, Utc::now()))
    }

    // ------------------------------------------------------------------
    // Cleanup
    // ------------------------------------------------------------------

    /// Remove every session idle for longer than `max_inactive_ms`.
    pub fn cleanup_inactive_sessions(&self, max_inactive_ms: u64) -> usize {
        let threshold = i64::try_from(max_inactive_ms).unwrap_or(i64::MAX);
        let now = Utc::now();
        self.remove_where(|s| (now - s.last_activity).num_milliseconds() > threshold)
    }

    /// Remove every session older than `limits.max_session_age_ms`.
    pub fn cleanup_expired_sessions(&self) -> usize {
        let max_age = i64::try_from(self.config.limits.max_session_age_ms).unwrap_or(i64::MAX);
        let now = Utc::now();
        self.remove_where(|s| (now - s.start_time).num_milliseconds() > max_age)
    }

    fn remove_where(&self, predicate: impl Fn(&Session) -> bool) -> usize {
        let mut sessions = self.sessions.write();
        let mut snapshots = self.snapshots.write();
        let doomed: Vec<String> = sessions
            .values()
            .filter(|s| predicate(s))
            .map(|s| s.id.clone())
            .collect();
        for id in &doomed {
            sessions.remove(id);
            snapshots.remove(id);
            debug!(session_id = %id, "Removed session during cleanup");
        }
        doomed.len()
    }

    // ------------------------------------------------------------------
    // Analytics
    // ------------------------------------------------------------------

    pub fn get_session_report(&self, id: &str) -> Result<SessionReport> {
        let session = self
            .get_session(id)
            .ok_or_else(|| StateError::SessionNotFound(id.to_string()))?;
        Ok(self.analytics.generate_session_report(&session))
    }

    pub fn get_session_health(&self, id: &str) -> Result<SessionHealth> {
        let session = self
            .get_session(id)
            .ok_or_else(|| StateError::SessionNotFound(id.to_string()))?;
        Ok(self.analytics.calculate_session_health(&session))
    }

    pub fn stats(&self) -> ManagerStats {
        let sessions = self.sessions.read();
        let snapshots = self.snapshots.read();
        ManagerStats {
            sessions: sessions.len(),
            snapshots: snapshots.values().map(Vec::len).sum(),
            total_context_bytes: sessions
                .values()
                .map(|s| self.context_manager.context_size(&s.context))
                .sum(),
        }
    }

    // ------------------------------------------------------------------
    // Export / import
    // ------------------------------------------------------------------

    /// Serialize a session, its snapshots and a fresh report.
    pub fn export_session(&self, id: &str) -> Result<String> {
        let (session, snapshots) = {
            let sessions = self.sessions.read();
            let session = sessions
                .get(id)
                .cloned()
                .ok_or_else(|| StateError::SessionNotFound(id.to_string()))?;
            let snapshots = self.snapshots.read().get(id).cloned().unwrap_or_default();
            (session, snapshots)
        };

        let document = ExportDocument {
            version: EXPORT_FORMAT_VERSION.to_string(),
            session: (&session).into(),
            snapshots: snapshots.iter().map(ExportedSnapshot::from).collect(),
            report: Some(self.analytics.generate_session_report(&session)),
            export_timestamp: Utc::now(),
        };
        Ok(serde_json::to_string_pretty(&document)?)
    }

    /// Register an exported session under a new id.
    ///
    /// Snapshots in the document are re-associated with the new id and get
    /// new ids and checksums of their own.
    pub fn import_session(&self, blob: &str) -> Result<Session> {
        let value: serde_json::Value =
            serde_json::from_str(blob).map_err(|e| StateError::ImportFormat(e.to_string()))?;
        match value.get("version").and_then(|v| v.as_str()) {
            Some(EXPORT_FORMAT_VERSION) => {}
            Some(other) => {
                return Err(StateError::ImportFormat(format!(
                    "unsupported version {:?}",
                    other
                )))
            }
            None => return Err(StateError::ImportFormat("missing version tag".to_string())),
        }
        let document: ExportDocument =
            serde_json::from_value(value).map_err(|e| StateError::ImportFormat(e.to_string()))?;

        let original_id = document.session.id.clone();
        let mut session: Session = document.session.into();
        session.id = Uuid::new_v4().to_string();
        session.touch();
        reject_integrity_issues("session", &session)?;
        let max_context = self.config.limits.max_context_size;
        if session.context.serialized_size() > max_context {
            session.context = self.context_manager.trim_context(&session.context, max_context);
        }

        let mut snapshots = Vec::with_capacity(document.snapshots.len());
        for exported in document.snapshots {
            let mut state: Session = exported.state.into();
            state.id = session.id.clone();
            reject_integrity_issues("snapshot", &state)?;
            let checksum = PersistenceHandler::checksum(&state)?;
            snapshots.push(StateSnapshot {
                id: Uuid::new_v4().to_string(),
                session_id: session.id.clone(),
                timestamp: exported.timestamp,
                state,
                checksum,
            });
        }
        snapshots.sort_by_key(|s| s.timestamp);
        let excess = snapshots
            .len()
            .saturating_sub(self.config.limits.max_snapshots.max(1));
        snapshots.drain(..excess);

        self.insert_session(session.clone());
        if !snapshots.is_empty() {
            let sessions = self.sessions.read();
            if sessions.contains_key(&session.id) {
                self.snapshots.write().insert(session.id.clone(), snapshots);
            }
        }
        info!(session_id = %session.id, original_id = %original_id, "Imported session");
        Ok(session)
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn capture(&self) -> (Vec<Session>, HashMap<String, Vec<StateSnapshot>>) {
        let sessions = self.sessions.read();
        let snapshots = self.snapshots.read();
        (sessions.values().cloned().collect(), snapshots.clone())
    }

    /// Persist every session under the bulk key and under its own key.
    ///
    /// A failed per-session write is logged and skipped; a failed bulk write
    /// is returned. Per-session keys of sessions no longer live are removed.
    pub async fn save_state(&self) -> Result<usize> {
        let _guard = self.persist_lock.lock().await;
        let (sessions, mut snapshots) = self.capture();

        let state = PersistedState {
            version: STATE_FORMAT_VERSION,
            saved_at: Utc::now(),
            sessions: sessions.clone(),
            snapshots: snapshots.values().flatten().cloned().collect(),
        };
        self.persistence.save(STATE_KEY, &state).await?;

        let mut live = HashSet::with_capacity(sessions.len());
        for session in sessions {
            let key = session_key(&session.id);
            let record = SessionRecord {
                snapshots: snapshots.remove(&session.id).unwrap_or_default(),
                session,
            };
            if let Err(e) = self.persistence.save(&key, &record).await {
                warn!(key = %key, error = %e, "Failed to save session record");
            }
            live.insert(key);
        }

        match self.persistence.list(SESSION_KEY_PREFIX).await {
            Ok(keys) => {
                for key in keys.into_iter().filter(|k| !live.contains(k)) {
                    if let Err(e) = self.persistence.delete(&key).await {
                        warn!(key = %key, error = %e, "Failed to prune stale session record");
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to list session records"),
        }

        info!(sessions = live.len(), backend = self.persistence.backend_name(), "Saved state");
        Ok(live.len())
    }

    /// Replace the registry with persisted state.
    ///
    /// Falls back to the per-session records when the bulk key is missing or
    /// unreadable. Returns the number of sessions restored.
    pub async fn load_state(&self) -> Result<usize> {
        let _guard = self.persist_lock.lock().await;

        let bulk = match self.persistence.load::<PersistedState>(STATE_KEY).await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Bulk state unreadable, using per-session records");
                None
            }
        };
        let (sessions, snapshots) = match bulk {
            Some(state) => (state.sessions, state.snapshots),
            None => self.load_session_records().await?,
        };

        let restored = self.restore(sessions, snapshots);
        info!(sessions = restored, backend = self.persistence.backend_name(), "Loaded state");
        Ok(restored)
    }

    async fn load_session_records(&self) -> Result<(Vec<Session>, Vec<StateSnapshot>)> {
        let mut sessions = Vec::new();
        let mut snapshots = Vec::new();
        for key in self.persistence.list(SESSION_KEY_PREFIX).await? {
            match self.persistence.load::<SessionRecord>(&key).await {
                Ok(Some(record)) => {
                    sessions.push(record.session);
                    snapshots.extend(record.snapshots);
                }
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Skipping corrupt session record"),
            }
        }
        Ok((sessions, snapshots))
    }

    fn restore(&self, mut sessions: Vec<Session>, snapshots: Vec<StateSnapshot>) -> usize {
        let max_sessions = self.config.limits.max_sessions.max(1);
        let max_snapshots = self.config.limits.max_snapshots.max(1);

        let mut by_session: HashMap<String, Vec<StateSnapshot>> = HashMap::new();
        for snapshot in snapshots {
            by_session
                .entry(snapshot.session_id.clone())
                .or_default()
                .push(snapshot);
        }

        // Keep the most recently active sessions when over capacity.
        sessions.sort_by_key(|s| s.last_activity);
        let skip = sessions.len().saturating_sub(max_sessions);

        let mut registry = self.sessions.write();
        let mut snapshot_registry = self.snapshots.write();
        registry.clear();
        snapshot_registry.clear();
        for session in sessions.into_iter().skip(skip) {
            if let Some(mut list) = by_session.remove(&session.id) {
                list.sort_by_key(|s| s.timestamp);
                let excess = list.len().saturating_sub(max_snapshots);
                list.drain(..excess);
                snapshot_registry.insert(session.id.clone(), list);
            }
            registry.insert(session.id.clone(), session);
        }
        registry.len()
    }

    #[cfg(test)]
    pub(crate) fn with_session_mut<R>(&self, id: &str, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.sessions.write().get_mut(id).map(f)
    }
}

fn summarize_snapshots(snapshots: &[StateSnapshot]) -> ArchivedData {
    let date_range = match (snapshots.first(), snapshots.last()) {
        (Some(first), Some(last)) => Some(DateRange {
            start: first.timestamp,
            end: last.timestamp,
        }),
        _ => None,
    };

    let mut key_highlights = vec![format!("{} snapshots archived", snapshots.len())];
    if let (Some(first), Some(last)) = (snapshots.first(), snapshots.last()) {
        key_highlights.push(format!(
            "generations {} to {}",
            first.state.metrics.total_generations, last.state.metrics.total_generations
        ));
    }
    let domains: BTreeSet<&str> = snapshots
        .iter()
        .flat_map(|s| s.state.metrics.unique_domains_used.iter().map(String::as_str))
        .collect();
    key_highlights.push(format!("{} distinct domains", domains.len()));

    ArchivedData {
        item_count: snapshots.len(),
        date_range,
        key_highlights,
        raw: None,
    }
}

/// Refuse an imported session that fails a structural check.
fn reject_integrity_issues(what: &str, session: &Session) -> Result<()> {
    let issues = check_integrity(session, Utc::now());
    if issues.is_empty() {
        return Ok(());
    }
    let detail = issues
        .iter()
        .map(|i| format!("{}: {}", i.field, i.message))
        .collect::<Vec<_>>()
        .join("; ");
    Err(StateError::ImportFormat(format!("{} fails integrity check ({})", what, detail)))
}

fn check_integrity(session: &Session, now: DateTime<Utc>) -> Vec<IntegrityIssue> {
    let mut issues = Vec::new();

    if session.id.trim().is_empty() {
        issues.push(IntegrityIssue::new("id", "missing session id"));
    }
    if session.user_id.trim().is_empty() {
        issues.push(IntegrityIssue::new("userId", "missing user id"));
    }
    if session.start_time > session.last_activity {
        issues.push(IntegrityIssue::new(
            "lastActivity",
            "last activity precedes start time",
        ));
    }
    if session.last_activity > now + chrono::Duration::seconds(CLOCK_SKEW_SECS) {
        issues.push(IntegrityIssue::new("lastActivity", "last activity is in the future"));
    }

    let avg = session.metrics.average_madness_index;
    if !avg.is_finite() || !(0.0..=MAX_MADNESS).contains(&avg) {
        issues.push(IntegrityIssue::new(
            "metrics.averageMadnessIndex",
            format!("{} is outside 0..={}", avg, MAX_MADNESS),
        ));
    } else if avg > 0.0 && session.metrics.total_generations == 0 {
        issues.push(IntegrityIssue::new(
            "metrics.averageMadnessIndex",
            "non-zero average without generations",
        ));
    }

    if let Some(target) = session.preferences.target_madness_level {
        if !target.is_finite() || !(0.0..=MAX_MADNESS).contains(&target) {
            issues.push(IntegrityIssue::new(
                "preferences.targetMadnessLevel",
                format!("{} is outside 0..={}", target, MAX_MADNESS),
            ));
        }
    }

    for chain in &session.context.evolution_chains {
        let out_of_bounds = if chain.stages.is_empty() {
            chain.current_stage_index != 0
        } else {
            chain.current_stage_index >= chain.stages.len()
        };
        if out_of_bounds {
            issues.push(IntegrityIssue::new(
                "context.evolutionChains",
                format!(
                    "stage index {} out of bounds for chain {:?}",
                    chain.current_stage_index, chain.original_idea
                ),
            ));
        }
    }

    issues
}
