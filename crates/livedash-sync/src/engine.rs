//! Dashboard sync engine.
//!
//! Holds the active dashboard and persists it:
//! - local documents are written synchronously on every edit
//! - shared documents are written on `save` with compare-and-swap against
//!   the last known revision, and a background watch flags foreign writes
//!
//! Conflicts are surfaced, never merged. Only `reload` (adopt the store's
//! version) and `overwrite` (replace it) clear the conflicted flag.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::import::{export_bundle, parse_document, parse_entries, ImportMode, ImportReport};
use crate::local::{DashboardSummary, LocalRepository};
use crate::slug::{generate_slug, shared_key, split_key};
use crate::storage::{FileStorage, LocalStorage};
use bytes::Bytes;
use chrono::Utc;
use futures_util::StreamExt;
use livedash_core::{validate_kv_key, DashboardDocument, DashboardId, StorageKind};
use livedash_telemetry::Metrics;
use livedash_transport::{DynKvBuckets, DynKvStore, KvEntry, TransportError, TransportResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const SLUG_ATTEMPTS: usize = 3;

/// Addresses a dashboard in either storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DashboardRef {
    Local(DashboardId),
    /// Full shared key.
    Shared(String),
}

/// Snapshot of the active dashboard's persistence state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub dashboard_id: DashboardId,
    pub storage: StorageKind,
    pub dirty: bool,
    /// Shared only; cleared only by `reload` or `overwrite`.
    pub conflicted: bool,
    pub revision: Option<u64>,
    pub shared_key: Option<String>,
    /// Whether the conflict watch is running (shared only).
    pub watching: bool,
    pub last_error: Option<String>,
}

/// One shared dashboard found in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SharedEntry {
    pub key: String,
    /// Dot-delimited folder path; empty for the root.
    pub folder: String,
    pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Activated {
        id: DashboardId,
        storage: StorageKind,
    },
    Saved {
        id: DashboardId,
        revision: Option<u64>,
    },
    SaveFailed {
        id: DashboardId,
        error: String,
    },
    ConflictDetected {
        id: DashboardId,
        revision: u64,
    },
    WatchPaused {
        id: DashboardId,
    },
    Deactivated,
}

#[derive(Debug)]
struct ActiveState {
    generation: u64,
    doc: DashboardDocument,
    dirty: bool,
    conflicted: bool,
    /// Highest foreign revision seen.
    observed_revision: Option<u64>,
    /// Bumped on every edit; a save only cleans the edits it wrote.
    edit_seq: u64,
    write_in_flight: bool,
    /// Revisions seen by the watch while our write was in flight.
    deferred_revision: Option<u64>,
    watching: bool,
    last_error: Option<String>,
}

impl ActiveState {
    fn new(generation: u64, doc: DashboardDocument) -> Self {
        Self {
            generation,
            doc,
            dirty: false,
            conflicted: false,
            observed_revision: None,
            edit_seq: 0,
            write_in_flight: false,
            deferred_revision: None,
            watching: false,
            last_error: None,
        }
    }

    fn held_revision(&self) -> u64 {
        self.doc.revision.unwrap_or(0)
    }

    fn flag_conflict(&mut self, revision: u64) -> bool {
        self.observed_revision = Some(self.observed_revision.map_or(revision, |r| r.max(revision)));
        let newly = !self.conflicted;
        self.conflicted = true;
        newly
    }

    fn status(&self) -> SyncStatus {
        SyncStatus {
            dashboard_id: self.doc.id.clone(),
            storage: self.doc.storage,
            dirty: self.dirty,
            conflicted: self.conflicted,
            revision: self.doc.revision,
            shared_key: self.doc.shared_key.clone(),
            watching: self.watching,
            last_error: self.last_error.clone(),
        }
    }
}

type SharedActive = Arc<Mutex<Option<ActiveState>>>;

struct WatchTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Which precondition a shared write carries.
#[derive(Debug, Clone, Copy)]
enum WriteMode {
    /// Last known revision.
    Save,
    /// Store's current revision, read just before writing.
    Overwrite,
}

pub struct SyncEngine {
    config: SyncConfig,
    local: LocalRepository,
    kv: Option<DynKvBuckets>,
    active: SharedActive,
    generation: AtomicU64,
    watch: Mutex<Option<WatchTask>>,
    /// Serializes shared writes so each one carries the revision of the last.
    write_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncEngine {
    pub fn new(config: SyncConfig, storage: Arc<dyn LocalStorage>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            local: LocalRepository::new(storage),
            kv: None,
            active: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
            watch: Mutex::new(None),
            write_lock: tokio::sync::Mutex::new(()),
            events,
        }
    }

    /// Engine backed by files in `config.storage_dir`.
    pub fn from_config(config: SyncConfig) -> SyncResult<Self> {
        let storage = FileStorage::open(&config.storage_dir, config.local_quota_bytes)?;
        Ok(Self::new(config, Arc::new(storage)))
    }

    /// Enable shared dashboards.
    pub fn with_shared(mut self, kv: DynKvBuckets) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> Option<SyncStatus> {
        self.active.lock().as_ref().map(ActiveState::status)
    }

    pub fn active_document(&self) -> Option<DashboardDocument> {
        self.active.lock().as_ref().map(|s| s.doc.clone())
    }

    // ---- creation and opening ----

    pub fn create_local(&self, name: &str) -> SyncResult<DashboardDocument> {
        self.ensure_capacity()?;
        let doc = DashboardDocument::new(name, StorageKind::Local);
        self.local.save(&doc)?;
        Metrics::dashboard_saved("local", "ok");
        info!(dashboard_id = %doc.id, name, "Created local dashboard");
        self.activate(doc.clone());
        Ok(doc)
    }

    /// Create a shared dashboard under `folder` (existing or new).
    pub async fn create_shared(&self, name: &str, folder: &str) -> SyncResult<DashboardDocument> {
        let doc = DashboardDocument::new(name, StorageKind::Shared);
        self.insert_shared(doc, folder).await
    }

    /// Copy the active dashboard into either storage. The copy becomes active.
    pub async fn duplicate(
        &self,
        target: StorageKind,
        folder: &str,
        name: Option<&str>,
    ) -> SyncResult<DashboardDocument> {
        let source = self.active_document().ok_or(SyncError::NoActiveDashboard)?;
        let now = Utc::now();
        let mut copy = source.clone();
        copy.id = DashboardId::generate();
        copy.name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} (copy)", source.name));
        copy.storage = target;
        copy.created_at = now;
        copy.updated_at = now;
        copy.shared_key = None;
        copy.revision = None;

        match target {
            StorageKind::Local => {
                self.ensure_capacity()?;
                self.local.save(&copy)?;
                Metrics::dashboard_saved("local", "ok");
                info!(from = %source.id, dashboard_id = %copy.id, "Duplicated dashboard locally");
                self.activate(copy.clone());
                Ok(copy)
            }
            StorageKind::Shared => self.insert_shared(copy, folder).await,
        }
    }

    pub fn open_local(&self, id: &DashboardId) -> SyncResult<DashboardDocument> {
        let doc = self.local.load(id)?;
        debug!(dashboard_id = %id, "Opened local dashboard");
        self.activate(doc.clone());
        Ok(doc)
    }

    pub async fn open_shared(&self, key: &str) -> SyncResult<DashboardDocument> {
        validate_kv_key(key)?;
        let bucket = self.bucket().await?;
        let entry = bucket
            .get(key)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("shared dashboard '{key}'")))?;
        let doc = decode_shared(&entry)?;
        info!(key, revision = entry.revision, "Opened shared dashboard");
        let generation = self.activate(doc.clone());
        self.start_watch_or_pause(generation, key).await;
        Ok(doc)
    }

    /// Drop the active dashboard and stop its watch.
    pub fn close(&self) {
        self.stop_watch();
        if self.active.lock().take().is_some() {
            let _ = self.events.send(SyncEvent::Deactivated);
        }
    }

    // ---- editing and saving ----

    /// Mutate the active document.
    ///
    /// A locked document accepts only unlocking. Identity and replication
    /// fields cannot be changed. Local documents are persisted before this
    /// returns; a persistence failure is returned but the edit is kept.
    pub fn edit<R>(&self, f: impl FnOnce(&mut DashboardDocument) -> R) -> SyncResult<R> {
        let (result, to_persist) = {
            let mut guard = self.active.lock();
            let state = guard.as_mut().ok_or(SyncError::NoActiveDashboard)?;

            let mut draft = state.doc.clone();
            let result = f(&mut draft);
            draft.id = state.doc.id.clone();
            draft.storage = state.doc.storage;
            draft.shared_key = state.doc.shared_key.clone();
            draft.revision = state.doc.revision;
            draft.created_at = state.doc.created_at;

            if state.doc.locked {
                let mut probe = draft.clone();
                probe.locked = true;
                probe.updated_at = state.doc.updated_at;
                if probe != state.doc {
                    return Err(SyncError::Locked);
                }
            }
            if draft == state.doc {
                return Ok(result);
            }

            draft.touch();
            state.doc = draft;
            state.dirty = true;
            state.edit_seq += 1;

            let to_persist = (state.doc.storage == StorageKind::Local)
                .then(|| (state.generation, state.edit_seq, state.doc.clone()));
            (result, to_persist)
        };

        if let Some((generation, seq, doc)) = to_persist {
            self.persist_local(generation, seq, &doc)?;
        }
        Ok(result)
    }

    /// Persist the active document.
    ///
    /// Returns the new revision for shared documents.
    pub async fn save(&self) -> SyncResult<Option<u64>> {
        let (generation, seq, doc) = {
            let guard = self.active.lock();
            let state = guard.as_ref().ok_or(SyncError::NoActiveDashboard)?;
            (state.generation, state.edit_seq, state.doc.clone())
        };
        match doc.storage {
            StorageKind::Local => {
                let mut doc = doc;
                doc.touch();
                self.persist_local(generation, seq, &doc)?;
                Ok(None)
            }
            StorageKind::Shared => self.write_shared(WriteMode::Save).await.map(Some),
        }
    }

    /// Replace the store's version with ours after user confirmation.
    /// Clears the conflicted flag on success.
    pub async fn overwrite(&self) -> SyncResult<u64> {
        self.write_shared(WriteMode::Overwrite).await
    }

    /// Discard local state and adopt the store's version.
    /// Clears the conflicted flag.
    pub async fn reload(&self) -> SyncResult<DashboardDocument> {
        let key = self.active_shared_key()?;
        let bucket = self.bucket().await?;
        let entry = bucket
            .get(&key)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("shared dashboard '{key}'")))?;
        let doc = decode_shared(&entry)?;
        info!(key = %key, revision = entry.revision, "Reloaded shared dashboard");
        let generation = self.activate(doc.clone());
        self.start_watch_or_pause(generation, &key).await;
        Ok(doc)
    }

    /// Restart a paused conflict watch after reconnecting.
    ///
    /// Any foreign write made while paused is flagged as a conflict.
    pub async fn resume_watch(&self) -> SyncResult<()> {
        let key = self.active_shared_key()?;
        let bucket = self.bucket().await?;
        let current = bucket.get(&key).await?;

        let generation = {
            let mut guard = self.active.lock();
            let state = guard.as_mut().ok_or(SyncError::NoActiveDashboard)?;
            let held = state.held_revision();
            let foreign = match &current {
                Some(entry) if entry.revision > held => Some(entry.revision),
                Some(_) => None,
                // Deleted by another writer.
                None => Some(held + 1),
            };
            if let Some(revision) = foreign {
                if state.flag_conflict(revision) {
                    warn!(key = %key, held, revision, "Foreign write while watch was paused");
                    Metrics::conflict_detected("watch");
                    let _ = self.events.send(SyncEvent::ConflictDetected {
                        id: state.doc.id.clone(),
                        revision,
                    });
                }
            }
            state.generation
        };
        self.start_watch(generation, &key).await
    }

    // ---- deletion and listing ----

    pub async fn delete(&self, target: &DashboardRef) -> SyncResult<()> {
        let is_active = {
            let guard = self.active.lock();
            guard.as_ref().is_some_and(|s| match target {
                DashboardRef::Local(id) => s.doc.storage == StorageKind::Local && &s.doc.id == id,
                DashboardRef::Shared(key) => s.doc.shared_key.as_deref() == Some(key.as_str()),
            })
        };
        if is_active {
            self.close();
        }

        match target {
            DashboardRef::Local(id) => {
                if !self.local.remove(id)? {
                    return Err(SyncError::NotFound(format!("local dashboard '{id}'")));
                }
                info!(dashboard_id = %id, "Deleted local dashboard");
            }
            DashboardRef::Shared(key) => {
                validate_kv_key(key)?;
                let bucket = self.bucket().await?;
                if bucket.get(key).await?.is_none() {
                    return Err(SyncError::NotFound(format!("shared dashboard '{key}'")));
                }
                bucket.delete(key).await?;
                info!(key = %key, "Deleted shared dashboard");
            }
        }
        Ok(())
    }

    pub fn list_local(&self) -> SyncResult<Vec<DashboardSummary>> {
        self.local.list()
    }

    /// Shared dashboards under the configured prefix, sorted by key.
    pub async fn list_shared(&self) -> SyncResult<Vec<SharedEntry>> {
        let bucket = self.bucket().await?;
        let keys: Vec<String> = bucket.keys().await?.collect().await;
        let prefix = self.config.key_prefix.as_str();
        let mut entries: Vec<SharedEntry> = keys
            .iter()
            .filter_map(|key| {
                split_key(prefix, key).map(|(folder, slug)| SharedEntry {
                    key: key.clone(),
                    folder: folder.to_string(),
                    slug: slug.to_string(),
                })
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    /// Existing folders, including every ancestor of a nested folder.
    pub async fn shared_folders(&self) -> SyncResult<BTreeSet<String>> {
        let mut folders = BTreeSet::new();
        for entry in self.list_shared().await? {
            let mut path = String::new();
            for segment in entry.folder.split('.').filter(|s| !s.is_empty()) {
                if !path.is_empty() {
                    path.push('.');
                }
                path.push_str(segment);
                folders.insert(path.clone());
            }
        }
        Ok(folders)
    }

    // ---- import / export ----

    pub fn import(&self, json: &str, mode: ImportMode) -> SyncResult<ImportReport> {
        let entries = parse_entries(json)?;
        let mut report = ImportReport::default();

        if mode == ImportMode::Replace {
            let active_is_local = self
                .active
                .lock()
                .as_ref()
                .is_some_and(|s| s.doc.storage == StorageKind::Local);
            if active_is_local {
                self.close();
            }
            let cleared = self.local.clear()?;
            debug!(cleared, "Cleared local dashboards for import");
        }

        let mut ids: BTreeSet<DashboardId> = self.local.index()?.into_iter().collect();
        let max = self.config.max_dashboards;

        for (index, entry) in entries.into_iter().enumerate() {
            let mut doc = match parse_document(entry) {
                Ok(doc) => doc,
                Err(e) => {
                    report.record_error(index, e);
                    continue;
                }
            };
            if ids.len() >= max {
                report.skipped += 1;
                continue;
            }
            if mode == ImportMode::Merge || ids.contains(&doc.id) {
                doc.id = DashboardId::generate();
            }
            doc.storage = StorageKind::Local;
            doc.shared_key = None;
            doc.revision = None;

            match self.local.save(&doc) {
                Ok(()) => {
                    ids.insert(doc.id.clone());
                    report.imported += 1;
                }
                Err(e) => report.record_error(index, e),
            }
        }

        info!(
            ?mode,
            imported = report.imported,
            skipped = report.skipped,
            errors = report.errors,
            "Imported dashboards"
        );
        Ok(report)
    }

    /// All local dashboards as an import-compatible bundle.
    pub fn export_local(&self) -> SyncResult<String> {
        export_bundle(&self.local.load_all()?)
    }

    // ---- internals ----

    fn ensure_capacity(&self) -> SyncResult<()> {
        if self.local.count()? >= self.config.max_dashboards {
            return Err(SyncError::LimitReached(self.config.max_dashboards));
        }
        Ok(())
    }

    async fn bucket(&self) -> SyncResult<DynKvStore> {
        let kv = self
            .kv
            .as_ref()
            .ok_or_else(|| SyncError::NotFound("shared store not configured".to_string()))?;
        Ok(kv.bucket(&self.config.shared_bucket).await?)
    }

    fn active_shared_key(&self) -> SyncResult<String> {
        let guard = self.active.lock();
        let state = guard.as_ref().ok_or(SyncError::NoActiveDashboard)?;
        state.doc.shared_key.clone().ok_or(SyncError::NotShared)
    }

    /// Make `doc` the active dashboard. Returns its generation.
    fn activate(&self, doc: DashboardDocument) -> u64 {
        self.stop_watch();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let event = SyncEvent::Activated {
            id: doc.id.clone(),
            storage: doc.storage,
        };
        *self.active.lock() = Some(ActiveState::new(generation, doc));
        let _ = self.events.send(event);
        generation
    }

    async fn insert_shared(
        &self,
        mut doc: DashboardDocument,
        folder: &str,
    ) -> SyncResult<DashboardDocument> {
        let bucket = self.bucket().await?;
        doc.storage = StorageKind::Shared;
        let body = Bytes::from(doc.to_json()?);

        for attempt in 1..=SLUG_ATTEMPTS {
            let key = shared_key(&self.config.key_prefix, folder, &generate_slug(&doc.name))?;
            match bucket.put(&key, body.clone(), Some(0)).await {
                Ok(revision) => {
                    doc.shared_key = Some(key.clone());
                    doc.revision = Some(revision);
                    Metrics::dashboard_saved("shared", "ok");
                    info!(key = %key, revision, "Created shared dashboard");
                    let generation = self.activate(doc.clone());
                    self.start_watch_or_pause(generation, &key).await;
                    return Ok(doc);
                }
                Err(TransportError::RevisionMismatch { .. }) => {
                    debug!(key = %key, attempt, "Slug collision, retrying");
                }
                Err(e) => {
                    Metrics::dashboard_saved("shared", "error");
                    return Err(e.into());
                }
            }
        }
        Err(SyncError::InvalidKey(format!(
            "no free slug for '{}' after {SLUG_ATTEMPTS} attempts",
            doc.name
        )))
    }

    fn persist_local(&self, generation: u64, seq: u64, doc: &DashboardDocument) -> SyncResult<()> {
        let result = self.local.save(doc);
        let mut guard = self.active.lock();
        let state = guard.as_mut().filter(|s| s.generation == generation);
        match result {
            Ok(()) => {
                Metrics::dashboard_saved("local", "ok");
                if let Some(state) = state {
                    if state.edit_seq == seq {
                        state.dirty = false;
                    }
                    state.doc.updated_at = state.doc.updated_at.max(doc.updated_at);
                    state.last_error = None;
                }
                let _ = self.events.send(SyncEvent::Saved {
                    id: doc.id.clone(),
                    revision: None,
                });
                Ok(())
            }
            Err(e) => {
                Metrics::dashboard_saved("local", "error");
                warn!(dashboard_id = %doc.id, error = %e, "Local save failed, keeping edit in memory");
                if let Some(state) = state {
                    state.last_error = Some(e.to_string());
                }
                let _ = self.events.send(SyncEvent::SaveFailed {
                    id: doc.id.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn write_shared(&self, mode: WriteMode) -> SyncResult<u64> {
        let _writing = self.write_lock.lock().await;
        let key = self.active_shared_key()?;
        let bucket = self.bucket().await?;

        let expected = match mode {
            WriteMode::Save => None,
            WriteMode::Overwrite => Some(bucket.get(&key).await?.map_or(0, |e| e.revision)),
        };

        let (generation, seq, expected, body) = {
            let mut guard = self.active.lock();
            let state = guard.as_mut().ok_or(SyncError::NoActiveDashboard)?;
            if state.doc.shared_key.as_deref() != Some(key.as_str()) {
                return Err(SyncError::NotShared);
            }
            let held = state.held_revision();
            if matches!(mode, WriteMode::Save) && state.conflicted {
                Metrics::dashboard_saved("shared", "conflict");
                return Err(SyncError::Conflict {
                    expected: held,
                    current: state.observed_revision.unwrap_or(held),
                });
            }
            let body = Bytes::from(state.doc.to_json()?);
            state.write_in_flight = true;
            state.deferred_revision = None;
            (state.generation, state.edit_seq, expected.unwrap_or(held), body)
        };

        let result = bucket.put(&key, body, Some(expected)).await;
        let (outcome, restart_watch) = self.finish_shared_write(generation, seq, expected, mode, result);
        match &outcome {
            Ok(revision) => info!(key = %key, expected, revision, ?mode, "Saved shared dashboard"),
            Err(SyncError::Conflict { expected, current }) => {
                warn!(key = %key, expected, current, "Shared save rejected by newer revision")
            }
            Err(e) => warn!(key = %key, error = %e, "Shared save failed"),
        }
        if restart_watch {
            self.start_watch_or_pause(generation, &key).await;
        }
        outcome
    }

    /// Apply a shared write's result to the active state.
    /// Returns the outcome and whether the paused watch should restart.
    fn finish_shared_write(
        &self,
        generation: u64,
        seq: u64,
        expected: u64,
        mode: WriteMode,
        result: TransportResult<u64>,
    ) -> (SyncResult<u64>, bool) {
        let mut guard = self.active.lock();
        let Some(state) = guard.as_mut().filter(|s| s.generation == generation) else {
            // Active dashboard changed while writing.
            return (result.map_err(SyncError::from), false);
        };
        state.write_in_flight = false;
        let deferred = state.deferred_revision.take();
        let id = state.doc.id.clone();

        match result {
            Ok(revision) => {
                state.doc.revision = Some(revision);
                if state.edit_seq == seq {
                    state.dirty = false;
                }
                state.last_error = None;
                if matches!(mode, WriteMode::Overwrite) {
                    state.conflicted = false;
                    state.observed_revision = None;
                }
                if let Some(foreign) = deferred.filter(|&r| r > revision) {
                    if state.flag_conflict(foreign) {
                        Metrics::conflict_detected("watch");
                        let _ = self.events.send(SyncEvent::ConflictDetected {
                            id: id.clone(),
                            revision: foreign,
                        });
                    }
                }
                Metrics::dashboard_saved("shared", "ok");
                let _ = self.events.send(SyncEvent::Saved {
                    id,
                    revision: Some(revision),
                });
                (Ok(revision), !state.watching)
            }
            Err(TransportError::RevisionMismatch { expected, current }) => {
                state.last_error = Some(format!("conflict at revision {current}"));
                Metrics::dashboard_saved("shared", "conflict");
                Metrics::conflict_detected("cas");
                if state.flag_conflict(current) {
                    let _ = self.events.send(SyncEvent::ConflictDetected {
                        id,
                        revision: current,
                    });
                }
                (Err(SyncError::Conflict { expected, current }), false)
            }
            Err(e) => {
                state.last_error = Some(e.to_string());
                if let Some(foreign) = deferred.filter(|&r| r > expected) {
                    state.flag_conflict(foreign);
                }
                Metrics::dashboard_saved("shared", "error");
                (Err(e.into()), false)
            }
        }
    }

    async fn start_watch(&self, generation: u64, key: &str) -> SyncResult<()> {
        self.stop_watch();
        let bucket = self.bucket().await?;
        let watch = bucket.watch(key).await?;

        let cancel = CancellationToken::new();
        {
            let mut guard = self.active.lock();
            match guard.as_mut().filter(|s| s.generation == generation) {
                Some(state) => state.watching = true,
                None => return Ok(()),
            }
        }
        let handle = tokio::spawn(run_conflict_watch(
            self.active.clone(),
            generation,
            watch.receiver,
            cancel.clone(),
            self.events.clone(),
        ));
        *self.watch.lock() = Some(WatchTask { cancel, handle });
        debug!(key, generation, "Conflict watch started");
        Ok(())
    }

    /// Start the watch; on failure leave it paused for `resume_watch`.
    async fn start_watch_or_pause(&self, generation: u64, key: &str) {
        let Err(e) = self.start_watch(generation, key).await else {
            return;
        };
        let guard = self.active.lock();
        if let Some(state) = guard.as_ref().filter(|s| s.generation == generation) {
            warn!(key, error = %e, "Conflict watch not started, paused until resumed");
            let _ = self.events.send(SyncEvent::WatchPaused {
                id: state.doc.id.clone(),
            });
        }
    }

    fn stop_watch(&self) {
        if let Some(task) = self.watch.lock().take() {
            task.cancel.cancel();
            task.handle.abort();
        }
        if let Some(state) = self.active.lock().as_mut() {
            state.watching = false;
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(task) = self.watch.get_mut().take() {
            task.cancel.cancel();
        }
    }
}

fn decode_shared(entry: &KvEntry) -> SyncResult<DashboardDocument> {
    let mut doc: DashboardDocument = serde_json::from_slice(&entry.value)?;
    doc.storage = StorageKind::Shared;
    doc.shared_key = Some(entry.key.clone());
    doc.revision = Some(entry.revision);
    Ok(doc)
}

/// Flags revisions newer than the held one as conflicts.
async fn run_conflict_watch(
    active: SharedActive,
    generation: u64,
    mut receiver: mpsc::UnboundedReceiver<KvEntry>,
    cancel: CancellationToken,
    events: broadcast::Sender<SyncEvent>,
) {
    loop {
        let entry = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            entry = receiver.recv() => entry,
        };

        let mut guard = active.lock();
        let Some(state) = guard.as_mut().filter(|s| s.generation == generation) else {
            return;
        };

        let Some(entry) = entry else {
            state.watching = false;
            warn!(dashboard_id = %state.doc.id, "Conflict watch ended, paused until resumed");
            let _ = events.send(SyncEvent::WatchPaused {
                id: state.doc.id.clone(),
            });
            return;
        };

        let held = state.held_revision();
        if entry.revision <= held {
            trace!(revision = entry.revision, held, "Watch caught up");
            continue;
        }
        if state.write_in_flight {
            state.deferred_revision = Some(
                state
                    .deferred_revision
                    .map_or(entry.revision, |r| r.max(entry.revision)),
            );
            continue;
        }
        if state.flag_conflict(entry.revision) {
            warn!(
                dashboard_id = %state.doc.id,
                held,
                revision = entry.revision,
                op = ?entry.operation,
                "Shared dashboard changed by another writer"
            );
            Metrics::conflict_detected("watch");
            let _ = events.send(SyncEvent::ConflictDetected {
                id: state.doc.id.clone(),
                revision: entry.revision,
            });
        }
    }
}
