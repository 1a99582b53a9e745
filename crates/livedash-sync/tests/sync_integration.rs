//! Integration tests for the sync engine.
//!
//! Shared dashboards run against the in-memory KV bucket; local dashboards
//! run against file storage in a temp dir or the in-memory storage.

use bytes::Bytes;
use livedash_core::{DashboardDocument, DataSource, StorageKind, WidgetConfig};
use livedash_sync::{
    DashboardRef, FileStorage, ImportMode, MemoryStorage, SyncConfig, SyncEngine, SyncError,
    SyncEvent,
};
use futures_util::stream::BoxStream;
use livedash_transport::{
    BoxFuture, KvBuckets, KvEntry, KvStore, KvWatch, MemoryBucket, MemoryTransport, TransportError,
    TransportResult,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const BUCKET: &str = "dashboards";

fn shared_engine() -> (Arc<MemoryTransport>, Arc<MemoryBucket>, SyncEngine) {
    let transport = Arc::new(MemoryTransport::new());
    let bucket = transport.create_bucket(BUCKET);
    let engine = SyncEngine::new(SyncConfig::default(), Arc::new(MemoryStorage::new()))
        .with_shared(transport.clone());
    (transport, bucket, engine)
}

/// Bucket that yields inside `put` and can refuse new watches.
struct FlakyBucket {
    inner: Arc<MemoryBucket>,
    refuse_watch: AtomicBool,
}

impl KvStore for FlakyBucket {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, TransportResult<Option<KvEntry>>> {
        self.inner.get(key)
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        expected_revision: Option<u64>,
    ) -> BoxFuture<'a, TransportResult<u64>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.inner.put(key, value, expected_revision).await
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, TransportResult<u64>> {
        self.inner.delete(key)
    }

    fn watch<'a>(&'a self, key_or_pattern: &'a str) -> BoxFuture<'a, TransportResult<KvWatch>> {
        if self.refuse_watch.load(Ordering::SeqCst) {
            return Box::pin(async { Err(TransportError::ConnectionLost) });
        }
        self.inner.watch(key_or_pattern)
    }

    fn keys(&self) -> BoxFuture<'_, TransportResult<BoxStream<'static, String>>> {
        self.inner.keys()
    }
}

struct FlakyBuckets(Arc<FlakyBucket>);

impl KvBuckets for FlakyBuckets {
    fn bucket<'a>(&'a self, _name: &'a str) -> BoxFuture<'a, TransportResult<Arc<dyn KvStore>>> {
        let bucket: Arc<dyn KvStore> = self.0.clone();
        Box::pin(async move { Ok(bucket) })
    }
}

fn flaky_engine() -> (Arc<FlakyBucket>, SyncEngine) {
    let transport = MemoryTransport::new();
    let flaky = Arc::new(FlakyBucket {
        inner: transport.create_bucket(BUCKET),
        refuse_watch: AtomicBool::new(false),
    });
    let engine = SyncEngine::new(SyncConfig::default(), Arc::new(MemoryStorage::new()))
        .with_shared(Arc::new(FlakyBuckets(flaky.clone())));
    (flaky, engine)
}

fn drain_paused(events: &mut tokio::sync::broadcast::Receiver<SyncEvent>) -> bool {
    let mut paused = false;
    while let Ok(event) = events.try_recv() {
        paused |= matches!(event, SyncEvent::WatchPaused { .. });
    }
    paused
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(25)).await;
}

fn add_widget(engine: &SyncEngine, subject: &str) {
    engine
        .edit(|doc| {
            doc.widgets
                .push(WidgetConfig::new("chart", Some(DataSource::subject(subject))))
        })
        .unwrap();
}

/// Write a new body for `key` the way a second client would.
fn foreign_write(bucket: &MemoryBucket, key: &str, name: &str) -> u64 {
    let current = bucket.get_now(key).unwrap().unwrap();
    let mut doc: DashboardDocument = serde_json::from_slice(&current.value).unwrap();
    doc.name = name.to_string();
    bucket
        .put_now(key, Bytes::from(doc.to_json().unwrap()), Some(current.revision))
        .unwrap()
}

#[tokio::test]
async fn test_local_dashboards_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = SyncConfig {
        storage_dir: dir.path().to_path_buf(),
        ..SyncConfig::default()
    };

    let id = {
        let engine = SyncEngine::from_config(config.clone()).unwrap();
        let doc = engine.create_local("Ops").unwrap();
        add_widget(&engine, "plant.1.power");
        engine.edit(|doc| doc.set_variable("plant", "1")).unwrap();
        assert!(!engine.status().unwrap().dirty);
        doc.id
    };

    let engine = SyncEngine::new(
        config.clone(),
        Arc::new(FileStorage::open(&config.storage_dir, None).unwrap()),
    );
    let listed = engine.list_local().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].widget_count, 1);

    let doc = engine.open_local(&id).unwrap();
    assert_eq!(doc.name, "Ops");
    assert_eq!(doc.bindings().get("plant").map(String::as_str), Some("1"));
    assert_eq!(doc.storage, StorageKind::Local);
}

#[tokio::test]
async fn test_local_write_failure_keeps_edit() {
    let storage = Arc::new(MemoryStorage::new());
    let engine = SyncEngine::new(SyncConfig::default(), storage.clone());
    let mut events = engine.subscribe_events();
    engine.create_local("Ops").unwrap();

    storage.set_read_only(true);
    let err = engine.edit(|doc| doc.name = "Renamed".to_string()).unwrap_err();
    assert!(matches!(err, SyncError::Security(_)));
    assert!(err.is_local_persistence());

    assert_eq!(engine.active_document().unwrap().name, "Renamed");
    let status = engine.status().unwrap();
    assert!(status.dirty);
    assert!(status.last_error.is_some());

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        saw_failure |= matches!(event, SyncEvent::SaveFailed { .. });
    }
    assert!(saw_failure);

    storage.set_read_only(false);
    engine.save().await.unwrap();
    assert!(!engine.status().unwrap().dirty);
}

#[tokio::test]
async fn test_local_quota_exceeded() {
    let engine = SyncEngine::new(
        SyncConfig::default(),
        Arc::new(MemoryStorage::with_quota(600)),
    );
    engine.create_local("Ops").unwrap();
    let err = engine
        .edit(|doc| doc.name = "x".repeat(1_000))
        .unwrap_err();
    assert!(matches!(err, SyncError::QuotaExceeded(_)));
    assert_eq!(engine.active_document().unwrap().name.len(), 1_000);
}

#[tokio::test]
async fn test_locked_dashboard_only_accepts_unlock() {
    let engine = SyncEngine::new(SyncConfig::default(), Arc::new(MemoryStorage::new()));
    engine.create_local("Ops").unwrap();
    engine.edit(|doc| doc.locked = true).unwrap();

    assert!(matches!(
        engine.edit(|doc| doc.name = "Nope".to_string()),
        Err(SyncError::Locked)
    ));
    assert_eq!(engine.active_document().unwrap().name, "Ops");

    engine.edit(|doc| doc.locked = false).unwrap();
    engine.edit(|doc| doc.name = "Yes".to_string()).unwrap();
    assert_eq!(engine.active_document().unwrap().name, "Yes");
}

#[tokio::test]
async fn test_local_limit() {
    let config = SyncConfig {
        max_dashboards: 2,
        ..SyncConfig::default()
    };
    let engine = SyncEngine::new(config, Arc::new(MemoryStorage::new()));
    engine.create_local("A").unwrap();
    engine.create_local("B").unwrap();
    assert!(matches!(
        engine.create_local("C"),
        Err(SyncError::LimitReached(2))
    ));
}

#[tokio::test]
async fn test_shared_create_and_save_without_self_conflict() {
    let (_transport, bucket, engine) = shared_engine();
    let doc = engine.create_shared("Ops Overview", "team/ops").await.unwrap();
    let key = doc.shared_key.clone().unwrap();
    assert!(key.starts_with("dash.team.ops.ops-overview-"));
    assert_eq!(doc.storage, StorageKind::Shared);

    for i in 0..3 {
        add_widget(&engine, &format!("plant.{i}.power"));
        let status = engine.status().unwrap();
        assert!(status.dirty);
        let revision = tokio_test::assert_ok!(engine.save().await).unwrap();
        assert_eq!(bucket.get_now(&key).unwrap().unwrap().revision, revision);
    }
    settle().await;

    let status = engine.status().unwrap();
    assert!(!status.dirty);
    assert!(!status.conflicted);
    assert!(status.watching);
    assert_eq!(bucket.watcher_count(), 1);
}

#[tokio::test]
async fn test_overlapping_saves_do_not_conflict_with_each_other() {
    let (bucket, engine) = flaky_engine();
    let doc = engine.create_shared("Ops", "").await.unwrap();
    let key = doc.shared_key.clone().unwrap();
    add_widget(&engine, "plant.1.power");

    let (first, second) = tokio::join!(engine.save(), engine.save());
    let first = tokio_test::assert_ok!(first).unwrap();
    let second = tokio_test::assert_ok!(second).unwrap();
    assert!(second > first);
    settle().await;

    let status = engine.status().unwrap();
    assert!(!status.conflicted);
    assert!(!status.dirty);
    assert_eq!(status.revision, Some(second));
    assert_eq!(bucket.inner.get_now(&key).unwrap().unwrap().revision, second);
}

#[tokio::test]
async fn test_watch_start_failure_pauses_instead_of_failing() {
    let (bucket, engine) = flaky_engine();
    let mut events = engine.subscribe_events();
    let doc = engine.create_shared("Ops", "").await.unwrap();
    let key = doc.shared_key.clone().unwrap();
    assert!(engine.status().unwrap().watching);

    bucket.refuse_watch.store(true, Ordering::SeqCst);
    let opened = tokio_test::assert_ok!(engine.open_shared(&key).await);
    assert_eq!(opened.name, "Ops");
    assert!(!engine.status().unwrap().watching);
    assert!(drain_paused(&mut events));

    // The write lands even though the watch cannot restart.
    add_widget(&engine, "plant.1.power");
    let revision = tokio_test::assert_ok!(engine.save().await).unwrap();
    assert!(revision > doc.revision.unwrap());
    let status = engine.status().unwrap();
    assert!(!status.dirty);
    assert!(!status.watching);
    assert_eq!(status.revision, Some(revision));

    tokio_test::assert_ok!(engine.reload().await);
    assert!(!engine.status().unwrap().watching);
    assert!(engine.resume_watch().await.is_err());

    bucket.refuse_watch.store(false, Ordering::SeqCst);
    engine.resume_watch().await.unwrap();
    let status = engine.status().unwrap();
    assert!(status.watching);
    assert!(!status.conflicted);
}

#[tokio::test]
async fn test_stale_save_is_rejected_with_revisions() {
    let (_transport, bucket, engine) = shared_engine();
    let doc = engine.create_shared("Ops", "").await.unwrap();
    let key = doc.shared_key.clone().unwrap();
    let held = doc.revision.unwrap();

    // Unrelated keys share the bucket's revision counter.
    bucket.put_now("other.a", Bytes::from_static(b"{}"), None).unwrap();
    let current = foreign_write(&bucket, &key, "Theirs");
    assert!(current > held + 1);

    add_widget(&engine, "plant.1.power");
    let err = engine.save().await.unwrap_err();
    match err {
        SyncError::Conflict { expected, current: seen } => {
            assert_eq!(expected, held);
            assert_eq!(seen, current);
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    let status = engine.status().unwrap();
    assert!(status.conflicted);
    assert!(status.dirty);
    // The store keeps the other writer's version.
    let stored: DashboardDocument =
        serde_json::from_slice(&bucket.get_now(&key).unwrap().unwrap().value).unwrap();
    assert_eq!(stored.name, "Theirs");

    // Still conflicted: further saves are refused until resolved.
    assert!(matches!(
        engine.save().await,
        Err(SyncError::Conflict { .. })
    ));
}

#[tokio::test]
async fn test_watch_flags_foreign_write() {
    let (_transport, bucket, engine) = shared_engine();
    let mut events = engine.subscribe_events();
    let doc = engine.create_shared("Ops", "").await.unwrap();
    let key = doc.shared_key.clone().unwrap();

    let revision = foreign_write(&bucket, &key, "Theirs");
    settle().await;

    let status = engine.status().unwrap();
    assert!(status.conflicted);
    // Our copy is untouched.
    assert_eq!(engine.active_document().unwrap().name, "Ops");

    let mut detected = None;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::ConflictDetected { revision, .. } = event {
            detected = Some(revision);
        }
    }
    assert_eq!(detected, Some(revision));
}

#[tokio::test]
async fn test_reload_adopts_store_version() {
    let (_transport, bucket, engine) = shared_engine();
    let doc = engine.create_shared("Ops", "").await.unwrap();
    let key = doc.shared_key.clone().unwrap();
    add_widget(&engine, "plant.1.power");

    let revision = foreign_write(&bucket, &key, "Theirs");
    settle().await;
    assert!(engine.status().unwrap().conflicted);

    let reloaded = engine.reload().await.unwrap();
    assert_eq!(reloaded.name, "Theirs");
    assert!(reloaded.widgets.is_empty());
    let status = engine.status().unwrap();
    assert!(!status.conflicted);
    assert!(!status.dirty);
    assert_eq!(status.revision, Some(revision));

    add_widget(&engine, "plant.2.power");
    engine.save().await.unwrap();
}

#[tokio::test]
async fn test_overwrite_replaces_store_version() {
    let (_transport, bucket, engine) = shared_engine();
    let doc = engine.create_shared("Ops", "").await.unwrap();
    let key = doc.shared_key.clone().unwrap();
    add_widget(&engine, "plant.1.power");

    let theirs = foreign_write(&bucket, &key, "Theirs");
    assert!(engine.save().await.is_err());

    let revision = engine.overwrite().await.unwrap();
    assert!(revision > theirs);
    settle().await;

    let stored: DashboardDocument =
        serde_json::from_slice(&bucket.get_now(&key).unwrap().unwrap().value).unwrap();
    assert_eq!(stored.name, "Ops");
    assert_eq!(stored.widgets.len(), 1);
    let status = engine.status().unwrap();
    assert!(!status.conflicted);
    assert!(!status.dirty);
}

#[tokio::test]
async fn test_watch_pauses_on_disconnect_and_resumes() {
    let (transport, _bucket, engine) = shared_engine();
    let mut events = engine.subscribe_events();
    engine.create_shared("Ops", "").await.unwrap();

    transport.set_connected(false);
    settle().await;
    assert!(!engine.status().unwrap().watching);
    assert!(drain_paused(&mut events));

    add_widget(&engine, "plant.1.power");
    assert!(matches!(
        engine.save().await,
        Err(SyncError::ConnectionLost)
    ));
    assert!(engine.status().unwrap().dirty);

    transport.set_connected(true);
    engine.resume_watch().await.unwrap();
    let status = engine.status().unwrap();
    assert!(status.watching);
    assert!(!status.conflicted);
    engine.save().await.unwrap();
}

#[tokio::test]
async fn test_open_and_list_shared() {
    let (_transport, _bucket, engine) = shared_engine();
    let a = engine.create_shared("Alpha", "ops").await.unwrap();
    let b = engine.create_shared("Beta", "ops/plant").await.unwrap();
    engine.create_shared("Gamma", "").await.unwrap();

    let entries = engine.list_shared().await.unwrap();
    assert_eq!(entries.len(), 3);
    let folders: Vec<String> = engine.shared_folders().await.unwrap().into_iter().collect();
    assert_eq!(folders, vec!["ops".to_string(), "ops.plant".to_string()]);

    let key = a.shared_key.clone().unwrap();
    let opened = engine.open_shared(&key).await.unwrap();
    assert_eq!(opened.name, "Alpha");
    assert_eq!(opened.revision, a.revision);

    let b_key = b.shared_key.unwrap();
    engine
        .delete(&DashboardRef::Shared(b_key.clone()))
        .await
        .unwrap();
    assert!(matches!(
        engine.open_shared(&b_key).await,
        Err(SyncError::NotFound(_))
    ));
    assert_eq!(engine.list_shared().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_duplicate_shared_to_local() {
    let (_transport, _bucket, engine) = shared_engine();
    let shared = engine.create_shared("Ops", "").await.unwrap();
    add_widget(&engine, "plant.1.power");

    let copy = engine
        .duplicate(StorageKind::Local, "", None)
        .await
        .unwrap();
    assert_ne!(copy.id, shared.id);
    assert_eq!(copy.name, "Ops (copy)");
    assert_eq!(copy.widgets.len(), 1);
    assert_eq!(copy.shared_key, None);
    assert_eq!(engine.list_local().unwrap().len(), 1);
    assert_eq!(engine.status().unwrap().storage, StorageKind::Local);
}

#[tokio::test]
async fn test_import_merge_respects_limit_and_counts_errors() {
    let config = SyncConfig {
        max_dashboards: 3,
        ..SyncConfig::default()
    };
    let engine = SyncEngine::new(config, Arc::new(MemoryStorage::new()));
    let existing = engine.create_local("Existing").unwrap();

    let mut entries: Vec<String> = (0..4)
        .map(|i| DashboardDocument::new(format!("Imported {i}"), StorageKind::Shared))
        .map(|doc| doc.to_json().unwrap())
        .collect();
    // Same id as the existing dashboard; merge gives it a fresh one.
    entries[0] = existing.to_json().unwrap();
    entries.insert(2, r#"{"name": "missing id"}"#.to_string());
    let payload = format!("[{}]", entries.join(","));

    let report = engine.import(&payload, ImportMode::Merge).unwrap();
    assert_eq!(report.imported, 2);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.errors, 1);
    assert_eq!(report.failures.len(), 1);

    let listed = engine.list_local().unwrap();
    assert_eq!(listed.len(), 3);
    assert_eq!(listed[0].id, existing.id);
    assert!(listed.iter().skip(1).all(|s| s.id != existing.id));
}

#[tokio::test]
async fn test_import_replace_and_export() {
    let engine = SyncEngine::new(SyncConfig::default(), Arc::new(MemoryStorage::new()));
    engine.create_local("Old").unwrap();
    let exported = {
        let source = SyncEngine::new(SyncConfig::default(), Arc::new(MemoryStorage::new()));
        source.create_local("New A").unwrap();
        source.create_local("New B").unwrap();
        source.export_local().unwrap()
    };

    let report = engine.import(&exported, ImportMode::Replace).unwrap();
    assert_eq!(report.imported, 2);
    assert!(engine.status().is_none());
    let names: Vec<String> = engine
        .list_local()
        .unwrap()
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(names, vec!["New A", "New B"]);

    assert!(engine.import("not json", ImportMode::Merge).is_err());
}
