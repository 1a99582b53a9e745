//! Dashboard client.
//!
//! Wires the multiplexer, the buffer store and the sync engine around the
//! active dashboard. Every document change is followed by a reconcile pass
//! that brings widget subscriptions and buffers in line with the document:
//! - new or re-sourced widgets get a fresh buffer and a subscription
//! - removed widgets lose both
//! - buffer-setting changes reconfigure in place, keeping history

use crate::config::{AppConfig, ClientConfig};
use crate::error::{AppError, AppResult};
use chrono::Utc;
use livedash_buffer::{BufferChanged, BufferStore, IngestQueue, TickScheduler};
use livedash_core::{
    BufferedMessage, DashboardDocument, DashboardId, DataSource, SubscriptionKey, VariableBindings,
    WidgetConfig, WidgetId,
};
use livedash_feed::{Multiplexer, MultiplexerEvent};
use livedash_sync::{LocalStorage, SyncEngine, SyncStatus};
use livedash_transport::{ConnectionStatus, DynKvBuckets, DynTransport};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// External collaborators of a client.
pub struct ClientDeps {
    pub transport: DynTransport,
    /// Enables KV-backed widgets and shared dashboards.
    pub kv: Option<DynKvBuckets>,
    pub storage: Arc<dyn LocalStorage>,
    pub scheduler: Arc<dyn TickScheduler>,
}

/// A widget's live registration.
#[derive(Debug, Clone, PartialEq)]
struct Binding {
    key: SubscriptionKey,
    extraction: Option<String>,
    max_count: usize,
    max_age: Option<Duration>,
}

pub struct DashboardClient {
    config: ClientConfig,
    transport: DynTransport,
    mux: Arc<Multiplexer>,
    ingest: Arc<IngestQueue>,
    store: BufferStore,
    sync: SyncEngine,
    /// Held across multiplexer calls so reconciles never interleave.
    bindings: tokio::sync::Mutex<HashMap<WidgetId, Binding>>,
    /// Last subscribe failure per widget.
    failures: Mutex<BTreeMap<WidgetId, String>>,
    cancel: CancellationToken,
}

impl DashboardClient {
    pub fn new(config: &AppConfig, deps: ClientDeps) -> AppResult<Self> {
        config.validate()?;

        let store = BufferStore::new(config.buffer.clone(), deps.scheduler.clone());
        let ingest = IngestQueue::new(store.clone(), deps.scheduler);

        let mut mux = Multiplexer::new(deps.transport.clone(), ingest.clone());
        let mut sync = SyncEngine::new(config.sync.clone(), deps.storage);
        if let Some(kv) = deps.kv {
            mux = mux.with_kv(kv.clone());
            sync = sync.with_shared(kv);
        }

        Ok(Self {
            config: config.client.clone(),
            transport: deps.transport,
            mux: Arc::new(mux),
            ingest,
            store,
            sync,
            bindings: tokio::sync::Mutex::new(HashMap::new()),
            failures: Mutex::new(BTreeMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn sync(&self) -> &SyncEngine {
        &self.sync
    }

    pub fn store(&self) -> &BufferStore {
        &self.store
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.mux
    }

    pub fn document(&self) -> Option<DashboardDocument> {
        self.sync.active_document()
    }

    pub fn status(&self) -> Option<SyncStatus> {
        self.sync.status()
    }

    pub fn latest(&self, widget: &WidgetId) -> Option<Arc<BufferedMessage>> {
        self.store.get_latest(widget)
    }

    pub fn history(&self, widget: &WidgetId) -> Vec<Arc<BufferedMessage>> {
        self.store.get_buffer(widget)
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<BufferChanged> {
        self.store.subscribe_changes()
    }

    /// Why a widget has no live data, if its subscription failed.
    pub fn widget_error(&self, widget: &WidgetId) -> Option<String> {
        self.failures.lock().get(widget).cloned()
    }

    /// Insert queued deliveries now instead of waiting for the tick.
    pub fn flush(&self) -> usize {
        self.ingest.flush_now()
    }

    // ---- dashboards ----

    pub async fn create_local(&self, name: &str) -> AppResult<DashboardDocument> {
        let doc = self.sync.create_local(name)?;
        self.reconcile().await;
        Ok(doc)
    }

    pub async fn create_shared(&self, name: &str, folder: &str) -> AppResult<DashboardDocument> {
        let doc = self.sync.create_shared(name, folder).await?;
        self.reconcile().await;
        Ok(doc)
    }

    pub async fn open_local(&self, id: &DashboardId) -> AppResult<DashboardDocument> {
        let doc = self.sync.open_local(id)?;
        self.reconcile().await;
        Ok(doc)
    }

    pub async fn open_shared(&self, key: &str) -> AppResult<DashboardDocument> {
        let doc = self.sync.open_shared(key).await?;
        self.reconcile().await;
        Ok(doc)
    }

    pub async fn close(&self) {
        self.sync.close();
        self.reconcile().await;
    }

    pub async fn save(&self) -> AppResult<Option<u64>> {
        Ok(self.sync.save().await?)
    }

    /// Adopt the store's version of the active shared dashboard.
    pub async fn reload(&self) -> AppResult<DashboardDocument> {
        let doc = self.sync.reload().await?;
        self.reconcile().await;
        Ok(doc)
    }

    pub async fn overwrite(&self) -> AppResult<u64> {
        Ok(self.sync.overwrite().await?)
    }

    // ---- widgets ----

    pub async fn add_widget(&self, widget: WidgetConfig) -> AppResult<WidgetId> {
        let id = widget.id.clone();
        self.edit(move |doc| doc.widgets.push(widget)).await?;
        Ok(id)
    }

    pub async fn update_widget(
        &self,
        id: &WidgetId,
        f: impl FnOnce(&mut WidgetConfig),
    ) -> AppResult<()> {
        let target = id.clone();
        let found = self
            .edit(move |doc| doc.widget_mut(&target).map(f).is_some())
            .await?;
        if found {
            Ok(())
        } else {
            Err(AppError::UnknownWidget(id.to_string()))
        }
    }

    pub async fn remove_widget(&self, id: &WidgetId) -> AppResult<()> {
        let target = id.clone();
        let removed = self
            .edit(move |doc| doc.remove_widget(&target).is_some())
            .await?;
        if removed {
            Ok(())
        } else {
            Err(AppError::UnknownWidget(id.to_string()))
        }
    }

    /// Change a variable; widgets whose resolved source changes are
    /// resubscribed. Returns whether the value changed.
    pub async fn set_variable(&self, name: &str, value: &str) -> AppResult<bool> {
        self.edit(|doc| doc.set_variable(name, value)).await
    }

    /// Apply an edit, then reconcile. A local persistence failure keeps the
    /// edit, so subscriptions follow it before the error is returned.
    async fn edit<R>(&self, f: impl FnOnce(&mut DashboardDocument) -> R) -> AppResult<R> {
        let result = self.sync.edit(f);
        match &result {
            Ok(_) => self.reconcile().await,
            Err(e) if e.is_local_persistence() => self.reconcile().await,
            Err(_) => {}
        }
        Ok(result?)
    }

    // ---- subscriptions ----

    async fn reconcile(&self) {
        let doc = self.sync.active_document();
        let (widgets, vars) = match &doc {
            Some(doc) => (doc.widgets.as_slice(), doc.bindings()),
            None => (&[][..], VariableBindings::new()),
        };

        let mut bindings = self.bindings.lock().await;

        let wanted: HashSet<&WidgetId> = widgets
            .iter()
            .filter(|w| w.source.is_some())
            .map(|w| &w.id)
            .collect();
        let stale: Vec<WidgetId> = bindings
            .keys()
            .filter(|id| !wanted.contains(id))
            .cloned()
            .collect();
        for id in stale {
            if let Some(binding) = bindings.remove(&id) {
                self.mux.unsubscribe_key(&id, &binding.key).await;
            }
            self.store.remove_buffer(&id);
            debug!(widget_id = %id, "Widget unbound");
        }
        self.failures.lock().retain(|id, _| wanted.contains(id));

        for widget in widgets {
            if let Some(source) = &widget.source {
                self.bind_widget(&mut bindings, widget, source, &vars).await;
            }
        }
    }

    async fn bind_widget(
        &self,
        bindings: &mut HashMap<WidgetId, Binding>,
        widget: &WidgetConfig,
        source: &DataSource,
        vars: &VariableBindings,
    ) {
        let id = &widget.id;
        let max_count = match widget.buffer.max_count {
            0 => self.config.default_max_count,
            n => n,
        };
        let max_age = widget.buffer.max_age_secs.map(Duration::from_secs);
        let extraction = widget
            .extraction
            .clone()
            .filter(|e| !e.trim().is_empty());
        let previous = bindings.get(id).cloned();

        let resolved = match source.resolve(vars) {
            Ok(key) => key,
            Err(e) => {
                if let Some(prev) = bindings.remove(id) {
                    self.mux.unsubscribe_key(id, &prev.key).await;
                }
                self.store.remove_buffer(id);
                self.record_failure(id, e.to_string());
                return;
            }
        };

        if let Some(prev) = &previous {
            if prev.key == resolved && prev.extraction == extraction {
                if prev.max_count != max_count || prev.max_age != max_age {
                    self.store.reconfigure(id, max_count, max_age);
                    bindings.insert(
                        id.clone(),
                        Binding {
                            max_count,
                            max_age,
                            ..prev.clone()
                        },
                    );
                }
                return;
            }
            // Source or extraction changed: history starts over.
            if prev.key != resolved {
                self.mux.unsubscribe_key(id, &prev.key).await;
            }
            self.store.remove_buffer(id);
        }

        self.store.initialize(id, max_count, max_age);
        match self
            .mux
            .subscribe(id, source, extraction.as_deref(), vars)
            .await
        {
            Ok(key) => {
                debug!(widget_id = %id, %key, "Widget bound");
                bindings.insert(
                    id.clone(),
                    Binding {
                        key,
                        extraction,
                        max_count,
                        max_age,
                    },
                );
                self.failures.lock().remove(id);
            }
            Err(e) => {
                if let Some(prev) = bindings.remove(id) {
                    if prev.key == resolved {
                        self.mux.unsubscribe_key(id, &prev.key).await;
                    }
                }
                self.store.remove_buffer(id);
                self.record_failure(id, e.to_string());
            }
        }
    }

    fn record_failure(&self, id: &WidgetId, reason: String) {
        warn!(widget_id = %id, error = %reason, "Widget has no live data");
        self.failures.lock().insert(id.clone(), reason);
    }

    /// Reopen subscriptions after the transport reconnects.
    ///
    /// Bound widgets keep their history; widgets whose subscription failed
    /// are retried from scratch. Returns the number of bound widgets.
    pub async fn resubscribe_all(&self) -> usize {
        let Some(doc) = self.sync.active_document() else {
            return 0;
        };
        let vars = doc.bindings();
        let mut bindings = self.bindings.lock().await;

        for widget in &doc.widgets {
            let Some(source) = &widget.source else {
                continue;
            };
            let Some(binding) = bindings.get(&widget.id).cloned() else {
                self.bind_widget(&mut bindings, widget, source, &vars).await;
                continue;
            };
            match self
                .mux
                .subscribe(&widget.id, source, binding.extraction.as_deref(), &vars)
                .await
            {
                Ok(_) => {
                    self.failures.lock().remove(&widget.id);
                }
                Err(e) => {
                    bindings.remove(&widget.id);
                    self.store.remove_buffer(&widget.id);
                    self.record_failure(&widget.id, e.to_string());
                }
            }
        }

        let bound = bindings.len();
        info!(bound, "Resubscribed widgets");
        bound
    }

    async fn handle_reconnect(&self) {
        self.resubscribe_all().await;
        let paused_shared = self
            .sync
            .status()
            .is_some_and(|s| s.shared_key.is_some() && !s.watching);
        if paused_shared {
            if let Err(e) = self.sync.resume_watch().await {
                warn!(error = %e, "Failed to resume conflict watch");
            }
        }
    }

    async fn apply_mux_event(&self, event: MultiplexerEvent) {
        match event {
            MultiplexerEvent::ReopenFailed { owners, error, .. } => {
                for id in &owners {
                    self.record_failure(id, error.clone());
                }
            }
            MultiplexerEvent::Opened { key } => {
                let owners = self.mux.owners(&key).await;
                let mut failures = self.failures.lock();
                for id in &owners {
                    failures.remove(id);
                }
            }
            _ => {}
        }
    }

    /// Follow transport status: invalidate on disconnect, resubscribe and
    /// resume the conflict watch on reconnect. Also tracks widgets left
    /// without data by a failed reopen.
    pub fn spawn_connection_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let mut status_rx = self.transport.connection_status();
        let mut mux_events = self.mux.subscribe_events();
        let cancel = self.cancel.clone();
        let this: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut lost = false;
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    changed = status_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    event = mux_events.recv() => {
                        match event {
                            Ok(event) => {
                                let Some(client) = this.upgrade() else {
                                    break;
                                };
                                client.apply_mux_event(event).await;
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "Multiplexer events lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                        continue;
                    }
                }
                let status = *status_rx.borrow_and_update();
                let Some(client) = this.upgrade() else {
                    break;
                };
                debug!(%status, "Transport status changed");
                match status {
                    ConnectionStatus::Disconnected => {
                        lost = true;
                        client.mux.invalidate_all().await;
                    }
                    ConnectionStatus::Connected if lost => {
                        lost = false;
                        client.handle_reconnect().await;
                    }
                    _ => {}
                }
            }
        })
    }

    /// Periodically evict entries older than their widget's max age.
    pub fn spawn_expiry(self: &Arc<Self>) -> JoinHandle<()> {
        let store = self.store.clone();
        let cancel = self.cancel.clone();
        let period = self.config.expiry_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let evicted = store.prune_expired(Utc::now().timestamp_millis());
                        if evicted > 0 {
                            debug!(evicted, "Expired buffer entries");
                        }
                    }
                }
            }
        })
    }

    /// Stop background tasks and close every subscription.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.mux.close_all().await;
        self.bindings.lock().await.clear();
        info!("Dashboard client stopped");
    }
}

impl Drop for DashboardClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
