//! Subscription multiplexer.
//!
//! Shares one transport subscription (or one KV watch) among every widget
//! that resolves to the same [`SubscriptionKey`]. Each live key owns a pump
//! task that decodes arriving payloads once and fans the per-owner extracted
//! values out to the [`MessageSink`].
//!
//! Lifecycle per key:
//! - first owner: open on the transport, spawn the pump
//! - further owners: join the owner set, no transport call
//! - last owner leaves: cancel the pump, close the transport subscription
//! - connection loss: every key is dropped, owners must resubscribe

use crate::decode::{decode_and_fan_out, fan_out, DecodeStats, OwnerMap};
use crate::error::{FeedError, FeedResult};
use chrono::Utc;
use livedash_core::{
    DataSource, DeliveryMode, MessageSink, PathExpr, SubscriptionKey, VariableBindings, WidgetId,
};
use livedash_telemetry::Metrics;
use livedash_transport::{
    ConnectionStatus, DeliveryOptions, DynKvBuckets, DynTransport, KvEntry, SubscriptionId,
    TransportMessage,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle notifications from the multiplexer.
#[derive(Debug, Clone, PartialEq)]
pub enum MultiplexerEvent {
    /// A transport subscription was opened for a key.
    Opened { key: SubscriptionKey },
    /// The last owner left and the transport subscription was closed.
    Closed { key: SubscriptionKey },
    /// Connection loss dropped every live subscription.
    Invalidated {
        keys: Vec<SubscriptionKey>,
        owners: Vec<WidgetId>,
    },
    /// The transport ended a subscription on its own; the next subscribe
    /// for the key reopens it.
    StreamEnded { key: SubscriptionKey },
    /// Reopening an ended subscription failed. `owners` stay registered on
    /// the ended key and are retried by the next subscribe for it.
    ReopenFailed {
        key: SubscriptionKey,
        owners: Vec<WidgetId>,
        error: String,
    },
}

#[derive(Debug, Clone, Copy)]
enum Handle {
    Transport(SubscriptionId),
    KvWatch,
}

struct LiveSubscription {
    owners: Arc<RwLock<OwnerMap>>,
    handle: Handle,
    cancel: CancellationToken,
    ended: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl LiveSubscription {
    fn is_dead(&self) -> bool {
        self.ended.load(Ordering::SeqCst) || self.task.is_finished()
    }
}

/// Shared state handed to a pump task.
struct PumpContext {
    key: SubscriptionKey,
    owners: Arc<RwLock<OwnerMap>>,
    sink: Arc<dyn MessageSink>,
    cancel: CancellationToken,
    ended: Arc<AtomicBool>,
    stats: Arc<DecodeStats>,
    events: broadcast::Sender<MultiplexerEvent>,
}

impl PumpContext {
    /// Deliver to the current owners unless cancelled.
    ///
    /// The owner lock is held across the sink call, so an owner removed by
    /// `unsubscribe` never receives a message after the call returns.
    fn deliver(&self, build: impl FnOnce(&OwnerMap) -> Vec<livedash_core::BufferItem>) {
        let owners = self.owners.read();
        if self.cancel.is_cancelled() {
            return;
        }
        let items = build(&owners);
        if items.is_empty() {
            return;
        }
        let n = items.len();
        self.sink.deliver(items);
        self.stats.record_delivered(n);
        Metrics::messages_delivered(n);
    }

    fn mark_ended(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.ended.store(true, Ordering::SeqCst);
        warn!(key = %self.key, "Transport ended subscription");
        let _ = self.events.send(MultiplexerEvent::StreamEnded {
            key: self.key.clone(),
        });
    }
}

async fn run_subject_pump(ctx: PumpContext, mut receiver: mpsc::Receiver<TransportMessage>) {
    loop {
        let msg = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => break,
            msg = receiver.recv() => msg,
        };
        let Some(msg) = msg else {
            ctx.mark_ended();
            break;
        };
        trace!(key = %ctx.key, subject = %msg.subject, bytes = msg.payload.len(), "Message received");
        ctx.deliver(|owners| decode_and_fan_out(&msg.subject, &msg.payload, owners, &ctx.stats));
    }
    debug!(key = %ctx.key, "Subject pump stopped");
}

async fn run_kv_pump(ctx: PumpContext, mut receiver: mpsc::UnboundedReceiver<KvEntry>) {
    loop {
        let entry = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => break,
            entry = receiver.recv() => entry,
        };
        let Some(entry) = entry else {
            ctx.mark_ended();
            break;
        };
        trace!(key = %ctx.key, revision = entry.revision, op = ?entry.operation, "KV entry received");
        if entry.is_deleted() {
            ctx.deliver(|owners| fan_out(&entry.key, &entry.value, None, owners, &ctx.stats));
        } else {
            ctx.deliver(|owners| decode_and_fan_out(&entry.key, &entry.value, owners, &ctx.stats));
        }
    }
    debug!(key = %ctx.key, "KV pump stopped");
}

/// Deduplicating subscription registry.
pub struct Multiplexer {
    transport: DynTransport,
    kv: Option<DynKvBuckets>,
    sink: Arc<dyn MessageSink>,
    /// Held across transport opens so one key never opens twice.
    registry: Mutex<HashMap<SubscriptionKey, LiveSubscription>>,
    events: broadcast::Sender<MultiplexerEvent>,
    stats: Arc<DecodeStats>,
}

impl Multiplexer {
    pub fn new(transport: DynTransport, sink: Arc<dyn MessageSink>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transport,
            kv: None,
            sink,
            registry: Mutex::new(HashMap::new()),
            events,
            stats: Arc::new(DecodeStats::default()),
        }
    }

    /// Enable KV-backed sources.
    pub fn with_kv(mut self, kv: DynKvBuckets) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Register `owner` for the data described by `source`.
    ///
    /// Returns the canonical key the owner was registered under. On error no
    /// owner is registered.
    pub async fn subscribe(
        &self,
        owner: &WidgetId,
        source: &DataSource,
        extraction: Option<&str>,
        vars: &VariableBindings,
    ) -> FeedResult<SubscriptionKey> {
        let key = source.resolve(vars)?;
        let path = extraction
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(PathExpr::parse)
            .transpose()?;

        let mut registry = self.registry.lock().await;

        let mut dead = None;
        if let Some(live) = registry.get(&key) {
            if !live.is_dead() {
                let joined = live.owners.write().insert(owner.clone(), path).is_none();
                if joined {
                    debug!(widget_id = %owner, %key, "Joined live subscription");
                    Metrics::owners_set(total_owners(&registry));
                } else {
                    debug!(widget_id = %owner, %key, "Updated extraction for owner");
                }
                return Ok(key);
            }
            info!(%key, "Reopening ended subscription");
            dead = registry.remove(&key);
        }

        let mut owners = dead
            .as_ref()
            .map(|d| d.owners.read().clone())
            .unwrap_or_default();
        owners.insert(owner.clone(), path);
        let live = match self.open(&key, owners).await {
            Ok(live) => live,
            Err(e) => {
                warn!(widget_id = %owner, %key, error = %e, "Failed to open subscription");
                if let Some(dead) = dead {
                    self.restore_ended(&mut registry, &key, owner, dead, &e).await;
                }
                Metrics::owners_set(total_owners(&registry));
                return Err(e);
            }
        };
        if let Some(dead) = dead {
            self.close_handle(&key, dead).await;
        }
        registry.insert(key.clone(), live);

        info!(widget_id = %owner, %key, "Opened subscription");
        Metrics::subscription_opened();
        Metrics::owners_set(total_owners(&registry));
        let _ = self
            .events
            .send(MultiplexerEvent::Opened { key: key.clone() });
        Ok(key)
    }

    /// Remove `owner` from the key `source` resolves to.
    ///
    /// Returns `false` (and does nothing) for unknown owner/key pairs.
    pub async fn unsubscribe(
        &self,
        owner: &WidgetId,
        source: &DataSource,
        vars: &VariableBindings,
    ) -> bool {
        match source.resolve(vars) {
            Ok(key) => self.unsubscribe_key(owner, &key).await,
            Err(_) => false,
        }
    }

    /// Remove `owner` from an already-resolved key.
    pub async fn unsubscribe_key(&self, owner: &WidgetId, key: &SubscriptionKey) -> bool {
        let mut registry = self.registry.lock().await;
        let Some(live) = registry.get(key) else {
            return false;
        };

        let (removed, empty) = {
            let mut owners = live.owners.write();
            let removed = owners.remove(owner).is_some();
            (removed, owners.is_empty())
        };
        if !removed {
            return false;
        }
        debug!(widget_id = %owner, %key, "Owner left subscription");

        if empty {
            if let Some(live) = registry.remove(key) {
                self.close_handle(key, live).await;
                info!(%key, "Closed subscription");
                Metrics::subscription_closed();
                let _ = self
                    .events
                    .send(MultiplexerEvent::Closed { key: key.clone() });
            }
        }
        Metrics::owners_set(total_owners(&registry));
        true
    }

    /// Drop every live subscription after connection loss.
    ///
    /// Returns the affected owners; nothing is resubscribed automatically.
    pub async fn invalidate_all(&self) -> Vec<WidgetId> {
        let drained: Vec<(SubscriptionKey, LiveSubscription)> =
            self.registry.lock().await.drain().collect();
        if drained.is_empty() {
            return Vec::new();
        }

        let mut keys = Vec::with_capacity(drained.len());
        let mut owners = Vec::new();
        for (key, live) in drained {
            live.cancel.cancel();
            owners.extend(live.owners.read().keys().cloned());
            keys.push(key);
        }
        owners.sort();
        owners.dedup();

        warn!(
            subscriptions = keys.len(),
            owners = owners.len(),
            "Connection lost, invalidated all subscriptions"
        );
        Metrics::subscriptions_invalidated(keys.len());
        Metrics::owners_set(0);
        let _ = self.events.send(MultiplexerEvent::Invalidated {
            keys,
            owners: owners.clone(),
        });
        owners
    }

    /// Close every live subscription (shutdown).
    pub async fn close_all(&self) {
        let drained: Vec<(SubscriptionKey, LiveSubscription)> =
            self.registry.lock().await.drain().collect();
        for (key, live) in drained {
            self.close_handle(&key, live).await;
            Metrics::subscription_closed();
            let _ = self.events.send(MultiplexerEvent::Closed { key });
        }
        Metrics::owners_set(0);
    }

    /// Invalidate all subscriptions whenever the transport reports
    /// `Disconnected`. The task ends when the multiplexer is dropped.
    pub fn watch_connection(self: &Arc<Self>) -> JoinHandle<()> {
        let mut status_rx = self.transport.connection_status();
        let this: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while status_rx.changed().await.is_ok() {
                let status = *status_rx.borrow_and_update();
                debug!(%status, "Transport status changed");
                if status != ConnectionStatus::Disconnected {
                    continue;
                }
                let Some(mux) = this.upgrade() else {
                    break;
                };
                mux.invalidate_all().await;
            }
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MultiplexerEvent> {
        self.events.subscribe()
    }

    pub async fn live_keys(&self) -> Vec<SubscriptionKey> {
        self.registry.lock().await.keys().cloned().collect()
    }

    /// Owners of a key, sorted; empty if the key is not live.
    pub async fn owners(&self, key: &SubscriptionKey) -> Vec<WidgetId> {
        let registry = self.registry.lock().await;
        let mut owners: Vec<WidgetId> = registry
            .get(key)
            .map(|live| live.owners.read().keys().cloned().collect())
            .unwrap_or_default();
        owners.sort();
        owners
    }

    pub async fn subscription_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    pub fn stats(&self) -> &DecodeStats {
        &self.stats
    }

    async fn open(&self, key: &SubscriptionKey, owners: OwnerMap) -> FeedResult<LiveSubscription> {
        let cancel = CancellationToken::new();
        let ended = Arc::new(AtomicBool::new(false));
        let owners = Arc::new(RwLock::new(owners));
        let ctx = PumpContext {
            key: key.clone(),
            owners: owners.clone(),
            sink: self.sink.clone(),
            cancel: cancel.clone(),
            ended: ended.clone(),
            stats: self.stats.clone(),
            events: self.events.clone(),
        };

        let (handle, task) = match key.mode {
            DeliveryMode::Core | DeliveryMode::Stream => {
                let options = DeliveryOptions::for_key(key, Utc::now());
                let sub = self.transport.subscribe(&key.subject, options).await?;
                debug!(%key, subscription = %sub.id, "Transport subscription opened");
                let task = tokio::spawn(run_subject_pump(ctx, sub.receiver));
                (Handle::Transport(sub.id), task)
            }
            DeliveryMode::Kv => {
                let buckets = self
                    .kv
                    .as_ref()
                    .ok_or_else(|| FeedError::NotFound(format!("no KV store for {key}")))?;
                let bucket_name = key
                    .bucket
                    .as_deref()
                    .ok_or_else(|| FeedError::InvalidKey(format!("missing bucket in {key}")))?;
                let bucket = buckets.bucket(bucket_name).await?;
                let watch = bucket.watch(&key.subject).await?;
                debug!(%key, "KV watch opened");
                let task = tokio::spawn(run_kv_pump(ctx, watch.receiver));
                (Handle::KvWatch, task)
            }
        };

        Ok(LiveSubscription {
            owners,
            handle,
            cancel,
            ended,
            task,
        })
    }

    /// Put an ended subscription back after its reopen failed so its
    /// earlier owners stay registered. `owner` is not kept.
    async fn restore_ended(
        &self,
        registry: &mut HashMap<SubscriptionKey, LiveSubscription>,
        key: &SubscriptionKey,
        owner: &WidgetId,
        dead: LiveSubscription,
        error: &FeedError,
    ) {
        let mut owners: Vec<WidgetId> = {
            let mut map = dead.owners.write();
            map.remove(owner);
            map.keys().cloned().collect()
        };
        if owners.is_empty() {
            self.close_handle(key, dead).await;
            Metrics::subscription_closed();
            let _ = self
                .events
                .send(MultiplexerEvent::Closed { key: key.clone() });
            return;
        }
        owners.sort();
        registry.insert(key.clone(), dead);
        warn!(%key, owners = owners.len(), "Ended subscription could not be reopened");
        let _ = self.events.send(MultiplexerEvent::ReopenFailed {
            key: key.clone(),
            owners,
            error: error.to_string(),
        });
    }

    async fn close_handle(&self, key: &SubscriptionKey, live: LiveSubscription) {
        live.cancel.cancel();
        if let Handle::Transport(id) = live.handle {
            if let Err(e) = self.transport.unsubscribe(id).await {
                warn!(%key, subscription = %id, error = %e, "Transport unsubscribe failed");
            }
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        for live in self.registry.get_mut().values() {
            live.cancel.cancel();
        }
    }
}

fn total_owners(registry: &HashMap<SubscriptionKey, LiveSubscription>) -> usize {
    registry.values().map(|live| live.owners.read().len()).sum()
}
