//! In-memory transport and KV store.
//!
//! Implements the full contracts (subject wildcards, stream replay by deliver
//! policy, per-bucket revisions, compare-and-swap, watches, connection loss)
//! without a broker. Used by tests and by the CLI.

use crate::error::{TransportError, TransportResult};
use crate::message::{ConnectionStatus, DeliveryOptions, KvEntry, KvOperation, TransportMessage};
use crate::transport::{
    BoxFuture, KvBuckets, KvStore, KvWatch, MessageTransport, SubscriptionId,
    TransportSubscription,
};
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::stream::{self, BoxStream, StreamExt};
use livedash_core::{
    subject_matches, validate_kv_key, validate_kv_pattern, validate_subject, DeliverPolicy,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// In-memory transport configuration.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Live channel capacity per subscription; overflow is dropped.
    pub channel_capacity: usize,
    /// Messages retained per stream.
    pub stream_max_msgs: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            stream_max_msgs: 10_000,
        }
    }
}

#[derive(Debug)]
struct StreamState {
    name: String,
    subjects: Vec<String>,
    messages: VecDeque<TransportMessage>,
    next_seq: u64,
}

impl StreamState {
    fn covers(&self, subject: &str) -> bool {
        self.subjects.iter().any(|p| subject_matches(p, subject))
    }

    fn replay(&self, filter: &str, options: &DeliveryOptions) -> Vec<TransportMessage> {
        let matching = self
            .messages
            .iter()
            .filter(|m| subject_matches(filter, &m.subject));

        match options.deliver_policy {
            DeliverPolicy::All => matching.cloned().collect(),
            DeliverPolicy::New => Vec::new(),
            DeliverPolicy::Last => matching.last().cloned().into_iter().collect(),
            DeliverPolicy::LastPerSubject => {
                let mut last: HashMap<&str, &TransportMessage> = HashMap::new();
                for m in matching {
                    last.insert(m.subject.as_str(), m);
                }
                let mut out: Vec<TransportMessage> = last.into_values().cloned().collect();
                out.sort_by_key(|m| m.sequence);
                out
            }
            DeliverPolicy::ByStartTime => {
                let start = options
                    .start_time
                    .map(|t| t.timestamp_millis())
                    .unwrap_or(i64::MIN);
                matching
                    .filter(|m| m.timestamp_ms >= start)
                    .cloned()
                    .collect()
            }
        }
    }
}

#[derive(Debug)]
struct SubscriberEntry {
    subject: String,
    tx: mpsc::Sender<TransportMessage>,
}

#[derive(Debug, Default)]
struct BusState {
    streams: Vec<StreamState>,
    subscribers: HashMap<SubscriptionId, SubscriberEntry>,
    next_id: u64,
}

/// In-memory message transport with KV buckets.
pub struct MemoryTransport {
    config: MemoryConfig,
    state: Mutex<BusState>,
    buckets: DashMap<String, Arc<MemoryBucket>>,
    connected: Arc<AtomicBool>,
    status_tx: watch::Sender<ConnectionStatus>,
    subscribe_calls: AtomicUsize,
    unsubscribe_calls: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::with_config(MemoryConfig::default())
    }

    pub fn with_config(config: MemoryConfig) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Connected);
        Self {
            config,
            state: Mutex::new(BusState::default()),
            buckets: DashMap::new(),
            connected: Arc::new(AtomicBool::new(true)),
            status_tx,
            subscribe_calls: AtomicUsize::new(0),
            unsubscribe_calls: AtomicUsize::new(0),
        }
    }

    /// Define a stream retaining messages on the given subject patterns.
    pub fn add_stream(&self, name: &str, subjects: &[&str]) {
        self.state.lock().streams.push(StreamState {
            name: name.to_string(),
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
            messages: VecDeque::new(),
            next_seq: 1,
        });
        debug!(stream = name, ?subjects, "Stream added");
    }

    /// Create (or return the existing) KV bucket.
    pub fn create_bucket(&self, name: &str) -> Arc<MemoryBucket> {
        self.buckets
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryBucket::new(name.to_string(), self.connected.clone()))
            })
            .clone()
    }

    /// Simulate connection loss (`false`) or restoration (`true`).
    ///
    /// Losing the connection closes every live subscription and KV watch.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        if connected {
            self.status_tx.send_replace(ConnectionStatus::Connected);
            info!("Memory transport connected");
        } else {
            let dropped = {
                let mut state = self.state.lock();
                let n = state.subscribers.len();
                state.subscribers.clear();
                n
            };
            for bucket in self.buckets.iter() {
                bucket.drop_watchers();
            }
            self.status_tx.send_replace(ConnectionStatus::Disconnected);
            warn!(dropped, "Memory transport disconnected");
        }
    }

    fn ensure_connected(&self) -> TransportResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::ConnectionLost)
        }
    }

    /// Number of `subscribe` calls that opened a subscription.
    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Number of `unsubscribe` calls that closed a live subscription.
    pub fn unsubscribe_calls(&self) -> usize {
        self.unsubscribe_calls.load(Ordering::SeqCst)
    }

    /// Currently open subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Synchronous publish.
    pub fn publish_now(&self, subject: &str, payload: Bytes) -> TransportResult<()> {
        self.ensure_connected()?;
        validate_subject(subject)?;
        if subject.contains('*') || subject.contains('>') {
            return Err(TransportError::InvalidSubject(format!(
                "cannot publish to wildcard subject '{subject}'"
            )));
        }

        let mut state = self.state.lock();
        let timestamp_ms = Utc::now().timestamp_millis();
        let mut sequence = None;
        let max_msgs = self.config.stream_max_msgs;

        for stream in state.streams.iter_mut().filter(|s| s.covers(subject)) {
            let seq = stream.next_seq;
            stream.next_seq += 1;
            sequence = Some(seq);
            stream.messages.push_back(TransportMessage {
                subject: subject.to_string(),
                payload: payload.clone(),
                sequence: Some(seq),
                timestamp_ms,
            });
            while stream.messages.len() > max_msgs {
                stream.messages.pop_front();
            }
        }

        let msg = TransportMessage {
            subject: subject.to_string(),
            payload,
            sequence,
            timestamp_ms,
        };
        state.subscribers.retain(|id, sub| {
            if !subject_matches(&sub.subject, subject) {
                return !sub.tx.is_closed();
            }
            match sub.tx.try_send(msg.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscription = %id, subject, "Subscriber channel full, message dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        Ok(())
    }

    fn subscribe_now(
        &self,
        subject: &str,
        options: &DeliveryOptions,
    ) -> TransportResult<TransportSubscription> {
        self.ensure_connected()?;
        validate_subject(subject)?;

        let mut state = self.state.lock();
        let replay = if options.durable {
            let stream = state
                .streams
                .iter()
                .find(|s| s.covers(subject))
                .ok_or_else(|| TransportError::NotFound(format!("no stream for '{subject}'")))?;
            debug!(stream = %stream.name, subject, policy = %options.deliver_policy, "Stream subscription");
            stream.replay(subject, options)
        } else {
            Vec::new()
        };

        let (tx, rx) = mpsc::channel(self.config.channel_capacity + replay.len());
        for msg in replay {
            let _ = tx.try_send(msg);
        }

        state.next_id += 1;
        let id = SubscriptionId(state.next_id);
        state.subscribers.insert(
            id,
            SubscriberEntry {
                subject: subject.to_string(),
                tx,
            },
        );
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(TransportSubscription { id, receiver: rx })
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageTransport for MemoryTransport {
    fn subscribe<'a>(
        &'a self,
        subject: &'a str,
        options: DeliveryOptions,
    ) -> BoxFuture<'a, TransportResult<TransportSubscription>> {
        Box::pin(async move { self.subscribe_now(subject, &options) })
    }

    fn unsubscribe(&self, id: SubscriptionId) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(async move {
            if self.state.lock().subscribers.remove(&id).is_some() {
                self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })
    }

    fn publish<'a>(
        &'a self,
        subject: &'a str,
        payload: Bytes,
    ) -> BoxFuture<'a, TransportResult<()>> {
        Box::pin(async move { self.publish_now(subject, payload) })
    }

    fn connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }
}

impl KvBuckets for MemoryTransport {
    fn bucket<'a>(&'a self, name: &'a str) -> BoxFuture<'a, TransportResult<Arc<dyn KvStore>>> {
        Box::pin(async move {
            self.ensure_connected()?;
            self.buckets
                .get(name)
                .map(|b| b.value().clone() as Arc<dyn KvStore>)
                .ok_or_else(|| TransportError::NotFound(format!("bucket '{name}'")))
        })
    }
}

#[derive(Debug, Default)]
struct BucketState {
    entries: BTreeMap<String, KvEntry>,
    revision: u64,
    watchers: Vec<(String, mpsc::UnboundedSender<KvEntry>)>,
}

/// In-memory KV bucket. Revisions are bucket-wide and strictly increasing.
pub struct MemoryBucket {
    name: String,
    connected: Arc<AtomicBool>,
    state: Mutex<BucketState>,
}

impl MemoryBucket {
    fn new(name: String, connected: Arc<AtomicBool>) -> Self {
        Self {
            name,
            connected,
            state: Mutex::new(BucketState::default()),
        }
    }

    fn ensure_connected(&self) -> TransportResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::ConnectionLost)
        }
    }

    fn drop_watchers(&self) {
        self.state.lock().watchers.clear();
    }

    /// Number of live watches.
    pub fn watcher_count(&self) -> usize {
        let mut state = self.state.lock();
        state.watchers.retain(|(_, tx)| !tx.is_closed());
        state.watchers.len()
    }

    /// Synchronous get.
    pub fn get_now(&self, key: &str) -> TransportResult<Option<KvEntry>> {
        self.ensure_connected()?;
        validate_kv_key(key)?;
        Ok(self
            .state
            .lock()
            .entries
            .get(key)
            .filter(|e| !e.is_deleted())
            .cloned())
    }

    /// Synchronous compare-and-swap put.
    pub fn put_now(
        &self,
        key: &str,
        value: Bytes,
        expected_revision: Option<u64>,
    ) -> TransportResult<u64> {
        self.write(key, value, KvOperation::Put, expected_revision)
    }

    fn write(
        &self,
        key: &str,
        value: Bytes,
        operation: KvOperation,
        expected_revision: Option<u64>,
    ) -> TransportResult<u64> {
        self.ensure_connected()?;
        validate_kv_key(key)?;

        let mut state = self.state.lock();
        if let Some(expected) = expected_revision {
            let current = state
                .entries
                .get(key)
                .filter(|e| !e.is_deleted())
                .map(|e| e.revision)
                .unwrap_or(0);
            if current != expected {
                debug!(bucket = %self.name, key, expected, current, "CAS rejected");
                return Err(TransportError::RevisionMismatch { expected, current });
            }
        }

        state.revision += 1;
        let entry = KvEntry {
            bucket: self.name.clone(),
            key: key.to_string(),
            value,
            revision: state.revision,
            operation,
        };
        state.entries.insert(key.to_string(), entry.clone());
        state.watchers.retain(|(pattern, tx)| {
            if subject_matches(pattern, key) {
                tx.send(entry.clone()).is_ok()
            } else {
                !tx.is_closed()
            }
        });
        Ok(entry.revision)
    }
}

impl KvStore for MemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, TransportResult<Option<KvEntry>>> {
        Box::pin(async move { self.get_now(key) })
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        expected_revision: Option<u64>,
    ) -> BoxFuture<'a, TransportResult<u64>> {
        Box::pin(async move { self.put_now(key, value, expected_revision) })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, TransportResult<u64>> {
        Box::pin(async move { self.write(key, Bytes::new(), KvOperation::Delete, None) })
    }

    fn watch<'a>(&'a self, key_or_pattern: &'a str) -> BoxFuture<'a, TransportResult<KvWatch>> {
        Box::pin(async move {
            self.ensure_connected()?;
            validate_kv_pattern(key_or_pattern)?;

            let (tx, rx) = mpsc::unbounded_channel();
            let mut state = self.state.lock();
            let mut current: Vec<&KvEntry> = state
                .entries
                .values()
                .filter(|e| !e.is_deleted() && subject_matches(key_or_pattern, &e.key))
                .collect();
            current.sort_by_key(|e| e.revision);
            for entry in current {
                let _ = tx.send(entry.clone());
            }
            state.watchers.push((key_or_pattern.to_string(), tx));
            Ok(KvWatch { receiver: rx })
        })
    }

    fn keys(&self) -> BoxFuture<'_, TransportResult<BoxStream<'static, String>>> {
        Box::pin(async move {
            self.ensure_connected()?;
            let keys: Vec<String> = self
                .state
                .lock()
                .entries
                .values()
                .filter(|e| !e.is_deleted())
                .map(|e| e.key.clone())
                .collect();
            Ok(stream::iter(keys).boxed())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(s: &str) -> Bytes {
        Bytes::from(s.to_string())
    }

    #[tokio::test]
    async fn test_core_subscription_receives_live_only() {
        let transport = MemoryTransport::new();
        transport.publish_now("a.b", payload("before")).unwrap();

        let mut sub = transport
            .subscribe("a.*", DeliveryOptions::core())
            .await
            .unwrap();
        transport.publish_now("a.b", payload("after")).unwrap();
        transport.publish_now("x.y", payload("other")).unwrap();

        let msg = sub.receiver.recv().await.unwrap();
        assert_eq!(msg.payload, payload("after"));
        assert!(sub.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stream_replay_policies() {
        let transport = MemoryTransport::new();
        transport.add_stream("METRICS", &["m.>"]);
        transport.publish_now("m.a", payload("1")).unwrap();
        transport.publish_now("m.b", payload("2")).unwrap();
        transport.publish_now("m.a", payload("3")).unwrap();

        let opts = |policy| DeliveryOptions {
            durable: true,
            deliver_policy: policy,
            start_time: None,
        };

        let mut all = transport.subscribe("m.>", opts(DeliverPolicy::All)).await.unwrap();
        for expected in ["1", "2", "3"] {
            assert_eq!(all.receiver.recv().await.unwrap().payload, payload(expected));
        }

        let mut last = transport.subscribe("m.>", opts(DeliverPolicy::Last)).await.unwrap();
        assert_eq!(last.receiver.recv().await.unwrap().payload, payload("3"));
        assert!(last.receiver.try_recv().is_err());

        let mut per_subject = transport
            .subscribe("m.>", opts(DeliverPolicy::LastPerSubject))
            .await
            .unwrap();
        assert_eq!(per_subject.receiver.recv().await.unwrap().payload, payload("2"));
        assert_eq!(per_subject.receiver.recv().await.unwrap().payload, payload("3"));
    }

    #[tokio::test]
    async fn test_stream_subscription_without_stream_is_not_found() {
        let transport = MemoryTransport::new();
        let opts = DeliveryOptions {
            durable: true,
            deliver_policy: DeliverPolicy::Last,
            start_time: None,
        };
        let err = transport.subscribe("nowhere.x", opts).await.unwrap_err();
        assert!(matches!(err, TransportError::NotFound(_)));
        assert_eq!(transport.subscribe_calls(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_closes_subscriptions() {
        let transport = MemoryTransport::new();
        let mut status = transport.connection_status();
        let mut sub = transport.subscribe("a.b", DeliveryOptions::core()).await.unwrap();

        transport.set_connected(false);
        assert!(sub.receiver.recv().await.is_none());
        status.changed().await.unwrap();
        assert_eq!(*status.borrow(), ConnectionStatus::Disconnected);
        assert_eq!(
            transport.publish_now("a.b", payload("x")).unwrap_err(),
            TransportError::ConnectionLost
        );
    }

    #[tokio::test]
    async fn test_kv_cas_and_revisions() {
        let transport = MemoryTransport::new();
        let bucket = transport.create_bucket("dashboards");

        let r1 = bucket.put("a", payload("v1"), Some(0)).await.unwrap();
        let err = bucket.put("a", payload("dup"), Some(0)).await.unwrap_err();
        assert_eq!(err, TransportError::RevisionMismatch { expected: 0, current: r1 });

        let r2 = bucket.put("a", payload("v2"), Some(r1)).await.unwrap();
        assert!(r2 > r1);
        let err = bucket.put("a", payload("stale"), Some(r1)).await.unwrap_err();
        assert!(matches!(err, TransportError::RevisionMismatch { .. }));

        let entry = bucket.get("a").await.unwrap().unwrap();
        assert_eq!(entry.value, payload("v2"));
        assert_eq!(entry.revision, r2);
    }

    #[tokio::test]
    async fn test_kv_watch_and_keys() {
        let transport = MemoryTransport::new();
        let bucket = transport.create_bucket("cfg");
        bucket.put_now("app.one", payload("1"), None).unwrap();

        let mut watch = bucket.watch("app.>").await.unwrap();
        assert_eq!(watch.receiver.recv().await.unwrap().key, "app.one");

        bucket.put_now("app.two", payload("2"), None).unwrap();
        bucket.put_now("other", payload("x"), None).unwrap();
        bucket.delete("app.one").await.unwrap();

        assert_eq!(watch.receiver.recv().await.unwrap().key, "app.two");
        let deleted = watch.receiver.recv().await.unwrap();
        assert!(deleted.is_deleted());
        assert!(bucket.get("app.one").await.unwrap().is_none());

        let mut keys: Vec<String> = bucket.keys().await.unwrap().collect().await;
        keys.sort();
        assert_eq!(keys, vec!["app.two".to_string(), "other".to_string()]);
    }

    #[test]
    fn test_create_after_delete() {
        let transport = MemoryTransport::new();
        let bucket = transport.create_bucket("b");
        tokio_test::block_on(async {
            let r1 = bucket.put("k", payload("1"), Some(0)).await.unwrap();
            bucket.delete("k").await.unwrap();
            let r2 = bucket.put("k", payload("2"), Some(0)).await.unwrap();
            assert!(r2 > r1);
        });
    }

    #[tokio::test]
    async fn test_unknown_bucket() {
        let transport = MemoryTransport::new();
        let err = transport.bucket("missing").await.err().unwrap();
        assert!(matches!(err, TransportError::NotFound(_)));
    }
}
