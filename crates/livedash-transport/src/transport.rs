//! Transport and KV store contracts.
//!
//! The multiplexer and the sync engine depend on nothing beyond these traits.
//! Live data is pushed by the transport into a channel; consumers pull from the
//! receiver, and dropping the receiver (or unsubscribing) closes it.

use crate::error::TransportResult;
use crate::message::{ConnectionStatus, DeliveryOptions, KvEntry, TransportMessage};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Transport-assigned subscription id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// An open transport subscription.
#[derive(Debug)]
pub struct TransportSubscription {
    pub id: SubscriptionId,
    pub receiver: mpsc::Receiver<TransportMessage>,
}

/// Message-bus transport.
pub trait MessageTransport: Send + Sync {
    /// Open a subscription. Stream-backed options fail with `NotFound` when no
    /// stream covers the subject.
    fn subscribe<'a>(
        &'a self,
        subject: &'a str,
        options: DeliveryOptions,
    ) -> BoxFuture<'a, TransportResult<TransportSubscription>>;

    /// Close a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId) -> BoxFuture<'_, TransportResult<()>>;

    fn publish<'a>(&'a self, subject: &'a str, payload: Bytes)
        -> BoxFuture<'a, TransportResult<()>>;

    /// Connection status; the current value is available immediately.
    fn connection_status(&self) -> watch::Receiver<ConnectionStatus>;
}

/// A live KV watch. The current values are delivered first.
#[derive(Debug)]
pub struct KvWatch {
    pub receiver: mpsc::UnboundedReceiver<KvEntry>,
}

/// One bucket of the replicated key-value store.
pub trait KvStore: Send + Sync {
    fn name(&self) -> &str;

    /// Current entry, `None` if the key is absent or deleted.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, TransportResult<Option<KvEntry>>>;

    /// Write a value. `expected_revision = Some(0)` requires the key to be
    /// absent; `Some(n)` requires the key's current revision to be `n`.
    /// Returns the new revision.
    fn put<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        expected_revision: Option<u64>,
    ) -> BoxFuture<'a, TransportResult<u64>>;

    /// Delete a key (leaves a delete marker). Returns the marker's revision.
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, TransportResult<u64>>;

    /// Watch a key or a wildcard pattern.
    fn watch<'a>(&'a self, key_or_pattern: &'a str) -> BoxFuture<'a, TransportResult<KvWatch>>;

    /// All live keys.
    fn keys(&self) -> BoxFuture<'_, TransportResult<BoxStream<'static, String>>>;
}

/// Access to KV buckets by name.
pub trait KvBuckets: Send + Sync {
    /// Open a bucket; unknown buckets fail with `NotFound`.
    fn bucket<'a>(&'a self, name: &'a str) -> BoxFuture<'a, TransportResult<Arc<dyn KvStore>>>;
}

pub type DynTransport = Arc<dyn MessageTransport>;
pub type DynKvBuckets = Arc<dyn KvBuckets>;
pub type DynKvStore = Arc<dyn KvStore>;
