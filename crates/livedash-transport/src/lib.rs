//! Message transport and replicated KV contracts for livedash.
//!
//! Provides:
//! - `MessageTransport`: subject subscriptions (plain or stream-backed), publish,
//!   connection status
//! - `KvBuckets` / `KvStore`: revisioned key-value entries with compare-and-swap,
//!   watches and key listing
//! - `MemoryTransport` / `MemoryBucket`: complete in-memory implementations
//! - Channel-based delivery: the transport pushes, consumers pull

pub mod error;
pub mod memory;
pub mod message;
pub mod transport;

pub use error::{TransportError, TransportResult};
pub use memory::{MemoryBucket, MemoryConfig, MemoryTransport};
pub use message::{ConnectionStatus, DeliveryOptions, KvEntry, KvOperation, TransportMessage};
pub use transport::{
    BoxFuture, DynKvBuckets, DynKvStore, DynTransport, KvBuckets, KvStore, KvWatch,
    MessageTransport, SubscriptionId, TransportSubscription,
};
