//! Widget ring buffers for livedash.
//!
//! Provides:
//! - `BufferStore`: bounded per-widget histories with batched inserts and
//!   immutable snapshots
//! - Memory governor: global total, soft warning, hard-cap pruning
//! - `CoalescingNotifier`: one change notification per widget per tick
//! - `IngestQueue`: multiplexer sink that batches deliveries per tick

pub mod config;
pub mod error;
pub mod ingest;
pub mod notify;
pub mod store;

pub use config::BufferConfig;
pub use error::{BufferError, BufferResult};
pub use ingest::IngestQueue;
pub use notify::{
    BufferChanged, CoalescingNotifier, ManualScheduler, Tick, TickScheduler, TokioTickScheduler,
};
pub use store::BufferStore;
