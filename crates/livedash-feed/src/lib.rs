//! Subscription multiplexer for livedash.
//!
//! Provides:
//! - `Multiplexer`: one transport subscription per canonical key, shared by
//!   any number of widgets
//! - Payload decoding (JSON, text fallback) and per-widget value extraction
//! - Connection-loss invalidation and lifecycle events

pub mod decode;
pub mod error;
pub mod multiplexer;

pub use decode::{decode_payload, DecodeStats, OwnerMap};
pub use error::{FeedError, FeedResult};
pub use multiplexer::{Multiplexer, MultiplexerEvent};
