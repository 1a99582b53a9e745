//! Payload decoding and per-owner fan-out.
//!
//! Payloads are decoded once per message; each owner's extraction path is
//! then applied to the shared decoded value. Decode and extraction failures
//! drop the message for the affected owners only and never stop a pump.

use crate::error::{FeedError, FeedResult};
use bytes::Bytes;
use livedash_core::{BufferItem, BufferedMessage, PathExpr, WidgetId};
use livedash_telemetry::Metrics;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// Owners of one live subscription with their extraction paths.
pub type OwnerMap = HashMap<WidgetId, Option<PathExpr>>;

/// Ingestion statistics for one multiplexer.
#[derive(Debug, Default)]
pub struct DecodeStats {
    delivered: AtomicU64,
    decode_errors: AtomicU64,
    extract_errors: AtomicU64,
}

impl DecodeStats {
    pub fn record_delivered(&self, n: usize) {
        self.delivered.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_extract_error(&self) {
        self.extract_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn extract_errors(&self) -> u64 {
        self.extract_errors.load(Ordering::Relaxed)
    }
}

/// Decode a raw payload.
///
/// JSON decodes to its value; other valid UTF-8 becomes a JSON string;
/// anything else is a decode error.
pub fn decode_payload(payload: &[u8]) -> FeedResult<Value> {
    if let Ok(value) = serde_json::from_slice::<Value>(payload) {
        return Ok(value);
    }
    match std::str::from_utf8(payload) {
        Ok(text) => Ok(Value::String(text.to_string())),
        Err(e) => Err(FeedError::Decode(e.to_string())),
    }
}

/// Build one buffer item per owner for a decoded message.
///
/// `value = None` marks a deletion (KV sources) and yields `null` for every
/// owner without applying extraction paths.
pub fn fan_out(
    subject: &str,
    raw: &Bytes,
    value: Option<&Value>,
    owners: &OwnerMap,
    stats: &DecodeStats,
) -> Vec<BufferItem> {
    let mut items = Vec::with_capacity(owners.len());

    for (owner, path) in owners {
        let extracted = match (value, path) {
            (None, _) => Value::Null,
            (Some(v), None) => v.clone(),
            (Some(v), Some(path)) => match path.apply(v) {
                Ok(extracted) => extracted,
                Err(e) => {
                    trace!(widget_id = %owner, subject, error = %e, "Extraction failed");
                    stats.record_extract_error();
                    Metrics::message_dropped("extract");
                    continue;
                }
            },
        };
        items.push(BufferItem::new(
            owner.clone(),
            BufferedMessage::new(extracted, raw.clone(), subject),
        ));
    }

    items
}

/// Decode a message and fan it out, swallowing decode failures.
pub fn decode_and_fan_out(
    subject: &str,
    raw: &Bytes,
    owners: &OwnerMap,
    stats: &DecodeStats,
) -> Vec<BufferItem> {
    match decode_payload(raw) {
        Ok(value) => fan_out(subject, raw, Some(&value), owners, stats),
        Err(e) => {
            debug!(subject, error = %e, bytes = raw.len(), "Dropping undecodable payload");
            stats.record_decode_error();
            Metrics::message_dropped("decode");
            Vec::new()
        }
    }
}
