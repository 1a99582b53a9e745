//! Messages flowing from subscriptions into widget buffers.

use crate::ids::WidgetId;
use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;

/// One entry of a widget's history.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedMessage {
    /// Arrival time (ms since epoch).
    pub timestamp_ms: i64,
    /// Decoded and extracted value.
    pub value: Value,
    /// Raw transport payload.
    pub raw: Bytes,
    /// Subject the message arrived on (KV key for KV sources).
    pub subject: String,
}

impl BufferedMessage {
    pub fn new(value: Value, raw: Bytes, subject: impl Into<String>) -> Self {
        Self {
            timestamp_ms: Utc::now().timestamp_millis(),
            value,
            raw,
            subject: subject.into(),
        }
    }
}

/// A message addressed to one widget's buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferItem {
    pub widget_id: WidgetId,
    pub message: BufferedMessage,
}

impl BufferItem {
    pub fn new(widget_id: WidgetId, message: BufferedMessage) -> Self {
        Self { widget_id, message }
    }
}

/// Receiver of fanned-out messages.
///
/// Called synchronously from subscription pumps; implementations must not
/// block. Items of one call are in delivery order.
pub trait MessageSink: Send + Sync {
    fn deliver(&self, items: Vec<BufferItem>);
}
