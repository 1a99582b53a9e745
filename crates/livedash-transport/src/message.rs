//! Transport-level message and option types.

use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use livedash_core::{DeliverPolicy, DeliveryMode, SubscriptionKey};

/// A message as delivered by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportMessage {
    pub subject: String,
    pub payload: Bytes,
    /// Stream sequence, when delivered from a stream.
    pub sequence: Option<u64>,
    /// Publish time (ms since epoch).
    pub timestamp_ms: i64,
}

/// Options passed to the transport when opening a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOptions {
    /// Stream-backed (replaying) rather than plain delivery.
    pub durable: bool,
    pub deliver_policy: DeliverPolicy,
    /// Replay start for `ByStartTime`.
    pub start_time: Option<DateTime<Utc>>,
}

impl DeliveryOptions {
    /// Plain live delivery.
    pub fn core() -> Self {
        Self {
            durable: false,
            deliver_policy: DeliverPolicy::New,
            start_time: None,
        }
    }

    /// Build options for a canonical key; a window becomes `now - window`.
    pub fn for_key(key: &SubscriptionKey, now: DateTime<Utc>) -> Self {
        match key.mode {
            DeliveryMode::Stream => Self {
                durable: true,
                deliver_policy: key.deliver_policy.unwrap_or_default(),
                start_time: key
                    .window_secs
                    .map(|secs| now - ChronoDuration::seconds(secs as i64)),
            },
            DeliveryMode::Core | DeliveryMode::Kv => Self::core(),
        }
    }
}

/// Kind of change recorded for a KV entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvOperation {
    Put,
    Delete,
    Purge,
}

/// A KV entry at a given revision.
#[derive(Debug, Clone, PartialEq)]
pub struct KvEntry {
    pub bucket: String,
    pub key: String,
    pub value: Bytes,
    pub revision: u64,
    pub operation: KvOperation,
}

impl KvEntry {
    pub fn is_deleted(&self) -> bool {
        self.operation != KvOperation::Put
    }
}

/// Transport connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Reconnecting => write!(f, "RECONNECTING"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livedash_core::{DataSource, VariableBindings};

    #[test]
    fn test_options_for_windowed_key() {
        let key = DataSource::stream("m.cpu", DeliverPolicy::All, Some("5m"))
            .resolve(&VariableBindings::new())
            .unwrap();
        let now = Utc::now();
        let opts = DeliveryOptions::for_key(&key, now);
        assert!(opts.durable);
        assert_eq!(opts.deliver_policy, DeliverPolicy::ByStartTime);
        assert_eq!(opts.start_time, Some(now - ChronoDuration::seconds(300)));
    }

    #[test]
    fn test_options_for_core_key() {
        let key = DataSource::subject("m.cpu")
            .resolve(&VariableBindings::new())
            .unwrap();
        assert_eq!(DeliveryOptions::for_key(&key, Utc::now()), DeliveryOptions::core());
    }
}
