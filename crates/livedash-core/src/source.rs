//! Widget data sources and their canonical subscription keys.
//!
//! A widget reads either a message-bus subject (plain or stream-backed) or a
//! single KV entry. Before subscribing, the source is resolved against the
//! dashboard variables and reduced to a [`SubscriptionKey`]. Two widgets whose
//! sources reduce to the same key share one underlying subscription.

use crate::error::{CoreError, Result};
use crate::subject::{validate_kv_key, validate_subject};
use crate::template::{resolve_template, VariableBindings};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Replay policy applied by the transport when a stream subscription opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    /// Replay everything retained by the stream.
    All,
    /// Replay the last message, then live.
    #[default]
    Last,
    /// Live messages only.
    New,
    /// Replay the last message of every matching subject, then live.
    LastPerSubject,
    /// Replay from a start time (derived from a time window).
    ByStartTime,
}

impl fmt::Display for DeliverPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::All => "all",
            Self::Last => "last",
            Self::New => "new",
            Self::LastPerSubject => "last_per_subject",
            Self::ByStartTime => "by_start_time",
        };
        f.write_str(s)
    }
}

/// How a subject source is delivered.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Delivery {
    /// Plain publish/subscribe: live messages only, no replay.
    #[default]
    Core,
    /// Stream-backed (durable/windowed) delivery with transport-side replay.
    Stream {
        #[serde(default)]
        deliver_policy: DeliverPolicy,
        /// Time window such as `"30s"`, `"5m"`, `"1h"`, `"2d"`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        window: Option<String>,
    },
}

/// Where a widget's data comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataSource {
    /// Message-bus subject; may contain `${var}` placeholders.
    Subject {
        subject: String,
        #[serde(default)]
        delivery: Delivery,
    },
    /// Single KV entry; the key may contain `${var}` placeholders.
    Kv { bucket: String, key: String },
}

impl DataSource {
    /// Plain subject source.
    pub fn subject(subject: impl Into<String>) -> Self {
        Self::Subject {
            subject: subject.into(),
            delivery: Delivery::Core,
        }
    }

    /// Stream-backed subject source.
    pub fn stream(
        subject: impl Into<String>,
        deliver_policy: DeliverPolicy,
        window: Option<&str>,
    ) -> Self {
        Self::Subject {
            subject: subject.into(),
            delivery: Delivery::Stream {
                deliver_policy,
                window: window.map(str::to_string),
            },
        }
    }

    /// KV entry source.
    pub fn kv(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Kv {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Whether the unresolved source references any `${var}` placeholder.
    pub fn uses_variables(&self) -> bool {
        match self {
            Self::Subject { subject, .. } => subject.contains("${"),
            Self::Kv { key, .. } => key.contains("${"),
        }
    }

    /// Resolve variables, validate, and reduce to the canonical key.
    pub fn resolve(&self, vars: &VariableBindings) -> Result<SubscriptionKey> {
        match self {
            Self::Subject { subject, delivery } => {
                let resolved = resolve_template(subject, vars);
                validate_subject(&resolved)?;
                match delivery {
                    Delivery::Core => Ok(SubscriptionKey {
                        mode: DeliveryMode::Core,
                        bucket: None,
                        subject: resolved,
                        deliver_policy: None,
                        window_secs: None,
                    }),
                    Delivery::Stream {
                        deliver_policy,
                        window,
                    } => {
                        let window_secs = window
                            .as_deref()
                            .map(parse_window)
                            .transpose()?
                            .map(|d| d.as_secs());
                        let policy = if window_secs.is_some() {
                            DeliverPolicy::ByStartTime
                        } else {
                            *deliver_policy
                        };
                        Ok(SubscriptionKey {
                            mode: DeliveryMode::Stream,
                            bucket: None,
                            subject: resolved,
                            deliver_policy: Some(policy),
                            window_secs,
                        })
                    }
                }
            }
            Self::Kv { bucket, key } => {
                let resolved = resolve_template(key, vars);
                if resolved.contains("${") {
                    return Err(CoreError::InvalidKey(format!(
                        "unresolved variable in '{resolved}'"
                    )));
                }
                validate_kv_key(&resolved)?;
                validate_kv_key(bucket)?;
                Ok(SubscriptionKey {
                    mode: DeliveryMode::Kv,
                    bucket: Some(bucket.clone()),
                    subject: resolved,
                    deliver_policy: None,
                    window_secs: None,
                })
            }
        }
    }
}

/// Delivery mode component of a subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeliveryMode {
    Core,
    Stream,
    Kv,
}

/// Canonical identity of a live subscription.
///
/// Fields that do not affect what the transport delivers are normalized away
/// (a core subscription has no policy or window), so equal keys always mean
/// identical data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub mode: DeliveryMode,
    /// KV bucket (KV mode only).
    pub bucket: Option<String>,
    /// Resolved subject, or resolved KV key in KV mode.
    pub subject: String,
    /// Stream mode only.
    pub deliver_policy: Option<DeliverPolicy>,
    /// Stream mode only; whole seconds.
    pub window_secs: Option<u64>,
}

impl SubscriptionKey {
    pub fn window(&self) -> Option<Duration> {
        self.window_secs.map(Duration::from_secs)
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            DeliveryMode::Core => write!(f, "core:{}", self.subject),
            DeliveryMode::Stream => {
                write!(f, "stream:{}", self.subject)?;
                if let Some(policy) = self.deliver_policy {
                    write!(f, "?policy={policy}")?;
                }
                if let Some(w) = self.window_secs {
                    write!(f, "&window={w}s")?;
                }
                Ok(())
            }
            DeliveryMode::Kv => write!(
                f,
                "kv:{}/{}",
                self.bucket.as_deref().unwrap_or_default(),
                self.subject
            ),
        }
    }
}

/// Parse a time window such as `"90"`, `"30s"`, `"5m"`, `"1h"`, `"2d"`.
pub fn parse_window(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => s.split_at(pos),
        None => (s, "s"),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| CoreError::InvalidWindow(s.to_string()))?;
    let secs = match unit {
        "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        "d" => n * 86_400,
        _ => return Err(CoreError::InvalidWindow(s.to_string())),
    };
    if secs == 0 {
        return Err(CoreError::InvalidWindow(s.to_string()));
    }
    Ok(Duration::from_secs(secs))
}
