//! Prometheus metrics for livedash.
//!
//! Covers:
//! - Subscription multiplexer (open subscriptions, owners, deliveries)
//! - Buffer store and memory governor
//! - Dashboard sync (saves, conflicts)
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. A registration failure
//! means duplicate metric names, a programming error that must surface at
//! first use rather than silently dropping metrics.

use crate::error::{TelemetryError, TelemetryResult};
use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

/// Currently open transport subscriptions.
pub static SUBSCRIPTIONS_OPEN: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "livedash_subscriptions_open",
        "Currently open transport subscriptions"
    )
    .unwrap()
});

/// Transport subscriptions opened/closed.
/// Labels: event (opened/closed/invalidated)
pub static SUBSCRIPTION_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "livedash_subscription_events_total",
        "Transport subscription lifecycle events",
        &["event"]
    )
    .unwrap()
});

/// Registered subscription owners (widgets) across all keys.
pub static SUBSCRIPTION_OWNERS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "livedash_subscription_owners",
        "Widgets registered across all live subscriptions"
    )
    .unwrap()
});

/// Values fanned out to widgets.
pub static MESSAGES_DELIVERED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "livedash_messages_delivered_total",
        "Values delivered to widget buffers"
    )
    .unwrap()
});

/// Messages dropped at ingestion.
/// Labels: reason (decode/extract)
pub static MESSAGES_DROPPED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "livedash_messages_dropped_total",
        "Messages dropped at ingestion",
        &["reason"]
    )
    .unwrap()
});

/// Messages held across all widget buffers.
pub static BUFFER_MESSAGES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "livedash_buffer_messages",
        "Messages held across all widget buffers"
    )
    .unwrap()
});

/// Memory governor pressure state (1=pressure).
pub static BUFFER_PRESSURE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "livedash_buffer_pressure",
        "Memory governor pressure state (1=pressure)"
    )
    .unwrap()
});

/// Governor pruning passes.
pub static PRUNE_PASSES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "livedash_prune_passes_total",
        "Memory governor pruning passes"
    )
    .unwrap()
});

/// Dashboard saves.
/// Labels: storage (local/shared), result (ok/conflict/error)
pub static DASHBOARD_SAVES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "livedash_dashboard_saves_total",
        "Dashboard save attempts",
        &["storage", "result"]
    )
    .unwrap()
});

/// Conflicts detected on shared dashboards.
/// Labels: source (cas/watch)
pub static CONFLICTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "livedash_conflicts_total",
        "Conflicts detected on shared dashboards",
        &["source"]
    )
    .unwrap()
});

/// Metrics facade.
pub struct Metrics;

impl Metrics {
    /// Record a transport subscription opened.
    pub fn subscription_opened() {
        SUBSCRIPTIONS_OPEN.inc();
        SUBSCRIPTION_EVENTS_TOTAL.with_label_values(&["opened"]).inc();
    }

    /// Record a transport subscription closed by its last owner leaving.
    pub fn subscription_closed() {
        SUBSCRIPTIONS_OPEN.dec();
        SUBSCRIPTION_EVENTS_TOTAL.with_label_values(&["closed"]).inc();
    }

    /// Record subscriptions lost to a connection drop.
    pub fn subscriptions_invalidated(count: usize) {
        SUBSCRIPTIONS_OPEN.sub(count as i64);
        SUBSCRIPTION_EVENTS_TOTAL
            .with_label_values(&["invalidated"])
            .inc_by(count as u64);
    }

    /// Update the number of registered owners.
    pub fn owners_set(count: usize) {
        SUBSCRIPTION_OWNERS.set(count as i64);
    }

    /// Record values delivered to widgets.
    pub fn messages_delivered(count: usize) {
        MESSAGES_DELIVERED_TOTAL.inc_by(count as u64);
    }

    /// Record a message dropped at ingestion.
    pub fn message_dropped(reason: &str) {
        MESSAGES_DROPPED_TOTAL.with_label_values(&[reason]).inc();
    }

    /// Update the buffer store total.
    pub fn buffer_messages(total: usize) {
        BUFFER_MESSAGES.set(total as i64);
    }

    /// Set governor pressure state.
    pub fn buffer_pressure(under_pressure: bool) {
        BUFFER_PRESSURE.set(if under_pressure { 1 } else { 0 });
    }

    /// Record a pruning pass.
    pub fn prune_pass() {
        PRUNE_PASSES_TOTAL.inc();
    }

    /// Record a dashboard save attempt.
    pub fn dashboard_saved(storage: &str, result: &str) {
        DASHBOARD_SAVES_TOTAL
            .with_label_values(&[storage, result])
            .inc();
    }

    /// Record a detected conflict.
    pub fn conflict_detected(source: &str) {
        CONFLICTS_TOTAL.with_label_values(&[source]).inc();
    }

    /// Render all registered metrics in the Prometheus text format.
    pub fn render() -> TelemetryResult<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buf = Vec::new();
        encoder
            .encode(&prometheus::gather(), &mut buf)
            .map_err(|e| TelemetryError::Metrics(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| TelemetryError::Metrics(e.to_string()))
    }
}
