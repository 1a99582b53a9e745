//! Per-widget ring buffers and the memory governor.
//!
//! Each widget owns one bounded, order-preserving history. Inserts arrive in
//! batches; the governor tracks the total across all buffers and prunes the
//! largest histories when the hard cap is reached.

use crate::config::BufferConfig;
use crate::notify::{BufferChanged, CoalescingNotifier, TickScheduler};
use chrono::Utc;
use livedash_core::{BufferItem, BufferedMessage, WidgetId};
use livedash_telemetry::Metrics;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct WidgetBuffer {
    entries: VecDeque<Arc<BufferedMessage>>,
    capacity: usize,
    max_age: Option<Duration>,
}

impl WidgetBuffer {
    fn new(capacity: usize, max_age: Option<Duration>) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            max_age,
        }
    }

    /// Append a batch for this widget, evicting by capacity.
    fn insert(&mut self, batch: Vec<Arc<BufferedMessage>>) {
        let cap = self.capacity;
        if batch.len() >= cap {
            let skip = batch.len() - cap;
            self.entries = batch.into_iter().skip(skip).collect();
            return;
        }
        let overflow = (self.entries.len() + batch.len()).saturating_sub(cap);
        self.entries.drain(..overflow);
        self.entries.extend(batch);
    }

    /// Drop entries older than `max_age`. Returns the number removed.
    fn evict_expired(&mut self, now_ms: i64) -> usize {
        let Some(max_age) = self.max_age else {
            return 0;
        };
        let cutoff = now_ms.saturating_sub(max_age.as_millis() as i64);
        let mut removed = 0;
        while self
            .entries
            .front()
            .is_some_and(|m| m.timestamp_ms < cutoff)
        {
            self.entries.pop_front();
            removed += 1;
        }
        removed
    }

    fn shrink_to(&mut self, capacity: usize) -> usize {
        let excess = self.entries.len().saturating_sub(capacity);
        self.entries.drain(..excess);
        excess
    }
}

#[derive(Debug, Default)]
struct StoreState {
    buffers: HashMap<WidgetId, WidgetBuffer>,
    total: usize,
    under_pressure: bool,
    soft_warned: bool,
}

impl StoreState {
    /// Apply a size change of one buffer to the running total.
    fn adjust(&mut self, before: usize, after: usize) {
        self.total = (self.total + after).saturating_sub(before);
    }
}

struct Inner {
    config: BufferConfig,
    state: RwLock<StoreState>,
    notifier: Arc<CoalescingNotifier>,
}

/// Shared handle to all widget buffers.
#[derive(Clone)]
pub struct BufferStore {
    inner: Arc<Inner>,
}

impl BufferStore {
    pub fn new(config: BufferConfig, scheduler: Arc<dyn TickScheduler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: RwLock::new(StoreState::default()),
                notifier: CoalescingNotifier::new(scheduler),
            }),
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.inner.config
    }

    /// Create an empty buffer for `widget` unless one exists.
    ///
    /// Returns `false` when the widget already had a buffer (left untouched).
    pub fn initialize(&self, widget: &WidgetId, max_count: usize, max_age: Option<Duration>) -> bool {
        let capacity = self.inner.config.clamp_capacity(max_count);
        let mut state = self.inner.state.write();
        if state.buffers.contains_key(widget) {
            return false;
        }
        state
            .buffers
            .insert(widget.clone(), WidgetBuffer::new(capacity, max_age));
        debug!(widget_id = %widget, capacity, ?max_age, "Buffer initialized");
        true
    }

    /// Change a buffer's limits, keeping the newest entries that fit.
    /// Creates the buffer when missing.
    pub fn reconfigure(&self, widget: &WidgetId, max_count: usize, max_age: Option<Duration>) {
        let capacity = self.inner.config.clamp_capacity(max_count);
        let now_ms = Utc::now().timestamp_millis();
        let changed = {
            let mut state = self.inner.state.write();
            let (before, after) = match state.buffers.get_mut(widget) {
                Some(buf) => {
                    let before = buf.entries.len();
                    buf.capacity = capacity;
                    buf.max_age = max_age;
                    buf.shrink_to(capacity);
                    buf.evict_expired(now_ms);
                    (before, buf.entries.len())
                }
                None => {
                    state
                        .buffers
                        .insert(widget.clone(), WidgetBuffer::new(capacity, max_age));
                    (0, 0)
                }
            };
            state.adjust(before, after);
            self.release_pressure(&mut state);
            before != after
        };
        debug!(widget_id = %widget, capacity, ?max_age, "Buffer reconfigured");
        if changed {
            self.inner.notifier.mark_dirty([widget]);
        }
    }

    /// Insert a batch, grouped by widget in input order.
    ///
    /// Items for widgets without a buffer are dropped. Returns the number of
    /// items accepted.
    pub fn batch_insert(&self, items: Vec<BufferItem>) -> usize {
        if items.is_empty() {
            return 0;
        }
        let batch_len = items.len();

        let mut order: Vec<WidgetId> = Vec::new();
        let mut groups: HashMap<WidgetId, Vec<Arc<BufferedMessage>>> = HashMap::new();
        for item in items {
            let group = groups.entry(item.widget_id.clone()).or_insert_with(|| {
                order.push(item.widget_id.clone());
                Vec::new()
            });
            group.push(Arc::new(item.message));
        }

        let now_ms = Utc::now().timestamp_millis();
        let mut touched: Vec<WidgetId> = Vec::with_capacity(order.len());
        let mut accepted = 0;
        let mut pruned: Vec<WidgetId> = Vec::new();
        {
            let mut state = self.inner.state.write();
            for widget in order {
                let Some(batch) = groups.remove(&widget) else {
                    continue;
                };
                let Some(buf) = state.buffers.get_mut(&widget) else {
                    debug!(widget_id = %widget, dropped = batch.len(), "No buffer for widget");
                    continue;
                };
                let before = buf.entries.len();
                accepted += batch.len();
                buf.insert(batch);
                buf.evict_expired(now_ms);
                let after = buf.entries.len();
                state.adjust(before, after);
                touched.push(widget);
            }

            self.check_soft_threshold(&mut state);
            let cfg = &self.inner.config;
            if state.total >= cfg.hard_cap && !state.under_pressure {
                warn!(total = state.total, hard_cap = cfg.hard_cap, "Buffer memory under pressure");
                state.under_pressure = true;
                Metrics::buffer_pressure(true);
            }
            if state.under_pressure
                && (batch_len >= cfg.prune_batch_threshold || state.total >= cfg.hard_cap)
            {
                pruned = self.prune_locked(&mut state);
            }
            Metrics::buffer_messages(state.total);
        }

        touched.extend(pruned);
        self.inner.notifier.mark_dirty(touched.iter());
        accepted
    }

    /// Newest entry.
    pub fn get_latest(&self, widget: &WidgetId) -> Option<Arc<BufferedMessage>> {
        self.inner
            .state
            .read()
            .buffers
            .get(widget)
            .and_then(|buf| buf.entries.back().cloned())
    }

    /// Snapshot of the whole buffer, oldest first. Empty for unknown widgets.
    pub fn get_buffer(&self, widget: &WidgetId) -> Vec<Arc<BufferedMessage>> {
        self.inner
            .state
            .read()
            .buffers
            .get(widget)
            .map(|buf| buf.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_buffer(&self, widget: &WidgetId) -> bool {
        self.inner.state.read().buffers.contains_key(widget)
    }

    pub fn buffer_len(&self, widget: &WidgetId) -> usize {
        self.inner
            .state
            .read()
            .buffers
            .get(widget)
            .map_or(0, |buf| buf.entries.len())
    }

    pub fn capacity(&self, widget: &WidgetId) -> Option<usize> {
        self.inner
            .state
            .read()
            .buffers
            .get(widget)
            .map(|buf| buf.capacity)
    }

    /// Destroy a widget's buffer. Returns `false` if none existed.
    pub fn remove_buffer(&self, widget: &WidgetId) -> bool {
        let removed = {
            let mut state = self.inner.state.write();
            match state.buffers.remove(widget) {
                Some(buf) => {
                    state.adjust(buf.entries.len(), 0);
                    self.release_pressure(&mut state);
                    Metrics::buffer_messages(state.total);
                    true
                }
                None => false,
            }
        };
        if removed {
            debug!(widget_id = %widget, "Buffer removed");
        }
        removed
    }

    /// Run a governor pass now, regardless of batch size.
    ///
    /// Returns the widgets that lost entries.
    pub fn prune(&self) -> Vec<WidgetId> {
        let pruned = {
            let mut state = self.inner.state.write();
            let pruned = self.prune_locked(&mut state);
            Metrics::buffer_messages(state.total);
            pruned
        };
        self.inner.notifier.mark_dirty(pruned.iter());
        pruned
    }

    /// Evict entries past their buffer's max age. Returns the number removed.
    pub fn prune_expired(&self, now_ms: i64) -> usize {
        let mut removed_total = 0;
        let mut touched = Vec::new();
        {
            let mut state = self.inner.state.write();
            for (widget, buf) in state.buffers.iter_mut() {
                let removed = buf.evict_expired(now_ms);
                if removed > 0 {
                    removed_total += removed;
                    touched.push(widget.clone());
                }
            }
            state.total -= removed_total.min(state.total);
            self.release_pressure(&mut state);
            Metrics::buffer_messages(state.total);
        }
        self.inner.notifier.mark_dirty(touched.iter());
        removed_total
    }

    pub fn total_messages(&self) -> usize {
        self.inner.state.read().total
    }

    pub fn is_under_pressure(&self) -> bool {
        self.inner.state.read().under_pressure
    }

    pub fn widget_count(&self) -> usize {
        self.inner.state.read().buffers.len()
    }

    /// Coalesced per-widget change notifications.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<BufferChanged> {
        self.inner.notifier.subscribe()
    }

    fn prune_locked(&self, state: &mut StoreState) -> Vec<WidgetId> {
        let cfg = &self.inner.config;
        let mut pruned = Vec::new();
        let mut removed_total = 0;
        for (widget, buf) in state.buffers.iter_mut() {
            let len = buf.entries.len();
            if len <= cfg.prune_floor {
                continue;
            }
            let remove = ((len as f64) * cfg.prune_fraction).ceil() as usize;
            buf.entries.drain(..remove.min(len));
            removed_total += remove.min(len);
            pruned.push(widget.clone());
        }
        state.total -= removed_total.min(state.total);
        info!(
            buffers = pruned.len(),
            removed = removed_total,
            total = state.total,
            "Memory governor pruned buffers"
        );
        Metrics::prune_pass();
        self.release_pressure(state);
        pruned
    }

    fn release_pressure(&self, state: &mut StoreState) {
        if state.under_pressure && state.total < self.inner.config.pressure_release() {
            info!(total = state.total, "Buffer memory pressure cleared");
            state.under_pressure = false;
            Metrics::buffer_pressure(false);
        }
    }

    fn check_soft_threshold(&self, state: &mut StoreState) {
        let soft = self.inner.config.soft_threshold;
        if state.total >= soft {
            if !state.soft_warned {
                warn!(total = state.total, soft_threshold = soft, "Buffer memory above soft threshold");
                state.soft_warned = true;
            }
        } else {
            state.soft_warned = false;
        }
    }
}
