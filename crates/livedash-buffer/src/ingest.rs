//! Tick-batched ingestion from subscription pumps.

use crate::notify::TickScheduler;
use crate::store::BufferStore;
use livedash_core::{BufferItem, MessageSink};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

/// Accumulates delivered items and inserts them into the store as one batch
/// per tick.
pub struct IngestQueue {
    store: BufferStore,
    scheduler: Arc<dyn TickScheduler>,
    pending: Mutex<Vec<BufferItem>>,
    armed: AtomicBool,
    weak_self: Weak<IngestQueue>,
}

impl IngestQueue {
    pub fn new(store: BufferStore, scheduler: Arc<dyn TickScheduler>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            store,
            scheduler,
            pending: Mutex::new(Vec::new()),
            armed: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Insert everything queued so far. Returns the number of items accepted
    /// by the store.
    pub fn flush_now(&self) -> usize {
        self.armed.store(false, Ordering::Release);
        let items = std::mem::take(&mut *self.pending.lock());
        if items.is_empty() {
            return 0;
        }
        trace!(items = items.len(), "Flushing ingest queue");
        self.store.batch_insert(items)
    }
}

impl MessageSink for IngestQueue {
    fn deliver(&self, items: Vec<BufferItem>) {
        if items.is_empty() {
            return;
        }
        self.pending.lock().extend(items);
        if !self.armed.swap(true, Ordering::AcqRel) {
            let weak = self.weak_self.clone();
            self.scheduler.schedule(Box::new(move || {
                if let Some(queue) = weak.upgrade() {
                    queue.flush_now();
                }
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferConfig;
    use crate::notify::ManualScheduler;
    use bytes::Bytes;
    use livedash_core::{BufferedMessage, WidgetId};
    use serde_json::json;

    fn item(widget: &str, n: i64) -> BufferItem {
        BufferItem::new(
            WidgetId::new(widget),
            BufferedMessage::new(json!(n), Bytes::new(), "s"),
        )
    }

    #[test]
    fn test_deliveries_batched_until_tick() {
        let scheduler = Arc::new(ManualScheduler::new());
        let store = BufferStore::new(BufferConfig::default(), scheduler.clone());
        store.initialize(&WidgetId::new("w"), 3, None);
        let queue = IngestQueue::new(store.clone(), scheduler.clone());

        for n in 0..5 {
            queue.deliver(vec![item("w", n)]);
        }
        assert_eq!(queue.pending(), 5);
        assert_eq!(store.total_messages(), 0);

        // Ingest tick, then the change-notification tick it arms.
        assert_eq!(scheduler.flush(), 2);
        assert_eq!(queue.pending(), 0);
        let values: Vec<i64> = store
            .get_buffer(&WidgetId::new("w"))
            .iter()
            .filter_map(|m| m.value.as_i64())
            .collect();
        assert_eq!(values, vec![2, 3, 4]);
    }

    #[test]
    fn test_empty_delivery_does_not_arm() {
        let scheduler = Arc::new(ManualScheduler::new());
        let store = BufferStore::new(BufferConfig::default(), scheduler.clone());
        let queue = IngestQueue::new(store, scheduler.clone());
        queue.deliver(Vec::new());
        assert_eq!(scheduler.pending(), 0);
    }
}
