//! Coalesced change notification.
//!
//! Buffer writes mark widgets dirty; a single tick is armed on the host's
//! [`TickScheduler`], and when it fires every dirty widget is announced once.
//! A burst of inserts within one tick therefore costs one notification per
//! widget, not one per message.

use crate::error::{BufferError, BufferResult};
use livedash_core::WidgetId;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::trace;

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Deferred unit of work run on the next tick.
pub type Tick = Box<dyn FnOnce() + Send + 'static>;

/// Host-supplied "run this on the next frame" hook.
pub trait TickScheduler: Send + Sync {
    fn schedule(&self, tick: Tick);
}

/// Scheduler that runs ticks only when flushed.
#[derive(Default)]
pub struct ManualScheduler {
    pending: Mutex<Vec<Tick>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Run pending ticks, including ticks they schedule, until none remain.
    /// Returns the number of ticks run.
    pub fn flush(&self) -> usize {
        let mut ran = 0;
        loop {
            let ticks = std::mem::take(&mut *self.pending.lock());
            if ticks.is_empty() {
                return ran;
            }
            for tick in ticks {
                tick();
                ran += 1;
            }
        }
    }
}

impl TickScheduler for ManualScheduler {
    fn schedule(&self, tick: Tick) {
        self.pending.lock().push(tick);
    }
}

/// Scheduler that runs each tick after a fixed interval on the tokio runtime.
pub struct TokioTickScheduler {
    interval: Duration,
    runtime: tokio::runtime::Handle,
}

impl TokioTickScheduler {
    /// Must be called from within a tokio runtime.
    pub fn new(interval: Duration) -> BufferResult<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BufferError::NoRuntime)?;
        Ok(Self { interval, runtime })
    }
}

impl TickScheduler for TokioTickScheduler {
    fn schedule(&self, tick: Tick) {
        let interval = self.interval;
        self.runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            tick();
        });
    }
}

/// A widget's buffer changed since the last tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferChanged {
    pub widget_id: WidgetId,
}

/// Collects dirty widgets and announces them once per tick.
pub struct CoalescingNotifier {
    scheduler: Arc<dyn TickScheduler>,
    dirty: Mutex<BTreeSet<WidgetId>>,
    armed: AtomicBool,
    tx: broadcast::Sender<BufferChanged>,
    weak_self: Weak<CoalescingNotifier>,
}

impl CoalescingNotifier {
    pub fn new(scheduler: Arc<dyn TickScheduler>) -> Arc<Self> {
        let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Arc::new_cyclic(|weak_self| Self {
            scheduler,
            dirty: Mutex::new(BTreeSet::new()),
            armed: AtomicBool::new(false),
            tx,
            weak_self: weak_self.clone(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BufferChanged> {
        self.tx.subscribe()
    }

    pub fn mark_dirty<'a>(&self, widgets: impl IntoIterator<Item = &'a WidgetId>) {
        {
            let mut dirty = self.dirty.lock();
            for widget in widgets {
                dirty.insert(widget.clone());
            }
            if dirty.is_empty() {
                return;
            }
        }
        if !self.armed.swap(true, Ordering::AcqRel) {
            let weak = self.weak_self.clone();
            self.scheduler.schedule(Box::new(move || {
                if let Some(notifier) = weak.upgrade() {
                    notifier.fire();
                }
            }));
        }
    }

    fn fire(&self) {
        // Disarm first so marks made while announcing arm a fresh tick.
        self.armed.store(false, Ordering::Release);
        let dirty = std::mem::take(&mut *self.dirty.lock());
        trace!(widgets = dirty.len(), "Announcing buffer changes");
        for widget_id in dirty {
            let _ = self.tx.send(BufferChanged { widget_id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_notification_per_widget_per_tick() {
        let scheduler = Arc::new(ManualScheduler::new());
        let notifier = CoalescingNotifier::new(scheduler.clone());
        let mut rx = notifier.subscribe();

        let a = WidgetId::new("a");
        let b = WidgetId::new("b");
        for _ in 0..50 {
            notifier.mark_dirty([&a, &b]);
        }
        assert_eq!(scheduler.pending(), 1);
        assert_eq!(scheduler.flush(), 1);

        assert_eq!(rx.try_recv().unwrap().widget_id, a);
        assert_eq!(rx.try_recv().unwrap().widget_id, b);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_rearms_after_fire() {
        let scheduler = Arc::new(ManualScheduler::new());
        let notifier = CoalescingNotifier::new(scheduler.clone());
        let mut rx = notifier.subscribe();
        let a = WidgetId::new("a");

        notifier.mark_dirty([&a]);
        scheduler.flush();
        notifier.mark_dirty([&a]);
        assert_eq!(scheduler.pending(), 1);
        scheduler.flush();

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_empty_mark_does_not_arm() {
        let scheduler = Arc::new(ManualScheduler::new());
        let notifier = CoalescingNotifier::new(scheduler.clone());
        notifier.mark_dirty(std::iter::empty());
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_tokio_scheduler_requires_runtime() {
        assert!(matches!(
            TokioTickScheduler::new(Duration::from_millis(5)),
            Err(BufferError::NoRuntime)
        ));
        tokio_test::block_on(async {
            assert!(TokioTickScheduler::new(Duration::from_millis(5)).is_ok());
        });
    }

    #[tokio::test]
    async fn test_tokio_scheduler_fires_after_interval() {
        let scheduler = Arc::new(TokioTickScheduler::new(Duration::from_millis(5)).unwrap());
        let notifier = CoalescingNotifier::new(scheduler);
        let mut rx = notifier.subscribe();
        notifier.mark_dirty([&WidgetId::new("w")]);

        let changed = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(changed.widget_id.as_str(), "w");
    }
}
