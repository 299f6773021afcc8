// =============================================================================
// Event Bus — "series updated" notifications for snapshot consumers
// =============================================================================
//
// Single logical channel: the orchestrator publishes a compact SeriesUpdated
// descriptor after every cache update; consumers either register a callback
// or poll `consume_series_changed`. Publishing dedups against the previous
// event so redundant snapshots cost nothing downstream.
//
// Callbacks run synchronously in registration order while the bus lock is
// held; they must not call back into the bus.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::types::{TimestampMs, UiDataState};

/// Compact descriptor of the latest published series.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesUpdated {
    pub first_open: TimestampMs,
    pub last_open: TimestampMs,
    pub count: usize,
    pub last_closed: bool,
    /// Fast non-cryptographic hash over the trailing candles; lets consumers
    /// detect tail-only changes when count and range are identical.
    pub tail_hash: Option<u64>,
    pub state: UiDataState,
    /// True while a live gap repair is in flight for the published key.
    pub live_gap: bool,
}

type SeriesCallback = Box<dyn Fn(&SeriesUpdated) + Send + Sync>;

struct Listener {
    id: u64,
    callback: SeriesCallback,
}

#[derive(Default)]
struct BusInner {
    listeners: Vec<Listener>,
    last_event: Option<SeriesUpdated>,
    next_id: u64,
}

#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
    series_changed: AtomicBool,
}

/// RAII subscription handle; unregisters its callback on drop.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked on every non-duplicate publish. The
    /// returned handle keeps the registration alive.
    pub fn subscribe_series_updated(
        self: &Arc<Self>,
        callback: impl Fn(&SeriesUpdated) + Send + Sync + 'static,
    ) -> Subscription {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.listeners.push(Listener {
            id,
            callback: Box::new(callback),
        });
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock();
        inner.listeners.retain(|l| l.id != id);
    }

    /// Publish an event. Identical back-to-back payloads are suppressed;
    /// otherwise the changed flag is set and callbacks run in registration
    /// order.
    pub fn publish_series_updated(&self, event: &SeriesUpdated) {
        let mut inner = self.inner.lock();
        if inner.last_event.as_ref() == Some(event) {
            return;
        }

        inner.last_event = Some(event.clone());
        self.series_changed.store(true, Ordering::Release);

        for listener in &inner.listeners {
            (listener.callback)(event);
        }
    }

    /// Test-and-clear for polling consumers.
    pub fn consume_series_changed(&self) -> bool {
        self.series_changed.swap(false, Ordering::AcqRel)
    }

    /// Drop all listeners and forget the last event.
    pub fn clear_all(&self) {
        let mut inner = self.inner.lock();
        inner.listeners.clear();
        inner.last_event = None;
        self.series_changed.store(false, Ordering::Release);
    }
}

// =============================================================================
// Tests
// =============================================================================
