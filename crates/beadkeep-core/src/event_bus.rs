//! In-process publish/subscribe with two delivery modes: synchronous
//! callbacks keyed by event type, and long-lived bounded stream
//! subscribers with drop-oldest backpressure. Table mutations are
//! serialized by a single mutex that is released before any callback
//! runs or any stream is pushed to, matching the concurrency contract
//! that callbacks must never run while holding the table lock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, warn};

use crate::types::Event;

/// Per-subscriber stream capacity. A full queue drops the oldest event to
/// admit the newest, per the design's backpressure policy.
pub const STREAM_CAPACITY: usize = 100;

/// Quiet-period after which a stream subscriber should be served a
/// heartbeat instead of blocking indefinitely.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

struct CallbackEntry {
    id: u64,
    callback: Callback,
}

struct StreamState {
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    closed: std::sync::atomic::AtomicBool,
}

#[derive(Debug, Clone)]
pub enum StreamItem {
    Event(Event),
    /// Emitted when `next` times out with nothing queued; lets a
    /// subscriber detect a dead peer without blocking forever.
    Heartbeat,
    Closed,
}

impl PartialEq for StreamItem {
    fn eq(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (StreamItem::Heartbeat, StreamItem::Heartbeat) | (StreamItem::Closed, StreamItem::Closed)
        )
    }
}

/// A handle to one open stream. Cloning is cheap; all clones observe the
/// same underlying queue.
#[derive(Clone)]
pub struct StreamHandle {
    id: u64,
    state: Arc<StreamState>,
}

impl StreamHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits up to `timeout` for the next event. Returns `Heartbeat` on
    /// timeout with an empty queue, and `Closed` once the stream has been
    /// explicitly closed and drained.
    pub async fn next(&self, timeout: Duration) -> StreamItem {
        loop {
            {
                let mut q = self.state.queue.lock().unwrap();
                if let Some(ev) = q.pop_front() {
                    return StreamItem::Event(ev);
                }
            }
            if self.state.closed.load(Ordering::SeqCst) {
                return StreamItem::Closed;
            }
            match tokio::time::timeout(timeout, self.state.notify.notified()).await {
                Ok(()) => continue,
                Err(_) => return StreamItem::Heartbeat,
            }
        }
    }

    pub fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct Tables {
    callbacks: HashMap<String, Vec<CallbackEntry>>,
    streams: HashMap<u64, Arc<StreamState>>,
}

pub struct EventBus {
    tables: Mutex<Tables>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a callback for `event_type`, returning an id usable with
    /// [`EventBus::unsubscribe`].
    pub fn subscribe(
        &self,
        event_type: impl Into<String>,
        callback: impl Fn(&Event) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut tables = self.tables.lock().unwrap();
        tables
            .callbacks
            .entry(event_type.into())
            .or_default()
            .push(CallbackEntry {
                id,
                callback: Arc::new(callback),
            });
        id
    }

    pub fn unsubscribe(&self, event_type: &str, id: u64) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(list) = tables.callbacks.get_mut(event_type) {
            list.retain(|entry| entry.id != id);
        }
    }

    /// Opens a new bounded stream. `client_id` is accepted for parity with
    /// the design's contract and future diagnostics; streams are keyed
    /// internally by a monotonic id.
    pub fn open_stream(&self, _client_id: &str) -> StreamHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(StreamState {
            queue: Mutex::new(VecDeque::with_capacity(STREAM_CAPACITY)),
            notify: Notify::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
        });
        self.tables
            .lock()
            .unwrap()
            .streams
            .insert(id, state.clone());
        StreamHandle { id, state }
    }

    pub fn close_stream(&self, id: u64) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(state) = tables.streams.remove(&id) {
            state.closed.store(true, Ordering::SeqCst);
            state.notify.notify_waiters();
        }
    }

    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.tables
            .lock()
            .unwrap()
            .callbacks
            .get(event_type)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    pub fn stream_count(&self) -> usize {
        self.tables.lock().unwrap().streams.len()
    }

    /// Delivers synchronously to registered callbacks for this event's
    /// type, then enqueues into every open stream (drop-oldest on a full
    /// queue). Table snapshots are taken under the lock and released
    /// before any callback runs or any stream is pushed to.
    pub fn emit(&self, event: Event) {
        let (callbacks, streams) = {
            let tables = self.tables.lock().unwrap();
            let callbacks = tables
                .callbacks
                .get(event.kind.as_str())
                .map(|v| v.iter().map(|e| e.callback.clone()).collect::<Vec<_>>())
                .unwrap_or_default();
            let streams: Vec<Arc<StreamState>> = tables.streams.values().cloned().collect();
            (callbacks, streams)
        };

        for cb in callbacks {
            let event_ref = &event;
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(event_ref)));
            if let Err(panic) = result {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "callback panicked".to_string());
                error!(error = %msg, "event bus callback failed");
            }
        }

        for stream in streams {
            let mut q = stream.queue.lock().unwrap();
            if q.len() >= STREAM_CAPACITY {
                q.pop_front();
                warn!("stream queue full, dropping oldest event");
            }
            q.push_back(event.clone());
            drop(q);
            stream.notify.notify_waiters();
        }
    }

    pub fn emit_typed(&self, kind: crate::types::EventKind, data: serde_json::Value) {
        self.emit(Event::new(kind, data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventKind;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn callback_receives_matching_events_only() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        bus.subscribe("board:update", move |_ev| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit_typed(EventKind::BoardUpdate, serde_json::json!({}));
        bus.emit_typed(EventKind::ClaudeOutput, serde_json::json!({}));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let id = bus.subscribe("board:update", move |_ev| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        bus.unsubscribe("board:update", id);
        bus.emit_typed(EventKind::BoardUpdate, serde_json::json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_callback_does_not_block_others() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        bus.subscribe("board:update", |_ev| panic!("boom"));
        bus.subscribe("board:update", move |_ev| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit_typed(EventKind::BoardUpdate, serde_json::json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stream_delivers_events_in_order() {
        let bus = EventBus::new();
        let handle = bus.open_stream("client-1");
        bus.emit_typed(EventKind::ClaudeOutput, serde_json::json!({"n": 1}));
        bus.emit_typed(EventKind::ClaudeOutput, serde_json::json!({"n": 2}));

        let first = handle.next(Duration::from_millis(50)).await;
        let second = handle.next(Duration::from_millis(50)).await;
        match (first, second) {
            (StreamItem::Event(a), StreamItem::Event(b)) => {
                assert_eq!(a.data["n"], 1);
                assert_eq!(b.data["n"], 2);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn backpressure_drops_oldest_beyond_capacity() {
        let bus = EventBus::new();
        let handle = bus.open_stream("slow-client");
        for i in 0..250 {
            bus.emit_typed(EventKind::ClaudeOutput, serde_json::json!({"n": i}));
        }
        assert_eq!(handle.len(), STREAM_CAPACITY);

        let mut seen = Vec::new();
        for _ in 0..STREAM_CAPACITY {
            if let StreamItem::Event(ev) = handle.next(Duration::from_millis(10)).await {
                seen.push(ev.data["n"].as_i64().unwrap());
            }
        }
        assert_eq!(seen.first().copied(), Some(150));
        assert_eq!(seen.last().copied(), Some(249));
    }

    #[tokio::test]
    async fn empty_stream_yields_heartbeat_on_timeout() {
        let bus = EventBus::new();
        let handle = bus.open_stream("quiet-client");
        let item = handle.next(Duration::from_millis(20)).await;
        assert_eq!(item, StreamItem::Heartbeat);
    }

    #[tokio::test]
    async fn closed_stream_returns_closed_sentinel() {
        let bus = EventBus::new();
        let handle = bus.open_stream("c");
        handle.close();
        let item = handle.next(Duration::from_millis(20)).await;
        assert_eq!(item, StreamItem::Closed);
    }
}
