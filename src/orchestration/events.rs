//! Synchronous publish/subscribe channel for status and streaming events.
//!
//! [`EventBus::emit`] calls every handler registered at the moment of emission,
//! in subscription order, on the emitting thread. Nothing is persisted or
//! replayed: a handler subscribed after an emission never sees it. Handlers
//! must be fast and non-blocking since a slow handler delays the emitter.
//! Consumers with thread affinity (a UI) must marshal events themselves.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};

use super::types::WorkerId;

/// Kind of an orchestration event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MasterThinking,
    MasterText,
    MasterToolCall,
    MasterToolResult,
    MasterDone,
    MasterError,

    WorkerSpawned,
    WorkerStarted,
    WorkerText,
    WorkerToolCall,
    WorkerDone,
    WorkerError,
    WorkerCancelled,
    WorkerTerminated,
    WorkerCleared,

    DelegationStarted,
    DelegationCompleted,
    DelegationChained,
    DelegationFailed,

    StatusUpdate,
}

impl EventKind {
    /// True for the event that ends a worker run (exactly one per run).
    pub fn is_worker_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::WorkerDone | EventKind::WorkerError | EventKind::WorkerCancelled
        )
    }
}

/// Which part of the federation produced an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Master,
    Worker,
    Federation,
}

/// An ephemeral event delivered to current subscribers.
#[derive(Clone, Debug, Serialize)]
pub struct Event {
    /// Emission sequence number, assigned by the bus.
    pub seq: u64,
    pub timestamp: String,
    pub kind: EventKind,
    pub source: EventSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    pub payload: Value,
}

impl Event {
    fn new(kind: EventKind, source: EventSource, worker_id: Option<WorkerId>, payload: Value) -> Self {
        Self {
            seq: 0,
            timestamp: Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            kind,
            source,
            worker_id,
            payload,
        }
    }

    pub fn master(kind: EventKind, payload: Value) -> Self {
        Self::new(kind, EventSource::Master, None, payload)
    }

    pub fn worker(kind: EventKind, worker_id: &str, payload: Value) -> Self {
        Self::new(kind, EventSource::Worker, Some(worker_id.to_string()), payload)
    }

    pub fn federation(kind: EventKind, worker_id: Option<&str>, payload: Value) -> Self {
        Self::new(kind, EventSource::Federation, worker_id.map(str::to_string), payload)
    }

    pub fn master_text(text: &str) -> Self {
        Self::master(EventKind::MasterText, json!({ "text": text }))
    }

    pub fn worker_text(worker_id: &str, text: &str) -> Self {
        Self::worker(EventKind::WorkerText, worker_id, json!({ "text": text }))
    }

    pub fn status_update(message: &str) -> Self {
        Self::federation(EventKind::StatusUpdate, None, json!({ "message": message }))
    }

    /// Convenience accessor for string fields of the payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Token returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct BusInner {
    handlers: Mutex<Vec<(SubscriptionToken, Handler)>>,
    next_token: AtomicU64,
    next_seq: AtomicU64,
}

/// Cheaply cloneable handle to the shared event channel.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                handlers: Mutex::new(Vec::new()),
                next_token: AtomicU64::new(1),
                next_seq: AtomicU64::new(1),
            }),
        }
    }

    fn handlers(&self) -> MutexGuard<'_, Vec<(SubscriptionToken, Handler)>> {
        self.inner.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler; it receives every event emitted from now on.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionToken
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let token = SubscriptionToken(self.inner.next_token.fetch_add(1, Ordering::Relaxed));
        self.handlers().push((token, Arc::new(handler)));
        token
    }

    /// Remove a handler. Returns `false` if the token was unknown.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut handlers = self.handlers();
        let before = handlers.len();
        handlers.retain(|(t, _)| *t != token);
        handlers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers().len()
    }

    /// Deliver an event to all current subscribers, in subscription order.
    ///
    /// The handler list is snapshotted first and the lock released, so a
    /// handler may itself subscribe or unsubscribe. A panicking handler is
    /// logged and skipped; the remaining handlers still receive the event.
    /// Returns the number of handlers that completed normally.
    pub fn emit(&self, mut event: Event) -> usize {
        event.seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let snapshot: Vec<Handler> = self.handlers().iter().map(|(_, h)| h.clone()).collect();

        let mut delivered = 0;
        for handler in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    tracing::error!(kind = ?event.kind, seq = event.seq, "Event handler panicked");
                }
            }
        }
        delivered
    }
}

/// Bounded, chronological buffer of recent events for the presentation layer.
///
/// Subscribes itself on creation; the oldest events are dropped once
/// `capacity` is reached.
#[derive(Clone)]
pub struct EventFeed {
    buffer: Arc<Mutex<VecDeque<Event>>>,
    token: SubscriptionToken,
}

impl EventFeed {
    pub fn attach(bus: &EventBus, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let buffer = Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024))));
        let sink = buffer.clone();
        let token = bus.subscribe(move |event| {
            let mut buf = sink.lock().unwrap_or_else(PoisonError::into_inner);
            if buf.len() == capacity {
                buf.pop_front();
            }
            buf.push_back(event.clone());
        });
        Self { buffer, token }
    }

    pub fn token(&self) -> SubscriptionToken {
        self.token
    }

    /// All buffered events, oldest first.
    pub fn snapshot(&self) -> Vec<Event> {
        let buf = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buf.iter().cloned().collect()
    }

    /// The last `n` buffered events, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Event> {
        let buf = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let start = buf.len().saturating_sub(n);
        buf.iter().skip(start).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(bus: &EventBus) -> (Arc<Mutex<Vec<String>>>, SubscriptionToken) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let token = bus.subscribe(move |e| {
            sink.lock().unwrap().push(e.payload_str("text").unwrap_or_default().to_string());
        });
        (seen, token)
    }

    #[test]
    fn emit_delivers_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            bus.subscribe(move |_| order.lock().unwrap().push(i));
        }

        assert_eq!(bus.emit(Event::master_text("x")), 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn late_subscriber_does_not_see_earlier_events() {
        let bus = EventBus::new();
        bus.emit(Event::master_text("before"));
        let (seen, _) = recorder(&bus);
        bus.emit(Event::master_text("after"));

        assert_eq!(*seen.lock().unwrap(), vec!["after"]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (seen, token) = recorder(&bus);
        bus.emit(Event::master_text("one"));
        assert!(bus.unsubscribe(token));
        assert!(!bus.unsubscribe(token));
        bus.emit(Event::master_text("two"));

        assert_eq!(*seen.lock().unwrap(), vec!["one"]);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn panicking_handler_does_not_block_others() {
        let bus = EventBus::new();
        bus.subscribe(|_| panic!("boom"));
        let (seen, _) = recorder(&bus);

        assert_eq!(bus.emit(Event::master_text("still here")), 1);
        assert_eq!(*seen.lock().unwrap(), vec!["still here"]);
    }

    #[test]
    fn handler_may_subscribe_during_emit() {
        let bus = EventBus::new();
        let inner_bus = bus.clone();
        bus.subscribe(move |_| {
            inner_bus.subscribe(|_| {});
        });

        bus.emit(Event::status_update("grow"));
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn sequence_numbers_increase() {
        let bus = EventBus::new();
        let seqs = Arc::new(Mutex::new(Vec::new()));
        let sink = seqs.clone();
        bus.subscribe(move |e| sink.lock().unwrap().push(e.seq));

        bus.emit(Event::status_update("a"));
        bus.emit(Event::status_update("b"));
        let seqs = seqs.lock().unwrap();
        assert!(seqs[0] < seqs[1]);
    }

    #[test]
    fn event_feed_is_bounded_and_chronological() {
        let bus = EventBus::new();
        let feed = EventFeed::attach(&bus, 3);
        for i in 0..5 {
            bus.emit(Event::master_text(&format!("m{i}")));
        }

        let texts: Vec<String> = feed
            .snapshot()
            .iter()
            .map(|e| e.payload_str("text").unwrap().to_string())
            .collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
        assert_eq!(feed.recent(1)[0].payload_str("text"), Some("m4"));
    }
}
