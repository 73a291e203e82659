//! Per-instance event fan-out with a bounded replay log
//!
//! Each primitive owns an [`EventPublisher`] for its own event payload type.
//! Publishing is synchronous on the caller's thread: every consumer runs
//! before `publish` returns, so a slow consumer slows the call it observes.
//! Consumers that need isolation must hand events off themselves.
//!
//! The last N events are also kept in a [`ConcurrentRingBuffer`] so late
//! subscribers and diagnostics can see recent history.
//!
//! # Example
//!
//! ```
//! use bulwark_core_resilience::event::{EventKind, EventPublisher};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone)]
//! enum Ping { Hello }
//!
//! impl EventKind for Ping {
//!     fn kind(&self) -> &'static str { "HELLO" }
//! }
//!
//! let publisher = EventPublisher::<Ping>::new(10);
//! let seen = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&seen);
//! publisher.subscribe(move |_| { counter.fetch_add(1, Ordering::SeqCst); });
//!
//! publisher.publish("backend", Ping::Hello);
//! assert_eq!(seen.load(Ordering::SeqCst), 1);
//! assert_eq!(publisher.recent_events().len(), 1);
//! ```

use crate::ring_buffer::ConcurrentRingBuffer;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Default number of events kept for replay
pub const DEFAULT_REPLAY_CAPACITY: usize = 100;

/// Stable, upper-case name of an event payload's variant
pub trait EventKind {
    fn kind(&self) -> &'static str;
}

/// Immutable event emitted by a named instance
#[derive(Debug, Clone)]
pub struct Event<P> {
    instance_name: Arc<str>,
    created_at: DateTime<Utc>,
    payload: P,
}

impl<P: EventKind> Event<P> {
    /// Create an event stamped with the current time
    pub fn new(instance_name: impl Into<Arc<str>>, payload: P) -> Self {
        Self {
            instance_name: instance_name.into(),
            created_at: Utc::now(),
            payload,
        }
    }

    /// Name of the instance that emitted the event
    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Wall-clock creation time
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Type-specific payload
    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Variant name of the payload
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

impl<P: EventKind + fmt::Debug> fmt::Display for Event<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: '{}' {:?}",
            self.created_at.to_rfc3339(),
            self.instance_name,
            self.payload
        )
    }
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type ConsumerFn<P> = Arc<dyn Fn(&Event<P>) + Send + Sync>;

struct Subscription<P> {
    id: SubscriptionId,
    kind: Option<&'static str>,
    consumer: ConsumerFn<P>,
}

impl<P> Clone for Subscription<P> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            kind: self.kind,
            consumer: Arc::clone(&self.consumer),
        }
    }
}

/// Synchronous pub-sub for one instance's events
pub struct EventPublisher<P> {
    subscriptions: RwLock<Vec<Subscription<P>>>,
    replay: Option<ConcurrentRingBuffer<Event<P>>>,
    next_id: AtomicU64,
}

impl<P> EventPublisher<P>
where
    P: EventKind + Clone + fmt::Debug + Send + Sync + 'static,
{
    /// Publisher that remembers the last `replay_capacity` events (0 disables replay)
    pub fn new(replay_capacity: usize) -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            replay: ConcurrentRingBuffer::new(replay_capacity).ok(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Receive every event
    pub fn subscribe(&self, consumer: impl Fn(&Event<P>) + Send + Sync + 'static) -> SubscriptionId {
        self.add(None, Arc::new(consumer))
    }

    /// Receive only events whose [`EventKind::kind`] equals `kind`
    pub fn subscribe_kind(
        &self,
        kind: &'static str,
        consumer: impl Fn(&Event<P>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.add(Some(kind), Arc::new(consumer))
    }

    fn add(&self, kind: Option<&'static str>, consumer: ConsumerFn<P>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.write().push(Subscription { id, kind, consumer });
        id
    }

    /// Remove a consumer. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Check if anyone is listening
    pub fn has_consumers(&self) -> bool {
        !self.subscriptions.read().is_empty()
    }

    /// Record the event in the replay log and deliver it to every matching consumer.
    ///
    /// A panicking consumer is logged and skipped; it never aborts the call
    /// being observed.
    pub fn publish(&self, instance_name: &str, payload: P) {
        let event = Event::new(instance_name, payload);
        if let Some(replay) = &self.replay {
            replay.insert(event.clone());
        }

        // Consumers run outside the lock so they may subscribe/unsubscribe.
        let subs: Vec<Subscription<P>> = self.subscriptions.read().clone();
        if subs.is_empty() {
            debug!(kind = event.kind(), instance = instance_name, "no consumers for event");
            return;
        }
        for sub in subs.iter().filter(|s| s.kind.map_or(true, |k| k == event.kind())) {
            let consumer = Arc::clone(&sub.consumer);
            if catch_unwind(AssertUnwindSafe(|| consumer(&event))).is_err() {
                warn!(
                    kind = event.kind(),
                    instance = instance_name,
                    "event consumer panicked"
                );
            }
        }
    }

    /// Recent events, oldest first
    pub fn recent_events(&self) -> Vec<Event<P>> {
        self.replay
            .as_ref()
            .map(|r| r.snapshot())
            .unwrap_or_default()
    }
}

impl<P> Default for EventPublisher<P>
where
    P: EventKind + Clone + fmt::Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_CAPACITY)
    }
}

impl<P> fmt::Debug for EventPublisher<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPublisher")
            .field("consumers", &self.subscriptions.read().len())
            .field("replay_capacity", &self.replay.as_ref().map(|r| r.capacity()))
            .finish()
    }
}
