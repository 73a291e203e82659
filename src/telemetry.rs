/*!
 * Event telemetry for the resilience primitives
 *
 * Subscribes to instance event publishers and re-emits every event as a
 * structured `tracing` event under the `bulwark::events` target, with a JSON
 * rendering of the event for log shippers.
 */

use crate::settings::Registries;
use bulwark_core_resilience::event::{Event, EventKind, EventPublisher, SubscriptionId};
use bulwark_core_resilience::registry::{Registry, RegistryEvent};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Telemetry record for JSON serialization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Primitive family, e.g. `circuit_breaker`
    pub primitive: String,
    /// Instance name
    pub name: String,
    /// Event kind, e.g. `STATE_TRANSITION`
    pub kind: String,
    /// RFC 3339 creation time
    pub timestamp: String,
    /// Debug rendering of the payload
    pub detail: String,
}

impl TelemetryRecord {
    /// Convert a published event into a record
    pub fn from_event<P: EventKind + Debug>(primitive: &str, event: &Event<P>) -> Self {
        Self {
            primitive: primitive.to_string(),
            name: event.instance_name().to_string(),
            kind: event.kind().to_string(),
            timestamp: event.created_at().to_rfc3339(),
            detail: format!("{:?}", event.payload()),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
    }
}

/// Forwards resilience events to `tracing`
#[derive(Debug, Clone, Copy)]
pub struct TracingEventLogger {
    primitive: &'static str,
}

impl TracingEventLogger {
    pub fn new(primitive: &'static str) -> Self {
        Self { primitive }
    }

    /// Subscribe to every event of `publisher`
    pub fn attach<P>(&self, publisher: &EventPublisher<P>) -> SubscriptionId
    where
        P: EventKind + Clone + Debug + Send + Sync + 'static,
    {
        let primitive = self.primitive;
        publisher.subscribe(move |event| emit(primitive, event))
    }

    /// Attach to every instance already in `registry` and to every instance
    /// added later
    pub fn attach_registry<T, C, P>(
        &self,
        registry: &Registry<T, C>,
        events_of: fn(&T) -> &EventPublisher<P>,
    ) -> SubscriptionId
    where
        T: Debug + Send + Sync + 'static,
        C: Clone + Send + Sync + 'static,
        P: EventKind + Clone + Debug + Send + Sync + 'static,
    {
        for instance in registry.all() {
            self.attach(events_of(&instance));
        }
        let logger = *self;
        registry.event_publisher().subscribe(move |event: &Event<RegistryEvent<T>>| {
            match event.payload() {
                RegistryEvent::EntryAdded { entry } => {
                    logger.attach(events_of(entry));
                }
                RegistryEvent::EntryReplaced { new, .. } => {
                    logger.attach(events_of(new));
                }
                RegistryEvent::EntryRemoved { .. } => {}
            }
        })
    }
}

fn emit<P: EventKind + Debug>(primitive: &str, event: &Event<P>) {
    let record = TelemetryRecord::from_event(primitive, event);
    tracing::info!(
        target: "bulwark::events",
        primitive = %record.primitive,
        name = %record.name,
        kind = %record.kind,
        json = %record.to_json(),
        "resilience event"
    );
}

/// Log the events of every instance in `registries`, now and later
pub fn attach_all(registries: &Registries) {
    TracingEventLogger::new("circuit_breaker")
        .attach_registry(&registries.circuit_breakers, |cb| cb.event_publisher());
    TracingEventLogger::new("rate_limiter")
        .attach_registry(&registries.rate_limiters, |rl| rl.event_publisher());
    TracingEventLogger::new("bulkhead").attach_registry(&registries.bulkheads, |b| b.event_publisher());
    TracingEventLogger::new("retry").attach_registry(&registries.retries, |r| r.event_publisher());
}
