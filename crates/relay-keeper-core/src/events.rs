//! Observable events with an explicit observer registry.
//!
//! Components publish structured [`RelayEvent`]s through an [`EventBus`];
//! consumers register [`EventSink`]s with deterministic subscribe/unsubscribe
//! semantics. There is no implicit global emitter: each composed system owns
//! exactly one bus and hands clones to its components.
//!
//! Sinks must be best-effort: a sink must never panic or block, and sink
//! failures never affect request processing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::classify::{ErrorKind, Severity};
use crate::{Priority, RequestId, ResourceKey, Timestamp, ZoneId};

// ============================================================================
// Event Payloads
// ============================================================================

/// Structured notification emitted by the reliability layer.
///
/// Every variant carries identifiers, a timestamp, and the counts an external
/// logging/monitoring collaborator needs to act without querying back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RelayEvent {
    /// A request was admitted to the queue
    RequestQueued {
        request_id: RequestId,
        resource: ResourceKey,
        priority: Priority,
        queue_depth: usize,
        timestamp: Timestamp,
    },

    /// A request left the queue for execution
    RequestDequeued {
        request_id: RequestId,
        resource: ResourceKey,
        waited_ms: u64,
        timestamp: Timestamp,
    },

    /// A queued request's deadline elapsed before execution
    RequestExpired {
        request_id: RequestId,
        resource: ResourceKey,
        waited_ms: u64,
        timestamp: Timestamp,
    },

    /// A circuit breaker transitioned to Open
    CircuitOpened {
        name: String,
        failure_count: u32,
        timestamp: Timestamp,
    },

    /// A circuit breaker transitioned to Half-Open
    CircuitHalfOpen { name: String, timestamp: Timestamp },

    /// A circuit breaker transitioned to Closed
    CircuitClosed { name: String, timestamp: Timestamp },

    /// A circuit breaker was administratively reset
    CircuitReset { name: String, timestamp: Timestamp },

    /// An open circuit rejected a call without invoking it
    CircuitRejected { name: String, timestamp: Timestamp },

    /// A replayed request finally succeeded
    ReplaySucceeded {
        request_id: RequestId,
        resource: ResourceKey,
        attempts_made: u32,
        timestamp: Timestamp,
    },

    /// A replayed request failed; `terminal` when attempts are exhausted
    ReplayFailed {
        request_id: RequestId,
        resource: ResourceKey,
        attempts_made: u32,
        terminal: bool,
        timestamp: Timestamp,
    },

    /// A replayable request was dropped (TTL expiry or capacity eviction)
    ReplayDropped {
        request_id: RequestId,
        resource: ResourceKey,
        reason: String,
        timestamp: Timestamp,
    },

    /// A zone's health assessment changed
    HealthUpdated {
        zone: ZoneId,
        is_healthy: bool,
        consecutive_failures: u32,
        timestamp: Timestamp,
    },

    /// The system-wide degradation mode changed
    DegradationChanged {
        from: String,
        to: String,
        queue_utilization: f64,
        error_rate: f64,
        timestamp: Timestamp,
    },

    /// Periodic metrics rollup
    MetricsUpdated {
        total_requests: u64,
        successful_requests: u64,
        failed_requests: u64,
        queue_depth: usize,
        timestamp: Timestamp,
    },

    /// An error kind crossed its escalation threshold
    EscalationDetected {
        kind: ErrorKind,
        occurrences: usize,
        max_severity: Severity,
        timestamp: Timestamp,
    },
}

impl RelayEvent {
    /// Short stable name for logs and metrics labels
    pub fn name(&self) -> &'static str {
        match self {
            Self::RequestQueued { .. } => "request_queued",
            Self::RequestDequeued { .. } => "request_dequeued",
            Self::RequestExpired { .. } => "request_expired",
            Self::CircuitOpened { .. } => "circuit_opened",
            Self::CircuitHalfOpen { .. } => "circuit_half_open",
            Self::CircuitClosed { .. } => "circuit_closed",
            Self::CircuitReset { .. } => "circuit_reset",
            Self::CircuitRejected { .. } => "circuit_rejected",
            Self::ReplaySucceeded { .. } => "replay_succeeded",
            Self::ReplayFailed { .. } => "replay_failed",
            Self::ReplayDropped { .. } => "replay_dropped",
            Self::HealthUpdated { .. } => "health_updated",
            Self::DegradationChanged { .. } => "degradation_changed",
            Self::MetricsUpdated { .. } => "metrics_updated",
            Self::EscalationDetected { .. } => "escalation_detected",
        }
    }
}

// ============================================================================
// Event Sink
// ============================================================================

/// Consumer of relay events.
///
/// # Best-Effort Pattern
///
/// Sinks are called synchronously on the emitting path and must return
/// quickly; anything expensive belongs behind a channel owned by the sink.
pub trait EventSink: Send + Sync {
    /// Handle one event
    fn on_event(&self, event: &RelayEvent);
}

/// Sink that discards every event; useful in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn on_event(&self, _event: &RelayEvent) {
        // No-op
    }
}

/// Sink that forwards events to `tracing` with structured fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn on_event(&self, event: &RelayEvent) {
        match event {
            RelayEvent::CircuitOpened { name, failure_count, .. } => {
                warn!(circuit = %name, failures = failure_count, "circuit opened");
            }
            RelayEvent::CircuitClosed { name, .. } => {
                info!(circuit = %name, "circuit closed");
            }
            RelayEvent::DegradationChanged { from, to, queue_utilization, error_rate, .. } => {
                warn!(
                    %from,
                    %to,
                    queue_utilization,
                    error_rate,
                    "degradation mode changed"
                );
            }
            RelayEvent::EscalationDetected { kind, occurrences, .. } => {
                warn!(kind = %kind, occurrences, "error escalation detected");
            }
            RelayEvent::RequestExpired { request_id, resource, waited_ms, .. } => {
                warn!(%request_id, %resource, waited_ms, "queued request expired");
            }
            other => {
                debug!(event = other.name(), "relay event");
            }
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Token returned by [`EventBus::subscribe`]; used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Registry of event sinks with deterministic subscription order.
///
/// Cloning the bus yields a handle to the same registry. Sinks are invoked in
/// ascending subscription order.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

#[derive(Default)]
struct EventBusInner {
    sinks: RwLock<BTreeMap<SubscriptionId, Arc<dyn EventSink>>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink; the returned token unsubscribes it
    pub fn subscribe(&self, sink: Arc<dyn EventSink>) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        self.inner
            .sinks
            .write()
            .expect("event bus lock poisoned")
            .insert(id, sink);
        id
    }

    /// Remove a sink; returns whether it was registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner
            .sinks
            .write()
            .expect("event bus lock poisoned")
            .remove(&id)
            .is_some()
    }

    /// Deliver an event to every registered sink.
    ///
    /// Sinks registered or removed during delivery take effect from the next
    /// emit; delivery works on a snapshot.
    pub fn emit(&self, event: RelayEvent) {
        let sinks: Vec<Arc<dyn EventSink>> = {
            let guard = self.inner.sinks.read().expect("event bus lock poisoned");
            guard.values().cloned().collect()
        };
        for sink in sinks {
            sink.on_event(&event);
        }
    }

    /// Number of registered sinks
    pub fn sink_count(&self) -> usize {
        self.inner
            .sinks
            .read()
            .expect("event bus lock poisoned")
            .len()
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
