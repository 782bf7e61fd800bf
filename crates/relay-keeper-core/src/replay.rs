//! Replay queue for retry-exhausted but still eligible requests.
//!
//! When the retry orchestrator exhausts its budget on a failure whose
//! classification is replay-eligible (system, network, rate limit), the
//! request is parked here and re-attempted asynchronously. Replay is
//! fire-and-forget: the original caller already received the terminal error,
//! and a later replay success never settles that caller a second time.
//!
//! The queue is bounded. Entries leave on successful replay, TTL expiry, or
//! capacity-driven eviction (lowest priority first, oldest within a tier).
//! Nothing here survives a process restart.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::classify::ClassifiedError;
use crate::events::{EventBus, RelayEvent};
use crate::transport::{CallOutcome, Method, TransportError};
use crate::{Priority, RequestId, ResourceKey, Timestamp};

// ============================================================================
// Replayable Request
// ============================================================================

/// A failed request parked for asynchronous re-attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayableRequest {
    /// Identifier carried over from the original request
    pub id: RequestId,

    /// Resource the call targets
    pub resource: ResourceKey,

    /// HTTP method of the original call
    pub method: Method,

    /// Original payload, if any
    pub payload: Option<serde_json::Value>,

    /// Original headers
    pub headers: HashMap<String, String>,

    /// When the request entered the replay queue
    pub enqueued_at: Timestamp,

    /// Priority inherited from the original request
    pub priority: Priority,

    /// Replay attempts made so far
    pub attempts_made: u32,

    /// Attempts after which the entry is dropped as terminal
    pub max_attempts: u32,

    /// The classified error that exhausted the synchronous retries
    pub last_error: Option<ClassifiedError>,
}

impl ReplayableRequest {
    /// Create a replay entry for a retry-exhausted call
    pub fn new(
        resource: ResourceKey,
        method: Method,
        payload: Option<serde_json::Value>,
        headers: HashMap<String, String>,
        priority: Priority,
        max_attempts: u32,
        last_error: ClassifiedError,
    ) -> Self {
        Self {
            id: RequestId::new(),
            resource,
            method,
            payload,
            headers,
            enqueued_at: Timestamp::now(),
            priority,
            attempts_made: 0,
            max_attempts,
            last_error: Some(last_error),
        }
    }

    /// Whether the entry's TTL has elapsed
    pub fn is_expired(&self, ttl: Duration) -> bool {
        Timestamp::now().duration_since(self.enqueued_at) > ttl
    }
}

/// Counters describing queue activity since construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayQueueStats {
    /// Entries currently queued
    pub queued: usize,

    /// Entries accepted since construction
    pub total_enqueued: u64,

    /// Entries that eventually replayed successfully
    pub total_replayed: u64,

    /// Entries dropped terminal after exhausting replay attempts
    pub total_failed: u64,

    /// Entries dropped by TTL expiry or capacity eviction
    pub total_dropped: u64,
}

// ============================================================================
// Replay Executor
// ============================================================================

/// Performs the actual network call for a replayed request.
///
/// Implemented by the composition layer; the queue stays transport-agnostic.
#[async_trait]
pub trait ReplayExecutor: Send + Sync {
    /// Re-issue the parked request against the remote service
    async fn replay(&self, request: &ReplayableRequest) -> Result<CallOutcome, TransportError>;
}

// ============================================================================
// Replay Queue
// ============================================================================

/// Bounded, priority-ordered queue of replayable requests with a periodic
/// drain task.
pub struct ReplayQueue {
    capacity: usize,
    ttl: Duration,
    entries: Mutex<Vec<ReplayableRequest>>,
    events: EventBus,
    stopped: AtomicBool,
    stop: Notify,
    total_enqueued: AtomicU64,
    total_replayed: AtomicU64,
    total_failed: AtomicU64,
    total_dropped: AtomicU64,
}

impl ReplayQueue {
    /// Create a queue bounded by `capacity` entries, each living at most `ttl`
    pub fn new(capacity: usize, ttl: Duration, events: EventBus) -> Self {
        Self {
            capacity,
            ttl,
            entries: Mutex::new(Vec::new()),
            events,
            stopped: AtomicBool::new(false),
            stop: Notify::new(),
            total_enqueued: AtomicU64::new(0),
            total_replayed: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
        }
    }

    /// Park a request for later replay.
    ///
    /// At capacity, the lowest-priority (oldest within a tier) entry is
    /// evicted to make room; an incoming request that is itself the lowest
    /// priority is dropped instead. Returns whether the request was accepted.
    pub fn enqueue(&self, request: ReplayableRequest) -> bool {
        let evicted = {
            let mut entries = self.entries.lock().expect("replay queue lock poisoned");

            if entries.len() < self.capacity {
                self.total_enqueued.fetch_add(1, Ordering::Relaxed);
                entries.push(request);
                return true;
            }

            let victim_index = entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| (e.priority, e.enqueued_at))
                .map(|(index, _)| index);

            match victim_index {
                Some(index) if entries[index].priority <= request.priority => {
                    let victim = entries.swap_remove(index);
                    self.total_enqueued.fetch_add(1, Ordering::Relaxed);
                    entries.push(request);
                    victim
                }
                _ => {
                    // The incoming request is the least important of the lot
                    self.total_dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(request_id = %request.id, "replay queue full, request dropped");
                    self.events.emit(RelayEvent::ReplayDropped {
                        request_id: request.id,
                        resource: request.resource,
                        reason: "capacity".to_string(),
                        timestamp: Timestamp::now(),
                    });
                    return false;
                }
            }
        };

        self.total_dropped.fetch_add(1, Ordering::Relaxed);
        debug!(request_id = %evicted.id, "replay entry evicted for capacity");
        self.events.emit(RelayEvent::ReplayDropped {
            request_id: evicted.id,
            resource: evicted.resource,
            reason: "capacity".to_string(),
            timestamp: Timestamp::now(),
        });
        true
    }

    /// Number of entries currently queued
    pub fn len(&self) -> usize {
        self.entries.lock().expect("replay queue lock poisoned").len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Activity counters since construction
    pub fn stats(&self) -> ReplayQueueStats {
        ReplayQueueStats {
            queued: self.len(),
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_replayed: self.total_replayed.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
        }
    }

    /// Run one drain cycle: expire stale entries, then replay up to
    /// `batch_size` entries in priority order, skipping resources whose
    /// circuit is currently rejecting traffic.
    pub async fn drain_cycle(
        &self,
        executor: &dyn ReplayExecutor,
        breakers: &CircuitBreakerRegistry<TransportError>,
        batch_size: usize,
    ) {
        let batch = {
            let mut entries = self.entries.lock().expect("replay queue lock poisoned");

            // TTL expiry first so stale work never consumes the batch budget
            let mut index = 0;
            while index < entries.len() {
                if entries[index].is_expired(self.ttl) {
                    let expired = entries.swap_remove(index);
                    self.total_dropped.fetch_add(1, Ordering::Relaxed);
                    self.events.emit(RelayEvent::ReplayDropped {
                        request_id: expired.id,
                        resource: expired.resource,
                        reason: "expired".to_string(),
                        timestamp: Timestamp::now(),
                    });
                } else {
                    index += 1;
                }
            }

            // Priority descending, FIFO within a tier
            entries.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.enqueued_at.cmp(&b.enqueued_at))
            });

            let mut batch = Vec::new();
            let mut index = 0;
            while index < entries.len() && batch.len() < batch_size {
                let reachable = breakers
                    .get(&entries[index].resource)
                    .map(|b| b.is_healthy())
                    .unwrap_or(true);
                if reachable {
                    batch.push(entries.remove(index));
                } else {
                    index += 1;
                }
            }
            batch
        };

        for mut request in batch {
            request.attempts_made += 1;
            let breaker = breakers.breaker_for(&request.resource);
            let result = breaker.execute(|| executor.replay(&request)).await;

            match result {
                Ok(_) => {
                    self.total_replayed.fetch_add(1, Ordering::Relaxed);
                    info!(request_id = %request.id, resource = %request.resource, "replay succeeded");
                    self.events.emit(RelayEvent::ReplaySucceeded {
                        request_id: request.id,
                        resource: request.resource,
                        attempts_made: request.attempts_made,
                        timestamp: Timestamp::now(),
                    });
                }
                Err(_) => {
                    let terminal = request.attempts_made >= request.max_attempts;
                    self.events.emit(RelayEvent::ReplayFailed {
                        request_id: request.id,
                        resource: request.resource.clone(),
                        attempts_made: request.attempts_made,
                        terminal,
                        timestamp: Timestamp::now(),
                    });

                    if terminal {
                        self.total_failed.fetch_add(1, Ordering::Relaxed);
                        warn!(request_id = %request.id, resource = %request.resource,
                            attempts = request.attempts_made, "replay attempts exhausted");
                    } else {
                        let mut entries =
                            self.entries.lock().expect("replay queue lock poisoned");
                        entries.push(request);
                    }
                }
            }
        }
    }

    /// Spawn the periodic drain task; runs until [`ReplayQueue::stop`]
    pub fn spawn_drain(
        self: &Arc<Self>,
        executor: Arc<dyn ReplayExecutor>,
        breakers: Arc<CircuitBreakerRegistry<TransportError>>,
        interval: Duration,
        batch_size: usize,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = queue.stop.notified() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if queue.stopped.load(Ordering::SeqCst) {
                    break;
                }
                queue.drain_cycle(executor.as_ref(), &breakers, batch_size).await;
            }
        })
    }

    /// Stop the drain task; queued entries are abandoned
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop.notify_waiters();
    }
}

#[cfg(test)]
#[path = "replay_tests.rs"]
mod tests;
