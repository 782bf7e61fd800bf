//! Classified retry with exponential backoff, deduplication, and replay
//! handoff.
//!
//! [`RetryOrchestrator::execute_with_retry`] wraps one call inside the
//! resource's circuit breaker. Failures are classified once at the boundary;
//! non-retryable kinds (auth, validation, business) fail immediately with
//! zero retries, retryable kinds back off exponentially with jitter and a
//! learned per-resource adjustment. When retries are exhausted on a
//! replay-eligible kind, the request is parked on the replay queue and the
//! terminal error is still raised to the caller.
//!
//! Concurrent calls sharing the same `(method, resource)` key are
//! deduplicated: one leader performs the call, every other caller observes
//! the leader's outcome.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::circuit_breaker::{CircuitBreakerError, CircuitBreakerRegistry, FailurePredicate};
use crate::classify::{ClassifiedError, ErrorClassifier, ErrorContext, ErrorKind};
use crate::config::RetryConfig;
use crate::monitoring::MetricsCollector;
use crate::replay::{ReplayQueue, ReplayableRequest};
use crate::transport::{CallOutcome, CallRequest, Method, TransportError};
use crate::{Priority, RelayError, RelayResult, ResourceKey};

// ============================================================================
// Retry Policy
// ============================================================================

/// Exponential backoff math with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,

    /// Hard cap on any computed delay
    pub max_delay: Duration,

    /// Backoff multiplier (e.g. 2.0 for doubling)
    pub backoff_multiplier: f64,

    /// Jitter as a fraction of the computed delay (0.25 ⇒ ±25%)
    pub jitter_factor: f64,
}

impl RetryPolicy {
    /// Build the policy from the orchestrator's configuration
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            backoff_multiplier: config.backoff_multiplier,
            jitter_factor: config.jitter_factor,
        }
    }

    /// Deterministic backoff for a 1-based retry attempt: no jitter, no
    /// learned adjustment. Monotonically non-decreasing, capped at
    /// `max_delay`.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let multiplier = self.backoff_multiplier.powi(attempt as i32 - 1);
        let delay_ms = (self.base_delay.as_millis() as f64 * multiplier) as u64;
        Duration::from_millis(delay_ms).min(self.max_delay)
    }

    /// Full delay for a retry: server retry-after when the classification
    /// carries one, otherwise exponential backoff plus the learned
    /// adjustment; jitter applied last.
    pub fn delay_for(
        &self,
        attempt: u32,
        classified: &ClassifiedError,
        learned_adjustment: Duration,
    ) -> Duration {
        let base = match classified.retry_after() {
            Some(server_delay) => server_delay,
            None => (self.raw_delay(attempt) + learned_adjustment).min(self.max_delay),
        };
        self.apply_jitter(base)
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.jitter_factor <= 0.0 {
            return delay;
        }
        use rand::Rng;
        let span = self.jitter_factor.min(1.0);
        let factor = rand::thread_rng().gen_range(1.0 - span..=1.0 + span);
        Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
    }
}

// ============================================================================
// Failure Predicate
// ============================================================================

/// Breaker failure predicate for service health.
///
/// Server errors, network failures, and timeouts count against the breaker;
/// rate limiting and client errors do not, since they say nothing about the
/// service being down.
pub fn service_failure_predicate() -> FailurePredicate<TransportError> {
    Arc::new(|error: &TransportError| match error.http_status() {
        Some(status) => status >= 500,
        None => true,
    })
}

// ============================================================================
// Retry Orchestrator
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    method: Method,
    resource: ResourceKey,
}

type SharedOutcome = Result<CallOutcome, RelayError>;

/// Wraps calls in classified retry/backoff behind per-resource breakers.
pub struct RetryOrchestrator {
    config: RetryConfig,
    policy: RetryPolicy,
    classifier: ErrorClassifier,
    breakers: Arc<CircuitBreakerRegistry<TransportError>>,
    replay: Arc<ReplayQueue>,
    metrics: Arc<dyn MetricsCollector>,
    learned: Mutex<HashMap<(ResourceKey, ErrorKind), f64>>,
    in_flight: Mutex<HashMap<DedupKey, Vec<oneshot::Sender<SharedOutcome>>>>,
}

impl RetryOrchestrator {
    /// EMA weight for the learned delay adjustment
    const LEARNED_ALPHA: f64 = 0.3;

    /// Create an orchestrator over shared breaker and replay state
    pub fn new(
        config: RetryConfig,
        breakers: Arc<CircuitBreakerRegistry<TransportError>>,
        replay: Arc<ReplayQueue>,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Self {
        Self {
            policy: RetryPolicy::from_config(&config),
            config,
            classifier: ErrorClassifier::new(),
            breakers,
            replay,
            metrics,
            learned: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// The breaker registry this orchestrator feeds
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry<TransportError>> {
        &self.breakers
    }

    /// The replay queue receiving retry-exhausted eligible failures
    pub fn replay_queue(&self) -> &Arc<ReplayQueue> {
        &self.replay
    }

    /// Execute one call with classified retry under circuit protection.
    ///
    /// Concurrent callers sharing this request's `(method, resource)` key
    /// join the in-flight execution instead of issuing their own call.
    pub async fn execute_with_retry<F, Fut>(
        &self,
        request: &CallRequest,
        priority: Priority,
        op: F,
    ) -> RelayResult<CallOutcome>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<CallOutcome, TransportError>>,
    {
        let key = DedupKey {
            method: request.method,
            resource: request.resource.clone(),
        };

        // Join an in-flight execution when one exists; otherwise become the
        // leader for this key.
        let rx = {
            let mut in_flight = self.in_flight.lock().expect("dedup lock poisoned");
            match in_flight.get_mut(&key) {
                Some(followers) => {
                    let (tx, rx) = oneshot::channel();
                    followers.push(tx);
                    Some(rx)
                }
                None => {
                    in_flight.insert(key.clone(), Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = rx {
            trace!(resource = %request.resource, "joined in-flight execution");
            return match rx.await {
                Ok(outcome) => outcome,
                // Leader vanished without settling (cancelled mid-flight)
                Err(_) => Err(RelayError::Shutdown),
            };
        }

        let result = self.run_attempts(request, priority, op).await;

        // Settle every follower with a clone of the shared outcome
        let followers = self
            .in_flight
            .lock()
            .expect("dedup lock poisoned")
            .remove(&key)
            .unwrap_or_default();
        for follower in followers {
            let _ = follower.send(result.clone());
        }

        result
    }

    /// The retry loop proper, executed only by the dedup leader.
    async fn run_attempts<F, Fut>(
        &self,
        request: &CallRequest,
        priority: Priority,
        op: F,
    ) -> RelayResult<CallOutcome>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<CallOutcome, TransportError>>,
    {
        let breaker = self.breakers.breaker_for(&request.resource);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            match breaker.execute(&op).await {
                Ok(outcome) => {
                    self.decay_learned(&request.resource);
                    return Ok(outcome);
                }
                Err(CircuitBreakerError::CircuitOpen { retry_at }) => {
                    debug!(resource = %request.resource, "call short-circuited, breaker open");
                    return Err(RelayError::CircuitOpen {
                        resource: request.resource.clone(),
                        retry_at,
                    });
                }
                Err(CircuitBreakerError::TooManyConcurrentRequests) => {
                    return Err(RelayError::CircuitOpen {
                        resource: request.resource.clone(),
                        retry_at: None,
                    });
                }
                Err(CircuitBreakerError::Internal { message }) => {
                    let synthetic = TransportError::Network { message };
                    let context = ErrorContext {
                        resource: Some(request.resource.clone()),
                        attempt,
                    };
                    return Err(RelayError::Classified(
                        self.classifier.classify(&synthetic, &context),
                    ));
                }
                Err(CircuitBreakerError::OperationFailed(transport_error)) => {
                    let context = ErrorContext {
                        resource: Some(request.resource.clone()),
                        attempt,
                    };
                    let classified = self.classifier.classify(&transport_error, &context);

                    if !classified.retryable {
                        debug!(resource = %request.resource, code = %classified.code,
                            "non-retryable failure, no retries attempted");
                        return Err(RelayError::Classified(classified));
                    }

                    if attempt > self.config.max_retries {
                        return Err(self.exhausted(request, priority, classified));
                    }

                    let learned = self.learned_adjustment(&request.resource, classified.kind);
                    let delay = self.policy.delay_for(attempt, &classified, learned);
                    self.record_failure_delay(&request.resource, classified.kind, delay);
                    self.metrics.record_retry_attempt(&request.resource.to_string());

                    debug!(resource = %request.resource, attempt, delay_ms = delay.as_millis() as u64,
                        code = %classified.code, "retrying after backoff");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Retries exhausted: hand replay-eligible failures to the replay queue,
    /// then raise the terminal error either way.
    fn exhausted(
        &self,
        request: &CallRequest,
        priority: Priority,
        classified: ClassifiedError,
    ) -> RelayError {
        if self.config.enable_request_replay && classified.kind.is_replay_eligible() {
            let entry = ReplayableRequest::new(
                request.resource.clone(),
                request.method,
                request.payload.clone(),
                request.headers.clone(),
                priority,
                self.config.max_retries.max(1),
                classified.clone(),
            );
            let request_id = entry.id;
            if self.replay.enqueue(entry) {
                debug!(%request_id, resource = %request.resource, "request parked for replay");
            }
        } else {
            warn!(resource = %request.resource, code = %classified.code,
                attempts = classified.attempts, "retries exhausted");
        }

        RelayError::Classified(classified)
    }

    // --- learned delay adjustment ------------------------------------------

    fn learned_adjustment(&self, resource: &ResourceKey, kind: ErrorKind) -> Duration {
        let learned = self.learned.lock().expect("learned lock poisoned");
        learned
            .get(&(resource.clone(), kind))
            .map(|ms| Duration::from_millis(*ms as u64))
            .unwrap_or(Duration::ZERO)
    }

    /// Pull the adjustment toward the delay that was just insufficient
    fn record_failure_delay(&self, resource: &ResourceKey, kind: ErrorKind, delay: Duration) {
        let ceiling = self.config.max_delay.as_millis() as f64 / 2.0;
        let mut learned = self.learned.lock().expect("learned lock poisoned");
        let entry = learned.entry((resource.clone(), kind)).or_insert(0.0);
        let observed = delay.as_millis() as f64;
        *entry = (Self::LEARNED_ALPHA * observed + (1.0 - Self::LEARNED_ALPHA) * *entry)
            .clamp(0.0, ceiling);
    }

    /// Successful call: decay every adjustment for the resource toward zero
    fn decay_learned(&self, resource: &ResourceKey) {
        let mut learned = self.learned.lock().expect("learned lock poisoned");
        for ((entry_resource, _), value) in learned.iter_mut() {
            if entry_resource == resource {
                *value *= 1.0 - Self::LEARNED_ALPHA;
            }
        }
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
