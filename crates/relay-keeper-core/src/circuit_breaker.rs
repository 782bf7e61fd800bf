//! Per-resource circuit breakers and their owning registry.
//!
//! Implements the circuit breaker pattern to protect against cascading
//! failures in the remote service.
//!
//! # Circuit Breaker States
//!
//! - **Closed**: Normal operation, requests pass through
//! - **Open**: Resource is failing, requests are rejected immediately
//! - **Half-Open**: Testing recovery, limited trial requests allowed
//!
//! # Transitions
//!
//! - Closed → Open when failures within the monitoring window reach the
//!   threshold (a reclose-then-reopen additionally waits out the minimum
//!   transition cooldown, so the circuit cannot flap)
//! - Open → Half-Open once the recovery timeout elapses
//! - Half-Open → Closed after the configured number of successes
//! - Half-Open → Open immediately on any counted failure
//!
//! Whether an error counts as a failure is decided by an injectable
//! predicate; business rejections (4xx) normally do not trip the breaker.
//!
//! Rejections in the open state are counted separately from failures: a
//! short-circuited call never invoked the operation.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use thiserror::Error;

use crate::config::CircuitBreakerConfig;
use crate::events::{EventBus, RelayEvent};
use crate::{ResourceKey, Timestamp};

// ============================================================================
// Circuit State
// ============================================================================

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Circuit is closed, allowing requests through
    Closed,

    /// Circuit is open, rejecting all requests
    Open,

    /// Circuit is half-open, allowing limited trial requests
    HalfOpen,
}

impl CircuitState {
    /// Check if requests are allowed in the current state
    pub fn allows_requests(&self) -> bool {
        matches!(self, Self::Closed | Self::HalfOpen)
    }

    /// Get string representation for logs and metrics labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Defensive snapshot of one breaker's state and counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    /// Breaker name (usually the resource key)
    pub name: String,

    /// Current state
    pub state: CircuitState,

    /// Failures currently inside the monitoring window
    pub failure_count: u32,

    /// Consecutive successes in half-open
    pub success_count: u32,

    /// When the last counted failure happened
    pub last_failure_time: Option<Timestamp>,

    /// When the last success happened
    pub last_success_time: Option<Timestamp>,

    /// Timestamps of the failures inside the monitoring window
    pub recent_failures: Vec<Timestamp>,

    /// When an open circuit next allows a trial; set only while open
    pub next_attempt_time: Option<Timestamp>,

    /// Total requests the breaker evaluated
    pub total_requests: u64,

    /// Requests that succeeded
    pub successful_requests: u64,

    /// Requests counted as failures
    pub failed_requests: u64,

    /// Requests rejected without invoking the operation
    pub rejected_requests: u64,
}

// ============================================================================
// Error
// ============================================================================

/// Errors surfaced by circuit breaker execution.
///
/// Wraps operation errors and adds circuit-protection failures; the two are
/// distinguishable so callers can tell "known-bad service" from "this call
/// failed".
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open; the operation was never invoked.
    #[error("Circuit breaker is open; next attempt at {retry_at:?}")]
    CircuitOpen { retry_at: Option<Timestamp> },

    /// Too many concurrent trial requests in half-open state.
    #[error("Too many concurrent requests in half-open state")]
    TooManyConcurrentRequests,

    /// The operation was invoked and failed.
    #[error("Operation failed: {0}")]
    OperationFailed(E),

    /// Breaker internal error (lock poisoning).
    #[error("Circuit breaker internal error: {message}")]
    Internal { message: String },
}

impl<E> CircuitBreakerError<E> {
    /// Check if the error is due to circuit protection rather than the
    /// operation itself
    pub fn is_circuit_protection(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::TooManyConcurrentRequests
        )
    }
}

// ============================================================================
// Internal State
// ============================================================================

/// Failure predicate: decides whether an error counts against the circuit.
pub type FailurePredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

#[derive(Debug)]
struct InternalState {
    state: CircuitState,

    /// Counted failures inside the monitoring window
    recent_failures: VecDeque<(Instant, Timestamp)>,

    /// Consecutive successes while half-open
    success_count: u32,

    /// Trial requests currently in flight while half-open
    half_open_in_flight: u32,

    last_failure_time: Option<Timestamp>,
    last_success_time: Option<Timestamp>,

    /// Set on every state transition; `None` until the first one
    last_transition: Option<Instant>,

    /// Set only while open
    next_attempt: Option<(Instant, Timestamp)>,

    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    rejected_requests: u64,
}

impl InternalState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            recent_failures: VecDeque::new(),
            success_count: 0,
            half_open_in_flight: 0,
            last_failure_time: None,
            last_success_time: None,
            last_transition: None,
            next_attempt: None,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            rejected_requests: 0,
        }
    }

    fn prune_window(&mut self, window: std::time::Duration) {
        let now = Instant::now();
        while let Some((instant, _)) = self.recent_failures.front() {
            if now.duration_since(*instant) > window {
                self.recent_failures.pop_front();
            } else {
                break;
            }
        }
    }
}

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Per-resource failure-isolation state machine.
///
/// Generic over the operation error type; each instance has a single logical
/// owner (the registry) and is internally linearizable via its mutex.
pub struct CircuitBreaker<E> {
    config: CircuitBreakerConfig,
    is_failure: FailurePredicate<E>,
    state: Mutex<InternalState>,
    events: EventBus,
}

impl<E> CircuitBreaker<E> {
    /// Create a breaker that counts every error as a failure
    pub fn new(config: CircuitBreakerConfig, events: EventBus) -> Self {
        Self::with_predicate(config, events, Arc::new(|_| true))
    }

    /// Create a breaker with an injectable failure predicate
    pub fn with_predicate(
        config: CircuitBreakerConfig,
        events: EventBus,
        is_failure: FailurePredicate<E>,
    ) -> Self {
        Self {
            config,
            is_failure,
            state: Mutex::new(InternalState::new()),
            events,
        }
    }

    /// Execute an operation under circuit protection.
    ///
    /// - **Closed**: invoke, count the classified outcome
    /// - **Open, cooldown elapsed**: transition to half-open and invoke as a
    ///   trial
    /// - **Open, cooldown pending**: reject without invoking (counted as
    ///   *rejected*, not *failed*)
    /// - **Half-Open**: invoke while trial slots remain, else reject
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.admit()?;

        let result = operation().await;

        match result {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                let counted = (self.is_failure)(&error);
                if counted {
                    self.record_failure();
                } else {
                    self.record_uncounted_error();
                }
                Err(CircuitBreakerError::OperationFailed(error))
            }
        }
    }

    /// Gate one call; reserves a half-open trial slot when applicable.
    fn admit(&self) -> Result<(), CircuitBreakerError<E>> {
        let mut pending_events = Vec::new();
        let outcome = {
            let mut state = self.lock()?;

            match state.state {
                CircuitState::Closed => Ok(()),
                CircuitState::Open => {
                    let elapsed = state
                        .next_attempt
                        .map(|(instant, _)| Instant::now() >= instant)
                        .unwrap_or(false);
                    if elapsed {
                        self.transition_to_half_open(&mut state, &mut pending_events);
                        state.half_open_in_flight += 1;
                        Ok(())
                    } else {
                        state.rejected_requests += 1;
                        let retry_at = state.next_attempt.map(|(_, ts)| ts);
                        pending_events.push(RelayEvent::CircuitRejected {
                            name: self.config.name.clone(),
                            timestamp: Timestamp::now(),
                        });
                        Err(CircuitBreakerError::CircuitOpen { retry_at })
                    }
                }
                CircuitState::HalfOpen => {
                    if state.half_open_in_flight >= self.config.half_open_max_requests {
                        state.rejected_requests += 1;
                        Err(CircuitBreakerError::TooManyConcurrentRequests)
                    } else {
                        state.half_open_in_flight += 1;
                        Ok(())
                    }
                }
            }
        };
        self.flush(pending_events);
        outcome
    }

    /// Record a success observed outside `execute` (externally-run call)
    pub fn record_success(&self) {
        let mut pending_events = Vec::new();
        if let Ok(mut state) = self.lock() {
            let now = Timestamp::now();
            state.total_requests += 1;
            state.successful_requests += 1;
            state.last_success_time = Some(now);

            match state.state {
                CircuitState::Closed => {}
                CircuitState::HalfOpen => {
                    state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
                    state.success_count += 1;
                    if state.success_count >= self.config.success_threshold {
                        self.close_circuit(&mut state, &mut pending_events);
                    }
                }
                CircuitState::Open => {
                    state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
                }
            }
        }
        self.flush(pending_events);
    }

    /// Record a counted failure observed outside `execute`
    pub fn record_failure(&self) {
        let mut pending_events = Vec::new();
        if let Ok(mut state) = self.lock() {
            let now = Timestamp::now();
            state.total_requests += 1;
            state.failed_requests += 1;
            state.last_failure_time = Some(now);
            state.recent_failures.push_back((Instant::now(), now));
            state.prune_window(self.config.failure_window);

            match state.state {
                CircuitState::Closed => {
                    let window_failures = state.recent_failures.len() as u32;
                    if window_failures >= self.config.failure_threshold
                        && self.cooldown_elapsed(&state)
                    {
                        self.trip_circuit(&mut state, &mut pending_events);
                    }
                }
                CircuitState::HalfOpen => {
                    // Any counted failure during a trial reopens immediately
                    state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
                    self.trip_circuit(&mut state, &mut pending_events);
                }
                CircuitState::Open => {
                    state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
                }
            }
        }
        self.flush(pending_events);
    }

    /// Record an error the predicate declined to count.
    ///
    /// The call completed as far as the circuit is concerned: a half-open
    /// trial slot is released and the success path of the state machine runs,
    /// but the success counter is not advanced toward closing.
    fn record_uncounted_error(&self) {
        if let Ok(mut state) = self.lock() {
            state.total_requests += 1;
            if state.state != CircuitState::Closed {
                state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
            }
        }
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        self.state
            .lock()
            .map(|state| state.state)
            // Fail-safe: treat lock poisoning as open
            .unwrap_or(CircuitState::Open)
    }

    /// Defensive snapshot of state and counters
    pub fn snapshot(&self) -> BreakerSnapshot {
        match self.lock() {
            Ok(mut state) => {
                state.prune_window(self.config.failure_window);
                BreakerSnapshot {
                    name: self.config.name.clone(),
                    state: state.state,
                    failure_count: state.recent_failures.len() as u32,
                    success_count: state.success_count,
                    last_failure_time: state.last_failure_time,
                    last_success_time: state.last_success_time,
                    recent_failures: state.recent_failures.iter().map(|(_, ts)| *ts).collect(),
                    next_attempt_time: state.next_attempt.map(|(_, ts)| ts),
                    total_requests: state.total_requests,
                    successful_requests: state.successful_requests,
                    failed_requests: state.failed_requests,
                    rejected_requests: state.rejected_requests,
                }
            }
            Err(_) => BreakerSnapshot {
                name: self.config.name.clone(),
                state: CircuitState::Open,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
                last_success_time: None,
                recent_failures: Vec::new(),
                next_attempt_time: None,
                total_requests: 0,
                successful_requests: 0,
                failed_requests: 0,
                rejected_requests: 0,
            },
        }
    }

    /// Force the circuit back to closed and clear all counters (admin
    /// operation)
    pub fn reset(&self) {
        if let Ok(mut state) = self.lock() {
            *state = InternalState::new();
        }
        self.events.emit(RelayEvent::CircuitReset {
            name: self.config.name.clone(),
            timestamp: Timestamp::now(),
        });
    }

    /// Check if the breaker currently allows requests
    pub fn is_healthy(&self) -> bool {
        self.state().allows_requests()
    }

    /// Breaker name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    // --- transitions -------------------------------------------------------

    /// A reclose-then-reopen must wait out the minimum transition interval.
    /// The first trip of a fresh breaker is never gated.
    fn cooldown_elapsed(&self, state: &InternalState) -> bool {
        match state.last_transition {
            Some(at) => at.elapsed() >= self.config.min_transition_interval,
            None => true,
        }
    }

    fn trip_circuit(&self, state: &mut InternalState, pending: &mut Vec<RelayEvent>) {
        let failure_count = state.recent_failures.len() as u32;
        state.state = CircuitState::Open;
        state.last_transition = Some(Instant::now());
        state.next_attempt = Some((
            Instant::now() + self.config.recovery_timeout,
            Timestamp::now().add_duration(self.config.recovery_timeout),
        ));
        state.success_count = 0;
        pending.push(RelayEvent::CircuitOpened {
            name: self.config.name.clone(),
            failure_count,
            timestamp: Timestamp::now(),
        });
    }

    fn transition_to_half_open(&self, state: &mut InternalState, pending: &mut Vec<RelayEvent>) {
        state.state = CircuitState::HalfOpen;
        state.last_transition = Some(Instant::now());
        state.next_attempt = None;
        // Success counter resets on entry to half-open
        state.success_count = 0;
        state.half_open_in_flight = 0;
        pending.push(RelayEvent::CircuitHalfOpen {
            name: self.config.name.clone(),
            timestamp: Timestamp::now(),
        });
    }

    fn close_circuit(&self, state: &mut InternalState, pending: &mut Vec<RelayEvent>) {
        state.state = CircuitState::Closed;
        state.last_transition = Some(Instant::now());
        state.next_attempt = None;
        // Failure window resets on entry to closed
        state.recent_failures.clear();
        state.success_count = 0;
        state.half_open_in_flight = 0;
        pending.push(RelayEvent::CircuitClosed {
            name: self.config.name.clone(),
            timestamp: Timestamp::now(),
        });
    }

    // --- plumbing ----------------------------------------------------------

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, InternalState>, CircuitBreakerError<E>> {
        self.state
            .lock()
            .map_err(|e| CircuitBreakerError::Internal {
                message: format!("Failed to acquire state lock: {}", e),
            })
    }

    /// Emit deferred events outside the state lock.
    fn flush(&self, pending: Vec<RelayEvent>) {
        for event in pending {
            self.events.emit(event);
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Single owning registry of breakers keyed by resource.
///
/// Call sites never hold raw shared breaker state; they get an `Arc` to a
/// breaker whose interior is independently synchronized, so cross-resource
/// operations never serialize on one global lock.
pub struct CircuitBreakerRegistry<E> {
    template: CircuitBreakerConfig,
    is_failure: FailurePredicate<E>,
    events: EventBus,
    breakers: RwLock<HashMap<ResourceKey, Arc<CircuitBreaker<E>>>>,
}

impl<E> CircuitBreakerRegistry<E> {
    /// Create a registry stamping new breakers from a config template.
    ///
    /// The template's `name` is replaced with the resource key.
    pub fn new(
        template: CircuitBreakerConfig,
        events: EventBus,
        is_failure: FailurePredicate<E>,
    ) -> Self {
        Self {
            template,
            is_failure,
            events,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the breaker for a resource, creating it on first use
    pub fn breaker_for(&self, resource: &ResourceKey) -> Arc<CircuitBreaker<E>> {
        if let Some(existing) = self
            .breakers
            .read()
            .expect("registry lock poisoned")
            .get(resource)
        {
            return Arc::clone(existing);
        }

        let mut breakers = self.breakers.write().expect("registry lock poisoned");
        Arc::clone(breakers.entry(resource.clone()).or_insert_with(|| {
            let config = CircuitBreakerConfig {
                name: resource.to_string(),
                ..self.template.clone()
            };
            Arc::new(CircuitBreaker::with_predicate(
                config,
                self.events.clone(),
                Arc::clone(&self.is_failure),
            ))
        }))
    }

    /// Fetch the breaker for a resource without creating it
    pub fn get(&self, resource: &ResourceKey) -> Option<Arc<CircuitBreaker<E>>> {
        self.breakers
            .read()
            .expect("registry lock poisoned")
            .get(resource)
            .cloned()
    }

    /// Snapshot every registered breaker
    pub fn snapshot_all(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker<E>>> = {
            let guard = self.breakers.read().expect("registry lock poisoned");
            guard.values().cloned().collect()
        };
        breakers.iter().map(|b| b.snapshot()).collect()
    }

    /// Reset every registered breaker (admin operation)
    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker<E>>> = {
            let guard = self.breakers.read().expect("registry lock poisoned");
            guard.values().cloned().collect()
        };
        for breaker in breakers {
            breaker.reset();
        }
    }
}

#[cfg(test)]
#[path = "circuit_breaker_tests.rs"]
mod tests;
