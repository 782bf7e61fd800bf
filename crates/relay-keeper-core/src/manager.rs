//! Top-level reliability façade.
//!
//! [`ReliabilityManager`] composes the rate limiter, retry orchestrator,
//! circuit breakers, replay queue, and zone registry into one request
//! pipeline, and adds what none of them do alone: priority admission with a
//! bounded queue, read batching, load shedding, and a derived system-health
//! state machine.
//!
//! Every accepted request carries an absolute deadline and is settled exactly
//! once — with a result, a classified error, a timeout, or a shutdown notice —
//! even if it is never dequeued.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{BreakerSnapshot, CircuitBreakerRegistry, CircuitState};
use crate::classify::ErrorHistory;
use crate::config::{RateLimiterConfig, ReliabilityConfig, RetryConfig, ZoneManagerConfig};
use crate::events::{EventBus, RelayEvent};
use crate::monitoring::MetricsCollector;
use crate::rate_limiter::{RateLimitError, RateLimiter, RateLimiterSnapshot, RequestOutcome};
use crate::replay::{ReplayExecutor, ReplayQueue, ReplayQueueStats, ReplayableRequest};
use crate::retry::{service_failure_predicate, RetryOrchestrator};
use crate::transport::{CallOutcome, CallRequest, Method, Transport, TransportError};
use crate::zones::{SelectionCriteria, ZoneManager};
use crate::{Priority, RelayError, RelayResult, RequestId, ResourceKey, Timestamp};

// ============================================================================
// System Health
// ============================================================================

/// Derived health of the whole pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemHealth {
    /// Metrics within configured thresholds
    Healthy,

    /// Queue utilization, error rate, or response time crossed a degradation
    /// threshold; batching is tightened
    Degraded,

    /// Queue utilization crossed the load-shedding threshold; low-priority
    /// work is rejected at admission
    Critical,
}

impl SystemHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for SystemHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Snapshots
// ============================================================================

/// Defensive snapshot of the admission queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatistics {
    /// Requests currently queued
    pub depth: usize,

    /// Queue capacity
    pub capacity: usize,

    /// `depth / capacity`
    pub utilization: f64,

    /// Queued requests per priority value
    pub by_priority: HashMap<u8, usize>,

    /// Wait of the longest-queued request in milliseconds
    pub oldest_wait_ms: u64,
}

/// Defensive snapshot of pipeline-wide metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub shed_requests: u64,
    pub expired_requests: u64,

    /// Smoothed error rate (0.0 to 1.0)
    pub error_rate: f64,

    /// Smoothed end-to-end response time in milliseconds
    pub average_response_time_ms: f64,

    /// Current admission queue depth
    pub queue_depth: usize,

    /// Rolling-window quota usage fraction
    pub quota_usage: f64,

    /// Zones currently able to take traffic
    pub healthy_zones: usize,

    /// Current derived health
    pub system_health: SystemHealth,
}

// ============================================================================
// Internal State
// ============================================================================

struct QueuedRequest {
    id: RequestId,
    request: CallRequest,
    priority: Priority,
    enqueued: Instant,
    deadline: Instant,
    responder: oneshot::Sender<RelayResult<CallOutcome>>,
}

struct QueueState {
    queue: Vec<QueuedRequest>,
    health: SystemHealth,
    batch_size: usize,
    batch_timeout: Duration,
    shedding: bool,
}

#[derive(Default)]
struct RollingStats {
    response_time_ema: f64,
    error_rate_ema: f64,
}

/// Replays parked requests straight through the injected transport.
struct TransportReplayExecutor {
    transport: Arc<dyn Transport>,
}

#[async_trait]
impl ReplayExecutor for TransportReplayExecutor {
    async fn replay(&self, request: &ReplayableRequest) -> Result<CallOutcome, TransportError> {
        let mut call = CallRequest::new(request.resource.clone(), request.method);
        if let Some(payload) = &request.payload {
            call = call.with_payload(payload.clone());
        }
        for (name, value) in &request.headers {
            call = call.with_header(name.clone(), value.clone());
        }
        self.transport.send(&call).await
    }
}

// ============================================================================
// Reliability Manager
// ============================================================================

/// Composed request pipeline with admission control.
pub struct ReliabilityManager {
    config: ReliabilityConfig,
    rate_limiter: Arc<RateLimiter>,
    retry: Arc<RetryOrchestrator>,
    breakers: Arc<CircuitBreakerRegistry<TransportError>>,
    replay: Arc<ReplayQueue>,
    zones: Arc<ZoneManager>,
    transport: Arc<dyn Transport>,
    events: EventBus,
    metrics: Arc<dyn MetricsCollector>,

    state: Mutex<QueueState>,
    stats: Mutex<RollingStats>,
    history: Mutex<ErrorHistory>,

    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    shed_requests: AtomicU64,
    expired_requests: AtomicU64,

    dispatch_wake: Notify,
    stopped: AtomicBool,
    stop: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReliabilityManager {
    /// EMA weight for response-time and error-rate smoothing
    const STATS_ALPHA: f64 = 0.1;

    /// Replay drain cadence and per-cycle batch budget
    const REPLAY_DRAIN_INTERVAL: Duration = Duration::from_secs(5);
    const REPLAY_DRAIN_BATCH: usize = 10;

    /// Metrics rollup cadence
    const METRICS_INTERVAL: Duration = Duration::from_secs(10);

    /// History window and per-kind record cap for escalation tracking
    const HISTORY_WINDOW: Duration = Duration::from_secs(300);
    const HISTORY_RECORDS: usize = 100;

    /// Build the full pipeline over an injected transport.
    ///
    /// Spawns the rate limiter's pump immediately; the dispatcher, health
    /// probes, replay drain, and metrics rollup start with
    /// [`ReliabilityManager::start`].
    pub fn new(
        config: ReliabilityConfig,
        rate_config: RateLimiterConfig,
        retry_config: RetryConfig,
        zone_config: ZoneManagerConfig,
        transport: Arc<dyn Transport>,
        events: EventBus,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Arc<Self> {
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            retry_config.breaker_config("resource"),
            events.clone(),
            service_failure_predicate(),
        ));
        let replay = Arc::new(ReplayQueue::new(
            retry_config.replay_queue_size,
            retry_config.replay_timeout,
            events.clone(),
        ));
        let retry = Arc::new(RetryOrchestrator::new(
            retry_config,
            Arc::clone(&breakers),
            Arc::clone(&replay),
            Arc::clone(&metrics),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(rate_config));
        let zones = Arc::new(ZoneManager::new(zone_config, events.clone()));

        Arc::new(Self {
            state: Mutex::new(QueueState {
                queue: Vec::new(),
                health: SystemHealth::Healthy,
                batch_size: config.batch_size,
                batch_timeout: config.batch_timeout,
                shedding: false,
            }),
            config,
            rate_limiter,
            retry,
            breakers,
            replay,
            zones,
            transport,
            events,
            metrics,
            stats: Mutex::new(RollingStats::default()),
            history: Mutex::new(ErrorHistory::new(
                Self::HISTORY_WINDOW,
                Self::HISTORY_RECORDS,
            )),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            shed_requests: AtomicU64::new(0),
            expired_requests: AtomicU64::new(0),
            dispatch_wake: Notify::new(),
            stopped: AtomicBool::new(false),
            stop: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the background tasks: dispatcher, zone health probes, replay
    /// drain, and metrics rollup
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().expect("task list lock poisoned");

        let dispatcher = Arc::clone(self);
        tasks.push(tokio::spawn(async move { dispatcher.dispatch_loop().await }));

        tasks.push(self.zones.spawn_health_checks(Arc::clone(&self.transport)));

        let executor: Arc<dyn ReplayExecutor> = Arc::new(TransportReplayExecutor {
            transport: Arc::clone(&self.transport),
        });
        tasks.push(self.replay.spawn_drain(
            executor,
            Arc::clone(&self.breakers),
            Self::REPLAY_DRAIN_INTERVAL,
            Self::REPLAY_DRAIN_BATCH,
        ));

        let rollup = Arc::clone(self);
        tasks.push(tokio::spawn(async move { rollup.metrics_loop().await }));

        info!("reliability manager started");
    }

    // ------------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------------

    /// Queue a request for dispatch and wait for its settlement.
    ///
    /// Admission applies load shedding (never to critical resources or
    /// top-priority work) and a bounded queue with emergency eviction of
    /// expired entries. Accepted requests settle exactly once within their
    /// deadline.
    pub async fn queue_request(
        &self,
        request: CallRequest,
        priority: Priority,
    ) -> RelayResult<CallOutcome> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RelayError::Shutdown);
        }

        let critical =
            priority.is_critical() || self.config.is_critical_resource(&request.resource.route);
        let resource = request.resource.clone();
        let (tx, rx) = oneshot::channel();

        // Settlement and event delivery happen after the lock is released, so
        // sinks may call back into introspection methods.
        let mut expired = Vec::new();
        let queued_event = {
            let mut state = self.state.lock().expect("queue state lock poisoned");

            if state.shedding
                && !critical
                && priority.value() < self.config.shedding_priority_floor
            {
                let reason = format!("system {}, priority below floor", state.health);
                drop(state);
                self.shed_requests.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_shed_request(priority.value());
                debug!(%resource, %priority, "request shed at admission");
                return Err(RelayError::Shed { reason });
            }

            if state.queue.len() >= self.config.max_queue_size {
                expired = self.evict_expired(&mut state.queue);
                if expired.is_empty() || state.queue.len() >= self.config.max_queue_size {
                    drop(state);
                    self.settle_expired(expired);
                    return Err(RelayError::QueueFull {
                        capacity: self.config.max_queue_size,
                    });
                }
            }

            let id = RequestId::new();
            let now = Instant::now();
            let depth = state.queue.len() + 1;
            state.queue.push(QueuedRequest {
                id,
                request,
                priority,
                enqueued: now,
                deadline: now + self.config.request_timeout,
                responder: tx,
            });
            RelayEvent::RequestQueued {
                request_id: id,
                resource,
                priority,
                queue_depth: depth,
                timestamp: Timestamp::now(),
            }
        };

        self.settle_expired(expired);
        self.events.emit(queued_event);
        self.dispatch_wake.notify_one();

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RelayError::Shutdown),
        }
    }

    /// Select a zone for a route and queue the request against it.
    pub async fn queue_routed_request(
        &self,
        route: &str,
        method: Method,
        payload: Option<serde_json::Value>,
        priority: Priority,
        criteria: &SelectionCriteria,
    ) -> RelayResult<CallOutcome> {
        let zone = self
            .zones
            .select_zone(criteria)
            .ok_or_else(|| RelayError::NoZoneAvailable {
                route: route.to_string(),
            })?;

        let mut request = CallRequest::new(ResourceKey::new(zone, route), method);
        if let Some(payload) = payload {
            request = request.with_payload(payload);
        }
        self.queue_request(request, priority).await
    }

    /// Settle every pending request exactly once and empty the queue.
    ///
    /// With `reject_pending`, callers observe a shed error; otherwise their
    /// responders are dropped and they observe a shutdown notice.
    pub fn clear_queue(&self, reject_pending: bool) -> usize {
        let drained: Vec<QueuedRequest> = {
            let mut state = self.state.lock().expect("queue state lock poisoned");
            state.queue.drain(..).collect()
        };

        let count = drained.len();
        for entry in drained {
            if reject_pending {
                let _ = entry.responder.send(Err(RelayError::Shed {
                    reason: "queue cleared".to_string(),
                }));
            }
        }
        if count > 0 {
            info!(count, reject_pending, "admission queue cleared");
        }
        count
    }

    // ------------------------------------------------------------------------
    // Pipeline
    // ------------------------------------------------------------------------

    /// Execute one request through the full pipeline, bypassing the admission
    /// queue: rate-limiter permission → retry orchestration under the
    /// resource's breaker → classification and bookkeeping.
    ///
    /// The outcome is always reported to the zone registry and rate limiter,
    /// success or failure.
    pub async fn execute_request(
        &self,
        request: &CallRequest,
        priority: Priority,
    ) -> RelayResult<CallOutcome> {
        let zone = request.resource.zone.clone();
        let started = Instant::now();

        self.rate_limiter
            .request_permission(&zone, &request.resource, priority)
            .await
            .map_err(|error| match error {
                RateLimitError::QueueFull { capacity } => RelayError::QueueFull { capacity },
                RateLimitError::Timeout { waited_ms } => RelayError::Timeout { waited_ms },
                RateLimitError::Shutdown => RelayError::Shutdown,
            })?;

        self.zones.record_request_start(&zone);

        let transport = Arc::clone(&self.transport);
        let call = request.clone();
        let op = move || {
            let transport = Arc::clone(&transport);
            let call = call.clone();
            async move { transport.send(&call).await }
        };

        let result = self.retry.execute_with_retry(request, priority, op).await;
        let elapsed = started.elapsed();
        let success = result.is_ok();
        let circuit_rejected = matches!(&result, Err(RelayError::CircuitOpen { .. }));

        let mut outcome = if success {
            RequestOutcome::success(elapsed)
        } else {
            RequestOutcome::failure(elapsed)
        };
        if let Some(remaining) = result.as_ref().ok().and_then(|o| o.remaining_quota()) {
            outcome = outcome.with_server_remaining(remaining);
        }
        self.rate_limiter.notify_complete(&zone, &request.resource, outcome);
        if circuit_rejected {
            // The call never left the pipeline; rejected, not failed
            self.zones.record_request_abandoned(&zone);
        } else {
            self.zones.record_request_complete(&zone, success, elapsed);
        }

        // Keep the limiter's zone-aware throttling in step with the registry
        if let Some(snapshot) = self.zones.snapshot(&zone) {
            self.rate_limiter
                .update_zone_health(&zone, snapshot.zone.health.is_healthy);
        }

        self.observe(success, elapsed, &result);
        result
    }

    /// Fold one settled request into counters, EMAs, and error history
    fn observe(&self, success: bool, elapsed: Duration, result: &RelayResult<CallOutcome>) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }

        {
            let mut stats = self.stats.lock().expect("stats lock poisoned");
            let alpha = Self::STATS_ALPHA;
            stats.response_time_ema =
                alpha * elapsed.as_millis() as f64 + (1.0 - alpha) * stats.response_time_ema;
            let error_sample = if success { 0.0 } else { 1.0 };
            stats.error_rate_ema = alpha * error_sample + (1.0 - alpha) * stats.error_rate_ema;
        }

        self.metrics.record_request(elapsed, success);

        if let Err(RelayError::Classified(classified)) = result {
            self.metrics
                .record_error(classified.kind.as_str(), classified.retryable);
            let notice = {
                let mut history = self.history.lock().expect("history lock poisoned");
                history.record(classified)
            };
            if let Some(notice) = notice {
                warn!(kind = %notice.kind, occurrences = notice.occurrences,
                    "error pattern escalated");
                self.events.emit(RelayEvent::EscalationDetected {
                    kind: notice.kind,
                    occurrences: notice.occurrences,
                    max_severity: notice.max_severity,
                    timestamp: Timestamp::now(),
                });
            }
        }
    }

    // ------------------------------------------------------------------------
    // Dispatcher
    // ------------------------------------------------------------------------

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            let pause = {
                let state = self.state.lock().expect("queue state lock poisoned");
                state.batch_timeout
            };

            tokio::select! {
                _ = self.stop.notified() => break,
                _ = self.dispatch_wake.notified() => {}
                _ = tokio::time::sleep(pause) => {}
            }
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }

            self.sweep_and_adapt();

            while let Some(batch) = self.take_batch() {
                let manager = Arc::clone(&self);
                tokio::spawn(async move { manager.run_batch(batch).await });
            }
        }
    }

    /// Pop the best queued request plus, for cacheable reads, every queued
    /// read sharing its resource — up to the adaptive batch size.
    fn take_batch(&self) -> Option<Vec<QueuedRequest>> {
        let mut state = self.state.lock().expect("queue state lock poisoned");
        if state.queue.is_empty() {
            return None;
        }

        // Priority descending, FIFO within a tier
        let head_index = state
            .queue
            .iter()
            .enumerate()
            .min_by_key(|(_, q)| (std::cmp::Reverse(q.priority), q.enqueued))
            .map(|(index, _)| index)?;
        let head = state.queue.remove(head_index);

        let batchable = head.request.method.is_read();
        let resource = head.request.resource.clone();
        let mut batch = vec![head];
        let batch_size = state.batch_size;
        if batchable {
            let mut index = 0;
            while index < state.queue.len() && batch.len() < batch_size {
                let candidate = &state.queue[index];
                if candidate.request.method.is_read() && candidate.request.resource == resource {
                    batch.push(state.queue.remove(index));
                } else {
                    index += 1;
                }
            }
        }

        drop(state);
        for entry in &batch {
            self.events.emit(RelayEvent::RequestDequeued {
                request_id: entry.id,
                resource: entry.request.resource.clone(),
                waited_ms: entry.enqueued.elapsed().as_millis() as u64,
                timestamp: Timestamp::now(),
            });
        }

        Some(batch)
    }

    /// Execute the batch leader once and settle every member with the shared
    /// outcome.
    async fn run_batch(&self, batch: Vec<QueuedRequest>) {
        let leader_request = batch[0].request.clone();
        let leader_priority = batch[0].priority;

        let result = self.execute_request(&leader_request, leader_priority).await;

        for entry in batch {
            let _ = entry.responder.send(result.clone());
        }
    }

    /// Expire overdue entries, recompute health, and adapt batching/shedding.
    fn sweep_and_adapt(&self) {
        let (expired, transition) = {
            let mut state = self.state.lock().expect("queue state lock poisoned");
            let expired = self.evict_expired(&mut state.queue);

            let utilization = state.queue.len() as f64 / self.config.max_queue_size as f64;
            let (error_rate, response_ms) = {
                let stats = self.stats.lock().expect("stats lock poisoned");
                (stats.error_rate_ema, stats.response_time_ema)
            };

            let thresholds = &self.config.degradation_thresholds;
            let target = if utilization >= self.config.load_shedding_threshold {
                SystemHealth::Critical
            } else if utilization > thresholds.queue_utilization
                || error_rate > thresholds.error_rate
                || response_ms > thresholds.response_time_ms
            {
                SystemHealth::Degraded
            } else {
                SystemHealth::Healthy
            };

            let transition = if target == state.health {
                None
            } else {
                let from = state.health;
                state.health = target;
                match target {
                    SystemHealth::Healthy => {
                        state.batch_size = self.config.batch_size;
                        state.batch_timeout = self.config.batch_timeout;
                        state.shedding = false;
                    }
                    SystemHealth::Degraded => {
                        state.batch_size = (self.config.batch_size / 2).max(1);
                        state.batch_timeout = self.config.batch_timeout / 2;
                        state.shedding = false;
                    }
                    SystemHealth::Critical => {
                        state.batch_size = 1;
                        state.batch_timeout = self.config.batch_timeout / 4;
                        state.shedding = true;
                    }
                }
                Some((from, target, utilization, error_rate))
            };
            (expired, transition)
        };

        self.settle_expired(expired);
        if let Some((from, to, queue_utilization, error_rate)) = transition {
            warn!(%from, %to, queue_utilization, error_rate, "system health changed");
            self.events.emit(RelayEvent::DegradationChanged {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
                queue_utilization,
                error_rate,
                timestamp: Timestamp::now(),
            });
        }
    }

    /// Remove every entry past its deadline.
    ///
    /// Callers hold the queue lock; the removed entries must be handed to
    /// [`Self::settle_expired`] once the lock is released.
    fn evict_expired(&self, queue: &mut Vec<QueuedRequest>) -> Vec<QueuedRequest> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut index = 0;
        while index < queue.len() {
            if queue[index].deadline <= now {
                expired.push(queue.swap_remove(index));
            } else {
                index += 1;
            }
        }
        expired
    }

    /// Settle evicted entries with a timeout, outside the queue lock
    fn settle_expired(&self, expired: Vec<QueuedRequest>) {
        let now = Instant::now();
        for entry in expired {
            let waited_ms = now.duration_since(entry.enqueued).as_millis() as u64;
            self.expired_requests.fetch_add(1, Ordering::Relaxed);
            self.events.emit(RelayEvent::RequestExpired {
                request_id: entry.id,
                resource: entry.request.resource.clone(),
                waited_ms,
                timestamp: Timestamp::now(),
            });
            let _ = entry.responder.send(Err(RelayError::Timeout { waited_ms }));
        }
    }

    // ------------------------------------------------------------------------
    // Metrics rollup
    // ------------------------------------------------------------------------

    async fn metrics_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.stop.notified() => break,
                _ = tokio::time::sleep(Self::METRICS_INTERVAL) => {}
            }
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            self.publish_metrics();
        }
    }

    /// Push gauges into the collector and emit the periodic rollup event
    fn publish_metrics(&self) {
        let queue_depth = {
            let state = self.state.lock().expect("queue state lock poisoned");
            state.queue.len()
        };
        self.metrics.record_queue_depth(queue_depth);
        self.metrics.record_replay_queue_depth(self.replay.len());

        let limiter = self.rate_limiter.snapshot();
        self.metrics.record_quota_usage(limiter.usage_fraction);

        for snapshot in self.breakers.snapshot_all() {
            let state = match snapshot.state {
                CircuitState::Closed => 0,
                CircuitState::Open => 1,
                CircuitState::HalfOpen => 2,
            };
            self.metrics
                .record_circuit_breaker_state(&snapshot.name, state);
        }
        for zone in self.zones.snapshot_all() {
            self.metrics
                .record_zone_health(zone.zone.id.as_str(), zone.zone.health.is_healthy);
        }

        self.events.emit(RelayEvent::MetricsUpdated {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            queue_depth,
            timestamp: Timestamp::now(),
        });
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    /// Pipeline-wide metrics snapshot
    pub fn metrics(&self) -> RelayMetrics {
        let (queue_depth, health) = {
            let state = self.state.lock().expect("queue state lock poisoned");
            (state.queue.len(), state.health)
        };
        let (error_rate, response_ms) = {
            let stats = self.stats.lock().expect("stats lock poisoned");
            (stats.error_rate_ema, stats.response_time_ema)
        };

        RelayMetrics {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            shed_requests: self.shed_requests.load(Ordering::Relaxed),
            expired_requests: self.expired_requests.load(Ordering::Relaxed),
            error_rate,
            average_response_time_ms: response_ms,
            queue_depth,
            quota_usage: self.rate_limiter.snapshot().usage_fraction,
            healthy_zones: self.zones.healthy_zone_count(),
            system_health: health,
        }
    }

    /// Breaker snapshot for one resource, if a breaker exists yet
    pub fn circuit_breaker_state(&self, resource: &ResourceKey) -> Option<BreakerSnapshot> {
        self.breakers.get(resource).map(|b| b.snapshot())
    }

    /// Current derived health
    pub fn system_health(&self) -> SystemHealth {
        self.state
            .lock()
            .expect("queue state lock poisoned")
            .health
    }

    /// Admission queue snapshot
    pub fn queue_statistics(&self) -> QueueStatistics {
        let state = self.state.lock().expect("queue state lock poisoned");
        let mut by_priority: HashMap<u8, usize> = HashMap::new();
        let mut oldest_wait_ms = 0u64;
        for entry in &state.queue {
            *by_priority.entry(entry.priority.value()).or_insert(0) += 1;
            oldest_wait_ms = oldest_wait_ms.max(entry.enqueued.elapsed().as_millis() as u64);
        }
        QueueStatistics {
            depth: state.queue.len(),
            capacity: self.config.max_queue_size,
            utilization: state.queue.len() as f64 / self.config.max_queue_size as f64,
            by_priority,
            oldest_wait_ms,
        }
    }

    /// Rate limiter snapshot
    pub fn rate_limiter_snapshot(&self) -> RateLimiterSnapshot {
        self.rate_limiter.snapshot()
    }

    /// Replay queue counters
    pub fn replay_statistics(&self) -> ReplayQueueStats {
        self.replay.stats()
    }

    /// The zone registry, for registration and selection
    pub fn zone_manager(&self) -> &Arc<ZoneManager> {
        &self.zones
    }

    /// The retry orchestrator, for direct use outside the admission queue
    pub fn retry_orchestrator(&self) -> &Arc<RetryOrchestrator> {
        &self.retry
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Stop every background task and settle all pending requests.
    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop.notify_waiters();

        let drained: Vec<QueuedRequest> = {
            let mut state = self.state.lock().expect("queue state lock poisoned");
            state.queue.drain(..).collect()
        };
        for entry in drained {
            let _ = entry.responder.send(Err(RelayError::Shutdown));
        }

        self.zones.stop();
        self.replay.stop();
        self.rate_limiter.shutdown().await;

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().expect("task list lock poisoned");
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("reliability manager stopped");
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
