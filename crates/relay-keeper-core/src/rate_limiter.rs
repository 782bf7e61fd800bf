//! Global rolling-window quota and per-resource concurrency limiting.
//!
//! [`RateLimiter::request_permission`] returns only once three conditions
//! hold: global rolling usage is below the hourly cap, the resource's
//! in-flight count is below its thread limit, and (when zone-aware throttling
//! is enabled) the target zone is healthy. Requests that cannot proceed
//! immediately are queued by priority, FIFO within a tier.
//!
//! A single pump task wakes on a computed delay (window expiry, waiter
//! deadlines, or an explicit nudge from completions) rather than busy-polling,
//! and settles waiters in priority order. Every queued waiter is settled
//! exactly once: granted, timed out, or rejected on shutdown.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::RateLimiterConfig;
use crate::{Priority, ResourceKey, ZoneId};

// ============================================================================
// Public Types
// ============================================================================

/// Completion report for a permitted call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestOutcome {
    /// Whether the call succeeded
    pub success: bool,

    /// Wall-clock duration of the call
    pub duration: Duration,

    /// Server-reported remaining quota, when the response carried it
    pub server_remaining: Option<u32>,
}

impl RequestOutcome {
    /// Successful call of the given duration
    pub fn success(duration: Duration) -> Self {
        Self {
            success: true,
            duration,
            server_remaining: None,
        }
    }

    /// Failed call of the given duration
    pub fn failure(duration: Duration) -> Self {
        Self {
            success: false,
            duration,
            server_remaining: None,
        }
    }

    /// Attach the server-reported remaining quota
    pub fn with_server_remaining(mut self, remaining: u32) -> Self {
        self.server_remaining = Some(remaining);
        self
    }
}

/// Errors surfaced by permission requests.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RateLimitError {
    /// The wait queue is at capacity; the request was rejected immediately.
    #[error("Rate limiter queue at capacity ({capacity})")]
    QueueFull { capacity: usize },

    /// The queued request's timeout elapsed before budget freed up.
    #[error("Timed out waiting {waited_ms}ms for rate limit permission")]
    Timeout { waited_ms: u64 },

    /// The limiter is shutting down; all queued waiters are settled.
    #[error("Rate limiter shutting down")]
    Shutdown,
}

/// Defensive snapshot of limiter state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterSnapshot {
    /// Fraction of the rolling-window budget currently used (0.0 to 1.0+)
    pub usage_fraction: f64,

    /// Requests inside the rolling window
    pub window_count: usize,

    /// Waiters currently queued for permission
    pub queued: usize,

    /// Total in-flight calls across all resources
    pub total_in_flight: u32,

    /// In-flight calls per resource
    pub in_flight: HashMap<String, u32>,
}

// ============================================================================
// Internal State
// ============================================================================

/// Per-zone throttle inputs fed by completions and health updates.
#[derive(Debug, Clone)]
struct ZoneThrottleState {
    healthy: bool,
    response_time_ema: f64,
    error_rate_ema: f64,
}

impl Default for ZoneThrottleState {
    fn default() -> Self {
        Self {
            healthy: true,
            response_time_ema: 0.0,
            error_rate_ema: 0.0,
        }
    }
}

struct Waiter {
    seq: u64,
    zone: ZoneId,
    resource: ResourceKey,
    priority: Priority,
    enqueued: Instant,
    deadline: Instant,
    tx: oneshot::Sender<Result<(), RateLimitError>>,
}

struct Inner {
    /// Pruned rolling log of grant times
    request_log: VecDeque<Instant>,

    /// In-flight count per resource; entries removed at zero
    in_flight: HashMap<ResourceKey, u32>,

    /// Queued permission requests, settled in priority order
    waiters: Vec<Waiter>,

    /// Zone throttle inputs
    zones: HashMap<ZoneId, ZoneThrottleState>,

    /// Most recent server-reported remaining quota
    remaining_hint: Option<u32>,
}

impl Inner {
    fn prune(&mut self, window: Duration) {
        let now = Instant::now();
        while let Some(front) = self.request_log.front() {
            if now.duration_since(*front) > window {
                self.request_log.pop_front();
            } else {
                break;
            }
        }
    }
}

struct Shared {
    config: RateLimiterConfig,
    state: Mutex<Inner>,
    wake: Notify,
    shutdown: AtomicBool,
    seq: AtomicU64,
}

// ============================================================================
// Rate Limiter
// ============================================================================

/// Quota-aware rate limiter with a priority wait queue.
pub struct RateLimiter {
    shared: Arc<Shared>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    /// Create a limiter and spawn its pump task
    pub fn new(config: RateLimiterConfig) -> Self {
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(Inner {
                request_log: VecDeque::new(),
                in_flight: HashMap::new(),
                waiters: Vec::new(),
                zones: HashMap::new(),
                remaining_hint: None,
            }),
            wake: Notify::new(),
            shutdown: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        });

        let pump = tokio::spawn(Self::pump_loop(Arc::clone(&shared)));

        Self {
            shared,
            pump: Mutex::new(Some(pump)),
        }
    }

    /// Wait for permission to make one call against a resource.
    ///
    /// Returns immediately when budget is available; otherwise queues by
    /// priority until budget frees, the queue timeout elapses, or the limiter
    /// shuts down. The caller must pair a granted permission with exactly one
    /// [`RateLimiter::notify_complete`].
    pub async fn request_permission(
        &self,
        zone: &ZoneId,
        resource: &ResourceKey,
        priority: Priority,
    ) -> Result<(), RateLimitError> {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return Err(RateLimitError::Shutdown);
        }

        let rx = {
            let mut inner = self.shared.state.lock().expect("rate limiter lock poisoned");
            inner.prune(self.shared.config.window);

            if Self::can_grant(&self.shared.config, &inner, zone, resource) {
                Self::grant(&mut inner, resource);
                trace!(%resource, "rate limit permission granted immediately");
                return Ok(());
            }

            if inner.waiters.len() >= self.shared.config.max_queue_size {
                debug!(%resource, "rate limiter queue full");
                return Err(RateLimitError::QueueFull {
                    capacity: self.shared.config.max_queue_size,
                });
            }

            let (tx, rx) = oneshot::channel();
            let now = Instant::now();
            inner.waiters.push(Waiter {
                seq: self.shared.seq.fetch_add(1, Ordering::SeqCst),
                zone: zone.clone(),
                resource: resource.clone(),
                priority,
                enqueued: now,
                deadline: now + self.shared.config.queue_timeout,
                tx,
            });
            rx
        };

        self.shared.wake.notify_one();

        match rx.await {
            Ok(result) => result,
            // Pump dropped the sender without settling: shutdown race
            Err(_) => Err(RateLimitError::Shutdown),
        }
    }

    /// Release the concurrency slot held by a permitted call and feed the
    /// zone's EMAs.
    pub fn notify_complete(&self, zone: &ZoneId, resource: &ResourceKey, outcome: RequestOutcome) {
        {
            let mut inner = self.shared.state.lock().expect("rate limiter lock poisoned");

            match inner.in_flight.get_mut(resource) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    inner.in_flight.remove(resource);
                }
                None => {}
            }

            let alpha = 0.3;
            let entry = inner.zones.entry(zone.clone()).or_default();
            let observed_ms = outcome.duration.as_millis() as f64;
            entry.response_time_ema = alpha * observed_ms + (1.0 - alpha) * entry.response_time_ema;
            let error_sample = if outcome.success { 0.0 } else { 1.0 };
            entry.error_rate_ema = alpha * error_sample + (1.0 - alpha) * entry.error_rate_ema;

            if outcome.server_remaining.is_some() {
                inner.remaining_hint = outcome.server_remaining;
            }
        }

        self.shared.wake.notify_one();
    }

    /// Mark a zone healthy or unhealthy for zone-aware throttling
    pub fn update_zone_health(&self, zone: &ZoneId, healthy: bool) {
        {
            let mut inner = self.shared.state.lock().expect("rate limiter lock poisoned");
            inner.zones.entry(zone.clone()).or_default().healthy = healthy;
        }
        if healthy {
            self.shared.wake.notify_one();
        }
    }

    /// Recommended client-side delay before the next call to a zone.
    ///
    /// Sum of a usage-tier delay, a zone-health penalty, and a delay
    /// proportional to queue pressure.
    pub fn recommended_delay(&self, zone: &ZoneId) -> Duration {
        let mut inner = self.shared.state.lock().expect("rate limiter lock poisoned");
        inner.prune(self.shared.config.window);
        Self::compute_delay(&self.shared.config, &inner, Some(zone))
    }

    /// Defensive snapshot of usage and queue state
    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let mut inner = self.shared.state.lock().expect("rate limiter lock poisoned");
        inner.prune(self.shared.config.window);
        RateLimiterSnapshot {
            usage_fraction: Self::usage_fraction(&self.shared.config, &inner),
            window_count: inner.request_log.len(),
            queued: inner.waiters.len(),
            total_in_flight: inner.in_flight.values().sum(),
            in_flight: inner
                .in_flight
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        }
    }

    /// Stop the pump and settle every queued waiter with `Shutdown`
    pub async fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
        let handle = self.pump.lock().expect("pump handle lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    // --- internals ---------------------------------------------------------

    fn usage_fraction(config: &RateLimiterConfig, inner: &Inner) -> f64 {
        let local = inner.request_log.len() as f64 / config.hourly_request_limit as f64;
        let hinted = inner
            .remaining_hint
            .map(|remaining| 1.0 - remaining as f64 / config.hourly_request_limit as f64)
            .unwrap_or(0.0);
        local.max(hinted)
    }

    fn can_grant(
        config: &RateLimiterConfig,
        inner: &Inner,
        zone: &ZoneId,
        resource: &ResourceKey,
    ) -> bool {
        if inner.request_log.len() >= config.hourly_request_limit as usize {
            return false;
        }
        let in_flight = inner.in_flight.get(resource).copied().unwrap_or(0);
        if in_flight >= config.thread_limit_per_resource {
            return false;
        }
        if config.enable_zone_aware_throttling {
            let healthy = inner.zones.get(zone).map(|z| z.healthy).unwrap_or(true);
            if !healthy {
                return false;
            }
        }
        true
    }

    fn grant(inner: &mut Inner, resource: &ResourceKey) {
        inner.request_log.push_back(Instant::now());
        *inner.in_flight.entry(resource.clone()).or_insert(0) += 1;
    }

    fn compute_delay(config: &RateLimiterConfig, inner: &Inner, zone: Option<&ZoneId>) -> Duration {
        let usage = Self::usage_fraction(config, inner);
        let thresholds = &config.usage_thresholds;
        let tier_ms: u64 = if usage >= thresholds.heavy {
            2_000
        } else if usage >= thresholds.medium {
            500
        } else if usage >= thresholds.light {
            100
        } else {
            0
        };

        let zone_ms: u64 = zone
            .and_then(|z| inner.zones.get(z))
            .map(|z| if z.healthy { 0 } else { 1_000 })
            .unwrap_or(0);

        let pressure_ms = (inner.waiters.len() as u64 * 10).min(1_000);

        Duration::from_millis(tier_ms + zone_ms + pressure_ms)
    }

    /// Single pump: expires timed-out waiters, settles eligible waiters in
    /// priority order, then sleeps until the next interesting moment.
    async fn pump_loop(shared: Arc<Shared>) {
        loop {
            if shared.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let sleep_for = {
                let mut inner = shared.state.lock().expect("rate limiter lock poisoned");
                inner.prune(shared.config.window);
                Self::expire_waiters(&mut inner);
                Self::settle_waiters(&shared.config, &mut inner);
                Self::next_wake(&shared.config, &inner)
            };

            tokio::select! {
                _ = shared.wake.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }

        // Settle everything left on shutdown
        let mut inner = shared.state.lock().expect("rate limiter lock poisoned");
        for waiter in inner.waiters.drain(..) {
            let _ = waiter.tx.send(Err(RateLimitError::Shutdown));
        }
    }

    fn expire_waiters(inner: &mut Inner) {
        let now = Instant::now();
        let mut index = 0;
        while index < inner.waiters.len() {
            if inner.waiters[index].deadline <= now {
                let waiter = inner.waiters.swap_remove(index);
                let waited_ms = now.duration_since(waiter.enqueued).as_millis() as u64;
                let _ = waiter.tx.send(Err(RateLimitError::Timeout { waited_ms }));
            } else {
                index += 1;
            }
        }
    }

    /// Grant budget to eligible waiters, best (priority, FIFO) first.
    ///
    /// Waiters blocked on their own resource or zone are skipped so they do
    /// not starve eligible work behind them.
    fn settle_waiters(config: &RateLimiterConfig, inner: &mut Inner) {
        loop {
            let mut best: Option<usize> = None;
            for (index, waiter) in inner.waiters.iter().enumerate() {
                if !Self::can_grant(config, inner, &waiter.zone, &waiter.resource) {
                    continue;
                }
                best = match best {
                    None => Some(index),
                    Some(current) => {
                        let cur = &inner.waiters[current];
                        if (waiter.priority, std::cmp::Reverse(waiter.seq))
                            > (cur.priority, std::cmp::Reverse(cur.seq))
                        {
                            Some(index)
                        } else {
                            Some(current)
                        }
                    }
                };
            }

            let Some(index) = best else { break };
            let waiter = inner.waiters.remove(index);
            Self::grant(inner, &waiter.resource);
            if waiter.tx.send(Ok(())).is_err() {
                // Caller went away; roll the grant back
                inner.request_log.pop_back();
                match inner.in_flight.get_mut(&waiter.resource) {
                    Some(count) if *count > 1 => *count -= 1,
                    Some(_) => {
                        inner.in_flight.remove(&waiter.resource);
                    }
                    None => {}
                }
            }
        }
    }

    /// Time until the next scheduled wake: earliest waiter deadline, window
    /// expiry when the cap is hit, or the recommended-delay heartbeat.
    fn next_wake(config: &RateLimiterConfig, inner: &Inner) -> Duration {
        let now = Instant::now();
        let mut wake = Self::compute_delay(config, inner, None).max(Duration::from_millis(50));

        if let Some(earliest) = inner.waiters.iter().map(|w| w.deadline).min() {
            wake = wake.min(earliest.saturating_duration_since(now));
        }

        if inner.request_log.len() >= config.hourly_request_limit as usize {
            if let Some(front) = inner.request_log.front() {
                let expiry = (*front + config.window).saturating_duration_since(now);
                wake = wake.min(expiry);
            }
        }

        wake.max(Duration::from_millis(5))
    }
}

#[cfg(test)]
#[path = "rate_limiter_tests.rs"]
mod tests;
