//! Zone registry with health tracking, active probing, and pluggable
//! load-balancing strategies.
//!
//! A zone is one backend endpoint of the remote service. Each registered zone
//! carries health state (EMAs, consecutive failures) fed from two independent
//! sources: its own request-derived circuit breaker, and a periodic active
//! probe against the configured health route. Either source alone can mark a
//! zone unhealthy.
//!
//! Selection is snapshot-then-decide: the manager copies candidate state out
//! of the registry, filters, and applies the configured strategy without
//! holding any lock across the scan.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::{backup_zone_breaker_config, primary_zone_breaker_config, ZoneManagerConfig};
use crate::events::{EventBus, RelayEvent};
use crate::retry::service_failure_predicate;
use crate::transport::{CallRequest, Method, Transport, TransportError};
use crate::{Priority, ResourceKey, Timestamp, ValidationError, ZoneId};

// ============================================================================
// Zone State
// ============================================================================

/// Health assessment for one zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneHealth {
    /// Current assessment; false once either probe failures or the breaker
    /// cross their thresholds
    pub is_healthy: bool,

    /// When the last active probe ran
    pub last_check: Option<Timestamp>,

    /// Response time EMA in milliseconds
    pub response_time_ema: f64,

    /// Error rate EMA (0.0 to 1.0)
    pub error_rate_ema: f64,

    /// Consecutive failed requests/probes
    pub consecutive_failures: u32,
}

impl Default for ZoneHealth {
    fn default() -> Self {
        Self {
            is_healthy: true,
            last_check: None,
            response_time_ema: 0.0,
            error_rate_ema: 0.0,
            consecutive_failures: 0,
        }
    }
}

/// Traffic counters for one zone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneTraffic {
    /// Requests routed to the zone since registration
    pub total_requests: u64,

    /// Requests that completed successfully
    pub successful_requests: u64,

    /// Requests that failed
    pub failed_requests: u64,

    /// Requests currently in flight
    pub current_load: u32,
}

/// One registered backend endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    /// Zone identifier
    pub id: ZoneId,

    /// Base URL of the endpoint
    pub base_url: String,

    /// Region label, when known
    pub region: Option<String>,

    /// Backup zones are only selected when requested or nothing else qualifies
    pub is_backup: bool,

    /// Selection priority among otherwise-equal zones
    pub priority: Priority,

    /// Concurrency ceiling for the zone
    pub max_concurrent: u32,

    /// Health assessment
    pub health: ZoneHealth,

    /// Traffic counters
    pub metrics: ZoneTraffic,
}

/// Registration input for a new zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneRegistration {
    pub id: ZoneId,
    pub base_url: String,
    pub region: Option<String>,
    pub is_backup: bool,
    pub priority: Priority,
    pub max_concurrent: u32,
}

impl ZoneRegistration {
    /// Primary zone with default priority and concurrency
    pub fn primary(id: ZoneId, base_url: impl Into<String>) -> Self {
        Self {
            id,
            base_url: base_url.into(),
            region: None,
            is_backup: false,
            priority: Priority::NORMAL,
            max_concurrent: 32,
        }
    }

    /// Backup zone selected only when primaries are exhausted
    pub fn backup(id: ZoneId, base_url: impl Into<String>) -> Self {
        Self {
            is_backup: true,
            ..Self::primary(id, base_url)
        }
    }

    /// Set the region label
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.base_url.is_empty() {
            return Err(ValidationError::Required {
                field: "base_url".to_string(),
            });
        }
        if self.max_concurrent == 0 {
            return Err(ValidationError::OutOfRange {
                field: "max_concurrent".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Defensive copy of a zone plus its breaker state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneSnapshot {
    /// Zone state at snapshot time
    pub zone: Zone,

    /// The zone breaker's state at snapshot time
    pub breaker_state: CircuitState,
}

impl ZoneSnapshot {
    /// Whether the zone can take traffic right now
    pub fn is_selectable(&self) -> bool {
        self.zone.health.is_healthy && self.breaker_state != CircuitState::Open
    }
}

// ============================================================================
// Selection
// ============================================================================

/// Filters applied before the load-balancing strategy runs.
#[derive(Debug, Clone, Default)]
pub struct SelectionCriteria {
    /// Restrict to zones in this region
    pub region: Option<String>,

    /// Allow backup zones alongside primaries (backups are always considered
    /// when no primary qualifies)
    pub include_backup: bool,

    /// Exclude zones whose response-time EMA exceeds this bound
    pub max_response_time_ms: Option<f64>,

    /// When nothing qualifies, fall back to the least-bad zone instead of
    /// returning none
    pub allow_unhealthy_fallback: bool,
}

/// Pluggable selection strategy over pre-filtered candidates.
pub trait LoadBalancingStrategy: Send + Sync {
    /// Pick one zone from a non-empty candidate list
    fn select(&self, candidates: &[ZoneSnapshot]) -> Option<ZoneId>;
}

/// Visits every candidate once before repeating.
///
/// Candidates are ordered by zone ID so the rotation is stable regardless of
/// registry iteration order.
pub struct RoundRobinStrategy {
    cursor: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingStrategy for RoundRobinStrategy {
    fn select(&self, candidates: &[ZoneSnapshot]) -> Option<ZoneId> {
        if candidates.is_empty() {
            return None;
        }
        let mut ordered: Vec<&ZoneSnapshot> = candidates.iter().collect();
        ordered.sort_by(|a, b| a.zone.id.cmp(&b.zone.id));
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % ordered.len();
        Some(ordered[index].zone.id.clone())
    }
}

/// Picks the candidate with the fewest in-flight requests.
pub struct LeastLoadedStrategy;

impl LoadBalancingStrategy for LeastLoadedStrategy {
    fn select(&self, candidates: &[ZoneSnapshot]) -> Option<ZoneId> {
        candidates
            .iter()
            .min_by_key(|s| (s.zone.metrics.current_load, s.zone.id.clone()))
            .map(|s| s.zone.id.clone())
    }
}

/// Weights candidates by inverse response-time EMA; faster zones win.
pub struct WeightedResponseTimeStrategy;

impl LoadBalancingStrategy for WeightedResponseTimeStrategy {
    fn select(&self, candidates: &[ZoneSnapshot]) -> Option<ZoneId> {
        candidates
            .iter()
            .min_by(|a, b| {
                a.zone
                    .health
                    .response_time_ema
                    .partial_cmp(&b.zone.health.response_time_ema)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.zone.id.cmp(&b.zone.id))
            })
            .map(|s| s.zone.id.clone())
    }
}

// ============================================================================
// Discovery
// ============================================================================

/// Resolves an external identifier to a zone registration.
///
/// Implemented by the composition layer against whatever discovery endpoint
/// the deployment provides.
#[async_trait]
pub trait ZoneDiscovery: Send + Sync {
    /// Look up the zone the identifier belongs to
    async fn discover(&self, identifier: &str) -> Result<ZoneRegistration, TransportError>;
}

// ============================================================================
// Zone Manager
// ============================================================================

struct ZoneEntry {
    zone: Mutex<Zone>,
    breaker: Arc<CircuitBreaker<TransportError>>,
}

/// Registry of zones with health probing and strategy-driven selection.
pub struct ZoneManager {
    config: ZoneManagerConfig,
    zones: RwLock<HashMap<ZoneId, Arc<ZoneEntry>>>,
    strategy: Arc<dyn LoadBalancingStrategy>,
    events: EventBus,
    stopped: AtomicBool,
    stop: Notify,
}

impl ZoneManager {
    /// Discovery retry budget for [`ZoneManager::auto_detect_zone`]
    const DISCOVERY_ATTEMPTS: u32 = 3;
    const DISCOVERY_BACKOFF: Duration = Duration::from_millis(250);

    /// Create a manager using the strategy named in the configuration
    pub fn new(config: ZoneManagerConfig, events: EventBus) -> Self {
        let strategy: Arc<dyn LoadBalancingStrategy> = match config.load_balancing_strategy {
            crate::config::StrategyKind::RoundRobin => Arc::new(RoundRobinStrategy::new()),
            crate::config::StrategyKind::LeastLoaded => Arc::new(LeastLoadedStrategy),
            crate::config::StrategyKind::WeightedResponseTime => {
                Arc::new(WeightedResponseTimeStrategy)
            }
        };
        Self::with_strategy(config, events, strategy)
    }

    /// Create a manager with a caller-supplied strategy
    pub fn with_strategy(
        config: ZoneManagerConfig,
        events: EventBus,
        strategy: Arc<dyn LoadBalancingStrategy>,
    ) -> Self {
        Self {
            config,
            zones: RwLock::new(HashMap::new()),
            strategy,
            events,
            stopped: AtomicBool::new(false),
            stop: Notify::new(),
        }
    }

    /// Register a zone; replaces any existing registration with the same ID
    pub fn register_zone(&self, registration: ZoneRegistration) -> Result<(), ValidationError> {
        registration.validate()?;

        let breaker_config = if registration.is_backup {
            backup_zone_breaker_config(format!("zone:{}", registration.id))
        } else {
            primary_zone_breaker_config(format!("zone:{}", registration.id))
        };

        let entry = Arc::new(ZoneEntry {
            zone: Mutex::new(Zone {
                id: registration.id.clone(),
                base_url: registration.base_url,
                region: registration.region,
                is_backup: registration.is_backup,
                priority: registration.priority,
                max_concurrent: registration.max_concurrent,
                health: ZoneHealth::default(),
                metrics: ZoneTraffic::default(),
            }),
            breaker: Arc::new(CircuitBreaker::with_predicate(
                breaker_config,
                self.events.clone(),
                service_failure_predicate(),
            )),
        });

        info!(zone = %registration.id, "zone registered");
        self.zones
            .write()
            .expect("zone registry lock poisoned")
            .insert(registration.id, entry);
        Ok(())
    }

    /// Remove a zone from the registry
    pub fn deregister_zone(&self, id: &ZoneId) -> bool {
        let removed = self
            .zones
            .write()
            .expect("zone registry lock poisoned")
            .remove(id)
            .is_some();
        if removed {
            info!(zone = %id, "zone deregistered");
        }
        removed
    }

    /// Select a zone for new traffic, or `None` if nothing qualifies.
    ///
    /// Open-circuit and unhealthy zones are excluded while any qualifying
    /// alternative exists; with `allow_unhealthy_fallback` the least-loaded
    /// zone is returned as a last resort.
    pub fn select_zone(&self, criteria: &SelectionCriteria) -> Option<ZoneId> {
        let snapshots = self.snapshot_all();

        let matches_static = |s: &ZoneSnapshot| {
            if let Some(region) = &criteria.region {
                if s.zone.region.as_deref() != Some(region.as_str()) {
                    return false;
                }
            }
            if let Some(max_ms) = criteria.max_response_time_ms {
                if s.zone.health.response_time_ema > max_ms {
                    return false;
                }
            }
            if s.zone.metrics.current_load >= s.zone.max_concurrent {
                return false;
            }
            true
        };

        let healthy: Vec<ZoneSnapshot> = snapshots
            .iter()
            .filter(|s| s.is_selectable() && matches_static(s))
            .filter(|s| criteria.include_backup || !s.zone.is_backup)
            .cloned()
            .collect();

        if !healthy.is_empty() {
            return self.strategy.select(&healthy);
        }

        // Primaries exhausted: backups qualify even when not asked for
        let backups: Vec<ZoneSnapshot> = snapshots
            .iter()
            .filter(|s| s.is_selectable() && matches_static(s) && s.zone.is_backup)
            .cloned()
            .collect();
        if !backups.is_empty() {
            return self.strategy.select(&backups);
        }

        if criteria.allow_unhealthy_fallback {
            let fallback = snapshots
                .iter()
                .filter(|s| matches_static(s))
                .min_by_key(|s| (s.zone.metrics.current_load, s.zone.id.clone()))
                .map(|s| s.zone.id.clone());
            if let Some(zone) = &fallback {
                warn!(%zone, "no healthy zone qualifies, falling back");
            }
            return fallback;
        }

        None
    }

    /// Record that a request was routed to the zone
    pub fn record_request_start(&self, id: &ZoneId) {
        if let Some(entry) = self.entry(id) {
            let mut zone = entry.zone.lock().expect("zone lock poisoned");
            zone.metrics.total_requests += 1;
            zone.metrics.current_load += 1;
        }
    }

    /// Release a routed request that never reached the zone.
    ///
    /// Circuit-protection rejections are not zone failures; only the load
    /// slot is returned, health and breaker accounting stay untouched.
    pub fn record_request_abandoned(&self, id: &ZoneId) {
        if let Some(entry) = self.entry(id) {
            let mut zone = entry.zone.lock().expect("zone lock poisoned");
            zone.metrics.current_load = zone.metrics.current_load.saturating_sub(1);
        }
    }

    /// Record a completed request: release load, update EMAs, feed the zone
    /// breaker, and re-evaluate health.
    pub fn record_request_complete(&self, id: &ZoneId, success: bool, duration: Duration) {
        let Some(entry) = self.entry(id) else { return };

        if success {
            entry.breaker.record_success();
        } else {
            entry.breaker.record_failure();
        }
        let breaker_open = !entry.breaker.is_healthy();

        let transition = {
            let mut zone = entry.zone.lock().expect("zone lock poisoned");
            zone.metrics.current_load = zone.metrics.current_load.saturating_sub(1);

            let alpha = self.config.ema_alpha;
            let observed_ms = duration.as_millis() as f64;
            zone.health.response_time_ema =
                alpha * observed_ms + (1.0 - alpha) * zone.health.response_time_ema;
            let error_sample = if success { 0.0 } else { 1.0 };
            zone.health.error_rate_ema =
                alpha * error_sample + (1.0 - alpha) * zone.health.error_rate_ema;

            if success {
                zone.metrics.successful_requests += 1;
                zone.health.consecutive_failures = 0;
            } else {
                zone.metrics.failed_requests += 1;
                zone.health.consecutive_failures += 1;
            }

            Self::reassess_health(&mut zone, self.config.unhealthy_threshold, breaker_open)
        };

        self.publish_transition(id, transition);
    }

    /// Resolve an external identifier to a zone, registering it when unseen.
    ///
    /// The discovery call gets a bounded retry budget; failures are returned
    /// as-is once the budget is spent.
    pub async fn auto_detect_zone(
        &self,
        identifier: &str,
        discovery: &dyn ZoneDiscovery,
    ) -> Result<ZoneId, TransportError> {
        // Identifier may already be a registered zone ID
        if let Ok(id) = identifier.parse::<ZoneId>() {
            if self.entry(&id).is_some() {
                return Ok(id);
            }
        }

        let mut last_error = None;
        for attempt in 1..=Self::DISCOVERY_ATTEMPTS {
            match discovery.discover(identifier).await {
                Ok(registration) => {
                    let id = registration.id.clone();
                    if self.entry(&id).is_none() {
                        self.register_zone(registration).map_err(|e| {
                            TransportError::Network {
                                message: format!("discovered zone rejected: {e}"),
                            }
                        })?;
                        debug!(zone = %id, identifier, "zone auto-detected");
                    }
                    return Ok(id);
                }
                Err(error) if error.is_transient() && attempt < Self::DISCOVERY_ATTEMPTS => {
                    tokio::time::sleep(Self::DISCOVERY_BACKOFF * attempt).await;
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }

        Err(last_error.unwrap_or(TransportError::Network {
            message: "zone discovery exhausted".to_string(),
        }))
    }

    /// Snapshot one zone
    pub fn snapshot(&self, id: &ZoneId) -> Option<ZoneSnapshot> {
        self.entry(id).map(|entry| ZoneSnapshot {
            zone: entry.zone.lock().expect("zone lock poisoned").clone(),
            breaker_state: entry.breaker.snapshot().state,
        })
    }

    /// Snapshot every registered zone
    pub fn snapshot_all(&self) -> Vec<ZoneSnapshot> {
        let entries: Vec<Arc<ZoneEntry>> = {
            let zones = self.zones.read().expect("zone registry lock poisoned");
            zones.values().cloned().collect()
        };
        entries
            .iter()
            .map(|entry| ZoneSnapshot {
                zone: entry.zone.lock().expect("zone lock poisoned").clone(),
                breaker_state: entry.breaker.snapshot().state,
            })
            .collect()
    }

    /// Number of zones currently assessed healthy
    pub fn healthy_zone_count(&self) -> usize {
        self.snapshot_all()
            .iter()
            .filter(|s| s.is_selectable())
            .count()
    }

    /// Spawn the periodic active health probe; runs until [`ZoneManager::stop`]
    pub fn spawn_health_checks(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.stop.notified() => break,
                    _ = tokio::time::sleep(manager.config.health_check_interval) => {}
                }
                if manager.stopped.load(Ordering::SeqCst) {
                    break;
                }
                manager.probe_all(transport.as_ref()).await;
            }
        })
    }

    /// Stop the health probe task
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop.notify_waiters();
    }

    /// Probe every zone's health route once
    pub async fn probe_all(&self, transport: &dyn Transport) {
        let ids: Vec<ZoneId> = {
            let zones = self.zones.read().expect("zone registry lock poisoned");
            zones.keys().cloned().collect()
        };

        for id in ids {
            let Some(entry) = self.entry(&id) else { continue };

            let probe = CallRequest::new(
                ResourceKey::new(id.clone(), self.config.health_check_route.clone()),
                Method::Get,
            );
            let started = std::time::Instant::now();
            let result = transport.send(&probe).await;
            let elapsed = started.elapsed();

            let probe_ok = matches!(&result, Ok(outcome) if outcome.is_success());
            if probe_ok {
                entry.breaker.record_success();
            } else {
                entry.breaker.record_failure();
            }
            let breaker_open = !entry.breaker.is_healthy();

            let transition = {
                let mut zone = entry.zone.lock().expect("zone lock poisoned");
                zone.health.last_check = Some(Timestamp::now());

                let alpha = self.config.ema_alpha;
                zone.health.response_time_ema = alpha * elapsed.as_millis() as f64
                    + (1.0 - alpha) * zone.health.response_time_ema;

                if probe_ok {
                    zone.health.consecutive_failures = 0;
                } else {
                    zone.health.consecutive_failures += 1;
                }

                Self::reassess_health(&mut zone, self.config.unhealthy_threshold, breaker_open)
            };

            self.publish_transition(&id, transition);
        }
    }

    // --- internals ---------------------------------------------------------

    fn entry(&self, id: &ZoneId) -> Option<Arc<ZoneEntry>> {
        self.zones
            .read()
            .expect("zone registry lock poisoned")
            .get(id)
            .cloned()
    }

    /// Recompute `is_healthy`; returns the new assessment when it changed
    fn reassess_health(zone: &mut Zone, unhealthy_threshold: u32, breaker_open: bool) -> Option<(bool, u32)> {
        let was_healthy = zone.health.is_healthy;
        let now_healthy = zone.health.consecutive_failures < unhealthy_threshold && !breaker_open;
        zone.health.is_healthy = now_healthy;

        if was_healthy != now_healthy {
            Some((now_healthy, zone.health.consecutive_failures))
        } else {
            None
        }
    }

    fn publish_transition(&self, id: &ZoneId, transition: Option<(bool, u32)>) {
        if let Some((is_healthy, consecutive_failures)) = transition {
            if is_healthy {
                info!(zone = %id, "zone recovered");
            } else {
                warn!(zone = %id, consecutive_failures, "zone marked unhealthy");
            }
            self.events.emit(RelayEvent::HealthUpdated {
                zone: id.clone(),
                is_healthy,
                consecutive_failures,
                timestamp: Timestamp::now(),
            });
        }
    }
}

#[cfg(test)]
#[path = "zones_tests.rs"]
mod tests;
