//! Configuration surface for every component, with explicit defaults.
//!
//! Each component takes a plain struct; the composition layer builds them from
//! whatever source it likes (files, environment, hard-coded test values) and
//! calls `validate()` before wiring anything together.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ValidationError;

// ============================================================================
// Rate Limiter
// ============================================================================

/// Usage tiers as fractions of the hourly cap, each adding a fixed delay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageThresholds {
    /// Below this fraction no delay is added
    pub light: f64,

    /// Between light and medium adds a small delay
    pub medium: f64,

    /// Above heavy adds the largest delay
    pub heavy: f64,
}

impl Default for UsageThresholds {
    fn default() -> Self {
        Self {
            light: 0.5,
            medium: 0.75,
            heavy: 0.9,
        }
    }
}

/// Configuration for the rolling-window rate limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Global request cap within the rolling window
    pub hourly_request_limit: u32,

    /// Maximum concurrent in-flight calls per resource
    pub thread_limit_per_resource: u32,

    /// Usage tiers controlling the recommended delay
    pub usage_thresholds: UsageThresholds,

    /// When enabled, permission also requires the target zone to be healthy
    pub enable_zone_aware_throttling: bool,

    /// How long a queued request may wait for permission
    pub queue_timeout: Duration,

    /// Maximum queued permission requests before immediate rejection
    pub max_queue_size: usize,

    /// Rolling-window length the hourly cap applies to
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            hourly_request_limit: 1_000,
            thread_limit_per_resource: 4,
            usage_thresholds: UsageThresholds::default(),
            enable_zone_aware_throttling: true,
            queue_timeout: Duration::from_secs(30),
            max_queue_size: 500,
            window: Duration::from_secs(3_600),
        }
    }
}

impl RateLimiterConfig {
    /// Validate configuration invariants
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.hourly_request_limit == 0 {
            return Err(ValidationError::OutOfRange {
                field: "hourly_request_limit".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.thread_limit_per_resource == 0 {
            return Err(ValidationError::OutOfRange {
                field: "thread_limit_per_resource".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        let t = &self.usage_thresholds;
        if !(0.0..=1.0).contains(&t.light)
            || !(0.0..=1.0).contains(&t.medium)
            || !(0.0..=1.0).contains(&t.heavy)
            || t.light > t.medium
            || t.medium > t.heavy
        {
            return Err(ValidationError::OutOfRange {
                field: "usage_thresholds".to_string(),
                message: "must satisfy 0 <= light <= medium <= heavy <= 1".to_string(),
            });
        }
        if self.window.is_zero() {
            return Err(ValidationError::OutOfRange {
                field: "window".to_string(),
                message: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Configuration for one circuit breaker instance.
///
/// # Default Configuration
///
/// - Failure threshold: 5 failures within the monitoring window
/// - Monitoring window: 60 seconds
/// - Recovery timeout: 30 seconds
/// - Success threshold: 3 successes to close from half-open
/// - Half-open max concurrent trials: 3
/// - Minimum transition cooldown: 1 second
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Name for identification in events and logs
    pub name: String,

    /// Failures within the monitoring window that trip the circuit
    pub failure_threshold: u32,

    /// Sliding window failures are counted over
    pub failure_window: Duration,

    /// Time the circuit stays open before allowing trial requests
    pub recovery_timeout: Duration,

    /// Successes needed to close the circuit from half-open
    pub success_threshold: u32,

    /// Maximum concurrent trial requests in half-open
    pub half_open_max_requests: u32,

    /// Minimum time between state transitions, to prevent flapping
    pub min_transition_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "unknown".to_string(),
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 3,
            half_open_max_requests: 3,
            min_transition_interval: Duration::from_secs(1),
        }
    }
}

impl CircuitBreakerConfig {
    /// Configuration for a named resource with everything else defaulted
    pub fn for_resource(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Validate configuration invariants
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.failure_threshold == 0 {
            return Err(ValidationError::OutOfRange {
                field: "failure_threshold".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.success_threshold == 0 {
            return Err(ValidationError::OutOfRange {
                field: "success_threshold".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.half_open_max_requests == 0 {
            return Err(ValidationError::OutOfRange {
                field: "half_open_max_requests".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Breaker configuration tuned for primary zones.
///
/// Standard thresholds; trips after 5 window failures with a 30 second
/// cooldown.
pub fn primary_zone_breaker_config(name: impl Into<String>) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        name: name.into(),
        failure_threshold: 5,
        failure_window: Duration::from_secs(60),
        recovery_timeout: Duration::from_secs(30),
        success_threshold: 3,
        half_open_max_requests: 3,
        min_transition_interval: Duration::from_secs(1),
    }
}

/// Breaker configuration tuned for backup zones.
///
/// More tolerant: backup zones absorb failover traffic spikes, so they get a
/// higher threshold and a shorter cooldown.
pub fn backup_zone_breaker_config(name: impl Into<String>) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        name: name.into(),
        failure_threshold: 8,
        failure_window: Duration::from_secs(60),
        recovery_timeout: Duration::from_secs(15),
        success_threshold: 2,
        half_open_max_requests: 5,
        min_transition_interval: Duration::from_secs(1),
    }
}

// ============================================================================
// Retry Orchestrator
// ============================================================================

/// Configuration for classified retry and replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts after the initial call
    pub max_retries: u32,

    /// Base backoff delay for the first retry
    pub base_delay: Duration,

    /// Ceiling on any single computed delay
    pub max_delay: Duration,

    /// Exponential growth factor between attempts
    pub backoff_multiplier: f64,

    /// Jitter as a fraction of the computed delay (0.25 = ±25%)
    pub jitter_factor: f64,

    /// Per-resource breaker: failures within the window that trip it
    pub circuit_breaker_threshold: u32,

    /// Per-resource breaker: monitoring window
    pub circuit_breaker_window: Duration,

    /// Per-resource breaker: open-state cooldown
    pub circuit_breaker_recovery: Duration,

    /// Hand retry-exhausted eligible failures to the replay queue
    pub enable_request_replay: bool,

    /// Replay queue capacity
    pub replay_queue_size: usize,

    /// TTL for replayable requests
    pub replay_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.25,
            circuit_breaker_threshold: 5,
            circuit_breaker_window: Duration::from_secs(60),
            circuit_breaker_recovery: Duration::from_secs(30),
            enable_request_replay: true,
            replay_queue_size: 200,
            replay_timeout: Duration::from_secs(600),
        }
    }
}

impl RetryConfig {
    /// Validate configuration invariants
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.backoff_multiplier < 1.0 {
            return Err(ValidationError::OutOfRange {
                field: "backoff_multiplier".to_string(),
                message: "must be at least 1.0".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ValidationError::OutOfRange {
                field: "jitter_factor".to_string(),
                message: "must be between 0.0 and 1.0".to_string(),
            });
        }
        if self.base_delay > self.max_delay {
            return Err(ValidationError::OutOfRange {
                field: "base_delay".to_string(),
                message: "must not exceed max_delay".to_string(),
            });
        }
        Ok(())
    }

    /// Breaker configuration derived from the retry settings for a resource
    pub fn breaker_config(&self, name: impl Into<String>) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            name: name.into(),
            failure_threshold: self.circuit_breaker_threshold,
            failure_window: self.circuit_breaker_window,
            recovery_timeout: self.circuit_breaker_recovery,
            ..CircuitBreakerConfig::default()
        }
    }
}

// ============================================================================
// Zone Manager
// ============================================================================

/// Load-balancing strategy selector (the `Custom` variant lives in
/// [`crate::zones`] because it carries a trait object).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    RoundRobin,
    LeastLoaded,
    WeightedResponseTime,
}

/// Configuration for the zone registry and health probing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneManagerConfig {
    /// Strategy applied after filtering candidates
    pub load_balancing_strategy: StrategyKind,

    /// Interval between active health probes
    pub health_check_interval: Duration,

    /// Route probed on each zone
    pub health_check_route: String,

    /// Consecutive probe failures before a zone is marked unhealthy
    pub unhealthy_threshold: u32,

    /// EMA smoothing factor for response time and error rate
    pub ema_alpha: f64,
}

impl Default for ZoneManagerConfig {
    fn default() -> Self {
        Self {
            load_balancing_strategy: StrategyKind::RoundRobin,
            health_check_interval: Duration::from_secs(30),
            health_check_route: "health".to_string(),
            unhealthy_threshold: 3,
            ema_alpha: 0.3,
        }
    }
}

impl ZoneManagerConfig {
    /// Validate configuration invariants
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(0.0..=1.0).contains(&self.ema_alpha) {
            return Err(ValidationError::OutOfRange {
                field: "ema_alpha".to_string(),
                message: "must be between 0.0 and 1.0".to_string(),
            });
        }
        if self.unhealthy_threshold == 0 {
            return Err(ValidationError::OutOfRange {
                field: "unhealthy_threshold".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Reliability Manager
// ============================================================================

/// Thresholds that move the system out of the healthy state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DegradationThresholds {
    /// Queue utilization fraction that triggers degraded mode
    pub queue_utilization: f64,

    /// Rolling error-rate fraction that triggers degraded mode
    pub error_rate: f64,

    /// Rolling average response time (ms) that triggers degraded mode
    pub response_time_ms: f64,
}

impl Default for DegradationThresholds {
    fn default() -> Self {
        Self {
            queue_utilization: 0.7,
            error_rate: 0.25,
            response_time_ms: 5_000.0,
        }
    }
}

/// Configuration for the top-level reliability façade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Admission queue capacity
    pub max_queue_size: usize,

    /// Maximum cacheable reads coalesced into one batch
    pub batch_size: usize,

    /// Maximum time a batch accumulates before dispatch
    pub batch_timeout: Duration,

    /// Thresholds for entering degraded mode
    pub degradation_thresholds: DegradationThresholds,

    /// Queue utilization fraction that activates load shedding (critical mode)
    pub load_shedding_threshold: f64,

    /// Priority below which work is shed while shedding is active
    pub shedding_priority_floor: u8,

    /// Routes never shed regardless of priority
    pub critical_resources: Vec<String>,

    /// Deadline granted to every accepted request
    pub request_timeout: Duration,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1_000,
            batch_size: 10,
            batch_timeout: Duration::from_millis(50),
            degradation_thresholds: DegradationThresholds::default(),
            load_shedding_threshold: 0.9,
            shedding_priority_floor: 7,
            critical_resources: Vec::new(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl ReliabilityConfig {
    /// Validate configuration invariants
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_queue_size == 0 {
            return Err(ValidationError::OutOfRange {
                field: "max_queue_size".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.batch_size == 0 {
            return Err(ValidationError::OutOfRange {
                field: "batch_size".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.load_shedding_threshold) {
            return Err(ValidationError::OutOfRange {
                field: "load_shedding_threshold".to_string(),
                message: "must be between 0.0 and 1.0".to_string(),
            });
        }
        let d = &self.degradation_thresholds;
        if !(0.0..=1.0).contains(&d.queue_utilization) || !(0.0..=1.0).contains(&d.error_rate) {
            return Err(ValidationError::OutOfRange {
                field: "degradation_thresholds".to_string(),
                message: "fractions must be between 0.0 and 1.0".to_string(),
            });
        }
        if d.queue_utilization > self.load_shedding_threshold {
            return Err(ValidationError::OutOfRange {
                field: "degradation_thresholds.queue_utilization".to_string(),
                message: "must not exceed load_shedding_threshold".to_string(),
            });
        }
        Ok(())
    }

    /// Check if a route is designated critical
    pub fn is_critical_resource(&self, route: &str) -> bool {
        self.critical_resources.iter().any(|r| r == route)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
