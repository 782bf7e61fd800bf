//! Metrics collection hooks.
//!
//! This module defines what the pipeline measures via a trait; infrastructure
//! layers implement it against whatever metrics backend a deployment uses.
//! Recording is best-effort: metric failures never block request processing.
//!
//! # Examples
//!
//! ```rust
//! use relay_keeper_core::monitoring::{MetricsCollector, NoOpMetricsCollector};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let metrics: Arc<dyn MetricsCollector> = Arc::new(NoOpMetricsCollector);
//!
//! metrics.record_request(Duration::from_millis(150), true);
//! metrics.record_queue_depth(12);
//! metrics.record_circuit_breaker_state("eu-west:orders", 0);
//! ```

use std::time::Duration;

/// Metrics collector for pipeline operations.
///
/// All methods take `&self` to support `Arc<dyn MetricsCollector>` sharing
/// across async tasks. Implementations must be thread-safe and must never
/// propagate errors into business logic.
pub trait MetricsCollector: Send + Sync {
    /// Record one completed pipeline request.
    ///
    /// # Parameters
    ///
    /// - `duration`: End-to-end time including queueing and retries
    /// - `success`: Whether the caller got a successful result
    fn record_request(&self, duration: Duration, success: bool);

    /// Record an error occurrence.
    ///
    /// # Parameters
    ///
    /// - `category`: Error category label (e.g. "system", "auth", "rate_limit")
    /// - `is_transient`: Whether the error is transient (retriable)
    fn record_error(&self, category: &str, is_transient: bool);

    /// Record a retry attempt against a resource
    fn record_retry_attempt(&self, resource: &str);

    /// Record circuit breaker state.
    ///
    /// # Parameters
    ///
    /// - `resource`: Resource key the breaker guards
    /// - `state`: Circuit state (0=closed, 1=open, 2=half-open)
    fn record_circuit_breaker_state(&self, resource: &str, state: i64);

    /// Record current admission queue depth
    fn record_queue_depth(&self, depth: usize);

    /// Record current replay queue depth
    fn record_replay_queue_depth(&self, depth: usize);

    /// Record rolling-window quota usage as a fraction of the cap
    fn record_quota_usage(&self, fraction: f64);

    /// Record a request rejected by load shedding
    fn record_shed_request(&self, priority: u8);

    /// Record a zone health assessment (1 healthy, 0 unhealthy)
    fn record_zone_health(&self, zone: &str, healthy: bool);
}

/// No-op metrics collector for testing.
///
/// Silently ignores all metric recording calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetricsCollector;

impl MetricsCollector for NoOpMetricsCollector {
    fn record_request(&self, _duration: Duration, _success: bool) {
        // No-op
    }

    fn record_error(&self, _category: &str, _is_transient: bool) {
        // No-op
    }

    fn record_retry_attempt(&self, _resource: &str) {
        // No-op
    }

    fn record_circuit_breaker_state(&self, _resource: &str, _state: i64) {
        // No-op
    }

    fn record_queue_depth(&self, _depth: usize) {
        // No-op
    }

    fn record_replay_queue_depth(&self, _depth: usize) {
        // No-op
    }

    fn record_quota_usage(&self, _fraction: f64) {
        // No-op
    }

    fn record_shed_request(&self, _priority: u8) {
        // No-op
    }

    fn record_zone_health(&self, _zone: &str, _healthy: bool) {
        // No-op
    }
}

#[cfg(test)]
#[path = "monitoring_tests.rs"]
mod tests;
