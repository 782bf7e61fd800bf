//! Tests for the metrics collection hooks.

use super::*;
use std::sync::Arc;

/// Test that the no-op collector accepts every hook through a trait object.
#[test]
fn test_noop_collector_accepts_all_hooks() {
    let metrics: Arc<dyn MetricsCollector> = Arc::new(NoOpMetricsCollector);

    metrics.record_request(Duration::from_millis(150), true);
    metrics.record_request(Duration::from_millis(5), false);
    metrics.record_error("system", true);
    metrics.record_error("auth", false);
    metrics.record_retry_attempt("primary:orders");
    metrics.record_circuit_breaker_state("primary:orders", 1);
    metrics.record_queue_depth(12);
    metrics.record_replay_queue_depth(3);
    metrics.record_quota_usage(0.42);
    metrics.record_shed_request(2);
    metrics.record_zone_health("primary", true);
    metrics.record_zone_health("backup", false);
}

/// Test that the no-op collector can be shared across tasks.
#[tokio::test]
async fn test_noop_collector_is_shareable() {
    let metrics: Arc<dyn MetricsCollector> = Arc::new(NoOpMetricsCollector);

    let handles: Vec<_> = (0..4)
        .map(|index| {
            let metrics = Arc::clone(&metrics);
            tokio::spawn(async move {
                metrics.record_queue_depth(index);
            })
        })
        .collect();
    for handle in handles {
        handle.await.expect("Task should complete");
    }
}
