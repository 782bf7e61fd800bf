//! Tests for the replay queue and its drain cycle.

use super::*;
use crate::classify::{ErrorClassifier, ErrorContext};
use crate::config::CircuitBreakerConfig;
use crate::ZoneId;
use std::sync::atomic::AtomicUsize;

fn resource(route: &str) -> ResourceKey {
    ResourceKey::new(ZoneId::new("primary").expect("Valid zone"), route)
}

fn entry(route: &str, priority: Priority, max_attempts: u32) -> ReplayableRequest {
    let error = ErrorClassifier::new().classify(
        &TransportError::status(503, "unavailable"),
        &ErrorContext::default(),
    );
    ReplayableRequest::new(
        resource(route),
        Method::Post,
        Some(serde_json::json!({"sku": route})),
        HashMap::new(),
        priority,
        max_attempts,
        error,
    )
}

fn registry() -> CircuitBreakerRegistry<TransportError> {
    CircuitBreakerRegistry::new(
        CircuitBreakerConfig::for_resource("template"),
        EventBus::new(),
        Arc::new(|_| true),
    )
}

/// Scripted executor: succeeds or fails per resource route.
struct StubExecutor {
    fail_routes: Vec<String>,
    replays: AtomicUsize,
}

impl StubExecutor {
    fn succeeding() -> Self {
        Self {
            fail_routes: Vec::new(),
            replays: AtomicUsize::new(0),
        }
    }

    fn failing_on(routes: &[&str]) -> Self {
        Self {
            fail_routes: routes.iter().map(|r| r.to_string()).collect(),
            replays: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ReplayExecutor for StubExecutor {
    async fn replay(&self, request: &ReplayableRequest) -> Result<CallOutcome, TransportError> {
        self.replays.fetch_add(1, Ordering::SeqCst);
        if self.fail_routes.iter().any(|r| *r == request.resource.route) {
            Err(TransportError::status(503, "still down"))
        } else {
            Ok(CallOutcome::ok())
        }
    }
}

/// Test enqueue below capacity.
#[test]
fn test_enqueue_below_capacity() {
    let queue = ReplayQueue::new(10, Duration::from_secs(600), EventBus::new());

    assert!(queue.enqueue(entry("orders", Priority::NORMAL, 3)));
    assert!(queue.enqueue(entry("users", Priority::NORMAL, 3)));

    assert_eq!(queue.len(), 2);
    let stats = queue.stats();
    assert_eq!(stats.total_enqueued, 2);
    assert_eq!(stats.total_dropped, 0);
}

/// Test that a full queue evicts the lowest-priority entry for a more
/// important arrival.
#[test]
fn test_capacity_evicts_lowest_priority() {
    let queue = ReplayQueue::new(2, Duration::from_secs(600), EventBus::new());
    queue.enqueue(entry("low", Priority::new(1), 3));
    queue.enqueue(entry("mid", Priority::new(5), 3));

    assert!(queue.enqueue(entry("high", Priority::new(9), 3)));

    assert_eq!(queue.len(), 2);
    assert_eq!(queue.stats().total_dropped, 1);
}

/// Test that an arrival less important than everything queued is dropped.
#[test]
fn test_capacity_drops_least_important_arrival() {
    let queue = ReplayQueue::new(2, Duration::from_secs(600), EventBus::new());
    queue.enqueue(entry("a", Priority::new(5), 3));
    queue.enqueue(entry("b", Priority::new(5), 3));

    assert!(!queue.enqueue(entry("c", Priority::new(1), 3)));

    assert_eq!(queue.len(), 2);
    assert_eq!(queue.stats().total_enqueued, 2);
    assert_eq!(queue.stats().total_dropped, 1);
}

/// Test that a successful drain removes the entry and counts the replay.
#[tokio::test]
async fn test_drain_replays_successfully() {
    let queue = ReplayQueue::new(10, Duration::from_secs(600), EventBus::new());
    queue.enqueue(entry("orders", Priority::NORMAL, 3));

    let executor = StubExecutor::succeeding();
    queue.drain_cycle(&executor, &registry(), 10).await;

    assert!(queue.is_empty());
    assert_eq!(queue.stats().total_replayed, 1);
    assert_eq!(executor.replays.load(Ordering::SeqCst), 1);
}

/// Test that a failed replay below the attempt cap is re-queued.
#[tokio::test]
async fn test_drain_requeues_nonterminal_failure() {
    let queue = ReplayQueue::new(10, Duration::from_secs(600), EventBus::new());
    queue.enqueue(entry("orders", Priority::NORMAL, 3));

    let executor = StubExecutor::failing_on(&["orders"]);
    queue.drain_cycle(&executor, &registry(), 10).await;

    assert_eq!(queue.len(), 1);
    assert_eq!(queue.stats().total_failed, 0);
}

/// Test that exhausting replay attempts drops the entry as terminal.
#[tokio::test]
async fn test_drain_drops_terminal_failure() {
    let queue = ReplayQueue::new(10, Duration::from_secs(600), EventBus::new());
    queue.enqueue(entry("orders", Priority::NORMAL, 2));

    let executor = StubExecutor::failing_on(&["orders"]);
    let breakers = registry();
    queue.drain_cycle(&executor, &breakers, 10).await;
    assert_eq!(queue.len(), 1);
    queue.drain_cycle(&executor, &breakers, 10).await;

    assert!(queue.is_empty());
    assert_eq!(queue.stats().total_failed, 1);
    assert_eq!(executor.replays.load(Ordering::SeqCst), 2);
}

/// Test that drain replays higher-priority entries first.
#[tokio::test]
async fn test_drain_respects_priority_order() {
    let queue = ReplayQueue::new(10, Duration::from_secs(600), EventBus::new());
    queue.enqueue(entry("low", Priority::new(2), 3));
    queue.enqueue(entry("high", Priority::new(9), 3));

    let executor = StubExecutor::succeeding();
    // Batch of one takes only the most important entry
    queue.drain_cycle(&executor, &registry(), 1).await;

    assert_eq!(queue.len(), 1);
    let remaining = queue.entries.lock().unwrap();
    assert_eq!(remaining[0].resource.route, "low");
}

/// Test that entries whose circuit is open are skipped, not dropped.
#[tokio::test]
async fn test_drain_skips_open_circuits() {
    let queue = ReplayQueue::new(10, Duration::from_secs(600), EventBus::new());
    queue.enqueue(entry("orders", Priority::NORMAL, 3));
    queue.enqueue(entry("users", Priority::NORMAL, 3));

    let breakers = registry();
    let orders_breaker = breakers.breaker_for(&resource("orders"));
    for _ in 0..5 {
        orders_breaker.record_failure();
    }
    assert!(!orders_breaker.is_healthy());

    let executor = StubExecutor::succeeding();
    queue.drain_cycle(&executor, &breakers, 10).await;

    // The reachable entry replayed; the blocked one is still parked
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.stats().total_replayed, 1);
    assert_eq!(executor.replays.load(Ordering::SeqCst), 1);
}

/// Test that expired entries are dropped before the batch is taken.
#[tokio::test]
async fn test_drain_expires_stale_entries() {
    let queue = ReplayQueue::new(10, Duration::ZERO, EventBus::new());
    queue.enqueue(entry("orders", Priority::NORMAL, 3));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let executor = StubExecutor::succeeding();
    queue.drain_cycle(&executor, &registry(), 10).await;

    assert!(queue.is_empty());
    assert_eq!(queue.stats().total_dropped, 1);
    assert_eq!(executor.replays.load(Ordering::SeqCst), 0);
}

/// Test the periodic drain task end to end.
#[tokio::test]
async fn test_spawn_drain_runs_until_stopped() {
    let queue = Arc::new(ReplayQueue::new(10, Duration::from_secs(600), EventBus::new()));
    queue.enqueue(entry("orders", Priority::NORMAL, 3));

    let executor = Arc::new(StubExecutor::succeeding());
    let breakers = Arc::new(registry());
    let handle = queue.spawn_drain(
        Arc::clone(&executor) as Arc<dyn ReplayExecutor>,
        Arc::clone(&breakers),
        Duration::from_millis(10),
        10,
    );

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(queue.is_empty());

    queue.stop();
    handle.await.unwrap();
}
