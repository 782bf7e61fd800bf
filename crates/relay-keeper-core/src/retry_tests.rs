//! Tests for backoff math and the retry orchestrator.

use super::*;
use crate::events::EventBus;
use crate::monitoring::NoOpMetricsCollector;
use crate::transport::{ScriptedTransport, Transport};
use crate::ZoneId;
use std::sync::atomic::{AtomicU32, Ordering};

fn fast_config() -> RetryConfig {
    RetryConfig {
        max_retries: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(50),
        backoff_multiplier: 2.0,
        jitter_factor: 0.0,
        circuit_breaker_threshold: 100,
        ..RetryConfig::default()
    }
}

fn orchestrator(config: RetryConfig) -> RetryOrchestrator {
    orchestrator_with_metrics(config, Arc::new(NoOpMetricsCollector))
}

fn orchestrator_with_metrics(
    config: RetryConfig,
    metrics: Arc<dyn MetricsCollector>,
) -> RetryOrchestrator {
    let events = EventBus::new();
    let breakers = Arc::new(CircuitBreakerRegistry::new(
        config.breaker_config("resource"),
        events.clone(),
        service_failure_predicate(),
    ));
    let replay = Arc::new(ReplayQueue::new(
        config.replay_queue_size,
        config.replay_timeout,
        events,
    ));
    RetryOrchestrator::new(config, breakers, replay, metrics)
}

fn resource(route: &str) -> ResourceKey {
    ResourceKey::new(ZoneId::new("primary").expect("Valid zone"), route)
}

fn classify(error: &TransportError) -> ClassifiedError {
    ErrorClassifier::new().classify(error, &ErrorContext::default())
}

// ============================================================================
// Retry Policy
// ============================================================================

/// Test that raw backoff grows exponentially and caps at the ceiling.
#[test]
fn test_raw_delay_monotone_and_capped() {
    let policy = RetryPolicy {
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        backoff_multiplier: 2.0,
        jitter_factor: 0.0,
    };

    assert_eq!(policy.raw_delay(0), Duration::ZERO);
    assert_eq!(policy.raw_delay(1), Duration::from_millis(100));
    assert_eq!(policy.raw_delay(2), Duration::from_millis(200));
    assert_eq!(policy.raw_delay(3), Duration::from_millis(400));
    assert_eq!(policy.raw_delay(4), Duration::from_millis(800));
    // Capped from here on
    assert_eq!(policy.raw_delay(5), Duration::from_secs(1));
    assert_eq!(policy.raw_delay(10), Duration::from_secs(1));

    for attempt in 1..12 {
        assert!(policy.raw_delay(attempt) <= policy.raw_delay(attempt + 1));
    }
}

/// Test that a server-supplied retry-after overrides the computed backoff.
#[test]
fn test_delay_honors_server_retry_after() {
    let policy = RetryPolicy {
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(30),
        backoff_multiplier: 2.0,
        jitter_factor: 0.0,
    };
    let classified = classify(&TransportError::Status {
        status: 429,
        message: "rate limited".to_string(),
        retry_after: Some(Duration::from_secs(2)),
    });

    assert_eq!(
        policy.delay_for(1, &classified, Duration::ZERO),
        Duration::from_secs(2)
    );
    // Even a large learned adjustment does not displace the server's answer
    assert_eq!(
        policy.delay_for(3, &classified, Duration::from_secs(10)),
        Duration::from_secs(2)
    );
}

/// Test that the learned adjustment adds to the backoff under the cap.
#[test]
fn test_delay_adds_learned_adjustment() {
    let policy = RetryPolicy {
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(30),
        backoff_multiplier: 2.0,
        jitter_factor: 0.0,
    };
    let classified = classify(&TransportError::status(503, "unavailable"));

    assert_eq!(
        policy.delay_for(1, &classified, Duration::from_millis(500)),
        Duration::from_millis(600)
    );
}

/// Test that jitter stays within the configured fraction of the delay.
#[test]
fn test_jitter_bounds() {
    let policy = RetryPolicy {
        base_delay: Duration::from_millis(1_000),
        max_delay: Duration::from_secs(30),
        backoff_multiplier: 2.0,
        jitter_factor: 0.25,
    };
    let classified = classify(&TransportError::status(503, "unavailable"));

    for _ in 0..50 {
        let delay = policy.delay_for(1, &classified, Duration::ZERO);
        assert!(delay >= Duration::from_millis(750), "got {:?}", delay);
        assert!(delay <= Duration::from_millis(1_250), "got {:?}", delay);
    }
}

/// Test the breaker failure predicate: service health only.
#[test]
fn test_service_failure_predicate() {
    let is_failure = service_failure_predicate();

    assert!(is_failure(&TransportError::status(500, "boom")));
    assert!(is_failure(&TransportError::status(503, "unavailable")));
    assert!(is_failure(&TransportError::Network {
        message: "refused".to_string()
    }));
    assert!(is_failure(&TransportError::Timeout { elapsed_ms: 5_000 }));

    // Rate limiting and client errors say nothing about service health
    assert!(!is_failure(&TransportError::status(429, "rate limited")));
    assert!(!is_failure(&TransportError::status(404, "missing")));
    assert!(!is_failure(&TransportError::status(401, "unauthorized")));
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Test that a transient failure is retried and the retry succeeds.
#[tokio::test]
async fn test_transient_failure_retries_to_success() {
    let orchestrator = orchestrator(fast_config());
    let transport = Arc::new(ScriptedTransport::new());
    let request = CallRequest::new(resource("orders"), Method::Get);
    transport.script(
        &request.resource,
        vec![
            Err(TransportError::status(503, "unavailable")),
            Ok(CallOutcome::ok()),
        ],
    );

    let outcome = orchestrator
        .execute_with_retry(&request, Priority::NORMAL, || {
            let transport = Arc::clone(&transport);
            let request = request.clone();
            async move { transport.send(&request).await }
        })
        .await
        .unwrap();

    assert_eq!(outcome.status, 200);
    assert_eq!(transport.call_count(), 2);
}

/// Test that every retry attempt is reported to the metrics collector with
/// its resource label.
#[tokio::test]
async fn test_retry_attempts_are_recorded() {
    #[derive(Default)]
    struct RetryCountingCollector {
        resources: Mutex<Vec<String>>,
    }

    impl MetricsCollector for RetryCountingCollector {
        fn record_request(&self, _duration: Duration, _success: bool) {}
        fn record_error(&self, _category: &str, _is_transient: bool) {}
        fn record_retry_attempt(&self, resource: &str) {
            self.resources
                .lock()
                .expect("collector lock poisoned")
                .push(resource.to_string());
        }
        fn record_circuit_breaker_state(&self, _resource: &str, _state: i64) {}
        fn record_queue_depth(&self, _depth: usize) {}
        fn record_replay_queue_depth(&self, _depth: usize) {}
        fn record_quota_usage(&self, _fraction: f64) {}
        fn record_shed_request(&self, _priority: u8) {}
        fn record_zone_health(&self, _zone: &str, _healthy: bool) {}
    }

    let collector = Arc::new(RetryCountingCollector::default());
    let orchestrator = orchestrator_with_metrics(fast_config(), Arc::clone(&collector) as Arc<dyn MetricsCollector>);
    let transport = Arc::new(ScriptedTransport::new());
    let request = CallRequest::new(resource("orders"), Method::Get);
    transport.script(
        &request.resource,
        vec![
            Err(TransportError::status(503, "unavailable")),
            Err(TransportError::status(503, "unavailable")),
            Ok(CallOutcome::ok()),
        ],
    );

    orchestrator
        .execute_with_retry(&request, Priority::NORMAL, || {
            let transport = Arc::clone(&transport);
            let request = request.clone();
            async move { transport.send(&request).await }
        })
        .await
        .unwrap();

    let recorded = collector.resources.lock().expect("collector lock poisoned");
    assert_eq!(recorded.as_slice(), ["primary:orders", "primary:orders"]);
}

/// Test that auth failures get zero retries.
#[tokio::test]
async fn test_auth_failure_is_not_retried() {
    let orchestrator = orchestrator(fast_config());
    let transport = Arc::new(ScriptedTransport::new());
    let request = CallRequest::new(resource("orders"), Method::Get);
    transport.script(
        &request.resource,
        vec![Err(TransportError::status(401, "unauthorized"))],
    );

    let error = orchestrator
        .execute_with_retry(&request, Priority::NORMAL, || {
            let transport = Arc::clone(&transport);
            let request = request.clone();
            async move { transport.send(&request).await }
        })
        .await
        .unwrap_err();

    assert_eq!(transport.call_count(), 1);
    match error {
        RelayError::Classified(classified) => {
            assert_eq!(classified.kind, ErrorKind::Auth);
            assert!(!classified.retryable);
        }
        other => panic!("Expected classified error, got {:?}", other),
    }
}

/// Test that business failures (404) get zero retries.
#[tokio::test]
async fn test_business_failure_is_not_retried() {
    let orchestrator = orchestrator(fast_config());
    let transport = Arc::new(ScriptedTransport::new());
    let request = CallRequest::new(resource("orders"), Method::Get);
    transport.script(
        &request.resource,
        vec![Err(TransportError::status(404, "missing"))],
    );

    let error = orchestrator
        .execute_with_retry(&request, Priority::NORMAL, || {
            let transport = Arc::clone(&transport);
            let request = request.clone();
            async move { transport.send(&request).await }
        })
        .await
        .unwrap_err();

    assert_eq!(transport.call_count(), 1);
    assert!(matches!(error, RelayError::Classified(c) if c.kind == ErrorKind::Business));
}

/// Test that exhausted retries park an eligible request on the replay queue
/// and still raise the terminal error.
#[tokio::test]
async fn test_exhausted_retries_park_for_replay() {
    let orchestrator = orchestrator(fast_config());
    let transport = Arc::new(ScriptedTransport::new());
    let request = CallRequest::new(resource("orders"), Method::Post);
    transport.script(
        &request.resource,
        vec![Err(TransportError::status(503, "unavailable"))],
    );

    let error = orchestrator
        .execute_with_retry(&request, Priority::NORMAL, || {
            let transport = Arc::clone(&transport);
            let request = request.clone();
            async move { transport.send(&request).await }
        })
        .await
        .unwrap_err();

    // Initial attempt plus max_retries
    assert_eq!(transport.call_count(), 3);
    assert!(matches!(error, RelayError::Classified(_)));

    let parked = orchestrator.replay_queue();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked.stats().total_enqueued, 1);
}

/// Test that replay handoff can be disabled.
#[tokio::test]
async fn test_replay_handoff_disabled() {
    let orchestrator = orchestrator(RetryConfig {
        enable_request_replay: false,
        ..fast_config()
    });
    let transport = Arc::new(ScriptedTransport::new());
    let request = CallRequest::new(resource("orders"), Method::Post);
    transport.script(
        &request.resource,
        vec![Err(TransportError::status(503, "unavailable"))],
    );

    let _ = orchestrator
        .execute_with_retry(&request, Priority::NORMAL, || {
            let transport = Arc::clone(&transport);
            let request = request.clone();
            async move { transport.send(&request).await }
        })
        .await;

    assert!(orchestrator.replay_queue().is_empty());
}

/// Test that the breaker opens mid-loop and short-circuits the next attempt.
#[tokio::test]
async fn test_breaker_opens_during_retries() {
    let orchestrator = orchestrator(RetryConfig {
        max_retries: 5,
        circuit_breaker_threshold: 2,
        ..fast_config()
    });
    let transport = Arc::new(ScriptedTransport::new());
    let request = CallRequest::new(resource("orders"), Method::Get);
    transport.script(
        &request.resource,
        vec![Err(TransportError::status(503, "unavailable"))],
    );

    let error = orchestrator
        .execute_with_retry(&request, Priority::NORMAL, || {
            let transport = Arc::clone(&transport);
            let request = request.clone();
            async move { transport.send(&request).await }
        })
        .await
        .unwrap_err();

    // Two counted failures trip the breaker; the third attempt never reaches
    // the transport
    assert!(matches!(error, RelayError::CircuitOpen { .. }));
    assert_eq!(transport.call_count(), 2);
}

/// Test that concurrent identical reads share one execution.
#[tokio::test]
async fn test_dedup_shares_one_execution() {
    let orchestrator = Arc::new(orchestrator(fast_config()));
    let request = CallRequest::new(resource("orders"), Method::Get);
    let invocations = Arc::new(AtomicU32::new(0));
    let gate = Arc::new(tokio::sync::Notify::new());

    let mut callers = Vec::new();
    for _ in 0..3 {
        let orchestrator = Arc::clone(&orchestrator);
        let request = request.clone();
        let invocations = Arc::clone(&invocations);
        let gate = Arc::clone(&gate);
        callers.push(tokio::spawn(async move {
            orchestrator
                .execute_with_retry(&request, Priority::NORMAL, move || {
                    let invocations = Arc::clone(&invocations);
                    let gate = Arc::clone(&gate);
                    async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        Ok(CallOutcome::ok())
                    }
                })
                .await
        }));
        // Let the first caller become leader before the rest join
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    gate.notify_waiters();
    for caller in callers {
        let outcome = caller.await.unwrap().unwrap();
        assert_eq!(outcome.status, 200);
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

/// Test that requests with different resources do not deduplicate.
#[tokio::test]
async fn test_distinct_resources_execute_independently() {
    let orchestrator = Arc::new(orchestrator(fast_config()));
    let transport = Arc::new(ScriptedTransport::new());

    for route in ["orders", "users"] {
        let request = CallRequest::new(resource(route), Method::Get);
        orchestrator
            .execute_with_retry(&request, Priority::NORMAL, || {
                let transport = Arc::clone(&transport);
                let request = request.clone();
                async move { transport.send(&request).await }
            })
            .await
            .unwrap();
    }

    assert_eq!(transport.call_count(), 2);
}
