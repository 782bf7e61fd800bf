//! Tests for error classification, recovery, and escalation tracking.

use super::*;
use crate::transport::TransportError;
use crate::ZoneId;

fn context() -> ErrorContext {
    ErrorContext::for_resource(ResourceKey::new(
        ZoneId::new("primary").expect("Valid zone"),
        "orders",
    ))
}

/// Test that known patterns win over status bucketing.
#[test]
fn test_known_pattern_connection_refused() {
    let classifier = ErrorClassifier::new();
    let error = TransportError::Network {
        message: "Connection refused by peer".to_string(),
    };

    let classified = classifier.classify(&error, &context());
    assert_eq!(classified.code, "CONN_REFUSED");
    assert_eq!(classified.kind, ErrorKind::Network);
    assert!(classified.retryable);
}

/// Test that credential patterns classify as non-retryable auth failures.
#[test]
fn test_known_pattern_invalid_credentials() {
    let classifier = ErrorClassifier::new();
    let error = TransportError::status(400, "invalid credentials supplied");

    let classified = classifier.classify(&error, &context());
    assert_eq!(classified.code, "BAD_CREDENTIALS");
    assert_eq!(classified.kind, ErrorKind::Auth);
    assert_eq!(classified.severity, Severity::Critical);
    assert!(!classified.retryable);
}

/// Test the timeout message heuristic.
#[test]
fn test_heuristic_timeout() {
    let classifier = ErrorClassifier::new();
    let error = TransportError::Network {
        message: "operation timed out after 30s".to_string(),
    };

    let classified = classifier.classify(&error, &context());
    assert_eq!(classified.code, "TIMEOUT");
    assert_eq!(classified.kind, ErrorKind::Network);
    assert!(classified.retryable);
}

/// Test 429 bucketing carries the server retry-after.
#[test]
fn test_status_bucket_rate_limit_with_retry_after() {
    let classifier = ErrorClassifier::new();
    let error = TransportError::Status {
        status: 429,
        message: "too many requests".to_string(),
        retry_after: Some(Duration::from_secs(2)),
    };

    let classified = classifier.classify(&error, &context());
    assert_eq!(classified.kind, ErrorKind::RateLimit);
    assert!(classified.retryable);
    assert_eq!(classified.retry_after(), Some(Duration::from_secs(2)));
}

/// Test 5xx bucketing.
#[test]
fn test_status_bucket_server_error() {
    let classifier = ErrorClassifier::new();
    let classified = classifier.classify(&TransportError::status(503, "unavailable"), &context());

    assert_eq!(classified.code, "HTTP_503");
    assert_eq!(classified.kind, ErrorKind::System);
    assert_eq!(classified.severity, Severity::High);
    assert!(classified.retryable);
}

/// Test 401/403 bucketing.
#[test]
fn test_status_bucket_auth() {
    let classifier = ErrorClassifier::new();
    let classified = classifier.classify(&TransportError::status(401, "denied"), &context());

    assert_eq!(classified.kind, ErrorKind::Auth);
    assert!(!classified.retryable);
}

/// Test other 4xx bucketing as non-retryable business errors.
#[test]
fn test_status_bucket_client_error() {
    let classifier = ErrorClassifier::new();
    let classified = classifier.classify(&TransportError::status(404, "missing"), &context());

    assert_eq!(classified.code, "HTTP_404");
    assert_eq!(classified.kind, ErrorKind::Business);
    assert!(!classified.retryable);
}

/// Test that unrecognized failures land in the conservative bucket.
#[test]
fn test_unknown_defaults_conservative() {
    let classifier = ErrorClassifier::new();
    let error = TransportError::Network {
        message: "something inexplicable".to_string(),
    };

    let classified = classifier.classify(&error, &context());
    assert!(classified.retryable);
    assert_eq!(classified.severity, Severity::High);
}

/// Test that the classification carries resource and attempt context.
#[test]
fn test_classification_carries_context() {
    let classifier = ErrorClassifier::new();
    let mut ctx = context();
    ctx.attempt = 3;

    let classified = classifier.classify(&TransportError::status(503, "unavailable"), &ctx);
    assert_eq!(classified.attempts, 3);
    assert!(classified.resource.is_some());
}

/// Test replay eligibility per kind.
#[test]
fn test_replay_eligibility() {
    assert!(ErrorKind::System.is_replay_eligible());
    assert!(ErrorKind::Network.is_replay_eligible());
    assert!(ErrorKind::RateLimit.is_replay_eligible());
    assert!(!ErrorKind::Auth.is_replay_eligible());
    assert!(!ErrorKind::Validation.is_replay_eligible());
    assert!(!ErrorKind::Business.is_replay_eligible());
}

// ============================================================================
// Recovery
// ============================================================================

struct RecordingHandler {
    fail_on: Option<RecoveryAction>,
    performed: std::sync::Mutex<Vec<RecoveryAction>>,
}

impl RecordingHandler {
    fn new(fail_on: Option<RecoveryAction>) -> Self {
        Self {
            fail_on,
            performed: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl RecoveryHandler for RecordingHandler {
    async fn perform(&self, step: &RecoveryStep) -> Result<(), String> {
        self.performed.lock().unwrap().push(step.action);
        if self.fail_on == Some(step.action) {
            Err("handler refused".to_string())
        } else {
            Ok(())
        }
    }
}

/// Test that auth errors get a refresh-then-manual procedure.
#[test]
fn test_recovery_strategy_auth() {
    let classifier = ErrorClassifier::new();
    let classified = classifier.classify(&TransportError::status(401, "denied"), &context());

    let strategy = classifier.recovery_strategy(&classified);
    assert_eq!(strategy.steps[0].action, RecoveryAction::RefreshAuth);
    assert!(strategy
        .steps
        .iter()
        .any(|s| s.action == RecoveryAction::Manual));
}

/// Test that rate-limit recovery waits for the server retry-after.
#[test]
fn test_recovery_strategy_rate_limit_wait() {
    let classifier = ErrorClassifier::new();
    let error = TransportError::Status {
        status: 429,
        message: "too many requests".to_string(),
        retry_after: Some(Duration::from_millis(1_500)),
    };
    let classified = classifier.classify(&error, &context());

    let strategy = classifier.recovery_strategy(&classified);
    assert_eq!(strategy.steps[0].action, RecoveryAction::Wait);
    assert_eq!(strategy.steps[0].params.get("delay_ms"), Some(&1_500));
}

/// Test that execution halts at the first non-optional failure.
#[tokio::test]
async fn test_recovery_halts_on_required_failure() {
    let strategy = RecoveryStrategy {
        steps: vec![
            RecoveryStep::required(RecoveryAction::Retry),
            RecoveryStep::required(RecoveryAction::Failover),
            RecoveryStep::required(RecoveryAction::Alert),
        ],
    };
    let handler = RecordingHandler::new(Some(RecoveryAction::Failover));

    let report = execute_recovery(&strategy, &handler).await;
    assert!(!report.succeeded());
    assert_eq!(report.completed, vec![RecoveryAction::Retry]);
    assert_eq!(
        report.halted_at.as_ref().map(|(a, _)| *a),
        Some(RecoveryAction::Failover)
    );
}

/// Test that optional failures do not halt execution.
#[tokio::test]
async fn test_recovery_optional_failure_continues() {
    let strategy = RecoveryStrategy {
        steps: vec![
            RecoveryStep::optional(RecoveryAction::Failover),
            RecoveryStep::required(RecoveryAction::Retry),
        ],
    };
    let handler = RecordingHandler::new(Some(RecoveryAction::Failover));

    let report = execute_recovery(&strategy, &handler).await;
    assert!(report.succeeded());
    assert_eq!(
        report.completed,
        vec![RecoveryAction::Failover, RecoveryAction::Retry]
    );
}

/// Test that a Manual step always fails and halts.
#[tokio::test]
async fn test_recovery_manual_always_halts() {
    let strategy = RecoveryStrategy {
        steps: vec![
            RecoveryStep::required(RecoveryAction::Manual),
            RecoveryStep::required(RecoveryAction::Retry),
        ],
    };
    let handler = RecordingHandler::new(None);

    let report = execute_recovery(&strategy, &handler).await;
    assert!(!report.succeeded());
    assert!(report.completed.is_empty());
    // The handler is never consulted for Manual
    assert!(handler.performed.lock().unwrap().is_empty());
}

// ============================================================================
// Error History
// ============================================================================

fn system_error() -> ClassifiedError {
    let classifier = ErrorClassifier::new();
    classifier.classify(&TransportError::status(503, "unavailable"), &context())
}

/// Test that escalation fires once frequency crosses the threshold.
#[test]
fn test_history_escalates_on_frequency() {
    let mut history =
        ErrorHistory::new(Duration::from_secs(60), 100).with_escalation_thresholds(3, Severity::Critical);

    assert!(history.record(&system_error()).is_none());
    assert!(history.record(&system_error()).is_none());
    let notice = history.record(&system_error());

    let notice = notice.expect("Third occurrence should escalate");
    assert_eq!(notice.kind, ErrorKind::System);
    assert_eq!(notice.occurrences, 3);
    assert!(history.is_escalated(ErrorKind::System));
}

/// Test that escalation is edge-triggered, not repeated per record.
#[test]
fn test_history_escalation_edge_triggered() {
    let mut history =
        ErrorHistory::new(Duration::from_secs(60), 100).with_escalation_thresholds(2, Severity::Critical);

    assert!(history.record(&system_error()).is_none());
    assert!(history.record(&system_error()).is_some());
    assert!(history.record(&system_error()).is_none());
}

/// Test that a critical-severity error escalates immediately.
#[test]
fn test_history_escalates_on_severity() {
    let mut history = ErrorHistory::new(Duration::from_secs(60), 100)
        .with_escalation_thresholds(100, Severity::Critical);
    let classifier = ErrorClassifier::new();
    let critical =
        classifier.classify(&TransportError::status(400, "invalid credentials"), &context());
    assert_eq!(critical.severity, Severity::Critical);

    assert!(history.record(&critical).is_some());
}

/// Test per-kind statistics.
#[test]
fn test_history_stats_track_resources() {
    let mut history = ErrorHistory::new(Duration::from_secs(60), 100);
    history.record(&system_error());
    history.record(&system_error());

    let stats = history.stats();
    let system = stats
        .iter()
        .find(|s| s.kind == ErrorKind::System)
        .expect("System stats present");
    assert_eq!(system.occurrences, 2);
    assert_eq!(system.affected_resources.len(), 1);
    assert!(system.last_occurrence.is_some());
}

/// Test severity ordering used by escalation.
#[test]
fn test_severity_ordering() {
    assert!(Severity::Critical > Severity::High);
    assert!(Severity::High > Severity::Medium);
    assert!(Severity::Medium > Severity::Low);
}
