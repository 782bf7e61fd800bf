//! Error classification, recovery strategies, and escalation tracking.
//!
//! Every raw transport failure is classified exactly once at the boundary into
//! a [`ClassifiedError`] carrying kind, severity, retryability, and a
//! recommended action. All downstream logic (retry, circuit breaking, zone
//! selection) operates only on the classified form.
//!
//! Resolution order:
//! 1. Exact known-pattern table
//! 2. Message-heuristic matching
//! 3. Generic status-code bucketing
//!
//! Unrecognized failures default to the most conservative bucket
//! (System/High/retryable) rather than being dropped.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::transport::TransportError;
use crate::{ResourceKey, Timestamp};

// ============================================================================
// Taxonomy
// ============================================================================

/// High-level error category driving retry and recovery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Service-side failure (5xx, unknown); retryable with backoff
    System,
    /// Request was semantically rejected (4xx); caller must fix it
    Business,
    /// Request was syntactically rejected; caller must fix it
    Validation,
    /// Credentials missing, expired, or insufficient; non-retryable
    Auth,
    /// Quota exceeded; retryable, honoring a server retry-after when present
    RateLimit,
    /// Transport-level failure; retryable with backoff
    Network,
}

impl ErrorKind {
    /// Get string representation for logs and metrics labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Business => "business",
            Self::Validation => "validation",
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::Network => "network",
        }
    }

    /// Kinds eligible for the replay queue after retries are exhausted
    pub fn is_replay_eligible(&self) -> bool {
        matches!(self, Self::System | Self::Network | Self::RateLimit)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Severity of a classified error.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Get string representation for logs and metrics labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

// ============================================================================
// Classified Error
// ============================================================================

/// Fully classified failure, the only error form downstream logic sees.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct ClassifiedError {
    /// Stable machine-readable code (e.g. "HTTP_503", "CONN_REFUSED")
    pub code: String,

    /// Error category
    pub kind: ErrorKind,

    /// Severity for alerting and escalation
    pub severity: Severity,

    /// Whether an identical call may succeed if retried
    pub retryable: bool,

    /// Human-readable recommended action for operators
    pub recommended_action: String,

    /// Server-supplied retry-after in milliseconds, when present
    pub retry_after_ms: Option<u64>,

    /// Resource the failing call targeted, when known
    pub resource: Option<ResourceKey>,

    /// Attempts made before this error became terminal
    pub attempts: u32,

    /// Human-readable failure description
    pub message: String,
}

impl ClassifiedError {
    /// Server retry-after as a [`Duration`], when present
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

/// Context handed to the classifier alongside the raw error.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Resource the failing call targeted
    pub resource: Option<ResourceKey>,

    /// Attempt number of the failing call (1-based)
    pub attempt: u32,
}

impl ErrorContext {
    /// Create context for a call against a resource
    pub fn for_resource(resource: ResourceKey) -> Self {
        Self {
            resource: Some(resource),
            attempt: 1,
        }
    }
}

// ============================================================================
// Classifier
// ============================================================================

/// Entry in the exact known-pattern table.
struct KnownPattern {
    needle: &'static str,
    code: &'static str,
    kind: ErrorKind,
    severity: Severity,
    retryable: bool,
    action: &'static str,
}

/// Known failure signatures checked before any heuristic.
const KNOWN_PATTERNS: &[KnownPattern] = &[
    KnownPattern {
        needle: "connection refused",
        code: "CONN_REFUSED",
        kind: ErrorKind::Network,
        severity: Severity::High,
        retryable: true,
        action: "Retry with backoff; check endpoint availability",
    },
    KnownPattern {
        needle: "connection reset",
        code: "CONN_RESET",
        kind: ErrorKind::Network,
        severity: Severity::Medium,
        retryable: true,
        action: "Retry with backoff",
    },
    KnownPattern {
        needle: "dns",
        code: "DNS_FAILURE",
        kind: ErrorKind::Network,
        severity: Severity::High,
        retryable: true,
        action: "Retry with backoff; verify zone base URL",
    },
    KnownPattern {
        needle: "rate limit exceeded",
        code: "RATE_LIMITED",
        kind: ErrorKind::RateLimit,
        severity: Severity::High,
        retryable: true,
        action: "Wait for quota window to free up",
    },
    KnownPattern {
        needle: "token expired",
        code: "TOKEN_EXPIRED",
        kind: ErrorKind::Auth,
        severity: Severity::High,
        retryable: false,
        action: "Refresh credentials and resubmit",
    },
    KnownPattern {
        needle: "invalid credentials",
        code: "BAD_CREDENTIALS",
        kind: ErrorKind::Auth,
        severity: Severity::Critical,
        retryable: false,
        action: "Fix credentials; manual intervention required",
    },
];

/// Pure mapping from raw transport failures to classified errors.
///
/// Stateless and cheap to share; construct once and reuse.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Create a classifier
    pub fn new() -> Self {
        Self
    }

    /// Classify a raw transport failure.
    ///
    /// Never drops an error: anything unrecognized lands in the most
    /// conservative bucket (System/High/retryable).
    pub fn classify(&self, error: &TransportError, context: &ErrorContext) -> ClassifiedError {
        let message = error.to_string();
        let lowered = message.to_lowercase();

        // 1. Exact known-pattern table
        for pattern in KNOWN_PATTERNS {
            if lowered.contains(pattern.needle) {
                return self.build(
                    pattern.code.to_string(),
                    pattern.kind,
                    pattern.severity,
                    pattern.retryable,
                    pattern.action.to_string(),
                    error,
                    context,
                    message,
                );
            }
        }

        // 2. Message heuristics
        if let Some(classified) = self.classify_by_heuristic(&lowered, error, context, &message) {
            return classified;
        }

        // 3. Status-code bucketing, with the conservative default for the rest
        self.classify_by_status(error, context, message)
    }

    /// Message-heuristic matching for failures the pattern table misses.
    fn classify_by_heuristic(
        &self,
        lowered: &str,
        error: &TransportError,
        context: &ErrorContext,
        message: &str,
    ) -> Option<ClassifiedError> {
        let (code, kind, severity, retryable, action) = if lowered.contains("timed out")
            || lowered.contains("timeout")
        {
            (
                "TIMEOUT",
                ErrorKind::Network,
                Severity::Medium,
                true,
                "Retry with backoff; consider a longer deadline",
            )
        } else if lowered.contains("unauthorized") || lowered.contains("forbidden") {
            (
                "AUTH_REJECTED",
                ErrorKind::Auth,
                Severity::High,
                false,
                "Refresh credentials or review permissions",
            )
        } else if lowered.contains("validation") || lowered.contains("malformed") {
            (
                "VALIDATION_FAILED",
                ErrorKind::Validation,
                Severity::Medium,
                false,
                "Fix the request payload",
            )
        } else {
            return None;
        };

        Some(self.build(
            code.to_string(),
            kind,
            severity,
            retryable,
            action.to_string(),
            error,
            context,
            message.to_string(),
        ))
    }

    /// Generic status-code bucketing.
    fn classify_by_status(
        &self,
        error: &TransportError,
        context: &ErrorContext,
        message: String,
    ) -> ClassifiedError {
        let (code, kind, severity, retryable, action) = match error.http_status() {
            Some(429) => (
                "HTTP_429".to_string(),
                ErrorKind::RateLimit,
                Severity::High,
                true,
                "Honor retry-after and reduce request rate".to_string(),
            ),
            Some(status) if status == 401 || status == 403 => (
                format!("HTTP_{}", status),
                ErrorKind::Auth,
                Severity::High,
                false,
                "Refresh credentials or review permissions".to_string(),
            ),
            Some(status) if status >= 500 => (
                format!("HTTP_{}", status),
                ErrorKind::System,
                Severity::High,
                true,
                "Retry with backoff; consider zone failover".to_string(),
            ),
            Some(status) if (400..500).contains(&status) => (
                format!("HTTP_{}", status),
                ErrorKind::Business,
                Severity::Medium,
                false,
                "Fix the request; retrying will not help".to_string(),
            ),
            // Network/timeout without a status, or anything else: conservative
            _ => match error {
                TransportError::Network { .. } => (
                    "NETWORK".to_string(),
                    ErrorKind::Network,
                    Severity::High,
                    true,
                    "Retry with backoff".to_string(),
                ),
                TransportError::Timeout { .. } => (
                    "TIMEOUT".to_string(),
                    ErrorKind::Network,
                    Severity::Medium,
                    true,
                    "Retry with backoff".to_string(),
                ),
                _ => (
                    "UNKNOWN".to_string(),
                    ErrorKind::System,
                    Severity::High,
                    true,
                    "Retry with backoff; investigate if recurring".to_string(),
                ),
            },
        };

        self.build(code, kind, severity, retryable, action, error, context, message)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        &self,
        code: String,
        kind: ErrorKind,
        severity: Severity,
        retryable: bool,
        recommended_action: String,
        error: &TransportError,
        context: &ErrorContext,
        message: String,
    ) -> ClassifiedError {
        let retry_after_ms = match error {
            TransportError::Status { retry_after, .. } => {
                retry_after.map(|d| d.as_millis() as u64)
            }
            _ => None,
        };

        ClassifiedError {
            code,
            kind,
            severity,
            retryable,
            recommended_action,
            retry_after_ms,
            resource: context.resource.clone(),
            attempts: context.attempt,
            message,
        }
    }

    /// Build the ordered recovery procedure for a classified error.
    pub fn recovery_strategy(&self, error: &ClassifiedError) -> RecoveryStrategy {
        let steps = match error.kind {
            ErrorKind::Network | ErrorKind::System => vec![
                RecoveryStep::required(RecoveryAction::Wait)
                    .with_param("delay_ms", error.retry_after_ms.unwrap_or(1_000)),
                RecoveryStep::required(RecoveryAction::Retry),
                RecoveryStep::optional(RecoveryAction::Failover),
                RecoveryStep::optional(RecoveryAction::Alert),
            ],
            ErrorKind::RateLimit => vec![
                RecoveryStep::required(RecoveryAction::Wait)
                    .with_param("delay_ms", error.retry_after_ms.unwrap_or(60_000)),
                RecoveryStep::required(RecoveryAction::Retry),
            ],
            ErrorKind::Auth => vec![
                RecoveryStep::required(RecoveryAction::RefreshAuth),
                RecoveryStep::required(RecoveryAction::Retry),
                RecoveryStep::required(RecoveryAction::Manual),
            ],
            ErrorKind::Validation | ErrorKind::Business => vec![
                RecoveryStep::optional(RecoveryAction::Alert),
                RecoveryStep::required(RecoveryAction::Manual),
            ],
        };

        RecoveryStrategy { steps }
    }
}

// ============================================================================
// Recovery Strategy
// ============================================================================

/// One action in a recovery procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryAction {
    /// Pause for the duration in `params["delay_ms"]`
    Wait,
    /// Re-attempt the failing call
    Retry,
    /// Move traffic to another zone
    Failover,
    /// Refresh credentials
    RefreshAuth,
    /// Notify operators
    Alert,
    /// Requires a human; always reported as failed when executed
    Manual,
}

/// One step of a recovery strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStep {
    /// Action to take
    pub action: RecoveryAction,

    /// Action parameters (e.g. `delay_ms`)
    pub params: HashMap<String, u64>,

    /// Optional steps may fail without halting the procedure
    pub optional: bool,
}

impl RecoveryStep {
    /// Create a required step
    pub fn required(action: RecoveryAction) -> Self {
        Self {
            action,
            params: HashMap::new(),
            optional: false,
        }
    }

    /// Create an optional step
    pub fn optional(action: RecoveryAction) -> Self {
        Self {
            action,
            params: HashMap::new(),
            optional: true,
        }
    }

    /// Attach a parameter
    pub fn with_param(mut self, key: impl Into<String>, value: u64) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

/// Ordered list of recovery steps for one error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStrategy {
    pub steps: Vec<RecoveryStep>,
}

/// Handler invoked for each recovery step.
///
/// Implemented by the composition layer; `Manual` steps are never delegated,
/// they always report failure.
#[async_trait::async_trait]
pub trait RecoveryHandler: Send + Sync {
    /// Perform one step; `Err` halts the procedure unless the step is optional
    async fn perform(&self, step: &RecoveryStep) -> Result<(), String>;
}

/// Report of a recovery execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Steps that completed
    pub completed: Vec<RecoveryAction>,

    /// Step that halted the procedure, with its failure message
    pub halted_at: Option<(RecoveryAction, String)>,
}

impl RecoveryReport {
    /// Check if the whole procedure ran to completion
    pub fn succeeded(&self) -> bool {
        self.halted_at.is_none()
    }
}

/// Execute a recovery strategy step by step.
///
/// Halts on the first non-optional failed step. A `Manual` step always reports
/// failure (a human is required) and halts; `Wait` steps sleep locally without
/// consulting the handler.
pub async fn execute_recovery(
    strategy: &RecoveryStrategy,
    handler: &dyn RecoveryHandler,
) -> RecoveryReport {
    let mut completed = Vec::new();

    for step in &strategy.steps {
        let result = match step.action {
            RecoveryAction::Manual => Err("manual intervention required".to_string()),
            RecoveryAction::Wait => {
                let delay_ms = step.params.get("delay_ms").copied().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(())
            }
            _ => handler.perform(step).await,
        };

        match result {
            Ok(()) => completed.push(step.action),
            Err(reason) if step.optional => {
                warn!(action = ?step.action, %reason, "optional recovery step failed");
                completed.push(step.action);
            }
            Err(reason) => {
                return RecoveryReport {
                    completed,
                    halted_at: Some((step.action, reason)),
                };
            }
        }
    }

    RecoveryReport {
        completed,
        halted_at: None,
    }
}

// ============================================================================
// Error History
// ============================================================================

/// One recorded failure for pattern detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Stable error code
    pub code: String,

    /// Classification at time of recording
    pub kind: ErrorKind,

    /// Severity at time of recording
    pub severity: Severity,

    /// Resource the failure targeted, when known
    pub resource: Option<ResourceKey>,

    /// When the failure was recorded
    pub timestamp: Timestamp,
}

/// Escalation raised when an error kind crosses its frequency or severity
/// threshold within the trailing window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationNotice {
    /// Error kind that escalated
    pub kind: ErrorKind,

    /// Occurrences within the trailing window
    pub occurrences: usize,

    /// Highest severity observed within the window
    pub max_severity: Severity,

    /// Distinct resources affected within the window
    pub affected_resources: Vec<ResourceKey>,
}

/// Per-kind statistics over the trailing window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorKindStats {
    pub kind: ErrorKind,
    pub occurrences: usize,
    pub last_occurrence: Option<Timestamp>,
    pub affected_resources: Vec<ResourceKey>,
}

/// Bounded rolling history of classified failures per error kind.
///
/// Used for circuit-breaker context and escalation detection. Not
/// thread-safe on its own; the owner guards it.
#[derive(Debug)]
pub struct ErrorHistory {
    window: Duration,
    max_records_per_kind: usize,
    escalation_frequency: usize,
    escalation_severity: Severity,
    records: HashMap<ErrorKind, VecDeque<ErrorRecord>>,
    escalated: HashMap<ErrorKind, bool>,
}

impl ErrorHistory {
    /// Create a history with a trailing window and per-kind record cap
    pub fn new(window: Duration, max_records_per_kind: usize) -> Self {
        Self {
            window,
            max_records_per_kind,
            escalation_frequency: 10,
            escalation_severity: Severity::Critical,
            records: HashMap::new(),
            escalated: HashMap::new(),
        }
    }

    /// Override the escalation thresholds
    pub fn with_escalation_thresholds(mut self, frequency: usize, severity: Severity) -> Self {
        self.escalation_frequency = frequency;
        self.escalation_severity = severity;
        self
    }

    /// Record a classified failure.
    ///
    /// Returns an [`EscalationNotice`] the first time the kind crosses its
    /// frequency or severity threshold; the flag stays raised until the window
    /// drains below the threshold again.
    pub fn record(&mut self, error: &ClassifiedError) -> Option<EscalationNotice> {
        let record = ErrorRecord {
            code: error.code.clone(),
            kind: error.kind,
            severity: error.severity,
            resource: error.resource.clone(),
            timestamp: Timestamp::now(),
        };

        let records = self.records.entry(error.kind).or_default();
        records.push_back(record);
        while records.len() > self.max_records_per_kind {
            records.pop_front();
        }
        Self::prune(records, self.window);

        let occurrences = records.len();
        let max_severity = records
            .iter()
            .map(|r| r.severity)
            .max()
            .unwrap_or(Severity::Low);

        let crossed = occurrences >= self.escalation_frequency
            || max_severity >= self.escalation_severity;
        let was_escalated = *self.escalated.get(&error.kind).unwrap_or(&false);
        self.escalated.insert(error.kind, crossed);

        if crossed && !was_escalated {
            let affected = Self::affected_resources(records);
            Some(EscalationNotice {
                kind: error.kind,
                occurrences,
                max_severity,
                affected_resources: affected,
            })
        } else {
            None
        }
    }

    /// Check if the kind is currently escalated
    pub fn is_escalated(&self, kind: ErrorKind) -> bool {
        *self.escalated.get(&kind).unwrap_or(&false)
    }

    /// Snapshot per-kind statistics over the trailing window
    pub fn stats(&self) -> Vec<ErrorKindStats> {
        self.records
            .iter()
            .map(|(kind, records)| ErrorKindStats {
                kind: *kind,
                occurrences: records.len(),
                last_occurrence: records.back().map(|r| r.timestamp),
                affected_resources: Self::affected_resources(records),
            })
            .collect()
    }

    fn prune(records: &mut VecDeque<ErrorRecord>, window: Duration) {
        let now = Timestamp::now();
        while let Some(front) = records.front() {
            if now.duration_since(front.timestamp) > window {
                records.pop_front();
            } else {
                break;
            }
        }
    }

    fn affected_resources(records: &VecDeque<ErrorRecord>) -> Vec<ResourceKey> {
        let mut seen = Vec::new();
        for record in records {
            if let Some(resource) = &record.resource {
                if !seen.contains(resource) {
                    seen.push(resource.clone());
                }
            }
        }
        seen
    }
}

#[cfg(test)]
#[path = "classify_tests.rs"]
mod tests;
