//! # Relay-Keeper Core
//!
//! Reliability and traffic-management layer placed in front of calls to a
//! remote, quota-limited, multi-endpoint HTTP service.
//!
//! The crate composes five cooperating subsystems into one request pipeline:
//!
//! - [`rate_limiter`]: global rolling-window quota and per-resource
//!   concurrency ceilings with a priority wait queue
//! - [`circuit_breaker`]: per-resource failure-isolation state machines
//! - [`retry`]: classified retry with exponential backoff, request
//!   deduplication, and replay handoff
//! - [`zones`]: health-aware registry of backend endpoints with pluggable
//!   load-balancing strategies
//! - [`manager`]: top-level admission control, batching, load shedding, and a
//!   derived system-health state machine
//!
//! ## Architecture
//!
//! The core follows clean architecture principles:
//! - Business logic depends only on trait abstractions
//! - The network transport is injected at runtime (see [`transport::Transport`])
//! - All state is in-memory for the lifetime of one process
//!
//! ## Usage
//!
//! ```rust
//! use relay_keeper_core::{RequestId, ResourceKey, ZoneId, Priority};
//!
//! let request_id = RequestId::new();
//! let zone = ZoneId::new("eu-west").unwrap();
//! let resource = ResourceKey::new(zone, "orders");
//! assert_eq!(resource.to_string(), "eu-west:orders");
//! assert!(Priority::CRITICAL > Priority::default());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// Re-export commonly used types
pub use ulid::Ulid;
pub use uuid::Uuid;

/// Standard result type for relay-keeper operations
pub type RelayResult<T> = Result<T, RelayError>;

// ============================================================================
// Domain Identifier Types
// ============================================================================

/// Unique identifier for a request travelling through the pipeline.
///
/// Uses ULID for lexicographic sorting and global uniqueness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Ulid);

impl RequestId {
    /// Generate a new unique request ID
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Get string representation of the request ID
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ulid = s.parse::<Ulid>().map_err(|_| ParseError::InvalidFormat {
            expected: "ULID format".to_string(),
            actual: s.to_string(),
        })?;
        Ok(Self(ulid))
    }
}

/// Identifier for a backend endpoint ("zone") of the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneId(String);

impl ZoneId {
    /// Create a new zone ID with validation.
    ///
    /// # Validation Rules
    /// - Must be 1-64 characters
    /// - Must contain only alphanumeric characters, hyphens, and underscores
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();

        if value.is_empty() {
            return Err(ValidationError::Required {
                field: "zone_id".to_string(),
            });
        }

        if value.len() > 64 {
            return Err(ValidationError::TooLong {
                field: "zone_id".to_string(),
                max_length: 64,
            });
        }

        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ValidationError::InvalidCharacters {
                field: "zone_id".to_string(),
                invalid_chars: "non-alphanumeric except hyphens and underscores".to_string(),
            });
        }

        Ok(Self(value))
    }

    /// Get string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ZoneId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Logical target for rate limiting and circuit breaking: zone × route.
///
/// One circuit breaker and one concurrency ceiling exist per resource key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Zone this resource lives in
    pub zone: ZoneId,

    /// Route within the zone (e.g. "orders", "customers")
    pub route: String,
}

impl ResourceKey {
    /// Create a resource key from zone and route
    pub fn new(zone: ZoneId, route: impl Into<String>) -> Self {
        Self {
            zone,
            route: route.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.zone, self.route)
    }
}

/// Request priority on a 0-9 scale; 9 is the most urgent.
///
/// Both the admission queue and the replay queue order work priority-first,
/// FIFO within a priority tier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Priority(u8);

impl Priority {
    /// Lowest priority
    pub const MIN: Priority = Priority(0);

    /// Default priority for unremarkable work
    pub const NORMAL: Priority = Priority(5);

    /// Highest priority; never shed, never rejected by admission control
    pub const CRITICAL: Priority = Priority(9);

    /// Create a priority, clamping to the 0-9 range
    pub fn new(value: u8) -> Self {
        Self(value.min(9))
    }

    /// Get numeric value
    pub fn value(&self) -> u8 {
        self.0
    }

    /// Check if this is the top priority tier
    pub fn is_critical(&self) -> bool {
        self.0 == 9
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for tracing requests across system boundaries
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate new correlation ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get string representation
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Time Types
// ============================================================================

/// UTC timestamp with microsecond precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current moment
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Parse timestamp from RFC3339 string
    pub fn from_rfc3339(s: &str) -> Result<Self, ParseError> {
        let dt = DateTime::parse_from_rfc3339(s)
            .map_err(|_| ParseError::InvalidFormat {
                expected: "RFC3339 datetime".to_string(),
                actual: s.to_string(),
            })?
            .with_timezone(&Utc);
        Ok(Self(dt))
    }

    /// Convert to RFC3339 string
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339()
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Add a duration to the timestamp
    pub fn add_duration(&self, duration: Duration) -> Self {
        let chrono_duration = chrono::Duration::from_std(duration).unwrap_or_default();
        Self(self.0 + chrono_duration)
    }

    /// Get duration since another timestamp, zero if `other` is in the future
    pub fn duration_since(&self, other: Self) -> Duration {
        let chrono_duration = self.0.signed_duration_since(other.0);
        chrono_duration.to_std().unwrap_or_default()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Error type for input validation failures
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("Field '{field}' is required")]
    Required { field: String },

    #[error("Field '{field}' has invalid format: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    TooLong { field: String, max_length: usize },

    #[error("Field '{field}' contains invalid characters: {invalid_chars}")]
    InvalidCharacters {
        field: String,
        invalid_chars: String,
    },

    #[error("Field '{field}' is out of range: {message}")]
    OutOfRange { field: String, message: String },
}

/// Error type for string parsing failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseError {
    #[error("Invalid format: expected {expected}, got '{actual}'")]
    InvalidFormat { expected: String, actual: String },
}

/// Terminal error returned to the original caller of the pipeline.
///
/// A circuit-open rejection is a distinct variant from a classified failure so
/// operators can tell "known-bad service" from "this call failed".
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    /// Validation failed before the request ever entered the pipeline.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The resource's circuit breaker is open; no call was made.
    #[error("Circuit open for {resource}; next attempt at {retry_at:?}")]
    CircuitOpen {
        resource: ResourceKey,
        retry_at: Option<Timestamp>,
    },

    /// The call failed with a classified terminal error.
    #[error("Request failed: {0}")]
    Classified(#[from] crate::classify::ClassifiedError),

    /// An admission or rate-limiter queue was at capacity.
    #[error("Queue at capacity ({capacity})")]
    QueueFull { capacity: usize },

    /// The request's deadline elapsed before it could complete.
    #[error("Request timed out after {waited_ms}ms")]
    Timeout { waited_ms: u64 },

    /// Admission control rejected the request under load shedding.
    #[error("Request shed: {reason}")]
    Shed { reason: String },

    /// No zone satisfied the selection criteria.
    #[error("No zone available for route '{route}'")]
    NoZoneAvailable { route: String },

    /// The component is shutting down; pending work was settled.
    #[error("Shutting down")]
    Shutdown,
}

impl RelayError {
    /// Check if the error is transient and a later identical call may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Validation(_) => false,
            Self::CircuitOpen { .. } => true,
            Self::Classified(e) => e.retryable,
            Self::QueueFull { .. } => true,
            Self::Timeout { .. } => true,
            Self::Shed { .. } => true,
            Self::NoZoneAvailable { .. } => true,
            Self::Shutdown => false,
        }
    }
}

// ============================================================================
// Module declarations
// ============================================================================

/// Generic per-resource circuit breakers and their owning registry
pub mod circuit_breaker;

/// Error classification, recovery strategies, and escalation tracking
pub mod classify;

/// Configuration surface with explicit defaults for every component
pub mod config;

/// Observable-event registry with explicit subscribe/unsubscribe
pub mod events;

/// Top-level reliability façade: admission, batching, shedding, pipeline
pub mod manager;

/// Best-effort metric collection hooks
pub mod monitoring;

/// Global rolling-window quota and per-resource concurrency limiting
pub mod rate_limiter;

/// Replay queue for retry-exhausted but still eligible requests
pub mod replay;

/// Classified retry/backoff orchestration with deduplication
pub mod retry;

/// Injected transport boundary to the remote service
pub mod transport;

/// Zone registry, health probing, and load-balancing strategies
pub mod zones;

// Re-export key types for convenience
pub use circuit_breaker::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerError, CircuitBreakerRegistry, CircuitState,
};
pub use classify::{
    ClassifiedError, ErrorClassifier, ErrorContext, ErrorHistory, ErrorKind, RecoveryAction,
    RecoveryStep, RecoveryStrategy, Severity,
};
pub use config::{
    CircuitBreakerConfig, RateLimiterConfig, ReliabilityConfig, RetryConfig, UsageThresholds,
    ZoneManagerConfig,
};
pub use events::{EventBus, EventSink, NoOpEventSink, RelayEvent, SubscriptionId, TracingEventSink};
pub use manager::{QueueStatistics, RelayMetrics, ReliabilityManager, SystemHealth};
pub use monitoring::{MetricsCollector, NoOpMetricsCollector};
pub use rate_limiter::{RateLimitError, RateLimiter, RateLimiterSnapshot, RequestOutcome};
pub use replay::{ReplayExecutor, ReplayQueue, ReplayQueueStats, ReplayableRequest};
pub use retry::{RetryOrchestrator, RetryPolicy};
pub use transport::{CallOutcome, CallRequest, Method, ScriptedTransport, Transport, TransportError};
pub use zones::{
    LoadBalancingStrategy, SelectionCriteria, Zone, ZoneDiscovery, ZoneManager, ZoneRegistration,
    ZoneSnapshot,
};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
