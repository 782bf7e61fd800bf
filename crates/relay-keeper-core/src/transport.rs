//! Transport boundary to the remote service.
//!
//! The reliability layer never performs network calls itself. An injected
//! [`Transport`] implementation owns the wire protocol; everything in this
//! crate operates on the [`CallRequest`]/[`CallOutcome`] pair and the raw
//! [`TransportError`] it returns.
//!
//! A [`ScriptedTransport`] is provided for tests and local development; it
//! plays back a queue of pre-arranged outcomes per resource.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use crate::ResourceKey;

// ============================================================================
// Request / Outcome Types
// ============================================================================

/// HTTP verb of a call, as far as this layer needs to know it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// Get canonical uppercase representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    /// Check if this method is safe to coalesce with identical calls
    pub fn is_read(&self) -> bool {
        matches!(self, Self::Get)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One call to the remote service, addressed by resource key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    /// Logical target (zone × route)
    pub resource: ResourceKey,

    /// HTTP verb
    pub method: Method,

    /// Request payload, if any
    pub payload: Option<serde_json::Value>,

    /// Request headers
    pub headers: HashMap<String, String>,
}

impl CallRequest {
    /// Create a request with no payload or headers
    pub fn new(resource: ResourceKey, method: Method) -> Self {
        Self {
            resource,
            method,
            payload: None,
            headers: HashMap::new(),
        }
    }

    /// Attach a payload
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Attach a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Successful response from the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOutcome {
    /// HTTP status code (2xx for success)
    pub status: u16,

    /// Response body, if any
    pub body: Option<serde_json::Value>,

    /// Response headers; quota headers are read from here when present
    pub headers: HashMap<String, String>,
}

impl CallOutcome {
    /// Create a bare 200 outcome
    pub fn ok() -> Self {
        Self {
            status: 200,
            body: None,
            headers: HashMap::new(),
        }
    }

    /// Create an outcome with a body
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Attach a response header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Whether the status is in the success range
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Server-reported remaining quota, when the service sends it
    pub fn remaining_quota(&self) -> Option<u32> {
        self.headers
            .get("x-ratelimit-remaining")
            .and_then(|v| v.parse().ok())
    }
}

// ============================================================================
// Transport Error
// ============================================================================

/// Raw failure from the transport, before classification.
///
/// Everything downstream (retry, circuit breaking, zone selection) operates on
/// the classified form; this type exists only at the boundary.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// The service answered with a non-success status.
    #[error("Status {status}: {message}")]
    Status {
        status: u16,
        message: String,
        /// Server-supplied retry-after, when present (e.g. on 429)
        retry_after: Option<Duration>,
    },

    /// The call never reached the service or the connection broke.
    #[error("Network error: {message}")]
    Network { message: String },

    /// The call exceeded its deadline.
    #[error("Request timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
}

impl TransportError {
    /// Shorthand for a status failure without retry-after
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Check if this error represents a transient condition that may succeed
    /// if retried.
    ///
    /// Transient conditions include:
    /// - Server errors (5xx)
    /// - Rate limiting (429)
    /// - Request timeouts
    /// - Network/transport errors
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Network { .. } => true,
            Self::Timeout { .. } => true,
        }
    }

    /// HTTP status carried by this error, if any
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

// ============================================================================
// Transport Trait
// ============================================================================

/// Injected wire-protocol implementation.
///
/// The entity/CRUD layer supplies the real implementation; this crate only
/// decides *whether* and *when* to invoke it.
///
/// # Thread Safety
///
/// Implementations are shared across async tasks behind `Arc<dyn Transport>`
/// and must be thread-safe.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one call against the remote service.
    async fn send(&self, request: &CallRequest) -> Result<CallOutcome, TransportError>;
}

// ============================================================================
// Scripted Transport
// ============================================================================

/// In-memory transport that plays back pre-arranged outcomes.
///
/// Outcomes are queued per resource and consumed in order; once a resource's
/// script is exhausted the final entry repeats. Resources with no script
/// answer 200. Useful for tests and local development, mirroring the role of
/// an in-memory queue provider in a production queue runtime.
///
/// # Examples
///
/// ```rust
/// use relay_keeper_core::{ResourceKey, ZoneId};
/// use relay_keeper_core::transport::{CallOutcome, ScriptedTransport, TransportError};
///
/// let transport = ScriptedTransport::new();
/// let resource = ResourceKey::new(ZoneId::new("primary").unwrap(), "orders");
/// transport.script(
///     &resource,
///     vec![
///         Err(TransportError::status(503, "unavailable")),
///         Ok(CallOutcome::ok()),
///     ],
/// );
/// ```
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<ResourceKey, VecDeque<Result<CallOutcome, TransportError>>>>,
    calls: AtomicU64,
}

impl ScriptedTransport {
    /// Create a transport where every call succeeds with 200
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for a resource, consumed in order
    pub fn script(
        &self,
        resource: &ResourceKey,
        outcomes: Vec<Result<CallOutcome, TransportError>>,
    ) {
        let mut scripts = self.scripts.lock().expect("script lock poisoned");
        scripts
            .entry(resource.clone())
            .or_default()
            .extend(outcomes);
    }

    /// Queue the same failure `count` times for a resource
    pub fn script_failures(&self, resource: &ResourceKey, error: TransportError, count: usize) {
        self.script(resource, vec![Err(error); count]);
    }

    /// Total number of calls the transport has received
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &CallRequest) -> Result<CallOutcome, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut scripts = self.scripts.lock().expect("script lock poisoned");
        match scripts.get_mut(&request.resource) {
            Some(queue) if !queue.is_empty() => {
                if queue.len() == 1 {
                    // Last entry repeats so scripts never run dry mid-test
                    queue.front().cloned().unwrap_or_else(|| Ok(CallOutcome::ok()))
                } else {
                    queue.pop_front().unwrap_or_else(|| Ok(CallOutcome::ok()))
                }
            }
            _ => Ok(CallOutcome::ok()),
        }
    }
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
