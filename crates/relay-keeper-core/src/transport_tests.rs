//! Tests for the transport boundary and scripted transport.

use super::*;
use crate::ZoneId;
use serde_json::json;

fn resource(route: &str) -> ResourceKey {
    ResourceKey::new(ZoneId::new("primary").expect("Valid zone"), route)
}

/// Test method string forms and read classification.
#[test]
fn test_method_properties() {
    assert_eq!(Method::Get.as_str(), "GET");
    assert_eq!(Method::Delete.as_str(), "DELETE");
    assert!(Method::Get.is_read());
    assert!(!Method::Post.is_read());
    assert!(!Method::Put.is_read());
}

/// Test the call request builders.
#[test]
fn test_call_request_builders() {
    let request = CallRequest::new(resource("orders"), Method::Post)
        .with_payload(json!({"qty": 3}))
        .with_header("x-tenant", "acme");

    assert_eq!(request.method, Method::Post);
    assert_eq!(request.payload, Some(json!({"qty": 3})));
    assert_eq!(request.headers.get("x-tenant").map(String::as_str), Some("acme"));
}

/// Test that remaining quota is read from the rate-limit header.
#[test]
fn test_outcome_remaining_quota() {
    let outcome = CallOutcome::ok().with_header("x-ratelimit-remaining", "42");
    assert_eq!(outcome.remaining_quota(), Some(42));

    let no_header = CallOutcome::ok();
    assert_eq!(no_header.remaining_quota(), None);

    let garbage = CallOutcome::ok().with_header("x-ratelimit-remaining", "lots");
    assert_eq!(garbage.remaining_quota(), None);
}

/// Test transport error transience classification.
#[test]
fn test_transport_error_transience() {
    assert!(TransportError::status(503, "unavailable").is_transient());
    assert!(TransportError::status(429, "slow down").is_transient());
    assert!(!TransportError::status(404, "missing").is_transient());
    assert!(!TransportError::status(401, "denied").is_transient());
    assert!(TransportError::Network {
        message: "connection refused".to_string()
    }
    .is_transient());
    assert!(TransportError::Timeout { elapsed_ms: 5000 }.is_transient());
}

/// Test that scripted outcomes play back in order.
#[tokio::test]
async fn test_scripted_transport_plays_in_order() {
    let transport = ScriptedTransport::new();
    let target = resource("orders");
    transport.script(
        &target,
        vec![
            Err(TransportError::status(503, "unavailable")),
            Ok(CallOutcome::ok()),
        ],
    );

    let request = CallRequest::new(target, Method::Get);
    let first = transport.send(&request).await;
    let second = transport.send(&request).await;

    assert!(first.is_err());
    assert!(second.is_ok());
    assert_eq!(transport.call_count(), 2);
}

/// Test that the final scripted entry repeats once the script runs dry.
#[tokio::test]
async fn test_scripted_transport_last_entry_repeats() {
    let transport = ScriptedTransport::new();
    let target = resource("orders");
    transport.script_failures(&target, TransportError::status(500, "boom"), 1);

    let request = CallRequest::new(target, Method::Get);
    for _ in 0..3 {
        assert!(transport.send(&request).await.is_err());
    }
}

/// Test that unscripted resources answer success.
#[tokio::test]
async fn test_scripted_transport_default_success() {
    let transport = ScriptedTransport::new();
    let request = CallRequest::new(resource("unscripted"), Method::Get);

    let outcome = transport.send(&request).await.expect("Should succeed");
    assert!(outcome.is_success());
}
