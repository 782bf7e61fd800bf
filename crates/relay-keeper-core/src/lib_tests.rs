//! Tests for core domain types.

use super::*;

/// Test that RequestId generates unique identifiers.
#[test]
fn test_request_id_uniqueness() {
    let id1 = RequestId::new();
    let id2 = RequestId::new();
    assert_ne!(id1, id2);
}

/// Test that RequestId round-trips through its string form.
#[test]
fn test_request_id_roundtrip() {
    let id = RequestId::new();
    let parsed: RequestId = id.as_str().parse().expect("Should parse");
    assert_eq!(id, parsed);
}

/// Test that RequestId rejects malformed input.
#[test]
fn test_request_id_invalid_format() {
    let result = "not-a-ulid!".parse::<RequestId>();
    assert!(result.is_err());
}

/// Test that ZoneId accepts valid identifiers.
#[test]
fn test_zone_id_valid() {
    assert!(ZoneId::new("eu-west").is_ok());
    assert!(ZoneId::new("zone_1").is_ok());
    assert!(ZoneId::new("A").is_ok());
}

/// Test that ZoneId rejects empty input.
#[test]
fn test_zone_id_empty() {
    let result = ZoneId::new("");
    assert!(matches!(result, Err(ValidationError::Required { .. })));
}

/// Test that ZoneId rejects over-long input.
#[test]
fn test_zone_id_too_long() {
    let result = ZoneId::new("a".repeat(65));
    assert!(matches!(result, Err(ValidationError::TooLong { .. })));
}

/// Test that ZoneId rejects invalid characters.
#[test]
fn test_zone_id_invalid_characters() {
    let result = ZoneId::new("eu west");
    assert!(matches!(
        result,
        Err(ValidationError::InvalidCharacters { .. })
    ));
}

/// Test that ResourceKey renders as zone:route.
#[test]
fn test_resource_key_display() {
    let zone = ZoneId::new("eu-west").expect("Valid zone");
    let resource = ResourceKey::new(zone, "orders");
    assert_eq!(resource.to_string(), "eu-west:orders");
}

/// Test that Priority clamps to the 0-9 range.
#[test]
fn test_priority_clamping() {
    assert_eq!(Priority::new(3).value(), 3);
    assert_eq!(Priority::new(200).value(), 9);
    assert_eq!(Priority::MIN.value(), 0);
    assert_eq!(Priority::CRITICAL.value(), 9);
}

/// Test that Priority ordering follows numeric value.
#[test]
fn test_priority_ordering() {
    assert!(Priority::CRITICAL > Priority::NORMAL);
    assert!(Priority::NORMAL > Priority::MIN);
    assert!(Priority::new(9).is_critical());
    assert!(!Priority::new(8).is_critical());
}

/// Test that the default priority is the normal tier.
#[test]
fn test_priority_default() {
    assert_eq!(Priority::default(), Priority::NORMAL);
}

/// Test timestamp RFC3339 round-tripping.
#[test]
fn test_timestamp_rfc3339_roundtrip() {
    let ts = Timestamp::now();
    let parsed = Timestamp::from_rfc3339(&ts.to_rfc3339()).expect("Should parse");
    assert_eq!(ts, parsed);
}

/// Test that timestamp parsing rejects malformed input.
#[test]
fn test_timestamp_invalid_format() {
    assert!(Timestamp::from_rfc3339("yesterday").is_err());
}

/// Test timestamp arithmetic.
#[test]
fn test_timestamp_arithmetic() {
    let earlier = Timestamp::now();
    let later = earlier.add_duration(Duration::from_secs(5));
    assert!(later > earlier);
    assert_eq!(later.duration_since(earlier), Duration::from_secs(5));
    // Negative differences clamp to zero
    assert_eq!(earlier.duration_since(later), Duration::ZERO);
}

/// Test that CorrelationId generates unique identifiers.
#[test]
fn test_correlation_id_uniqueness() {
    assert_ne!(CorrelationId::new(), CorrelationId::new());
}

/// Test RelayError transience classification.
#[test]
fn test_relay_error_transience() {
    let zone = ZoneId::new("primary").expect("Valid zone");
    let resource = ResourceKey::new(zone, "orders");

    assert!(RelayError::CircuitOpen {
        resource,
        retry_at: None
    }
    .is_transient());
    assert!(RelayError::QueueFull { capacity: 10 }.is_transient());
    assert!(RelayError::Timeout { waited_ms: 100 }.is_transient());
    assert!(RelayError::Shed {
        reason: "overload".to_string()
    }
    .is_transient());
    assert!(!RelayError::Shutdown.is_transient());
    assert!(!RelayError::Validation(ValidationError::Required {
        field: "x".to_string()
    })
    .is_transient());
}

/// Test that identifier types serialize to JSON and back.
#[test]
fn test_identifier_serde_roundtrip() {
    let zone = ZoneId::new("eu-west").expect("Valid zone");
    let resource = ResourceKey::new(zone, "orders");

    let json = serde_json::to_string(&resource).expect("Should serialize");
    let back: ResourceKey = serde_json::from_str(&json).expect("Should deserialize");
    assert_eq!(resource, back);
}
