use bridge_transform::{RAW_MESSAGE_FIELD, TransformError, transform};
use domain::{ExchangeKind, FieldValue, RawMessage, RouteRule};

const RECEIVED_AT_NS: i64 = 1_700_000_000_000_000_000;

fn message(routing_key: &str, payload: &[u8]) -> RawMessage {
    let mut message = RawMessage::new("sensor.data", routing_key, 1, payload.to_vec());
    message.received_at_ns = RECEIVED_AT_NS;
    message
}

fn climate_rule() -> RouteRule {
    let mut rule = RouteRule::new("sensor.data", ExchangeKind::Topic, "sensor.#");
    rule.measurement = Some("climate".to_string());
    rule.tags.insert("building".to_string(), "b1".to_string());
    rule.field_mapping
        .insert("temp_c".to_string(), "temperature_celsius".to_string());
    rule.field_mapping
        .insert("rh".to_string(), "relative_humidity".to_string());
    rule
}

#[test]
fn mapped_fields_and_static_tags() {
    let point = transform(
        &message("sensor.s1.measurements", br#"{"temp_c": 23.5, "rh": 65.2}"#),
        &climate_rule(),
    )
    .expect("point");

    assert_eq!(point.measurement, "climate");
    assert_eq!(point.tags.get("building").map(String::as_str), Some("b1"));
    assert_eq!(
        point.tags.get("exchange").map(String::as_str),
        Some("sensor.data")
    );
    assert_eq!(
        point.tags.get("routing_key").map(String::as_str),
        Some("sensor.s1.measurements")
    );
    assert_eq!(point.fields.len(), 2);
    assert_eq!(
        point.fields.get("temperature_celsius"),
        Some(&FieldValue::Float(23.5))
    );
    assert_eq!(
        point.fields.get("relative_humidity"),
        Some(&FieldValue::Float(65.2))
    );
    assert_eq!(point.ts_ns, RECEIVED_AT_NS);
}

#[test]
fn static_tag_wins_over_derived_tag() {
    let mut rule = climate_rule();
    rule.tags
        .insert("routing_key".to_string(), "pinned".to_string());
    let point = transform(&message("sensor.s1", br#"{"v": 1}"#), &rule).expect("point");

    assert_eq!(
        point.tags.get("routing_key").map(String::as_str),
        Some("pinned")
    );
}

#[test]
fn unparseable_payload_falls_back_to_raw_text() {
    let point = transform(&message("sensor.s1", b"not json"), &climate_rule()).expect("point");

    assert_eq!(point.fields.len(), 1);
    assert_eq!(
        point.fields.get(RAW_MESSAGE_FIELD),
        Some(&FieldValue::String("not json".to_string()))
    );
}

#[test]
fn non_object_json_and_binary_fall_back_to_raw_text() {
    for payload in [&b"42"[..], &b"[1,2]"[..], &[0xff, 0xfe, 0x00][..], &b""[..]] {
        let point = transform(&message("sensor.s1", payload), &climate_rule()).expect("point");
        assert_eq!(point.fields.len(), 1);
        assert!(point.fields.contains_key(RAW_MESSAGE_FIELD));
    }
}

#[test]
fn strict_route_rejects_malformed_payload() {
    let mut rule = climate_rule();
    rule.raw_fallback = false;

    let err = transform(&message("sensor.s1", b"not json"), &rule).expect_err("malformed");
    assert!(matches!(err, TransformError::Malformed(_)));

    let err = transform(&message("sensor.s1", b"\"text\""), &rule).expect_err("not object");
    assert_eq!(
        err,
        TransformError::Malformed("expected json object, got string".to_string())
    );
}

#[test]
fn transform_is_deterministic() {
    let message = message(
        "sensor.s1",
        br#"{"temp_c": 1, "nested": {"a": [true, "x"]}, "timestamp": "bad"}"#,
    );
    let rule = climate_rule();

    let first = transform(&message, &rule).expect("first");
    let second = transform(&message, &rule).expect("second");
    assert_eq!(first, second);
}

#[test]
fn payload_timestamp_is_used_and_not_emitted() {
    let point = transform(
        &message(
            "sensor.s1",
            br#"{"timestamp": "2024-01-01T00:00:00Z", "value": 3}"#,
        ),
        &climate_rule(),
    )
    .expect("point");

    assert_eq!(point.ts_ns, 1_704_067_200_000_000_000);
    assert!(!point.fields.contains_key("timestamp"));
    assert_eq!(point.fields.get("value"), Some(&FieldValue::Integer(3)));
}

#[test]
fn unparseable_timestamp_uses_receipt_time() {
    let point = transform(
        &message("sensor.s1", br#"{"timestamp": "soon", "value": 3}"#),
        &climate_rule(),
    )
    .expect("point");

    assert_eq!(point.ts_ns, RECEIVED_AT_NS);
}

#[test]
fn custom_timestamp_field() {
    let mut rule = climate_rule();
    rule.timestamp_field = "ts".to_string();
    let point = transform(&message("sensor.s1", br#"{"ts": 1.5, "timestamp": 7}"#), &rule)
        .expect("point");

    assert_eq!(point.ts_ns, 1_500_000_000);
    assert_eq!(point.fields.get("timestamp"), Some(&FieldValue::Integer(7)));
}

#[test]
fn nested_values_are_flattened() {
    let point = transform(
        &message(
            "station.7.measurements",
            br#"{"location": {"lat": 48.85, "lon": 2.35}, "ok": true, "note": null}"#,
        ),
        &climate_rule(),
    )
    .expect("point");

    assert_eq!(
        point.fields.get("location.lat"),
        Some(&FieldValue::Float(48.85))
    );
    assert_eq!(
        point.fields.get("location.lon"),
        Some(&FieldValue::Float(2.35))
    );
    assert_eq!(point.fields.get("ok"), Some(&FieldValue::Boolean(true)));
    assert!(!point.fields.contains_key("note"));
}

#[test]
fn nested_key_rename_moves_whole_subtree() {
    let mut rule = climate_rule();
    rule.field_mapping
        .insert("location".to_string(), "position".to_string());
    rule.field_mapping
        .insert("gps.alt".to_string(), "altitude".to_string());

    let point = transform(
        &message(
            "sensor.s1",
            br#"{"location": {"lat": 1.5, "lon": 2.5}, "gps": {"alt": 120, "fix": true}}"#,
        ),
        &rule,
    )
    .expect("point");

    let keys: Vec<&str> = point.fields.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["altitude", "gps.fix", "position.lat", "position.lon"]);
    assert_eq!(
        point.fields.get("position.lat"),
        Some(&FieldValue::Float(1.5))
    );
    assert_eq!(point.fields.get("altitude"), Some(&FieldValue::Integer(120)));
}

#[test]
fn measurement_derived_from_routing_key() {
    let rule = RouteRule::new("sensor.data", ExchangeKind::Topic, "#");
    let point = transform(&message("station.7.measurements", br#"{"v": 1}"#), &rule)
        .expect("point");
    assert_eq!(point.measurement, "station_7_measurements");

    let err = transform(&message("", br#"{"v": 1}"#), &rule).expect_err("no measurement");
    assert_eq!(err, TransformError::EmptyMeasurement);
}

#[test]
fn payload_without_usable_fields_is_rejected() {
    for payload in [&br#"{}"#[..], &br#"{"a": null}"#[..], &br#"{"timestamp": 5}"#[..]] {
        let err = transform(&message("sensor.s1", payload), &climate_rule()).expect_err("empty");
        assert_eq!(err, TransformError::NoFields);
    }
}
