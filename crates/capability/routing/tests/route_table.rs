use bridge_routing::{RouteError, RouteTable};
use domain::{ExchangeKind, RouteRule};

fn rule(exchange: &str, kind: ExchangeKind, pattern: &str, measurement: &str) -> RouteRule {
    let mut rule = RouteRule::new(exchange, kind, pattern);
    rule.measurement = Some(measurement.to_string());
    rule
}

#[test]
fn first_configured_match_wins() {
    let table = RouteTable::new(vec![
        rule("sensor.data", ExchangeKind::Topic, "sensor.s1.*", "specific"),
        rule("sensor.data", ExchangeKind::Topic, "sensor.#", "generic"),
    ])
    .expect("table");

    let specific = table
        .resolve("sensor.data", "sensor.s1.measurements")
        .expect("route");
    assert_eq!(specific.measurement.as_deref(), Some("specific"));

    let generic = table
        .resolve("sensor.data", "sensor.s2.measurements")
        .expect("route");
    assert_eq!(generic.measurement.as_deref(), Some("generic"));
}

#[test]
fn overlapping_subscriptions_keep_their_own_rule() {
    let temps = rule("sensor.data", ExchangeKind::Topic, "sensor.temp.#", "temps");
    let all = rule("sensor.data", ExchangeKind::Topic, "sensor.#", "all_sensors");
    let table = RouteTable::new(vec![temps.clone(), all.clone()]).expect("table");

    let via_temps = table
        .resolve_for(&temps, "sensor.data", "sensor.temp.r1")
        .expect("route");
    assert_eq!(via_temps.measurement.as_deref(), Some("temps"));

    let via_all = table
        .resolve_for(&all, "sensor.data", "sensor.temp.r1")
        .expect("route");
    assert_eq!(via_all.measurement.as_deref(), Some("all_sensors"));
}

#[test]
fn subscription_not_matching_key_falls_back_to_table() {
    let temps = rule("sensor.data", ExchangeKind::Topic, "sensor.temp.#", "temps");
    let all = rule("sensor.data", ExchangeKind::Topic, "sensor.#", "all_sensors");
    let table = RouteTable::new(vec![temps.clone(), all]).expect("table");

    let fallback = table
        .resolve_for(&temps, "sensor.data", "sensor.humidity.r1")
        .expect("route");
    assert_eq!(fallback.measurement.as_deref(), Some("all_sensors"));
    assert!(table.resolve_for(&temps, "other", "sensor.temp.r1").is_none());
}

#[test]
fn exchange_must_match() {
    let table = RouteTable::new(vec![rule(
        "sensor.data",
        ExchangeKind::Topic,
        "#",
        "sensors",
    )])
    .expect("table");

    assert!(table.resolve("weather.updates", "station.1").is_none());
}

#[test]
fn direct_fanout_and_headers_kinds() {
    let table = RouteTable::new(vec![
        rule("direct.ex", ExchangeKind::Direct, "exact.key", "direct"),
        rule("fanout.ex", ExchangeKind::Fanout, "", "fanout"),
        rule("headers.ex", ExchangeKind::Headers, "", "headers"),
    ])
    .expect("table");

    assert!(table.resolve("direct.ex", "exact.key").is_some());
    assert!(table.resolve("direct.ex", "exact.*").is_none());
    assert_eq!(
        table
            .resolve("fanout.ex", "anything")
            .and_then(|rule| rule.measurement.as_deref()),
        Some("fanout")
    );
    assert!(table.resolve("headers.ex", "").is_some());
}

#[test]
fn default_exchange_routes_by_queue_name() {
    let mut queue_rule = RouteRule::new("", ExchangeKind::Direct, "unused");
    queue_rule.queue_name = Some("readings".to_string());
    let table = RouteTable::new(vec![queue_rule]).expect("table");

    assert!(table.resolve("", "readings").is_some());
    assert!(table.resolve("", "other").is_none());
}

#[test]
fn empty_table_rejected() {
    let err = RouteTable::new(Vec::new()).expect_err("empty");
    assert!(matches!(err, RouteError::Empty));
}

#[test]
fn invalid_topic_pattern_rejected() {
    let err = RouteTable::new(vec![rule("ex", ExchangeKind::Topic, "a..b", "m")])
        .expect_err("invalid");
    assert_eq!(
        err.to_string(),
        "invalid routing pattern for ex/a..b: empty word"
    );
}
