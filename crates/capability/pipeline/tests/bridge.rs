use bridge_broker::{BrokerConfig, BrokerError, BrokerManager, InMemoryTransport};
use bridge_connection::{BackoffPolicy, Shutdown};
use bridge_pipeline::{Bridge, BridgeError, BridgeSettings};
use bridge_routing::RouteTable;
use bridge_sink::{InMemorySinkClient, SinkConfig, SinkError, SinkManager};
use domain::{AckVerdict, ConnectionState, ExchangeKind, RouteRule};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

struct Harness {
    transport: InMemoryTransport,
    client: Arc<InMemorySinkClient>,
    shutdown: Shutdown,
    bridge: Arc<Bridge>,
}

fn policy(max_retries: Option<u32>) -> BackoffPolicy {
    BackoffPolicy {
        initial_delay_ms: 1,
        max_delay_ms: 5,
        multiplier: 2.0,
        jitter_percent: 0,
        max_retries,
    }
}

fn route() -> RouteRule {
    let mut rule = RouteRule::new("sensor.data", ExchangeKind::Topic, "sensor.#");
    rule.queue_name = Some("sensor-readings".to_string());
    rule.measurement = Some("climate".to_string());
    rule
}

struct Options {
    routes: Vec<RouteRule>,
    sink_reconnect: BackoffPolicy,
    grace_period_ms: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            routes: vec![route()],
            sink_reconnect: policy(Some(5)),
            grace_period_ms: 1_000,
        }
    }
}

fn harness(sink_retries: Option<u32>) -> Harness {
    build(Options {
        sink_reconnect: policy(sink_retries),
        ..Options::default()
    })
}

fn build(options: Options) -> Harness {
    let transport = InMemoryTransport::new();
    let client = Arc::new(InMemorySinkClient::new());
    let shutdown = Shutdown::new();
    let broker = BrokerManager::new(
        Arc::new(transport.clone()),
        BrokerConfig {
            reconnect: policy(Some(5)),
        },
        shutdown.clone(),
    );
    let sink = SinkManager::new(
        client.clone(),
        SinkConfig {
            default_bucket: "telemetry".to_string(),
            batch_size: 1,
            linger_ms: 0,
            reconnect: options.sink_reconnect,
        },
        shutdown.clone(),
    );
    let routes = RouteTable::new(options.routes).expect("routes");
    let bridge = Bridge::new(
        broker,
        sink,
        routes,
        BridgeSettings {
            grace_period_ms: options.grace_period_ms,
        },
    );
    Harness {
        transport,
        client,
        shutdown,
        bridge: Arc::new(bridge),
    }
}

fn start(harness: &Harness) -> JoinHandle<Result<(), BridgeError>> {
    let bridge = harness.bridge.clone();
    let shutdown = harness.shutdown.clone();
    tokio::spawn(async move { bridge.run(shutdown).await })
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// 订阅建立之前发布的消息没有队列可投递，这里等到队列就绪再发布。
async fn publish_when_ready(transport: &InMemoryTransport, payload: &str) {
    eventually(|| transport.publish("sensor.data", "sensor.room1", payload) == 1).await;
}

#[tokio::test]
async fn forwards_messages_and_stops_gracefully() {
    let harness = harness(Some(3));
    let running = start(&harness);

    publish_when_ready(&harness.transport, r#"{"temp": 20.5}"#).await;
    harness
        .transport
        .publish("sensor.data", "sensor.room2", r#"{"temp": 21.5}"#);
    eventually(|| harness.transport.settlements().len() == 2).await;

    harness.shutdown.trigger();
    running.await.expect("join").expect("run");

    assert!(
        harness
            .transport
            .settlements()
            .iter()
            .all(|settlement| settlement.verdict == AckVerdict::Ack)
    );
    assert_eq!(harness.client.lines().len(), 2);
    assert!(!harness.transport.is_connected());
    assert_eq!(harness.bridge.sink().state(), ConnectionState::Disconnected);
    assert_eq!(harness.bridge.broker().state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn transient_failure_is_redelivered_and_acked() {
    let harness = harness(Some(5));
    let running = start(&harness);
    eventually(|| harness.bridge.sink().state() == ConnectionState::Connected).await;

    harness
        .client
        .fail_next_write(SinkError::Transient("connection reset".to_string()));
    publish_when_ready(&harness.transport, r#"{"temp": 19.0}"#).await;

    eventually(|| {
        harness
            .transport
            .settlements()
            .last()
            .is_some_and(|settlement| settlement.verdict == AckVerdict::Ack)
    })
    .await;
    harness.shutdown.trigger();
    running.await.expect("join").expect("run");

    let settlements = harness.transport.settlements();
    assert_eq!(settlements[0].verdict, AckVerdict::RequeueReject);
    let acked = settlements.last().expect("acked");
    assert!(acked.redelivered);
    assert_eq!(harness.client.lines().len(), 1);
}

#[tokio::test]
async fn fatal_write_stops_the_bridge_without_losing_the_message() {
    let harness = harness(Some(3));
    let running = start(&harness);
    eventually(|| harness.bridge.sink().state() == ConnectionState::Connected).await;

    harness
        .client
        .fail_next_write(SinkError::Fatal("http 401: unauthorized".to_string()));
    publish_when_ready(&harness.transport, r#"{"temp": 19.0}"#).await;

    let err = running.await.expect("join").expect_err("fatal");
    assert!(matches!(
        err,
        BridgeError::Broker(BrokerError::Aborted(_))
    ));
    assert_eq!(
        harness.transport.settlements()[0].verdict,
        AckVerdict::RequeueReject
    );
    assert_eq!(harness.transport.outstanding(), 1);
}

#[tokio::test]
async fn broker_waits_for_sink_at_startup() {
    let harness = harness(Some(1));
    for _ in 0..2 {
        harness
            .client
            .fail_next_ping(SinkError::Transient("connection refused".to_string()));
    }

    let err = start(&harness)
        .await
        .expect("join")
        .expect_err("sink unreachable");

    assert!(matches!(err, BridgeError::Sink(SinkError::FatalDisconnect(_))));
    assert_eq!(harness.transport.connect_count(), 0);
}

#[tokio::test]
async fn sink_fatal_disconnect_stops_consumption() {
    let harness = harness(Some(0));
    let running = start(&harness);
    eventually(|| harness.bridge.broker().state() == ConnectionState::Connected).await;

    harness
        .client
        .fail_next_ping(SinkError::Transient("connection refused".to_string()));
    harness
        .client
        .fail_next_write(SinkError::Transient("connection reset".to_string()));
    publish_when_ready(&harness.transport, r#"{"temp": 19.0}"#).await;

    let err = running.await.expect("join").expect_err("fatal");
    assert!(matches!(err, BridgeError::SinkFatal(_)));
    assert_eq!(harness.transport.outstanding(), 1);
}

#[tokio::test]
async fn sink_outage_holds_the_message_instead_of_requeue_spinning() {
    let harness = build(Options {
        sink_reconnect: BackoffPolicy {
            initial_delay_ms: 40,
            max_delay_ms: 40,
            multiplier: 1.0,
            jitter_percent: 0,
            max_retries: Some(5),
        },
        ..Options::default()
    });
    let running = start(&harness);
    eventually(|| harness.bridge.sink().state() == ConnectionState::Connected).await;

    for _ in 0..3 {
        harness
            .client
            .fail_next_ping(SinkError::Transient("connection refused".to_string()));
    }
    harness
        .client
        .fail_next_write(SinkError::Transient("connection reset".to_string()));
    publish_when_ready(&harness.transport, r#"{"temp": 19.0}"#).await;

    eventually(|| {
        harness
            .transport
            .settlements()
            .last()
            .is_some_and(|settlement| settlement.verdict == AckVerdict::Ack)
    })
    .await;
    harness.shutdown.trigger();
    running.await.expect("join").expect("run");

    let verdicts: Vec<AckVerdict> = harness
        .transport
        .settlements()
        .iter()
        .map(|settlement| settlement.verdict)
        .collect();
    assert_eq!(verdicts, vec![AckVerdict::RequeueReject, AckVerdict::Ack]);
    assert_eq!(harness.client.write_calls(), 2);
}

#[tokio::test]
async fn overlapping_subscriptions_write_one_point_per_route() {
    let mut temps = RouteRule::new("sensor.data", ExchangeKind::Topic, "sensor.temp.#");
    temps.queue_name = Some("temps".to_string());
    temps.measurement = Some("temps".to_string());
    let mut all = RouteRule::new("sensor.data", ExchangeKind::Topic, "sensor.#");
    all.queue_name = Some("all".to_string());
    all.measurement = Some("all_sensors".to_string());
    let harness = build(Options {
        routes: vec![temps, all],
        ..Options::default()
    });
    let running = start(&harness);

    eventually(|| harness.transport.publish("sensor.data", "sensor.temp.r1", r#"{"v": 1}"#) == 2)
        .await;
    eventually(|| harness.transport.settlements().len() == 2).await;
    harness.shutdown.trigger();
    running.await.expect("join").expect("run");

    let mut measurements: Vec<String> = harness
        .client
        .lines()
        .iter()
        .filter_map(|line| line.split(',').next().map(str::to_string))
        .collect();
    measurements.sort();
    assert_eq!(measurements, vec!["all_sensors".to_string(), "temps".to_string()]);
}

#[tokio::test]
async fn in_flight_write_completes_before_connections_close() {
    let harness = build(Options {
        grace_period_ms: 2_000,
        ..Options::default()
    });
    let running = start(&harness);
    eventually(|| harness.bridge.sink().state() == ConnectionState::Connected).await;

    harness.client.set_write_delay(Duration::from_millis(150));
    publish_when_ready(&harness.transport, r#"{"temp": 19.0}"#).await;
    eventually(|| harness.client.write_calls() == 1).await;

    harness.shutdown.trigger();
    running.await.expect("join").expect("run");

    let settlements = harness.transport.settlements();
    assert_eq!(settlements.len(), 1);
    assert_eq!(settlements[0].verdict, AckVerdict::Ack);
    assert_eq!(harness.client.lines().len(), 1);
    assert_eq!(harness.transport.outstanding(), 0);
}

#[tokio::test]
async fn handler_outliving_grace_period_is_abandoned_for_redelivery() {
    let harness = build(Options {
        grace_period_ms: 50,
        ..Options::default()
    });
    let running = start(&harness);
    eventually(|| harness.bridge.sink().state() == ConnectionState::Connected).await;

    harness.client.set_write_delay(Duration::from_secs(5));
    publish_when_ready(&harness.transport, r#"{"temp": 19.0}"#).await;
    eventually(|| harness.client.write_calls() == 1).await;

    harness.shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("run returns after the grace period")
        .expect("join")
        .expect("run");

    assert!(harness.transport.settlements().is_empty());
    assert!(harness.client.lines().is_empty());
    let queued = harness.transport.queued();
    assert_eq!(queued.len(), 1);
    assert!(queued[0].redelivered);
    assert!(!harness.transport.is_connected());
}
