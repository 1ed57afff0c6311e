use bridge_connection::{BackoffPolicy, Shutdown};
use bridge_sink::{InMemorySinkClient, SinkConfig, SinkError, SinkManager};
use domain::{ConnectionState, FieldValue, Point};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn fast_policy(max_retries: Option<u32>) -> BackoffPolicy {
    BackoffPolicy {
        initial_delay_ms: 1,
        max_delay_ms: 5,
        multiplier: 2.0,
        jitter_percent: 0,
        max_retries,
    }
}

fn config(batch_size: usize, linger_ms: u64) -> SinkConfig {
    SinkConfig {
        default_bucket: "telemetry".to_string(),
        batch_size,
        linger_ms,
        reconnect: fast_policy(Some(3)),
    }
}

fn point(value: f64) -> Point {
    let mut point = Point::new("climate", 1_700_000_000_000_000_000);
    point.tags.insert("building".to_string(), "b1".to_string());
    point
        .fields
        .insert("temperature".to_string(), FieldValue::Float(value));
    point
}

async fn wait_for_state(manager: &SinkManager, expected: ConnectionState) {
    let mut rx = manager.tracker().watch();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|state| *state == expected))
        .await
        .expect("state timeout")
        .expect("watch closed");
}

#[tokio::test]
async fn connect_is_idempotent() {
    let client = Arc::new(InMemorySinkClient::new());
    let manager = SinkManager::new(client.clone(), config(1, 0), Shutdown::new());

    manager.connect().await.expect("connect");
    manager.connect().await.expect("connect again");

    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(client.ping_count(), 1);
}

#[tokio::test]
async fn write_fails_fast_when_not_connected() {
    let client = Arc::new(InMemorySinkClient::new());
    let manager = SinkManager::new(client.clone(), config(1, 0), Shutdown::new());

    let err = manager.write(None, point(1.0)).await.expect_err("not connected");
    assert!(err.is_transient());
    assert_eq!(client.write_calls(), 0);
}

#[tokio::test]
async fn write_uses_default_or_route_bucket() {
    let client = Arc::new(InMemorySinkClient::new());
    let manager = SinkManager::new(client.clone(), config(1, 0), Shutdown::new());
    manager.connect().await.expect("connect");

    manager.write(None, point(23.5)).await.expect("default bucket");
    manager
        .write(Some("archive"), point(24.0))
        .await
        .expect("route bucket");

    let writes = client.writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].bucket, "telemetry");
    assert_eq!(
        writes[0].lines,
        vec!["climate,building=b1 temperature=23.5 1700000000000000000".to_string()]
    );
    assert_eq!(writes[1].bucket, "archive");
}

#[tokio::test]
async fn concurrent_writes_share_one_batch() {
    let client = Arc::new(InMemorySinkClient::new());
    let manager = SinkManager::new(client.clone(), config(3, 5_000), Shutdown::new());
    manager.connect().await.expect("connect");

    let mut handles = Vec::new();
    for value in [1.0, 2.0, 3.0] {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager.write(None, point(value)).await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("write");
    }

    assert_eq!(client.write_calls(), 1);
    assert_eq!(client.writes()[0].lines.len(), 3);
}

#[tokio::test]
async fn linger_flushes_partial_batch() {
    let client = Arc::new(InMemorySinkClient::new());
    let manager = SinkManager::new(client.clone(), config(10, 20), Shutdown::new());
    manager.connect().await.expect("connect");

    manager.write(None, point(1.0)).await.expect("write");

    assert_eq!(client.lines().len(), 1);
    assert_eq!(manager.buffered().await, 0);
}

#[tokio::test]
async fn transient_failure_starts_reconnect() {
    let client = Arc::new(InMemorySinkClient::new());
    let manager = SinkManager::new(client.clone(), config(1, 0), Shutdown::new());
    manager.connect().await.expect("connect");

    client.fail_next_ping(SinkError::Transient("connection refused".to_string()));
    client.fail_next_write(SinkError::Transient("connection reset".to_string()));
    let err = manager.write(None, point(1.0)).await.expect_err("transient");
    assert_eq!(err, SinkError::Transient("connection reset".to_string()));

    wait_for_state(&manager, ConnectionState::Connected).await;
    assert!(client.ping_count() >= 3);

    manager.write(None, point(1.0)).await.expect("after reconnect");
    assert_eq!(client.lines().len(), 1);
}

#[tokio::test]
async fn fatal_failure_does_not_reconnect() {
    let client = Arc::new(InMemorySinkClient::new());
    let manager = SinkManager::new(client.clone(), config(1, 0), Shutdown::new());
    manager.connect().await.expect("connect");

    client.fail_next_write(SinkError::Fatal("http 401: unauthorized".to_string()));
    let err = manager.write(None, point(1.0)).await.expect_err("fatal");

    assert!(matches!(err, SinkError::Fatal(_)));
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(client.ping_count(), 1);
}

#[tokio::test]
async fn flush_names_failed_points() {
    let client = Arc::new(InMemorySinkClient::new());
    let manager = SinkManager::new(client.clone(), config(10, 5_000), Shutdown::new());
    manager.connect().await.expect("connect");

    let writer = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.write(None, point(7.0)).await })
    };
    tokio::time::timeout(Duration::from_secs(2), async {
        while manager.buffered().await == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("point buffered");

    client.fail_next_write(SinkError::Transient("timeout".to_string()));
    let err = manager.flush().await.expect_err("flush fails");
    assert_eq!(err.failed, vec![point(7.0)]);
    assert!(err.source.is_transient());

    let result = writer.await.expect("join");
    assert!(matches!(result, Err(SinkError::Transient(_))));
}

#[tokio::test]
async fn refused_point_does_not_fail_its_batch_mates() {
    let client = Arc::new(InMemorySinkClient::new());
    client.refuse_lines_containing("bad_sensor");
    let manager = SinkManager::new(client.clone(), config(2, 5_000), Shutdown::new());
    manager.connect().await.expect("connect");

    let mut refused = point(2.0);
    refused.measurement = "bad_sensor".to_string();
    let good = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.write(None, point(1.0)).await })
    };
    let bad = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.write(None, refused).await })
    };

    good.await.expect("join").expect("good point written");
    let err = bad.await.expect("join").expect_err("bad point refused");
    assert!(matches!(err, SinkError::Rejected(_)));

    // 一次整批提交 + 两次逐点重交
    assert_eq!(client.write_calls(), 3);
    assert_eq!(
        client.lines(),
        vec!["climate,building=b1 temperature=1 1700000000000000000".to_string()]
    );
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn wait_settled_returns_once_reconnected() {
    let client = Arc::new(InMemorySinkClient::new());
    let manager = SinkManager::new(client.clone(), config(1, 0), Shutdown::new());
    manager.connect().await.expect("connect");
    assert_eq!(manager.wait_settled().await, ConnectionState::Connected);

    for _ in 0..2 {
        client.fail_next_ping(SinkError::Transient("connection refused".to_string()));
    }
    client.fail_next_write(SinkError::Transient("connection reset".to_string()));
    manager.write(None, point(1.0)).await.expect_err("transient");

    let settled = tokio::time::timeout(Duration::from_secs(2), manager.wait_settled())
        .await
        .expect("settled in time");
    assert_eq!(settled, ConnectionState::Connected);
    assert_eq!(client.ping_count(), 4);
}

#[tokio::test]
async fn wait_settled_returns_on_shutdown() {
    let client = Arc::new(InMemorySinkClient::new());
    let shutdown = Shutdown::new();
    let manager = SinkManager::new(client.clone(), config(1, 0), shutdown.clone());
    manager.connect().await.expect("connect");
    manager
        .tracker()
        .transition(ConnectionState::Reconnecting)
        .expect("reconnecting");

    shutdown.trigger();
    let settled = tokio::time::timeout(Duration::from_secs(2), manager.wait_settled())
        .await
        .expect("settled in time");
    assert_eq!(settled, ConnectionState::Reconnecting);
}

#[tokio::test]
async fn unwritable_point_is_rejected() {
    let client = Arc::new(InMemorySinkClient::new());
    let manager = SinkManager::new(client.clone(), config(1, 0), Shutdown::new());
    manager.connect().await.expect("connect");

    let mut empty = Point::new("climate", 1);
    empty
        .fields
        .insert("temperature".to_string(), FieldValue::Float(f64::NAN));
    let err = manager.write(None, empty).await.expect_err("rejected");

    assert!(matches!(err, SinkError::Rejected(_)));
    assert_eq!(client.write_calls(), 0);
}

#[tokio::test]
async fn exhausted_reconnect_reports_fatal_once() {
    let client = Arc::new(InMemorySinkClient::new());
    let mut cfg = config(1, 0);
    cfg.reconnect = fast_policy(Some(1));
    let manager = SinkManager::new(client.clone(), cfg, Shutdown::new());
    manager.connect().await.expect("connect");

    let fatal = Arc::new(AtomicUsize::new(0));
    let counter = fatal.clone();
    manager.tracker().on_fatal(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    for _ in 0..2 {
        client.fail_next_ping(SinkError::Transient("refused".to_string()));
    }
    client.fail_next_write(SinkError::Transient("reset".to_string()));
    let _ = manager.write(None, point(1.0)).await;

    wait_for_state(&manager, ConnectionState::Disconnected).await;
    assert_eq!(fatal.load(Ordering::SeqCst), 1);
    assert!(!manager.tracker().report_fatal("again"));
}

#[tokio::test]
async fn connect_with_retry_stops_on_fatal() {
    let client = Arc::new(InMemorySinkClient::new());
    let manager = SinkManager::new(client.clone(), config(1, 0), Shutdown::new());

    client.fail_next_ping(SinkError::Fatal("http 404: bucket not found".to_string()));
    let err = manager.connect_with_retry().await.expect_err("fatal");

    assert!(matches!(err, SinkError::Fatal(_)));
    assert_eq!(client.ping_count(), 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn connect_with_retry_exhausts_budget() {
    let client = Arc::new(InMemorySinkClient::new());
    let mut cfg = config(1, 0);
    cfg.reconnect = fast_policy(Some(2));
    let manager = SinkManager::new(client.clone(), cfg, Shutdown::new());

    for _ in 0..3 {
        client.fail_next_ping(SinkError::Transient("refused".to_string()));
    }
    let err = manager.connect_with_retry().await.expect_err("exhausted");

    assert!(matches!(err, SinkError::FatalDisconnect(_)));
    assert_eq!(client.ping_count(), 3);
}

#[tokio::test]
async fn connect_with_retry_recovers() {
    let client = Arc::new(InMemorySinkClient::new());
    let manager = SinkManager::new(client.clone(), config(1, 0), Shutdown::new());

    client.fail_next_ping(SinkError::Transient("refused".to_string()));
    manager.connect_with_retry().await.expect("recovered");

    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(client.ping_count(), 2);
}
