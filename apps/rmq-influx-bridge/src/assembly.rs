//! 桥接链路装配
//!
//! 把配置转换为各组件的参数，构建唯一的 broker / sink 管理器，
//! 并交给 `Bridge` 运行时。

use bridge_broker::{AmqpConfig, AmqpTransport, BrokerConfig, BrokerManager};
use bridge_config::{BridgeConfig, ReconnectConfig};
use bridge_connection::{BackoffPolicy, Shutdown};
use bridge_pipeline::{Bridge, BridgeSettings};
use bridge_routing::RouteTable;
use bridge_sink::{InfluxClient, InfluxConfig, SinkConfig, SinkManager};
use std::sync::Arc;

/// 按配置装配桥接进程（此时尚未建立任何网络连接）。
pub fn build_bridge(
    config: &BridgeConfig,
    shutdown: Shutdown,
) -> Result<Bridge, Box<dyn std::error::Error>> {
    let routes = RouteTable::new(config.routes()?)?;

    let rabbitmq = &config.rabbitmq;
    let transport = AmqpTransport::new(AmqpConfig {
        host: rabbitmq.host.clone(),
        port: rabbitmq.port,
        username: rabbitmq.username.clone(),
        password: rabbitmq.password.clone(),
        virtual_host: rabbitmq.virtual_host.clone(),
        heartbeat_secs: rabbitmq.heartbeat,
        operation_timeout_ms: rabbitmq.blocked_connection_timeout.saturating_mul(1000),
        prefetch_count: rabbitmq.prefetch_count,
    });
    let broker = BrokerManager::new(
        Arc::new(transport),
        BrokerConfig {
            reconnect: backoff_policy(&rabbitmq.reconnect),
        },
        shutdown.clone(),
    );

    let influxdb = &config.influxdb;
    let client = InfluxClient::new(InfluxConfig {
        url: influxdb.url.clone(),
        token: influxdb.token.clone(),
        org: influxdb.org.clone(),
        timeout_ms: influxdb.timeout,
    })?;
    let sink = SinkManager::new(
        Arc::new(client),
        SinkConfig {
            default_bucket: influxdb.bucket.clone(),
            batch_size: influxdb.batch_size,
            linger_ms: influxdb.linger_ms,
            reconnect: backoff_policy(&influxdb.reconnect),
        },
        shutdown,
    );

    Ok(Bridge::new(
        broker,
        sink,
        routes,
        BridgeSettings {
            grace_period_ms: config.shutdown.grace_period_ms,
        },
    ))
}

fn backoff_policy(reconnect: &ReconnectConfig) -> BackoffPolicy {
    BackoffPolicy {
        initial_delay_ms: reconnect.initial_delay_ms,
        max_delay_ms: reconnect.max_delay_ms,
        multiplier: reconnect.multiplier,
        jitter_percent: reconnect.jitter_percent,
        max_retries: reconnect.max_retries,
    }
}
