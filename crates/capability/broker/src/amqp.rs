//! AMQP 0-9-1 传输（lapin）
//!
//! 每个订阅独占一个 channel，并按 `prefetch_count` 设置 basic.qos。
//! 单次代理操作（声明、绑定、确认）超过 `operation_timeout_ms` 视为连接中断。

use crate::error::BrokerError;
use crate::transport::{BrokerTransport, Delivery, DeliveryStream, Settle};
use async_trait::async_trait;
use domain::{AckVerdict, ExchangeKind, RawMessage, RouteRule, now_epoch_ns};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{Channel, Connection, ConnectionProperties, Consumer};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// AMQP 连接参数。
#[derive(Debug, Clone)]
pub struct AmqpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub virtual_host: String,
    pub heartbeat_secs: u16,
    pub operation_timeout_ms: u64,
    pub prefetch_count: u16,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            virtual_host: "/".to_string(),
            heartbeat_secs: 600,
            operation_timeout_ms: 300_000,
            prefetch_count: 10,
        }
    }
}

impl AmqpConfig {
    /// 连接 URI，逐字段构造，凭据与 vhost 无需转义。
    pub fn uri(&self) -> AMQPUri {
        AMQPUri {
            scheme: AMQPScheme::AMQP,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.username.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.virtual_host.clone(),
            query: AMQPQueryString {
                heartbeat: Some(self.heartbeat_secs),
                ..AMQPQueryString::default()
            },
        }
    }

    fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms.max(1))
    }
}

/// 基于 lapin 的代理传输。
pub struct AmqpTransport {
    config: AmqpConfig,
    connection: Mutex<Option<Connection>>,
}

impl AmqpTransport {
    pub fn new(config: AmqpConfig) -> Self {
        Self {
            config,
            connection: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AmqpConfig {
        &self.config
    }

    async fn declare(&self, channel: &Channel, rule: &RouteRule) -> Result<String, BrokerError> {
        let limit = self.config.operation_timeout();
        // 默认 exchange 无需声明与绑定
        if !rule.exchange.is_empty() {
            bounded(
                "exchange_declare",
                limit,
                channel.exchange_declare(
                    &rule.exchange,
                    exchange_kind(rule.exchange_kind),
                    ExchangeDeclareOptions {
                        durable: rule.durable,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                ),
            )
            .await?;
        }

        let (queue_name, options) = match rule.queue_name.as_deref() {
            Some(name) => (
                name,
                QueueDeclareOptions {
                    durable: rule.durable,
                    ..QueueDeclareOptions::default()
                },
            ),
            None => (
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
            ),
        };
        let queue = bounded(
            "queue_declare",
            limit,
            channel.queue_declare(queue_name, options, FieldTable::default()),
        )
        .await?;
        let queue_name = queue.name().as_str().to_string();

        if !rule.exchange.is_empty() {
            bounded(
                "queue_bind",
                limit,
                channel.queue_bind(
                    &queue_name,
                    &rule.exchange,
                    &rule.routing_pattern,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                ),
            )
            .await?;
        }
        Ok(queue_name)
    }
}

#[async_trait]
impl BrokerTransport for AmqpTransport {
    async fn connect(&self) -> Result<(), BrokerError> {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.as_ref() {
            if connection.status().connected() {
                return Ok(());
            }
        }
        let connection = tokio::time::timeout(
            self.config.operation_timeout(),
            Connection::connect_uri(self.config.uri(), ConnectionProperties::default()),
        )
        .await
        .map_err(|_| BrokerError::Connect("connect timed out".to_string()))?
        .map_err(|err| BrokerError::Connect(err.to_string()))?;
        connection.on_error(|err| {
            warn!(target: "bridge.broker", error = %err, "amqp_connection_error");
        });
        debug!(
            target: "bridge.broker",
            host = %self.config.host,
            port = self.config.port,
            vhost = %self.config.virtual_host,
            "amqp_connected"
        );
        *guard = Some(connection);
        Ok(())
    }

    async fn subscribe(&self, rule: &RouteRule) -> Result<Box<dyn DeliveryStream>, BrokerError> {
        let limit = self.config.operation_timeout();
        let channel = {
            let guard = self.connection.lock().await;
            let connection = guard
                .as_ref()
                .ok_or_else(|| BrokerError::ConnectionLost("not connected".to_string()))?;
            bounded("create_channel", limit, connection.create_channel()).await?
        };
        bounded(
            "basic_qos",
            limit,
            channel.basic_qos(self.config.prefetch_count, BasicQosOptions::default()),
        )
        .await?;

        let queue_name = self.declare(&channel, rule).await?;
        let consumer_tag = format!("rmq-influx-bridge-{}", Uuid::new_v4());
        let consumer = bounded(
            "basic_consume",
            limit,
            channel.basic_consume(
                &queue_name,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            ),
        )
        .await?;
        debug!(
            target: "bridge.broker",
            route = %rule.label(),
            queue = %queue_name,
            consumer_tag = %consumer_tag,
            "amqp_consumer_started"
        );
        Ok(Box::new(AmqpDeliveryStream {
            consumer,
            _channel: channel,
            operation_timeout: limit,
        }))
    }

    async fn close(&self) {
        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection {
            let closed = tokio::time::timeout(
                self.config.operation_timeout(),
                connection.close(200, "bridge shutdown"),
            )
            .await;
            if let Ok(Err(err)) = closed {
                debug!(target: "bridge.broker", error = %err, "amqp_close_failed");
            }
        }
    }
}

struct AmqpDeliveryStream {
    consumer: Consumer,
    // channel 随订阅存活
    _channel: Channel,
    operation_timeout: Duration,
}

#[async_trait]
impl DeliveryStream for AmqpDeliveryStream {
    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>> {
        let item = self.consumer.next().await?;
        let operation_timeout = self.operation_timeout;
        Some(
            item.map(|delivery| {
                let message = RawMessage {
                    exchange: delivery.exchange.as_str().to_string(),
                    routing_key: delivery.routing_key.as_str().to_string(),
                    delivery_tag: delivery.delivery_tag,
                    redelivered: delivery.redelivered,
                    payload: delivery.data,
                    received_at_ns: now_epoch_ns(),
                };
                Delivery {
                    message,
                    settler: Box::new(AmqpSettler {
                        acker: delivery.acker,
                        operation_timeout,
                    }),
                }
            })
            .map_err(|err| BrokerError::Consume(err.to_string())),
        )
    }
}

struct AmqpSettler {
    acker: lapin::acker::Acker,
    operation_timeout: Duration,
}

#[async_trait]
impl Settle for AmqpSettler {
    async fn settle(&self, verdict: AckVerdict) -> Result<(), BrokerError> {
        let limit = self.operation_timeout;
        let result = match verdict {
            AckVerdict::Ack => {
                bounded("basic_ack", limit, self.acker.ack(BasicAckOptions::default()))
                    .await
                    .map(|_| ())
            }
            AckVerdict::Reject => bounded(
                "basic_nack",
                limit,
                self.acker.nack(BasicNackOptions {
                    requeue: false,
                    ..BasicNackOptions::default()
                }),
            )
            .await
            .map(|_| ()),
            AckVerdict::RequeueReject => bounded(
                "basic_nack",
                limit,
                self.acker.nack(BasicNackOptions {
                    requeue: true,
                    ..BasicNackOptions::default()
                }),
            )
            .await
            .map(|_| ()),
        };
        result.map_err(|err| match err {
            BrokerError::Subscription(message) => BrokerError::Settle(message),
            other => other,
        })
    }
}

/// 为单次代理操作加上超时，并按错误类型分类。
async fn bounded<T, F>(operation: &'static str, limit: Duration, future: F) -> Result<T, BrokerError>
where
    F: Future<Output = Result<T, lapin::Error>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(lapin::Error::ProtocolError(err))) => Err(BrokerError::Subscription(format!(
            "{} rejected: {}",
            operation, err
        ))),
        Ok(Err(err)) => Err(BrokerError::ConnectionLost(format!("{}: {}", operation, err))),
        Err(_) => Err(BrokerError::ConnectionLost(format!(
            "{} timed out after {}ms",
            operation,
            limit.as_millis()
        ))),
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}
