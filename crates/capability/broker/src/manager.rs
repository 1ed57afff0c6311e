//! Broker 连接管理器
//!
//! 状态转换：`Disconnected -> Connecting -> Connected`；投递流中断时
//! `Connected -> Reconnecting`，按退避策略重新连接并恢复全部订阅，
//! 成功回到 `Connected`，预算耗尽则上报一次致命断连并停止消费。

use crate::error::{BrokerError, HandlerError};
use crate::transport::{BrokerTransport, Delivery, DeliveryStream};
use async_trait::async_trait;
use bridge_connection::{
    BackoffPolicy, ConnectionTracker, RetryError, Shutdown, Transition, retry,
};
use domain::{AckVerdict, ConnectionState, RawMessage, RouteRule};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// 消息处理器：返回的确认结论由管理器转发给代理。
///
/// `subscription` 是投递该消息的订阅所对应的路由规则。
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(
        &self,
        subscription: &RouteRule,
        message: &RawMessage,
    ) -> Result<AckVerdict, HandlerError>;
}

/// Broker 管理器参数。
#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    pub reconnect: BackoffPolicy,
}

type LostHandler = Box<dyn Fn(&BrokerError) + Send + Sync>;
type Subscriptions = Vec<(RouteRule, Box<dyn DeliveryStream>)>;

struct BrokerInner {
    transport: Arc<dyn BrokerTransport>,
    config: BrokerConfig,
    tracker: ConnectionTracker,
    rules: Mutex<Vec<RouteRule>>,
    streams: Mutex<Subscriptions>,
    lost_handlers: RwLock<Vec<LostHandler>>,
    shutdown: Shutdown,
}

/// 消息代理连接管理器（进程内唯一，克隆共享同一会话）。
#[derive(Clone)]
pub struct BrokerManager {
    inner: Arc<BrokerInner>,
}

/// 一轮消费会话的结束原因。
enum SessionEnd {
    Shutdown,
    Lost(BrokerError),
    Aborted(String),
}

impl BrokerManager {
    pub fn new(transport: Arc<dyn BrokerTransport>, config: BrokerConfig, shutdown: Shutdown) -> Self {
        let inner = BrokerInner {
            transport,
            config,
            tracker: ConnectionTracker::new("broker"),
            rules: Mutex::new(Vec::new()),
            streams: Mutex::new(Vec::new()),
            lost_handlers: RwLock::new(Vec::new()),
            shutdown,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.tracker.state()
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.inner.tracker
    }

    /// 注册状态转换回调。
    pub fn on_transition(&self, handler: impl Fn(&Transition) + Send + Sync + 'static) {
        self.inner.tracker.on_transition(handler);
    }

    /// 注册连接中断回调（每次中断调用一次，随后进入重连）。
    pub fn on_connection_lost(&self, handler: impl Fn(&BrokerError) + Send + Sync + 'static) {
        if let Ok(mut handlers) = self.inner.lost_handlers.write() {
            handlers.push(Box::new(handler));
        }
    }

    /// 建立连接。已连接时直接返回。
    pub async fn connect(&self) -> Result<(), BrokerError> {
        let tracker = &self.inner.tracker;
        match tracker.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Reconnecting => {
                return Err(BrokerError::Connect("reconnect in progress".to_string()));
            }
            _ => {}
        }
        tracker
            .transition(ConnectionState::Connecting)
            .map_err(|err| BrokerError::Connect(err.to_string()))?;
        match self.inner.transport.connect().await {
            Ok(()) => {
                tracker
                    .transition(ConnectionState::Connected)
                    .map_err(|err| BrokerError::Connect(err.to_string()))?;
                info!(target: "bridge.broker", "broker_connected");
                Ok(())
            }
            Err(err) => {
                let _ = tracker.transition(ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    /// 按退避策略重复 `connect`；预算耗尽时上报致命断连。
    pub async fn connect_with_retry(&self) -> Result<(), BrokerError> {
        let result = retry(
            "broker",
            &self.inner.config.reconnect,
            &self.inner.shutdown,
            BrokerError::is_permanent,
            |_| {
                let manager = self.clone();
                async move { manager.connect().await }
            },
        )
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(RetryError::Permanent(err)) => Err(err),
            Err(RetryError::Cancelled) => {
                Err(BrokerError::Connect("cancelled by shutdown".to_string()))
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                let reason = last.to_string();
                self.inner.tracker.report_fatal(&reason);
                Err(BrokerError::FatalDisconnect { attempts, reason })
            }
        }
    }

    /// 为每条路由声明队列并开始接收投递。
    pub async fn subscribe(&self, rules: &[RouteRule]) -> Result<(), BrokerError> {
        if self.state() != ConnectionState::Connected {
            return Err(BrokerError::ConnectionLost(format!(
                "broker is {}",
                self.state()
            )));
        }
        let streams = self.open_streams(rules).await?;
        *self.inner.rules.lock().await = rules.to_vec();
        self.inner.streams.lock().await.extend(streams);
        Ok(())
    }

    /// 消费全部订阅，直到收到关闭信号、处理器上报致命错误或重连预算耗尽。
    pub async fn consume(&self, handler: Arc<dyn DeliveryHandler>) -> Result<(), BrokerError> {
        loop {
            if self.inner.shutdown.is_triggered() {
                return Ok(());
            }
            let streams = std::mem::take(&mut *self.inner.streams.lock().await);
            if streams.is_empty() {
                return Err(BrokerError::Consume("no active subscriptions".to_string()));
            }
            match self.run_session(streams, handler.clone()).await {
                SessionEnd::Shutdown => {
                    info!(target: "bridge.broker", "consume_stopped");
                    return Ok(());
                }
                SessionEnd::Aborted(reason) => {
                    warn!(target: "bridge.broker", reason = %reason, "consume_aborted");
                    return Err(BrokerError::Aborted(reason));
                }
                SessionEnd::Lost(cause) => {
                    if self.inner.shutdown.is_triggered() {
                        return Ok(());
                    }
                    self.recover(cause).await?;
                }
            }
        }
    }

    /// 关闭连接；未确认的消息由代理重投。
    pub async fn close(&self) {
        self.inner.streams.lock().await.clear();
        self.inner.transport.close().await;
        let _ = self.inner.tracker.transition(ConnectionState::Disconnected);
        info!(target: "bridge.broker", "broker_closed");
    }

    async fn open_streams(&self, rules: &[RouteRule]) -> Result<Subscriptions, BrokerError> {
        let mut streams = Vec::with_capacity(rules.len());
        for rule in rules {
            let stream = self.inner.transport.subscribe(rule).await?;
            info!(
                target: "bridge.broker",
                route = %rule.label(),
                exchange_kind = rule.exchange_kind.as_str(),
                queue = rule.queue_name.as_deref().unwrap_or("<server-named>"),
                "subscribed"
            );
            streams.push((rule.clone(), stream));
        }
        Ok(streams)
    }

    /// 一次重连尝试：连接 + 恢复全部订阅；订阅失败时丢弃半成品连接。
    async fn reopen(&self, rules: &[RouteRule]) -> Result<Subscriptions, BrokerError> {
        self.inner.transport.connect().await?;
        match self.open_streams(rules).await {
            Ok(streams) => Ok(streams),
            Err(err) => {
                self.inner.transport.close().await;
                Err(err)
            }
        }
    }

    async fn recover(&self, cause: BrokerError) -> Result<(), BrokerError> {
        let tracker = &self.inner.tracker;
        tracker.transition_from(ConnectionState::Connected, ConnectionState::Reconnecting);
        warn!(target: "bridge.broker", error = %cause, "broker_connection_lost");
        if let Ok(handlers) = self.inner.lost_handlers.read() {
            for handler in handlers.iter() {
                handler(&cause);
            }
        }
        self.inner.transport.close().await;

        let rules = self.inner.rules.lock().await.clone();
        let result = retry(
            "broker",
            &self.inner.config.reconnect,
            &self.inner.shutdown,
            BrokerError::is_permanent,
            |_| {
                let manager = self.clone();
                let rules = rules.clone();
                async move { manager.reopen(&rules).await }
            },
        )
        .await;
        match result {
            Ok(streams) => {
                *self.inner.streams.lock().await = streams;
                tracker
                    .transition(ConnectionState::Connected)
                    .map_err(|err| BrokerError::Connect(err.to_string()))?;
                bridge_telemetry::record_broker_reconnect();
                info!(target: "bridge.broker", "broker_reconnected");
                Ok(())
            }
            Err(RetryError::Cancelled) => {
                let _ = tracker.transition(ConnectionState::Disconnected);
                Ok(())
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                let reason = last.to_string();
                tracker.report_fatal(&reason);
                let _ = tracker.transition(ConnectionState::Disconnected);
                Err(BrokerError::FatalDisconnect { attempts, reason })
            }
            Err(RetryError::Permanent(err)) => {
                tracker.report_fatal(&err.to_string());
                let _ = tracker.transition(ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    async fn run_session(&self, streams: Subscriptions, handler: Arc<dyn DeliveryHandler>) -> SessionEnd {
        let mut workers = JoinSet::new();
        for (rule, stream) in streams {
            workers.spawn(consume_stream(
                rule,
                stream,
                handler.clone(),
                self.inner.shutdown.clone(),
            ));
        }
        let mut end = SessionEnd::Shutdown;
        while let Some(joined) = workers.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(err) => SessionEnd::Aborted(format!("consumer task failed: {}", err)),
            };
            if !matches!(outcome, SessionEnd::Shutdown) {
                end = outcome;
                break;
            }
        }
        workers.shutdown().await;
        end
    }
}

/// 单个 channel 的消费循环：逐条处理，确认之后才拉取下一条。
async fn consume_stream(
    rule: RouteRule,
    mut stream: Box<dyn DeliveryStream>,
    handler: Arc<dyn DeliveryHandler>,
    shutdown: Shutdown,
) -> SessionEnd {
    let route = rule.label();
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.wait() => return SessionEnd::Shutdown,
            next = stream.next() => next,
        };
        let Delivery { message, settler } = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(err)) => return SessionEnd::Lost(err),
            None => {
                return SessionEnd::Lost(BrokerError::ConnectionLost(format!(
                    "{} channel closed",
                    route
                )));
            }
        };

        let (verdict, fatal) = match handler.handle(&rule, &message).await {
            Ok(verdict) => (verdict, None),
            Err(HandlerError::Fatal(reason)) => (AckVerdict::RequeueReject, Some(reason)),
        };
        if let Err(err) = settler.settle(verdict).await {
            bridge_telemetry::record_settle_failure();
            warn!(
                target: "bridge.broker",
                route = %route,
                delivery_tag = message.delivery_tag,
                verdict = verdict.as_str(),
                error = %err,
                "settle_failed"
            );
            return match fatal {
                Some(reason) => SessionEnd::Aborted(reason),
                None => SessionEnd::Lost(err),
            };
        }
        debug!(
            target: "bridge.broker",
            route = %route,
            delivery_tag = message.delivery_tag,
            verdict = verdict.as_str(),
            "message_settled"
        );
        if let Some(reason) = fatal {
            return SessionEnd::Aborted(reason);
        }
    }
}
