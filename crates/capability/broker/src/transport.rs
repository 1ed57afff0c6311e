//! 代理传输层抽象

use crate::error::BrokerError;
use async_trait::async_trait;
use domain::{AckVerdict, RawMessage, RouteRule};

/// 消息确认句柄（每条投递一个）。
#[async_trait]
pub trait Settle: Send + Sync {
    async fn settle(&self, verdict: AckVerdict) -> Result<(), BrokerError>;
}

/// 一条投递：消息本身 + 确认句柄。
pub struct Delivery {
    pub message: RawMessage,
    pub settler: Box<dyn Settle>,
}

/// 单个订阅的投递流；返回 `None` 表示 channel 已关闭。
#[async_trait]
pub trait DeliveryStream: Send {
    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>>;
}

/// 代理传输抽象。
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// 建立连接；已连接时不做任何事。
    async fn connect(&self) -> Result<(), BrokerError>;

    /// 声明 exchange / queue、绑定并开始消费。
    async fn subscribe(&self, rule: &RouteRule) -> Result<Box<dyn DeliveryStream>, BrokerError>;

    /// 关闭连接（未确认的消息由代理重投）。
    async fn close(&self);
}
