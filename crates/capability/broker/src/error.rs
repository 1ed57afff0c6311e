//! Broker 错误类型

/// 代理访问错误。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BrokerError {
    /// 网络或认证失败（可重试）
    #[error("connect error: {0}")]
    Connect(String),
    /// exchange/queue 声明或绑定被代理拒绝（需修正配置）
    #[error("subscription error: {0}")]
    Subscription(String),
    #[error("consume error: {0}")]
    Consume(String),
    #[error("settle error: {0}")]
    Settle(String),
    /// 连接或 channel 中断
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// 重连预算耗尽
    #[error("fatal disconnect after {attempts} attempts: {reason}")]
    FatalDisconnect { attempts: u32, reason: String },
    /// 处理器上报致命错误，消费中止
    #[error("consumption aborted: {0}")]
    Aborted(String),
}

impl BrokerError {
    /// 是否需要修正配置后才能恢复。
    pub fn is_permanent(&self) -> bool {
        matches!(self, BrokerError::Subscription(_))
    }
}

/// 消息处理器错误。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HandlerError {
    /// 进程级致命错误：当前消息重新入队，消费停止
    #[error("fatal: {0}")]
    Fatal(String),
}
