use std::fmt;

/// 外部依赖（代理 / 时序库）的连接状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 消息确认结论，由 broker 连接管理器转发给代理。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckVerdict {
    Ack,
    /// 拒绝且不重新入队（永久失败）。
    Reject,
    /// 拒绝并重新入队（瞬时失败，等待重投）。
    RequeueReject,
}

impl AckVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckVerdict::Ack => "ack",
            AckVerdict::Reject => "reject",
            AckVerdict::RequeueReject => "requeue_reject",
        }
    }
}
