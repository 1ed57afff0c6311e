//! Sink 错误类型

use domain::Point;

/// 时序库访问错误。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SinkError {
    /// 建立会话失败（可重试）
    #[error("connect error: {0}")]
    Connect(String),
    /// 瞬时写入失败（网络、超时、服务端繁忙）
    #[error("transient write error: {0}")]
    Transient(String),
    /// 永久写入失败（凭据错误、bucket 不存在）
    #[error("fatal write error: {0}")]
    Fatal(String),
    /// 数据本身被时序库拒绝
    #[error("point rejected: {0}")]
    Rejected(String),
    /// 重连预算耗尽
    #[error("fatal disconnect: {0}")]
    FatalDisconnect(String),
}

impl SinkError {
    /// 是否适合通过重连 + 重投恢复。
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Connect(_) | SinkError::Transient(_))
    }
}

/// flush 失败：列出未能写入的点。
#[derive(Debug, thiserror::Error)]
#[error("{} point(s) not written: {source}", .failed.len())]
pub struct WriteError {
    pub failed: Vec<Point>,
    pub source: SinkError,
}
