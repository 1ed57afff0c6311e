use bridge_broker::BrokerError;
use bridge_routing::RouteError;
use bridge_sink::SinkError;

/// 桥接运行错误（均会导致进程以非零状态退出）。
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("route error: {0}")]
    Route(#[from] RouteError),
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("sink fatal disconnect: {0}")]
    SinkFatal(String),
}
