//! 桥接运行时
//!
//! 启动顺序：sink 连接成功之后才连接 broker 并开始消费。
//!
//! 关闭顺序（收到关闭信号或致命错误）：
//! 1. 停止拉取新的投递
//! 2. 在宽限期内等待处理中的消息完成写入与确认
//! 3. 提交 sink 缓冲
//! 4. 关闭两端连接；宽限期后仍未确认的消息由代理重投

use crate::coordinator::BridgeCoordinator;
use crate::error::BridgeError;
use bridge_broker::BrokerManager;
use bridge_connection::Shutdown;
use bridge_routing::RouteTable;
use bridge_sink::SinkManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// 运行时参数。
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub grace_period_ms: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            grace_period_ms: 5_000,
        }
    }
}

/// 桥接进程：持有唯一的 broker / sink 管理器。
pub struct Bridge {
    broker: BrokerManager,
    sink: SinkManager,
    routes: RouteTable,
    settings: BridgeSettings,
}

impl Bridge {
    pub fn new(
        broker: BrokerManager,
        sink: SinkManager,
        routes: RouteTable,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            broker,
            sink,
            routes,
            settings,
        }
    }

    pub fn broker(&self) -> &BrokerManager {
        &self.broker
    }

    pub fn sink(&self) -> &SinkManager {
        &self.sink
    }

    /// 运行直到收到关闭信号（返回 `Ok`）或出现致命错误（返回 `Err`）。
    ///
    /// `shutdown` 必须与构造两个管理器时使用的是同一个信号。
    pub async fn run(&self, shutdown: Shutdown) -> Result<(), BridgeError> {
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<String>();
        self.sink.tracker().on_fatal(move |reason| {
            let _ = fatal_tx.send(reason.to_string());
        });

        info!(target: "bridge.pipeline", routes = self.routes.len(), "bridge_starting");

        // 1. sink 必须先于 broker 就绪
        if let Err(err) = self.sink.connect_with_retry().await {
            return self.abort_startup(&shutdown, BridgeError::Sink(err)).await;
        }

        // 2. broker 连接并订阅全部路由
        if let Err(err) = self.broker.connect_with_retry().await {
            return self.abort_startup(&shutdown, BridgeError::Broker(err)).await;
        }
        if let Err(err) = self.broker.subscribe(self.routes.rules()).await {
            return self.abort_startup(&shutdown, BridgeError::Broker(err)).await;
        }
        info!(target: "bridge.pipeline", "bridge_started");

        // 3. 消费，直到关闭信号、sink 致命断连或消费自身结束
        let coordinator = Arc::new(BridgeCoordinator::new(self.routes.clone(), self.sink.clone()));
        let mut consume = Box::pin(self.broker.consume(coordinator));

        let mut outcome: Result<(), BridgeError> = Ok(());
        let mut finished = None;
        tokio::select! {
            result = &mut consume => finished = Some(result),
            Some(reason) = fatal_rx.recv() => {
                error!(target: "bridge.pipeline", reason = %reason, "sink_fatal_disconnect");
                outcome = Err(BridgeError::SinkFatal(reason));
                shutdown.trigger();
            }
            _ = shutdown.wait() => {
                info!(target: "bridge.pipeline", "shutdown_requested");
            }
        }

        // 4. 宽限期内等待处理中的消息
        let consumed = match finished {
            Some(result) => result,
            None => {
                let grace = Duration::from_millis(self.settings.grace_period_ms);
                match tokio::time::timeout(grace, &mut consume).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(
                            target: "bridge.pipeline",
                            grace_period_ms = self.settings.grace_period_ms,
                            "grace_period_elapsed"
                        );
                        Ok(())
                    }
                }
            }
        };
        // 宽限期后仍在处理的消息直接放弃（其 worker 随之中止），不再触碰即将关闭的连接
        drop(consume);
        if let Err(err) = consumed {
            if outcome.is_ok() {
                outcome = Err(BridgeError::Broker(err));
            }
        }

        // 5. 提交缓冲并关闭连接
        self.close().await;
        match &outcome {
            Ok(()) => info!(target: "bridge.pipeline", "bridge_stopped"),
            Err(err) => error!(target: "bridge.pipeline", error = %err, "bridge_failed"),
        }
        outcome
    }

    async fn abort_startup(&self, shutdown: &Shutdown, err: BridgeError) -> Result<(), BridgeError> {
        self.close().await;
        if shutdown.is_triggered() {
            info!(target: "bridge.pipeline", "bridge_stopped");
            return Ok(());
        }
        error!(target: "bridge.pipeline", error = %err, "bridge_startup_failed");
        Err(err)
    }

    async fn close(&self) {
        if let Err(err) = self.sink.flush().await {
            warn!(
                target: "bridge.pipeline",
                failed = err.failed.len(),
                error = %err.source,
                "final_flush_failed"
            );
        }
        self.broker.close().await;
        if let Err(err) = self.sink.close().await {
            warn!(target: "bridge.pipeline", error = %err, "sink_close_failed");
        }
    }
}
