//! RabbitMQ → InfluxDB 桥接进程。
//!
//! 退出码：收到 SIGINT/SIGTERM 并完成优雅关闭时为 0，致命错误时非 0。

mod assembly;

use bridge_config::BridgeConfig;
use bridge_connection::Shutdown;
use bridge_telemetry::{init_tracing, metrics};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

/// 命令行参数
#[derive(Parser, Debug)]
#[command(name = "rmq-influx-bridge", version, about = "Forward RabbitMQ messages into InfluxDB")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, env = "BRIDGE_CONFIG", default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在），便于直接 cargo run 启动
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    // YAML 配置 + BRIDGE_* 环境变量覆盖
    let config = BridgeConfig::load(&cli.config)?;
    // 初始化结构化日志（RUST_LOG 优先）
    init_tracing(&config.logging.level);
    info!(
        target: "bridge.pipeline",
        config = %cli.config.display(),
        topics = config.topics.len(),
        "config_loaded"
    );

    let shutdown = Shutdown::new();
    let bridge = assembly::build_bridge(&config, shutdown.clone())?;
    tokio::spawn(watch_signals(shutdown.clone()));

    let result = bridge.run(shutdown).await;
    let snapshot = metrics().snapshot();
    info!(
        target: "bridge.pipeline",
        received = snapshot.messages_received,
        acked = snapshot.messages_acked,
        rejected_permanent = snapshot.rejected_permanent,
        rejected_transient = snapshot.rejected_transient,
        write_failures = snapshot.write_failure,
        broker_reconnects = snapshot.broker_reconnects,
        sink_reconnects = snapshot.sink_reconnects,
        "bridge_metrics"
    );
    result?;
    Ok(())
}

async fn watch_signals(shutdown: Shutdown) {
    wait_for_signal().await;
    info!(target: "bridge.pipeline", "signal_received");
    shutdown.trigger();
}

/// 等待 SIGINT 或 SIGTERM。
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(target: "bridge.pipeline", error = %err, "ctrl_c_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(target: "bridge.pipeline", error = %err, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
