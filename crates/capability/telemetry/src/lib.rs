//! 日志初始化与桥接计数指标。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 基础指标快照。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub messages_acked: u64,
    pub rejected_permanent: u64,
    pub rejected_transient: u64,
    pub dropped_unrouted: u64,
    pub transform_failures: u64,
    pub write_success: u64,
    pub write_failure: u64,
    pub write_latency_ms_total: u64,
    pub write_latency_ms_count: u64,
    pub settle_failures: u64,
    pub broker_reconnects: u64,
    pub sink_reconnects: u64,
}

/// 基础指标。
pub struct TelemetryMetrics {
    messages_received: AtomicU64,
    messages_acked: AtomicU64,
    rejected_permanent: AtomicU64,
    rejected_transient: AtomicU64,
    dropped_unrouted: AtomicU64,
    transform_failures: AtomicU64,
    write_success: AtomicU64,
    write_failure: AtomicU64,
    write_latency_ms_total: AtomicU64,
    write_latency_ms_count: AtomicU64,
    settle_failures: AtomicU64,
    broker_reconnects: AtomicU64,
    sink_reconnects: AtomicU64,
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            messages_acked: AtomicU64::new(0),
            rejected_permanent: AtomicU64::new(0),
            rejected_transient: AtomicU64::new(0),
            dropped_unrouted: AtomicU64::new(0),
            transform_failures: AtomicU64::new(0),
            write_success: AtomicU64::new(0),
            write_failure: AtomicU64::new(0),
            write_latency_ms_total: AtomicU64::new(0),
            write_latency_ms_count: AtomicU64::new(0),
            settle_failures: AtomicU64::new(0),
            broker_reconnects: AtomicU64::new(0),
            sink_reconnects: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_acked: self.messages_acked.load(Ordering::Relaxed),
            rejected_permanent: self.rejected_permanent.load(Ordering::Relaxed),
            rejected_transient: self.rejected_transient.load(Ordering::Relaxed),
            dropped_unrouted: self.dropped_unrouted.load(Ordering::Relaxed),
            transform_failures: self.transform_failures.load(Ordering::Relaxed),
            write_success: self.write_success.load(Ordering::Relaxed),
            write_failure: self.write_failure.load(Ordering::Relaxed),
            write_latency_ms_total: self.write_latency_ms_total.load(Ordering::Relaxed),
            write_latency_ms_count: self.write_latency_ms_count.load(Ordering::Relaxed),
            settle_failures: self.settle_failures.load(Ordering::Relaxed),
            broker_reconnects: self.broker_reconnects.load(Ordering::Relaxed),
            sink_reconnects: self.sink_reconnects.load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<TelemetryMetrics> = OnceLock::new();

/// 获取全局指标实例。
pub fn metrics() -> &'static TelemetryMetrics {
    METRICS.get_or_init(TelemetryMetrics::new)
}

/// 初始化 tracing。
///
/// `RUST_LOG` 存在时优先，否则使用配置中的日志级别。
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level.to_ascii_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 记录收到的消息数。
pub fn record_message_received() {
    metrics().messages_received.fetch_add(1, Ordering::Relaxed);
}

/// 记录确认（ack）的消息数。
pub fn record_message_acked() {
    metrics().messages_acked.fetch_add(1, Ordering::Relaxed);
}

/// 记录永久拒绝（不重新入队）的消息数。
pub fn record_rejected_permanent() {
    metrics().rejected_permanent.fetch_add(1, Ordering::Relaxed);
}

/// 记录瞬时拒绝（重新入队）的消息数。
pub fn record_rejected_transient() {
    metrics().rejected_transient.fetch_add(1, Ordering::Relaxed);
}

/// 记录未匹配任何路由的消息数。
pub fn record_dropped_unrouted() {
    metrics().dropped_unrouted.fetch_add(1, Ordering::Relaxed);
}

/// 记录转换失败次数。
pub fn record_transform_failure() {
    metrics().transform_failures.fetch_add(1, Ordering::Relaxed);
}

/// 记录写入成功次数。
pub fn record_write_success() {
    metrics().write_success.fetch_add(1, Ordering::Relaxed);
}

/// 记录写入失败次数。
pub fn record_write_failure() {
    metrics().write_failure.fetch_add(1, Ordering::Relaxed);
}

/// 记录写入延迟（毫秒）。
pub fn record_write_latency_ms(latency_ms: u64) {
    let metrics = metrics();
    metrics
        .write_latency_ms_total
        .fetch_add(latency_ms, Ordering::Relaxed);
    metrics
        .write_latency_ms_count
        .fetch_add(1, Ordering::Relaxed);
}

/// 记录确认/拒绝转发给代理失败的次数。
pub fn record_settle_failure() {
    metrics().settle_failures.fetch_add(1, Ordering::Relaxed);
}

/// 记录代理重连成功次数。
pub fn record_broker_reconnect() {
    metrics().broker_reconnects.fetch_add(1, Ordering::Relaxed);
}

/// 记录时序库重连成功次数。
pub fn record_sink_reconnect() {
    metrics().sink_reconnects.fetch_add(1, Ordering::Relaxed);
}
