//! Sink 连接管理器
//!
//! 并发写入方的点先进入缓冲区，满 `batch_size` 或等待 `linger_ms` 后
//! 合并为一次请求提交（group commit）。每个写入方只在自己所在批次
//! 提交完成（或失败）后返回。

use crate::client::SinkClient;
use crate::error::{SinkError, WriteError};
use crate::line_protocol;
use bridge_connection::{BackoffPolicy, ConnectionTracker, RetryError, Shutdown, retry};
use domain::{ConnectionState, Point};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, warn};

/// Sink 管理器参数。
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// 路由未指定 bucket 时使用。
    pub default_bucket: String,
    pub batch_size: usize,
    pub linger_ms: u64,
    pub reconnect: BackoffPolicy,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            default_bucket: String::new(),
            batch_size: 1,
            linger_ms: 0,
            reconnect: BackoffPolicy::default(),
        }
    }
}

impl SinkConfig {
    fn sanitized(mut self) -> Self {
        if self.batch_size == 0 {
            self.batch_size = 1;
        }
        self
    }
}

struct PendingPoint {
    bucket: String,
    point: Point,
    done: oneshot::Sender<Result<(), SinkError>>,
}

struct SinkInner {
    client: Arc<dyn SinkClient>,
    config: SinkConfig,
    tracker: ConnectionTracker,
    buffer: Mutex<Vec<PendingPoint>>,
    flush_lock: Mutex<()>,
    shutdown: Shutdown,
}

/// 时序库连接管理器（进程内唯一，克隆共享同一会话）。
#[derive(Clone)]
pub struct SinkManager {
    inner: Arc<SinkInner>,
}

impl SinkManager {
    pub fn new(client: Arc<dyn SinkClient>, config: SinkConfig, shutdown: Shutdown) -> Self {
        let inner = SinkInner {
            client,
            config: config.sanitized(),
            tracker: ConnectionTracker::new("sink"),
            buffer: Mutex::new(Vec::new()),
            flush_lock: Mutex::new(()),
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

    /// 等待进行中的连接或重连结束：回到 `Connected`、放弃重连或收到关闭信号。
    ///
    /// 返回结束时的状态。不在连接中时立即返回。
    pub async fn wait_settled(&self) -> ConnectionState {
        let mut states = self.inner.tracker.watch();
        let settled = async move {
            let _ = states
                .wait_for(|state| {
                    !matches!(state, ConnectionState::Connecting | ConnectionState::Reconnecting)
                })
                .await;
        };
        tokio::select! {
            _ = settled => {}
            _ = self.inner.shutdown.wait() => {}
        }
        self.state()
    }

    /// 当前缓冲中等待提交的点数。
    pub async fn buffered(&self) -> usize {
        self.inner.buffer.lock().await.len()
    }

    /// 建立会话（ping）。已连接时直接返回。
    pub async fn connect(&self) -> Result<(), SinkError> {
        let tracker = &self.inner.tracker;
        match tracker.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Reconnecting => {
                return Err(SinkError::Connect("reconnect in progress".to_string()));
            }
            _ => {}
        }
        tracker
            .transition(ConnectionState::Connecting)
            .map_err(|err| SinkError::Connect(err.to_string()))?;
        match self.inner.client.ping().await {
            Ok(()) => {
                tracker
                    .transition(ConnectionState::Connected)
                    .map_err(|err| SinkError::Connect(err.to_string()))?;
                info!(target: "bridge.sink", "sink_connected");
                Ok(())
            }
            Err(err) => {
                let _ = tracker.transition(ConnectionState::Disconnected);
                Err(match err {
                    SinkError::Transient(message) => SinkError::Connect(message),
                    other => other,
                })
            }
        }
    }

    /// 按退避策略重复 `connect`；预算耗尽时上报致命断连。
    pub async fn connect_with_retry(&self) -> Result<(), SinkError> {
        let result = retry(
            "sink",
            &self.inner.config.reconnect,
            &self.inner.shutdown,
            is_permanent,
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
                Err(SinkError::Connect("cancelled by shutdown".to_string()))
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                let reason = format!("sink unreachable after {} attempts: {}", attempts, last);
                self.inner.tracker.report_fatal(&reason);
                Err(SinkError::FatalDisconnect(reason))
            }
        }
    }

    /// 提交一个点，等待其所在批次提交完成。
    ///
    /// `bucket` 为空时写入默认 bucket。未连接时立即返回瞬时错误。
    pub async fn write(&self, bucket: Option<&str>, point: Point) -> Result<(), SinkError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(SinkError::Transient(format!("sink is {}", state)));
        }
        let bucket = bucket
            .filter(|bucket| !bucket.is_empty())
            .unwrap_or(self.inner.config.default_bucket.as_str())
            .to_string();
        let (done, mut rx) = oneshot::channel();
        let full = {
            let mut buffer = self.inner.buffer.lock().await;
            buffer.push(PendingPoint {
                bucket,
                point,
                done,
            });
            buffer.len() >= self.inner.config.batch_size
        };

        if full || self.inner.config.linger_ms == 0 {
            let _ = self.flush().await;
        } else {
            let linger = Duration::from_millis(self.inner.config.linger_ms);
            match tokio::time::timeout(linger, &mut rx).await {
                Ok(result) => return result.unwrap_or_else(|_| Err(abandoned())),
                Err(_) => {
                    let _ = self.flush().await;
                }
            }
        }
        rx.await.unwrap_or_else(|_| Err(abandoned()))
    }

    /// 提交缓冲区中的全部点，返回成功写入的点数。
    pub async fn flush(&self) -> Result<usize, WriteError> {
        let _guard = self.inner.flush_lock.lock().await;
        let pending = std::mem::take(&mut *self.inner.buffer.lock().await);
        if pending.is_empty() {
            return Ok(0);
        }

        let state = self.state();
        if state != ConnectionState::Connected {
            let source = SinkError::Transient(format!("sink is {}", state));
            let mut failed = Vec::with_capacity(pending.len());
            for PendingPoint { point, done, .. } in pending {
                failed.push(point);
                let _ = done.send(Err(source.clone()));
            }
            return Err(WriteError { failed, source });
        }

        let mut written = 0;
        let mut failed = Vec::new();
        let mut first_error: Option<SinkError> = None;
        for (bucket, batch) in group_by_bucket(pending) {
            let mut lines = Vec::with_capacity(batch.len());
            let mut members = Vec::with_capacity(batch.len());
            for pending in batch {
                match line_protocol::encode(&pending.point) {
                    Ok(line) => {
                        lines.push(line);
                        members.push(pending);
                    }
                    Err(err) => {
                        let PendingPoint { point, done, .. } = pending;
                        failed.push(point);
                        first_error.get_or_insert_with(|| err.clone());
                        let _ = done.send(Err(err));
                    }
                }
            }
            if members.is_empty() {
                continue;
            }

            match self.submit(&bucket, &lines).await {
                Ok(()) => {
                    written += members.len();
                    for member in members {
                        let _ = member.done.send(Ok(()));
                    }
                }
                // 整批被拒时逐点重交，只有被拒的点本身失败
                Err(SinkError::Rejected(_)) if members.len() > 1 => {
                    for (line, member) in lines.iter().zip(members) {
                        match self.submit(&bucket, std::slice::from_ref(line)).await {
                            Ok(()) => {
                                written += 1;
                                let _ = member.done.send(Ok(()));
                            }
                            Err(err) => {
                                let PendingPoint { point, done, .. } = member;
                                failed.push(point);
                                first_error.get_or_insert_with(|| err.clone());
                                let _ = done.send(Err(err));
                            }
                        }
                    }
                }
                Err(err) => {
                    for PendingPoint { point, done, .. } in members {
                        failed.push(point);
                        let _ = done.send(Err(err.clone()));
                    }
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            None => Ok(written),
            Some(source) => Err(WriteError { failed, source }),
        }
    }

    /// 发出一次写请求；瞬时失败时启动后台重连。
    async fn submit(&self, bucket: &str, lines: &[String]) -> Result<(), SinkError> {
        if self.state() != ConnectionState::Connected {
            return Err(SinkError::Transient(format!("sink is {}", self.state())));
        }
        let started = Instant::now();
        let result = self.inner.client.write_lines(bucket, lines).await;
        bridge_telemetry::record_write_latency_ms(started.elapsed().as_millis() as u64);
        match &result {
            Ok(()) => {
                bridge_telemetry::record_write_success();
                debug!(
                    target: "bridge.sink",
                    bucket = %bucket,
                    points = lines.len(),
                    "batch_written"
                );
            }
            Err(err) => {
                bridge_telemetry::record_write_failure();
                warn!(
                    target: "bridge.sink",
                    bucket = %bucket,
                    points = lines.len(),
                    error = %err,
                    "batch_write_failed"
                );
                if err.is_transient() {
                    self.begin_reconnect(err);
                }
            }
        }
        result
    }

    /// 提交剩余缓冲并关闭会话。
    pub async fn close(&self) -> Result<(), WriteError> {
        let flushed = self.flush().await;
        self.inner.client.close().await;
        let _ = self.inner.tracker.transition(ConnectionState::Disconnected);
        info!(target: "bridge.sink", "sink_closed");
        flushed.map(|_| ())
    }

    /// 只有第一个把状态从 `Connected` 切到 `Reconnecting` 的失败方启动后台重连。
    fn begin_reconnect(&self, cause: &SinkError) {
        if !self
            .inner
            .tracker
            .transition_from(ConnectionState::Connected, ConnectionState::Reconnecting)
        {
            return;
        }
        warn!(target: "bridge.sink", error = %cause, "sink_reconnecting");
        let manager = self.clone();
        tokio::spawn(async move {
            manager.reconnect().await;
        });
    }

    async fn reconnect(&self) {
        let inner = &self.inner;
        let result = retry(
            "sink",
            &inner.config.reconnect,
            &inner.shutdown,
            is_permanent,
            |_| {
                let client = inner.client.clone();
                async move { client.ping().await }
            },
        )
        .await;
        match result {
            Ok(()) => {
                if let Ok(Some(_)) = inner.tracker.transition(ConnectionState::Connected) {
                    bridge_telemetry::record_sink_reconnect();
                    info!(target: "bridge.sink", "sink_reconnected");
                }
            }
            Err(RetryError::Cancelled) => {
                let _ = inner.tracker.transition(ConnectionState::Disconnected);
            }
            Err(err) => {
                inner.tracker.report_fatal(&err.to_string());
                let _ = inner.tracker.transition(ConnectionState::Disconnected);
            }
        }
    }
}

fn is_permanent(err: &SinkError) -> bool {
    matches!(err, SinkError::Fatal(_))
}

fn abandoned() -> SinkError {
    SinkError::Transient("write abandoned before submission".to_string())
}

/// 按 bucket 分组，保持首次出现顺序。
fn group_by_bucket(pending: Vec<PendingPoint>) -> Vec<(String, Vec<PendingPoint>)> {
    let mut groups: Vec<(String, Vec<PendingPoint>)> = Vec::new();
    for item in pending {
        match groups.iter_mut().find(|(bucket, _)| bucket == &item.bucket) {
            Some((_, members)) => members.push(item),
            None => groups.push((item.bucket.clone(), vec![item])),
        }
    }
    groups
}
