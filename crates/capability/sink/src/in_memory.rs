//! 时序库客户端内存实现
//!
//! 仅用于本地测试和演示：记录每次写入，可预置探测/写入失败、
//! 按内容拒收的行以及写入延迟。

use crate::client::SinkClient;
use crate::error::SinkError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// 一次成功写入。
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedWrite {
    pub bucket: String,
    pub lines: Vec<String>,
}

/// 内存时序库客户端
#[derive(Default)]
pub struct InMemorySinkClient {
    writes: Mutex<Vec<RecordedWrite>>,
    ping_failures: Mutex<VecDeque<SinkError>>,
    write_failures: Mutex<VecDeque<SinkError>>,
    refused: Mutex<Vec<String>>,
    write_delay: Mutex<Duration>,
    pings: AtomicUsize,
    write_calls: AtomicUsize,
}

impl InMemorySinkClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让接下来的一次探测失败（可多次调用排队）。
    pub fn fail_next_ping(&self, err: SinkError) {
        if let Ok(mut queue) = self.ping_failures.lock() {
            queue.push_back(err);
        }
    }

    /// 让接下来的一次写入失败（可多次调用排队）。
    pub fn fail_next_write(&self, err: SinkError) {
        if let Ok(mut queue) = self.write_failures.lock() {
            queue.push_back(err);
        }
    }

    /// 含有 `needle` 的行一律拒收（同批其他行一起失败，与 InfluxDB 的 400 行为一致）。
    pub fn refuse_lines_containing(&self, needle: &str) {
        if let Ok(mut refused) = self.refused.lock() {
            refused.push(needle.to_string());
        }
    }

    /// 每次写入前等待的时长（模拟慢写入）。
    pub fn set_write_delay(&self, delay: Duration) {
        if let Ok(mut current) = self.write_delay.lock() {
            *current = delay;
        }
    }

    /// 所有成功写入。
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.writes
            .lock()
            .map(|writes| writes.clone())
            .unwrap_or_default()
    }

    /// 所有成功写入的行（按写入顺序展开）。
    pub fn lines(&self) -> Vec<String> {
        self.writes()
            .into_iter()
            .flat_map(|write| write.lines)
            .collect()
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::Relaxed)
    }

    /// 写入调用次数（含失败）。
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::Relaxed)
    }
}

fn pop_failure(queue: &Mutex<VecDeque<SinkError>>) -> Option<SinkError> {
    queue.lock().ok().and_then(|mut queue| queue.pop_front())
}

#[async_trait]
impl SinkClient for InMemorySinkClient {
    async fn ping(&self) -> Result<(), SinkError> {
        self.pings.fetch_add(1, Ordering::Relaxed);
        match pop_failure(&self.ping_failures) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn write_lines(&self, bucket: &str, lines: &[String]) -> Result<(), SinkError> {
        self.write_calls.fetch_add(1, Ordering::Relaxed);
        let delay = self
            .write_delay
            .lock()
            .map(|delay| *delay)
            .unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = pop_failure(&self.write_failures) {
            return Err(err);
        }
        let refused = self.refused.lock().map(|refused| refused.clone()).unwrap_or_default();
        if let Some(line) = lines
            .iter()
            .find(|line| refused.iter().any(|needle| line.contains(needle.as_str())))
        {
            return Err(SinkError::Rejected(format!(
                "http 400: unable to parse '{}'",
                line
            )));
        }
        let mut writes = self
            .writes
            .lock()
            .map_err(|_| SinkError::Transient("lock failed".to_string()))?;
        writes.push(RecordedWrite {
            bucket: bucket.to_string(),
            lines: lines.to_vec(),
        });
        Ok(())
    }
}
