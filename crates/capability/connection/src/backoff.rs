use crate::Shutdown;
use rand_core::{OsRng, RngCore};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// 有界指数退避策略（带上限与抖动）。
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// 抖动幅度（基础延迟的百分比，0 表示不抖动）。
    pub jitter_percent: u8,
    /// 首次失败后的最大重试次数；`None` 表示不限。
    pub max_retries: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_percent: 20,
            max_retries: Some(10),
        }
    }
}

impl BackoffPolicy {
    /// 第 `retry` 次重试（从 0 开始）的基础延迟，不含抖动。
    pub fn base_delay(&self, retry: u32) -> Duration {
        let multiplier = self.multiplier.max(1.0);
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let delay_ms = (self.initial_delay_ms as f64) * multiplier.powi(exponent);
        let capped = if delay_ms.is_finite() {
            delay_ms.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// 第 `retry` 次重试的实际延迟（叠加 ±jitter_percent 的随机抖动）。
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        let jitter_range = base.as_millis() as u64 * u64::from(self.jitter_percent.min(100)) / 100;
        if jitter_range == 0 {
            return base;
        }
        let mut bytes = [0u8; 8];
        if OsRng.try_fill_bytes(&mut bytes).is_err() {
            return base;
        }
        let offset = u64::from_le_bytes(bytes) % (jitter_range * 2 + 1);
        let delay_ms = (base.as_millis() as u64 + offset).saturating_sub(jitter_range);
        Duration::from_millis(delay_ms)
    }

    /// 已经重试 `retries` 次后是否还允许继续。
    pub fn allows(&self, retries: u32) -> bool {
        match self.max_retries {
            Some(max) => retries < max,
            None => true,
        }
    }
}

/// 重试失败。
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: fmt::Debug + fmt::Display> {
    #[error("retry budget exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    #[error("permanent failure: {0}")]
    Permanent(E),
    #[error("cancelled by shutdown")]
    Cancelled,
}

/// 按退避策略重复执行 `op`，直到成功、遇到永久错误、预算耗尽或收到关闭信号。
///
/// `op` 的参数是当前尝试序号（从 1 开始）。
pub async fn retry<T, E, F, Fut>(
    component: &str,
    policy: &BackoffPolicy,
    shutdown: &Shutdown,
    is_permanent: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: fmt::Debug + fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut retries = 0u32;
    loop {
        if shutdown.is_triggered() {
            return Err(RetryError::Cancelled);
        }
        let attempt = retries + 1;
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if is_permanent(&err) {
            return Err(RetryError::Permanent(err));
        }
        if !policy.allows(retries) {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        }
        let delay = policy.delay(retries);
        warn!(
            target: "bridge.connection",
            component = component,
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retry_scheduled"
        );
        tokio::select! {
            _ = shutdown.wait() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        retries += 1;
    }
}
