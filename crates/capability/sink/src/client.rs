//! 时序库客户端
//!
//! - `SinkClient`：会话探测与批量写入抽象
//! - `InfluxClient`：InfluxDB v2 HTTP 实现（`/ping` + `/api/v2/write`）

use crate::error::SinkError;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use std::time::Duration;

/// 时序库客户端抽象。
#[async_trait]
pub trait SinkClient: Send + Sync {
    /// 探测时序库是否可用。
    async fn ping(&self) -> Result<(), SinkError>;

    /// 写入一批行协议文本到指定 bucket。
    async fn write_lines(&self, bucket: &str, lines: &[String]) -> Result<(), SinkError>;

    /// 关闭会话。
    async fn close(&self) {}
}

/// InfluxDB 连接参数。
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub timeout_ms: u64,
}

/// InfluxDB v2 HTTP 客户端。
#[derive(Debug, Clone)]
pub struct InfluxClient {
    http: reqwest::Client,
    config: InfluxConfig,
}

impl InfluxClient {
    pub fn new(config: InfluxConfig) -> Result<Self, SinkError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|err| SinkError::Connect(err.to_string()))?;
        Ok(Self { http, config })
    }

    fn endpoint(&self, path: &str) -> Result<Url, SinkError> {
        let base = self.config.url.trim_end_matches('/');
        Url::parse(&format!("{}{}", base, path))
            .map_err(|err| SinkError::Fatal(format!("invalid influxdb url: {}", err)))
    }

    fn authorization(&self) -> String {
        format!("Token {}", self.config.token)
    }
}

#[async_trait]
impl SinkClient for InfluxClient {
    async fn ping(&self) -> Result<(), SinkError> {
        let url = self.endpoint("/ping")?;
        let response = self
            .http
            .get(url)
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .send()
            .await
            .map_err(classify_request_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }

    async fn write_lines(&self, bucket: &str, lines: &[String]) -> Result<(), SinkError> {
        if lines.is_empty() {
            return Ok(());
        }
        let base = self.endpoint("/api/v2/write")?;
        let url = Url::parse_with_params(
            base.as_str(),
            &[
                ("org", self.config.org.as_str()),
                ("bucket", bucket),
                ("precision", "ns"),
            ],
        )
        .map_err(|err| SinkError::Fatal(format!("invalid influxdb url: {}", err)))?;
        let response = self
            .http
            .post(url)
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(lines.join("\n"))
            .send()
            .await
            .map_err(classify_request_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

fn classify_request_error(err: reqwest::Error) -> SinkError {
    if err.is_builder() {
        SinkError::Fatal(err.to_string())
    } else {
        SinkError::Transient(err.to_string())
    }
}

/// 按 HTTP 状态码划分失败类型。
pub(crate) fn classify_status(status: StatusCode, body: &str) -> SinkError {
    let message = format!("http {}: {}", status.as_u16(), body.trim());
    match status.as_u16() {
        401 | 403 | 404 => SinkError::Fatal(message),
        400 | 413 | 422 => SinkError::Rejected(message),
        _ => SinkError::Transient(message),
    }
}
