//! # Sink 连接管理
//!
//! 负责与时序库（InfluxDB v2）的会话生命周期：
//!
//! - [`client`]：`SinkClient` 抽象与基于 HTTP 的 `InfluxClient`
//! - [`line_protocol`]：Point → InfluxDB 行协议编码
//! - [`manager`]：`SinkManager`，批量提交、失败分类、后台重连
//! - [`in_memory`]：内存实现（用于测试和演示）
//!
//! ## 失败分类
//!
//! - 认证/授权失败、bucket 不存在：永久（`SinkError::Fatal`），不重试
//! - 网络错误、超时、429/5xx：瞬时（`SinkError::Transient`），触发重连
//! - 400/413/422：单条数据被拒绝（`SinkError::Rejected`），消息不可处理
//!
//! 瞬时失败时不在进程内缓存重试，而是把重试决定交还给协调器
//! （拒绝并重新入队），由代理重新投递。

pub mod client;
pub mod error;
pub mod in_memory;
pub mod line_protocol;
pub mod manager;

pub use client::{InfluxClient, InfluxConfig, SinkClient};
pub use error::{SinkError, WriteError};
pub use in_memory::{InMemorySinkClient, RecordedWrite};
pub use manager::{SinkConfig, SinkManager};
