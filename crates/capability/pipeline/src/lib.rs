//! # 桥接协调器
//!
//! 把 broker、路由表、字段转换与 sink 串成一条链路：
//!
//! ```text
//! 投递 → 路由 → 转换 → 写入 → 确认
//!         ↘       ↘       ↘
//!          拒绝（永久 / 瞬时）
//! ```
//!
//! - [`coordinator`]：逐条消息的状态机，决定确认结论
//! - [`runtime`]：启动顺序（sink 先于 broker）与优雅关闭

pub mod coordinator;
pub mod error;
pub mod runtime;

pub use coordinator::{BridgeCoordinator, Disposition, MessageStage, RejectKind};
pub use error::BridgeError;
pub use runtime::{Bridge, BridgeSettings};
