//! # Broker 连接管理
//!
//! 负责与消息代理（RabbitMQ / AMQP 0-9-1）的会话生命周期：
//!
//! - [`transport`]：`BrokerTransport` / `DeliveryStream` / `Settle` 抽象
//! - [`amqp`]：基于 lapin 的 AMQP 实现
//! - [`in_memory`]：内存代理（用于测试和演示，支持重投与断连模拟）
//! - [`manager`]：`BrokerManager`，订阅、逐条消费、确认转发、断线重连
//!
//! ## 确认语义
//!
//! 每个订阅一个 channel、一个 worker；同一 channel 上的消息严格串行处理，
//! 上一条消息的确认结论转发给代理之后才拉取下一条。

pub mod amqp;
pub mod error;
pub mod in_memory;
pub mod manager;
pub mod transport;

pub use amqp::{AmqpConfig, AmqpTransport};
pub use error::{BrokerError, HandlerError};
pub use in_memory::{InMemoryTransport, Settlement};
pub use manager::{BrokerConfig, BrokerManager, DeliveryHandler};
pub use transport::{BrokerTransport, Delivery, DeliveryStream, Settle};
