//! 连接韧性：状态机、退避重试与关闭信号。
//!
//! broker 与 sink 两个连接管理器各自持有一个 [`ConnectionTracker`]，
//! 通过注册的转换回调对外通知状态变化，而不是依赖全局回调表。

mod backoff;
mod shutdown;
mod tracker;

pub use backoff::{BackoffPolicy, RetryError, retry};
pub use shutdown::Shutdown;
pub use tracker::{ConnectionTracker, Transition, TransitionError};
