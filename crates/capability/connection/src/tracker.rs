use domain::ConnectionState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{error, info};

/// 一次状态转换。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// 非法状态转换。
#[derive(Debug, thiserror::Error)]
#[error("invalid transition for {name}: {from} -> {to}")]
pub struct TransitionError {
    pub name: &'static str,
    pub from: ConnectionState,
    pub to: ConnectionState,
}

type TransitionHandler = Box<dyn Fn(&Transition) + Send + Sync>;
type FatalHandler = Box<dyn Fn(&str) + Send + Sync>;

/// 单个外部依赖的连接状态机。
///
/// 允许的转换：
/// - `Disconnected -> Connecting`
/// - `Connecting -> Connected | Disconnected`
/// - `Connected -> Reconnecting | Disconnected`
/// - `Reconnecting -> Connected | Disconnected`
pub struct ConnectionTracker {
    name: &'static str,
    state: Mutex<ConnectionState>,
    handlers: RwLock<Vec<TransitionHandler>>,
    fatal_handlers: RwLock<Vec<FatalHandler>>,
    fatal_reported: AtomicBool,
    watch_tx: watch::Sender<ConnectionState>,
}

impl ConnectionTracker {
    pub fn new(name: &'static str) -> Self {
        let (watch_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            name,
            state: Mutex::new(ConnectionState::Disconnected),
            handlers: RwLock::new(Vec::new()),
            fatal_handlers: RwLock::new(Vec::new()),
            fatal_reported: AtomicBool::new(false),
            watch_tx,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// 订阅状态变化（用于等待某个状态）。
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.watch_tx.subscribe()
    }

    /// 注册状态转换回调。
    pub fn on_transition(&self, handler: impl Fn(&Transition) + Send + Sync + 'static) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.push(Box::new(handler));
        }
    }

    /// 注册致命断连回调（重试预算耗尽）。
    pub fn on_fatal(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        if let Ok(mut handlers) = self.fatal_handlers.write() {
            handlers.push(Box::new(handler));
        }
    }

    /// 转换到目标状态；与当前状态相同时不做任何事并返回 `None`。
    pub fn transition(&self, to: ConnectionState) -> Result<Option<Transition>, TransitionError> {
        let transition = {
            let mut state = self.state.lock().map_err(|_| TransitionError {
                name: self.name,
                from: ConnectionState::Disconnected,
                to,
            })?;
            let from = *state;
            if from == to {
                return Ok(None);
            }
            if !is_allowed(from, to) {
                return Err(TransitionError {
                    name: self.name,
                    from,
                    to,
                });
            }
            *state = to;
            Transition { from, to }
        };
        self.notify(&transition);
        Ok(Some(transition))
    }

    /// 仅当当前状态为 `expected` 时转换；返回是否发生了转换。
    ///
    /// 多个并发失败方中只有一个能把 `Connected` 切到 `Reconnecting`。
    pub fn transition_from(&self, expected: ConnectionState, to: ConnectionState) -> bool {
        let transition = {
            let Ok(mut state) = self.state.lock() else {
                return false;
            };
            if *state != expected || !is_allowed(expected, to) {
                return false;
            }
            *state = to;
            Transition { from: expected, to }
        };
        self.notify(&transition);
        true
    }

    /// 上报致命断连，整个生命周期内最多生效一次。
    pub fn report_fatal(&self, reason: &str) -> bool {
        if self.fatal_reported.swap(true, Ordering::SeqCst) {
            return false;
        }
        error!(
            target: "bridge.connection",
            component = self.name,
            reason = %reason,
            "fatal_disconnect"
        );
        if let Ok(handlers) = self.fatal_handlers.read() {
            for handler in handlers.iter() {
                handler(reason);
            }
        }
        true
    }

    fn notify(&self, transition: &Transition) {
        info!(
            target: "bridge.connection",
            component = self.name,
            from = %transition.from,
            to = %transition.to,
            "connection_state_changed"
        );
        self.watch_tx.send_replace(transition.to);
        if let Ok(handlers) = self.handlers.read() {
            for handler in handlers.iter() {
                handler(transition);
            }
        }
    }
}

fn is_allowed(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;
    matches!(
        (from, to),
        (Disconnected, Connecting)
            | (Connecting, Connected)
            | (Connecting, Disconnected)
            | (Connected, Reconnecting)
            | (Connected, Disconnected)
            | (Reconnecting, Connected)
            | (Reconnecting, Disconnected)
    )
}
