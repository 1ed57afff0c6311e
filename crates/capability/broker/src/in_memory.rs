//! 内存代理
//!
//! 仅用于本地测试和演示：按路由规则把发布的消息投递到订阅队列，
//! 记录每次确认；支持模拟断连（未确认消息重新入队并标记为重投）
//! 以及预置连接/订阅失败。

use crate::error::BrokerError;
use crate::transport::{BrokerTransport, Delivery, DeliveryStream, Settle};
use async_trait::async_trait;
use bridge_routing::rule_matches;
use domain::{AckVerdict, RawMessage, RouteRule};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// 一次确认记录。
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub redelivered: bool,
    pub verdict: AckVerdict,
}

struct Queue {
    name: String,
    rule: RouteRule,
    messages: VecDeque<RawMessage>,
}

#[derive(Default)]
struct State {
    connected: bool,
    epoch: u64,
    connects: usize,
    queues: Vec<Queue>,
    unacked: BTreeMap<u64, (String, RawMessage)>,
    settlements: Vec<Settlement>,
    connect_failures: VecDeque<BrokerError>,
    subscribe_failures: VecDeque<BrokerError>,
}

impl State {
    fn queue_mut(&mut self, name: &str) -> Option<&mut Queue> {
        self.queues.iter_mut().find(|queue| queue.name == name)
    }

    /// 断开当前会话：旧投递流结束，未确认消息回到队首。
    fn disconnect(&mut self) {
        self.connected = false;
        self.epoch += 1;
        let unacked = std::mem::take(&mut self.unacked);
        for (_, (queue_name, mut message)) in unacked.into_iter().rev() {
            message.redelivered = true;
            if let Some(queue) = self.queue_mut(&queue_name) {
                queue.messages.push_front(message);
            }
        }
    }
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
    next_tag: AtomicU64,
}

/// 内存代理传输
#[derive(Clone)]
pub struct InMemoryTransport {
    shared: Arc<Shared>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                next_tag: AtomicU64::new(1),
            }),
        }
    }

    /// 发布一条消息，返回投递到的队列数。
    pub fn publish(&self, exchange: &str, routing_key: &str, payload: impl Into<Vec<u8>>) -> usize {
        let payload = payload.into();
        let delivered = {
            let Ok(mut state) = self.shared.state.lock() else {
                return 0;
            };
            let mut delivered = 0;
            for queue in state.queues.iter_mut() {
                if rule_matches(&queue.rule, exchange, routing_key) {
                    queue
                        .messages
                        .push_back(RawMessage::new(exchange, routing_key, 0, payload.clone()));
                    delivered += 1;
                }
            }
            delivered
        };
        self.shared.notify.notify_waiters();
        delivered
    }

    /// 模拟连接中断。
    pub fn drop_connection(&self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.disconnect();
        }
        self.shared.notify.notify_waiters();
    }

    /// 让接下来的一次 connect 失败（可多次调用排队）。
    pub fn fail_next_connect(&self, err: BrokerError) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.connect_failures.push_back(err);
        }
    }

    /// 让接下来的一次 subscribe 失败（可多次调用排队）。
    pub fn fail_next_subscribe(&self, err: BrokerError) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.subscribe_failures.push_back(err);
        }
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.shared
            .state
            .lock()
            .map(|state| state.settlements.clone())
            .unwrap_or_default()
    }

    pub fn connect_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .map(|state| state.connects)
            .unwrap_or_default()
    }

    pub fn is_connected(&self) -> bool {
        self.shared
            .state
            .lock()
            .map(|state| state.connected)
            .unwrap_or(false)
    }

    /// 队列中等待投递的消息（不含已投递未确认的）。
    pub fn queued(&self) -> Vec<RawMessage> {
        self.shared
            .state
            .lock()
            .map(|state| {
                state
                    .queues
                    .iter()
                    .flat_map(|queue| queue.messages.iter().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 尚未确认的消息数（排队中 + 已投递未确认）。
    pub fn outstanding(&self) -> usize {
        self.shared
            .state
            .lock()
            .map(|state| {
                state
                    .queues
                    .iter()
                    .map(|queue| queue.messages.len())
                    .sum::<usize>()
                    + state.unacked.len()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl BrokerTransport for InMemoryTransport {
    async fn connect(&self) -> Result<(), BrokerError> {
        let mut state = self
            .shared
            .state
            .lock()
            .map_err(|_| BrokerError::Connect("lock failed".to_string()))?;
        if let Some(err) = state.connect_failures.pop_front() {
            return Err(err);
        }
        if !state.connected {
            state.connected = true;
            state.connects += 1;
        }
        Ok(())
    }

    async fn subscribe(&self, rule: &RouteRule) -> Result<Box<dyn DeliveryStream>, BrokerError> {
        let mut state = self
            .shared
            .state
            .lock()
            .map_err(|_| BrokerError::Subscription("lock failed".to_string()))?;
        if !state.connected {
            return Err(BrokerError::ConnectionLost("not connected".to_string()));
        }
        if let Some(err) = state.subscribe_failures.pop_front() {
            return Err(err);
        }
        let name = rule.queue_name.clone().unwrap_or_else(|| rule.label());
        if state.queue_mut(&name).is_none() {
            state.queues.push(Queue {
                name: name.clone(),
                rule: rule.clone(),
                messages: VecDeque::new(),
            });
        }
        Ok(Box::new(InMemoryStream {
            shared: self.shared.clone(),
            queue: name,
            epoch: state.epoch,
        }))
    }

    async fn close(&self) {
        if let Ok(mut state) = self.shared.state.lock() {
            if state.connected {
                state.disconnect();
            }
        }
        self.shared.notify.notify_waiters();
    }
}

struct InMemoryStream {
    shared: Arc<Shared>,
    queue: String,
    epoch: u64,
}

impl InMemoryStream {
    fn poll_queue(&self) -> Option<Option<Delivery>> {
        let mut state = self.shared.state.lock().ok()?;
        if !state.connected || state.epoch != self.epoch {
            return None;
        }
        let Some(mut message) = state
            .queue_mut(&self.queue)
            .and_then(|queue| queue.messages.pop_front())
        else {
            return Some(None);
        };
        let tag = self.shared.next_tag.fetch_add(1, Ordering::SeqCst);
        message.delivery_tag = tag;
        state
            .unacked
            .insert(tag, (self.queue.clone(), message.clone()));
        Some(Some(Delivery {
            message,
            settler: Box::new(InMemorySettler {
                shared: self.shared.clone(),
                tag,
                epoch: self.epoch,
            }),
        }))
    }
}

#[async_trait]
impl DeliveryStream for InMemoryStream {
    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>> {
        // 每次拉取前让出一次调度，模拟网络往返
        tokio::task::yield_now().await;
        loop {
            let notified = self.shared.notify.notified();
            match self.poll_queue() {
                None => return None,
                Some(Some(delivery)) => return Some(Ok(delivery)),
                Some(None) => notified.await,
            }
        }
    }
}

struct InMemorySettler {
    shared: Arc<Shared>,
    tag: u64,
    epoch: u64,
}

#[async_trait]
impl Settle for InMemorySettler {
    async fn settle(&self, verdict: AckVerdict) -> Result<(), BrokerError> {
        let requeued = {
            let mut state = self
                .shared
                .state
                .lock()
                .map_err(|_| BrokerError::Settle("lock failed".to_string()))?;
            if state.epoch != self.epoch {
                return Err(BrokerError::ConnectionLost("channel closed".to_string()));
            }
            let Some((queue_name, mut message)) = state.unacked.remove(&self.tag) else {
                return Err(BrokerError::Settle(format!(
                    "unknown delivery tag {}",
                    self.tag
                )));
            };
            state.settlements.push(Settlement {
                delivery_tag: self.tag,
                routing_key: message.routing_key.clone(),
                payload: message.payload.clone(),
                redelivered: message.redelivered,
                verdict,
            });
            if verdict == AckVerdict::RequeueReject {
                message.redelivered = true;
                if let Some(queue) = state.queue_mut(&queue_name) {
                    queue.messages.push_front(message);
                }
                true
            } else {
                false
            }
        };
        if requeued {
            self.shared.notify.notify_waiters();
        }
        Ok(())
    }
}
