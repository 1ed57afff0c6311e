//! 逐条消息处理
//!
//! 每条消息只会向前推进：
//! `Received → Routed → Transformed → Written → Acked`，
//! 任一非终态都可能转为 `Rejected(permanent | transient)`。
//! 瞬时拒绝的消息重新入队，重投后是一个新的实例。

use async_trait::async_trait;
use bridge_broker::{DeliveryHandler, HandlerError};
use bridge_routing::RouteTable;
use bridge_sink::{SinkError, SinkManager};
use bridge_telemetry::{
    record_dropped_unrouted, record_message_acked, record_message_received,
    record_rejected_permanent, record_rejected_transient, record_transform_failure,
};
use bridge_transform::{payload_excerpt, transform};
use domain::{AckVerdict, RawMessage, RouteRule};
use tracing::{debug, error, warn};

/// 拒绝类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectKind {
    /// 重试也会失败：不重新入队
    Permanent,
    /// 预期会恢复：重新入队等待重投
    Transient,
}

impl RejectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectKind::Permanent => "permanent",
            RejectKind::Transient => "transient",
        }
    }
}

/// 单条消息的处理阶段。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStage {
    Received,
    Routed,
    Transformed,
    Written,
    Acked,
    Rejected(RejectKind),
}

impl MessageStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStage::Received => "received",
            MessageStage::Routed => "routed",
            MessageStage::Transformed => "transformed",
            MessageStage::Written => "written",
            MessageStage::Acked => "acked",
            MessageStage::Rejected(RejectKind::Permanent) => "rejected_permanent",
            MessageStage::Rejected(RejectKind::Transient) => "rejected_transient",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStage::Acked | MessageStage::Rejected(_))
    }

    /// 只允许推进到下一阶段，或从非终态转为拒绝。
    pub fn can_advance_to(&self, next: MessageStage) -> bool {
        use MessageStage::*;
        match (self, next) {
            (Received, Routed) | (Routed, Transformed) | (Transformed, Written) | (Written, Acked) => {
                true
            }
            (from, Rejected(_)) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// 一条消息的最终处理结果。
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Acked,
    Rejected { kind: RejectKind, reason: String },
    /// 进程级致命错误（例如时序库凭据失效）
    Fatal(String),
}

impl Disposition {
    /// 转发给代理的确认结论；致命错误时消息重新入队。
    pub fn verdict(&self) -> AckVerdict {
        match self {
            Disposition::Acked => AckVerdict::Ack,
            Disposition::Rejected {
                kind: RejectKind::Permanent,
                ..
            } => AckVerdict::Reject,
            Disposition::Rejected {
                kind: RejectKind::Transient,
                ..
            }
            | Disposition::Fatal(_) => AckVerdict::RequeueReject,
        }
    }
}

/// 单条消息的阶段跟踪。
struct MessageFlow<'a> {
    message: &'a RawMessage,
    stage: MessageStage,
    route: Option<String>,
}

impl<'a> MessageFlow<'a> {
    fn new(message: &'a RawMessage) -> Self {
        Self {
            message,
            stage: MessageStage::Received,
            route: None,
        }
    }

    fn advance(&mut self, next: MessageStage) {
        if !self.stage.can_advance_to(next) {
            warn!(
                target: "bridge.pipeline",
                from = self.stage.as_str(),
                to = next.as_str(),
                "invalid_stage_transition"
            );
            return;
        }
        self.stage = next;
        debug!(
            target: "bridge.pipeline",
            delivery_tag = self.message.delivery_tag,
            route = self.route.as_deref().unwrap_or(""),
            stage = next.as_str(),
            "message_stage"
        );
    }

    fn reject(mut self, kind: RejectKind, reason: String) -> Disposition {
        self.advance(MessageStage::Rejected(kind));
        match kind {
            RejectKind::Permanent => record_rejected_permanent(),
            RejectKind::Transient => record_rejected_transient(),
        }
        warn!(
            target: "bridge.pipeline",
            route = self.route.as_deref().unwrap_or("<unrouted>"),
            exchange = %self.message.exchange,
            routing_key = %self.message.routing_key,
            delivery_tag = self.message.delivery_tag,
            redelivered = self.message.redelivered,
            kind = kind.as_str(),
            reason = %reason,
            payload = %payload_excerpt(&self.message.payload),
            "message_rejected"
        );
        Disposition::Rejected { kind, reason }
    }
}

/// 桥接协调器：按路由表转换消息并写入 sink，根据写入结果决定确认结论。
#[derive(Clone)]
pub struct BridgeCoordinator {
    routes: RouteTable,
    sink: SinkManager,
}

impl BridgeCoordinator {
    pub fn new(routes: RouteTable, sink: SinkManager) -> Self {
        Self { routes, sink }
    }

    /// 处理一条消息（按路由表查找规则），返回最终结果。
    pub async fn process(&self, message: &RawMessage) -> Disposition {
        self.dispatch(None, message).await
    }

    /// 处理来自某个订阅的消息：优先使用该订阅的规则。
    pub async fn process_from(&self, subscription: &RouteRule, message: &RawMessage) -> Disposition {
        self.dispatch(Some(subscription), message).await
    }

    async fn dispatch(&self, subscription: Option<&RouteRule>, message: &RawMessage) -> Disposition {
        record_message_received();
        debug!(
            target: "bridge.pipeline",
            exchange = %message.exchange,
            routing_key = %message.routing_key,
            delivery_tag = message.delivery_tag,
            payload_size = message.payload.len(),
            "message_received"
        );
        let mut flow = MessageFlow::new(message);

        // 1. 路由：找不到规则说明配置有缺口，永久拒绝
        let rule = match subscription {
            Some(subscription) => {
                self.routes
                    .resolve_for(subscription, &message.exchange, &message.routing_key)
            }
            None => self.routes.resolve(&message.exchange, &message.routing_key),
        };
        let Some(rule) = rule else {
            record_dropped_unrouted();
            return flow.reject(RejectKind::Permanent, "no matching route".to_string());
        };
        flow.route = Some(rule.label());
        flow.advance(MessageStage::Routed);

        // 2. 转换：负载问题重投也无法解决
        let point = match transform(message, rule) {
            Ok(point) => point,
            Err(err) => {
                record_transform_failure();
                return flow.reject(RejectKind::Permanent, err.to_string());
            }
        };
        flow.advance(MessageStage::Transformed);

        // 3. 写入：按失败类型决定确认结论
        match self.sink.write(rule.bucket.as_deref(), point).await {
            Ok(()) => {
                flow.advance(MessageStage::Written);
                flow.advance(MessageStage::Acked);
                record_message_acked();
                Disposition::Acked
            }
            Err(SinkError::Rejected(reason)) => flow.reject(RejectKind::Permanent, reason),
            Err(SinkError::Fatal(reason)) | Err(SinkError::FatalDisconnect(reason)) => {
                error!(
                    target: "bridge.pipeline",
                    route = flow.route.as_deref().unwrap_or(""),
                    delivery_tag = message.delivery_tag,
                    reason = %reason,
                    "sink_write_fatal"
                );
                Disposition::Fatal(reason)
            }
            Err(err) => {
                // 4. 等 sink 重连有结果后再重新入队，否则重投会立即再次失败
                let state = self.sink.wait_settled().await;
                debug!(
                    target: "bridge.pipeline",
                    delivery_tag = message.delivery_tag,
                    sink_state = %state,
                    "requeue_after_sink_settled"
                );
                flow.reject(RejectKind::Transient, err.to_string())
            }
        }
    }
}

#[async_trait]
impl DeliveryHandler for BridgeCoordinator {
    async fn handle(
        &self,
        subscription: &RouteRule,
        message: &RawMessage,
    ) -> Result<AckVerdict, HandlerError> {
        match self.process_from(subscription, message).await {
            Disposition::Fatal(reason) => Err(HandlerError::Fatal(reason)),
            disposition => Ok(disposition.verdict()),
        }
    }
}
