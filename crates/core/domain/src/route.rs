use std::collections::BTreeMap;

/// AMQP exchange 类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangeKind {
    #[default]
    Topic,
    Direct,
    Fanout,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "topic" => Some(ExchangeKind::Topic),
            "direct" => Some(ExchangeKind::Direct),
            "fanout" => Some(ExchangeKind::Fanout),
            "headers" => Some(ExchangeKind::Headers),
            _ => None,
        }
    }
}

/// 路由规则：订阅定义 + 转换/落库目标。
///
/// 启动时由配置构建，进程生命周期内不可变。
#[derive(Debug, Clone, PartialEq)]
pub struct RouteRule {
    /// exchange 名称；空字符串表示默认 exchange（直接消费队列）。
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub routing_pattern: String,
    /// 队列名；为空时由代理生成独占队列。
    pub queue_name: Option<String>,
    pub durable: bool,
    pub measurement: Option<String>,
    /// 目标 bucket；为空时使用 sink 默认 bucket。
    pub bucket: Option<String>,
    pub tags: BTreeMap<String, String>,
    /// 源字段名 → 目标字段名。
    pub field_mapping: BTreeMap<String, String>,
    pub timestamp_field: String,
    /// 负载不是 JSON 对象时，是否退化为单个 `raw_message` 字段。
    pub raw_fallback: bool,
}

impl RouteRule {
    pub fn new(
        exchange: impl Into<String>,
        exchange_kind: ExchangeKind,
        routing_pattern: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            exchange_kind,
            routing_pattern: routing_pattern.into(),
            queue_name: None,
            durable: true,
            measurement: None,
            bucket: None,
            tags: BTreeMap::new(),
            field_mapping: BTreeMap::new(),
            timestamp_field: "timestamp".to_string(),
            raw_fallback: true,
        }
    }

    /// 日志中使用的路由标识。
    pub fn label(&self) -> String {
        format!("{}/{}", self.exchange, self.routing_pattern)
    }
}
