use std::collections::BTreeMap;

/// 从代理收到的原始消息（接收后不可变）。
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub exchange: String,
    pub routing_key: String,
    /// 代理分配的投递标识，仅在所属 channel 内有效。
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub payload: Vec<u8>,
    pub received_at_ns: i64,
}

impl RawMessage {
    /// 以当前时间作为接收时间构造消息。
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        delivery_tag: u64,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            delivery_tag,
            redelivered: false,
            payload: payload.into(),
            received_at_ns: now_epoch_ns(),
        }
    }
}

/// 时序字段值。
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Boolean(bool),
    String(String),
}

/// 一条时序记录：measurement + tags + fields + 时间戳。
///
/// tags/fields 使用 `BTreeMap`，保证相同输入得到相同的键顺序。
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub ts_ns: i64,
}

impl Point {
    pub fn new(measurement: impl Into<String>, ts_ns: i64) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            ts_ns,
        }
    }

    /// 至少包含一个字段才允许写入。
    pub fn is_writable(&self) -> bool {
        !self.fields.is_empty()
    }
}

/// 当前 Unix 时间戳（纳秒）。
pub fn now_epoch_ns() -> i64 {
    let now = std::time::SystemTime::now();
    let duration = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}
