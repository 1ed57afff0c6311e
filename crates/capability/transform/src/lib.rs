//! 字段转换：RawMessage + RouteRule -> Point。
//!
//! 纯函数，无内部可变状态；接收时间取自消息本身，
//! 因此同一输入总是得到相同的 Point。

mod flatten;
mod timestamp;

use domain::{FieldValue, Point, RawMessage, RouteRule};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// 非 JSON 负载退化时使用的字段名。
pub const RAW_MESSAGE_FIELD: &str = "raw_message";

const EXCERPT_LIMIT: usize = 120;

/// 转换错误（均为永久错误，消息不应重新入队）。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransformError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("empty measurement name")]
    EmptyMeasurement,
    #[error("no usable fields")]
    NoFields,
}

/// 将原始消息按路由规则转换为时序点。
pub fn transform(message: &RawMessage, rule: &RouteRule) -> Result<Point, TransformError> {
    let record = parse_record(&message.payload, rule)?;
    let measurement = measurement_name(message, rule)?;

    let mut ts_ns = message.received_at_ns;
    let mut passthrough = Vec::new();
    let mut renamed = Vec::new();
    for (key, value) in &record {
        if key == &rule.timestamp_field {
            if let Some(parsed) = timestamp::parse(value) {
                ts_ns = parsed;
            }
            continue;
        }
        // 顶层键命中映射时整体换名（嵌套值随之换前缀）
        if let Some(target) = rule.field_mapping.get(key) {
            flatten::flatten_into(target, value, &mut renamed);
            continue;
        }
        let mut leaves = Vec::new();
        flatten::flatten_into(key, value, &mut leaves);
        for (leaf, value) in leaves {
            match rule.field_mapping.get(&leaf) {
                Some(target) => renamed.push((target.clone(), value)),
                None => passthrough.push((leaf, value)),
            }
        }
    }

    let mut point = Point::new(measurement, ts_ns);
    point.fields = merge_fields(passthrough, renamed);
    point.tags = build_tags(message, rule);

    if !point.is_writable() {
        return Err(TransformError::NoFields);
    }
    Ok(point)
}

/// 日志用负载摘要（有损 UTF-8，截断）。
pub fn payload_excerpt(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    let mut excerpt: String = text.chars().take(EXCERPT_LIMIT).collect();
    if text.chars().count() > EXCERPT_LIMIT {
        excerpt.push_str("...");
    }
    excerpt
}

fn parse_record(
    payload: &[u8],
    rule: &RouteRule,
) -> Result<serde_json::Map<String, Value>, TransformError> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(map)) => return Ok(map),
        Ok(other) if !rule.raw_fallback => {
            return Err(TransformError::Malformed(format!(
                "expected json object, got {}",
                json_kind(&other)
            )));
        }
        Err(err) if !rule.raw_fallback => {
            return Err(TransformError::Malformed(err.to_string()));
        }
        _ => {}
    }
    let mut record = serde_json::Map::new();
    record.insert(
        RAW_MESSAGE_FIELD.to_string(),
        Value::String(String::from_utf8_lossy(payload).into_owned()),
    );
    Ok(record)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn measurement_name(message: &RawMessage, rule: &RouteRule) -> Result<String, TransformError> {
    if let Some(measurement) = rule.measurement.as_deref().filter(|m| !m.is_empty()) {
        return Ok(measurement.to_string());
    }
    if message.routing_key.is_empty() {
        return Err(TransformError::EmptyMeasurement);
    }
    Ok(message.routing_key.replace('.', "_"))
}

/// 合并直通字段与重命名字段：重命名结果覆盖同名的直通字段，
/// 多个源映射到同一目标时先到先得。
fn merge_fields(
    passthrough: Vec<(String, FieldValue)>,
    renamed: Vec<(String, FieldValue)>,
) -> BTreeMap<String, FieldValue> {
    let mut fields: BTreeMap<String, FieldValue> = passthrough.into_iter().collect();
    let mut claimed = BTreeSet::new();
    for (target, value) in renamed {
        if claimed.insert(target.clone()) {
            fields.insert(target, value);
        }
    }
    fields
}

/// 静态 tag 优先；exchange / routing_key 仅在未配置同名 tag 时补充。
fn build_tags(message: &RawMessage, rule: &RouteRule) -> BTreeMap<String, String> {
    let mut tags: BTreeMap<String, String> = rule
        .tags
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    if !message.exchange.is_empty() {
        tags.entry("exchange".to_string())
            .or_insert_with(|| message.exchange.clone());
    }
    if !message.routing_key.is_empty() {
        tags.entry("routing_key".to_string())
            .or_insert_with(|| message.routing_key.clone());
    }
    tags
}
