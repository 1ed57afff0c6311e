//! InfluxDB 行协议编码。
//!
//! ```text
//! measurement,tag1=val1,tag2=val2 field1=val1,field2=val2 timestamp_ns
//! ```

use crate::error::SinkError;
use domain::{FieldValue, Point};

/// 将一个点编码为一行；没有可写字段时返回 `Rejected`。
pub fn encode(point: &Point) -> Result<String, SinkError> {
    let mut fields = point
        .fields
        .iter()
        .filter_map(|(key, value)| format_field(value).map(|value| (key, value)))
        .peekable();
    if fields.peek().is_none() {
        return Err(SinkError::Rejected(format!(
            "measurement {} has no writable fields",
            point.measurement
        )));
    }

    let mut line = escape_measurement(&point.measurement);
    // BTreeMap 已按 key 排序
    for (key, value) in &point.tags {
        if value.is_empty() {
            continue;
        }
        line.push(',');
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&escape_key(value));
    }
    line.push(' ');
    for (index, (key, value)) in fields.enumerate() {
        if index > 0 {
            line.push(',');
        }
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&value);
    }
    line.push(' ');
    line.push_str(&point.ts_ns.to_string());
    Ok(line)
}

fn format_field(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::Float(v) if v.is_finite() => Some(v.to_string()),
        FieldValue::Float(_) => None,
        FieldValue::Integer(v) => Some(format!("{}i", v)),
        FieldValue::Boolean(v) => Some(v.to_string()),
        FieldValue::String(v) => Some(format!(
            "\"{}\"",
            v.replace('\\', "\\\\").replace('"', "\\\"")
        )),
    }
}

fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// tag key / tag value / field key 共用：转义逗号、等号和空格。
fn escape_key(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}
