//! 嵌套结构展平：对象用 `.` 连接键名，数组用下标作为一段，null 丢弃。

use domain::FieldValue;
use serde_json::Value;

pub(crate) fn flatten_into(key: &str, value: &Value, out: &mut Vec<(String, FieldValue)>) {
    match value {
        Value::Null => {}
        Value::Bool(v) => out.push((key.to_string(), FieldValue::Boolean(*v))),
        Value::Number(n) => {
            let value = if let Some(i) = n.as_i64() {
                FieldValue::Integer(i)
            } else if let Some(f) = n.as_f64() {
                FieldValue::Float(f)
            } else {
                return;
            };
            out.push((key.to_string(), value));
        }
        Value::String(s) => out.push((key.to_string(), FieldValue::String(s.clone()))),
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                flatten_into(&format!("{}.{}", key, index), item, out);
            }
        }
        Value::Object(map) => {
            for (child, item) in map {
                flatten_into(&format!("{}.{}", key, child), item, out);
            }
        }
    }
}
