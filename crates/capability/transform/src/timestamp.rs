//! 负载时间戳解析：数字按 Unix 秒（可带小数），字符串按 RFC 3339 / ISO-8601（无时区视为 UTC）。

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

pub(crate) fn parse(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => {
            if let Some(secs) = n.as_i64() {
                return secs.checked_mul(1_000_000_000);
            }
            seconds_to_ns(n.as_f64()?)
        }
        Value::String(s) => parse_str(s.trim()),
        _ => None,
    }
}

fn seconds_to_ns(secs: f64) -> Option<i64> {
    let ns = (secs * 1e9).round();
    if ns.is_finite() && ns.abs() < i64::MAX as f64 {
        Some(ns as i64)
    } else {
        None
    }
}

fn parse_str(s: &str) -> Option<i64> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
        return parsed.timestamp_nanos_opt();
    }
    for format in NAIVE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(s, format) {
            return parsed.and_utc().timestamp_nanos_opt();
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()?
        .and_hms_opt(0, 0, 0)?
        .and_utc()
        .timestamp_nanos_opt()
}
