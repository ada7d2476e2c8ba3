// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! InfluxDB v1 Line Protocol encoding.
//!
//! Line Protocol format:
//! ```text
//! measurement field1=val1,field2=val2 timestamp_ns
//! ```
//!
//! Bridge points carry no tags. The point timestamp is the local-time
//! string produced by [`crate::transform::format_timestamp`]; it is parsed
//! back through the local timezone to the nanosecond epoch value the write
//! endpoint expects.

use crate::transform::Point;
use chrono::{Local, NaiveDateTime, TimeZone};
use serde_json::Value;
use std::fmt;

/// Timestamp layout accepted back from points (fractional part optional).
const TIMESTAMP_PARSE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// A value that can be stored in an InfluxDB field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// 64-bit floating point.
    Float(f64),
    /// 64-bit signed integer.
    Integer(i64),
    /// UTF-8 string.
    String(String),
    /// Boolean value.
    Boolean(bool),
}

impl FieldValue {
    /// Map a JSON value to a field value.
    ///
    /// Nulls, arrays and objects have no Line Protocol representation and
    /// yield `None`.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(FieldValue::Integer(i))
                } else {
                    n.as_f64().map(FieldValue::Float)
                }
            }
            Value::String(s) => Some(FieldValue::String(s.clone())),
            Value::Bool(b) => Some(FieldValue::Boolean(*b)),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// Format this value for InfluxDB Line Protocol.
    ///
    /// - Float: written as-is (e.g., `3.14`)
    /// - Integer: suffixed with `i` (e.g., `42i`)
    /// - String: quoted with double quotes, inner quotes escaped
    /// - Boolean: `true` or `false`
    pub fn to_line_protocol(&self) -> String {
        match self {
            FieldValue::Float(v) => format!("{}", v),
            FieldValue::Integer(v) => format!("{}i", v),
            FieldValue::String(v) => {
                let escaped = v.replace('\\', "\\\\").replace('"', "\\\"");
                format!("\"{}\"", escaped)
            }
            FieldValue::Boolean(v) => {
                if *v {
                    "true".to_string()
                } else {
                    "false".to_string()
                }
            }
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_line_protocol())
    }
}

/// Encode a point as one Line Protocol line with a nanosecond timestamp.
///
/// Returns `None` when the point timestamp cannot be interpreted or when
/// none of the fields maps to a Line Protocol scalar (InfluxDB requires at
/// least one field per line).
pub fn encode_point(point: &Point) -> Option<String> {
    let timestamp_ns = parse_local_timestamp(&point.time)?;

    let fields: Vec<(&str, FieldValue)> = point
        .fields
        .iter()
        .filter_map(|(key, value)| FieldValue::from_json(value).map(|fv| (key.as_str(), fv)))
        .collect();
    if fields.is_empty() {
        return None;
    }

    let mut line = escape_measurement(&point.measurement);
    line.push(' ');
    for (i, (key, value)) in fields.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        line.push_str(&escape_field_key(key));
        line.push('=');
        line.push_str(&value.to_line_protocol());
    }
    line.push(' ');
    line.push_str(&timestamp_ns.to_string());
    Some(line)
}

/// Parse a point timestamp back into epoch nanoseconds, resolving it in the
/// local timezone it was formatted in.
fn parse_local_timestamp(time: &str) -> Option<i64> {
    let naive = NaiveDateTime::parse_from_str(time, TIMESTAMP_PARSE_FORMAT).ok()?;
    let local = Local.from_local_datetime(&naive).earliest()?;
    local.timestamp_nanos_opt()
}

/// Escape measurement name per Line Protocol spec.
/// Spaces and commas must be escaped with backslash.
fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Escape field key per Line Protocol spec.
/// Commas, equals signs, and spaces must be escaped.
fn escape_field_key(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::format_timestamp;
    use serde_json::json;

    fn point(measurement: &str, epoch_ms: i64, fields: Value) -> Point {
        let fields = match fields {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        };
        Point {
            measurement: measurement.to_string(),
            time: format_timestamp(epoch_ms).expect("ts"),
            fields,
        }
    }

    #[test]
    fn test_field_value_from_json() {
        assert_eq!(
            FieldValue::from_json(&json!(42)),
            Some(FieldValue::Integer(42))
        );
        assert_eq!(
            FieldValue::from_json(&json!(21.5)),
            Some(FieldValue::Float(21.5))
        );
        assert_eq!(
            FieldValue::from_json(&json!("on")),
            Some(FieldValue::String("on".to_string()))
        );
        assert_eq!(
            FieldValue::from_json(&json!(true)),
            Some(FieldValue::Boolean(true))
        );
        assert_eq!(FieldValue::from_json(&json!(null)), None);
        assert_eq!(FieldValue::from_json(&json!([1, 2])), None);
        assert_eq!(FieldValue::from_json(&json!({"nested": 1})), None);
    }

    #[test]
    fn test_field_value_formatting() {
        assert_eq!(FieldValue::Float(3.15).to_line_protocol(), "3.15");
        assert_eq!(FieldValue::Integer(42).to_line_protocol(), "42i");
        assert_eq!(
            FieldValue::String("say \"hi\"".to_string()).to_line_protocol(),
            "\"say \\\"hi\\\"\""
        );
        assert_eq!(FieldValue::Boolean(false).to_line_protocol(), "false");
    }

    #[test]
    fn test_encode_point_simple() {
        let p = point("sensor-7", 1_700_000_000_000, json!({"temp": 21.5}));
        let line = encode_point(&p).expect("line");
        assert_eq!(line, "sensor-7 temp=21.5 1700000000000000000");
    }

    #[test]
    fn test_encode_point_multiple_fields_sorted() {
        // Field maps iterate in key order, so the line layout is stable.
        let p = point(
            "sensor-7",
            1_700_000_000_000,
            json!({"temp": 21.5, "humidity": 40, "ok": true, "mode": "auto"}),
        );
        let line = encode_point(&p).expect("line");
        assert_eq!(
            line,
            "sensor-7 humidity=40i,mode=\"auto\",ok=true,temp=21.5 1700000000000000000"
        );
    }

    #[test]
    fn test_encode_point_escapes_special_chars() {
        let p = point(
            "my device",
            1_700_000_000_000,
            json!({"field key": "hello \"world\""}),
        );
        let line = encode_point(&p).expect("line");
        assert_eq!(
            line,
            "my\\ device field\\ key=\"hello \\\"world\\\"\" 1700000000000000000"
        );
    }

    #[test]
    fn test_encode_point_skips_unrepresentable_fields() {
        let p = point(
            "sensor-7",
            1_700_000_000_000,
            json!({"temp": 21.5, "trace": null, "raw": [1, 2]}),
        );
        let line = encode_point(&p).expect("line");
        assert_eq!(line, "sensor-7 temp=21.5 1700000000000000000");
    }

    #[test]
    fn test_encode_point_no_encodable_fields() {
        let p = point("sensor-7", 1_700_000_000_000, json!({"trace": null}));
        assert!(encode_point(&p).is_none());
    }

    #[test]
    fn test_encode_point_bad_timestamp() {
        let p = Point {
            measurement: "sensor-7".to_string(),
            time: "not a timestamp".to_string(),
            fields: match json!({"temp": 1}) {
                Value::Object(map) => map,
                _ => unreachable!(),
            },
        };
        assert!(encode_point(&p).is_none());
    }

    #[test]
    fn test_timestamp_roundtrip() {
        // Formatting to local time and parsing back preserves the instant.
        for epoch_ms in [0_i64, 1_600_000_000_000, 1_700_000_000_123] {
            let formatted = format_timestamp(epoch_ms).expect("ts");
            assert_eq!(
                parse_local_timestamp(&formatted),
                Some(epoch_ms * 1_000_000),
                "instant {epoch_ms} did not roundtrip"
            );
        }
    }
}
