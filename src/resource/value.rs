//! Typed column values
//!
//! Provider payloads are loosely typed (int64 fields arrive as strings,
//! timestamps as RFC 3339 text). Coercion into the declared column type is
//! lenient: anything that does not fit becomes null.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::cmp::Ordering;
use std::net::IpAddr;

/// Semantic type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Int,
    Double,
    Bool,
    Json,
    Timestamp,
    IpAddress,
}

/// A non-null cell value
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    String(String),
    Int(i64),
    Double(f64),
    Bool(bool),
    Json(Value),
    Timestamp(DateTime<Utc>),
    IpAddress(IpAddr),
}

impl ColumnValue {
    /// Coerce a JSON value into `ty`; `None` for null or ill-typed input
    pub fn coerce(ty: ColumnType, value: &Value) -> Option<Self> {
        if value.is_null() {
            return None;
        }

        match ty {
            ColumnType::String => Some(Self::String(match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })),
            ColumnType::Int => match value {
                Value::Number(n) => n.as_i64().map(Self::Int),
                Value::String(s) => s.trim().parse().ok().map(Self::Int),
                _ => None,
            },
            ColumnType::Double => match value {
                Value::Number(n) => n.as_f64().map(Self::Double),
                Value::String(s) => s.trim().parse().ok().map(Self::Double),
                _ => None,
            },
            ColumnType::Bool => match value {
                Value::Bool(b) => Some(Self::Bool(*b)),
                Value::String(s) => match s.to_ascii_lowercase().as_str() {
                    "true" => Some(Self::Bool(true)),
                    "false" => Some(Self::Bool(false)),
                    _ => None,
                },
                _ => None,
            },
            ColumnType::Json => Some(Self::Json(value.clone())),
            ColumnType::Timestamp => value
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| Self::Timestamp(t.with_timezone(&Utc))),
            ColumnType::IpAddress => value
                .as_str()
                .and_then(|s| s.parse().ok())
                .map(Self::IpAddress),
        }
    }

    /// Order two values of the same type; `None` across types or for JSON
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Double(a), Self::Double(b)) => a.partial_cmp(b),
            (Self::Int(a), Self::Double(b)) => (*a as f64).partial_cmp(b),
            (Self::Double(a), Self::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Timestamp(a), Self::Timestamp(b)) => Some(a.cmp(b)),
            (Self::IpAddress(a), Self::IpAddress(b)) => Some(a.cmp(b)),
            (Self::Json(a), Self::Json(b)) if a == b => Some(Ordering::Equal),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::String(s) => Value::String(s.clone()),
            Self::Int(i) => Value::from(*i),
            Self::Double(d) => serde_json::Number::from_f64(*d)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Bool(b) => Value::Bool(*b),
            Self::Json(v) => v.clone(),
            Self::Timestamp(t) => Value::String(t.to_rfc3339()),
            Self::IpAddress(ip) => Value::String(ip.to_string()),
        }
    }
}

impl Serialize for ColumnValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Follow a dot-separated path (numeric segments index arrays).
/// An empty path returns the value itself.
pub fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }

    let mut current = value;
    for part in path.split('.') {
        current = match part.parse::<usize>() {
            Ok(idx) if current.is_array() => current.get(idx)?,
            _ => current.get(part)?,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_int64_as_string() {
        assert_eq!(
            ColumnValue::coerce(ColumnType::Int, &json!("1234567890123")),
            Some(ColumnValue::Int(1_234_567_890_123))
        );
        assert_eq!(ColumnValue::coerce(ColumnType::Int, &json!("abc")), None);
    }

    #[test]
    fn test_timestamp_and_ip() {
        let ts = ColumnValue::coerce(ColumnType::Timestamp, &json!("2024-01-15T10:30:00.000-08:00"));
        assert_eq!(
            ts.map(|v| v.to_json()),
            Some(json!("2024-01-15T18:30:00+00:00"))
        );
        assert!(ColumnValue::coerce(ColumnType::IpAddress, &json!("10.0.0.2")).is_some());
        assert!(ColumnValue::coerce(ColumnType::IpAddress, &json!("nope")).is_none());
    }

    #[test]
    fn test_null_is_none_for_every_type() {
        for ty in [ColumnType::String, ColumnType::Json, ColumnType::Bool] {
            assert_eq!(ColumnValue::coerce(ty, &Value::Null), None);
        }
    }

    #[test]
    fn test_json_path() {
        let v = json!({"networkInterfaces": [{"networkIP": "10.0.0.2"}], "labels": {"env": "prod"}});
        assert_eq!(
            json_path(&v, "networkInterfaces.0.networkIP"),
            Some(&json!("10.0.0.2"))
        );
        assert_eq!(json_path(&v, "labels.env"), Some(&json!("prod")));
        assert_eq!(json_path(&v, "labels.missing"), None);
        assert_eq!(json_path(&v, ""), Some(&v));
    }

    #[test]
    fn test_compare_mixed_numbers() {
        assert_eq!(
            ColumnValue::Int(2).compare(&ColumnValue::Double(2.5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            ColumnValue::String("a".into()).compare(&ColumnValue::Int(1)),
            None
        );
    }
}
