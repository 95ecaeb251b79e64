//! Qualifiers pushed down by the host
//!
//! A qualifier is a filter on one column. The engine uses them to prune
//! scopes and items before making calls, and evaluates them on assembled rows.

use super::value::{ColumnType, ColumnValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=", alias = "<>")]
    NotEq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    LtEq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    GtEq,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "is_null")]
    IsNull,
    #[serde(rename = "is_not_null")]
    IsNotNull,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Qualifier {
    pub column: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

impl Qualifier {
    pub fn new(column: impl Into<String>, operator: Operator, value: Value) -> Self {
        Self {
            column: column.into(),
            operator,
            value,
        }
    }

    pub fn equals(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, Operator::Eq, value.into())
    }

    /// Literal values this qualifier pins the column to, for `=` and `in`
    pub fn pinned_values(&self) -> Option<Vec<&Value>> {
        match (self.operator, &self.value) {
            (Operator::Eq, v) => Some(vec![v]),
            (Operator::In, Value::Array(values)) => Some(values.iter().collect()),
            _ => None,
        }
    }

    /// Evaluate against a cell of type `ty`. Comparisons with null are false.
    pub fn matches(&self, ty: ColumnType, cell: Option<&ColumnValue>) -> bool {
        match self.operator {
            Operator::IsNull => return cell.is_none(),
            Operator::IsNotNull => return cell.is_some(),
            _ => {}
        }

        let Some(cell) = cell else {
            return false;
        };

        if self.operator == Operator::In {
            let Value::Array(values) = &self.value else {
                return false;
            };
            return values
                .iter()
                .filter_map(|v| ColumnValue::coerce(ty, v))
                .any(|v| cell.compare(&v) == Some(Ordering::Equal));
        }

        let Some(expected) = ColumnValue::coerce(ty, &self.value) else {
            return false;
        };
        let Some(ordering) = cell.compare(&expected) else {
            return false;
        };

        match self.operator {
            Operator::Eq => ordering == Ordering::Equal,
            Operator::NotEq => ordering != Ordering::Equal,
            Operator::Lt => ordering == Ordering::Less,
            Operator::LtEq => ordering != Ordering::Greater,
            Operator::Gt => ordering == Ordering::Greater,
            Operator::GtEq => ordering != Ordering::Less,
            Operator::In | Operator::IsNull | Operator::IsNotNull => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_operator_symbols() {
        let q: Qualifier =
            serde_json::from_value(json!({"column": "status", "operator": "!=", "value": "RUNNING"}))
                .unwrap();
        assert_eq!(q.operator, Operator::NotEq);
        let q: Qualifier =
            serde_json::from_value(json!({"column": "name", "operator": "is_null"})).unwrap();
        assert_eq!(q.value, Value::Null);
    }

    #[test]
    fn test_matches() {
        let running = ColumnValue::String("RUNNING".into());
        assert!(Qualifier::equals("status", "RUNNING").matches(ColumnType::String, Some(&running)));
        assert!(!Qualifier::equals("status", "RUNNING").matches(ColumnType::String, None));

        let q = Qualifier::new("cpus", Operator::GtEq, json!(4));
        assert!(q.matches(ColumnType::Int, Some(&ColumnValue::Int(8))));
        assert!(!q.matches(ColumnType::Int, Some(&ColumnValue::Int(2))));

        let q = Qualifier::new("zone", Operator::In, json!(["a", "b"]));
        assert!(q.matches(ColumnType::String, Some(&ColumnValue::String("b".into()))));
        assert!(!q.matches(ColumnType::String, Some(&ColumnValue::String("c".into()))));

        assert!(Qualifier::new("x", Operator::IsNull, Value::Null).matches(ColumnType::Json, None));
    }

    #[test]
    fn test_pinned_values() {
        let q = Qualifier::new("project", Operator::In, json!(["a", "b"]));
        assert_eq!(q.pinned_values().map(|v| v.len()), Some(2));
        assert!(Qualifier::new("project", Operator::Gt, json!("a"))
            .pinned_values()
            .is_none());
    }
}
