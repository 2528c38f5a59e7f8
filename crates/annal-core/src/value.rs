//! Cell values and semantic column types.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Semantic type of a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    BigInt,
    Float,
    Numeric,
    Boolean,
    Text,
    /// Variable-length string with an optional length limit.
    VarChar(Option<u32>),
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Uuid,
    Json,
    Bytes,
}

impl ColumnType {
    /// Postgres spelling of the type, used when rendering DDL.
    pub fn sql_name(&self) -> String {
        match self {
            Self::Integer => "integer".to_string(),
            Self::BigInt => "bigint".to_string(),
            Self::Float => "double precision".to_string(),
            Self::Numeric => "numeric".to_string(),
            Self::Boolean => "boolean".to_string(),
            Self::Text => "text".to_string(),
            Self::VarChar(Some(len)) => format!("varchar({})", len),
            Self::VarChar(None) => "varchar".to_string(),
            Self::Date => "date".to_string(),
            Self::Time => "time".to_string(),
            Self::Timestamp => "timestamp".to_string(),
            Self::TimestampTz => "timestamptz".to_string(),
            Self::Uuid => "uuid".to_string(),
            Self::Json => "jsonb".to_string(),
            Self::Bytes => "bytea".to_string(),
        }
    }

    /// Map an `information_schema.columns.data_type` value to a column type.
    ///
    /// Unknown types fall back to [`ColumnType::Text`].
    pub fn from_sql_name(data_type: &str) -> Self {
        let dt = data_type.trim().to_lowercase();

        match dt.as_str() {
            "integer" | "int" | "int4" | "smallint" | "int2" | "serial" => Self::Integer,
            "bigint" | "int8" | "bigserial" => Self::BigInt,
            "double precision" | "real" | "float4" | "float8" => Self::Float,
            "numeric" | "decimal" => Self::Numeric,
            "boolean" | "bool" => Self::Boolean,
            "text" => Self::Text,
            "character varying" | "varchar" => Self::VarChar(None),
            "date" => Self::Date,
            "time" | "time without time zone" => Self::Time,
            "timestamp" | "timestamp without time zone" => Self::Timestamp,
            "timestamptz" | "timestamp with time zone" => Self::TimestampTz,
            "uuid" => Self::Uuid,
            "json" | "jsonb" => Self::Json,
            "bytea" => Self::Bytes,
            _ if dt.starts_with("varchar(") || dt.starts_with("character varying(") => {
                let len = dt
                    .split_once('(')
                    .and_then(|(_, rest)| rest.trim_end_matches(')').parse::<u32>().ok());
                Self::VarChar(len)
            }
            _ => Self::Text,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql_name())
    }
}

/// A single cell value.
///
/// `Null` is a real value (the column holds SQL NULL). Whether an attribute
/// is loaded at all is tracked separately by the host's attribute snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(s) => write!(f, "{}", s),
            Self::Date(d) => write!(f, "{}", d),
            Self::Time(t) => write!(f, "{}", t),
            Self::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Self::Uuid(u) => write!(f, "{}", u),
            Self::Json(j) => write!(f, "{}", j),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<NaiveTime> for Value {
    fn from(v: NaiveTime) -> Self {
        Self::Time(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_sql_name() {
        assert_eq!(ColumnType::from_sql_name("integer"), ColumnType::Integer);
        assert_eq!(
            ColumnType::from_sql_name("timestamp with time zone"),
            ColumnType::TimestampTz
        );
        assert_eq!(
            ColumnType::from_sql_name("character varying"),
            ColumnType::VarChar(None)
        );
        assert_eq!(
            ColumnType::from_sql_name("varchar(36)"),
            ColumnType::VarChar(Some(36))
        );
        assert_eq!(ColumnType::from_sql_name("tsvector"), ColumnType::Text);
    }

    #[test]
    fn test_sql_name() {
        assert_eq!(ColumnType::VarChar(Some(50)).sql_name(), "varchar(50)");
        assert_eq!(ColumnType::Float.sql_name(), "double precision");
        assert_eq!(ColumnType::Json.to_string(), "jsonb");
    }

    #[test]
    fn test_option_conversion() {
        let none: Option<i64> = None;
        assert_eq!(Value::from(none), Value::Null);
        assert_eq!(Value::from(Some("Me")), Value::Text("Me".to_string()));
    }

    #[test]
    fn test_value_serialization() {
        let v = Value::Int(5);
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "int", "value": 5 }));

        let back: Value = serde_json::from_value(json).unwrap();
        assert_eq!(back, v);
    }
}
