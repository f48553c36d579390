// Values crossing the driver boundary and row normalization

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    LocalTimestamp(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
    Json(Value),
    List(Vec<SqlValue>),
    Map(IndexMap<String, SqlValue>),
}

/// A decoded driver row, columns in select order.
pub type Row = IndexMap<String, SqlValue>;

/// A normalized row as returned to callers.
pub type JsonRow = Map<String, Value>;

impl SqlValue {
    /// Convert a caller-supplied JSON value into a bind value.
    ///
    /// Integers that fit `i64` stay integers, other numbers become floats.
    /// Objects are kept as JSON documents.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Int(i),
                None => n.as_f64().map(SqlValue::Float).unwrap_or(SqlValue::Null),
            },
            Value::String(s) => SqlValue::Text(s.clone()),
            Value::Array(items) => SqlValue::List(items.iter().map(SqlValue::from_json).collect()),
            Value::Object(_) => SqlValue::Json(value.clone()),
        }
    }

    /// Render as JSON. Temporal values become ISO-8601 strings.
    pub fn to_json(&self) -> Value {
        match self {
            SqlValue::Null => Value::Null,
            SqlValue::Bool(b) => Value::Bool(*b),
            SqlValue::Int(i) => Value::Number((*i).into()),
            SqlValue::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
            SqlValue::Text(s) => Value::String(s.clone()),
            SqlValue::Timestamp(ts) => Value::String(ts.to_rfc3339()),
            SqlValue::LocalTimestamp(ts) => {
                Value::String(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
            }
            SqlValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
            SqlValue::Time(t) => Value::String(t.format("%H:%M:%S%.f").to_string()),
            SqlValue::Json(v) => v.clone(),
            SqlValue::List(items) => Value::Array(items.iter().map(SqlValue::to_json).collect()),
            SqlValue::Map(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Bool(_) => "bool",
            SqlValue::Int(_) => "int",
            SqlValue::Float(_) => "float",
            SqlValue::Text(_) => "text",
            SqlValue::Timestamp(_) => "timestamptz",
            SqlValue::LocalTimestamp(_) => "timestamp",
            SqlValue::Date(_) => "date",
            SqlValue::Time(_) => "time",
            SqlValue::Json(_) => "json",
            SqlValue::List(_) => "list",
            SqlValue::Map(_) => "map",
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

/// Normalize one driver row into a JSON row, recursing through nested values.
pub fn normalize_row(row: &Row) -> JsonRow {
    row.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()
}

pub fn normalize_rows(rows: &[Row]) -> Vec<JsonRow> {
    rows.iter().map(normalize_row).collect()
}

/// Identifier of a record addressed by id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Text(String),
}

impl RecordId {
    /// Integer parse first, otherwise the raw string.
    pub fn coerce(raw: &str) -> Self {
        match raw.parse::<i64>() {
            Ok(i) => RecordId::Int(i),
            Err(_) => RecordId::Text(raw.to_string()),
        }
    }

    pub fn to_sql_value(&self) -> SqlValue {
        match self {
            RecordId::Int(i) => SqlValue::Int(*i),
            RecordId::Text(s) => SqlValue::Text(s.clone()),
        }
    }

    pub fn to_json(&self) -> Value {
        self.to_sql_value().to_json()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Int(i) => write!(f, "{}", i),
            RecordId::Text(s) => f.write_str(s),
        }
    }
}

impl From<RecordId> for SqlValue {
    fn from(id: RecordId) -> Self {
        id.to_sql_value()
    }
}
