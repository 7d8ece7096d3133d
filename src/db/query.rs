use bytes::BytesMut;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::SimpleQueryRow;

use crate::error::Result;

/// A driver-level value, as sent to or read from the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// String form of the value; `Null` converts to an empty string.
    pub fn as_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => s.clone(),
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Value::Json(j) => j.to_string(),
            Value::Timestamp(ts) => ts.to_rfc3339(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Binds through the inner value's own type check, so a value whose type
/// the parameter cannot take fails with `WrongType` instead of being sent
/// as mismatched bytes. Integers and floats narrow to the column width.
impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn StdError + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => b.to_sql_checked(ty, out),
            Value::Int(i) => match *ty {
                Type::INT2 => i16::try_from(*i)?.to_sql_checked(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql_checked(ty, out),
                _ => i.to_sql_checked(ty, out),
            },
            Value::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql_checked(ty, out),
                _ => f.to_sql_checked(ty, out),
            },
            Value::Text(s) => s.to_sql_checked(ty, out),
            Value::Bytes(b) => b.to_sql_checked(ty, out),
            Value::Json(j) => j.to_sql_checked(ty, out),
            Value::Timestamp(ts) => match *ty {
                Type::TIMESTAMP => ts.naive_utc().to_sql_checked(ty, out),
                _ => ts.to_sql_checked(ty, out),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// One result row or outbound record, keyed by lowercase column label.
pub type Record = HashMap<String, Value>;

/// Build a [`Record`] from a simple-query (text protocol) row.
pub fn record_from_row(row: &SimpleQueryRow) -> Record {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| {
            let value = match row.get(i) {
                Some(text) => Value::Text(text.to_string()),
                None => Value::Null,
            };
            (col.name().to_lowercase(), value)
        })
        .collect()
}

/// Fetch a column as a string, empty when missing or NULL.
pub fn record_string(record: &Record, column: &str) -> String {
    record
        .get(column)
        .map(Value::as_string)
        .unwrap_or_default()
}

/// A value that knows how to produce its own driver value.
pub trait Valuer: Send + Sync + fmt::Debug {
    fn value(&self) -> Result<Value>;
}

/// A field of an outbound record, tagged with its conversion capability.
#[derive(Debug)]
pub enum RecordValue {
    /// Converted through the host's default routine.
    Plain(Value),
    /// Extracted via [`Valuer::value`] and used as-is.
    Valuer(Box<dyn Valuer>),
}

impl From<Value> for RecordValue {
    fn from(v: Value) -> Self {
        RecordValue::Plain(v)
    }
}

/// How an insert treats rows that conflict with existing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InsertOption {
    #[default]
    Default,
    Replace,
    Save,
    Ignore,
}

impl fmt::Display for InsertOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsertOption::Default => write!(f, "insert"),
            InsertOption::Replace => write!(f, "replace"),
            InsertOption::Save => write!(f, "save"),
            InsertOption::Ignore => write!(f, "insert ignore"),
        }
    }
}
