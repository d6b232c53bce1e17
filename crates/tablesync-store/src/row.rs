//! Conversion between `SQLite` rows and JSON records.
//!
//! | `SQLite` | JSON |
//! |--------|------|
//! | NULL | null |
//! | INTEGER | number |
//! | REAL | number (non-finite becomes null) |
//! | TEXT | string |
//! | BLOB | base64 string |
//!
//! The reverse direction stores booleans as 0/1 and nested arrays or
//! objects as JSON text.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Row;
use serde_json::{Number, Value};
use tablesync_core::Record;

/// Read every column of a row into a record.
pub(crate) fn row_to_record(row: &Row<'_>, columns: &[String]) -> rusqlite::Result<Record> {
    let mut record = Record::new();
    for (idx, name) in columns.iter().enumerate() {
        record.insert(name.clone(), value_to_json(row.get_ref(idx)?));
    }
    Ok(record)
}

fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(STANDARD.encode(bytes)),
    }
}

/// Convert a client-supplied JSON value into a bindable `SQLite` value.
pub(crate) fn json_to_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map_or(SqlValue::Null, SqlValue::Real),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}
