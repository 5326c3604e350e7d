use relaydesk_common::Error;
use rusqlite::types::{Type, Value as SqlValue, ValueRef};
use serde_json::Value;

/// Wraps a rusqlite failure with the operation that hit it.
pub(crate) fn db_err(context: &'static str) -> impl FnOnce(rusqlite::Error) -> Error {
    move |e| Error::Database(format!("{context}: {e}"))
}

/// Lets row-mapping closures surface domain decode failures through rusqlite.
pub(crate) fn conversion_err(e: Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
}

pub(crate) fn json_column(value: Option<String>) -> rusqlite::Result<Option<Value>> {
    value
        .map(|raw| serde_json::from_str(&raw).map_err(|e| conversion_err(Error::Serialization(e))))
        .transpose()
}

/// Bind a JSON parameter. Booleans become 0/1; arrays and objects are stored
/// as their JSON text.
pub(crate) fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

pub(crate) fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::from(b.to_vec()),
    }
}
