//! Scalar values carried from Postgres rows to the sink payload.
//!
//! A [`Value`] keeps each source column faithful through JSON
//! serialization: UUIDs render as canonical lowercase text, JSON/JSONB
//! passes through byte-exact, date/time types render as ISO-8601 strings
//! the sink accepts, numerics keep their full precision as decimal
//! strings, and `bytea` is emitted base64.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use indexmap::IndexMap;
use rust_decimal::Decimal;
use serde::{Serialize, Serializer, ser::Error as _};
use sqlx::{Postgres, Row, postgres::PgRow};
use uuid::Uuid;

/// A source row: column name → value, in declared column order.
pub type Record = IndexMap<String, Value>;

/// A composite primary key tuple: PK column name → value, in key order.
pub type KeyTuple = IndexMap<String, Value>;

/// A single source column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Numeric(Decimal),
    Text(String),
    Uuid(Uuid),
    /// Raw JSON text exactly as stored in a `json`/`jsonb` column.
    Json(String),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Bytes(Vec<u8>),
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Numeric(d) => Serialize::serialize(d, serializer),
            Value::Text(t) => serializer.serialize_str(t),
            Value::Uuid(u) => serializer.collect_str(u),
            Value::Json(raw) => serde_json::from_str::<&serde_json::value::RawValue>(raw)
                .map_err(|e| S::Error::custom(format!("invalid stored JSON: {e}")))?
                .serialize(serializer),
            Value::Date(d) => serializer.collect_str(d),
            Value::Time(t) => serializer.collect_str(t),
            Value::Timestamp(ts) => {
                serializer.collect_str(&ts.format("%Y-%m-%dT%H:%M:%S%.f"))
            }
            Value::TimestampTz(ts) => serializer.collect_str(&ts.to_rfc3339()),
            Value::Bytes(b) => serializer.serialize_str(&BASE64.encode(b)),
        }
    }
}

impl Value {
    /// Whether this value binds as a number in SQL parameters.
    ///
    /// Numeric key types bind as numbers so the planner can use the PK
    /// index directly; everything else binds as its text form and is cast
    /// server-side by the `$n::type` placeholder.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_) | Value::Numeric(_))
    }

    /// Text form used when binding non-numeric values as parameters.
    pub fn to_param_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Numeric(d) => d.to_string(),
            Value::Text(t) => t.clone(),
            Value::Uuid(u) => u.to_string(),
            Value::Json(raw) => raw.clone(),
            Value::Date(d) => d.to_string(),
            Value::Time(t) => t.to_string(),
            Value::Timestamp(ts) => ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
            Value::TimestampTz(ts) => ts.to_rfc3339(),
            Value::Bytes(b) => BASE64.encode(b),
        }
    }
}

/// Bind a key value as a query parameter.
///
/// The SQL builders emit a `::type` cast for every placeholder, so text
/// bindings convert server-side to the PK column's type.
pub fn bind_key<'q>(
    query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    value: &Value,
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    match value {
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::Numeric(d) => query.bind(*d),
        Value::Bool(b) => query.bind(*b),
        Value::Bytes(b) => query.bind(b.clone()),
        Value::Null => query.bind(None::<String>),
        other => query.bind(other.to_param_string()),
    }
}

/// Whether the SQL builders must select this column with a `::text` cast.
///
/// Types outside the decoded set pass through as their text form.
pub fn needs_text_cast(udt_name: &str) -> bool {
    !matches!(
        udt_name,
        "bool"
            | "int2"
            | "int4"
            | "int8"
            | "float4"
            | "float8"
            | "numeric"
            | "uuid"
            | "json"
            | "jsonb"
            | "date"
            | "time"
            | "timestamp"
            | "timestamptz"
            | "bytea"
            | "varchar"
            | "text"
            | "bpchar"
            | "char"
            | "name"
    )
}

/// Decode one result column into a [`Value`] according to its `udt_name`.
pub fn decode_column(row: &PgRow, idx: usize, udt_name: &str) -> Result<Value, sqlx::Error> {
    let value = match udt_name {
        "bool" => row.try_get::<Option<bool>, _>(idx)?.map(Value::Bool),
        "int2" => row
            .try_get::<Option<i16>, _>(idx)?
            .map(|v| Value::Int(v as i64)),
        "int4" => row
            .try_get::<Option<i32>, _>(idx)?
            .map(|v| Value::Int(v as i64)),
        "int8" => row.try_get::<Option<i64>, _>(idx)?.map(Value::Int),
        "float4" => row
            .try_get::<Option<f32>, _>(idx)?
            .map(|v| Value::Float(v as f64)),
        "float8" => row.try_get::<Option<f64>, _>(idx)?.map(Value::Float),
        "numeric" => row.try_get::<Option<Decimal>, _>(idx)?.map(Value::Numeric),
        "uuid" => row.try_get::<Option<Uuid>, _>(idx)?.map(Value::Uuid),
        "json" | "jsonb" => row
            .try_get::<Option<sqlx::types::Json<Box<serde_json::value::RawValue>>>, _>(idx)?
            .map(|v| Value::Json(v.0.get().to_string())),
        "date" => row.try_get::<Option<NaiveDate>, _>(idx)?.map(Value::Date),
        "time" => row.try_get::<Option<NaiveTime>, _>(idx)?.map(Value::Time),
        "timestamp" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)?
            .map(Value::Timestamp),
        "timestamptz" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)?
            .map(Value::TimestampTz),
        "bytea" => row.try_get::<Option<Vec<u8>>, _>(idx)?.map(Value::Bytes),
        // Everything else was selected with a ::text cast.
        _ => row.try_get::<Option<String>, _>(idx)?.map(Value::Text),
    };
    Ok(value.unwrap_or(Value::Null))
}
