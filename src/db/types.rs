//! Row decoding.
//!
//! Every backend row is decoded into an ordered list of JSON values plus the
//! column metadata describing them. Typed results are then produced from that
//! uniform shape by serde, so a single mapping contract covers all backends.
//!
//! Decoding happens in two steps: [`categorize_type`] sorts the driver's type
//! name into a [`TypeCategory`], and a per-backend decoder extracts the value.
//! A value the decoder cannot represent is a [`DbError::Decode`], never a
//! substituted NULL.

use crate::error::{DbError, DbResult};
use crate::models::{ColumnMetadata, DatabaseType, Record, RowSet};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo, ValueRef};
use std::sync::Arc;

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Timestamp,
    TimestampTz,
    Date,
    Time,
    Unknown,
}

/// Integer type names as reported by the drivers, without size or sign
/// modifiers.
const INTEGER_TYPES: &[&str] = &[
    "tinyint",
    "smallint",
    "mediumint",
    "int",
    "integer",
    "bigint",
    "int2",
    "int4",
    "int8",
    "smallserial",
    "serial",
    "bigserial",
    "year",
];

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();
    let base = lower.split(['(', ' ']).next().unwrap_or_default();

    // SQLite stores dates as text or numbers, never as a native temporal type
    if db != DatabaseType::SQLite {
        match lower.as_str() {
            "timestamptz" | "timestamp with time zone" => return TypeCategory::TimestampTz,
            // MySQL TIMESTAMP is stored in UTC
            "timestamp" if db == DatabaseType::MySQL => return TypeCategory::TimestampTz,
            "timestamp" | "datetime" | "timestamp without time zone" => {
                return TypeCategory::Timestamp;
            }
            "date" => return TypeCategory::Date,
            "time" | "time without time zone" => return TypeCategory::Time,
            _ => {}
        }
    }

    if base == "decimal" || base == "numeric" {
        if db == DatabaseType::SQLite {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    if INTEGER_TYPES.contains(&base) {
        return TypeCategory::Integer;
    }

    match base {
        "bool" | "boolean" => TypeCategory::Boolean,
        "float" | "float4" | "float8" | "double" | "real" => TypeCategory::Float,
        "json" | "jsonb" => TypeCategory::Json,
        "uuid" => TypeCategory::Uuid,
        "bytea" => TypeCategory::Binary,
        _ if lower.contains("blob") || lower.contains("binary") => TypeCategory::Binary,
        "name" | "citext" => TypeCategory::Text,
        _ if lower.contains("char") || lower.contains("text") => TypeCategory::Text,
        _ => TypeCategory::Unknown,
    }
}

/// The first of the listed Rust types that decodes column `$idx`, as JSON.
/// Integer width and signedness are fixed by the column type, so at most one
/// of them matches; when none does, the last decode error is returned.
macro_rules! decode_first_of {
    ($row:expr, $idx:expr, $($ty:ty),+ $(,)?) => {{
        let attempt: Result<JsonValue, sqlx::Error> =
            Err(sqlx::Error::Decode("no integer type matched".into()));
        $(
            let attempt = attempt.or_else(|_| {
                $row.try_get::<Option<$ty>, _>($idx).map(nullable)
            });
        )+
        attempt
    }};
}

fn nullable<T: Into<JsonValue>>(value: Option<T>) -> JsonValue {
    value.map(Into::into).unwrap_or(JsonValue::Null)
}

/// Read column `idx` as `T` and convert it with `f`. NULL stays NULL.
fn get<'r, R, T>(
    row: &'r R,
    idx: usize,
    f: impl FnOnce(T) -> JsonValue,
) -> Result<JsonValue, sqlx::Error>
where
    R: Row,
    usize: sqlx::ColumnIndex<R>,
    T: Type<R::Database> + Decode<'r, R::Database>,
{
    Ok(row.try_get::<Option<T>, _>(idx)?.map(f).unwrap_or(JsonValue::Null))
}

/// Single-precision columns only decode as `f32`, double-precision only as
/// `f64`.
fn decode_float<R>(row: &R, idx: usize, type_name: &str) -> Result<JsonValue, sqlx::Error>
where
    R: Row,
    usize: sqlx::ColumnIndex<R>,
    f64: Type<R::Database> + for<'r> Decode<'r, R::Database>,
    f32: Type<R::Database> + for<'r> Decode<'r, R::Database>,
{
    match type_name.to_ascii_lowercase().as_str() {
        "float" | "float4" | "real" => get(row, idx, |v: f32| float_value(f64::from(v))),
        _ => get(row, idx, float_value),
    }
}

/// Binary columns are exposed as base64 text.
pub fn encode_binary(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    JsonValue::String(STANDARD.encode(bytes))
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

/// Decimals travel as their exact text so no precision is lost on the way to
/// JSON.
fn decimal_value(v: Decimal) -> JsonValue {
    JsonValue::String(v.to_string())
}

fn text_or_json(v: String, type_name: &str) -> JsonValue {
    if type_name.to_lowercase().contains("json") {
        if let Ok(json) = serde_json::from_str::<JsonValue>(&v) {
            return json;
        }
    }
    JsonValue::String(v)
}

/// Temporal values serialize the way chrono's serde impls do, so typed rows
/// can deserialize them straight back into chrono types.
fn temporal<T: serde::Serialize>(value: T) -> JsonValue {
    serde_json::to_value(value).unwrap_or(JsonValue::Null)
}

/// Decoding of a backend row into the uniform record shape.
pub trait RowDecoder {
    fn column_metadata(&self) -> Vec<ColumnMetadata>;
    fn decode_values(&self) -> DbResult<Vec<JsonValue>>;
}

/// Decode a batch of rows sharing one column list.
///
/// Column metadata is taken from the first row; an empty batch has no columns.
pub fn decode_rows<R: RowDecoder>(rows: &[R]) -> DbResult<RowSet> {
    let Some(first) = rows.first() else {
        return Ok(RowSet::default());
    };
    let columns = first.column_metadata();
    let shared: Arc<[ColumnMetadata]> = columns.clone().into();
    let records = rows
        .iter()
        .map(|row| Ok(Record::new(Arc::clone(&shared), row.decode_values()?)))
        .collect::<DbResult<_>>()?;
    Ok(RowSet { columns, records })
}

macro_rules! impl_row_decoder {
    ($row:ty, $db:expr, $module:ident) => {
        impl RowDecoder for $row {
            fn column_metadata(&self) -> Vec<ColumnMetadata> {
                self.columns()
                    .iter()
                    .map(|col| {
                        ColumnMetadata::new(
                            col.name(),
                            col.type_info().name(),
                            !col.type_info().is_null(),
                        )
                    })
                    .collect()
            }

            fn decode_values(&self) -> DbResult<Vec<JsonValue>> {
                self.columns()
                    .iter()
                    .enumerate()
                    .map(|(idx, col)| {
                        let type_name = col.type_info().name();
                        let category = categorize_type(type_name, $db);
                        $module::decode_column(self, idx, type_name, category).map_err(|e| {
                            DbError::decode(format!(
                                "Column '{}' ({}): {}",
                                col.name(),
                                type_name,
                                e
                            ))
                        })
                    })
                    .collect()
            }
        }
    };
}

impl_row_decoder!(MySqlRow, DatabaseType::MySQL, mysql);
impl_row_decoder!(PgRow, DatabaseType::PostgreSQL, postgres);
impl_row_decoder!(SqliteRow, DatabaseType::SQLite, sqlite);

mod mysql {
    use super::*;

    pub fn decode_column(
        row: &MySqlRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> Result<JsonValue, sqlx::Error> {
        match category {
            TypeCategory::Decimal => get(row, idx, decimal_value),
            TypeCategory::Integer => {
                decode_first_of!(row, idx, i8, i16, i32, i64, u8, u16, u32, u64)
            }
            TypeCategory::Boolean => get(row, idx, JsonValue::Bool),
            TypeCategory::Float => decode_float(row, idx, type_name),
            TypeCategory::Binary => get(row, idx, |v: Vec<u8>| encode_binary(&v)),
            TypeCategory::Json => get(row, idx, |v: JsonValue| v),
            TypeCategory::TimestampTz => get(row, idx, temporal::<DateTime<Utc>>),
            TypeCategory::Timestamp => get(row, idx, temporal::<NaiveDateTime>),
            TypeCategory::Date => get(row, idx, temporal::<NaiveDate>),
            TypeCategory::Time => get(row, idx, temporal::<NaiveTime>),
            _ => get(row, idx, |v: String| text_or_json(v, type_name)),
        }
    }
}

mod postgres {
    use super::*;
    use sqlx::postgres::types::PgInterval;
    use sqlx::postgres::{PgTypeKind, PgValueFormat};

    pub fn decode_column(
        row: &PgRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> Result<JsonValue, sqlx::Error> {
        match category {
            TypeCategory::Decimal => {
                let raw = row.try_get_raw(idx)?;
                // Unprepared statements return the server's exact text
                if !raw.is_null() && raw.format() == PgValueFormat::Text {
                    let text = raw.as_str().map_err(sqlx::Error::Decode)?;
                    return Ok(JsonValue::String(text.to_string()));
                }
                get(row, idx, decimal_value)
            }
            TypeCategory::Integer => decode_first_of!(row, idx, i16, i32, i64),
            TypeCategory::Boolean => get(row, idx, JsonValue::Bool),
            TypeCategory::Float => decode_float(row, idx, type_name),
            TypeCategory::Binary => get(row, idx, |v: Vec<u8>| encode_binary(&v)),
            TypeCategory::Json => get(row, idx, |v: JsonValue| v),
            TypeCategory::TimestampTz => get(row, idx, temporal::<DateTime<Utc>>),
            TypeCategory::Timestamp => get(row, idx, temporal::<NaiveDateTime>),
            TypeCategory::Date => get(row, idx, temporal::<NaiveDate>),
            TypeCategory::Time => get(row, idx, temporal::<NaiveTime>),
            TypeCategory::Uuid => get(row, idx, |v: uuid::Uuid| JsonValue::String(v.to_string())),
            TypeCategory::Text => get(row, idx, JsonValue::String),
            TypeCategory::Unknown => decode_other(row, idx, type_name),
        }
    }

    /// Types without a dedicated decoder. Text-format values are the server's
    /// own rendering and pass through; binary values need a known layout.
    fn decode_other(row: &PgRow, idx: usize, type_name: &str) -> Result<JsonValue, sqlx::Error> {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            return Ok(JsonValue::Null);
        }
        let is_enum = matches!(raw.type_info().kind(), PgTypeKind::Enum(_));
        if raw.format() == PgValueFormat::Text || is_enum {
            let text = raw.as_str().map_err(sqlx::Error::Decode)?;
            return Ok(JsonValue::String(text.to_string()));
        }
        if type_name.eq_ignore_ascii_case("interval") {
            return get(row, idx, |v: PgInterval| {
                serde_json::json!({
                    "months": v.months,
                    "days": v.days,
                    "microseconds": v.microseconds,
                })
            });
        }
        Err(sqlx::Error::Decode(
            format!("no decoder for binary values of type {}", type_name).into(),
        ))
    }
}

mod sqlite {
    use super::*;

    /// Declared column types are only affinities (and expressions have none),
    /// so the decoder follows the storage class of the value itself. The
    /// declared type only decides whether an integer is a boolean.
    pub fn decode_column(
        row: &SqliteRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> Result<JsonValue, sqlx::Error> {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            return Ok(JsonValue::Null);
        }
        let storage = raw.type_info().name().to_string();
        match storage.as_str() {
            "INTEGER" if category == TypeCategory::Boolean => get(row, idx, JsonValue::Bool),
            "INTEGER" => get(row, idx, |v: i64| JsonValue::from(v)),
            "REAL" => get(row, idx, float_value),
            "BLOB" => get(row, idx, |v: Vec<u8>| encode_binary(&v)),
            _ => get(row, idx, |v: String| text_or_json(v, type_name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_type_integer() {
        assert_eq!(
            categorize_type("INT", DatabaseType::MySQL),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("BIGINT", DatabaseType::PostgreSQL),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("SERIAL", DatabaseType::PostgreSQL),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("TINYINT UNSIGNED", DatabaseType::MySQL),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("INTERVAL", DatabaseType::PostgreSQL),
            TypeCategory::Unknown
        );
        assert_eq!(
            categorize_type("POINT", DatabaseType::PostgreSQL),
            TypeCategory::Unknown
        );
    }

    #[test]
    fn test_categorize_type_tiny_text_is_not_integer() {
        assert_eq!(
            categorize_type("TINYTEXT", DatabaseType::MySQL),
            TypeCategory::Text
        );
        assert_eq!(
            categorize_type("TINYBLOB", DatabaseType::MySQL),
            TypeCategory::Binary
        );
        assert_eq!(
            categorize_type("FLOAT4", DatabaseType::PostgreSQL),
            TypeCategory::Float
        );
    }

    #[test]
    fn test_categorize_type_decimal() {
        assert_eq!(
            categorize_type("DECIMAL", DatabaseType::MySQL),
            TypeCategory::Decimal
        );
        assert_eq!(
            categorize_type("NUMERIC", DatabaseType::PostgreSQL),
            TypeCategory::Decimal
        );
        assert_eq!(
            categorize_type("numeric", DatabaseType::SQLite),
            TypeCategory::Float
        );
    }

    #[test]
    fn test_categorize_type_temporal() {
        assert_eq!(
            categorize_type("TIMESTAMPTZ", DatabaseType::PostgreSQL),
            TypeCategory::TimestampTz
        );
        assert_eq!(
            categorize_type("TIMESTAMP", DatabaseType::PostgreSQL),
            TypeCategory::Timestamp
        );
        assert_eq!(
            categorize_type("TIMESTAMP", DatabaseType::MySQL),
            TypeCategory::TimestampTz
        );
        assert_eq!(
            categorize_type("DATETIME", DatabaseType::MySQL),
            TypeCategory::Timestamp
        );
        assert_eq!(categorize_type("DATE", DatabaseType::MySQL), TypeCategory::Date);
        // SQLite dates are plain text
        assert_eq!(
            categorize_type("DATETIME", DatabaseType::SQLite),
            TypeCategory::Unknown
        );
    }

    #[test]
    fn test_categorize_type_text_and_json() {
        assert_eq!(
            categorize_type("VARCHAR", DatabaseType::MySQL),
            TypeCategory::Text
        );
        assert_eq!(
            categorize_type("jsonb", DatabaseType::PostgreSQL),
            TypeCategory::Json
        );
        assert_eq!(
            categorize_type("uuid", DatabaseType::PostgreSQL),
            TypeCategory::Uuid
        );
    }

    #[test]
    fn test_encode_binary() {
        assert_eq!(
            encode_binary(b"hello world"),
            JsonValue::String("aGVsbG8gd29ybGQ=".to_string())
        );
        assert_eq!(encode_binary(&[]), JsonValue::String(String::new()));
    }

    #[test]
    fn test_temporal_serializes_like_chrono() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 29);
        assert_eq!(temporal(date), JsonValue::String("2024-02-29".to_string()));
        assert_eq!(temporal(None::<NaiveDate>), JsonValue::Null);
    }

    #[test]
    fn test_decimal_keeps_scale() {
        let d: Decimal = "12.50".parse().unwrap();
        assert_eq!(decimal_value(d), JsonValue::String("12.50".to_string()));
    }

    #[test]
    fn test_text_or_json() {
        assert_eq!(
            text_or_json("{\"a\":1}".to_string(), "JSON"),
            serde_json::json!({"a": 1})
        );
        assert_eq!(
            text_or_json("{\"a\":1}".to_string(), "TEXT"),
            JsonValue::String("{\"a\":1}".to_string())
        );
    }

    #[test]
    fn test_decode_rows_empty() {
        let rows: Vec<SqliteRow> = Vec::new();
        let set = decode_rows(&rows).unwrap();
        assert!(set.columns.is_empty());
        assert!(set.records.is_empty());
    }
}
