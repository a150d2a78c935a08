//! Query-related data models.
//!
//! This module defines the request type every executor operation takes and
//! the loosely typed result shapes (`Record`, `Table`) rows are decoded into.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{DbError, DbResult};

/// Statement timeout when neither the request nor the executor sets one.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u32 = 30;

pub const MAX_QUERY_TIMEOUT_SECS: u32 = 300;

/// A value bound to a named placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Base64 in JSON form
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
    /// UTC timestamp; only constructed from Rust, strings never deserialize into it
    Timestamp(DateTime<Utc>),
    /// Structured JSON document
    Json(JsonValue),
}

impl QueryParam {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Infer a parameter from command-line text: `null`, booleans, integers,
    /// floats, and anything else as a string.
    pub fn infer(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("null") {
            Self::Null
        } else if raw.eq_ignore_ascii_case("true") {
            Self::Bool(true)
        } else if raw.eq_ignore_ascii_case("false") {
            Self::Bool(false)
        } else if let Ok(v) = raw.parse::<i64>() {
            Self::Int(v)
        } else if let Ok(v) = raw.parse::<f64>() {
            Self::Float(v)
        } else {
            Self::String(raw.to_string())
        }
    }
}

macro_rules! impl_from_for_param {
    ($($ty:ty => $variant:ident $(as $cast:ty)?),+ $(,)?) => {
        $(
            impl From<$ty> for QueryParam {
                fn from(v: $ty) -> Self {
                    QueryParam::$variant(v $(as $cast)?)
                }
            }
        )+
    };
}

impl_from_for_param! {
    bool => Bool,
    i8 => Int as i64,
    i16 => Int as i64,
    i32 => Int as i64,
    i64 => Int,
    u8 => Int as i64,
    u16 => Int as i64,
    u32 => Int as i64,
    f32 => Float as f64,
    f64 => Float,
    String => String,
    Vec<u8> => Bytes,
    DateTime<Utc> => Timestamp,
    JsonValue => Json,
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        QueryParam::String(v.to_string())
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(QueryParam::Null)
    }
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Named parameter values, keyed without the `@`/`:` prefix.
pub type Params = BTreeMap<String, QueryParam>;

/// An immutable statement plus its named parameters and optional timeout.
///
/// Placeholders are written `@name` or `:name` in the statement text and are
/// always bound by the driver, never spliced into the SQL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    pub sql: String,
    #[serde(default)]
    pub params: Params,
    /// Default: 30, max: 300
    #[serde(default)]
    pub timeout_secs: Option<u32>,
}

impl QueryRequest {
    /// Create a new query request with no parameters.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Params::new(),
            timeout_secs: None,
        }
    }

    /// Bind a named parameter. A leading `@` or `:` on the name is ignored.
    pub fn bind(mut self, name: impl AsRef<str>, value: impl Into<QueryParam>) -> Self {
        self.params.insert(normalize_param_name(name.as_ref()), value.into());
        self
    }

    /// Replace the whole parameter map.
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    /// Override the executor's statement timeout for this request.
    pub fn with_timeout(mut self, timeout_secs: u32) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    /// The request's own timeout capped at [`MAX_QUERY_TIMEOUT_SECS`], or
    /// `default`.
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        self.timeout_secs
            .map(|t| Duration::from_secs(t.min(MAX_QUERY_TIMEOUT_SECS) as u64))
            .unwrap_or(default)
    }
}

impl From<&str> for QueryRequest {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

/// Strip an optional `@`/`:` prefix from a parameter name.
pub fn normalize_param_name(name: &str) -> String {
    name.trim_start_matches(['@', ':']).to_string()
}

/// Build a parameter map from `(name, value)` pairs.
pub fn params<I, K, V>(pairs: I) -> Params
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<QueryParam>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (normalize_param_name(k.as_ref()), v.into()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    /// Type name as the backend reports it, e.g. `int8` or `TEXT`
    pub type_name: String,
    pub nullable: bool,
}

impl ColumnMetadata {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            nullable,
        }
    }
}

/// One decoded row: values in column order, sharing the row-set's columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    columns: Arc<[ColumnMetadata]>,
    values: Vec<JsonValue>,
}

impl Record {
    pub fn new(columns: Arc<[ColumnMetadata]>, values: Vec<JsonValue>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[ColumnMetadata] {
        &self.columns
    }

    pub fn values(&self) -> &[JsonValue] {
        &self.values
    }

    /// Value of the named column (first match, case-sensitive).
    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.columns
            .iter()
            .position(|c| c.name == column)
            .and_then(|idx| self.values.get(idx))
    }

    /// Column name to value map, the shape typed rows deserialize from.
    pub fn to_json_map(&self) -> serde_json::Map<String, JsonValue> {
        self.columns
            .iter()
            .zip(self.values.iter())
            .map(|(c, v)| (c.name.clone(), v.clone()))
            .collect()
    }

    /// Map this row onto `T` by column name.
    pub fn deserialize<T: DeserializeOwned>(&self) -> DbResult<T> {
        Ok(serde_json::from_value(JsonValue::Object(self.to_json_map()))?)
    }

    /// Map the first column onto `T`.
    pub fn scalar<T: DeserializeOwned>(&self) -> DbResult<T> {
        let value = self.values.first().cloned().unwrap_or(JsonValue::Null);
        Ok(serde_json::from_value(value)?)
    }

    /// Whether the first column is SQL NULL (or there are no columns).
    pub fn first_is_null(&self) -> bool {
        self.values.first().is_none_or(JsonValue::is_null)
    }
}

/// The rows produced by one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<ColumnMetadata>,
    pub records: Vec<Record>,
}

impl RowSet {
    /// Map every row onto `T`.
    pub fn deserialize_all<T: DeserializeOwned>(&self) -> DbResult<Vec<T>> {
        self.records.iter().map(Record::deserialize).collect()
    }

    /// The only row, if any. More than one row is a cardinality error.
    pub fn single<T: DeserializeOwned>(&self) -> DbResult<Option<T>> {
        match self.records.as_slice() {
            [] => Ok(None),
            [record] => record.deserialize().map(Some),
            rows => Err(DbError::cardinality(rows.len())),
        }
    }

    /// The first row, if any; extra rows are ignored.
    pub fn first<T: DeserializeOwned>(&self) -> DbResult<Option<T>> {
        self.records.first().map(Record::deserialize).transpose()
    }

    /// First column of the first row. An empty row-set converts like NULL.
    pub fn scalar<T: DeserializeOwned>(&self) -> DbResult<T> {
        match self.records.first() {
            Some(record) => record.scalar(),
            None => Ok(serde_json::from_value(JsonValue::Null)?),
        }
    }

    /// Like [`scalar`](Self::scalar), but NULL and "no row" are `None`
    /// instead of a conversion failure.
    pub fn scalar_or_default<T: DeserializeOwned>(&self) -> DbResult<Option<T>> {
        match self.records.first() {
            Some(record) if !record.first_is_null() => record.scalar().map(Some),
            _ => Ok(None),
        }
    }

    /// Loosely typed grid view of this row-set.
    pub fn into_table(self) -> Table {
        Table {
            columns: self.columns,
            rows: self.records.into_iter().map(|r| r.values).collect(),
        }
    }
}

/// Loosely typed row/column grid for dynamic consumption.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<ColumnMetadata>,
    pub rows: Vec<Vec<JsonValue>>,
}

impl Table {
    /// Get the number of rows.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Check if the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of the named column.
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == column)
    }

    /// Cell at `row` in the named column.
    pub fn get(&self, row: usize, column: &str) -> Option<&JsonValue> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }
}
