//! SQL values and query results
//!
//! `SqlValue` is the cell type exchanged with the driver. Rows share their
//! column list so lookups by name do not copy column names per row.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A single SQL cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    /// SQL NULL
    Null,
    /// Signed integer
    Int(i64),
    /// Unsigned integer (e.g. `BIGINT UNSIGNED`)
    UInt(u64),
    /// Floating point
    Float(f64),
    /// Character data
    Text(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// `DATETIME` / `TIMESTAMP` without zone
    DateTime(NaiveDateTime),
}

impl SqlValue {
    /// True for NULL
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Interpret as unsigned integer
    ///
    /// Text is parsed because drivers commonly return `DECIMAL`/`BIGINT`
    /// columns as strings.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            SqlValue::UInt(v) => Some(*v),
            SqlValue::Int(v) => u64::try_from(*v).ok(),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Interpret as signed integer
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            SqlValue::UInt(v) => i64::try_from(*v).ok(),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Borrow as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Interpret as naive datetime
    ///
    /// Accepts `DATETIME` values and text in `YYYY-MM-DD HH:MM:SS[.ffffff]`.
    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            SqlValue::DateTime(dt) => Some(*dt),
            SqlValue::Text(s) => NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").ok(),
            _ => None,
        }
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<u64> for SqlValue {
    fn from(v: u64) -> Self {
        SqlValue::UInt(v)
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

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::DateTime(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

/// One result row
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

impl Row {
    /// Create a row; `values` must line up with `columns`
    pub fn new(columns: Arc<[String]>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    /// Value by column position
    pub fn get_index(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    /// Value by column name
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    /// All values in column order
    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    /// Column names
    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

/// Outcome of a statement or query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Result rows (empty for statements)
    pub rows: Vec<Row>,
    /// Rows affected by a DML statement
    pub affected_rows: u64,
    /// Auto-increment id generated by an INSERT
    pub last_insert_id: Option<u64>,
}

impl QueryResult {
    /// Result of a statement that produced no rows
    pub fn affected(affected_rows: u64) -> Self {
        Self {
            rows: Vec::new(),
            affected_rows,
            last_insert_id: None,
        }
    }

    /// Build a row set from column names and raw values
    pub fn with_rows<C, R>(columns: C, rows: R) -> Self
    where
        C: IntoIterator,
        C::Item: Into<String>,
        R: IntoIterator<Item = Vec<SqlValue>>,
    {
        let columns: Arc<[String]> = columns.into_iter().map(Into::into).collect();
        Self {
            rows: rows
                .into_iter()
                .map(|values| Row::new(Arc::clone(&columns), values))
                .collect(),
            affected_rows: 0,
            last_insert_id: None,
        }
    }
}
