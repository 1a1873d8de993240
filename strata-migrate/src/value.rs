//! Bound parameters and result rows exchanged with the database layer.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MigrateResult, MigrationError};

/// A value bound to a statement parameter or read from a result column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Integer value (narrowed by the driver to the parameter's width).
    Int(i64),
    /// Text value.
    Text(String),
    /// Timestamp value.
    Timestamp(DateTime<Utc>),
}

impl SqlValue {
    /// Check if the value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Text(s) => write!(f, "{}", s),
            Self::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// A single result row, addressed by column position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    values: Vec<SqlValue>,
}

impl Row {
    /// Create a row from its column values.
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a column value.
    pub fn get(&self, idx: usize) -> MigrateResult<&SqlValue> {
        self.values
            .get(idx)
            .ok_or_else(|| MigrationError::database(format!("column {} out of range", idx)))
    }

    /// Get a boolean column.
    pub fn get_bool(&self, idx: usize) -> MigrateResult<bool> {
        match self.get(idx)? {
            SqlValue::Bool(b) => Ok(*b),
            other => Err(type_error(idx, "bool", other)),
        }
    }

    /// Get an integer column.
    pub fn get_i64(&self, idx: usize) -> MigrateResult<i64> {
        match self.get(idx)? {
            SqlValue::Int(i) => Ok(*i),
            other => Err(type_error(idx, "integer", other)),
        }
    }

    /// Get a nullable text column.
    pub fn get_opt_str(&self, idx: usize) -> MigrateResult<Option<&str>> {
        match self.get(idx)? {
            SqlValue::Null => Ok(None),
            SqlValue::Text(s) => Ok(Some(s.as_str())),
            other => Err(type_error(idx, "text", other)),
        }
    }

    /// Get a text column.
    pub fn get_str(&self, idx: usize) -> MigrateResult<&str> {
        self.get_opt_str(idx)?
            .ok_or_else(|| MigrationError::database(format!("column {} is NULL", idx)))
    }

    /// Get a timestamp column.
    pub fn get_timestamp(&self, idx: usize) -> MigrateResult<DateTime<Utc>> {
        match self.get(idx)? {
            SqlValue::Timestamp(ts) => Ok(*ts),
            other => Err(type_error(idx, "timestamp", other)),
        }
    }
}

fn type_error(idx: usize, expected: &str, got: &SqlValue) -> MigrationError {
    MigrationError::database(format!(
        "column {} has unexpected type: expected {}, got {:?}",
        idx, expected, got
    ))
}
