//! Statement parameters and result rows.
//!
//! The executor hands statements to any [`Connection`](crate::Connection)
//! implementation, so parameters and rows use a small driver-neutral value
//! type instead of a driver's own encode/decode traits.

use std::fmt;
use uuid::Uuid;

use crate::error::{DbError, DbResult};

/// Column/parameter type, carried by typed NULLs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Bool,
    Int,
    Float,
    Text,
    Uuid,
}

/// A positional statement parameter or a decoded column value.
///
/// NULL carries its type: Postgres needs a parameter type even when the
/// value is absent.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null(SqlType),
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Uuid(Uuid),
}

impl SqlValue {
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null(_))
    }

    /// SQL type name, used in decode errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null(_) => "NULL",
            Self::Bool(_) => "BOOLEAN",
            Self::Int(_) => "BIGINT",
            Self::Float(_) => "DOUBLE PRECISION",
            Self::Text(_) => "TEXT",
            Self::Uuid(_) => "UUID",
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null(_) => f.write_str("NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Uuid(u) => write!(f, "{u}"),
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

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&String> for SqlValue {
    fn from(v: &String) -> Self {
        Self::Text(v.clone())
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

/// Rust types with a fixed SQL type, so `None::<T>` becomes a typed NULL
pub trait HasSqlType {
    const SQL_TYPE: SqlType;
}

impl HasSqlType for bool {
    const SQL_TYPE: SqlType = SqlType::Bool;
}

impl HasSqlType for i32 {
    const SQL_TYPE: SqlType = SqlType::Int;
}

impl HasSqlType for i64 {
    const SQL_TYPE: SqlType = SqlType::Int;
}

impl HasSqlType for f64 {
    const SQL_TYPE: SqlType = SqlType::Float;
}

impl HasSqlType for &str {
    const SQL_TYPE: SqlType = SqlType::Text;
}

impl HasSqlType for String {
    const SQL_TYPE: SqlType = SqlType::Text;
}

impl HasSqlType for &String {
    const SQL_TYPE: SqlType = SqlType::Text;
}

impl HasSqlType for Uuid {
    const SQL_TYPE: SqlType = SqlType::Uuid;
}

impl<T: Into<SqlValue> + HasSqlType> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null(T::SQL_TYPE), Into::into)
    }
}

/// Conversion out of a decoded column value
pub trait FromSqlValue: Sized {
    fn from_sql_value(column: &str, value: &SqlValue) -> DbResult<Self>;
}

fn mismatch(column: &str, expected: &str, found: &SqlValue) -> DbError {
    DbError::decode(
        column,
        format!("expected {expected}, found {}", found.type_name()),
    )
}

impl FromSqlValue for bool {
    fn from_sql_value(column: &str, value: &SqlValue) -> DbResult<Self> {
        match value {
            SqlValue::Bool(b) => Ok(*b),
            other => Err(mismatch(column, "BOOLEAN", other)),
        }
    }
}

impl FromSqlValue for i64 {
    fn from_sql_value(column: &str, value: &SqlValue) -> DbResult<Self> {
        match value {
            SqlValue::Int(n) => Ok(*n),
            other => Err(mismatch(column, "BIGINT", other)),
        }
    }
}

impl FromSqlValue for f64 {
    fn from_sql_value(column: &str, value: &SqlValue) -> DbResult<Self> {
        match value {
            SqlValue::Float(x) => Ok(*x),
            // integer columns widen losslessly enough for coordinates
            SqlValue::Int(n) => Ok(*n as f64),
            other => Err(mismatch(column, "DOUBLE PRECISION", other)),
        }
    }
}

impl FromSqlValue for String {
    fn from_sql_value(column: &str, value: &SqlValue) -> DbResult<Self> {
        match value {
            SqlValue::Text(s) => Ok(s.clone()),
            other => Err(mismatch(column, "TEXT", other)),
        }
    }
}

impl FromSqlValue for Uuid {
    fn from_sql_value(column: &str, value: &SqlValue) -> DbResult<Self> {
        match value {
            SqlValue::Uuid(u) => Ok(*u),
            SqlValue::Text(s) => {
                Uuid::parse_str(s).map_err(|e| DbError::decode(column, e.to_string()))
            }
            other => Err(mismatch(column, "UUID", other)),
        }
    }
}

impl<T: FromSqlValue> FromSqlValue for Option<T> {
    fn from_sql_value(column: &str, value: &SqlValue) -> DbResult<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_sql_value(column, value).map(Some)
        }
    }
}

/// One result row: named columns in select-list order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column (builder style)
    pub fn with(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.push(column, value);
        self
    }

    pub fn push(&mut self, column: impl Into<String>, value: impl Into<SqlValue>) {
        self.columns.push(column.into());
        self.values.push(value.into());
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Raw value of a column
    pub fn value(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    /// Typed value of a column
    pub fn get<T: FromSqlValue>(&self, column: &str) -> DbResult<T> {
        let value = self
            .value(column)
            .ok_or_else(|| DbError::decode(column, "column not found"))?;
        T::from_sql_value(column, value)
    }
}

/// A SQL statement with positional (`$1`, `$2`, ...) parameters.
///
/// `describing` names the entity a single-row read is looking for, so a
/// read that matches nothing becomes `NotFound { resource, id }`.
#[derive(Debug, Clone)]
pub struct Statement<'q> {
    sql: &'q str,
    params: Vec<SqlValue>,
    resource: &'static str,
    key: String,
}

impl<'q> Statement<'q> {
    pub fn new(sql: &'q str) -> Self {
        Self {
            sql,
            params: Vec::new(),
            resource: "row",
            key: String::new(),
        }
    }

    /// Bind the next positional parameter
    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.params.push(value.into());
        self
    }

    /// Name the entity for not-found reporting
    pub fn describing(mut self, resource: &'static str, key: impl fmt::Display) -> Self {
        self.resource = resource;
        self.key = key.to_string();
        self
    }

    pub fn sql(&self) -> &'q str {
        self.sql
    }

    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }

    pub(crate) fn not_found(&self) -> DbError {
        DbError::not_found(self.resource, self.key.clone())
    }
}
