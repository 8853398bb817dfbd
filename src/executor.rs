//! Executor Module
//!
//! Provides the `KeelExecutor` trait, the engine-neutral seam every migration
//! component talks to, and the PostgreSQL executor over `may_postgres`.
//!
//! Values cross the seam as [`SqlValue`] so the lock coordinator and the
//! history table never depend on a specific driver's row or parameter types.

use chrono::{DateTime, NaiveDateTime, Utc};
use may_postgres::types::{ToSql, Type};
use may_postgres::{Client, Error as PostgresError, Row};
use std::fmt;
use std::time::Instant;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// `KeelExecutor` error type
#[derive(Debug)]
pub enum KeelError {
    /// `PostgreSQL` error from `may_postgres`
    Postgres(PostgresError),
    /// SQLite error from `rusqlite`
    #[cfg(feature = "sqlite")]
    Sqlite(rusqlite::Error),
    /// Query execution error
    Query(String),
    /// Row decoding/conversion error
    Decode(String),
    /// Other execution errors
    Other(String),
}

impl fmt::Display for KeelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeelError::Postgres(e) => write!(f, "PostgreSQL error: {e}"),
            #[cfg(feature = "sqlite")]
            KeelError::Sqlite(e) => write!(f, "SQLite error: {e}"),
            KeelError::Query(s) => write!(f, "Query error: {s}"),
            KeelError::Decode(s) => write!(f, "Decode error: {s}"),
            KeelError::Other(s) => write!(f, "Execution error: {s}"),
        }
    }
}

impl std::error::Error for KeelError {}

impl From<PostgresError> for KeelError {
    fn from(err: PostgresError) -> Self {
        KeelError::Postgres(err)
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for KeelError {
    fn from(err: rusqlite::Error) -> Self {
        KeelError::Sqlite(err)
    }
}

/// A parameter or column value exchanged with an executor
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(value)
    }
}

/// Timestamp layouts accepted when a driver hands back text instead of a native timestamp
const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
];

/// One result row, columns in select-list order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlRow {
    values: Vec<SqlValue>,
}

impl SqlRow {
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn value(&self, idx: usize) -> Result<&SqlValue, KeelError> {
        self.values
            .get(idx)
            .ok_or_else(|| KeelError::Decode(format!("column index {idx} out of range ({} columns)", self.values.len())))
    }

    pub fn get_text(&self, idx: usize) -> Result<String, KeelError> {
        match self.value(idx)? {
            SqlValue::Text(s) => Ok(s.clone()),
            SqlValue::Int(i) => Ok(i.to_string()),
            other => Err(KeelError::Decode(format!("column {idx}: expected text, got {other:?}"))),
        }
    }

    pub fn get_optional_text(&self, idx: usize) -> Result<Option<String>, KeelError> {
        match self.value(idx)? {
            SqlValue::Null => Ok(None),
            _ => self.get_text(idx).map(Some),
        }
    }

    pub fn get_i64(&self, idx: usize) -> Result<i64, KeelError> {
        match self.value(idx)? {
            SqlValue::Int(i) => Ok(*i),
            SqlValue::Text(s) => s
                .trim()
                .parse::<i64>()
                .map_err(|e| KeelError::Decode(format!("column {idx}: '{s}' is not an integer: {e}"))),
            other => Err(KeelError::Decode(format!("column {idx}: expected integer, got {other:?}"))),
        }
    }

    pub fn get_optional_i64(&self, idx: usize) -> Result<Option<i64>, KeelError> {
        match self.value(idx)? {
            SqlValue::Null => Ok(None),
            _ => self.get_i64(idx).map(Some),
        }
    }

    /// Vendors without a boolean type store flags as 0/1 integers or 'Y'/'N' characters.
    pub fn get_bool(&self, idx: usize) -> Result<bool, KeelError> {
        match self.value(idx)? {
            SqlValue::Bool(b) => Ok(*b),
            SqlValue::Int(i) => Ok(*i != 0),
            SqlValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "t" | "true" | "y" | "1" => Ok(true),
                "f" | "false" | "n" | "0" => Ok(false),
                _ => Err(KeelError::Decode(format!("column {idx}: '{s}' is not a boolean"))),
            },
            other => Err(KeelError::Decode(format!("column {idx}: expected boolean, got {other:?}"))),
        }
    }

    pub fn get_timestamp(&self, idx: usize) -> Result<DateTime<Utc>, KeelError> {
        match self.value(idx)? {
            SqlValue::Timestamp(ts) => Ok(*ts),
            SqlValue::Text(s) => parse_timestamp(s),
            other => Err(KeelError::Decode(format!("column {idx}: expected timestamp, got {other:?}"))),
        }
    }
}

/// Parse a textual timestamp, trying RFC 3339 first and then the naive layouts
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, KeelError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| KeelError::Decode(format!("Failed to parse timestamp '{raw}': unrecognized format")))
}

/// Trait for executing database operations
///
/// The migration engine only ever needs three things from a connection:
/// run a statement, read rows back, and say which database product it is.
/// Positional parameters use whatever placeholder syntax the connection's
/// vendor expects; the `DatabaseAdapter` produces matching SQL.
pub trait KeelExecutor {
    /// Execute a SQL statement and return the number of rows affected
    ///
    /// # Errors
    ///
    /// Returns `KeelError` if the statement fails.
    fn execute(&self, query: &str, params: &[SqlValue]) -> Result<u64, KeelError>;

    /// Execute a query and return all rows
    ///
    /// # Errors
    ///
    /// Returns `KeelError` if the query fails or a column cannot be decoded.
    fn query_all(&self, query: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, KeelError>;

    /// Execute a query and return at most one row
    ///
    /// # Errors
    ///
    /// Returns `KeelError` if the query fails.
    fn query_opt(&self, query: &str, params: &[SqlValue]) -> Result<Option<SqlRow>, KeelError> {
        Ok(self.query_all(query, params)?.into_iter().next())
    }

    /// The product name the live connection reports, e.g. `PostgreSQL 16.2 ...`
    ///
    /// # Errors
    ///
    /// Returns `KeelError` if the server cannot be asked.
    fn product_name(&self) -> Result<String, KeelError>;
}

impl<E: KeelExecutor + ?Sized> KeelExecutor for &E {
    fn execute(&self, query: &str, params: &[SqlValue]) -> Result<u64, KeelError> {
        (**self).execute(query, params)
    }

    fn query_all(&self, query: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, KeelError> {
        (**self).query_all(query, params)
    }

    fn product_name(&self) -> Result<String, KeelError> {
        (**self).product_name()
    }
}

/// `PostgreSQL` executor backed by a `may_postgres::Client`
///
/// `may_postgres` is coroutine-aware: calls block the current coroutine, not
/// the worker thread, so a migration can run inside `may::go!` at startup.
pub struct MayPostgresExecutor {
    client: Client,
}

impl MayPostgresExecutor {
    /// Create a new executor from a `may_postgres::Client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Get a reference to the underlying client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Consume the executor and return the underlying client
    pub fn into_client(self) -> Client {
        self.client
    }
}

fn to_postgres_params(params: &[SqlValue]) -> Vec<Box<dyn ToSql>> {
    params
        .iter()
        .map(|value| -> Box<dyn ToSql> {
            match value {
                SqlValue::Null => Box::new(Option::<String>::None),
                SqlValue::Bool(b) => Box::new(*b),
                SqlValue::Int(i) => Box::new(*i),
                SqlValue::Text(s) => Box::new(s.clone()),
                SqlValue::Timestamp(ts) => Box::new(*ts),
            }
        })
        .collect()
}

fn decode_postgres_row(row: &Row) -> Result<SqlRow, KeelError> {
    let mut values = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let ty = column.type_();
        let value = if *ty == Type::BOOL {
            row.try_get::<_, Option<bool>>(idx)?.map(SqlValue::Bool)
        } else if *ty == Type::INT8 {
            row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::Int)
        } else if *ty == Type::INT4 {
            row.try_get::<_, Option<i32>>(idx)?.map(|v| SqlValue::Int(i64::from(v)))
        } else if *ty == Type::INT2 {
            row.try_get::<_, Option<i16>>(idx)?.map(|v| SqlValue::Int(i64::from(v)))
        } else if *ty == Type::TIMESTAMPTZ {
            row.try_get::<_, Option<DateTime<Utc>>>(idx)?.map(SqlValue::Timestamp)
        } else if *ty == Type::TIMESTAMP {
            row.try_get::<_, Option<NaiveDateTime>>(idx)?
                .map(|naive| SqlValue::Timestamp(naive.and_utc()))
        } else if *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::BPCHAR || *ty == Type::NAME {
            row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text)
        } else {
            return Err(KeelError::Decode(format!(
                "column '{}' has unsupported type {}",
                column.name(),
                ty
            )));
        };
        values.push(value.unwrap_or(SqlValue::Null));
    }
    Ok(SqlRow::new(values))
}

impl KeelExecutor for MayPostgresExecutor {
    fn execute(&self, query: &str, params: &[SqlValue]) -> Result<u64, KeelError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_statement_span(query).entered();

        let start = Instant::now();
        let boxed = to_postgres_params(params);
        let refs: Vec<&dyn ToSql> = boxed.iter().map(|b| b.as_ref()).collect();
        let result = self.client.execute(query, &refs).map_err(KeelError::Postgres);
        log::trace!("execute took {:?}: {}", start.elapsed(), query.trim());
        result
    }

    fn query_all(&self, query: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, KeelError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_statement_span(query).entered();

        let start = Instant::now();
        let boxed = to_postgres_params(params);
        let refs: Vec<&dyn ToSql> = boxed.iter().map(|b| b.as_ref()).collect();
        let rows = self.client.query(query, &refs)?;
        log::trace!("query took {:?}: {}", start.elapsed(), query.trim());
        rows.iter().map(decode_postgres_row).collect()
    }

    fn product_name(&self) -> Result<String, KeelError> {
        let rows = self.query_all("SELECT version()", &[])?;
        rows.first()
            .ok_or_else(|| KeelError::Query("SELECT version() returned no rows".to_string()))?
            .get_text(0)
    }
}
