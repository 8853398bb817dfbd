//! SQLite executor over `rusqlite`
//!
//! Each `SqliteExecutor` owns one connection. Several executors may open the
//! same database file; the lock table's primary key then arbitrates between
//! them exactly as it does between processes.

use crate::executor::{KeelError, KeelExecutor, SqlRow, SqlValue};
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags, ToSql};
use std::path::Path;
use std::time::Duration;

/// Default time SQLite waits on a busy database file before failing a statement
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SqliteExecutor {
    conn: Connection,
}

impl SqliteExecutor {
    /// Open (creating if needed) the database file at `path`
    ///
    /// # Errors
    ///
    /// Returns `KeelError::Sqlite` if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KeelError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        Ok(Self { conn })
    }

    /// Private in-memory database, mostly useful for tests
    ///
    /// # Errors
    ///
    /// Returns `KeelError::Sqlite` if SQLite cannot allocate the database.
    pub fn open_in_memory() -> Result<Self, KeelError> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

struct Param<'a>(&'a SqlValue);

impl ToSql for Param<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self.0 {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Bool(b) => ToSqlOutput::Owned(Value::Integer(i64::from(*b))),
            SqlValue::Int(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Timestamp(ts) => ToSqlOutput::Owned(Value::Text(ts.to_rfc3339())),
        })
    }
}

fn decode_value(value: ValueRef<'_>) -> Result<SqlValue, KeelError> {
    Ok(match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Int(i),
        ValueRef::Real(f) => SqlValue::Text(f.to_string()),
        ValueRef::Text(bytes) => SqlValue::Text(
            String::from_utf8(bytes.to_vec()).map_err(|e| KeelError::Decode(format!("invalid UTF-8 in text column: {e}")))?,
        ),
        ValueRef::Blob(_) => return Err(KeelError::Decode("blob columns are not supported".to_string())),
    })
}

impl KeelExecutor for SqliteExecutor {
    fn execute(&self, query: &str, params: &[SqlValue]) -> Result<u64, KeelError> {
        if params.is_empty() && query.trim().trim_end_matches(';').contains(';') {
            // Multi-statement change bodies are only accepted by the batch API.
            self.conn.execute_batch(query)?;
            return Ok(0);
        }
        let affected = self
            .conn
            .execute(query, params_from_iter(params.iter().map(Param)))?;
        Ok(affected as u64)
    }

    fn query_all(&self, query: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, KeelError> {
        let mut stmt = self.conn.prepare(query)?;
        let column_count = stmt.column_count();
        let mut rows = stmt.query(params_from_iter(params.iter().map(Param)))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(column_count);
            for idx in 0..column_count {
                values.push(decode_value(row.get_ref(idx)?)?);
            }
            out.push(SqlRow::new(values));
        }
        Ok(out)
    }

    fn product_name(&self) -> Result<String, KeelError> {
        let version: String = self
            .conn
            .query_row("SELECT sqlite_version()", [], |row| row.get(0))?;
        Ok(format!("SQLite {version}"))
    }
}
