//! SQLite

use super::{DatabaseAdapter, StateTables, LOCK_ROW_ID};
use crate::changelog::SchemaDialect;

/// SQLite dialect
///
/// SQLite has no row locks, so waiters poll; the primary key on the lock
/// table still makes the insert atomic across connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteAdapter;

impl DatabaseAdapter for SqliteAdapter {
    fn vendor(&self) -> &'static str {
        "sqlite"
    }

    fn placeholder(&self, n: usize) -> String {
        format!("?{n}")
    }

    fn schema_dialect(&self) -> Option<SchemaDialect> {
        Some(SchemaDialect::Sqlite)
    }

    fn timestamp_type(&self) -> &'static str {
        "TEXT"
    }

    fn boolean_type(&self) -> &'static str {
        "INTEGER"
    }

    fn lock_acquire_sql(&self, tables: &StateTables) -> String {
        format!(
            "INSERT OR IGNORE INTO {} (lock_id, holder_id, acquired_at) VALUES ({LOCK_ROW_ID}, ?1, ?2)",
            tables.lock_table()
        )
    }
}
