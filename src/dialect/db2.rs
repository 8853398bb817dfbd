//! IBM DB2
//!
//! No schema builder is available for DB2, so only raw SQL changes apply.
//! DB2 has no insert-if-absent form; a losing lock insert fails with
//! SQLSTATE 23505 and is treated as contention.

use super::{DatabaseAdapter, StateTables, LOCK_ROW_ID};
use crate::changelog::SchemaDialect;
use crate::executor::KeelError;

#[derive(Debug, Clone, Copy, Default)]
pub struct Db2Adapter;

impl DatabaseAdapter for Db2Adapter {
    fn vendor(&self) -> &'static str {
        "db2"
    }

    fn placeholder(&self, _n: usize) -> String {
        "?".to_string()
    }

    fn schema_dialect(&self) -> Option<SchemaDialect> {
        None
    }

    fn timestamp_type(&self) -> &'static str {
        "TIMESTAMP"
    }

    fn boolean_type(&self) -> &'static str {
        "SMALLINT"
    }

    // No IF NOT EXISTS on older DB2 releases; bootstrap probes for the table when this fails.
    fn create_lock_table_sql(&self, tables: &StateTables) -> String {
        format!(
            "CREATE TABLE {} (\
             lock_id INTEGER NOT NULL PRIMARY KEY, \
             holder_id VARCHAR(64) NOT NULL, \
             acquired_at TIMESTAMP NOT NULL)",
            tables.lock_table()
        )
    }

    fn create_history_table_sql(&self, tables: &StateTables) -> String {
        format!(
            "CREATE TABLE {} (\
             id VARCHAR(255) NOT NULL, \
             author VARCHAR(255) NOT NULL, \
             source_location VARCHAR(255) NOT NULL, \
             checksum VARCHAR(128) NOT NULL, \
             applied_at TIMESTAMP NOT NULL, \
             order_executed BIGINT NOT NULL, \
             execution_time_ms BIGINT, \
             success SMALLINT NOT NULL, \
             deployment_id VARCHAR(64), \
             PRIMARY KEY (id, author, source_location))",
            tables.history_table()
        )
    }

    fn lock_acquire_sql(&self, tables: &StateTables) -> String {
        format!(
            "INSERT INTO {} (lock_id, holder_id, acquired_at) VALUES ({LOCK_ROW_ID}, ?, ?)",
            tables.lock_table()
        )
    }

    fn is_duplicate_key_error(&self, error: &KeelError) -> bool {
        let message = error.to_string();
        message.contains("23505") || message.contains("SQLCODE=-803")
    }

    fn set_schema_sql(&self, schema: &str) -> Option<String> {
        Some(format!("SET SCHEMA \"{}\"", schema.replace('"', "\"\"")))
    }
}
