//! MySQL and MariaDB

use super::{DatabaseAdapter, LockStrategy, StateTables, LOCK_ROW_ID};
use crate::changelog::SchemaDialect;
use crate::executor::KeelError;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct MySqlAdapter {
    vendor: &'static str,
}

impl MySqlAdapter {
    pub fn mysql() -> Self {
        Self { vendor: "mysql" }
    }

    pub fn mariadb() -> Self {
        Self { vendor: "mariadb" }
    }
}

impl DatabaseAdapter for MySqlAdapter {
    fn vendor(&self) -> &'static str {
        self.vendor
    }

    fn placeholder(&self, _n: usize) -> String {
        "?".to_string()
    }

    fn schema_dialect(&self) -> Option<SchemaDialect> {
        Some(SchemaDialect::MySql)
    }

    fn lock_strategy(&self) -> LockStrategy {
        LockStrategy::BlockingRead
    }

    fn timestamp_type(&self) -> &'static str {
        "DATETIME(6)"
    }

    fn lock_acquire_sql(&self, tables: &StateTables) -> String {
        format!(
            "INSERT IGNORE INTO {} (lock_id, holder_id, acquired_at) VALUES ({LOCK_ROW_ID}, ?, ?)",
            tables.lock_table()
        )
    }

    fn lock_wait_sql(&self, tables: &StateTables) -> Option<String> {
        Some(format!(
            "SELECT holder_id FROM {} WHERE lock_id = {LOCK_ROW_ID} FOR UPDATE",
            tables.lock_table()
        ))
    }

    fn statement_timeout_sql(&self, timeout: Duration) -> Option<String> {
        // Row-lock waits are governed by innodb_lock_wait_timeout (whole seconds).
        let seconds = timeout.as_secs().max(1);
        Some(format!("SET SESSION innodb_lock_wait_timeout = {seconds}"))
    }

    fn reset_statement_timeout_sql(&self) -> Option<String> {
        Some("SET SESSION innodb_lock_wait_timeout = DEFAULT".to_string())
    }

    /// `INSERT IGNORE` against a row the holder has locked waits too, so
    /// this can surface from the acquire attempt as well as from the wait.
    fn is_lock_wait_timeout(&self, error: &KeelError) -> bool {
        let message = error.to_string();
        message.contains("1205") || message.contains("Lock wait timeout exceeded")
    }

    fn set_schema_sql(&self, schema: &str) -> Option<String> {
        Some(format!("USE `{}`", schema.replace('`', "``")))
    }
}
