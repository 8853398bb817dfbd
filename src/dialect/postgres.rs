//! PostgreSQL and PostgresPlus (EnterpriseDB Advanced Server)

use super::{DatabaseAdapter, LockStrategy, StateTables, LOCK_ROW_ID};
use crate::changelog::SchemaDialect;
use crate::executor::KeelError;
use std::time::Duration;

/// PostgreSQL dialect
///
/// The holder keeps `SELECT ... FOR UPDATE` on the lock row open for the
/// whole run; waiters block on the same read, bounded by `statement_timeout`.
#[derive(Debug, Clone, Copy)]
pub struct PostgresAdapter {
    vendor: &'static str,
}

impl PostgresAdapter {
    pub fn postgresql() -> Self {
        Self { vendor: "postgresql" }
    }

    /// PostgresPlus speaks the PostgreSQL wire protocol and dialect but
    /// reports its own product name.
    pub fn enterprise_db() -> Self {
        Self { vendor: "edb" }
    }
}

impl Default for PostgresAdapter {
    fn default() -> Self {
        Self::postgresql()
    }
}

impl DatabaseAdapter for PostgresAdapter {
    fn vendor(&self) -> &'static str {
        self.vendor
    }

    fn placeholder(&self, n: usize) -> String {
        format!("${n}")
    }

    fn schema_dialect(&self) -> Option<SchemaDialect> {
        Some(SchemaDialect::Postgres)
    }

    fn lock_strategy(&self) -> LockStrategy {
        LockStrategy::BlockingRead
    }

    fn timestamp_type(&self) -> &'static str {
        "TIMESTAMP WITH TIME ZONE"
    }

    fn lock_acquire_sql(&self, tables: &StateTables) -> String {
        format!(
            "INSERT INTO {} (lock_id, holder_id, acquired_at) VALUES ({LOCK_ROW_ID}, $1, $2) \
             ON CONFLICT (lock_id) DO NOTHING",
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
        Some(format!("SET statement_timeout = '{}ms'", timeout.as_millis().max(1)))
    }

    fn reset_statement_timeout_sql(&self) -> Option<String> {
        Some("RESET statement_timeout".to_string())
    }

    fn is_lock_wait_timeout(&self, error: &KeelError) -> bool {
        let message = error.to_string();
        message.contains("57014") || message.contains("canceling statement due to statement timeout")
    }

    fn set_schema_sql(&self, schema: &str) -> Option<String> {
        Some(format!("SET search_path TO \"{}\"", schema.replace('"', "\"\"")))
    }
}
