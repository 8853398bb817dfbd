//! Lock and history table management
//!
//! Bootstrap is idempotent: it can run on every startup, from any number of
//! processes at once, before the lock exists to serialize them.

use crate::changelog::ChangeSet;
use crate::dialect::{DatabaseAdapter, StateTables};
use crate::executor::{KeelExecutor, SqlValue};
use crate::migration::{AppliedChangeRecord, MigrationError};
use chrono::{DateTime, Utc};

/// Whether `table` can be selected from
pub fn table_exists(executor: &dyn KeelExecutor, table: &str) -> bool {
    executor
        .query_all(&format!("SELECT COUNT(*) FROM {table}"), &[])
        .is_ok()
}

/// Create the lock and history tables if they are missing
///
/// A failed `CREATE` is tolerated when the table turns out to exist anyway,
/// which covers vendors without `IF NOT EXISTS` and two processes racing to
/// create the same table.
///
/// # Errors
///
/// Returns `Database` if a table is missing and cannot be created.
pub fn ensure_state_tables(
    executor: &dyn KeelExecutor,
    adapter: &dyn DatabaseAdapter,
    tables: &StateTables,
) -> Result<(), MigrationError> {
    let statements = [
        (tables.lock_table(), adapter.create_lock_table_sql(tables)),
        (tables.history_table(), adapter.create_history_table_sql(tables)),
    ];
    for (table, ddl) in statements {
        if let Err(e) = executor.execute(&ddl, &[]) {
            if table_exists(executor, table) {
                log::debug!("Table {table} already exists ({e})");
            } else {
                return Err(e.into());
            }
        }
    }
    Ok(())
}

/// Point the session at `schema` so every engine table and change lands there
///
/// # Errors
///
/// Returns `Config` if the vendor has no default schema, or `Database` if
/// switching fails.
pub fn set_schema(
    executor: &dyn KeelExecutor,
    adapter: &dyn DatabaseAdapter,
    schema: &str,
) -> Result<(), MigrationError> {
    let sql = adapter.set_schema_sql(schema).ok_or_else(|| {
        MigrationError::Config(format!(
            "vendor '{}' does not support a default schema",
            adapter.vendor()
        ))
    })?;
    executor.execute(&sql, &[])?;
    log::debug!("Default schema set to {schema}");
    Ok(())
}

/// All history rows, in application order
///
/// # Errors
///
/// Returns `Database` if the table cannot be read or a row cannot be decoded.
pub fn read_history(
    executor: &dyn KeelExecutor,
    adapter: &dyn DatabaseAdapter,
    tables: &StateTables,
) -> Result<Vec<AppliedChangeRecord>, MigrationError> {
    let rows = executor.query_all(&adapter.history_select_sql(tables), &[])?;
    rows.iter()
        .map(|row| AppliedChangeRecord::from_row(row).map_err(MigrationError::from))
        .collect()
}

/// Like [`read_history`], but an absent history table reads as empty
///
/// # Errors
///
/// Returns `Database` if the table exists but cannot be read.
pub fn read_history_if_present(
    executor: &dyn KeelExecutor,
    adapter: &dyn DatabaseAdapter,
    tables: &StateTables,
) -> Result<Vec<AppliedChangeRecord>, MigrationError> {
    match read_history(executor, adapter, tables) {
        Ok(records) => Ok(records),
        Err(_) if !table_exists(executor, tables.history_table()) => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Fields of a history row beyond the changeset itself
#[derive(Debug, Clone)]
pub struct HistoryEntry<'a> {
    pub applied_at: DateTime<Utc>,
    pub order_executed: i64,
    pub execution_time_ms: i64,
    pub deployment_id: &'a str,
}

/// Record `change_set` as successfully applied
///
/// # Errors
///
/// Returns `Database` if the insert fails.
pub fn insert_history(
    executor: &dyn KeelExecutor,
    adapter: &dyn DatabaseAdapter,
    tables: &StateTables,
    change_set: &ChangeSet,
    entry: &HistoryEntry<'_>,
) -> Result<(), MigrationError> {
    let params = [
        SqlValue::from(change_set.id()),
        SqlValue::from(change_set.author()),
        SqlValue::from(change_set.source_location()),
        SqlValue::from(change_set.checksum()),
        SqlValue::from(entry.applied_at),
        SqlValue::from(entry.order_executed),
        SqlValue::from(entry.execution_time_ms),
        SqlValue::from(true),
        SqlValue::from(entry.deployment_id),
    ];
    executor.execute(&adapter.history_insert_sql(tables), &params)?;
    Ok(())
}

/// Remove a history row, used to clear a record that was not marked successful
///
/// # Errors
///
/// Returns `Database` if the delete fails.
pub fn delete_history(
    executor: &dyn KeelExecutor,
    adapter: &dyn DatabaseAdapter,
    tables: &StateTables,
    record: &AppliedChangeRecord,
) -> Result<(), MigrationError> {
    let params = [
        SqlValue::from(record.identity.id.as_str()),
        SqlValue::from(record.identity.author.as_str()),
        SqlValue::from(record.identity.source.as_str()),
    ];
    executor.execute(&adapter.history_delete_sql(tables), &params)?;
    Ok(())
}
