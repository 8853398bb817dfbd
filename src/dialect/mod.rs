//! Vendor dialects
//!
//! A [`DatabaseAdapter`] supplies every piece of vendor-specific SQL the
//! engine issues: bootstrap DDL for the lock and history tables, the
//! insert-if-absent lock statement, the wait primitive, and translation of
//! changesets into executable statements. Adapters are looked up in an
//! [`AdapterRegistry`] by the vendor id derived from the live connection.

mod db2;
mod mysql;
mod postgres;
mod sqlite;

pub use db2::Db2Adapter;
pub use mysql::MySqlAdapter;
pub use postgres::PostgresAdapter;
pub use sqlite::SqliteAdapter;

use crate::changelog::{ChangeSet, SchemaDialect};
use crate::executor::{KeelError, KeelExecutor};
use crate::migration::MigrationError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_LOCK_TABLE: &str = "keel_migration_lock";
pub const DEFAULT_HISTORY_TABLE: &str = "keel_changelog";

/// The lock table holds at most one row, always under this key.
pub const LOCK_ROW_ID: i64 = 1;

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("identifier pattern is a valid regex"));

/// Names of the engine's own tables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTables {
    lock_table: String,
    history_table: String,
}

impl StateTables {
    /// # Errors
    ///
    /// Returns `MigrationError::Config` unless both names are plain SQL identifiers.
    pub fn new(lock_table: impl Into<String>, history_table: impl Into<String>) -> Result<Self, MigrationError> {
        let lock_table = lock_table.into();
        let history_table = history_table.into();
        for name in [&lock_table, &history_table] {
            if !IDENTIFIER.is_match(name) {
                return Err(MigrationError::Config(format!(
                    "'{name}' is not a valid table name (letters, digits and '_' only)"
                )));
            }
        }
        if lock_table.eq_ignore_ascii_case(&history_table) {
            return Err(MigrationError::Config(
                "lock table and history table must be different tables".to_string(),
            ));
        }
        Ok(Self {
            lock_table,
            history_table,
        })
    }

    pub fn lock_table(&self) -> &str {
        &self.lock_table
    }

    pub fn history_table(&self) -> &str {
        &self.history_table
    }
}

impl Default for StateTables {
    fn default() -> Self {
        Self {
            lock_table: DEFAULT_LOCK_TABLE.to_string(),
            history_table: DEFAULT_HISTORY_TABLE.to_string(),
        }
    }
}

/// How a waiter waits for the lock row to disappear
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStrategy {
    /// Re-try the insert every poll interval
    Poll,
    /// Block on a row-locking read (`SELECT ... FOR UPDATE`) between attempts
    ///
    /// The holder keeps that row lock for the whole run on a dedicated
    /// connection, so waiters wake as soon as it commits the row's removal.
    BlockingRead,
}

/// Vendor capability consumed by the lock coordinator and the runner
///
/// Statements returned here use the vendor's positional placeholder syntax.
/// Parameter order is documented on each method.
pub trait DatabaseAdapter: Send + Sync {
    /// Vendor id this adapter is registered under (`postgresql`, `mysql`, ...)
    fn vendor(&self) -> &'static str;

    /// Placeholder for the `n`-th (1-based) positional parameter
    fn placeholder(&self, n: usize) -> String;

    /// Builder used for structural changes, `None` when only raw SQL is supported
    fn schema_dialect(&self) -> Option<SchemaDialect>;

    fn lock_strategy(&self) -> LockStrategy {
        LockStrategy::Poll
    }

    fn timestamp_type(&self) -> &'static str;

    fn boolean_type(&self) -> &'static str {
        "BOOLEAN"
    }

    fn create_lock_table_sql(&self, tables: &StateTables) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             lock_id INTEGER NOT NULL PRIMARY KEY, \
             holder_id VARCHAR(64) NOT NULL, \
             acquired_at {} NOT NULL)",
            tables.lock_table(),
            self.timestamp_type()
        )
    }

    fn create_history_table_sql(&self, tables: &StateTables) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             id VARCHAR(255) NOT NULL, \
             author VARCHAR(255) NOT NULL, \
             source_location VARCHAR(255) NOT NULL, \
             checksum VARCHAR(128) NOT NULL, \
             applied_at {} NOT NULL, \
             order_executed BIGINT NOT NULL, \
             execution_time_ms BIGINT, \
             success {} NOT NULL, \
             deployment_id VARCHAR(64), \
             PRIMARY KEY (id, author, source_location))",
            tables.history_table(),
            self.timestamp_type(),
            self.boolean_type()
        )
    }

    /// Atomic insert-if-absent of the lock row; params: `holder_id`, `acquired_at`
    ///
    /// Must affect one row when the lock was free and zero rows (or fail with
    /// a duplicate-key error, see [`Self::is_duplicate_key_error`]) otherwise.
    fn lock_acquire_sql(&self, tables: &StateTables) -> String;

    /// Params: `holder_id`; also used to reclaim a stale row by its holder
    fn lock_release_sql(&self, tables: &StateTables) -> String {
        format!(
            "DELETE FROM {} WHERE lock_id = {LOCK_ROW_ID} AND holder_id = {}",
            tables.lock_table(),
            self.placeholder(1)
        )
    }

    /// Unconditional removal of the lock row, for operator recovery
    fn lock_force_release_sql(&self, tables: &StateTables) -> String {
        format!("DELETE FROM {} WHERE lock_id = {LOCK_ROW_ID}", tables.lock_table())
    }

    /// Columns: `holder_id`, `acquired_at`
    fn lock_query_sql(&self, tables: &StateTables) -> String {
        format!(
            "SELECT holder_id, acquired_at FROM {} WHERE lock_id = {LOCK_ROW_ID}",
            tables.lock_table()
        )
    }

    /// Row-locking read waiters block on; only used with [`LockStrategy::BlockingRead`]
    fn lock_wait_sql(&self, _tables: &StateTables) -> Option<String> {
        None
    }

    /// Session setting bounding each statement issued while waiting
    fn statement_timeout_sql(&self, _timeout: Duration) -> Option<String> {
        None
    }

    fn reset_statement_timeout_sql(&self) -> Option<String> {
        None
    }

    /// Opens the transaction the lock holder keeps its row lock in
    fn begin_transaction_sql(&self) -> &'static str {
        "BEGIN"
    }

    fn commit_transaction_sql(&self) -> &'static str {
        "COMMIT"
    }

    fn rollback_transaction_sql(&self) -> &'static str {
        "ROLLBACK"
    }

    /// Whether a statement was cut short by the bound from [`Self::statement_timeout_sql`]
    fn is_lock_wait_timeout(&self, _error: &KeelError) -> bool {
        false
    }

    /// Columns: `id`, `author`, `source_location`, `checksum`, `applied_at`,
    /// `order_executed`, `execution_time_ms`, `success`, `deployment_id`
    fn history_select_sql(&self, tables: &StateTables) -> String {
        format!(
            "SELECT id, author, source_location, checksum, applied_at, order_executed, \
             execution_time_ms, success, deployment_id FROM {} ORDER BY order_executed",
            tables.history_table()
        )
    }

    /// Params in the same order as [`Self::history_select_sql`]'s columns
    fn history_insert_sql(&self, tables: &StateTables) -> String {
        let placeholders: Vec<String> = (1..=9).map(|n| self.placeholder(n)).collect();
        format!(
            "INSERT INTO {} (id, author, source_location, checksum, applied_at, order_executed, \
             execution_time_ms, success, deployment_id) VALUES ({})",
            tables.history_table(),
            placeholders.join(", ")
        )
    }

    /// Params: `id`, `author`, `source_location`
    fn history_delete_sql(&self, tables: &StateTables) -> String {
        format!(
            "DELETE FROM {} WHERE id = {} AND author = {} AND source_location = {}",
            tables.history_table(),
            self.placeholder(1),
            self.placeholder(2),
            self.placeholder(3)
        )
    }

    /// Switch the session's default schema, `None` if the vendor has no such notion
    fn set_schema_sql(&self, _schema: &str) -> Option<String> {
        None
    }

    /// Translate a changeset into the statements to execute, in order
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::UnsupportedChange` for structural changes on
    /// vendors without a schema builder.
    fn apply_change_set_sql(&self, change_set: &ChangeSet) -> Result<Vec<String>, MigrationError> {
        if let Some(dialect) = self.schema_dialect() {
            return Ok(change_set.render(dialect));
        }
        let mut statements = Vec::new();
        for change in change_set.changes() {
            if !change.is_raw_sql() {
                return Err(MigrationError::UnsupportedChange {
                    identity: change_set.identity().clone(),
                    vendor: self.vendor().to_string(),
                    kind: change.kind().to_string(),
                });
            }
            statements.extend(change.render(SchemaDialect::Postgres));
        }
        Ok(statements)
    }

    /// Whether a failed lock insert means "someone else holds it"
    fn is_duplicate_key_error(&self, _error: &KeelError) -> bool {
        false
    }
}

/// Map a reported product name onto a registry vendor id
pub fn vendor_id_from_product(product_name: &str) -> String {
    let lowered = product_name.to_ascii_lowercase();
    let known = [
        ("enterprisedb", "edb"),
        ("postgres", "postgresql"),
        ("mariadb", "mariadb"),
        ("mysql", "mysql"),
        ("sqlite", "sqlite"),
        ("db2", "db2"),
    ];
    known
        .iter()
        .find(|(needle, _)| lowered.contains(needle))
        .map(|(_, id)| (*id).to_string())
        .unwrap_or_else(|| lowered.split_whitespace().next().unwrap_or_default().to_string())
}

/// Capability table from vendor id to adapter
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn DatabaseAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in vendor
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PostgresAdapter::postgresql()));
        registry.register(Arc::new(PostgresAdapter::enterprise_db()));
        registry.register(Arc::new(MySqlAdapter::mysql()));
        registry.register(Arc::new(MySqlAdapter::mariadb()));
        registry.register(Arc::new(SqliteAdapter));
        registry.register(Arc::new(Db2Adapter));
        registry
    }

    /// Register under the adapter's own vendor id, replacing any previous entry
    pub fn register(&mut self, adapter: Arc<dyn DatabaseAdapter>) {
        self.adapters.insert(adapter.vendor().to_string(), adapter);
    }

    pub fn get(&self, vendor: &str) -> Option<Arc<dyn DatabaseAdapter>> {
        self.adapters.get(vendor).cloned()
    }

    pub fn vendors(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }

    /// Select the adapter for the live connection
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedVendor` when no adapter is registered for the
    /// reported product, or `Database` if the product name cannot be read.
    pub fn detect(&self, executor: &dyn KeelExecutor) -> Result<Arc<dyn DatabaseAdapter>, MigrationError> {
        let product = executor.product_name()?;
        let vendor = vendor_id_from_product(&product);
        log::debug!("Connection reports '{product}', using vendor '{vendor}'");
        self.get(&vendor)
            .ok_or_else(|| MigrationError::UnsupportedVendor(product))
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("vendors", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}
