//! Table-based migration lock
//!
//! The lock is a single row in the lock table. Whoever manages to insert it
//! holds the lock; the table's primary key is the only source of mutual
//! exclusion, so the scheme works across processes and hosts.
//!
//! On vendors with row-level blocking reads the holder also keeps the row
//! locked (`SELECT ... FOR UPDATE` in an open transaction on a second
//! session) until release. Waiters block on the same read instead of
//! sleeping, and wake when the holder commits the row's removal.

use crate::dialect::{DatabaseAdapter, LockStrategy, StateTables};
use crate::executor::{KeelError, KeelExecutor, SqlValue};
use crate::migration::MigrationError;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Lifecycle of a [`LockCoordinator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Acquiring,
    Locked,
    Releasing,
    /// Gave up waiting; the caller decides whether to retry
    Contended,
    /// Found a lock row older than the stale threshold and refused to touch it
    StaleDetected,
}

/// What to do with a lock row older than [`LockOptions::stale_after`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StaleLockPolicy {
    /// Log a warning and keep waiting until the timeout
    #[default]
    Wait,
    /// Fail immediately with `StaleLock`
    Fail,
    /// Delete the stale row and compete for the lock again
    ///
    /// Only safe when no legitimate migration can run longer than the
    /// stale threshold.
    Reclaim,
}

impl std::str::FromStr for StaleLockPolicy {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wait" => Ok(StaleLockPolicy::Wait),
            "fail" => Ok(StaleLockPolicy::Fail),
            "reclaim" => Ok(StaleLockPolicy::Reclaim),
            other => Err(MigrationError::Config(format!(
                "unknown stale lock policy '{other}' (expected wait, fail or reclaim)"
            ))),
        }
    }
}

/// Timing knobs for lock acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    /// Overall time to wait for the lock
    pub timeout: Duration,
    /// Pause between attempts
    pub poll_interval: Duration,
    /// Upper bound for each blocking wait statement
    pub statement_timeout: Duration,
    /// Age after which a held lock counts as abandoned; `None` disables detection
    pub stale_after: Option<Duration>,
    pub stale_policy: StaleLockPolicy,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            statement_timeout: Duration::from_secs(5),
            stale_after: None,
            stale_policy: StaleLockPolicy::Wait,
        }
    }
}

/// Current contents of the lock row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    /// How long the lock has been held as of `now`; zero if the clocks disagree
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.acquired_at).to_std().unwrap_or_default()
    }
}

impl fmt::Display for LockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (since {})", self.holder_id, self.acquired_at)
    }
}

/// Dedicated session the holder keeps the lock row locked on
struct RowLock {
    connection: Box<dyn KeelExecutor + Send>,
    held: Cell<bool>,
}

/// Acquires and releases the global migration lock
pub struct LockCoordinator<E: KeelExecutor> {
    executor: E,
    adapter: Arc<dyn DatabaseAdapter>,
    tables: StateTables,
    options: LockOptions,
    state: Cell<LockState>,
    row_lock: Option<RowLock>,
}

impl<E: KeelExecutor> LockCoordinator<E> {
    pub fn new(executor: E, adapter: Arc<dyn DatabaseAdapter>, tables: StateTables, options: LockOptions) -> Self {
        Self {
            executor,
            adapter,
            tables,
            options,
            state: Cell::new(LockState::Unlocked),
            row_lock: None,
        }
    }

    /// Session to hold the lock row's row lock on while the lock is held
    ///
    /// Only used with [`LockStrategy::BlockingRead`]. It must not be the
    /// session migrations run on: the holder keeps a transaction open on it
    /// until release, and that transaction is what waiters' blocking reads
    /// queue behind. Without one, waiters on those vendors end up polling.
    #[must_use]
    pub fn with_row_lock_connection(mut self, connection: impl KeelExecutor + Send + 'static) -> Self {
        self.row_lock = Some(RowLock {
            connection: Box::new(connection),
            held: Cell::new(false),
        });
        self
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn adapter(&self) -> &dyn DatabaseAdapter {
        self.adapter.as_ref()
    }

    pub fn tables(&self) -> &StateTables {
        &self.tables
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    pub fn state(&self) -> LockState {
        self.state.get()
    }

    /// Whether this coordinator currently keeps the lock row locked for waiters to block on
    pub fn holds_row_lock(&self) -> bool {
        self.held_row_lock().is_some()
    }

    fn held_row_lock(&self) -> Option<&RowLock> {
        self.row_lock.as_ref().filter(|row_lock| row_lock.held.get())
    }

    fn blocking_reads(&self) -> bool {
        self.adapter.lock_strategy() == LockStrategy::BlockingRead
    }

    /// Acquire the lock, waiting up to `options.timeout`
    ///
    /// The returned guard releases the lock when dropped; call
    /// [`Self::release`] to observe release errors instead.
    ///
    /// With [`LockStrategy::BlockingRead`] every statement issued while
    /// waiting is bounded by `options.statement_timeout`, so the overall wait
    /// can overrun `options.timeout` by at most one such bound.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` when the wait runs out, `StaleLock` under
    /// [`StaleLockPolicy::Fail`], or `Database` for any other failure.
    pub fn acquire(&self) -> Result<MigrationLockGuard<'_, E>, MigrationError> {
        let holder_id = Uuid::new_v4().to_string();

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::lock_acquire_span(&holder_id).entered();

        self.state.set(LockState::Acquiring);
        let start = Instant::now();

        let bounded = self.blocking_reads()
            && self.set_statement_timeout(self.options.statement_timeout.min(self.options.timeout));
        let outcome = self.acquire_as(&holder_id, start);
        if bounded {
            self.reset_statement_timeout();
        }

        match outcome {
            Ok(acquired_at) => {
                self.state.set(LockState::Locked);
                #[cfg(feature = "metrics")]
                METRICS.record_lock_wait(start.elapsed());
                log::info!(
                    "Acquired migration lock {holder_id} after {:?}",
                    start.elapsed()
                );
                self.hold_row_lock();
                Ok(MigrationLockGuard {
                    coordinator: self,
                    holder_id,
                    acquired_at,
                    armed: true,
                })
            }
            Err(e) => {
                // Contended and StaleDetected are set where they are decided.
                if self.state.get() == LockState::Acquiring {
                    self.state.set(LockState::Unlocked);
                }
                Err(e)
            }
        }
    }

    fn acquire_as(&self, holder_id: &str, start: Instant) -> Result<DateTime<Utc>, MigrationError> {
        let insert_sql = self.adapter.lock_acquire_sql(&self.tables);
        let mut warned_stale = false;

        loop {
            let acquired_at = Utc::now();
            if self.try_insert(&insert_sql, holder_id, acquired_at)? {
                return Ok(acquired_at);
            }

            let current = self.lock_info()?;

            if let (Some(info), Some(stale_after)) = (&current, self.options.stale_after) {
                let age = info.age(Utc::now());
                if age > stale_after {
                    match self.options.stale_policy {
                        StaleLockPolicy::Wait => {
                            if !warned_stale {
                                log::warn!(
                                    "Migration lock held by {info} for {}s; it may be abandoned. \
                                     Waiting anyway; use force_release if the holder is gone",
                                    age.as_secs()
                                );
                                warned_stale = true;
                            }
                        }
                        StaleLockPolicy::Fail => {
                            self.state.set(LockState::StaleDetected);
                            return Err(MigrationError::StaleLock {
                                holder_id: info.holder_id.clone(),
                                acquired_at: info.acquired_at,
                                age,
                            });
                        }
                        StaleLockPolicy::Reclaim => {
                            log::warn!("Reclaiming stale migration lock held by {info}");
                            let release_sql = self.adapter.lock_release_sql(&self.tables);
                            match self
                                .executor
                                .execute(&release_sql, &[SqlValue::from(info.holder_id.as_str())])
                            {
                                Ok(_) => continue,
                                // The holder is alive and still has the row locked.
                                Err(e) if self.adapter.is_lock_wait_timeout(&e) => {
                                    log::debug!("Could not reclaim migration lock from {info} yet: {e}");
                                }
                                Err(e) => return Err(e.into()),
                            }
                        }
                    }
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= self.options.timeout {
                self.state.set(LockState::Contended);
                #[cfg(feature = "metrics")]
                METRICS.record_lock_timeout();
                return Err(MigrationError::LockTimeout {
                    waited: elapsed,
                    holder: current.map(|info| info.holder_id),
                });
            }

            log::debug!(
                "Migration lock busy ({}), retrying for up to {:?}",
                current.as_ref().map_or_else(|| "just released".to_string(), ToString::to_string),
                self.options.timeout - elapsed
            );
            if self.blocking_reads() && self.blocking_wait() {
                continue;
            }
            let pause = self
                .options
                .poll_interval
                .min(self.options.timeout.saturating_sub(start.elapsed()));
            may::coroutine::sleep(pause);
        }
    }

    /// One insert-if-absent attempt; `Ok(false)` means someone else holds the lock
    fn try_insert(&self, sql: &str, holder_id: &str, acquired_at: DateTime<Utc>) -> Result<bool, MigrationError> {
        let params = [SqlValue::from(holder_id), SqlValue::from(acquired_at)];
        match self.executor.execute(sql, &params) {
            Ok(rows) => Ok(rows > 0),
            Err(e) if self.adapter.is_duplicate_key_error(&e) || self.adapter.is_lock_wait_timeout(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Block on a row-locking read of the lock row
    ///
    /// Returns `true` when retrying straight away makes sense: the holder
    /// committed the row's removal, or the read already sat out the
    /// statement timeout. A read that finds the row unlocked and still
    /// present returns `false` so the caller pauses instead of spinning.
    fn blocking_wait(&self) -> bool {
        let Some(wait_sql) = self.adapter.lock_wait_sql(&self.tables) else {
            return false;
        };
        let started = Instant::now();
        match self.executor.query_all(&wait_sql, &[]) {
            Ok(rows) => rows.is_empty(),
            Err(e) if self.adapter.is_lock_wait_timeout(&e) => {
                log::debug!("Migration lock holder still busy after {:?}", started.elapsed());
                true
            }
            Err(e) => {
                log::debug!("Lock wait ended without the row being freed: {e}");
                false
            }
        }
    }

    fn set_statement_timeout(&self, bound: Duration) -> bool {
        let Some(sql) = self.adapter.statement_timeout_sql(bound) else {
            return false;
        };
        match self.executor.execute(&sql, &[]) {
            Ok(_) => true,
            Err(e) => {
                log::warn!("Could not bound lock waits with a statement timeout: {e}");
                false
            }
        }
    }

    fn reset_statement_timeout(&self) {
        if let Some(sql) = self.adapter.reset_statement_timeout_sql() {
            if let Err(e) = self.executor.execute(&sql, &[]) {
                log::warn!("Failed to reset statement timeout after lock wait: {e}");
            }
        }
    }

    /// Open a transaction on the row-lock session and lock the row just inserted
    fn hold_row_lock(&self) {
        if !self.blocking_reads() {
            return;
        }
        let (Some(row_lock), Some(wait_sql)) = (&self.row_lock, self.adapter.lock_wait_sql(&self.tables)) else {
            return;
        };
        let connection = row_lock.connection.as_ref();
        let locked = connection
            .execute(self.adapter.begin_transaction_sql(), &[])
            .and_then(|_| connection.query_all(&wait_sql, &[]));
        match locked {
            Ok(_) => row_lock.held.set(true),
            Err(e) => {
                log::warn!("Could not keep the migration lock row locked, waiters will poll: {e}");
                if let Err(e) = connection.execute(self.adapter.rollback_transaction_sql(), &[]) {
                    log::debug!("Rollback on the row-lock session failed: {e}");
                }
            }
        }
    }

    /// Commit or roll back the row-lock transaction, if one is open
    fn end_row_lock(&self, commit: bool) -> Result<(), KeelError> {
        let Some(row_lock) = self.held_row_lock() else {
            return Ok(());
        };
        row_lock.held.set(false);
        let sql = if commit {
            self.adapter.commit_transaction_sql()
        } else {
            self.adapter.rollback_transaction_sql()
        };
        row_lock.connection.execute(sql, &[]).map(|_| ())
    }

    /// Delete the lock row, inside the row-lock transaction when one is open
    ///
    /// Deleting and committing there wakes blocked waiters in one step.
    fn delete_lock_row(&self, sql: &str, params: &[SqlValue]) -> Result<u64, KeelError> {
        let Some(row_lock) = self.held_row_lock() else {
            return self.executor.execute(sql, params);
        };
        match row_lock.connection.execute(sql, params) {
            Ok(deleted) => {
                self.end_row_lock(true)?;
                Ok(deleted)
            }
            Err(e) => {
                if let Err(rollback) = self.end_row_lock(false) {
                    log::debug!("Rollback on the row-lock session failed: {rollback}");
                }
                Err(e)
            }
        }
    }

    /// Release a lock acquired by this coordinator
    ///
    /// # Errors
    ///
    /// Returns `LockNotHeld` if the row is gone or belongs to another holder,
    /// which means someone cleared or reclaimed the lock underneath us.
    pub fn release(&self, mut guard: MigrationLockGuard<'_, E>) -> Result<(), MigrationError> {
        guard.armed = false;
        self.release_holder(&guard.holder_id)
    }

    fn release_holder(&self, holder_id: &str) -> Result<(), MigrationError> {
        self.state.set(LockState::Releasing);
        let sql = self.adapter.lock_release_sql(&self.tables);
        match self.delete_lock_row(&sql, &[SqlValue::from(holder_id)]) {
            Ok(0) => {
                self.state.set(LockState::Unlocked);
                let current_holder = self.lock_info().ok().flatten().map(|info| info.holder_id);
                Err(MigrationError::LockNotHeld {
                    holder_id: holder_id.to_string(),
                    current_holder,
                })
            }
            Ok(_) => {
                self.state.set(LockState::Unlocked);
                log::info!("Released migration lock {holder_id}");
                Ok(())
            }
            Err(e) => {
                self.state.set(LockState::Locked);
                Err(e.into())
            }
        }
    }

    /// Who holds the lock right now, if anyone
    ///
    /// # Errors
    ///
    /// Returns `Database` if the lock table cannot be read.
    pub fn lock_info(&self) -> Result<Option<LockInfo>, MigrationError> {
        let sql = self.adapter.lock_query_sql(&self.tables);
        let Some(row) = self.executor.query_opt(&sql, &[])? else {
            return Ok(None);
        };
        Ok(Some(LockInfo {
            holder_id: row.get_text(0)?,
            acquired_at: row.get_timestamp(1)?,
        }))
    }

    /// Delete the lock row whoever holds it
    ///
    /// For operators clearing a lock left behind by a crashed process.
    /// Returns the holder that was removed.
    ///
    /// # Errors
    ///
    /// Returns `Database` if the lock table cannot be read or written, or if
    /// a live holder keeps the row locked past the statement timeout.
    pub fn force_release(&self) -> Result<Option<LockInfo>, MigrationError> {
        let previous = self.lock_info()?;
        let sql = self.adapter.lock_force_release_sql(&self.tables);

        let bounded = self.blocking_reads()
            && !self.holds_row_lock()
            && self.set_statement_timeout(self.options.statement_timeout);
        let deleted = self.delete_lock_row(&sql, &[]);
        if bounded {
            self.reset_statement_timeout();
        }
        deleted?;

        match &previous {
            Some(info) => log::warn!("Force-released migration lock held by {info}"),
            None => log::info!("Force release requested but the migration lock was free"),
        }
        self.state.set(LockState::Unlocked);
        Ok(previous)
    }
}

/// Proof of holding the migration lock
///
/// Dropping the guard releases the lock on a best-effort basis. Use
/// [`LockCoordinator::release`] to see release errors, or
/// [`MigrationLockGuard::retain`] to deliberately leave the lock engaged.
pub struct MigrationLockGuard<'a, E: KeelExecutor> {
    coordinator: &'a LockCoordinator<E>,
    holder_id: String,
    acquired_at: DateTime<Utc>,
    armed: bool,
}

impl<E: KeelExecutor> MigrationLockGuard<'_, E> {
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Keep the lock row in place after this guard goes away
    ///
    /// The row-lock transaction is committed so waiters stop blocking on it;
    /// further migration attempts time out until an operator clears the row.
    pub fn retain(mut self) -> LockInfo {
        self.armed = false;
        if let Err(e) = self.coordinator.end_row_lock(true) {
            log::warn!("Failed to end the row-lock transaction for {}: {e}", self.holder_id);
        }
        LockInfo {
            holder_id: self.holder_id.clone(),
            acquired_at: self.acquired_at,
        }
    }
}

impl<E: KeelExecutor> fmt::Debug for MigrationLockGuard<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationLockGuard")
            .field("holder_id", &self.holder_id)
            .field("acquired_at", &self.acquired_at)
            .field("armed", &self.armed)
            .finish()
    }
}

impl<E: KeelExecutor> Drop for MigrationLockGuard<'_, E> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.coordinator.release_holder(&self.holder_id) {
            log::warn!("Failed to release migration lock {} on drop: {e}", self.holder_id);
        }
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::changelog::SchemaDialect;
    use crate::dialect::{SqliteAdapter, LOCK_ROW_ID};
    use crate::executor::SqlRow;
    use crate::migration::state_table::ensure_state_tables;
    use crate::sqlite::SqliteExecutor;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    fn coordinator(options: LockOptions) -> LockCoordinator<SqliteExecutor> {
        let executor = SqliteExecutor::open_in_memory().unwrap();
        let tables = StateTables::default();
        ensure_state_tables(&executor, &SqliteAdapter, &tables).unwrap();
        LockCoordinator::new(executor, Arc::new(SqliteAdapter), tables, options)
    }

    fn quick() -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(20),
            ..LockOptions::default()
        }
    }

    fn plant_lock(coordinator: &LockCoordinator<SqliteExecutor>, holder: &str, acquired_at: DateTime<Utc>) {
        coordinator
            .executor()
            .execute(
                "INSERT INTO keel_migration_lock (lock_id, holder_id, acquired_at) VALUES (1, ?1, ?2)",
                &[SqlValue::from(holder), SqlValue::from(acquired_at)],
            )
            .unwrap();
    }

    #[test]
    fn test_acquire_and_release() {
        let coordinator = coordinator(quick());
        assert_eq!(coordinator.state(), LockState::Unlocked);

        let guard = coordinator.acquire().unwrap();
        assert_eq!(coordinator.state(), LockState::Locked);
        let info = coordinator.lock_info().unwrap().unwrap();
        assert_eq!(info.holder_id, guard.holder_id());

        coordinator.release(guard).unwrap();
        assert_eq!(coordinator.state(), LockState::Unlocked);
        assert!(coordinator.lock_info().unwrap().is_none());
    }

    #[test]
    fn test_second_acquire_times_out_while_held() {
        let coordinator = coordinator(quick());
        let _guard = coordinator.acquire().unwrap();

        let err = coordinator.acquire().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(coordinator.state(), LockState::Contended);
        match err {
            MigrationError::LockTimeout { waited, holder } => {
                assert!(waited >= Duration::from_millis(300));
                assert!(holder.is_some());
            }
            other => panic!("expected LockTimeout, got {other:?}"),
        }
    }

    #[test]
    fn test_drop_releases_and_retain_keeps() {
        let coordinator = coordinator(quick());
        {
            let _guard = coordinator.acquire().unwrap();
        }
        assert!(coordinator.lock_info().unwrap().is_none());

        let retained = coordinator.acquire().unwrap().retain();
        let info = coordinator.lock_info().unwrap().unwrap();
        assert_eq!(info.holder_id, retained.holder_id);
    }

    #[test]
    fn test_release_after_force_release_reports_lock_not_held() {
        let coordinator = coordinator(quick());
        let guard = coordinator.acquire().unwrap();
        let removed = coordinator.force_release().unwrap().unwrap();
        assert_eq!(removed.holder_id, guard.holder_id());

        plant_lock(&coordinator, "intruder", Utc::now());
        let err = coordinator.release(guard).unwrap_err();
        match err {
            MigrationError::LockNotHeld { current_holder, .. } => {
                assert_eq!(current_holder.as_deref(), Some("intruder"));
            }
            other => panic!("expected LockNotHeld, got {other:?}"),
        }
    }

    #[test]
    fn test_stale_lock_fail_policy() {
        let coordinator = coordinator(LockOptions {
            stale_after: Some(Duration::from_secs(60)),
            stale_policy: StaleLockPolicy::Fail,
            ..quick()
        });
        plant_lock(&coordinator, "crashed", Utc::now() - chrono::Duration::minutes(10));

        let err = coordinator.acquire().unwrap_err();
        assert!(err.requires_operator());
        assert_eq!(coordinator.state(), LockState::StaleDetected);
    }

    #[test]
    fn test_stale_lock_reclaim_policy() {
        let coordinator = coordinator(LockOptions {
            stale_after: Some(Duration::from_secs(60)),
            stale_policy: StaleLockPolicy::Reclaim,
            ..quick()
        });
        plant_lock(&coordinator, "crashed", Utc::now() - chrono::Duration::minutes(10));

        let guard = coordinator.acquire().unwrap();
        assert_ne!(guard.holder_id(), "crashed");
    }

    #[test]
    fn test_fresh_lock_is_not_stale() {
        let coordinator = coordinator(LockOptions {
            stale_after: Some(Duration::from_secs(3600)),
            stale_policy: StaleLockPolicy::Reclaim,
            ..quick()
        });
        plant_lock(&coordinator, "busy", Utc::now());
        assert!(matches!(coordinator.acquire(), Err(MigrationError::LockTimeout { .. })));
    }

    /// SQLite dressed up as a vendor with row-level blocking reads
    struct RowLockingSqlite;

    impl DatabaseAdapter for RowLockingSqlite {
        fn vendor(&self) -> &'static str {
            "sqlite"
        }

        fn placeholder(&self, n: usize) -> String {
            SqliteAdapter.placeholder(n)
        }

        fn schema_dialect(&self) -> Option<SchemaDialect> {
            SqliteAdapter.schema_dialect()
        }

        fn lock_strategy(&self) -> LockStrategy {
            LockStrategy::BlockingRead
        }

        fn timestamp_type(&self) -> &'static str {
            SqliteAdapter.timestamp_type()
        }

        fn boolean_type(&self) -> &'static str {
            SqliteAdapter.boolean_type()
        }

        fn lock_acquire_sql(&self, tables: &StateTables) -> String {
            SqliteAdapter.lock_acquire_sql(tables)
        }

        fn lock_wait_sql(&self, tables: &StateTables) -> Option<String> {
            Some(format!(
                "SELECT holder_id FROM {} WHERE lock_id = {LOCK_ROW_ID} FOR UPDATE",
                tables.lock_table()
            ))
        }

        fn statement_timeout_sql(&self, timeout: Duration) -> Option<String> {
            Some(format!("SET statement_timeout = '{}ms'", timeout.as_millis()))
        }

        fn reset_statement_timeout_sql(&self) -> Option<String> {
            Some("RESET statement_timeout".to_string())
        }
    }

    /// Records every statement; transaction and session statements stop here
    ///
    /// `FOR UPDATE` reads sleep for `wait_delay`, standing in for a holder's
    /// row lock, then run `on_wait` and the plain read.
    struct Scripted {
        inner: SqliteExecutor,
        log: Arc<Mutex<Vec<String>>>,
        wait_delay: Duration,
        on_wait: Option<fn(&SqliteExecutor)>,
        fail_on: Option<&'static str>,
    }

    impl Scripted {
        fn open(path: &Path) -> Self {
            Self {
                inner: SqliteExecutor::open(path).unwrap(),
                log: Arc::new(Mutex::new(Vec::new())),
                wait_delay: Duration::ZERO,
                on_wait: None,
                fail_on: None,
            }
        }

        fn statements(&self) -> Arc<Mutex<Vec<String>>> {
            Arc::clone(&self.log)
        }
    }

    impl KeelExecutor for Scripted {
        fn execute(&self, query: &str, params: &[SqlValue]) -> Result<u64, KeelError> {
            self.log.lock().unwrap().push(query.to_string());
            if self.fail_on.is_some_and(|prefix| query.starts_with(prefix)) {
                return Err(KeelError::Query("disk I/O error".to_string()));
            }
            if ["BEGIN", "COMMIT", "ROLLBACK", "SET ", "RESET "]
                .iter()
                .any(|prefix| query.starts_with(prefix))
            {
                return Ok(0);
            }
            self.inner.execute(query, params)
        }

        fn query_all(&self, query: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, KeelError> {
            self.log.lock().unwrap().push(query.to_string());
            match query.strip_suffix(" FOR UPDATE") {
                Some(read) => {
                    std::thread::sleep(self.wait_delay);
                    if let Some(on_wait) = self.on_wait {
                        on_wait(&self.inner);
                    }
                    self.inner.query_all(read, params)
                }
                None => self.inner.query_all(query, params),
            }
        }

        fn product_name(&self) -> Result<String, KeelError> {
            self.inner.product_name()
        }
    }

    fn shared_database() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.db");
        let executor = SqliteExecutor::open(&path).unwrap();
        ensure_state_tables(&executor, &SqliteAdapter, &StateTables::default()).unwrap();
        (dir, path)
    }

    fn plant_row(executor: &SqliteExecutor, holder: &str, acquired_at: DateTime<Utc>) {
        executor
            .execute(
                "INSERT INTO keel_migration_lock (lock_id, holder_id, acquired_at) VALUES (1, ?1, ?2)",
                &[SqlValue::from(holder), SqlValue::from(acquired_at)],
            )
            .unwrap();
    }

    fn holder_commits_removal(executor: &SqliteExecutor) {
        executor.execute("DELETE FROM keel_migration_lock", &[]).unwrap();
    }

    fn count(log: &[String], pattern: fn(&str) -> bool) -> usize {
        log.iter().filter(|sql| pattern(sql)).count()
    }

    #[test]
    fn test_holder_keeps_row_locked_until_release() {
        let (_dir, path) = shared_database();
        let main = Scripted::open(&path);
        let main_log = main.statements();
        let row_lock = Scripted::open(&path);
        let row_lock_log = row_lock.statements();
        let coordinator = LockCoordinator::new(main, Arc::new(RowLockingSqlite), StateTables::default(), quick())
            .with_row_lock_connection(row_lock);

        let guard = coordinator.acquire().unwrap();
        assert!(coordinator.holds_row_lock());
        assert_eq!(
            *row_lock_log.lock().unwrap(),
            vec!["BEGIN", "SELECT holder_id FROM keel_migration_lock WHERE lock_id = 1 FOR UPDATE"]
        );

        coordinator.release(guard).unwrap();
        assert!(!coordinator.holds_row_lock());
        assert!(coordinator.lock_info().unwrap().is_none());

        let row_lock_log = row_lock_log.lock().unwrap();
        assert_eq!(row_lock_log.len(), 4);
        assert!(row_lock_log[2].starts_with("DELETE FROM keel_migration_lock"));
        assert_eq!(row_lock_log[3], "COMMIT");

        // One bound for the whole acquisition; the row is removed on the row-lock session.
        let main_log = main_log.lock().unwrap();
        assert_eq!(count(&main_log, |sql| sql.starts_with("SET statement_timeout")), 1);
        assert_eq!(count(&main_log, |sql| sql.starts_with("RESET statement_timeout")), 1);
        assert_eq!(count(&main_log, |sql| sql.starts_with("DELETE")), 0);
    }

    #[test]
    fn test_retain_commits_row_lock_and_keeps_row() {
        let (_dir, path) = shared_database();
        let row_lock = Scripted::open(&path);
        let row_lock_log = row_lock.statements();
        let coordinator = LockCoordinator::new(
            Scripted::open(&path),
            Arc::new(RowLockingSqlite),
            StateTables::default(),
            quick(),
        )
        .with_row_lock_connection(row_lock);

        let retained = coordinator.acquire().unwrap().retain();
        assert!(!coordinator.holds_row_lock());
        assert_eq!(row_lock_log.lock().unwrap().last().map(String::as_str), Some("COMMIT"));
        assert_eq!(coordinator.lock_info().unwrap().unwrap().holder_id, retained.holder_id);
    }

    #[test]
    fn test_waiter_retries_as_soon_as_blocking_read_returns() {
        let (_dir, path) = shared_database();
        plant_row(&SqliteExecutor::open(&path).unwrap(), "other-node", Utc::now());

        let mut waiter = Scripted::open(&path);
        waiter.wait_delay = Duration::from_millis(50);
        waiter.on_wait = Some(holder_commits_removal as fn(&SqliteExecutor));
        let log = waiter.statements();
        let coordinator = LockCoordinator::new(
            waiter,
            Arc::new(RowLockingSqlite),
            StateTables::default(),
            LockOptions {
                timeout: Duration::from_secs(10),
                poll_interval: Duration::from_secs(30),
                ..LockOptions::default()
            },
        );

        let started = Instant::now();
        let guard = coordinator.acquire().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_ne!(guard.holder_id(), "other-node");

        let log = log.lock().unwrap();
        assert_eq!(count(&log, |sql| sql.ends_with("FOR UPDATE")), 1);
        assert_eq!(count(&log, |sql| sql.starts_with("SET statement_timeout")), 1);
    }

    #[test]
    fn test_blocking_waiter_times_out_and_resets_statement_timeout() {
        let (_dir, path) = shared_database();
        plant_row(&SqliteExecutor::open(&path).unwrap(), "other-node", Utc::now());

        let mut waiter = Scripted::open(&path);
        waiter.wait_delay = Duration::from_millis(100);
        let log = waiter.statements();
        let coordinator = LockCoordinator::new(waiter, Arc::new(RowLockingSqlite), StateTables::default(), quick());

        let err = coordinator.acquire().unwrap_err();
        assert!(matches!(err, MigrationError::LockTimeout { ref holder, .. } if holder.as_deref() == Some("other-node")));
        assert_eq!(coordinator.state(), LockState::Contended);

        let log = log.lock().unwrap();
        assert!(count(&log, |sql| sql.ends_with("FOR UPDATE")) >= 2);
        assert_eq!(log.last().map(String::as_str), Some("RESET statement_timeout"));
    }

    #[test]
    fn test_failed_reclaim_leaves_coordinator_unlocked() {
        let (_dir, path) = shared_database();
        plant_row(
            &SqliteExecutor::open(&path).unwrap(),
            "crashed",
            Utc::now() - chrono::Duration::minutes(10),
        );

        let mut executor = Scripted::open(&path);
        executor.fail_on = Some("DELETE");
        let coordinator = LockCoordinator::new(
            executor,
            Arc::new(SqliteAdapter),
            StateTables::default(),
            LockOptions {
                stale_after: Some(Duration::from_secs(60)),
                stale_policy: StaleLockPolicy::Reclaim,
                ..quick()
            },
        );

        assert!(matches!(coordinator.acquire(), Err(MigrationError::Database(_))));
        assert_eq!(coordinator.state(), LockState::Unlocked);
    }

    #[test]
    fn test_stale_policy_from_str() {
        assert_eq!("Reclaim".parse::<StaleLockPolicy>().unwrap(), StaleLockPolicy::Reclaim);
        assert!("sometimes".parse::<StaleLockPolicy>().is_err());
    }
}
