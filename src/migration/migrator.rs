//! `MigrationRunner` - applies a composed changelog under the migration lock

use crate::changelog::{checksums_match, ChangeSet, ChangeSetIdentity, ComposedChangeLog};
use crate::dialect::{DatabaseAdapter, StateTables};
use crate::executor::KeelExecutor;
use crate::migration::lock::{LockCoordinator, LockOptions, MigrationLockGuard};
use crate::migration::state_table::{self, HistoryEntry};
use crate::migration::{AppliedChangeRecord, MigrationError, MigrationStatus};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Outcome of a successful run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationResult {
    /// Changesets applied by this run, in order
    pub applied: Vec<ChangeSetIdentity>,
    /// Changesets found already applied
    pub previously_applied: usize,
    /// `false` if the lock row could not be removed cleanly afterwards
    pub lock_released: bool,
}

impl MigrationResult {
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }
}

/// Applies pending changesets one at a time while holding the migration lock
///
/// Each changeset is executed and then recorded in the history table before
/// the next one starts, so a failed or interrupted run resumes from the
/// first unrecorded changeset.
pub struct MigrationRunner<E: KeelExecutor> {
    lock: LockCoordinator<E>,
}

impl<E: KeelExecutor> MigrationRunner<E> {
    pub fn new(executor: E, adapter: Arc<dyn DatabaseAdapter>, tables: StateTables, options: LockOptions) -> Self {
        Self {
            lock: LockCoordinator::new(executor, adapter, tables, options),
        }
    }

    /// Second session for the lock holder's row lock, see [`LockCoordinator::with_row_lock_connection`]
    #[must_use]
    pub fn with_row_lock_connection(mut self, connection: impl KeelExecutor + Send + 'static) -> Self {
        self.lock = self.lock.with_row_lock_connection(connection);
        self
    }

    pub fn lock_coordinator(&self) -> &LockCoordinator<E> {
        &self.lock
    }

    fn executor(&self) -> &E {
        self.lock.executor()
    }

    fn adapter(&self) -> &dyn DatabaseAdapter {
        self.lock.adapter()
    }

    fn tables(&self) -> &StateTables {
        self.lock.tables()
    }

    /// Bring the database up to date with `plan`
    ///
    /// # Errors
    ///
    /// - `LockTimeout` / `StaleLock` if the lock cannot be taken; nothing was touched.
    /// - `ChecksumMismatch` if an applied changeset was edited; nothing was
    ///   executed and the lock is left engaged for an operator.
    /// - `ChangeSetApplicationFailed` / `UnsupportedChange` if a changeset
    ///   cannot be applied; earlier changesets stay recorded and the lock is released.
    pub fn run(&self, plan: &ComposedChangeLog) -> Result<MigrationResult, MigrationError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::migration_run_span(self.adapter().vendor(), plan.len()).entered();

        state_table::ensure_state_tables(self.executor(), self.adapter(), self.tables())?;
        let guard = self.lock.acquire()?;

        match self.apply_pending(plan, guard.holder_id()) {
            Ok(mut result) => {
                result.lock_released = self.finish(guard);
                log::info!(
                    "Migration complete: {} applied, {} already applied",
                    result.applied.len(),
                    result.previously_applied
                );
                Ok(result)
            }
            Err(e @ MigrationError::ChecksumMismatch { .. }) => {
                let info = guard.retain();
                log::error!("{e}; leaving migration lock {info} engaged until an operator intervenes");
                Err(e)
            }
            Err(e) => {
                log::error!("Migration halted: {e}");
                self.finish(guard);
                Err(e)
            }
        }
    }

    /// Release the lock, reporting whether that went cleanly
    fn finish(&self, guard: MigrationLockGuard<'_, E>) -> bool {
        match self.lock.release(guard) {
            Ok(()) => true,
            Err(e @ MigrationError::LockNotHeld { .. }) => {
                log::warn!("{e}");
                false
            }
            Err(e) => {
                log::warn!("Failed to release migration lock: {e}");
                false
            }
        }
    }

    fn apply_pending(&self, plan: &ComposedChangeLog, deployment_id: &str) -> Result<MigrationResult, MigrationError> {
        let history = state_table::read_history(self.executor(), self.adapter(), self.tables())?;
        let mut next_order = history.iter().map(|r| r.order_executed).max().unwrap_or(0) + 1;

        let recorded: HashMap<&ChangeSetIdentity, &AppliedChangeRecord> =
            history.iter().map(|record| (&record.identity, record)).collect();

        // Validate the whole plan before executing anything.
        for change_set in plan {
            if let Some(record) = recorded.get(change_set.identity()) {
                if record.success && !checksums_match(&record.checksum, change_set.checksum()) {
                    return Err(MigrationError::ChecksumMismatch {
                        identity: change_set.identity().clone(),
                        stored: record.checksum.clone(),
                        current: change_set.checksum().to_string(),
                    });
                }
            }
        }

        let planned: HashSet<&ChangeSetIdentity> = plan.identities().collect();
        for record in history.iter().filter(|r| !planned.contains(&r.identity)) {
            log::warn!(
                "History records {} but no composed changelog defines it",
                record.identity
            );
        }

        let mut result = MigrationResult::default();
        for change_set in plan {
            match recorded.get(change_set.identity()) {
                Some(record) if record.success => {
                    result.previously_applied += 1;
                    continue;
                }
                Some(record) => {
                    log::warn!("Re-applying {} whose previous attempt was not marked successful", record.identity);
                    state_table::delete_history(self.executor(), self.adapter(), self.tables(), record)?;
                }
                None => {}
            }
            self.apply_one(change_set, next_order, deployment_id)?;
            next_order += 1;
            result.applied.push(change_set.identity().clone());
        }
        Ok(result)
    }

    fn apply_one(&self, change_set: &ChangeSet, order: i64, deployment_id: &str) -> Result<(), MigrationError> {
        let identity = change_set.identity();

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::changeset_span(&identity.to_string()).entered();

        let statements = self.adapter().apply_change_set_sql(change_set)?;
        let start = Instant::now();
        for statement in &statements {
            log::debug!("{identity}: {statement}");
            if let Err(e) = self.executor().execute(statement, &[]) {
                #[cfg(feature = "metrics")]
                METRICS.record_changeset_failure(self.adapter().vendor());
                return Err(MigrationError::ChangeSetApplicationFailed {
                    identity: identity.clone(),
                    cause: e,
                });
            }
        }
        let elapsed = start.elapsed();

        let entry = HistoryEntry {
            applied_at: Utc::now(),
            order_executed: order,
            execution_time_ms: i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
            deployment_id,
        };
        state_table::insert_history(self.executor(), self.adapter(), self.tables(), change_set, &entry)?;

        #[cfg(feature = "metrics")]
        METRICS.record_changeset(self.adapter().vendor(), elapsed);
        match change_set.comment() {
            Some(comment) => log::info!("Applied {identity} ({comment}) in {elapsed:?}"),
            None => log::info!("Applied {identity} in {elapsed:?}"),
        }
        Ok(())
    }

    /// Compare `plan` with the history table without locking or writing anything
    ///
    /// # Errors
    ///
    /// Returns `Database` if the history table exists but cannot be read.
    pub fn status(&self, plan: &ComposedChangeLog) -> Result<MigrationStatus, MigrationError> {
        let history = state_table::read_history_if_present(self.executor(), self.adapter(), self.tables())?;
        Ok(MigrationStatus::compute(plan, history))
    }
}
