//! Locked, forward-only migration
//!
//! - [`LockCoordinator`] owns the single-row lock table.
//! - [`MigrationRunner`] applies a composed changelog under that lock and
//!   records each changeset in the history table.
//! - [`MigrationEngine`] wires vendor detection, parsing and composition
//!   together for the startup call.
//!
//! # Example
//!
//! ```rust
//! use keel::changelog::{Change, ChangeLog, ChangeSet, ChangelogComposer};
//! use keel::dialect::{SqliteAdapter, StateTables};
//! use keel::migration::{LockOptions, MigrationRunner};
//! use keel::sqlite::SqliteExecutor;
//! use std::sync::Arc;
//!
//! let core = ChangeLog::core("core.sql").with_change_set(ChangeSet::new(
//!     "1",
//!     "keel",
//!     "core.sql",
//!     vec![Change::Sql("CREATE TABLE realm (id TEXT PRIMARY KEY)".into())],
//! ));
//! let plan = ChangelogComposer::new().compose(&core, &[]).unwrap();
//!
//! let runner = MigrationRunner::new(
//!     SqliteExecutor::open_in_memory().unwrap(),
//!     Arc::new(SqliteAdapter),
//!     StateTables::default(),
//!     LockOptions::default(),
//! );
//! assert_eq!(runner.run(&plan).unwrap().applied_count(), 1);
//! assert_eq!(runner.run(&plan).unwrap().applied_count(), 0);
//! ```

pub mod error;
pub mod lock;
pub mod migrator;
pub mod record;
pub mod startup;
pub mod state_table;
pub mod status;

pub use error::MigrationError;
pub use lock::{LockCoordinator, LockInfo, LockOptions, LockState, MigrationLockGuard, StaleLockPolicy};
pub use migrator::{MigrationResult, MigrationRunner};
pub use record::AppliedChangeRecord;
pub use startup::MigrationEngine;
pub use status::MigrationStatus;
