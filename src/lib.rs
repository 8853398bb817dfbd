//! # Keel
//!
//! Changelog composition and locked, forward-only schema migration.
//!
//! A core changelog and any number of extension changelogs are composed into
//! one deterministic plan, which is applied exactly once per changeset under
//! a lock row stored in the target database itself. Vendor differences live
//! behind [`dialect::DatabaseAdapter`]; the connection behind
//! [`executor::KeelExecutor`].
//!
//! The usual entry point is [`migration::MigrationEngine`], called once at
//! application startup.

pub mod changelog;
pub mod config;
pub mod connection;
pub mod dialect;
pub mod executor;
pub mod metrics;
pub mod migration;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use changelog::{ChangeLog, ChangeSet, ChangeSetIdentity, ChangelogComposer, ComposedChangeLog, ExtensionSource};
pub use config::MigrationConfig;
pub use connection::{connect, ConnectionError};
pub use dialect::{AdapterRegistry, DatabaseAdapter, StateTables};
pub use executor::{KeelError, KeelExecutor, MayPostgresExecutor, SqlRow, SqlValue};
pub use migration::{
    LockCoordinator, MigrationEngine, MigrationError, MigrationResult, MigrationRunner, MigrationStatus,
};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteExecutor;
