//! In-process migration at application startup
//!
//! [`MigrationEngine`] is the embedded entry point: it detects the vendor of
//! the live connection, parses the core changelog and every extension
//! changelog, composes them and runs the result under the migration lock.

use crate::changelog::{
    sort_extension_sources, ChangeLogOrigin, ChangeLogParameters, ChangelogComposer, ComposedChangeLog,
    ExtensionSource, ParserRegistry,
};
use crate::config::MigrationConfig;
use crate::connection;
use crate::dialect::{AdapterRegistry, DatabaseAdapter, LockStrategy};
use crate::executor::KeelExecutor;
use crate::migration::{state_table, MigrationError, MigrationResult, MigrationRunner, MigrationStatus};
use std::sync::Arc;

/// Startup migration entry point
///
/// # Example
///
/// ```rust,no_run
/// use keel::changelog::ExtensionSource;
/// use keel::config::MigrationConfig;
/// use keel::migration::MigrationEngine;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = MigrationEngine::new(MigrationConfig::load()?)?;
///     let extensions = vec![ExtensionSource::new("regions", "regions/changelog.sql")];
///
///     // Fail startup rather than run against a schema that may be stale.
///     let result = engine.migrate_database_url(extensions)?;
///     println!("applied {} changeset(s)", result.applied_count());
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct MigrationEngine {
    config: MigrationConfig,
    adapters: AdapterRegistry,
    parsers: ParserRegistry,
}

impl MigrationEngine {
    /// Engine with every built-in vendor adapter and changelog format
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Config` if `config` does not validate.
    pub fn new(config: MigrationConfig) -> Result<Self, MigrationError> {
        config.validate()?;
        let parsers = ParserRegistry::with_defaults(&config.changelog_root);
        Ok(Self {
            config,
            adapters: AdapterRegistry::with_defaults(),
            parsers,
        })
    }

    /// Replace the vendor adapter table
    #[must_use]
    pub fn with_adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = adapters;
        self
    }

    /// Replace the changelog parser table
    #[must_use]
    pub fn with_parsers(mut self, parsers: ParserRegistry) -> Self {
        self.parsers = parsers;
        self
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Parse and compose the plan for `vendor`
    ///
    /// Extensions are put into lexical order of their ids first, so the plan
    /// does not depend on the order discovery happened to report them in.
    ///
    /// # Errors
    ///
    /// Returns `Parse`/`ParserNotFound` for unreadable changelogs and
    /// `DuplicateExtension`/`DuplicateChangeSetIdentity` from composition.
    pub fn plan(&self, vendor: &str, extensions: Vec<ExtensionSource>) -> Result<ComposedChangeLog, MigrationError> {
        let parameters = ChangeLogParameters::from(self.config.parameters.clone());
        let core_locator = self.config.core_changelog_for(vendor);
        let core = self.parsers.parse(core_locator, ChangeLogOrigin::Core, &parameters)?;

        let mut logs = Vec::with_capacity(extensions.len());
        for source in sort_extension_sources(extensions)? {
            let origin = ChangeLogOrigin::Extension(source.extension_id.clone());
            let log = self.parsers.parse(&source.locator, origin, &parameters)?;
            logs.push((source.extension_id, log));
        }

        ChangelogComposer::new().compose(&core, &logs)
    }

    /// Run all pending changesets over `executor`
    ///
    /// While this run holds the lock it keeps no row lock, so nodes waiting
    /// behind it poll; [`Self::migrate_with_row_lock`] lets them block instead.
    ///
    /// # Errors
    ///
    /// Any [`MigrationError`]; the caller should treat every error as fatal
    /// to startup, retrying only when [`MigrationError::is_retryable`].
    pub fn migrate<E: KeelExecutor>(
        &self,
        executor: E,
        extensions: Vec<ExtensionSource>,
    ) -> Result<MigrationResult, MigrationError> {
        let adapter = self.prepare(&executor)?;
        let runner = self.runner(executor, adapter.clone())?;
        self.run(&runner, adapter.as_ref(), extensions)
    }

    /// As [`Self::migrate`], holding the lock row's row lock on `row_lock_connection`
    ///
    /// `row_lock_connection` must be a separate session to the same
    /// database. It only matters for vendors with row-level blocking reads.
    ///
    /// # Errors
    ///
    /// As [`Self::migrate`].
    pub fn migrate_with_row_lock<E: KeelExecutor, L: KeelExecutor + Send + 'static>(
        &self,
        executor: E,
        row_lock_connection: L,
        extensions: Vec<ExtensionSource>,
    ) -> Result<MigrationResult, MigrationError> {
        let adapter = self.prepare(&executor)?;
        self.switch_schema(&row_lock_connection, adapter.as_ref())?;
        let runner = self
            .runner(executor, adapter.clone())?
            .with_row_lock_connection(row_lock_connection);
        self.run(&runner, adapter.as_ref(), extensions)
    }

    /// Connect to `database_url` from the configuration and migrate
    ///
    /// Vendors with row-level blocking reads get a second connection for the
    /// lock holder's row lock.
    ///
    /// # Errors
    ///
    /// Returns `Config` or `Database` if a connection cannot be opened,
    /// otherwise as [`Self::migrate`].
    pub fn migrate_database_url(&self, extensions: Vec<ExtensionSource>) -> Result<MigrationResult, MigrationError> {
        let executor = connection::connect(&self.config.database_url)?;
        let adapter = self.prepare(&executor)?;
        let mut runner = self.runner(executor, adapter.clone())?;
        if adapter.lock_strategy() == LockStrategy::BlockingRead {
            let row_lock_connection = connection::connect(&self.config.database_url)?;
            self.switch_schema(&row_lock_connection, adapter.as_ref())?;
            runner = runner.with_row_lock_connection(row_lock_connection);
        }
        self.run(&runner, adapter.as_ref(), extensions)
    }

    fn run<E: KeelExecutor>(
        &self,
        runner: &MigrationRunner<E>,
        adapter: &dyn DatabaseAdapter,
        extensions: Vec<ExtensionSource>,
    ) -> Result<MigrationResult, MigrationError> {
        let plan = self.plan(adapter.vendor(), extensions)?;
        log::info!(
            "Migrating {} database: {} core and {} extension changeset(s)",
            adapter.vendor(),
            plan.core_len(),
            plan.len() - plan.core_len()
        );
        runner.run(&plan)
    }

    /// Report applied, pending and unknown changesets without migrating
    ///
    /// # Errors
    ///
    /// As [`Self::plan`], or `Database` if the history cannot be read.
    pub fn status<E: KeelExecutor>(
        &self,
        executor: E,
        extensions: Vec<ExtensionSource>,
    ) -> Result<MigrationStatus, MigrationError> {
        let adapter = self.prepare(&executor)?;
        let plan = self.plan(adapter.vendor(), extensions)?;
        self.runner(executor, adapter)?.status(&plan)
    }

    /// Detect the vendor and switch to the configured default schema
    fn prepare(&self, executor: &dyn KeelExecutor) -> Result<Arc<dyn DatabaseAdapter>, MigrationError> {
        let adapter = self.adapters.detect(executor)?;
        self.switch_schema(executor, adapter.as_ref())?;
        Ok(adapter)
    }

    fn switch_schema(&self, executor: &dyn KeelExecutor, adapter: &dyn DatabaseAdapter) -> Result<(), MigrationError> {
        match &self.config.default_schema {
            Some(schema) => state_table::set_schema(executor, adapter, schema),
            None => Ok(()),
        }
    }

    fn runner<E: KeelExecutor>(
        &self,
        executor: E,
        adapter: Arc<dyn DatabaseAdapter>,
    ) -> Result<MigrationRunner<E>, MigrationError> {
        Ok(MigrationRunner::new(
            executor,
            adapter,
            self.config.state_tables()?,
            self.config.lock_options(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = MigrationConfig {
            lock_timeout_seconds: 0,
            ..MigrationConfig::default()
        };
        assert!(matches!(MigrationEngine::new(config), Err(MigrationError::Config(_))));
    }

    #[test]
    fn test_plan_sorts_extensions_and_uses_vendor_override() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("core.sql"), "--changeset keel:1\nCREATE TABLE realm (id INT);").unwrap();
        fs::write(dir.path().join("core-db2.sql"), "--changeset keel:1\nCREATE TABLE realm (id INTEGER);").unwrap();
        fs::write(dir.path().join("b.sql"), "--changeset b:1\nCREATE TABLE b (id INT);").unwrap();
        fs::write(dir.path().join("a.sql"), "--changeset a:1\nCREATE TABLE a (id INT);").unwrap();

        let mut config = MigrationConfig {
            changelog_root: dir.path().to_path_buf(),
            core_changelog: "core.sql".to_string(),
            ..MigrationConfig::default()
        };
        config
            .core_changelog_overrides
            .insert("db2".to_string(), "core-db2.sql".to_string());
        let engine = MigrationEngine::new(config).unwrap();

        let extensions = vec![ExtensionSource::new("ext-b", "b.sql"), ExtensionSource::new("ext-a", "a.sql")];
        let plan = engine.plan("sqlite", extensions.clone()).unwrap();
        let authors: Vec<_> = plan.iter().map(|cs| cs.author()).collect();
        assert_eq!(authors, vec!["keel", "a", "b"]);
        assert_eq!(plan.change_sets()[0].source_location(), "core.sql");

        let db2_plan = engine.plan("db2", extensions).unwrap();
        assert_eq!(db2_plan.change_sets()[0].source_location(), "core-db2.sql");
    }

    #[test]
    fn test_duplicate_extension_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("core.sql"), "").unwrap();
        let config = MigrationConfig {
            changelog_root: dir.path().to_path_buf(),
            core_changelog: "core.sql".to_string(),
            ..MigrationConfig::default()
        };
        let engine = MigrationEngine::new(config).unwrap();
        let err = engine
            .plan(
                "sqlite",
                vec![ExtensionSource::new("x", "x1.sql"), ExtensionSource::new("x", "x2.sql")],
            )
            .unwrap_err();
        assert!(matches!(err, MigrationError::DuplicateExtension(id) if id == "x"));
    }
}
