//! Changelog model, parsing and composition
//!
//! A [`ChangeLog`] is the ordered list of [`ChangeSet`]s read from one
//! source. The [`ChangelogComposer`] flattens the core changelog and every
//! extension changelog into a [`ComposedChangeLog`], which is what the
//! migration runner applies.
//!
//! # Example
//!
//! ```rust
//! use keel::changelog::{Change, ChangeLog, ChangeSet, ChangelogComposer};
//!
//! let mut core = ChangeLog::core("META-INF/keel-changelog.json");
//! core.push(ChangeSet::new(
//!     "1.0.0-init",
//!     "keel",
//!     "META-INF/keel-changelog.json",
//!     vec![Change::Sql("CREATE TABLE realm (id VARCHAR(36) PRIMARY KEY)".into())],
//! ));
//!
//! let mut regions = ChangeLog::extension("regions", "regions/changelog.json");
//! regions.push(ChangeSet::new(
//!     "regions-1",
//!     "acme",
//!     "regions/changelog.json",
//!     vec![Change::Sql("CREATE TABLE region (id VARCHAR(36) PRIMARY KEY)".into())],
//! ));
//!
//! let composed = ChangelogComposer::new()
//!     .compose(&core, &[("regions".to_string(), regions)])
//!     .unwrap();
//! assert_eq!(composed.len(), 2);
//! assert_eq!(composed.core_len(), 1);
//! ```

pub mod change;
pub mod change_log;
pub mod change_set;
pub mod checksum;
pub mod compose;
pub mod formatted_sql;
pub mod json;
pub mod parser;

pub use change::{split_statements, Change, SchemaDialect};
pub use change_log::{ChangeLog, ChangeLogOrigin};
pub use change_set::{ChangeSet, ChangeSetIdentity};
pub use checksum::{calculate_checksum, checksums_match};
pub use compose::{sort_extension_sources, ChangelogComposer, ComposedChangeLog, ExtensionSource};
pub use formatted_sql::FormattedSqlParser;
pub use json::JsonChangeLogParser;
pub use parser::{ChangeLogParameters, ChangeLogParser, ParserRegistry};
