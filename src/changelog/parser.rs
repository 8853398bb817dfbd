//! Changelog parsing capability and the parser registry
//!
//! The engine never depends on a serialization format. Parsers are
//! registered explicitly by the surrounding application, keyed by the file
//! extension of the locators they handle.

use super::change_log::{ChangeLog, ChangeLogOrigin};
use super::formatted_sql::FormattedSqlParser;
use super::json::JsonChangeLogParser;
use crate::migration::MigrationError;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

/// `${name}` placeholder syntax
static PARAMETER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z0-9_.\-]+)\}").expect("placeholder pattern is a valid regex")
});

/// Values substituted into `${name}` placeholders at parse time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeLogParameters {
    values: BTreeMap<String, String>,
}

impl ChangeLogParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Replace known placeholders; unknown ones are left as written
    pub fn substitute(&self, text: &str) -> String {
        if self.values.is_empty() || !text.contains("${") {
            return text.to_string();
        }
        PARAMETER_PATTERN
            .replace_all(text, |caps: &Captures<'_>| match self.values.get(&caps[1]) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }
}

impl From<HashMap<String, String>> for ChangeLogParameters {
    fn from(values: HashMap<String, String>) -> Self {
        Self {
            values: values.into_iter().collect(),
        }
    }
}

/// Turns changelog source text into a [`ChangeLog`]
pub trait ChangeLogParser: Send + Sync {
    /// Format key, also the file extension this parser handles (`json`, `sql`, ...)
    fn format(&self) -> &'static str;

    /// Parse `content` read from `locator`
    ///
    /// Changesets take `locator` as their source location. The returned
    /// changelog is marked `Core`; the registry re-labels extension logs.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Parse` for malformed input.
    fn parse(
        &self,
        locator: &str,
        content: &str,
        parameters: &ChangeLogParameters,
    ) -> Result<ChangeLog, MigrationError>;
}

/// Format-keyed parser table plus the directory locators resolve against
pub struct ParserRegistry {
    root: PathBuf,
    parsers: BTreeMap<&'static str, Box<dyn ChangeLogParser>>,
}

impl ParserRegistry {
    /// Empty registry resolving locators under `root`
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            parsers: BTreeMap::new(),
        }
    }

    /// Registry with the built-in JSON and formatted-SQL parsers
    pub fn with_defaults(root: impl AsRef<Path>) -> Self {
        let mut registry = Self::new(root);
        registry.register(Box::new(JsonChangeLogParser));
        registry.register(Box::new(FormattedSqlParser));
        registry
    }

    /// Register a parser, replacing any previous one for the same format
    pub fn register(&mut self, parser: Box<dyn ChangeLogParser>) {
        self.parsers.insert(parser.format(), parser);
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn formats(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.parsers.keys().copied()
    }

    fn parser_for(&self, locator: &str) -> Result<&dyn ChangeLogParser, MigrationError> {
        let extension = Path::new(locator)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        self.parsers
            .get(extension.as_str())
            .map(|parser| &**parser)
            .ok_or_else(|| MigrationError::ParserNotFound(locator.to_string()))
    }

    /// Parse already-loaded text with the parser registered for `locator`'s format
    ///
    /// # Errors
    ///
    /// Returns `ParserNotFound` for unregistered formats and `Parse` for bad input.
    pub fn parse_str(
        &self,
        locator: &str,
        content: &str,
        origin: ChangeLogOrigin,
        parameters: &ChangeLogParameters,
    ) -> Result<ChangeLog, MigrationError> {
        let mut log = self.parser_for(locator)?.parse(locator, content, parameters)?;
        log.set_origin(origin);
        Ok(log)
    }

    /// Read `locator` under the root directory and parse it
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Parse` if the file cannot be read.
    pub fn parse(
        &self,
        locator: &str,
        origin: ChangeLogOrigin,
        parameters: &ChangeLogParameters,
    ) -> Result<ChangeLog, MigrationError> {
        let parser = self.parser_for(locator)?;
        let path = self.root.join(locator);
        let content = fs::read_to_string(&path).map_err(|e| MigrationError::Parse {
            locator: locator.to_string(),
            message: format!("failed to read {}: {e}", path.display()),
        })?;
        log::debug!("Parsing {} changelog {}", parser.format(), path.display());
        let mut log = parser.parse(locator, &content, parameters)?;
        log.set_origin(origin);
        Ok(log)
    }
}

impl std::fmt::Debug for ParserRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParserRegistry")
            .field("root", &self.root)
            .field("formats", &self.parsers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute_known_and_unknown_parameters() {
        let params = ChangeLogParameters::new().with("schema", "keycloak").with("id.type", "VARCHAR(36)");
        assert_eq!(
            params.substitute("CREATE TABLE ${schema}.realm (id ${id.type}, x ${missing})"),
            "CREATE TABLE keycloak.realm (id VARCHAR(36), x ${missing})"
        );
    }

    #[test]
    fn test_unregistered_format_is_reported() {
        let registry = ParserRegistry::with_defaults(".");
        let err = registry
            .parse_str("changelog.yaml", "", ChangeLogOrigin::Core, &ChangeLogParameters::new())
            .unwrap_err();
        assert!(matches!(err, MigrationError::ParserNotFound(locator) if locator == "changelog.yaml"));
    }

    #[test]
    fn test_registry_labels_extension_origin() {
        let registry = ParserRegistry::with_defaults(".");
        let log = registry
            .parse_str(
                "ext/changelog.sql",
                "--changeset ext:1\nCREATE TABLE region (id INT);",
                ChangeLogOrigin::Extension("regions".into()),
                &ChangeLogParameters::new(),
            )
            .unwrap();
        assert_eq!(log.extension_id(), Some("regions"));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_parse_reads_relative_to_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("core.sql"), "--changeset keel:1\nSELECT 1;").unwrap();
        let registry = ParserRegistry::with_defaults(dir.path());
        let log = registry
            .parse("core.sql", ChangeLogOrigin::Core, &ChangeLogParameters::new())
            .unwrap();
        assert_eq!(log.change_sets()[0].source_location(), "core.sql");

        let missing = registry.parse("absent.sql", ChangeLogOrigin::Core, &ChangeLogParameters::new());
        assert!(matches!(missing, Err(MigrationError::Parse { .. })));
    }
}
