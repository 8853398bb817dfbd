//! `ChangeSet` - one atomic, identified unit of schema change

use super::change::{Change, SchemaDialect};
use super::checksum::calculate_checksum;
use std::fmt;

/// The `(id, author, source)` triple that names a changeset
///
/// Must be unique across a composed changelog; it is also the key of the
/// history table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChangeSetIdentity {
    pub id: String,
    pub author: String,
    pub source: String,
}

impl ChangeSetIdentity {
    pub fn new(id: impl Into<String>, author: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            author: author.into(),
            source: source.into(),
        }
    }
}

impl fmt::Display for ChangeSetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::{}", self.source, self.id, self.author)
    }
}

/// One ordered unit of schema change
///
/// Immutable once built. Equality compares identity and checksum only.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    identity: ChangeSetIdentity,
    changes: Vec<Change>,
    checksum: String,
    ordinal: usize,
    comment: Option<String>,
}

impl ChangeSet {
    /// Build a changeset; the checksum is computed from `changes`
    pub fn new(
        id: impl Into<String>,
        author: impl Into<String>,
        source: impl Into<String>,
        changes: Vec<Change>,
    ) -> Self {
        let checksum = calculate_checksum(&changes);
        Self {
            identity: ChangeSetIdentity::new(id, author, source),
            changes,
            checksum,
            ordinal: 0,
            comment: None,
        }
    }

    /// Replace the computed checksum with an explicit one from the changelog source
    #[must_use]
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = checksum.into();
        self
    }

    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub(crate) fn set_ordinal(&mut self, ordinal: usize) {
        self.ordinal = ordinal;
    }

    pub fn identity(&self) -> &ChangeSetIdentity {
        &self.identity
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn author(&self) -> &str {
        &self.identity.author
    }

    pub fn source_location(&self) -> &str {
        &self.identity.source
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Position within the changelog it was parsed from
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    /// All statements for `dialect`, in change order
    pub fn render(&self, dialect: SchemaDialect) -> Vec<String> {
        self.changes.iter().flat_map(|c| c.render(dialect)).collect()
    }
}

impl PartialEq for ChangeSet {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity && self.checksum == other.checksum
    }
}

impl Eq for ChangeSet {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_display_locates_changeset() {
        let identity = ChangeSetIdentity::new("1.0.0-init", "keel", "META-INF/core.json");
        assert_eq!(identity.to_string(), "META-INF/core.json::1.0.0-init::keel");
    }

    #[test]
    fn test_equality_uses_identity_and_checksum() {
        let a = ChangeSet::new("1", "me", "core.json", vec![Change::Sql("SELECT 1".into())]);
        let same = ChangeSet::new("1", "me", "core.json", vec![Change::Sql("SELECT  1".into())]);
        let edited = ChangeSet::new("1", "me", "core.json", vec![Change::Sql("SELECT 2".into())]);
        assert_eq!(a, same);
        assert_ne!(a, edited);
        assert_eq!(a.identity(), edited.identity());
    }

    #[test]
    fn test_explicit_checksum_overrides_computed() {
        let cs = ChangeSet::new("1", "me", "core.json", vec![]).with_checksum("abc123");
        assert_eq!(cs.checksum(), "abc123");
    }
}
