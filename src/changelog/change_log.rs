//! `ChangeLog` - the ordered changesets parsed from one source

use super::change_set::ChangeSet;
use std::fmt;

/// Where a changelog came from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangeLogOrigin {
    Core,
    Extension(String),
}

impl ChangeLogOrigin {
    pub fn extension_id(&self) -> Option<&str> {
        match self {
            ChangeLogOrigin::Core => None,
            ChangeLogOrigin::Extension(id) => Some(id),
        }
    }
}

impl fmt::Display for ChangeLogOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeLogOrigin::Core => write!(f, "core"),
            ChangeLogOrigin::Extension(id) => write!(f, "extension '{id}'"),
        }
    }
}

/// Ordered sequence of changesets from one changelog source
///
/// Sequence order is application order within the source.
#[derive(Debug, Clone)]
pub struct ChangeLog {
    source: String,
    origin: ChangeLogOrigin,
    change_sets: Vec<ChangeSet>,
}

impl ChangeLog {
    pub fn new(source: impl Into<String>, origin: ChangeLogOrigin) -> Self {
        Self {
            source: source.into(),
            origin,
            change_sets: Vec::new(),
        }
    }

    pub fn core(source: impl Into<String>) -> Self {
        Self::new(source, ChangeLogOrigin::Core)
    }

    pub fn extension(extension_id: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(source, ChangeLogOrigin::Extension(extension_id.into()))
    }

    /// Append a changeset, stamping its ordinal
    pub fn push(&mut self, mut change_set: ChangeSet) {
        change_set.set_ordinal(self.change_sets.len());
        self.change_sets.push(change_set);
    }

    #[must_use]
    pub fn with_change_set(mut self, change_set: ChangeSet) -> Self {
        self.push(change_set);
        self
    }

    pub(crate) fn set_origin(&mut self, origin: ChangeLogOrigin) {
        self.origin = origin;
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn origin(&self) -> &ChangeLogOrigin {
        &self.origin
    }

    pub fn extension_id(&self) -> Option<&str> {
        self.origin.extension_id()
    }

    pub fn change_sets(&self) -> &[ChangeSet] {
        &self.change_sets
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChangeSet> {
        self.change_sets.iter()
    }

    pub fn len(&self) -> usize {
        self.change_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.change_sets.is_empty()
    }

    pub fn into_change_sets(self) -> Vec<ChangeSet> {
        self.change_sets
    }
}

impl<'a> IntoIterator for &'a ChangeLog {
    type Item = &'a ChangeSet;
    type IntoIter = std::slice::Iter<'a, ChangeSet>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
