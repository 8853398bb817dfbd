//! Changelog composition
//!
//! Merges the mandatory core changelog with any number of extension
//! changelogs into the single ordered plan the runner applies. Extensions can
//! only add changesets: any identity that already exists (in the core or an
//! earlier extension) aborts composition, so an extension can neither
//! redefine nor shadow a core changeset.

use super::change_log::{ChangeLog, ChangeLogOrigin};
use super::change_set::{ChangeSet, ChangeSetIdentity};
use crate::migration::MigrationError;
use std::collections::{BTreeSet, HashMap};
use std::ops::Range;

/// An extension's changelog location, as supplied by the discovery collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionSource {
    pub extension_id: String,
    pub locator: String,
}

impl ExtensionSource {
    pub fn new(extension_id: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            extension_id: extension_id.into(),
            locator: locator.into(),
        }
    }
}

/// Put extension sources into deterministic (lexical by id) order
///
/// # Errors
///
/// Returns `MigrationError::DuplicateExtension` if two sources share an id.
pub fn sort_extension_sources(mut sources: Vec<ExtensionSource>) -> Result<Vec<ExtensionSource>, MigrationError> {
    let mut seen = BTreeSet::new();
    for source in &sources {
        if !seen.insert(source.extension_id.as_str()) {
            return Err(MigrationError::DuplicateExtension(source.extension_id.clone()));
        }
    }
    sources.sort_by(|a, b| a.extension_id.cmp(&b.extension_id));
    Ok(sources)
}

/// The flattened, ordered migration plan
///
/// Core changesets come first, then each extension's changesets in the
/// order the extensions were handed to the composer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedChangeLog {
    change_sets: Vec<ChangeSet>,
    core_len: usize,
    extensions: Vec<(String, Range<usize>)>,
}

impl ComposedChangeLog {
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

    /// Number of leading changesets that came from the core changelog
    pub fn core_len(&self) -> usize {
        self.core_len
    }

    /// Extension ids in composition order
    pub fn extension_ids(&self) -> impl Iterator<Item = &str> {
        self.extensions.iter().map(|(id, _)| id.as_str())
    }

    pub fn origin_of(&self, position: usize) -> Option<ChangeLogOrigin> {
        if position >= self.change_sets.len() {
            return None;
        }
        if position < self.core_len {
            return Some(ChangeLogOrigin::Core);
        }
        self.extensions
            .iter()
            .find(|(_, range)| range.contains(&position))
            .map(|(id, _)| ChangeLogOrigin::Extension(id.clone()))
    }

    pub fn position(&self, identity: &ChangeSetIdentity) -> Option<usize> {
        self.change_sets.iter().position(|cs| cs.identity() == identity)
    }

    pub fn identities(&self) -> impl Iterator<Item = &ChangeSetIdentity> {
        self.change_sets.iter().map(ChangeSet::identity)
    }
}

impl<'a> IntoIterator for &'a ComposedChangeLog {
    type Item = &'a ChangeSet;
    type IntoIter = std::slice::Iter<'a, ChangeSet>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Merges core and extension changelogs
///
/// Composition is a pure function of its inputs. The caller owns extension
/// order; use [`sort_extension_sources`] to make discovery deterministic.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChangelogComposer;

impl ChangelogComposer {
    pub fn new() -> Self {
        Self
    }

    /// Compose `core` followed by each `(extension_id, changelog)` in order
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::DuplicateChangeSetIdentity` if any two
    /// changesets in the result share `(id, author, source)`, and
    /// `MigrationError::DuplicateExtension` if an extension id repeats.
    pub fn compose(
        &self,
        core: &ChangeLog,
        extensions: &[(String, ChangeLog)],
    ) -> Result<ComposedChangeLog, MigrationError> {
        let total = core.len() + extensions.iter().map(|(_, log)| log.len()).sum::<usize>();
        let mut change_sets = Vec::with_capacity(total);
        let mut seen: HashMap<&ChangeSetIdentity, ChangeLogOrigin> = HashMap::with_capacity(total);
        let mut seen_extensions = BTreeSet::new();

        for change_set in core.iter() {
            check_unique(&mut seen, change_set, &ChangeLogOrigin::Core)?;
            change_sets.push(change_set.clone());
        }
        let core_len = change_sets.len();

        let mut ranges = Vec::with_capacity(extensions.len());
        for (extension_id, log) in extensions {
            if !seen_extensions.insert(extension_id.as_str()) {
                return Err(MigrationError::DuplicateExtension(extension_id.clone()));
            }
            let origin = ChangeLogOrigin::Extension(extension_id.clone());
            let start = change_sets.len();
            for change_set in log.iter() {
                check_unique(&mut seen, change_set, &origin)?;
                change_sets.push(change_set.clone());
            }
            ranges.push((extension_id.clone(), start..change_sets.len()));
        }

        log::debug!(
            "Composed changelog: {} core changeset(s), {} extension(s), {} total",
            core_len,
            ranges.len(),
            change_sets.len()
        );

        Ok(ComposedChangeLog {
            change_sets,
            core_len,
            extensions: ranges,
        })
    }
}

fn check_unique<'a>(
    seen: &mut HashMap<&'a ChangeSetIdentity, ChangeLogOrigin>,
    change_set: &'a ChangeSet,
    origin: &ChangeLogOrigin,
) -> Result<(), MigrationError> {
    if let Some(first) = seen.get(change_set.identity()) {
        return Err(MigrationError::DuplicateChangeSetIdentity {
            identity: change_set.identity().clone(),
            first: first.to_string(),
            second: origin.to_string(),
        });
    }
    seen.insert(change_set.identity(), origin.clone());
    Ok(())
}
