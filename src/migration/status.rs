//! Migration status tracking

use crate::changelog::{checksums_match, ChangeSetIdentity, ComposedChangeLog};
use crate::migration::AppliedChangeRecord;
use std::collections::HashMap;

/// How the composed plan compares with the history table
#[derive(Debug, Clone, Default)]
pub struct MigrationStatus {
    /// Successfully applied changesets that are still part of the plan
    pub applied: Vec<AppliedChangeRecord>,

    /// Changesets a run would apply, in plan order
    pub pending: Vec<ChangeSetIdentity>,

    /// History rows with no counterpart in the plan
    pub unknown: Vec<AppliedChangeRecord>,

    /// Applied changesets whose content has changed since
    pub checksum_mismatches: Vec<ChangeSetIdentity>,
}

impl MigrationStatus {
    /// Compare `plan` with `history`
    #[must_use]
    pub fn compute(plan: &ComposedChangeLog, history: Vec<AppliedChangeRecord>) -> Self {
        let mut by_identity: HashMap<ChangeSetIdentity, AppliedChangeRecord> = history
            .into_iter()
            .map(|record| (record.identity.clone(), record))
            .collect();

        let mut status = Self::default();
        for change_set in plan {
            match by_identity.remove(change_set.identity()) {
                Some(record) if record.success => {
                    if !checksums_match(&record.checksum, change_set.checksum()) {
                        status.checksum_mismatches.push(change_set.identity().clone());
                    }
                    status.applied.push(record);
                }
                _ => status.pending.push(change_set.identity().clone()),
            }
        }

        let mut unknown: Vec<_> = by_identity.into_values().collect();
        unknown.sort_by_key(|record| record.order_executed);
        status.unknown = unknown;
        status.applied.sort_by_key(|record| record.order_executed);
        status
    }

    /// Nothing pending and nothing modified
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty() && self.checksum_mismatches.is_empty()
    }

    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
