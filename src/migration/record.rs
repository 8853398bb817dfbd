//! `AppliedChangeRecord` - one row of the history table

use crate::changelog::ChangeSetIdentity;
use crate::executor::{KeelError, SqlRow};
use chrono::{DateTime, Utc};

/// A changeset the history table says was applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedChangeRecord {
    pub identity: ChangeSetIdentity,

    /// Checksum of the changeset at the time it was applied
    pub checksum: String,

    pub applied_at: DateTime<Utc>,

    /// Global application order across all runs
    pub order_executed: i64,

    /// Execution time in milliseconds (`None` if not recorded)
    pub execution_time_ms: Option<i64>,

    pub success: bool,

    /// Holder id of the lock under which the changeset was applied
    pub deployment_id: Option<String>,
}

impl AppliedChangeRecord {
    /// Decode a row selected by `DatabaseAdapter::history_select_sql`
    ///
    /// Expected column order: `id`, `author`, `source_location`, `checksum`,
    /// `applied_at`, `order_executed`, `execution_time_ms`, `success`,
    /// `deployment_id`
    ///
    /// # Errors
    ///
    /// Returns `KeelError::Decode` if a column is missing or has the wrong shape.
    pub fn from_row(row: &SqlRow) -> Result<Self, KeelError> {
        Ok(Self {
            identity: ChangeSetIdentity::new(row.get_text(0)?, row.get_text(1)?, row.get_text(2)?),
            checksum: row.get_text(3)?,
            applied_at: row.get_timestamp(4)?,
            order_executed: row.get_i64(5)?,
            execution_time_ms: row.get_optional_i64(6)?,
            success: row.get_bool(7)?,
            deployment_id: row.get_optional_text(8)?,
        })
    }
}
