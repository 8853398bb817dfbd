//! Migration-specific error types

use crate::changelog::ChangeSetIdentity;
use crate::connection::ConnectionError;
use crate::executor::KeelError;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Migration-specific errors
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Two changesets in the composed plan share `(id, author, source)`
    #[error("changeset {identity} is defined twice: first by {first}, again by {second}")]
    DuplicateChangeSetIdentity {
        identity: ChangeSetIdentity,
        first: String,
        second: String,
    },

    #[error("extension '{0}' was supplied more than once")]
    DuplicateExtension(String),

    /// The lock was still held by another process when the wait ran out
    #[error(
        "could not acquire the migration lock within {waited:?} (held by {})",
        .holder.as_deref().unwrap_or("nobody, released during the last poll")
    )]
    LockTimeout {
        waited: Duration,
        holder: Option<String>,
    },

    /// Release found the lock row missing or owned by someone else
    #[error(
        "migration lock was not held by {holder_id} at release (current holder: {})",
        .current_holder.as_deref().unwrap_or("none")
    )]
    LockNotHeld {
        holder_id: String,
        current_holder: Option<String>,
    },

    #[error(
        "migration lock held by {holder_id} since {acquired_at} ({}s) looks abandoned; \
         clear it with force_release once the holder is confirmed dead",
        .age.as_secs()
    )]
    StaleLock {
        holder_id: String,
        acquired_at: DateTime<Utc>,
        age: Duration,
    },

    /// An applied changeset was edited afterwards
    #[error(
        "changeset {identity} was modified after it was applied \
         (recorded checksum {stored}, current checksum {current})"
    )]
    ChecksumMismatch {
        identity: ChangeSetIdentity,
        stored: String,
        current: String,
    },

    #[error("changeset {identity} failed to apply: {cause}")]
    ChangeSetApplicationFailed {
        identity: ChangeSetIdentity,
        #[source]
        cause: KeelError,
    },

    #[error("no database adapter registered for '{0}'")]
    UnsupportedVendor(String),

    #[error("changeset {identity} uses a {kind} change, which vendor '{vendor}' cannot apply (raw SQL only)")]
    UnsupportedChange {
        identity: ChangeSetIdentity,
        vendor: String,
        kind: String,
    },

    #[error("failed to parse changelog {locator}: {message}")]
    Parse { locator: String, message: String },

    #[error("no changelog parser registered for {0}")]
    ParserNotFound(String),

    #[error("invalid migration configuration: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] KeelError),
}

impl MigrationError {
    /// Whether the caller may simply try again later
    pub fn is_retryable(&self) -> bool {
        matches!(self, MigrationError::LockTimeout { .. })
    }

    /// Whether a human has to inspect the database before migrations can continue
    pub fn requires_operator(&self) -> bool {
        matches!(
            self,
            MigrationError::ChecksumMismatch { .. } | MigrationError::StaleLock { .. }
        )
    }

    /// The changeset this error is about, if any
    pub fn identity(&self) -> Option<&ChangeSetIdentity> {
        match self {
            MigrationError::DuplicateChangeSetIdentity { identity, .. }
            | MigrationError::ChecksumMismatch { identity, .. }
            | MigrationError::ChangeSetApplicationFailed { identity, .. }
            | MigrationError::UnsupportedChange { identity, .. } => Some(identity),
            _ => None,
        }
    }
}

impl From<ConnectionError> for MigrationError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::InvalidConnectionString(message) => MigrationError::Config(message),
            ConnectionError::PostgresError(e) => MigrationError::Database(KeelError::Postgres(e)),
        }
    }
}

impl From<config::ConfigError> for MigrationError {
    fn from(err: config::ConfigError) -> Self {
        MigrationError::Config(err.to_string())
    }
}
