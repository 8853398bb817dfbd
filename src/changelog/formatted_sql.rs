//! Formatted SQL changelog format
//!
//! A plain `.sql` file split into changesets by header comments:
//!
//! ```sql
//! --changeset keel:1.0.0-init
//! --comment: realm table
//! CREATE TABLE realm (id VARCHAR(36) PRIMARY KEY);
//!
//! --changeset keel:1.0.1
//! --checksum: 3f2a...
//! ALTER TABLE realm ADD COLUMN name VARCHAR(255);
//! ```
//!
//! Text before the first `--changeset` header must be comments only.

use super::change::Change;
use super::change_log::ChangeLog;
use super::change_set::ChangeSet;
use super::parser::{ChangeLogParameters, ChangeLogParser};
use crate::migration::MigrationError;
use once_cell::sync::Lazy;
use regex::Regex;

static CHANGESET_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^--\s*changeset\s+([^:\s]+):(\S+)\s*$").expect("changeset header pattern is a valid regex")
});

static ATTRIBUTE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^--\s*(comment|checksum):\s*(.*?)\s*$").expect("attribute pattern is a valid regex")
});

struct PendingChangeSet {
    id: String,
    author: String,
    comment: Option<String>,
    checksum: Option<String>,
    body: String,
    line: usize,
}

impl PendingChangeSet {
    fn finish(self, locator: &str, parameters: &ChangeLogParameters) -> Result<ChangeSet, MigrationError> {
        let sql = parameters.substitute(self.body.trim());
        if sql.is_empty() {
            return Err(MigrationError::Parse {
                locator: locator.to_string(),
                message: format!("changeset {}:{} (line {}) has no SQL", self.author, self.id, self.line),
            });
        }
        let mut change_set = ChangeSet::new(self.id, self.author, locator, vec![Change::Sql(sql)]);
        if let Some(checksum) = self.checksum {
            change_set = change_set.with_checksum(checksum);
        }
        if let Some(comment) = self.comment {
            change_set = change_set.with_comment(comment);
        }
        Ok(change_set)
    }
}

/// Parser for `.sql` changelogs with `--changeset author:id` headers
#[derive(Debug, Default, Clone, Copy)]
pub struct FormattedSqlParser;

impl ChangeLogParser for FormattedSqlParser {
    fn format(&self) -> &'static str {
        "sql"
    }

    fn parse(
        &self,
        locator: &str,
        content: &str,
        parameters: &ChangeLogParameters,
    ) -> Result<ChangeLog, MigrationError> {
        let mut log = ChangeLog::core(locator);
        let mut current: Option<PendingChangeSet> = None;

        for (idx, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if let Some(caps) = CHANGESET_HEADER.captures(trimmed) {
                if let Some(done) = current.take() {
                    log.push(done.finish(locator, parameters)?);
                }
                current = Some(PendingChangeSet {
                    author: caps[1].to_string(),
                    id: caps[2].to_string(),
                    comment: None,
                    checksum: None,
                    body: String::new(),
                    line: idx + 1,
                });
                continue;
            }

            match current.as_mut() {
                Some(pending) => {
                    if let Some(caps) = ATTRIBUTE_LINE.captures(trimmed) {
                        let value = caps[2].to_string();
                        match &caps[1] {
                            "comment" => pending.comment = Some(value),
                            _ => pending.checksum = Some(value),
                        }
                    } else {
                        pending.body.push_str(line);
                        pending.body.push('\n');
                    }
                }
                None if trimmed.is_empty() || trimmed.starts_with("--") => {}
                None => {
                    return Err(MigrationError::Parse {
                        locator: locator.to_string(),
                        message: format!("line {}: SQL before the first --changeset header", idx + 1),
                    });
                }
            }
        }

        if let Some(done) = current.take() {
            log.push(done.finish(locator, parameters)?);
        }
        Ok(log)
    }
}
