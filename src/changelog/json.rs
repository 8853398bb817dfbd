//! JSON changelog format
//!
//! ```json
//! {
//!   "changeSets": [
//!     {
//!       "id": "1.0.0-init",
//!       "author": "keel",
//!       "comment": "initial schema",
//!       "changes": [
//!         { "sql": "CREATE TABLE realm (id VARCHAR(36) PRIMARY KEY)" },
//!         { "createIndex": { "indexName": "idx_realm_id", "tableName": "realm", "columns": ["id"] } }
//!       ]
//!     }
//!   ]
//! }
//! ```

use super::change::Change;
use super::change_log::ChangeLog;
use super::change_set::ChangeSet;
use super::parser::{ChangeLogParameters, ChangeLogParser};
use crate::migration::MigrationError;
use sea_query::{Alias, Index, Table};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ChangeLogDocument {
    #[serde(default)]
    change_sets: Vec<ChangeSetDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ChangeSetDocument {
    id: String,
    author: String,
    #[serde(default)]
    comment: Option<String>,
    /// Explicit checksum, for changesets whose recorded checksum predates a reformat
    #[serde(default)]
    checksum: Option<String>,
    changes: Vec<ChangeDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
enum ChangeDocument {
    Sql(String),
    DropTable(DropTableDocument),
    CreateIndex(CreateIndexDocument),
    DropIndex(DropIndexDocument),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DropTableDocument {
    table_name: String,
    #[serde(default)]
    if_exists: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateIndexDocument {
    index_name: String,
    table_name: String,
    columns: Vec<String>,
    #[serde(default)]
    unique: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DropIndexDocument {
    index_name: String,
    table_name: String,
}

impl ChangeDocument {
    fn into_change(self, parameters: &ChangeLogParameters) -> Change {
        match self {
            ChangeDocument::Sql(sql) => Change::Sql(parameters.substitute(&sql)),
            ChangeDocument::DropTable(doc) => {
                let mut stmt = Table::drop();
                stmt.table(Alias::new(parameters.substitute(&doc.table_name)));
                if doc.if_exists {
                    stmt.if_exists();
                }
                Change::DropTable(stmt.to_owned())
            }
            ChangeDocument::CreateIndex(doc) => {
                let mut stmt = Index::create();
                stmt.name(parameters.substitute(&doc.index_name))
                    .table(Alias::new(parameters.substitute(&doc.table_name)));
                for column in &doc.columns {
                    stmt.col(Alias::new(column.as_str()));
                }
                if doc.unique {
                    stmt.unique();
                }
                Change::CreateIndex(stmt.to_owned())
            }
            ChangeDocument::DropIndex(doc) => Change::DropIndex(
                Index::drop()
                    .name(parameters.substitute(&doc.index_name))
                    .table(Alias::new(parameters.substitute(&doc.table_name)))
                    .to_owned(),
            ),
        }
    }
}

/// Parser for `.json` changelogs
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonChangeLogParser;

impl ChangeLogParser for JsonChangeLogParser {
    fn format(&self) -> &'static str {
        "json"
    }

    fn parse(
        &self,
        locator: &str,
        content: &str,
        parameters: &ChangeLogParameters,
    ) -> Result<ChangeLog, MigrationError> {
        let document: ChangeLogDocument = serde_json::from_str(content).map_err(|e| MigrationError::Parse {
            locator: locator.to_string(),
            message: e.to_string(),
        })?;

        let mut log = ChangeLog::core(locator);
        for cs in document.change_sets {
            if cs.id.trim().is_empty() || cs.author.trim().is_empty() {
                return Err(MigrationError::Parse {
                    locator: locator.to_string(),
                    message: format!("changeset #{} must have a non-empty id and author", log.len() + 1),
                });
            }
            let changes = cs.changes.into_iter().map(|c| c.into_change(parameters)).collect();
            let mut change_set = ChangeSet::new(cs.id, cs.author, locator, changes);
            if let Some(checksum) = cs.checksum {
                change_set = change_set.with_checksum(checksum);
            }
            if let Some(comment) = cs.comment {
                change_set = change_set.with_comment(comment);
            }
            log.push(change_set);
        }
        Ok(log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::SchemaDialect;

    const CORE: &str = r#"{
        "changeSets": [
            {
                "id": "1.0.0",
                "author": "keel",
                "comment": "realm table",
                "changes": [
                    { "sql": "CREATE TABLE ${prefix}realm (id VARCHAR(36) PRIMARY KEY)" },
                    { "createIndex": { "indexName": "idx_realm", "tableName": "${prefix}realm", "columns": ["id"], "unique": true } }
                ]
            },
            {
                "id": "1.0.1",
                "author": "keel",
                "checksum": "abc123",
                "changes": [ { "dropTable": { "tableName": "legacy", "ifExists": true } } ]
            }
        ]
    }"#;

    #[test]
    fn test_parse_changesets_in_document_order() {
        let params = ChangeLogParameters::new().with("prefix", "kc_");
        let log = JsonChangeLogParser.parse("META-INF/core.json", CORE, &params).unwrap();
        assert_eq!(log.len(), 2);

        let first = &log.change_sets()[0];
        assert_eq!(first.id(), "1.0.0");
        assert_eq!(first.source_location(), "META-INF/core.json");
        assert_eq!(first.comment(), Some("realm table"));
        assert_eq!(first.changes().len(), 2);
        let statements = first.render(SchemaDialect::Postgres);
        assert!(statements[0].contains("kc_realm"));
        assert!(statements[1].contains("UNIQUE INDEX"));

        assert_eq!(log.change_sets()[1].checksum(), "abc123");
        assert_eq!(log.change_sets()[1].ordinal(), 1);
    }

    #[test]
    fn test_malformed_json_is_a_parse_error() {
        let err = JsonChangeLogParser
            .parse("bad.json", "{ \"changeSets\": [ { \"id\": 1 } ] }", &ChangeLogParameters::new())
            .unwrap_err();
        assert!(matches!(err, MigrationError::Parse { locator, .. } if locator == "bad.json"));
    }

    #[test]
    fn test_blank_author_is_rejected() {
        let doc = r#"{ "changeSets": [ { "id": "1", "author": " ", "changes": [] } ] }"#;
        assert!(JsonChangeLogParser.parse("c.json", doc, &ChangeLogParameters::new()).is_err());
    }
}
