//! Individual schema change operations carried by a changeset

use sea_query::{
    IndexCreateStatement, IndexDropStatement, MysqlQueryBuilder, PostgresQueryBuilder, SqliteQueryBuilder,
    TableAlterStatement, TableCreateStatement, TableDropStatement,
};

/// SQL flavour used to render structural changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaDialect {
    Postgres,
    MySql,
    Sqlite,
}

/// One schema change inside a changeset
///
/// Structural variants hold `sea-query` statements and are rendered per
/// vendor; `Sql` is passed through verbatim (after parameter substitution).
#[derive(Debug, Clone)]
pub enum Change {
    Sql(String),
    CreateTable(TableCreateStatement),
    AlterTable(TableAlterStatement),
    DropTable(TableDropStatement),
    CreateIndex(IndexCreateStatement),
    DropIndex(IndexDropStatement),
}

macro_rules! render_with {
    ($stmt:expr, $dialect:expr) => {
        match $dialect {
            SchemaDialect::Postgres => $stmt.build(PostgresQueryBuilder),
            SchemaDialect::MySql => $stmt.build(MysqlQueryBuilder),
            SchemaDialect::Sqlite => $stmt.build(SqliteQueryBuilder),
        }
    };
}

impl Change {
    /// Short change-type name used in logs and error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Change::Sql(_) => "sql",
            Change::CreateTable(_) => "createTable",
            Change::AlterTable(_) => "alterTable",
            Change::DropTable(_) => "dropTable",
            Change::CreateIndex(_) => "createIndex",
            Change::DropIndex(_) => "dropIndex",
        }
    }

    pub fn is_raw_sql(&self) -> bool {
        matches!(self, Change::Sql(_))
    }

    /// Render to executable statements for `dialect`
    pub fn render(&self, dialect: SchemaDialect) -> Vec<String> {
        match self {
            Change::Sql(sql) => split_statements(sql),
            Change::CreateTable(stmt) => vec![render_with!(stmt, dialect)],
            Change::AlterTable(stmt) => vec![render_with!(stmt, dialect)],
            Change::DropTable(stmt) => vec![render_with!(stmt, dialect)],
            Change::CreateIndex(stmt) => vec![render_with!(stmt, dialect)],
            Change::DropIndex(stmt) => vec![render_with!(stmt, dialect)],
        }
    }

    /// Vendor-independent text the checksum is computed from
    ///
    /// Whitespace is collapsed so re-indenting a changelog does not count as
    /// modifying an applied changeset.
    pub fn canonical_text(&self) -> String {
        let rendered = match self {
            Change::Sql(sql) => sql.clone(),
            other => other.render(SchemaDialect::Postgres).join(";\n"),
        };
        format!("{}:{}", self.kind(), normalize_whitespace(&rendered))
    }
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split a SQL body into statements on `;`
///
/// Semicolons inside single-quoted literals, double-quoted identifiers and
/// `--` line comments do not terminate a statement. Empty statements are dropped.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut in_comment = false;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        if in_comment {
            current.push(c);
            if c == '\n' {
                in_comment = false;
            }
            continue;
        }
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '-' if !in_single && !in_double && chars.peek() == Some(&'-') => in_comment = true,
            ';' if !in_single && !in_double => {
                push_statement(&mut statements, &current);
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    push_statement(&mut statements, &current);
    statements
}

fn push_statement(statements: &mut Vec<String>, raw: &str) {
    let has_code = raw
        .lines()
        .map(str::trim)
        .any(|line| !line.is_empty() && !line.starts_with("--"));
    if has_code {
        statements.push(raw.trim().to_string());
    }
}
