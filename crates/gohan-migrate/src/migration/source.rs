//! Migration sources: annotated SQL files and registered code migrations.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::AnyConnection;

use crate::error::{MigrateError, Result};

const UP: &str = "-- +goose Up";
const DOWN: &str = "-- +goose Down";
const STATEMENT_BEGIN: &str = "-- +goose StatementBegin";
const STATEMENT_END: &str = "-- +goose StatementEnd";
const MODIFIES: &str = "-- +gohan modifies";

/// Direction a migration is applied in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}

/// Collects the schemas a migration changed while it runs.
#[derive(Debug, Default)]
pub struct MigrationContext {
    modified: Vec<String>,
}

impl MigrationContext {
    /// Record that the running migration changed the table of `schema_id`.
    pub fn mark_schema_modified(&mut self, schema_id: impl Into<String>) {
        let schema_id = schema_id.into();
        if !self.modified.contains(&schema_id) {
            self.modified.push(schema_id);
        }
    }

    pub fn modified_schemas(&self) -> &[String] {
        &self.modified
    }
}

/// Migration written in Rust and registered with the migrator.
///
/// Both directions run inside the migration transaction.
#[async_trait]
pub trait CodeMigration: Send + Sync {
    fn version(&self) -> i64;

    fn name(&self) -> &str;

    async fn up(&self, conn: &mut AnyConnection, ctx: &mut MigrationContext) -> Result<()>;

    async fn down(&self, conn: &mut AnyConnection, ctx: &mut MigrationContext) -> Result<()>;
}

/// Statements of one SQL migration file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlScript {
    pub up: Vec<String>,
    pub down: Vec<String>,
    pub modifies: Vec<String>,
}

impl SqlScript {
    pub fn statements(&self, direction: Direction) -> &[String] {
        match direction {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        }
    }

    /// Parse an annotated SQL migration.
    pub fn parse(content: &str) -> Result<Self> {
        let mut script = SqlScript::default();
        let mut section: Option<Direction> = None;
        let mut seen_up = false;
        let mut in_block = false;
        let mut current = String::new();

        for line in content.lines() {
            let trimmed = line.trim();

            if let Some(rest) = trimmed.strip_prefix(MODIFIES) {
                for schema_id in rest.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    if !script.modifies.iter().any(|s| s == schema_id) {
                        script.modifies.push(schema_id.to_string());
                    }
                }
                continue;
            }

            if trimmed.starts_with("--") && !in_block {
                match trimmed {
                    UP => {
                        flush_pending(&mut current)?;
                        section = Some(Direction::Up);
                        seen_up = true;
                    }
                    DOWN => {
                        flush_pending(&mut current)?;
                        section = Some(Direction::Down);
                    }
                    STATEMENT_BEGIN => in_block = true,
                    _ => {}
                }
                continue;
            }

            if trimmed == STATEMENT_END {
                in_block = false;
                push_statement(&mut script, section, &mut current);
                continue;
            }

            if section.is_none() || (trimmed.is_empty() && current.is_empty()) {
                continue;
            }

            current.push_str(line);
            current.push('\n');

            if !in_block && trimmed.ends_with(';') {
                push_statement(&mut script, section, &mut current);
            }
        }

        if in_block {
            return Err(MigrateError::InvalidMigration(
                "missing '-- +goose StatementEnd'".to_string(),
            ));
        }
        flush_pending(&mut current)?;
        if !seen_up {
            return Err(MigrateError::InvalidMigration(
                "no '-- +goose Up' annotation found".to_string(),
            ));
        }

        Ok(script)
    }
}

fn push_statement(script: &mut SqlScript, section: Option<Direction>, current: &mut String) {
    let statement = std::mem::take(current).trim().to_string();
    if statement.is_empty() {
        return;
    }
    match section {
        Some(Direction::Up) => script.up.push(statement),
        Some(Direction::Down) => script.down.push(statement),
        None => {}
    }
}

fn flush_pending(current: &mut String) -> Result<()> {
    if current.trim().is_empty() {
        current.clear();
        return Ok(());
    }
    Err(MigrateError::InvalidMigration(format!(
        "statement is not terminated by ';': {}",
        current.trim()
    )))
}

/// Where the body of a migration comes from.
#[derive(Clone)]
pub enum MigrationSource {
    Sql { path: PathBuf, script: SqlScript },
    Code(Arc<dyn CodeMigration>),
}

/// A versioned migration.
#[derive(Clone)]
pub struct Migration {
    pub version: i64,
    pub name: String,
    pub source: MigrationSource,
}

impl Migration {
    /// File name for SQL migrations, `<version>_<name>` for code migrations.
    pub fn display_name(&self) -> String {
        match &self.source {
            MigrationSource::Sql { path, .. } => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("{}_{}.sql", self.version, self.name)),
            MigrationSource::Code(_) => format!("{}_{}", self.version, self.name),
        }
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("name", &self.display_name())
            .finish()
    }
}

/// Split `<version>_<name>.sql` into its parts.
pub fn parse_file_name(file_name: &str) -> Result<(i64, String)> {
    let stem = file_name.strip_suffix(".sql").unwrap_or(file_name);
    let (version, name) = stem.split_once('_').unwrap_or((stem, ""));
    let version = version
        .parse::<i64>()
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| {
            MigrateError::InvalidMigration(format!(
                "migration file name must start with a positive version: {}",
                file_name
            ))
        })?;
    Ok((version, name.to_string()))
}

/// Load every SQL migration in `dir` together with the code migrations, ordered by version.
///
/// A missing directory holds no SQL migrations.
pub async fn collect_migrations(dir: &Path, code: &[Arc<dyn CodeMigration>]) -> Result<Vec<Migration>> {
    let mut migrations: BTreeMap<i64, Migration> = BTreeMap::new();
    let mut insert = |migration: Migration| -> Result<()> {
        if let Some(existing) = migrations.get(&migration.version) {
            return Err(MigrateError::InvalidMigration(format!(
                "duplicate version {} in {} and {}",
                migration.version,
                existing.display_name(),
                migration.display_name()
            )));
        }
        migrations.insert(migration.version, migration);
        Ok(())
    };

    if tokio::fs::try_exists(dir).await? {
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sql") {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let (version, name) = parse_file_name(&file_name)?;
            let content = tokio::fs::read_to_string(&path).await?;
            let script = SqlScript::parse(&content).map_err(|e| match e {
                MigrateError::InvalidMigration(message) => {
                    MigrateError::InvalidMigration(format!("{}: {}", file_name, message))
                }
                other => other,
            })?;
            insert(Migration {
                version,
                name,
                source: MigrationSource::Sql { path, script },
            })?;
        }
    }

    for migration in code {
        insert(Migration {
            version: migration.version(),
            name: migration.name().to_string(),
            source: MigrationSource::Code(migration.clone()),
        })?;
    }

    Ok(migrations.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = "\
-- +gohan modifies network, subnet
-- +goose Up
-- create the table
CREATE TABLE networks (
    id TEXT PRIMARY KEY
);
INSERT INTO networks (id) VALUES ('a');

-- +goose StatementBegin
CREATE TRIGGER t AFTER INSERT ON networks BEGIN
    SELECT 1;
END;
-- +goose StatementEnd

-- +goose Down
DROP TABLE networks;
";

    #[test]
    fn test_parse_sections() {
        let script = SqlScript::parse(SCRIPT).unwrap();
        assert_eq!(script.modifies, vec!["network", "subnet"]);
        assert_eq!(script.up.len(), 3);
        assert!(script.up[0].starts_with("CREATE TABLE networks"));
        assert_eq!(script.up[1], "INSERT INTO networks (id) VALUES ('a');");
        assert!(script.up[2].contains("SELECT 1;"));
        assert!(script.up[2].ends_with("END;"));
        assert_eq!(script.down, vec!["DROP TABLE networks;"]);
    }

    #[test]
    fn test_parse_requires_up() {
        assert!(matches!(
            SqlScript::parse("-- +goose Down\nDROP TABLE x;\n"),
            Err(MigrateError::InvalidMigration(_))
        ));
    }

    #[test]
    fn test_parse_rejects_unterminated_statement() {
        assert!(matches!(
            SqlScript::parse("-- +goose Up\nCREATE TABLE x (id TEXT)\n-- +goose Down\n"),
            Err(MigrateError::InvalidMigration(_))
        ));
        assert!(matches!(
            SqlScript::parse("-- +goose Up\n-- +goose StatementBegin\nSELECT 1;\n"),
            Err(MigrateError::InvalidMigration(_))
        ));
    }

    #[test]
    fn test_parse_file_name() {
        assert_eq!(parse_file_name("20240101120000_init.sql").unwrap(), (20240101120000, "init".to_string()));
        assert_eq!(parse_file_name("3_add_index.sql").unwrap(), (3, "add_index".to_string()));
        assert!(parse_file_name("init.sql").is_err());
        assert!(parse_file_name("0_zero.sql").is_err());
    }

    #[tokio::test]
    async fn test_collect_orders_and_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("2_second.sql"), "-- +goose Up\nSELECT 2;\n").unwrap();
        std::fs::write(dir.path().join("1_first.sql"), "-- +goose Up\nSELECT 1;\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "not a migration").unwrap();

        let migrations = collect_migrations(dir.path(), &[]).await.unwrap();
        let versions: Vec<i64> = migrations.iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![1, 2]);
        assert_eq!(migrations[0].display_name(), "1_first.sql");

        std::fs::write(dir.path().join("1_again.sql"), "-- +goose Up\nSELECT 1;\n").unwrap();
        assert!(matches!(
            collect_migrations(dir.path(), &[]).await,
            Err(MigrateError::InvalidMigration(_))
        ));
    }

    #[tokio::test]
    async fn test_collect_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let migrations = collect_migrations(&dir.path().join("absent"), &[]).await.unwrap();
        assert!(migrations.is_empty());
    }
}
