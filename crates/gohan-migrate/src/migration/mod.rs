//! Versioned schema migrations.
//!
//! Each migration runs in its own transaction. Schemas it declares as modified are recorded in
//! the [`SchemaSet`] inside that same transaction, so a rolled back migration leaves no trace.

mod source;
mod version;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

use crate::db::Database;
use crate::error::{MigrateError, Result};
use crate::schema_set::SchemaSet;

pub use source::{
    collect_migrations, parse_file_name, CodeMigration, Direction, Migration, MigrationContext,
    MigrationSource, SqlScript,
};
pub use version::{VersionRecord, VersionStore};

const TEMPLATE: &str = "\
-- +goose Up
-- SQL in section 'Up' is executed when this migration is applied
-- +gohan modifies

-- +goose Down
-- SQL section 'Down' is executed when this migration is rolled back
";

/// Sub-commands of the migration tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Up,
    UpByOne,
    UpTo(i64),
    Down,
    DownTo(i64),
    Redo,
    Status,
    Version,
    Create(String),
    CreateNext(String),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Up => "up",
            Command::UpByOne => "up-by-one",
            Command::UpTo(_) => "up-to",
            Command::Down => "down",
            Command::DownTo(_) => "down-to",
            Command::Redo => "redo",
            Command::Status => "status",
            Command::Version => "version",
            Command::Create(_) => "create",
            Command::CreateNext(_) => "create-next",
        }
    }
}

/// Applied state of one migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub version: i64,
    pub name: String,
    /// `None` while pending.
    pub applied_at: Option<String>,
}

/// Outcome of a command, printed by the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    Migrated(i64),
    Status(Vec<MigrationStatus>),
    Version(i64),
    Created(PathBuf),
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Report::Migrated(version) => write!(f, "current version: {}", version),
            Report::Version(version) => write!(f, "version {}", version),
            Report::Created(path) => write!(f, "created new file: {}", path.display()),
            Report::Status(statuses) => {
                writeln!(f, "    Applied At                  Migration")?;
                writeln!(f, "    =======================================")?;
                for status in statuses {
                    let applied = status.applied_at.as_deref().unwrap_or("Pending");
                    writeln!(f, "    {:<24} -- {}", applied, status.name)?;
                }
                Ok(())
            }
        }
    }
}

/// Runs migration commands against one database.
pub struct Migrator {
    db: Database,
    dir: PathBuf,
    code: Vec<Arc<dyn CodeMigration>>,
    versions: VersionStore,
}

impl Migrator {
    pub fn new(db: Database, dir: impl Into<PathBuf>) -> Self {
        Self {
            versions: VersionStore::new(db.clone()),
            db,
            dir: dir.into(),
            code: Vec::new(),
        }
    }

    pub fn with_code_migrations(mut self, code: Vec<Arc<dyn CodeMigration>>) -> Self {
        self.code = code;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn versions(&self) -> &VersionStore {
        &self.versions
    }

    pub async fn migrations(&self) -> Result<Vec<Migration>> {
        collect_migrations(&self.dir, &self.code).await
    }

    /// Execute `command`, marking modified schemas in `schemas`.
    #[instrument(skip(self, schemas), fields(command = command.name()))]
    pub async fn run(&self, command: &Command, schemas: &mut SchemaSet) -> Result<Report> {
        match command {
            Command::Create(name) => {
                let version: i64 = Utc::now()
                    .format("%Y%m%d%H%M%S")
                    .to_string()
                    .parse()
                    .map_err(|e| MigrateError::InvalidMigration(format!("bad timestamp version: {}", e)))?;
                return self.create(name, version).await.map(Report::Created);
            }
            Command::CreateNext(name) => {
                let last = self.migrations().await?.last().map(|m| m.version).unwrap_or(0);
                return self.create(name, last + 1).await.map(Report::Created);
            }
            _ => {}
        }

        let lock = self.db.lock_migrations().await?;
        let result = self.run_locked(command, schemas).await;
        let released = lock.release().await;
        let report = result?;
        released?;
        Ok(report)
    }

    async fn run_locked(&self, command: &Command, schemas: &mut SchemaSet) -> Result<Report> {
        let current = self.versions.ensure().await?;
        let migrations = self.migrations().await?;
        debug!("database version {}, {} migration(s) found", current, migrations.len());

        match command {
            Command::Up => self.up_to(&migrations, current, i64::MAX, schemas).await,
            Command::UpTo(target) => self.up_to(&migrations, current, *target, schemas).await,
            Command::UpByOne => {
                let next = migrations
                    .iter()
                    .find(|m| m.version > current)
                    .ok_or_else(|| MigrateError::MigrationFailed("no next version found".to_string()))?;
                self.apply(next, Direction::Up, schemas).await?;
                Ok(Report::Migrated(next.version))
            }
            Command::Down => {
                self.down_one(&migrations, current, schemas).await?;
                Ok(Report::Migrated(self.versions.current_version().await?))
            }
            Command::DownTo(target) => {
                let mut current = current;
                while current > *target {
                    self.down_one(&migrations, current, schemas).await?;
                    current = self.versions.current_version().await?;
                }
                info!("no migrations to run. current version: {}", current);
                Ok(Report::Migrated(current))
            }
            Command::Redo => {
                let migration = self.down_one(&migrations, current, schemas).await?;
                self.apply(migration, Direction::Up, schemas).await?;
                Ok(Report::Migrated(migration.version))
            }
            Command::Status => self.status(&migrations).await.map(Report::Status),
            Command::Version => Ok(Report::Version(current)),
            Command::Create(_) | Command::CreateNext(_) => Err(MigrateError::InvalidMigration(format!(
                "'{}' does not run against the database",
                command.name()
            ))),
        }
    }

    async fn up_to(
        &self,
        migrations: &[Migration],
        current: i64,
        target: i64,
        schemas: &mut SchemaSet,
    ) -> Result<Report> {
        let mut version = current;
        for migration in migrations.iter().filter(|m| m.version > current && m.version <= target) {
            self.apply(migration, Direction::Up, schemas).await?;
            version = migration.version;
        }
        info!("no migrations to run. current version: {}", version);
        Ok(Report::Migrated(version))
    }

    async fn down_one<'m>(
        &self,
        migrations: &'m [Migration],
        current: i64,
        schemas: &mut SchemaSet,
    ) -> Result<&'m Migration> {
        if current == 0 {
            return Err(MigrateError::MigrationFailed("no migration to roll back".to_string()));
        }
        let migration = migrations
            .iter()
            .find(|m| m.version == current)
            .ok_or_else(|| {
                MigrateError::MigrationFailed(format!("no migration found for version {}", current))
            })?;
        self.apply(migration, Direction::Down, schemas).await?;
        Ok(migration)
    }

    async fn status(&self, migrations: &[Migration]) -> Result<Vec<MigrationStatus>> {
        let history = self.versions.history().await?;
        Ok(migrations
            .iter()
            .map(|migration| MigrationStatus {
                version: migration.version,
                name: migration.display_name(),
                applied_at: history
                    .iter()
                    .find(|record| record.version_id == migration.version)
                    .filter(|record| record.is_applied)
                    .map(|record| record.tstamp.clone().unwrap_or_default()),
            })
            .collect())
    }

    /// Run one migration in its own transaction.
    async fn apply(&self, migration: &Migration, direction: Direction, schemas: &mut SchemaSet) -> Result<()> {
        let name = migration.display_name();
        let failed = |e: MigrateError| MigrateError::MigrationFailed(format!("{} ({}): {}", name, direction, e));

        let mut tx = self.db.begin().await?;
        let mut ctx = MigrationContext::default();

        match &migration.source {
            MigrationSource::Sql { script, .. } => {
                for statement in script.statements(direction) {
                    sqlx::raw_sql(statement)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| failed(e.into()))?;
                }
                for schema_id in &script.modifies {
                    ctx.mark_schema_modified(schema_id.clone());
                }
            }
            MigrationSource::Code(code) => {
                let outcome = match direction {
                    Direction::Up => code.up(&mut tx, &mut ctx).await,
                    Direction::Down => code.down(&mut tx, &mut ctx).await,
                };
                outcome.map_err(failed)?;
            }
        }

        for schema_id in ctx.modified_schemas() {
            schemas.mark(schema_id, &mut tx).await?;
        }
        version::record(&mut tx, migration.version, direction == Direction::Up).await?;
        tx.commit().await?;

        info!("OK    {} ({})", name, direction);
        Ok(())
    }

    /// Write a new SQL migration from the template.
    async fn create(&self, name: &str, version: i64) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(MigrateError::InvalidMigration(format!("invalid migration name: '{}'", name)));
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!("{}_{}.sql", version, name));
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        file.write_all(TEMPLATE.as_bytes()).await?;
        file.flush().await?;
        info!("Created new file: {}", path.display());
        Ok(path)
    }

    /// Fail when the database is behind the newest migration.
    pub async fn check_no_pending(&self) -> Result<()> {
        let current = self.versions.ensure().await?;
        let last = self.migrations().await?.last().map(|m| m.version).unwrap_or(0);
        info!("database version: {}; last migration: {}", current, last);
        if current != last {
            return Err(MigrateError::MigrationFailed(format!(
                "there are pending migrations (no_init=true); db version={}; last migration={}",
                current, last
            )));
        }
        Ok(())
    }

    /// Prepare the version table and report the status. With `no_init`, pending migrations are an
    /// error.
    pub async fn init(&self, no_init: bool) -> Result<Report> {
        let version = self.versions.ensure().await?;
        info!("migration path: {}, version: {}", self.dir.display(), version);
        if no_init {
            self.check_no_pending().await?;
        }
        let migrations = self.migrations().await?;
        self.status(&migrations).await.map(Report::Status)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use sqlx::AnyConnection;

    use super::*;
    use crate::db::DbType;
    use crate::schema_set::{SchemaSetBackend, SqlSchemaSetBackend};

    struct Fixture {
        _dir: tempfile::TempDir,
        migrations: PathBuf,
        db: Database,
        schemas: SchemaSet,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let migrations = dir.path().join("migrations");
        std::fs::create_dir_all(&migrations).unwrap();
        let path = dir.path().join("migrate.db");
        let db = Database::connect(DbType::Sqlite3, path.to_str().unwrap(), 2).await.unwrap();
        let backend: Arc<dyn SchemaSetBackend> = Arc::new(SqlSchemaSetBackend::new(db.pool().clone()));
        let mut schemas = SchemaSet::new();
        schemas.init(Some(backend)).await.unwrap();
        Fixture {
            _dir: dir,
            migrations,
            db,
            schemas,
        }
    }

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    async fn table_exists(db: &Database, table: &str) -> bool {
        sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_optional(db.pool())
            .await
            .unwrap()
            .is_some()
    }

    fn sorted(mut ids: Vec<String>) -> Vec<String> {
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_up_marks_modified_schemas() {
        let mut fx = fixture().await;
        write(
            &fx.migrations,
            "1_networks.sql",
            "-- +gohan modifies network, subnet\n-- +goose Up\nCREATE TABLE networks (id TEXT);\n-- +goose Down\nDROP TABLE networks;\n",
        );
        write(
            &fx.migrations,
            "2_ports.sql",
            "-- +goose Up\nCREATE TABLE ports (id TEXT);\n-- +goose Down\nDROP TABLE ports;\n",
        );
        let migrator = Migrator::new(fx.db.clone(), &fx.migrations);

        let report = migrator.run(&Command::Up, &mut fx.schemas).await.unwrap();
        assert_eq!(report, Report::Migrated(2));
        assert!(table_exists(&fx.db, "networks").await);
        assert!(table_exists(&fx.db, "ports").await);
        assert_eq!(sorted(fx.schemas.ids()), vec!["network", "subnet"]);

        let report = migrator.run(&Command::Version, &mut fx.schemas).await.unwrap();
        assert_eq!(report, Report::Version(2));
    }

    #[tokio::test]
    async fn test_failed_migration_rolls_back() {
        let mut fx = fixture().await;
        write(
            &fx.migrations,
            "1_broken.sql",
            "-- +gohan modifies network\n-- +goose Up\nCREATE TABLE networks (id TEXT);\nINSERT INTO missing_table VALUES (1);\n",
        );
        let migrator = Migrator::new(fx.db.clone(), &fx.migrations);

        let err = migrator.run(&Command::Up, &mut fx.schemas).await.unwrap_err();
        assert!(matches!(err, MigrateError::MigrationFailed(_)));
        assert!(!table_exists(&fx.db, "networks").await);
        assert_eq!(migrator.versions().current_version().await.unwrap(), 0);

        let backend: Arc<dyn SchemaSetBackend> = Arc::new(SqlSchemaSetBackend::new(fx.db.pool().clone()));
        fx.schemas.init(Some(backend)).await.unwrap();
        assert!(fx.schemas.ids().is_empty());
    }

    #[tokio::test]
    async fn test_up_by_one_down_and_redo() {
        let mut fx = fixture().await;
        write(&fx.migrations, "1_a.sql", "-- +goose Up\nCREATE TABLE a (id TEXT);\n-- +goose Down\nDROP TABLE a;\n");
        write(&fx.migrations, "2_b.sql", "-- +goose Up\nCREATE TABLE b (id TEXT);\n-- +goose Down\nDROP TABLE b;\n");
        let migrator = Migrator::new(fx.db.clone(), &fx.migrations);

        assert_eq!(migrator.run(&Command::UpByOne, &mut fx.schemas).await.unwrap(), Report::Migrated(1));
        assert!(!table_exists(&fx.db, "b").await);
        assert_eq!(migrator.run(&Command::UpTo(2), &mut fx.schemas).await.unwrap(), Report::Migrated(2));
        assert!(matches!(
            migrator.run(&Command::UpByOne, &mut fx.schemas).await,
            Err(MigrateError::MigrationFailed(_))
        ));

        assert_eq!(migrator.run(&Command::Redo, &mut fx.schemas).await.unwrap(), Report::Migrated(2));
        assert!(table_exists(&fx.db, "b").await);

        assert_eq!(migrator.run(&Command::Down, &mut fx.schemas).await.unwrap(), Report::Migrated(1));
        assert!(!table_exists(&fx.db, "b").await);

        assert_eq!(migrator.run(&Command::DownTo(0), &mut fx.schemas).await.unwrap(), Report::Migrated(0));
        assert!(!table_exists(&fx.db, "a").await);
        assert!(matches!(
            migrator.run(&Command::Down, &mut fx.schemas).await,
            Err(MigrateError::MigrationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_status() {
        let mut fx = fixture().await;
        write(&fx.migrations, "1_a.sql", "-- +goose Up\nCREATE TABLE a (id TEXT);\n");
        write(&fx.migrations, "2_b.sql", "-- +goose Up\nCREATE TABLE b (id TEXT);\n");
        let migrator = Migrator::new(fx.db.clone(), &fx.migrations);
        migrator.run(&Command::UpByOne, &mut fx.schemas).await.unwrap();

        let Report::Status(statuses) = migrator.run(&Command::Status, &mut fx.schemas).await.unwrap() else {
            panic!("expected a status report");
        };
        assert_eq!(statuses.len(), 2);
        assert!(statuses[0].applied_at.is_some());
        assert_eq!(statuses[1].name, "2_b.sql");
        assert_eq!(statuses[1].applied_at, None);

        let printed = Report::Status(statuses).to_string();
        assert!(printed
            .lines()
            .any(|line| line.trim_start().starts_with("Pending") && line.ends_with("-- 2_b.sql")));
    }

    #[tokio::test]
    async fn test_create_and_create_next() {
        let mut fx = fixture().await;
        let migrator = Migrator::new(fx.db.clone(), &fx.migrations);

        let Report::Created(first) = migrator
            .run(&Command::CreateNext("init".to_string()), &mut fx.schemas)
            .await
            .unwrap()
        else {
            panic!("expected a created file");
        };
        assert_eq!(first.file_name().unwrap(), "1_init.sql");

        let Report::Created(second) = migrator
            .run(&Command::CreateNext("more".to_string()), &mut fx.schemas)
            .await
            .unwrap()
        else {
            panic!("expected a created file");
        };
        assert_eq!(second.file_name().unwrap(), "2_more.sql");

        let Report::Created(stamped) = migrator
            .run(&Command::Create("stamped".to_string()), &mut fx.schemas)
            .await
            .unwrap()
        else {
            panic!("expected a created file");
        };
        let (version, name) = parse_file_name(&stamped.file_name().unwrap().to_string_lossy()).unwrap();
        assert!(version > 20_000_000_000_000);
        assert_eq!(name, "stamped");

        // Templates are valid, empty migrations.
        let migrations = migrator.migrations().await.unwrap();
        assert_eq!(migrations.len(), 3);
        assert_eq!(migrator.run(&Command::Up, &mut fx.schemas).await.unwrap(), Report::Migrated(version));
        assert!(fx.schemas.ids().is_empty());

        assert!(migrator
            .run(&Command::Create("bad/name".to_string()), &mut fx.schemas)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_check_no_pending() {
        let mut fx = fixture().await;
        write(&fx.migrations, "1_a.sql", "-- +goose Up\nCREATE TABLE a (id TEXT);\n");
        let migrator = Migrator::new(fx.db.clone(), &fx.migrations);

        assert!(matches!(migrator.init(true).await, Err(MigrateError::MigrationFailed(_))));
        assert!(migrator.init(false).await.is_ok());
        migrator.run(&Command::Up, &mut fx.schemas).await.unwrap();
        migrator.check_no_pending().await.unwrap();
    }

    struct SeedNetworks;

    #[async_trait]
    impl CodeMigration for SeedNetworks {
        fn version(&self) -> i64 {
            2
        }

        fn name(&self) -> &str {
            "seed_networks"
        }

        async fn up(&self, conn: &mut AnyConnection, ctx: &mut MigrationContext) -> Result<()> {
            sqlx::query("INSERT INTO networks (id) VALUES ('default')")
                .execute(conn)
                .await?;
            ctx.mark_schema_modified("network");
            Ok(())
        }

        async fn down(&self, conn: &mut AnyConnection, _ctx: &mut MigrationContext) -> Result<()> {
            sqlx::query("DELETE FROM networks WHERE id = 'default'")
                .execute(conn)
                .await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_code_migration() {
        let mut fx = fixture().await;
        write(&fx.migrations, "1_networks.sql", "-- +goose Up\nCREATE TABLE networks (id TEXT);\n");
        let migrator = Migrator::new(fx.db.clone(), &fx.migrations)
            .with_code_migrations(vec![Arc::new(SeedNetworks)]);

        assert_eq!(migrator.run(&Command::Up, &mut fx.schemas).await.unwrap(), Report::Migrated(2));
        assert_eq!(fx.schemas.ids(), vec!["network"]);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM networks")
            .fetch_one(fx.db.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
