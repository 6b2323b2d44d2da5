use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use gohan_sync_etcd::{SyncConfig, SyncType, DEFAULT_LOCK_TTL, DEFAULT_TIMEOUT};
use serde::Deserialize;
use tracing::debug;

use crate::db::DbType;
use crate::error::{MigrateError, Result};
use crate::migration::Command;
use crate::runner::RunOptions;
use crate::sync_writer::SyncWriterConfig;

/// Command line of the gohan-migrate binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "gohan-migrate")]
#[command(about = "Cluster-safe database migrations for gohan")]
pub struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "gohan.yaml", env = "GOHAN_CONFIG_FILE")]
    pub config_file: PathBuf,

    #[command(subcommand)]
    pub command: MigrateCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum MigrateCommand {
    /// Migrate the database to the most recent version
    Up {
        #[command(flatten)]
        post: PostMigrationArgs,
    },
    /// Migrate the database up by one version
    UpByOne {
        #[command(flatten)]
        post: PostMigrationArgs,
    },
    /// Migrate the database up to a specific version
    UpTo {
        version: i64,
        #[command(flatten)]
        post: PostMigrationArgs,
    },
    /// Roll back the version by one
    Down {
        #[command(flatten)]
        lock: LockArgs,
    },
    /// Roll back to a specific version
    DownTo {
        version: i64,
        #[command(flatten)]
        lock: LockArgs,
    },
    /// Re-run the latest migration
    Redo {
        #[command(flatten)]
        lock: LockArgs,
    },
    /// Dump the migration status of the database
    Status {
        #[command(flatten)]
        lock: LockArgs,
    },
    /// Print the current version of the database
    Version {
        #[command(flatten)]
        lock: LockArgs,
    },
    /// Create a timestamped migration file
    Create { name: String },
    /// Create a migration file numbered after the last one
    CreateNext { name: String },
}

#[derive(Args, Debug, Clone, Default)]
pub struct LockArgs {
    /// Hold the cluster-wide migration lock while running
    #[arg(long)]
    pub lock_with_etcd: bool,
}

#[derive(Args, Debug, Clone)]
pub struct PostMigrationArgs {
    #[command(flatten)]
    pub lock: LockArgs,

    /// Run the post-migration handlers of modified schemas
    #[arg(long)]
    pub emit_post_migration_event: bool,

    /// Comma separated schema IDs to notify instead of the modified ones
    #[arg(long, default_value = "")]
    pub forced_schemas: String,

    /// Budget of all post-migration handlers together
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub post_migration_event_timeout: Duration,

    /// Publish the event journal to etcd after the handlers ran
    #[arg(long)]
    pub sync_etcd_event: bool,
}

impl MigrateCommand {
    /// Split into the migration command and the runner options.
    pub fn into_parts(self) -> (Command, RunOptions) {
        match self {
            MigrateCommand::Up { post } => (Command::Up, post.into()),
            MigrateCommand::UpByOne { post } => (Command::UpByOne, post.into()),
            MigrateCommand::UpTo { version, post } => (Command::UpTo(version), post.into()),
            MigrateCommand::Down { lock } => (Command::Down, lock.into()),
            MigrateCommand::DownTo { version, lock } => (Command::DownTo(version), lock.into()),
            MigrateCommand::Redo { lock } => (Command::Redo, lock.into()),
            MigrateCommand::Status { lock } => (Command::Status, lock.into()),
            MigrateCommand::Version { lock } => (Command::Version, lock.into()),
            MigrateCommand::Create { name } => (Command::Create(name), RunOptions::default()),
            MigrateCommand::CreateNext { name } => (Command::CreateNext(name), RunOptions::default()),
        }
    }
}

impl From<LockArgs> for RunOptions {
    fn from(args: LockArgs) -> Self {
        Self {
            lock_with_etcd: args.lock_with_etcd,
            ..Default::default()
        }
    }
}

impl From<PostMigrationArgs> for RunOptions {
    fn from(args: PostMigrationArgs) -> Self {
        Self {
            lock_with_etcd: args.lock.lock_with_etcd,
            emit_post_migration_event: args.emit_post_migration_event,
            forced_schemas: args.forced_schemas,
            post_migration_event_timeout: args.post_migration_event_timeout,
            sync_etcd_event: args.sync_etcd_event,
        }
    }
}

fn default_migrations() -> PathBuf {
    PathBuf::from("etc/db/migrations")
}

fn default_max_open_conn() -> u32 {
    10
}

fn default_endpoints() -> Vec<String> {
    vec!["localhost:2379".to_string()]
}

fn default_etcd_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_etcd_lock_ttl() -> Duration {
    DEFAULT_LOCK_TTL
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatabaseConfig {
    #[serde(rename = "type", default)]
    pub db_type: DbType,
    #[serde(default)]
    pub connection: String,
    #[serde(default = "default_migrations")]
    pub migrations: PathBuf,
    /// Refuse to start while migrations are pending.
    #[serde(default)]
    pub no_init: bool,
    #[serde(default = "default_max_open_conn")]
    pub max_open_conn: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_type: DbType::default(),
            connection: String::new(),
            migrations: default_migrations(),
            no_init: false,
            max_open_conn: default_max_open_conn(),
        }
    }
}

/// Configuration file of a gohan node, reduced to the keys migrations need.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Schema files, in load order.
    #[serde(default)]
    pub schemas: Option<Vec<PathBuf>>,
    #[serde(default)]
    pub sync: SyncType,
    #[serde(default = "default_endpoints")]
    pub etcd: Vec<String>,
    #[serde(default = "default_etcd_timeout", with = "humantime_serde")]
    pub etcd_timeout: Duration,
    #[serde(default = "default_etcd_lock_ttl", with = "humantime_serde")]
    pub etcd_lock_ttl: Duration,
    #[serde(default)]
    pub sync_writer: SyncWriterConfig,
}

impl Config {
    /// Parse a configuration document (YAML or JSON).
    pub fn parse(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| MigrateError::Config(format!("invalid configuration: {}", e)))
    }

    /// Load `path` and change the working directory to its directory, so relative paths of the
    /// configuration resolve against it.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MigrateError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::parse(&content)?;

        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::env::set_current_dir(dir).map_err(|e| {
                MigrateError::Config(format!("failed to enter {}: {}", dir.display(), e))
            })?;
            debug!("working directory: {}", dir.display());
        }
        Ok(config)
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            sync_type: self.sync,
            endpoints: self.etcd.clone(),
            timeout: self.etcd_timeout,
            lock_ttl: self.etcd_lock_ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse("database:\n  connection: gohan.db\n").unwrap();
        assert_eq!(config.database.db_type, DbType::Sqlite3);
        assert_eq!(config.database.migrations, PathBuf::from("etc/db/migrations"));
        assert!(!config.database.no_init);
        assert!(config.schemas.is_none());
        assert_eq!(config.sync, SyncType::Etcdv3);
        assert_eq!(config.etcd, vec!["localhost:2379"]);
        assert_eq!(config.etcd_timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.etcd_lock_ttl, DEFAULT_LOCK_TTL);
        assert_eq!(config.sync_writer, SyncWriterConfig::default());
    }

    #[test]
    fn test_full_configuration() {
        let config = Config::parse(
            r#"
database:
  type: mysql
  connection: "root:secret@tcp(db:3306)/gohan"
  migrations: db/migrations
  no_init: true
schemas:
  - schema/core.yaml
  - schema/extra.json
sync: memory
etcd:
  - http://etcd-1:2379
  - http://etcd-2:2379
etcd_timeout: 2s
etcd_lock_ttl: 30s
sync_writer:
  backoff: 1s
  unlock: 500ms
"#,
        )
        .unwrap();

        assert_eq!(config.database.db_type, DbType::Mysql);
        assert!(config.database.no_init);
        assert_eq!(config.schemas.as_ref().map(Vec::len), Some(2));
        assert_eq!(config.sync_writer.backoff, Duration::from_secs(1));
        assert_eq!(config.sync_writer.unlock_timeout, Duration::from_millis(500));

        let sync = config.sync_config();
        assert_eq!(sync.sync_type, SyncType::Memory);
        assert_eq!(sync.endpoints.len(), 2);
        assert_eq!(sync.timeout, Duration::from_secs(2));
        assert_eq!(sync.lock_ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_configuration() {
        assert!(matches!(Config::parse("sync: zookeeper\n"), Err(MigrateError::Config(_))));
        assert!(matches!(
            Config::load(Path::new("/nonexistent/gohan.yaml")),
            Err(MigrateError::Config(_))
        ));
    }

    #[test]
    fn test_cli_up_options() {
        let cli = Cli::try_parse_from([
            "gohan-migrate",
            "--config-file",
            "/etc/gohan.yaml",
            "up",
            "--lock-with-etcd",
            "--emit-post-migration-event",
            "--forced-schemas",
            "network,subnet",
            "--post-migration-event-timeout",
            "1m",
        ])
        .unwrap();
        assert_eq!(cli.config_file, PathBuf::from("/etc/gohan.yaml"));

        let (command, options) = cli.command.into_parts();
        assert_eq!(command, Command::Up);
        assert!(options.lock_with_etcd);
        assert!(options.emit_post_migration_event);
        assert!(!options.sync_etcd_event);
        assert_eq!(options.forced_schemas, "network,subnet");
        assert_eq!(options.post_migration_event_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_cli_commands() {
        let cli = Cli::try_parse_from(["gohan-migrate", "up-to", "20240101000000"]).unwrap();
        let (command, options) = cli.command.into_parts();
        assert_eq!(command, Command::UpTo(20240101000000));
        assert_eq!(options.post_migration_event_timeout, Duration::from_secs(30));

        let cli = Cli::try_parse_from(["gohan-migrate", "down-to", "3", "--lock-with-etcd"]).unwrap();
        let (command, options) = cli.command.into_parts();
        assert_eq!(command, Command::DownTo(3));
        assert!(options.lock_with_etcd);
        assert!(!options.emit_post_migration_event);

        let cli = Cli::try_parse_from(["gohan-migrate", "create-next", "add_ports"]).unwrap();
        assert_eq!(cli.command.into_parts().0, Command::CreateNext("add_ports".to_string()));

        // Post-migration flags belong to the up family only.
        assert!(Cli::try_parse_from(["gohan-migrate", "down", "--emit-post-migration-event"]).is_err());
        assert!(Cli::try_parse_from(["gohan-migrate", "create", "x", "--lock-with-etcd"]).is_err());
    }
}
