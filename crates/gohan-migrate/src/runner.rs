//! Guarded execution of migration commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use gohan_sync_core::{with_lock, SyncBackend};
use gohan_sync_etcd::create_from_config;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::Database;
use crate::error::{MigrateError, Result};
use crate::extension::{HandlerRegistry, IdentityService, NoopIdentityService};
use crate::migration::{CodeMigration, Command, Migrator, Report};
use crate::post_migration::{EmitOptions, PostMigrationEmitter};
use crate::schema_set::{SchemaSet, SchemaSetBackend, SqlSchemaSetBackend};

/// Cluster-wide lock serialising migrations.
pub const MIGRATIONS_LOCK_PATH: &str = "/gohan/cluster/migrations";

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub lock_with_etcd: bool,
    pub emit_post_migration_event: bool,
    pub forced_schemas: String,
    pub post_migration_event_timeout: Duration,
    pub sync_etcd_event: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            lock_with_etcd: false,
            emit_post_migration_event: false,
            forced_schemas: String::new(),
            post_migration_event_timeout: Duration::from_secs(30),
            sync_etcd_event: false,
        }
    }
}

/// Restores the working directory when dropped.
struct CwdGuard {
    saved: PathBuf,
}

impl CwdGuard {
    fn save() -> Result<Self> {
        Ok(Self {
            saved: std::env::current_dir()?,
        })
    }
}

impl Drop for CwdGuard {
    fn drop(&mut self) {
        if let Err(e) = std::env::set_current_dir(&self.saved) {
            warn!("failed to restore working directory {}: {}", self.saved.display(), e);
        }
    }
}

/// Runs migration commands, optionally under [`MIGRATIONS_LOCK_PATH`], and emits the
/// post-migration event.
pub struct Runner {
    handlers: Arc<HandlerRegistry>,
    code_migrations: Vec<Arc<dyn CodeMigration>>,
    identity_service: Arc<dyn IdentityService>,
    sync: Option<Arc<dyn SyncBackend>>,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new(HandlerRegistry::new())
    }
}

impl Runner {
    pub fn new(handlers: HandlerRegistry) -> Self {
        Self {
            handlers: Arc::new(handlers),
            code_migrations: Vec::new(),
            identity_service: Arc::new(NoopIdentityService),
            sync: None,
        }
    }

    pub fn with_code_migrations(mut self, code_migrations: Vec<Arc<dyn CodeMigration>>) -> Self {
        self.code_migrations = code_migrations;
        self
    }

    pub fn with_identity_service(mut self, identity_service: Arc<dyn IdentityService>) -> Self {
        self.identity_service = identity_service;
        self
    }

    /// Use `sync` instead of building a backend from the configuration. The runner does not
    /// close it.
    pub fn with_sync_backend(mut self, sync: Arc<dyn SyncBackend>) -> Self {
        self.sync = Some(sync);
        self
    }

    /// Run `command` against the database of `config_file`.
    ///
    /// The working directory, the cluster lock and the MySQL migration lock are released on every
    /// exit path. The schema-modification set is read once the lock is held, so a schema
    /// another node already handled is not handled again.
    pub async fn run_guarded(&self, config_file: &Path, command: &Command, options: &RunOptions) -> Result<Report> {
        let _cwd = CwdGuard::save()?;
        let config = Config::load(config_file)?;
        let (db, migrator) = self.open(&config).await?;

        if !options.lock_with_etcd {
            let mut schemas = load_schemas(&db).await?;
            let report = migrator.run(command, &mut schemas).await?;
            if options.emit_post_migration_event {
                let sync = self.sync_backend(&config)?;
                let result = self.emit(&config, db, sync.clone(), &mut schemas, options).await;
                self.release(sync).await;
                result?;
            }
            return Ok(report);
        }

        let sync = self.sync_backend(&config)?;
        let cancel = CancellationToken::new();
        let result = {
            let (config, migrator) = (&config, &migrator);
            let emit_sync = sync.clone();
            with_lock(sync.as_ref(), &cancel, MIGRATIONS_LOCK_PATH, true, move |_token| async move {
                info!("Holding {} for {}", MIGRATIONS_LOCK_PATH, command.name());
                let mut schemas = load_schemas(&db).await?;
                let report = migrator.run(command, &mut schemas).await?;
                if options.emit_post_migration_event {
                    self.emit(config, db, emit_sync, &mut schemas, options).await?;
                }
                Ok::<_, MigrateError>(report)
            })
            .await
        };
        self.release(sync).await;
        result
    }

    /// Prepare the version table of `config_file`'s database and report its status.
    ///
    /// With `database.no_init`, pending migrations are an error.
    pub async fn init_database(&self, config_file: &Path) -> Result<Report> {
        let _cwd = CwdGuard::save()?;
        let config = Config::load(config_file)?;
        let (_, migrator) = self.open(&config).await?;
        migrator.init(config.database.no_init).await
    }

    fn sync_backend(&self, config: &Config) -> Result<Arc<dyn SyncBackend>> {
        match &self.sync {
            Some(sync) => Ok(sync.clone()),
            None => Ok(create_from_config(&config.sync_config())?),
        }
    }

    /// Close `sync` unless it was injected.
    async fn release(&self, sync: Arc<dyn SyncBackend>) {
        if self.sync.is_none() {
            sync.close().await;
        }
    }

    async fn open(&self, config: &Config) -> Result<(Database, Migrator)> {
        let db = Database::connect(
            config.database.db_type,
            &config.database.connection,
            config.database.max_open_conn,
        )
        .await?;

        let migrator = Migrator::new(db.clone(), &config.database.migrations)
            .with_code_migrations(self.code_migrations.clone());
        Ok((db, migrator))
    }

    async fn emit(
        &self,
        config: &Config,
        db: Database,
        sync: Arc<dyn SyncBackend>,
        schemas: &mut SchemaSet,
        options: &RunOptions,
    ) -> Result<()> {
        let mut emitter = PostMigrationEmitter::new(db, sync, self.handlers.clone())
            .with_identity_service(self.identity_service.clone())
            .with_sync_writer_config(config.sync_writer.clone());
        let options = EmitOptions {
            forced_schemas: options.forced_schemas.clone(),
            sync_event: options.sync_etcd_event,
            event_timeout: options.post_migration_event_timeout,
        };
        emitter.emit(schemas, config.schemas.as_deref(), &options).await
    }
}

/// Read the persisted schema-modification set.
async fn load_schemas(db: &Database) -> Result<SchemaSet> {
    let backend: Arc<dyn SchemaSetBackend> = Arc::new(SqlSchemaSetBackend::new(db.pool().clone()));
    let mut schemas = SchemaSet::new();
    schemas.init(Some(backend)).await?;
    Ok(schemas)
}
