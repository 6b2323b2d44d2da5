use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gohan_sync_core::SyncBackend;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::{MigrateError, Result};
use crate::extension::{
    Environment, EnvironmentManager, EventContext, HandlerRegistry, IdentityService, NativeEnvironment,
    NoopIdentityService, EVENT_POST_MIGRATION,
};
use crate::schema::SchemaRegistry;
use crate::schema_set::SchemaSet;
use crate::sync_writer::{SyncWriter, SyncWriterConfig};

const ENVIRONMENT_NAME: &str = "post-migration";

/// Options of one post-migration run.
#[derive(Debug, Clone)]
pub struct EmitOptions {
    /// Comma separated schema IDs replacing the pending set.
    pub forced_schemas: String,
    /// Publish the event journal to the sync backend once handlers ran.
    pub sync_event: bool,
    /// Budget of all handlers together.
    pub event_timeout: Duration,
}

impl Default for EmitOptions {
    fn default() -> Self {
        Self {
            forced_schemas: String::new(),
            sync_event: false,
            event_timeout: Duration::from_secs(30),
        }
    }
}

/// Schemas to notify: the forced list when given, the pending set otherwise.
pub fn select_modified_schemas(forced_schemas: &str, schemas: &SchemaSet) -> Vec<String> {
    if forced_schemas.is_empty() {
        return schemas.ids();
    }
    forced_schemas
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

/// Dispatches the `post-migration` event to every dirty schema.
pub struct PostMigrationEmitter {
    db: Database,
    sync: Arc<dyn SyncBackend>,
    identity_service: Arc<dyn IdentityService>,
    handlers: Arc<HandlerRegistry>,
    environments: EnvironmentManager,
    sync_writer: SyncWriterConfig,
    cancel: CancellationToken,
}

impl PostMigrationEmitter {
    pub fn new(db: Database, sync: Arc<dyn SyncBackend>, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            db,
            sync,
            identity_service: Arc::new(NoopIdentityService),
            handlers,
            environments: EnvironmentManager::new(),
            sync_writer: SyncWriterConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_identity_service(mut self, identity_service: Arc<dyn IdentityService>) -> Self {
        self.identity_service = identity_service;
        self
    }

    pub fn with_sync_writer_config(mut self, config: SyncWriterConfig) -> Self {
        self.sync_writer = config;
        self
    }

    /// Token handed to handlers as their `context`.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the handlers of every dirty schema, serially and in registry order.
    ///
    /// A schema leaves `schemas` only once its handlers succeeded. The first failure stops the
    /// run and leaves it and every later schema pending.
    pub async fn emit(
        &mut self,
        schemas: &mut SchemaSet,
        schema_files: Option<&[PathBuf]>,
        options: &EmitOptions,
    ) -> Result<()> {
        info!("Emit post-migrate event");

        let modified = select_modified_schemas(&options.forced_schemas, schemas);
        if modified.is_empty() {
            info!("No modified schemas, skipping post-migration event");
            return Ok(());
        }
        debug!("Modified schemas: {}", modified.join(", "));

        let schema_files = schema_files
            .ok_or_else(|| MigrateError::Config("No schema specified in configuration".to_string()))?;
        let registry = SchemaRegistry::load_files(schema_files).await?;

        let deadline = Instant::now() + options.event_timeout;

        for schema in registry.schemas() {
            if !modified.contains(&schema.id) {
                continue;
            }

            if !self.environments.contains(&schema.id) {
                let now = Instant::now();
                if now >= deadline {
                    return Err(MigrateError::PostMigrationTimeout(options.event_timeout));
                }
                let plural_url = schema.plural_url();
                info!("Loading environment for {} schema with URL: {}", schema.id, plural_url);

                let mut env = NativeEnvironment::new(ENVIRONMENT_NAME, self.handlers.clone());
                env.set_event_time_limit(EVENT_POST_MIGRATION, deadline - now);
                env.load_extensions_for_path(registry.extensions(), &plural_url)
                    .map_err(|e| MigrateError::Extension(format!("[{}] {}", plural_url, e)))?;
                self.environments.register(&schema.id, Box::new(env))?;
            }

            let env = self.environments.get(&schema.id).ok_or_else(|| {
                MigrateError::Extension(format!("no environment for schema {}", schema.id))
            })?;
            let ctx = EventContext::new(
                schema.clone(),
                self.sync.clone(),
                self.db.clone(),
                self.identity_service.clone(),
                self.cancel.child_token(),
            );

            if let Err(err) = env.handle_event(EVENT_POST_MIGRATION, ctx).await {
                return Err(with_pending(err, schemas));
            }
            schemas.remove(&schema.id).await?;
        }

        for schema_id in &modified {
            if registry.schema(schema_id).is_none() && schemas.contains(schema_id) {
                warn!(
                    "Schema {} no longer exists, dropping its post-migration event",
                    schema_id
                );
                schemas.remove(schema_id).await?;
            }
        }

        if options.sync_event {
            let writer = SyncWriter::new(self.sync.clone(), self.db.clone(), Arc::new(registry))
                .with_config(self.sync_writer.clone());
            let synced = writer.sync().await?;
            info!("Synchronized {} post-migration event(s)", synced);
        }

        info!("Published post-migrate event: {}", modified.join(", "));
        Ok(())
    }
}

/// Name the schemas still pending in a handler failure.
fn with_pending(err: MigrateError, schemas: &SchemaSet) -> MigrateError {
    match err {
        MigrateError::PostMigrationHandler {
            event,
            schema_id,
            message,
        } => {
            let mut pending = schemas.ids();
            pending.sort();
            MigrateError::PostMigrationHandler {
                event,
                schema_id,
                message: format!("{} (pending schemas: {})", message, pending.join(", ")),
            }
        }
        other => other,
    }
}
