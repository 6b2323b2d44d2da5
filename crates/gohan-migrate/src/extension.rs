//! Extension environments: per-schema event dispatch to registered handlers.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gohan_sync_core::SyncBackend;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{MigrateError, Result};
use crate::schema::{Extension, Schema};

/// Event dispatched once per dirty schema after a migration.
pub const EVENT_POST_MIGRATION: &str = "post-migration";

/// Code type of extensions bound to handlers compiled into the binary.
pub const CODE_TYPE_NATIVE: &str = "native";

/// Narrow view of the identity service handed to extensions.
#[async_trait]
pub trait IdentityService: Send + Sync {
    fn name(&self) -> &str;

    /// Token extensions use to call other services, if any.
    async fn service_token(&self) -> Result<Option<String>>;
}

/// Identity service of deployments without authentication.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopIdentityService;

#[async_trait]
impl IdentityService for NoopIdentityService {
    fn name(&self) -> &str {
        "noop"
    }

    async fn service_token(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Everything a handler receives with an event.
#[derive(Clone)]
pub struct EventContext {
    pub schema: Arc<Schema>,
    pub schema_id: String,
    pub sync: Arc<dyn SyncBackend>,
    pub db: Database,
    pub identity_service: Arc<dyn IdentityService>,
    pub context: CancellationToken,
    pub trace_id: String,
}

impl EventContext {
    pub fn new(
        schema: Arc<Schema>,
        sync: Arc<dyn SyncBackend>,
        db: Database,
        identity_service: Arc<dyn IdentityService>,
        context: CancellationToken,
    ) -> Self {
        Self {
            schema_id: schema.id.clone(),
            schema,
            sync,
            db,
            identity_service,
            context,
            trace_id: Uuid::new_v4().to_string(),
        }
    }
}

impl fmt::Debug for EventContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventContext")
            .field("schema_id", &self.schema_id)
            .field("sync", &self.sync.backend_name())
            .field("db", &self.db.db_type())
            .field("identity_service", &self.identity_service.name())
            .field("trace_id", &self.trace_id)
            .finish()
    }
}

/// Handler of one event for one extension.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: EventContext) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, ctx: EventContext) -> anyhow::Result<()> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(EventContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

type EventHandlers = HashMap<String, Arc<dyn EventHandler>>;

/// Native handlers by extension ID and event name.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    extensions: HashMap<String, EventHandlers>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, extension_id: &str, event: &str, handler: Arc<dyn EventHandler>) {
        self.extensions
            .entry(extension_id.to_string())
            .or_default()
            .insert(event.to_string(), handler);
    }

    fn handlers(&self, extension_id: &str) -> Option<&EventHandlers> {
        self.extensions.get(extension_id)
    }
}

/// Capabilities of a per-schema extension environment.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Bind every extension of `extensions` whose path matches `plural_url`.
    fn load_extensions_for_path(&mut self, extensions: &[Arc<Extension>], plural_url: &str) -> Result<()>;

    /// Bound the duration of one dispatch of `event`.
    fn set_event_time_limit(&mut self, event: &str, limit: Duration);

    fn is_event_handled(&self, event: &str) -> bool;

    /// Run the handlers bound for `event`, in extension declaration order.
    async fn handle_event(&self, event: &str, ctx: EventContext) -> Result<()>;
}

/// Environment running native Rust handlers.
///
/// Extensions of other code types are skipped: no interpreter is embedded.
pub struct NativeEnvironment {
    name: String,
    registry: Arc<HandlerRegistry>,
    bound: Vec<(String, EventHandlers)>,
    time_limits: HashMap<String, Duration>,
}

impl NativeEnvironment {
    pub fn new(name: impl Into<String>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            name: name.into(),
            registry,
            bound: Vec::new(),
            time_limits: HashMap::new(),
        }
    }

    async fn dispatch(&self, event: &str, ctx: &EventContext) -> Result<()> {
        for (extension_id, handlers) in &self.bound {
            let Some(handler) = handlers.get(event) else {
                continue;
            };
            debug!("[{}] {} handles {}", self.name, extension_id, event);
            handler.handle(ctx.clone()).await.map_err(|e| MigrateError::PostMigrationHandler {
                event: event.to_string(),
                schema_id: ctx.schema_id.clone(),
                message: format!("{}: {:#}", extension_id, e),
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl Environment for NativeEnvironment {
    fn load_extensions_for_path(&mut self, extensions: &[Arc<Extension>], plural_url: &str) -> Result<()> {
        for extension in extensions.iter().filter(|e| e.matches(plural_url)) {
            if extension.code_type != CODE_TYPE_NATIVE {
                debug!(
                    "[{}] skipping {} extension {}",
                    self.name, extension.code_type, extension.id
                );
                continue;
            }
            let handlers = self.registry.handlers(&extension.id).ok_or_else(|| {
                MigrateError::Extension(format!(
                    "no native handlers registered for extension {}",
                    extension.id
                ))
            })?;
            self.bound.push((extension.id.clone(), handlers.clone()));
        }
        Ok(())
    }

    fn set_event_time_limit(&mut self, event: &str, limit: Duration) {
        self.time_limits.insert(event.to_string(), limit);
    }

    fn is_event_handled(&self, event: &str) -> bool {
        self.bound.iter().any(|(_, handlers)| handlers.contains_key(event))
    }

    #[instrument(skip(self, ctx), fields(env = %self.name, schema_id = %ctx.schema_id, trace_id = %ctx.trace_id))]
    async fn handle_event(&self, event: &str, ctx: EventContext) -> Result<()> {
        match self.time_limits.get(event) {
            Some(limit) => tokio::time::timeout(*limit, self.dispatch(event, &ctx))
                .await
                .map_err(|_| MigrateError::PostMigrationTimeout(*limit))?,
            None => self.dispatch(event, &ctx).await,
        }
    }
}

/// Environments by schema ID.
#[derive(Default)]
pub struct EnvironmentManager {
    environments: HashMap<String, Box<dyn Environment>>,
}

impl EnvironmentManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, schema_id: &str) -> Option<&dyn Environment> {
        self.environments.get(schema_id).map(|env| env.as_ref())
    }

    pub fn contains(&self, schema_id: &str) -> bool {
        self.environments.contains_key(schema_id)
    }

    pub fn register(&mut self, schema_id: &str, env: Box<dyn Environment>) -> Result<()> {
        if self.environments.contains_key(schema_id) {
            return Err(MigrateError::Extension(format!(
                "environment already registered for schema {}",
                schema_id
            )));
        }
        info!("Registered environment for schema {}", schema_id);
        self.environments.insert(schema_id.to_string(), env);
        Ok(())
    }

    pub fn unregister(&mut self, schema_id: &str) -> bool {
        self.environments.remove(schema_id).is_some()
    }
}
