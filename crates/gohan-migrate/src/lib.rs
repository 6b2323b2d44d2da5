//! Cluster-safe migrations for gohan.
//!
//! - [`Migrator`]: goose-style SQL and code migrations, tracking the schemas each one modifies
//! - [`SchemaSet`]: persisted set of schemas awaiting their post-migration event
//! - [`Runner`]: runs a migration command under the `/gohan/cluster/migrations` lock
//! - [`PostMigrationEmitter`]: runs extension handlers of modified schemas within a deadline
//! - [`SyncWriter`]: publishes the committed event journal to the sync backend

pub mod config;
pub mod db;
pub mod error;
pub mod extension;
pub mod migration;
pub mod post_migration;
pub mod runner;
pub mod schema;
pub mod schema_set;
pub mod sync_writer;

pub use config::{Cli, Config, MigrateCommand};
pub use db::{Database, DbType};
pub use error::{MigrateError, Result};
pub use extension::{
    handler_fn, EventContext, EventHandler, HandlerRegistry, IdentityService, EVENT_POST_MIGRATION,
};
pub use migration::{CodeMigration, Command, MigrationContext, Migrator, Report};
pub use post_migration::{EmitOptions, PostMigrationEmitter};
pub use runner::{RunOptions, Runner, MIGRATIONS_LOCK_PATH};
pub use schema::{Schema, SchemaRegistry};
pub use schema_set::{SchemaSet, SchemaSetBackend, SqlSchemaSetBackend};
pub use sync_writer::{EventLog, EventType, SyncWriter, SyncWriterConfig};
