use std::time::Duration;

use gohan_sync_core::SyncError;
use thiserror::Error;

/// Errors of the migration tooling.
///
/// Every variant is fatal to a migration run: it propagates up to the binary, which
/// logs it once and exits with status 1.
#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Timeout after {0:?} while publishing post-migration event")]
    PostMigrationTimeout(Duration),

    #[error("Failed to handle event '{event}' for schema '{schema_id}': {message}")]
    PostMigrationHandler {
        event: String,
        schema_id: String,
        message: String,
    },

    #[error("Schema set backend is not initialised")]
    NotInitialised,

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Extension error: {0}")]
    Extension(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid migration: {0}")]
    InvalidMigration(String),
}

pub type Result<T> = std::result::Result<T, MigrateError>;
