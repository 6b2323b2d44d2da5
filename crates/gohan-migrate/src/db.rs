use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::any::{install_default_drivers, AnyPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::{Any, AnyPool, Row, Transaction};
use tracing::{debug, info, instrument};

use crate::error::{MigrateError, Result};

/// Name of the MySQL advisory lock serialising migration runs on one database.
const MIGRATION_LOCK_NAME: &str = "goose_db_version";
const MIGRATION_LOCK_TIMEOUT_SECS: i64 = 600;

/// Supported relational stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DbType {
    #[default]
    #[serde(rename = "sqlite3", alias = "sqlite")]
    Sqlite3,
    #[serde(rename = "mysql")]
    Mysql,
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbType::Sqlite3 => write!(f, "sqlite3"),
            DbType::Mysql => write!(f, "mysql"),
        }
    }
}

/// Connection pool to the relational store, tagged with its dialect.
#[derive(Clone, Debug)]
pub struct Database {
    pool: AnyPool,
    db_type: DbType,
}

impl Database {
    /// Connect to `connection`, a file path for sqlite3 and a URL or Go-style DSN
    /// (`user:password@tcp(host:port)/name`) for mysql.
    #[instrument(skip(connection), level = "debug")]
    pub async fn connect(db_type: DbType, connection: &str, max_connections: u32) -> Result<Self> {
        install_default_drivers();
        let url = connection_url(db_type, connection)?;
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(&url)
            .await?;
        info!("Connected to {} database", db_type);
        Ok(Self { pool, db_type })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn db_type(&self) -> DbType {
        self.db_type
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Any>> {
        Ok(self.pool.begin().await?)
    }

    /// Column definition of an auto-incremented primary key.
    pub(crate) fn auto_increment_key(&self) -> &'static str {
        match self.db_type {
            DbType::Sqlite3 => "INTEGER PRIMARY KEY AUTOINCREMENT",
            DbType::Mysql => "BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY",
        }
    }

    /// Column type of a short indexed string.
    pub(crate) fn short_text(&self) -> &'static str {
        match self.db_type {
            DbType::Sqlite3 => "TEXT",
            DbType::Mysql => "VARCHAR(255)",
        }
    }

    /// Serialise migration runs against this database. A no-op on sqlite3, whose
    /// writers are already serialised by the file lock.
    pub async fn lock_migrations(&self) -> Result<MigrationLock> {
        match self.db_type {
            DbType::Sqlite3 => Ok(MigrationLock { conn: None }),
            DbType::Mysql => {
                let mut conn = self.pool.acquire().await?;
                let row = sqlx::query("SELECT GET_LOCK(?, ?)")
                    .bind(MIGRATION_LOCK_NAME)
                    .bind(MIGRATION_LOCK_TIMEOUT_SECS)
                    .fetch_one(&mut *conn)
                    .await?;
                let acquired: Option<i64> = row.try_get(0)?;
                if acquired != Some(1) {
                    return Err(MigrateError::MigrationFailed(format!(
                        "timed out waiting for database lock '{}'",
                        MIGRATION_LOCK_NAME
                    )));
                }
                debug!("acquired database lock '{}'", MIGRATION_LOCK_NAME);
                Ok(MigrationLock { conn: Some(conn) })
            }
        }
    }
}

/// Database-level migration lock; see [`Database::lock_migrations`].
pub struct MigrationLock {
    conn: Option<PoolConnection<Any>>,
}

impl MigrationLock {
    pub async fn release(self) -> Result<()> {
        if let Some(mut conn) = self.conn {
            sqlx::query("SELECT RELEASE_LOCK(?)")
                .bind(MIGRATION_LOCK_NAME)
                .execute(&mut *conn)
                .await?;
            debug!("released database lock '{}'", MIGRATION_LOCK_NAME);
        }
        Ok(())
    }
}

fn go_dsn_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?P<credentials>[^@]*)@(?:tcp\((?P<addr>[^)]*)\))?/(?P<name>[^?]*)(?:\?.*)?$")
            .unwrap_or_else(|e| unreachable!("invalid DSN pattern: {}", e))
    })
}

/// Translate a configured connection string into a sqlx connection URL.
pub fn connection_url(db_type: DbType, connection: &str) -> Result<String> {
    if connection.is_empty() {
        return Err(MigrateError::Config("database/connection is not set".to_string()));
    }

    match db_type {
        DbType::Sqlite3 => {
            if connection.starts_with("sqlite:") {
                Ok(connection.to_string())
            } else {
                let path = connection.strip_prefix("file:").unwrap_or(connection);
                Ok(format!("sqlite://{}?mode=rwc", path))
            }
        }
        DbType::Mysql => {
            if connection.starts_with("mysql://") {
                return Ok(connection.to_string());
            }
            let captures = go_dsn_pattern().captures(connection).ok_or_else(|| {
                MigrateError::Config(format!("unsupported mysql connection string: {}", connection))
            })?;
            let addr = captures
                .name("addr")
                .map(|m| m.as_str())
                .filter(|a| !a.is_empty())
                .unwrap_or("localhost:3306");
            Ok(format!(
                "mysql://{}@{}/{}",
                &captures["credentials"], addr, &captures["name"]
            ))
        }
    }
}
