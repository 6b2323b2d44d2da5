//! Applied-version bookkeeping in the `goose_db_version` table.

use std::collections::HashSet;

use chrono::Utc;
use sqlx::{AnyConnection, Row};
use tracing::debug;

use crate::db::{Database, DbType};
use crate::error::Result;

const TABLE: &str = "goose_db_version";

/// One row of the version table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRecord {
    pub version_id: i64,
    pub is_applied: bool,
    pub tstamp: Option<String>,
}

/// Reads and appends the version history. Rolling back appends an `is_applied = false` row.
#[derive(Clone)]
pub struct VersionStore {
    db: Database,
}

impl VersionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create the table with its version-0 row if absent and return the current version.
    pub async fn ensure(&self) -> Result<i64> {
        let tstamp = match self.db.db_type() {
            DbType::Sqlite3 => "TEXT",
            DbType::Mysql => "TIMESTAMP NULL",
        };
        let mut tx = self.db.begin().await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS `{}` (`id` {}, `version_id` BIGINT NOT NULL, `is_applied` BIGINT NOT NULL, `tstamp` {})",
            TABLE,
            self.db.auto_increment_key(),
            tstamp
        ))
        .execute(&mut *tx)
        .await?;

        let count: i64 = sqlx::query(&format!("SELECT CAST(COUNT(*) AS SIGNED) FROM `{}`", TABLE))
            .fetch_one(&mut *tx)
            .await?
            .try_get(0)?;
        if count == 0 {
            debug!("creating {} with version 0", TABLE);
            record(&mut tx, 0, true).await?;
        }
        tx.commit().await?;

        self.current_version().await
    }

    /// Every row, newest first.
    pub async fn history(&self) -> Result<Vec<VersionRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT CAST(`version_id` AS SIGNED), CAST(`is_applied` AS SIGNED), CAST(`tstamp` AS CHAR) FROM `{}` ORDER BY `id` DESC",
            TABLE
        ))
        .fetch_all(self.db.pool())
        .await?;

        rows.iter()
            .map(|row| -> Result<VersionRecord> {
                Ok(VersionRecord {
                    version_id: row.try_get(0)?,
                    is_applied: row.try_get::<i64, _>(1)? != 0,
                    tstamp: row.try_get(2)?,
                })
            })
            .collect()
    }

    /// Latest version whose newest row is an application.
    pub async fn current_version(&self) -> Result<i64> {
        Ok(current_from_history(&self.history().await?))
    }

    /// Timestamp of `version` if its newest row is an application.
    pub async fn applied_at(&self, version: i64) -> Result<Option<String>> {
        Ok(self
            .history()
            .await?
            .into_iter()
            .find(|record| record.version_id == version)
            .filter(|record| record.is_applied)
            .map(|record| record.tstamp.unwrap_or_default()))
    }
}

fn current_from_history(history: &[VersionRecord]) -> i64 {
    let mut rolled_back = HashSet::new();
    for record in history {
        if rolled_back.contains(&record.version_id) {
            continue;
        }
        if record.is_applied {
            return record.version_id;
        }
        rolled_back.insert(record.version_id);
    }
    0
}

/// Append a version row inside the migration transaction.
pub async fn record(conn: &mut AnyConnection, version: i64, is_applied: bool) -> Result<()> {
    let tstamp = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
    sqlx::query(&format!(
        "INSERT INTO `{}` (`version_id`, `is_applied`, `tstamp`) VALUES (?, ?, ?)",
        TABLE
    ))
    .bind(version)
    .bind(i64::from(is_applied))
    .bind(tstamp)
    .execute(conn)
    .await?;
    Ok(())
}
