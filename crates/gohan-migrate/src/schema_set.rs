//! Durable set of schemas modified by migrations whose post-migration event is pending.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{AnyConnection, AnyPool, Row};
use tracing::{debug, instrument};

use crate::error::{MigrateError, Result};

const TABLE: &str = "post_migration_events";

/// Persistence of the schema-modification set.
#[async_trait]
pub trait SchemaSetBackend: Send + Sync {
    /// Create the backing table if needed and return every persisted schema ID.
    async fn load_schema_ids(&self) -> Result<Vec<String>>;

    /// Record `schema_id` inside the caller's transaction.
    async fn persist_schema_id(&self, conn: &mut AnyConnection, schema_id: &str) -> Result<()>;

    /// Delete every record of `schema_id` in a transaction of its own.
    async fn delete_schema_id(&self, schema_id: &str) -> Result<()>;
}

/// SQL table `post_migration_events(schema_id)`.
#[derive(Clone)]
pub struct SqlSchemaSetBackend {
    pool: AnyPool,
}

impl SqlSchemaSetBackend {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SchemaSetBackend for SqlSchemaSetBackend {
    #[instrument(skip(self), level = "debug")]
    async fn load_schema_ids(&self) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS `{}` (`schema_id` TEXT NOT NULL)",
            TABLE
        ))
        .execute(&mut *tx)
        .await?;
        let rows = sqlx::query(&format!("SELECT `schema_id` FROM `{}`", TABLE))
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>(0).map_err(MigrateError::from))
            .collect()
    }

    async fn persist_schema_id(&self, conn: &mut AnyConnection, schema_id: &str) -> Result<()> {
        sqlx::query(&format!("INSERT INTO `{}` (`schema_id`) VALUES (?)", TABLE))
            .bind(schema_id)
            .execute(conn)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_schema_id(&self, schema_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DELETE FROM `{}` WHERE `schema_id` = ?", TABLE))
            .bind(schema_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

/// In-memory view of the pending schema IDs, backed by a [`SchemaSetBackend`].
///
/// The persisted table is the source of truth. The memory view may run ahead of it while a
/// migration transaction is open; [`SchemaSet::init`] re-synchronises it.
#[derive(Default)]
pub struct SchemaSet {
    schemas: HashSet<String>,
    backend: Option<Arc<dyn SchemaSetBackend>>,
}

impl SchemaSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `backend` and reload the set from it.
    pub async fn init(&mut self, backend: Option<Arc<dyn SchemaSetBackend>>) -> Result<()> {
        let backend = backend.ok_or(MigrateError::NotInitialised)?;
        let ids = backend.load_schema_ids().await?;
        debug!("loaded {} pending schema(s)", ids.len());
        self.schemas = ids.into_iter().collect();
        self.backend = Some(backend);
        Ok(())
    }

    fn backend(&self) -> Result<&Arc<dyn SchemaSetBackend>> {
        self.backend.as_ref().ok_or(MigrateError::NotInitialised)
    }

    /// Mark `schema_id` as modified within the migration transaction `conn`.
    pub async fn mark(&mut self, schema_id: &str, conn: &mut AnyConnection) -> Result<()> {
        self.backend()?.persist_schema_id(conn, schema_id).await?;
        self.schemas.insert(schema_id.to_string());
        Ok(())
    }

    /// Snapshot of the pending IDs, in no particular order.
    pub fn ids(&self) -> Vec<String> {
        self.schemas.iter().cloned().collect()
    }

    pub fn contains(&self, schema_id: &str) -> bool {
        self.schemas.contains(schema_id)
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    pub async fn remove(&mut self, schema_id: &str) -> Result<()> {
        if !self.schemas.contains(schema_id) {
            return Ok(());
        }
        self.backend()?.delete_schema_id(schema_id).await?;
        self.schemas.remove(schema_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, DbType};

    async fn database(dir: &tempfile::TempDir) -> Database {
        let path = dir.path().join("set.db");
        Database::connect(DbType::Sqlite3, path.to_str().unwrap(), 2).await.unwrap()
    }

    fn sorted(mut ids: Vec<String>) -> Vec<String> {
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_init_requires_backend() {
        let mut set = SchemaSet::new();
        assert!(matches!(set.init(None).await, Err(MigrateError::NotInitialised)));
    }

    #[tokio::test]
    async fn test_mark_before_init_fails() {
        let dir = tempfile::tempdir().unwrap();
        let db = database(&dir).await;
        let mut conn = db.pool().acquire().await.unwrap();
        let mut set = SchemaSet::new();
        assert!(matches!(
            set.mark("network", &mut conn).await,
            Err(MigrateError::NotInitialised)
        ));
    }

    #[tokio::test]
    async fn test_committed_marks_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let db = database(&dir).await;
        let backend: Arc<dyn SchemaSetBackend> = Arc::new(SqlSchemaSetBackend::new(db.pool().clone()));

        let mut set = SchemaSet::new();
        set.init(Some(backend.clone())).await.unwrap();
        assert!(set.is_empty());

        let mut tx = db.begin().await.unwrap();
        set.mark("network", &mut tx).await.unwrap();
        set.mark("subnet", &mut tx).await.unwrap();
        tx.commit().await.unwrap();

        let mut restarted = SchemaSet::new();
        restarted.init(Some(backend)).await.unwrap();
        assert_eq!(sorted(restarted.ids()), vec!["network", "subnet"]);
    }

    #[tokio::test]
    async fn test_rolled_back_marks_vanish() {
        let dir = tempfile::tempdir().unwrap();
        let db = database(&dir).await;
        let backend: Arc<dyn SchemaSetBackend> = Arc::new(SqlSchemaSetBackend::new(db.pool().clone()));

        let mut set = SchemaSet::new();
        set.init(Some(backend.clone())).await.unwrap();

        let mut tx = db.begin().await.unwrap();
        set.mark("network", &mut tx).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(set.contains("network"));

        set.init(Some(backend)).await.unwrap();
        assert!(!set.contains("network"));
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let db = database(&dir).await;
        let backend: Arc<dyn SchemaSetBackend> = Arc::new(SqlSchemaSetBackend::new(db.pool().clone()));

        let mut set = SchemaSet::new();
        set.init(Some(backend.clone())).await.unwrap();
        let mut tx = db.begin().await.unwrap();
        set.mark("network", &mut tx).await.unwrap();
        set.mark("network", &mut tx).await.unwrap();
        tx.commit().await.unwrap();

        set.remove("absent").await.unwrap();
        set.remove("network").await.unwrap();
        assert!(set.ids().is_empty());

        set.init(Some(backend)).await.unwrap();
        assert!(set.ids().is_empty());
    }
}
