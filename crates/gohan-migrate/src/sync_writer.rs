//! Replication of committed resource changes from the database to the sync backend.
//!
//! Writers append to the `event` journal inside their transaction ([`EventLog`]) and then
//! touch the commit trigger key. A [`SyncWriter`] drains the journal in id order, publishing
//! each change with a compare-and-swap on the key's current revision and deleting the journal
//! row in the same database transaction.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gohan_sync_core::{CasCondition, LockToken, SyncBackend, SyncError, WatchStart};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sqlx::{AnyConnection, Row};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::db::Database;
use crate::error::{MigrateError, Result};
use crate::schema::{Schema, SchemaRegistry};

/// Cluster lock held by the single active sync writer.
pub const SYNC_LOCK_PATH: &str = "/gohan/cluster/sync";
/// Key touched after every commit that appended to the journal.
pub const SYNC_KEY_TX_COMMITTED: &str = "/gohan/cluster/sync/tx_committed";

const CONFIG_PREFIX: &str = "/config";
const STATE_PREFIX: &str = "/state";
const MONITORING_PREFIX: &str = "/monitoring";
const EVENT_TABLE: &str = "event";

/// Kind of journaled change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Create,
    Update,
    Delete,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Create => "create",
            EventType::Update => "update",
            EventType::Delete => "delete",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(EventType::Create),
            "update" => Ok(EventType::Update),
            "delete" => Ok(EventType::Delete),
            other => Err(MigrateError::Schema(format!("unknown event type: {}", other))),
        }
    }
}

/// One row of the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEvent {
    pub id: i64,
    pub event_type: EventType,
    pub path: String,
    pub version: i64,
    pub body: String,
    pub sync_plain: bool,
    pub sync_property: String,
}

/// Appends resource changes to the `event` journal.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventLog;

impl EventLog {
    /// Create the journal table if absent.
    pub async fn ensure_table(db: &Database) -> Result<()> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS `{}` (`id` {}, `type` {}, `path` TEXT NOT NULL, `version` BIGINT NOT NULL, `body` TEXT NOT NULL, `sync_plain` BIGINT NOT NULL, `sync_property` TEXT NOT NULL, `timestamp` BIGINT NOT NULL)",
            EVENT_TABLE,
            db.auto_increment_key(),
            db.short_text()
        ))
        .execute(db.pool())
        .await?;
        Ok(())
    }

    /// Journal a change of the resource at `path` within the caller's transaction.
    ///
    /// Returns the event id, or `None` for schemas excluded from sync.
    pub async fn log_event(
        conn: &mut AnyConnection,
        schema: &Schema,
        event_type: EventType,
        path: &str,
        version: i64,
        body: &Value,
    ) -> Result<Option<i64>> {
        if schema.nosync() {
            debug!("skipping event logging for schema: {}", schema.id);
            return Ok(None);
        }

        let result = sqlx::query(&format!(
            "INSERT INTO `{}` (`type`, `path`, `version`, `body`, `sync_plain`, `sync_property`, `timestamp`) VALUES (?, ?, ?, ?, ?, ?, ?)",
            EVENT_TABLE
        ))
        .bind(event_type.as_str())
        .bind(path)
        .bind(version)
        .bind(body.to_string())
        .bind(i64::from(schema.sync_plain()))
        .bind(schema.sync_property().unwrap_or_default())
        .bind(Utc::now().timestamp())
        .execute(conn)
        .await?;

        Ok(result.last_insert_id())
    }

    /// Wake the sync writer after the transaction holding `event_id` committed.
    pub async fn notify_committed(sync: &dyn SyncBackend, event_id: i64) -> Result<()> {
        sync.update(SYNC_KEY_TX_COMMITTED, &json!({ "event_id": event_id }).to_string())
            .await?;
        Ok(())
    }
}

fn default_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_unlock_timeout() -> Duration {
    Duration::from_secs(3)
}

/// Timing of the [`SyncWriter::run`] loop.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SyncWriterConfig {
    /// Pause before taking the lock again after an interruption.
    #[serde(default = "default_backoff", with = "humantime_serde")]
    pub backoff: Duration,
    /// Bound on releasing the lock when an iteration ends.
    #[serde(default = "default_unlock_timeout", with = "humantime_serde", rename = "unlock")]
    pub unlock_timeout: Duration,
}

impl Default for SyncWriterConfig {
    fn default() -> Self {
        Self {
            backoff: default_backoff(),
            unlock_timeout: default_unlock_timeout(),
        }
    }
}

/// Publishes the journal to the sync backend.
pub struct SyncWriter {
    backend: Arc<dyn SyncBackend>,
    db: Database,
    registry: Arc<SchemaRegistry>,
    config: SyncWriterConfig,
}

impl SyncWriter {
    pub fn new(backend: Arc<dyn SyncBackend>, db: Database, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            backend,
            db,
            registry,
            config: SyncWriterConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SyncWriterConfig) -> Self {
        self.config = config;
        self
    }

    /// Publish every journaled event. Returns how many were processed.
    #[instrument(skip(self), level = "debug")]
    pub async fn sync(&self) -> Result<usize> {
        EventLog::ensure_table(&self.db).await?;
        let events = self.list_events().await?;
        for event in &events {
            self.sync_event(event).await?;
        }
        if !events.is_empty() {
            debug!("synced {} event(s)", events.len());
        }
        Ok(events.len())
    }

    async fn list_events(&self) -> Result<Vec<JournalEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT CAST(`id` AS SIGNED), CAST(`type` AS CHAR), CAST(`path` AS CHAR), CAST(`version` AS SIGNED), CAST(`body` AS CHAR), CAST(`sync_plain` AS SIGNED), CAST(`sync_property` AS CHAR) FROM `{}` ORDER BY `id` ASC",
            EVENT_TABLE
        ))
        .fetch_all(self.db.pool())
        .await?;

        rows.iter()
            .map(|row| -> Result<JournalEvent> {
                Ok(JournalEvent {
                    id: row.try_get(0)?,
                    event_type: row.try_get::<String, _>(1)?.parse()?,
                    path: row.try_get(2)?,
                    version: row.try_get(3)?,
                    body: row.try_get(4)?,
                    sync_plain: row.try_get::<i64, _>(5)? != 0,
                    sync_property: row.try_get(6)?,
                })
            })
            .collect()
    }

    /// Resource path of `event`, rendered through the schema's `sync_key_template` if any.
    fn resource_path(&self, schema: Option<&Schema>, event: &JournalEvent) -> String {
        let Some(schema) = schema.filter(|s| s.sync_key_template().is_some()) else {
            return event.path.clone();
        };
        match serde_json::from_str::<Map<String, Value>>(&event.body) {
            Ok(data) => schema.generate_custom_path(&data).unwrap_or_else(|e| {
                error!("{}", e);
                event.path.clone()
            }),
            Err(e) => {
                error!("failed to decode body of event {}: {}", event.id, e);
                event.path.clone()
            }
        }
    }

    fn sync_path(&self, schema: Option<&Schema>, resource_path: &str) -> String {
        if schema.is_some_and(Schema::skip_config_prefix) {
            resource_path.to_string()
        } else {
            format!("{}{}", CONFIG_PREFIX, resource_path)
        }
    }

    /// Current value and revision of `key`, if it holds a value.
    async fn current(&self, key: &str) -> Result<Option<(String, i64)>> {
        match self.backend.fetch(key).await {
            Ok(node) => Ok(node.revision.map(|revision| (node.value, revision))),
            Err(SyncError::KeyNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn sync_event(&self, event: &JournalEvent) -> Result<()> {
        let schema = self.registry.schema_by_url_path(&event.path).map(Arc::as_ref);
        let resource_path = self.resource_path(schema, event);
        let path = self.sync_path(schema, &resource_path);

        let mut tx = self.db.begin().await?;

        match event.event_type {
            EventType::Create | EventType::Update => {
                let content = render_content(event)?;
                let revision = match self.current(&path).await? {
                    None => Some(0),
                    Some((stored, _)) if stored == content => {
                        debug!("{} is up to date", path);
                        None
                    }
                    Some((stored, _)) if !event.sync_plain && stored_version(&stored) > Some(event.version) => {
                        debug!("{} holds a newer version than {}, skipping", path, event.version);
                        None
                    }
                    Some((_, revision)) => Some(revision),
                };
                if let Some(revision) = revision {
                    debug!("set {} on sync", path);
                    let written = self
                        .backend
                        .compare_and_swap(&path, &content, &[CasCondition::ByRevision(revision)])
                        .await?;
                    if !written {
                        debug!("{} changed concurrently, skipping", path);
                    }
                }
            }
            EventType::Delete => {
                for prefix in [STATE_PREFIX, MONITORING_PREFIX] {
                    let key = format!("{}{}", prefix, resource_path);
                    if let Err(e) = self.backend.delete(&key, false).await {
                        warn!("delete of {} from sync failed: {}", key, e);
                    }
                }
                if let Some((_, revision)) = self.current(&path).await? {
                    debug!("delete {} on sync", path);
                    let deleted = self
                        .backend
                        .compare_and_delete(&path, &[CasCondition::ByRevision(revision)])
                        .await?;
                    if !deleted {
                        debug!("{} changed concurrently, skipping delete", path);
                    }
                }
            }
        }

        sqlx::query(&format!("DELETE FROM `{}` WHERE `id` = ?", EVENT_TABLE))
            .bind(event.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Follow commit triggers while holding [`SYNC_LOCK_PATH`], until `cancel` fires.
    ///
    /// Losing the lock or the trigger watch ends the iteration; the loop takes the lock again
    /// after the configured backoff.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            match self.run_once(cancel).await {
                Ok(()) => return Ok(()),
                Err(_) if cancel.is_cancelled() => return Ok(()),
                Err(e) => error!("sync writer interrupted: {}", e),
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.backoff) => {}
            }
        }
    }

    async fn run_once(&self, cancel: &CancellationToken) -> Result<()> {
        let token = self.backend.lock(cancel, SYNC_LOCK_PATH, true).await?;
        info!("Sync writer holds {}", SYNC_LOCK_PATH);

        let result = self.follow_triggers(cancel, &token).await;

        match tokio::time::timeout(self.config.unlock_timeout, self.backend.unlock(SYNC_LOCK_PATH)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("failed to release {}: {}", SYNC_LOCK_PATH, e),
            Err(_) => warn!("timed out releasing {}", SYNC_LOCK_PATH),
        }
        result
    }

    async fn follow_triggers(&self, cancel: &CancellationToken, token: &LockToken) -> Result<()> {
        let watch_cancel = cancel.child_token();
        let _stop_watch = watch_cancel.clone().drop_guard();
        let mut triggers = self
            .backend
            .watch(watch_cancel, SYNC_KEY_TX_COMMITTED, WatchStart::Current);

        self.sync().await?;

        let lost = token.lost();
        tokio::pin!(lost);
        loop {
            tokio::select! {
                _ = &mut lost => {
                    return Err(SyncError::LockLost(SYNC_LOCK_PATH.to_string()).into());
                }
                _ = cancel.cancelled() => return Ok(()),
                trigger = triggers.recv() => match trigger {
                    Some(Ok(event)) => {
                        debug!("commit trigger {:?} at revision {}", event.data.get("event_id"), event.revision);
                        self.sync().await?;
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        return Err(SyncError::BackendUnavailable("commit trigger watch closed".to_string()).into());
                    }
                },
            }
        }
    }
}

/// Value published for `event`.
fn render_content(event: &JournalEvent) -> Result<String> {
    let mut content = event.body.clone();

    if !event.sync_property.is_empty() {
        let data: Map<String, Value> = serde_json::from_str(&event.body).map_err(serialization)?;
        let target = data.get(&event.sync_property).ok_or_else(|| {
            MigrateError::Schema(format!("could not find property `{}`", event.sync_property))
        })?;
        content = target.to_string();
    }

    if event.sync_plain {
        if let Ok(Value::String(plain)) = serde_json::from_str::<Value>(&content) {
            content = plain;
        }
        Ok(content)
    } else {
        Ok(json!({ "body": content, "version": event.version }).to_string())
    }
}

fn stored_version(stored: &str) -> Option<i64> {
    serde_json::from_str::<Value>(stored)
        .ok()?
        .get("version")?
        .as_i64()
}

fn serialization(e: serde_json::Error) -> MigrateError {
    MigrateError::Sync(SyncError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use gohan_sync_etcd::EtcdSync;

    use super::*;
    use crate::db::DbType;

    const SCHEMAS: &str = r#"
schemas:
  - id: network
    plural: networks
    prefix: /v2.0
  - id: port
    plural: ports
    prefix: /v2.0
    metadata:
      sync_key_template: "/ports/{{network_id}}/{{id}}"
      sync_plain: true
      sync_property: name
  - id: audit
    plural: audits
    metadata:
      nosync: true
"#;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Database,
        backend: Arc<dyn SyncBackend>,
        registry: Arc<SchemaRegistry>,
    }

    impl Fixture {
        fn writer(&self) -> SyncWriter {
            SyncWriter::new(self.backend.clone(), self.db.clone(), self.registry.clone())
        }

        fn schema(&self, id: &str) -> Arc<Schema> {
            self.registry.schema(id).unwrap().clone()
        }

        async fn log(&self, schema: &str, event_type: EventType, path: &str, version: i64, body: Value) -> Option<i64> {
            let mut tx = self.db.begin().await.unwrap();
            let id = EventLog::log_event(&mut tx, &self.schema(schema), event_type, path, version, &body)
                .await
                .unwrap();
            tx.commit().await.unwrap();
            id
        }

        async fn journal_len(&self) -> usize {
            self.writer().list_events().await.unwrap().len()
        }
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db");
        let db = Database::connect(DbType::Sqlite3, path.to_str().unwrap(), 2).await.unwrap();
        EventLog::ensure_table(&db).await.unwrap();
        let mut registry = SchemaRegistry::new();
        registry.add_document(SCHEMAS).unwrap();
        Fixture {
            _dir: dir,
            db,
            backend: Arc::new(EtcdSync::memory()),
            registry: Arc::new(registry),
        }
    }

    fn stored(node_value: &str) -> Value {
        serde_json::from_str(node_value).unwrap()
    }

    #[tokio::test]
    async fn test_publishes_journal() {
        let fx = fixture().await;
        let body = json!({"id": "n1", "name": "net"});
        let id = fx
            .log("network", EventType::Create, "/v2.0/networks/n1", 1, body.clone())
            .await;
        assert!(id.is_some());

        assert_eq!(fx.writer().sync().await.unwrap(), 1);
        assert_eq!(fx.journal_len().await, 0);

        let node = fx.backend.fetch("/config/v2.0/networks/n1").await.unwrap();
        let value = stored(&node.value);
        assert_eq!(value["version"], 1);
        assert_eq!(stored(value["body"].as_str().unwrap()), body);

        // A replayed journal entry leaves the key untouched.
        fx.log("network", EventType::Create, "/v2.0/networks/n1", 1, body).await;
        assert_eq!(fx.writer().sync().await.unwrap(), 1);
        let again = fx.backend.fetch("/config/v2.0/networks/n1").await.unwrap();
        assert_eq!(again.revision, node.revision);

        assert_eq!(fx.writer().sync().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_newer_version_is_kept() {
        let fx = fixture().await;
        fx.log("network", EventType::Update, "/v2.0/networks/n1", 3, json!({"id": "n1", "name": "new"}))
            .await;
        fx.log("network", EventType::Update, "/v2.0/networks/n1", 2, json!({"id": "n1", "name": "old"}))
            .await;

        assert_eq!(fx.writer().sync().await.unwrap(), 2);
        let node = fx.backend.fetch("/config/v2.0/networks/n1").await.unwrap();
        let value = stored(&node.value);
        assert_eq!(value["version"], 3);
        assert!(value["body"].as_str().unwrap().contains("new"));
    }

    #[tokio::test]
    async fn test_plain_property_on_custom_path() {
        let fx = fixture().await;
        fx.log(
            "port",
            EventType::Create,
            "/v2.0/ports/p1",
            1,
            json!({"id": "p1", "network_id": "n1", "name": "eth0"}),
        )
        .await;

        fx.writer().sync().await.unwrap();
        let node = fx.backend.fetch("/config/ports/n1/p1").await.unwrap();
        assert_eq!(node.value, "eth0");
    }

    #[tokio::test]
    async fn test_delete_removes_state_and_monitoring() {
        let fx = fixture().await;
        let body = json!({"id": "n1"});
        fx.log("network", EventType::Create, "/v2.0/networks/n1", 1, body.clone()).await;
        fx.writer().sync().await.unwrap();
        fx.backend.update("/state/v2.0/networks/n1", "{\"state\":\"up\"}").await.unwrap();
        fx.backend.update("/monitoring/v2.0/networks/n1", "{}").await.unwrap();

        fx.log("network", EventType::Delete, "/v2.0/networks/n1", 1, body).await;
        assert_eq!(fx.writer().sync().await.unwrap(), 1);

        for key in ["/config/v2.0/networks/n1", "/state/v2.0/networks/n1", "/monitoring/v2.0/networks/n1"] {
            assert!(matches!(fx.backend.fetch(key).await, Err(SyncError::KeyNotFound(_))), "{key}");
        }
    }

    #[tokio::test]
    async fn test_nosync_schema_not_journaled() {
        let fx = fixture().await;
        let id = fx
            .log("audit", EventType::Create, "/audits/a1", 1, json!({"id": "a1"}))
            .await;
        assert_eq!(id, None);
        assert_eq!(fx.journal_len().await, 0);
    }

    #[test]
    fn test_render_content() {
        let mut event = JournalEvent {
            id: 1,
            event_type: EventType::Create,
            path: "/v2.0/networks/n1".to_string(),
            version: 4,
            body: r#"{"id":"n1","config":{"mtu":1500}}"#.to_string(),
            sync_plain: false,
            sync_property: String::new(),
        };
        let value = stored(&render_content(&event).unwrap());
        assert_eq!(value["version"], 4);
        assert_eq!(value["body"], event.body.as_str());

        event.sync_property = "config".to_string();
        event.sync_plain = true;
        assert_eq!(render_content(&event).unwrap(), r#"{"mtu":1500}"#);

        event.sync_property = "missing".to_string();
        assert!(render_content(&event).is_err());
    }

    #[tokio::test]
    async fn test_run_follows_commit_triggers() {
        let fx = fixture().await;
        let writer = Arc::new(fx.writer().with_config(SyncWriterConfig {
            backoff: Duration::from_millis(50),
            unlock_timeout: Duration::from_secs(1),
        }));
        let cancel = CancellationToken::new();

        let handle = {
            let writer = writer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { writer.run(&cancel).await })
        };

        let id = fx
            .log("network", EventType::Create, "/v2.0/networks/n2", 1, json!({"id": "n2"}))
            .await
            .unwrap();
        EventLog::notify_committed(fx.backend.as_ref(), id).await.unwrap();

        let published = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if fx.backend.fetch("/config/v2.0/networks/n2").await.is_ok() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(published.is_ok());
        assert!(fx.backend.has_lock(SYNC_LOCK_PATH));

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert!(!fx.backend.has_lock(SYNC_LOCK_PATH));
    }
}
