use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gohan_sync_core::{
    CasCondition, LockToken, Node, SyncBackend, SyncError, WatchStart, WatchStream,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::kv::{Compare, EtcdKvStore, KvError, KvStore, MemoryKvStore, RangeOptions, TxnOp};
use crate::lock::LockTable;
use crate::watch::spawn_watch;

/// Default per-call timeout of sync operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Default lease TTL of cluster locks.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10);

impl From<KvError> for SyncError {
    fn from(err: KvError) -> Self {
        SyncError::BackendUnavailable(err.to_string())
    }
}

/// Sync backend over a flat, revisioned KV store.
///
/// Hierarchy is a naming convention only: `/a/b` is a child of `/a`. Every call is
/// bounded by the configured timeout; after [`SyncBackend::close`] every operation
/// fails with `BackendUnavailable`.
pub struct EtcdSync {
    store: Arc<dyn KvStore>,
    process_id: String,
    timeout: Duration,
    locks: LockTable,
    closed: AtomicBool,
}

impl EtcdSync {
    pub fn new(store: Arc<dyn KvStore>, timeout: Duration, lock_ttl: Duration) -> Self {
        Self::with_process_id(store, timeout, lock_ttl, generate_process_id())
    }

    pub fn with_process_id(
        store: Arc<dyn KvStore>,
        timeout: Duration,
        lock_ttl: Duration,
        process_id: impl Into<String>,
    ) -> Self {
        let process_id = process_id.into();
        Self {
            locks: LockTable::new(store.clone(), process_id.clone(), lock_ttl),
            store,
            process_id,
            timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Connect to an etcd v3 cluster.
    pub fn connect(endpoints: &[String], timeout: Duration, lock_ttl: Duration) -> Result<Self, SyncError> {
        let store = EtcdKvStore::connect(endpoints, timeout)?;
        Ok(Self::new(Arc::new(store), timeout, lock_ttl))
    }

    /// A backend over a fresh in-process store.
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryKvStore::new()), DEFAULT_TIMEOUT, DEFAULT_LOCK_TTL)
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn lock_ttl(&self) -> Duration {
        self.locks.ttl()
    }

    fn ensure_open(&self) -> Result<(), SyncError> {
        if self.closed.load(Ordering::Acquire) {
            Err(SyncError::BackendUnavailable("sync client is closed".to_string()))
        } else {
            Ok(())
        }
    }

    /// Run one backend call under the per-call timeout.
    async fn call<T, F>(&self, operation: &str, future: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, KvError>>,
    {
        self.ensure_open()?;
        match tokio::time::timeout(self.timeout, future).await {
            Ok(result) => result.map_err(SyncError::from),
            Err(_) => Err(SyncError::BackendUnavailable(format!(
                "{} timed out after {:?}",
                operation, self.timeout
            ))),
        }
    }

    fn compares(key: &str, conditions: &[CasCondition]) -> Vec<Compare> {
        conditions
            .iter()
            .map(|condition| match condition {
                CasCondition::ByRevision(revision) => Compare::ModRevision {
                    key: key.to_string(),
                    revision: *revision,
                },
                CasCondition::ByValue(value) => Compare::Value {
                    key: key.to_string(),
                    value: value.as_bytes().to_vec(),
                },
            })
            .collect()
    }
}

/// Owner identifier written into held locks: host name followed by a random UUID.
fn generate_process_id() -> String {
    let host = hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{}{}", host, Uuid::new_v4())
}

fn child_prefix(key: &str) -> String {
    format!("{}/", key.trim_end_matches('/'))
}

#[async_trait]
impl SyncBackend for EtcdSync {
    fn backend_name(&self) -> &'static str {
        self.store.name()
    }

    fn process_id(&self) -> &str {
        &self.process_id
    }

    #[instrument(skip(self, value), level = "debug", fields(value_len = value.len()))]
    async fn update(&self, key: &str, value: &str) -> Result<(), SyncError> {
        if value.is_empty() {
            return self.ensure_open();
        }
        self.call("update", self.store.put(key, value.as_bytes().to_vec(), None))
            .await
            .map(|_| ())
    }

    #[instrument(skip(self, value), level = "debug", fields(value_len = value.len()))]
    async fn update_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), SyncError> {
        if value.is_empty() {
            return self.ensure_open();
        }
        let lease = self.call("update_ttl", self.store.lease_grant(ttl)).await?;
        self.call("update_ttl", self.store.put(key, value.as_bytes().to_vec(), Some(lease)))
            .await
            .map(|_| ())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, key: &str, recursive: bool) -> Result<(), SyncError> {
        if recursive {
            // The key itself and everything below it, but not siblings sharing its prefix.
            let prefix = child_prefix(key);
            self.call("delete", async {
                tokio::try_join!(self.store.delete(key, false), self.store.delete(&prefix, true))
            })
            .await
            .map(|_| ())
        } else {
            self.call("delete", self.store.delete(key, false)).await.map(|_| ())
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn fetch(&self, key: &str) -> Result<Node, SyncError> {
        let prefix = child_prefix(key);
        let (exact, nested) = self
            .call("fetch", async {
                tokio::try_join!(
                    self.store.range(key, RangeOptions::exact()),
                    self.store.range(&prefix, RangeOptions::prefix()),
                )
            })
            .await?;

        let root = exact
            .kvs
            .into_iter()
            .next()
            .map(|kv| (kv.value_str(), kv.mod_revision));
        let descendants = nested
            .kvs
            .into_iter()
            .map(|kv| {
                let value = kv.value_str();
                (kv.key, value, kv.mod_revision)
            });

        Node::from_range(key, root, descendants).ok_or_else(|| SyncError::KeyNotFound(key.to_string()))
    }

    #[instrument(skip(self, value), level = "debug")]
    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        conditions: &[CasCondition],
    ) -> Result<bool, SyncError> {
        let put = TxnOp::Put {
            key: key.to_string(),
            value: value.as_bytes().to_vec(),
            lease: None,
        };
        let result = self
            .call("compare_and_swap", self.store.txn(Self::compares(key, conditions), vec![put], vec![]))
            .await?;
        Ok(result.succeeded)
    }

    #[instrument(skip(self), level = "debug")]
    async fn compare_and_delete(&self, key: &str, conditions: &[CasCondition]) -> Result<bool, SyncError> {
        let delete = TxnOp::Delete { key: key.to_string() };
        let result = self
            .call("compare_and_delete", self.store.txn(Self::compares(key, conditions), vec![delete], vec![]))
            .await?;
        Ok(result.succeeded)
    }

    fn watch(&self, cancel: CancellationToken, path: &str, start: WatchStart) -> WatchStream {
        if let Err(err) = self.ensure_open() {
            let (tx, rx) = mpsc::channel(1);
            let _ = tx.try_send(Err(err));
            return rx;
        }
        spawn_watch(self.store.clone(), path.to_string(), start, cancel)
    }

    async fn lock(&self, cancel: &CancellationToken, path: &str, block: bool) -> Result<LockToken, SyncError> {
        self.ensure_open()?;
        self.locks.lock(cancel, path, block).await
    }

    async fn unlock(&self, path: &str) -> Result<(), SyncError> {
        self.ensure_open()?;
        self.locks.unlock(path).await
    }

    fn has_lock(&self, path: &str) -> bool {
        self.locks.has_lock(path)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.locks.shutdown();
            self.store.close().await;
        }
    }
}
