use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use gohan_sync_core::{LockToken, SyncError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::kv::{Compare, KvStore, LeaseId, TxnOp};

/// Shortest interval between two lease refreshes.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(100);

struct HeldLock {
    lease: LeaseId,
    token: CancellationToken,
}

/// Locks held by this process, keyed by path.
///
/// A lock is a key created with `CreateRevision == 0` and bound to a lease. While it
/// is held a background task refreshes the lease every half TTL; the first failed
/// refresh drops the entry and cancels the lock's token, so the lease is left to
/// expire instead of being retried.
pub(crate) struct LockTable {
    store: Arc<dyn KvStore>,
    owner: String,
    ttl: Duration,
    held: Arc<DashMap<String, HeldLock>>,
    shutdown: CancellationToken,
}

impl LockTable {
    pub(crate) fn new(store: Arc<dyn KvStore>, owner: String, ttl: Duration) -> Self {
        Self {
            store,
            owner,
            ttl,
            held: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub(crate) fn ttl(&self) -> Duration {
        self.ttl
    }

    pub(crate) fn has_lock(&self, path: &str) -> bool {
        self.held.contains_key(path)
    }

    #[instrument(skip(self, cancel), level = "debug")]
    pub(crate) async fn lock(
        &self,
        cancel: &CancellationToken,
        path: &str,
        block: bool,
    ) -> Result<LockToken, SyncError> {
        loop {
            if let Some(held) = self.held.get(path) {
                return Ok(LockToken::new(path, held.token.clone()));
            }
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled(format!("lock {}", path)));
            }

            match self.try_acquire(path).await {
                Ok(Some(lease)) => {
                    let token = self.shutdown.child_token();
                    self.held.insert(
                        path.to_string(),
                        HeldLock {
                            lease,
                            token: token.clone(),
                        },
                    );
                    self.spawn_refresh(path.to_string(), lease, token.clone());
                    debug!("acquired lock {} with lease {}", path, lease);
                    return Ok(LockToken::new(path, token));
                }
                Ok(None) if !block => return Err(SyncError::LockContended(path.to_string())),
                Err(err) if !block => return Err(err),
                Ok(None) => debug!("lock {} is held elsewhere, retrying in {:?}", path, self.ttl),
                Err(err) => debug!("lock {} attempt failed ({}), retrying in {:?}", path, err, self.ttl),
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(SyncError::Cancelled(format!("lock {}", path)));
                }
                _ = self.shutdown.cancelled() => {
                    return Err(SyncError::BackendUnavailable("sync client is closed".to_string()));
                }
                _ = tokio::time::sleep(self.ttl) => {}
            }
        }
    }

    /// One acquisition attempt. Returns the lease on success, `None` when the key exists.
    async fn try_acquire(&self, path: &str) -> Result<Option<LeaseId>, SyncError> {
        let lease = self.store.lease_grant(self.ttl).await?;
        let outcome = self
            .store
            .txn(
                vec![Compare::CreateRevision {
                    key: path.to_string(),
                    revision: 0,
                }],
                vec![TxnOp::Put {
                    key: path.to_string(),
                    value: self.owner.as_bytes().to_vec(),
                    lease: Some(lease),
                }],
                vec![],
            )
            .await;

        match outcome {
            Ok(result) if result.succeeded => Ok(Some(lease)),
            Ok(_) => {
                let _ = self.store.lease_revoke(lease).await;
                Ok(None)
            }
            Err(err) => {
                let _ = self.store.lease_revoke(lease).await;
                Err(err.into())
            }
        }
    }

    fn spawn_refresh(&self, path: String, lease: LeaseId, token: CancellationToken) {
        let store = self.store.clone();
        let held = self.held.clone();
        let interval = (self.ttl / 2).max(MIN_REFRESH_INTERVAL);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                let refreshed = store.lease_keep_alive_once(lease).await;
                if token.is_cancelled() {
                    return;
                }
                match refreshed {
                    Ok(ttl) if ttl > 0 => continue,
                    Ok(_) => warn!("lost lock {}: lease {} expired", path, lease),
                    Err(err) => warn!("lost lock {}: refreshing lease {} failed: {}", path, lease, err),
                }

                held.remove_if(&path, |_, entry| entry.lease == lease);
                token.cancel();
                return;
            }
        });
    }

    /// Release `path`: stop the refresh, revoke the lease and delete the key if this
    /// process still owns it. Fails only when both the revoke and the delete fail.
    #[instrument(skip(self), level = "debug")]
    pub(crate) async fn unlock(&self, path: &str) -> Result<(), SyncError> {
        let Some((_, held)) = self.held.remove(path) else {
            return Ok(());
        };
        held.token.cancel();

        let revoked = self.store.lease_revoke(held.lease).await;
        let deleted = self
            .store
            .txn(
                vec![Compare::Value {
                    key: path.to_string(),
                    value: self.owner.as_bytes().to_vec(),
                }],
                vec![TxnOp::Delete {
                    key: path.to_string(),
                }],
                vec![],
            )
            .await;

        match (revoked, deleted) {
            (Err(revoke_err), Err(delete_err)) => Err(SyncError::BackendUnavailable(format!(
                "failed to release lock {}: {}; {}",
                path, revoke_err, delete_err
            ))),
            _ => {
                debug!("released lock {}", path);
                Ok(())
            }
        }
    }

    /// Stop every refresh task and mark all held locks as lost.
    pub(crate) fn shutdown(&self) {
        self.shutdown.cancel();
        self.held.clear();
    }
}
