use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;
use crate::event::{WatchStart, WatchStream};
use crate::lock::LockToken;
use crate::node::Node;

/// Condition of a compare-and-swap. All conditions of one call must hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CasCondition {
    /// The key's last modification happened at this revision (0 = key absent).
    ByRevision(i64),
    /// The key currently stores exactly this value.
    ByValue(String),
}

/// Sync backend abstraction: a hierarchical tree view over a flat, revisioned,
/// lease-based KV store.
///
/// Implementations never log; every failure is returned to the caller and nothing
/// is retried except the lease refresh of held locks, which gives up on the first
/// failure rather than risk two owners.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    /// Returns the backend identifier (e.g., "etcdv3", "memory").
    fn backend_name(&self) -> &'static str;

    /// Identifier written as the value of every lock this process holds.
    fn process_id(&self) -> &str;

    // =========================================================================
    // Key Operations
    // =========================================================================

    /// Write `value` at `key`. An empty value is a no-op: the store has no directories.
    async fn update(&self, key: &str, value: &str) -> Result<(), SyncError>;

    /// Write `value` at `key` bound to a fresh lease, so the key disappears after `ttl`.
    async fn update_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), SyncError>;

    /// Delete `key`, or every key under it when `recursive`. Missing keys are not an error.
    async fn delete(&self, key: &str, recursive: bool) -> Result<(), SyncError>;

    /// Fetch the node at `key` with all its descendants as a tree.
    async fn fetch(&self, key: &str) -> Result<Node, SyncError>;

    /// Write `value` at `key` only if every condition holds. Returns whether it was written.
    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        conditions: &[CasCondition],
    ) -> Result<bool, SyncError>;

    /// Delete `key` only if every condition holds. Returns whether the guard held.
    async fn compare_and_delete(
        &self,
        key: &str,
        conditions: &[CasCondition],
    ) -> Result<bool, SyncError>;

    // =========================================================================
    // Watch
    // =========================================================================

    /// Watch `path` and everything under it.
    ///
    /// Events arrive in revision order. Cancelling `cancel` stops both underlying
    /// watches and closes the stream; any other failure is delivered as the last item.
    fn watch(&self, cancel: CancellationToken, path: &str, start: WatchStart) -> WatchStream;

    // =========================================================================
    // Locking
    // =========================================================================

    /// Acquire the cluster-wide lock at `path`.
    ///
    /// Returns immediately if this process already holds it. When `block` is false a
    /// held lock yields `SyncError::LockContended`; otherwise the call retries once per
    /// lease TTL until it succeeds or `cancel` fires.
    async fn lock(
        &self,
        cancel: &CancellationToken,
        path: &str,
        block: bool,
    ) -> Result<LockToken, SyncError>;

    /// Release the lock at `path`. No-op if it is not held.
    async fn unlock(&self, path: &str) -> Result<(), SyncError>;

    /// Whether this process currently holds the lock at `path` (local lookup only).
    fn has_lock(&self, path: &str) -> bool;

    /// Close the backend; every later operation fails with `BackendUnavailable`.
    async fn close(&self);
}
