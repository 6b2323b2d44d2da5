//! Flat, revision-numbered, lease-based KV store abstraction.
//!
//! This is the narrow surface the sync client needs from etcd v3: ranged reads,
//! puts bound to leases, (prefix) deletes, single-level transactions with equality
//! comparisons, lease management and revision-based watches.

mod etcd;
mod memory;
mod proto;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use etcd::EtcdKvStore;
pub use memory::MemoryKvStore;

/// Lease identifier granted by the store.
pub type LeaseId = i64;

/// Errors returned by a KV store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("KV store unavailable: {0}")]
    Unavailable(String),

    #[error("KV request timed out after {0:?}")]
    Timeout(Duration),

    #[error("KV store client is closed")]
    Closed,

    #[error("Requested revision {0} has been compacted")]
    Compacted(i64),

    #[error("Lease {0} not found")]
    LeaseNotFound(LeaseId),

    #[error("Watch canceled by server: {0}")]
    WatchCanceled(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// A stored key with its revision metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: i64,
    pub mod_revision: i64,
    pub version: i64,
    pub lease: LeaseId,
}

impl KeyValue {
    pub fn value_str(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// Order of range results (always ascending).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortTarget {
    #[default]
    Key,
    ModRevision,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RangeOptions {
    /// Match every key starting with the requested key instead of the key itself.
    pub prefix: bool,
    pub sort: SortTarget,
}

impl RangeOptions {
    pub fn exact() -> Self {
        Self::default()
    }

    pub fn prefix() -> Self {
        Self {
            prefix: true,
            sort: SortTarget::Key,
        }
    }

    pub fn sorted_by(mut self, sort: SortTarget) -> Self {
        self.sort = sort;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RangeResult {
    /// Store revision at the time of the read.
    pub revision: i64,
    pub kvs: Vec<KeyValue>,
}

/// Equality comparison evaluated by a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compare {
    /// Revision at which the key was created; 0 when absent.
    CreateRevision { key: String, revision: i64 },
    /// Revision of the key's last modification; 0 when absent.
    ModRevision { key: String, revision: i64 },
    /// Current value of the key; never equal when absent.
    Value { key: String, value: Vec<u8> },
}

/// Mutation applied by a transaction branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put {
        key: String,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    },
    Delete {
        key: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnResult {
    pub succeeded: bool,
    pub revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvEventKind {
    Put,
    Delete,
}

/// A single mutation observed by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEvent {
    pub kind: KvEventKind,
    pub kv: KeyValue,
}

/// Batches of events (one batch per store response) in revision order.
///
/// The stream ends after cancellation or after delivering an error.
pub type KvWatchStream = mpsc::Receiver<Result<Vec<KvEvent>, KvError>>;

/// KV store abstraction.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Returns the store identifier (e.g., "etcdv3", "memory").
    fn name(&self) -> &'static str;

    async fn range(&self, key: &str, options: RangeOptions) -> Result<RangeResult, KvError>;

    /// Store `value` at `key`, optionally bound to `lease`. Returns the new revision.
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<i64, KvError>;

    /// Delete `key` (or every key under it). Returns the number of deleted keys.
    async fn delete(&self, key: &str, prefix: bool) -> Result<i64, KvError>;

    /// Apply `success` when every comparison holds, `failure` otherwise, atomically.
    async fn txn(
        &self,
        compares: Vec<Compare>,
        success: Vec<TxnOp>,
        failure: Vec<TxnOp>,
    ) -> Result<TxnResult, KvError>;

    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId, KvError>;

    /// Refresh `lease` once. Returns the remaining TTL in seconds (0 if it has expired).
    async fn lease_keep_alive_once(&self, lease: LeaseId) -> Result<i64, KvError>;

    /// Revoke `lease`, deleting every key bound to it.
    async fn lease_revoke(&self, lease: LeaseId) -> Result<(), KvError>;

    /// Watch `key` (or every key under it) starting at `start_revision` inclusive.
    async fn watch(
        &self,
        key: &str,
        prefix: bool,
        start_revision: i64,
        cancel: CancellationToken,
    ) -> Result<KvWatchStream, KvError>;

    async fn close(&self);
}

/// Exclusive end of the key range covering every key that starts with `key`.
pub(crate) fn prefix_range_end(key: &[u8]) -> Vec<u8> {
    let mut end = key.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // Every byte was 0xff: the range is open-ended.
    vec![0]
}
