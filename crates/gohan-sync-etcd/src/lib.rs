//! etcd v3 and in-memory sync backends.
//!
//! `EtcdSync` implements [`gohan_sync_core::SyncBackend`] on top of any [`KvStore`]:
//! - [`EtcdKvStore`]: etcd v3 over gRPC (KV, Lease and Watch services)
//! - [`MemoryKvStore`]: in-process store with the same revision, lease and watch
//!   semantics, used for single-node setups and tests

mod config;
mod kv;
mod lock;
mod sync;
mod watch;

pub use config::{create_from_config, SyncConfig, SyncType};
pub use kv::{
    Compare, EtcdKvStore, KeyValue, KvError, KvEvent, KvEventKind, KvStore, KvWatchStream,
    LeaseId, MemoryKvStore, RangeOptions, RangeResult, SortTarget, TxnOp, TxnResult,
};
pub use sync::{EtcdSync, DEFAULT_LOCK_TTL, DEFAULT_TIMEOUT};
