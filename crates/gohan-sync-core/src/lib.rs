//! Core traits and types for gohan sync backends.
//!
//! This crate defines the abstractions shared between the sync backend implementations
//! and the components built on top of them (migration runner, post-migration emitter,
//! DB-sync writer):
//! - `SyncBackend`: hierarchical view over a revisioned, lease-based KV store
//! - `Node`: tree returned by hierarchical fetches, with bridge nodes for unwritten paths
//! - `WatchEvent`: a single mutation (or initial read) delivered by a watch
//! - `LockToken`: a held cluster-wide lock and its loss notification

mod error;
mod event;
mod lock;
mod node;
mod sync;

pub use error::SyncError;
pub use event::{Action, WatchEvent, WatchStart, WatchStream};
pub use lock::{with_lock, LockToken};
pub use node::Node;
pub use sync::{CasCondition, SyncBackend};
