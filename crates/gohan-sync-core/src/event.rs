use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::SyncError;

/// Kind of a watch event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Existing value read before the watch started (`WatchStart::Current` only).
    Get,
    /// Key was created or overwritten.
    Set,
    /// Key was deleted (or its lease expired).
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Get => write!(f, "get"),
            Action::Set => write!(f, "set"),
            Action::Delete => write!(f, "delete"),
        }
    }
}

/// Event delivered by `SyncBackend::watch`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub action: Action,
    pub key: String,
    /// Decoded JSON object stored at `key`. Empty for deletes and for non-object values.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Revision of the mutation (mod revision for `get` events).
    pub revision: i64,
}

impl WatchEvent {
    /// Build an event from a raw stored value.
    pub fn from_raw(action: Action, key: impl Into<String>, value: &[u8], revision: i64) -> Self {
        let data = if value.is_empty() {
            Map::new()
        } else {
            match serde_json::from_slice::<Value>(value) {
                Ok(Value::Object(map)) => map,
                _ => Map::new(),
            }
        };

        Self {
            action,
            key: key.into(),
            data,
            revision,
        }
    }
}

/// Where a watch starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStart {
    /// Emit every existing key as a `get` event, then follow changes made after that read.
    Current,
    /// Follow changes starting at (and including) the given revision.
    Revision(i64),
}

/// Receiving end of a watch.
///
/// The channel closes after cancellation, or after delivering the first error.
pub type WatchStream = mpsc::Receiver<Result<WatchEvent, SyncError>>;
