use std::sync::Arc;

use gohan_sync_core::{Action, SyncError, WatchEvent, WatchStart, WatchStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::kv::{KvEvent, KvEventKind, KvStore, RangeOptions, SortTarget};

const WATCH_BUFFER: usize = 32;

type Sender = mpsc::Sender<Result<WatchEvent, SyncError>>;

/// Start watching `path` and everything under it.
///
/// The returned stream closes once `cancel` fires, or right after the first error.
pub(crate) fn spawn_watch(
    store: Arc<dyn KvStore>,
    path: String,
    start: WatchStart,
    cancel: CancellationToken,
) -> WatchStream {
    let (tx, rx) = mpsc::channel(WATCH_BUFFER);

    tokio::spawn(async move {
        let inner = cancel.child_token();
        let result = run(store.as_ref(), &path, start, &cancel, &inner, &tx).await;
        inner.cancel();

        match result {
            Ok(()) => debug!("watch on {} stopped", path),
            Err(_) if cancel.is_cancelled() => debug!("watch on {} cancelled", path),
            Err(err) => {
                let _ = tx.send(Err(err)).await;
            }
        }
    });

    rx
}

/// Key watched exactly and prefix watched for descendants.
fn split_path(path: &str) -> (Option<String>, String) {
    let trimmed = path.trim_end_matches('/');
    let exact = (!trimmed.is_empty()).then(|| trimmed.to_string());
    (exact, format!("{}/", trimmed))
}

async fn run(
    store: &dyn KvStore,
    path: &str,
    start: WatchStart,
    cancel: &CancellationToken,
    inner: &CancellationToken,
    tx: &Sender,
) -> Result<(), SyncError> {
    let (exact, children) = split_path(path);

    let start_revision = match start {
        WatchStart::Revision(revision) => revision,
        WatchStart::Current => {
            // A single read gives one consistent boundary between `get` and later events.
            let snapshot = store
                .range(
                    exact.as_deref().unwrap_or(&children),
                    RangeOptions::prefix().sorted_by(SortTarget::ModRevision),
                )
                .await?;
            for kv in snapshot.kvs {
                if !owns(exact.as_deref(), &children, &kv.key) {
                    continue;
                }
                let event = WatchEvent::from_raw(Action::Get, kv.key, &kv.value, kv.mod_revision);
                if !deliver(tx, cancel, Ok(event)).await {
                    return Ok(());
                }
            }
            snapshot.revision + 1
        }
    };

    // One prefix watch keeps the events in revision order; keys that merely share the
    // prefix (`/pq` for `/p`) are dropped here.
    let mut rx = store
        .watch(exact.as_deref().unwrap_or(&children), true, start_revision, inner.clone())
        .await?;
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            item = rx.recv() => item,
        };
        let batch = match item {
            Some(batch) => batch?,
            None => return Err(SyncError::BackendUnavailable("watch stream ended".to_string())),
        };
        for event in batch {
            if !owns(exact.as_deref(), &children, &event.kv.key) {
                continue;
            }
            if !deliver(tx, cancel, Ok(convert(event))).await {
                return Ok(());
            }
        }
    }
}

/// Whether `key` is the watched path itself or lies under it.
fn owns(exact: Option<&str>, children: &str, key: &str) -> bool {
    exact == Some(key) || key.starts_with(children)
}

fn convert(event: KvEvent) -> WatchEvent {
    match event.kind {
        KvEventKind::Put => WatchEvent::from_raw(Action::Set, event.kv.key, &event.kv.value, event.kv.mod_revision),
        KvEventKind::Delete => WatchEvent::from_raw(Action::Delete, event.kv.key, &[], event.kv.mod_revision),
    }
}

/// Send one item. Returns false when the watch was cancelled or the receiver is gone.
async fn deliver(tx: &Sender, cancel: &CancellationToken, item: Result<WatchEvent, SyncError>) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/p"), (Some("/p".to_string()), "/p/".to_string()));
        assert_eq!(split_path("/p/"), (Some("/p".to_string()), "/p/".to_string()));
        assert_eq!(split_path("/"), (None, "/".to_string()));
    }

    #[test]
    fn test_owns() {
        assert!(owns(Some("/p"), "/p/", "/p"));
        assert!(owns(Some("/p"), "/p/", "/p/x/y"));
        assert!(!owns(Some("/p"), "/p/", "/pq"));
        assert!(owns(None, "/", "/anything"));
    }

    #[tokio::test]
    async fn test_events_follow_revision_order() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let cancel = CancellationToken::new();
        let mut stream = spawn_watch(store.clone(), "/p".to_string(), WatchStart::Revision(1), cancel.clone());

        store.put("/p/x", b"1".to_vec(), None).await.unwrap();
        store.put("/pq", b"2".to_vec(), None).await.unwrap();
        store.put("/p", b"3".to_vec(), None).await.unwrap();
        store.put("/p/y", b"4".to_vec(), None).await.unwrap();
        store.delete("/p", false).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..4 {
            let event = stream.recv().await.unwrap().unwrap();
            seen.push((event.action, event.key, event.revision));
        }
        assert_eq!(
            seen,
            vec![
                (Action::Set, "/p/x".to_string(), 1),
                (Action::Set, "/p".to_string(), 3),
                (Action::Set, "/p/y".to_string(), 4),
                (Action::Delete, "/p".to_string(), 5),
            ]
        );
        cancel.cancel();
    }
}
