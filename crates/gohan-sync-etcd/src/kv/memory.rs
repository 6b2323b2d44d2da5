use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    Compare, KeyValue, KvError, KvEvent, KvEventKind, KvStore, KvWatchStream, LeaseId,
    RangeOptions, RangeResult, SortTarget, TxnOp, TxnResult,
};

const BROADCAST_CAPACITY: usize = 1024;
const WATCH_BUFFER: usize = 64;
/// Revisions of history kept for watches by default.
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

/// One committed revision and the mutations it made.
#[derive(Clone)]
struct Batch {
    revision: i64,
    events: Vec<KvEvent>,
}

#[derive(Default)]
struct State {
    revision: i64,
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
    history: Vec<Batch>,
    history_limit: usize,
    /// Newest revision dropped from `history`; watches must start after it.
    compacted: i64,
    closed: bool,
}

/// State and the event fan-out, shared with the lease timers.
struct Shared {
    state: Mutex<State>,
    events: broadcast::Sender<Batch>,
}

/// In-process KV store with etcd's revision, lease and watch semantics.
///
/// Every committed mutation increments the store revision once. Each lease has a
/// timer task that deletes its keys when the deadline passes, so watchers see the
/// expiry even when nobody else touches the store. The last `history_limit`
/// revisions are kept for watches; starting a watch at an older revision fails
/// with [`KvError::Compacted`].
pub struct MemoryKvStore {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Keep at most `limit` revisions of watch history.
    pub fn with_history_limit(limit: usize) -> Self {
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    next_lease: 1,
                    history_limit: limit.max(1),
                    ..Default::default()
                }),
                events,
            }),
            shutdown: CancellationToken::new(),
        }
    }

    /// Current store revision.
    pub fn revision(&self) -> i64 {
        self.shared.lock_state().revision
    }

    /// Newest revision no longer available to watches (0 if none).
    pub fn compacted_revision(&self) -> i64 {
        self.shared.lock_state().compacted
    }

    /// Lock the state, fail if closed and expire due leases.
    fn open_state(&self) -> Result<MutexGuard<'_, State>, KvError> {
        let mut state = self.shared.lock_state();
        if state.closed {
            return Err(KvError::Closed);
        }
        self.shared.expire_leases(&mut state);
        Ok(state)
    }

    /// Delete the keys of `lease` once its deadline passes, following keep-alives.
    fn spawn_expiry(&self, lease: LeaseId) {
        let weak = Arc::downgrade(&self.shared);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let deadline = {
                    let Some(shared) = weak.upgrade() else { return };
                    let state = shared.lock_state();
                    let deadline = match state.leases.get(&lease) {
                        Some(held) if !state.closed => held.deadline,
                        _ => return,
                    };
                    deadline
                };

                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => {}
                }

                let Some(shared) = weak.upgrade() else { return };
                let mut state = shared.lock_state();
                if state.closed {
                    return;
                }
                shared.expire_leases(&mut state);
            }
        });
    }

    fn evaluate(state: &State, compare: &Compare) -> bool {
        match compare {
            Compare::CreateRevision { key, revision } => {
                state.kvs.get(key).map(|kv| kv.create_revision).unwrap_or(0) == *revision
            }
            Compare::ModRevision { key, revision } => {
                state.kvs.get(key).map(|kv| kv.mod_revision).unwrap_or(0) == *revision
            }
            Compare::Value { key, value } => state.kvs.get(key).is_some_and(|kv| &kv.value == value),
        }
    }

    fn check_leases(state: &State, ops: &[TxnOp]) -> Result<(), KvError> {
        for op in ops {
            if let TxnOp::Put {
                lease: Some(lease), ..
            } = op
            {
                if !state.leases.contains_key(lease) {
                    return Err(KvError::LeaseNotFound(*lease));
                }
            }
        }
        Ok(())
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expire_leases(&self, state: &mut State) {
        let now = Instant::now();
        let mut expired: Vec<LeaseId> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();

        for id in expired {
            if let Some(lease) = state.leases.remove(&id) {
                debug!("lease {} expired ({} keys)", id, lease.keys.len());
                let mut keys: Vec<String> = lease.keys.into_iter().collect();
                keys.sort();
                self.commit(state, keys.into_iter().map(|key| TxnOp::Delete { key }).collect());
            }
        }
    }

    /// Apply `ops` as a single revision. Returns the store revision afterwards.
    fn commit(&self, state: &mut State, ops: Vec<TxnOp>) -> i64 {
        let revision = state.revision + 1;
        let mut events = Vec::new();

        for op in ops {
            match op {
                TxnOp::Put { key, value, lease } => {
                    let previous = state.kvs.get(&key);
                    if let Some(old_lease) = previous.map(|kv| kv.lease).filter(|l| *l != 0) {
                        if let Some(old) = state.leases.get_mut(&old_lease) {
                            old.keys.remove(&key);
                        }
                    }
                    let kv = KeyValue {
                        key: key.clone(),
                        value,
                        create_revision: previous.map(|kv| kv.create_revision).unwrap_or(revision),
                        mod_revision: revision,
                        version: previous.map(|kv| kv.version).unwrap_or(0) + 1,
                        lease: lease.unwrap_or(0),
                    };
                    if let Some(lease) = lease.and_then(|id| state.leases.get_mut(&id)) {
                        lease.keys.insert(key.clone());
                    }
                    events.push(KvEvent {
                        kind: KvEventKind::Put,
                        kv: kv.clone(),
                    });
                    state.kvs.insert(key, kv);
                }
                TxnOp::Delete { key } => {
                    if let Some(removed) = state.kvs.remove(&key) {
                        if let Some(lease) = state.leases.get_mut(&removed.lease) {
                            lease.keys.remove(&key);
                        }
                        events.push(KvEvent {
                            kind: KvEventKind::Delete,
                            kv: KeyValue {
                                key,
                                mod_revision: revision,
                                ..Default::default()
                            },
                        });
                    }
                }
            }
        }

        if events.is_empty() {
            return state.revision;
        }

        state.revision = revision;
        let batch = Batch { revision, events };
        state.history.push(batch.clone());
        if state.history.len() > state.history_limit {
            let excess = state.history.len() - state.history_limit;
            if let Some(last) = state.history.drain(..excess).last() {
                debug!("compacted history up to revision {}", last.revision);
                state.compacted = last.revision;
            }
        }
        // No receivers is fine: nobody is watching.
        let _ = self.events.send(batch);
        revision
    }
}

fn matches(key: &str, pattern: &str, prefix: bool) -> bool {
    if prefix {
        key.starts_with(pattern)
    } else {
        key == pattern
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn range(&self, key: &str, options: RangeOptions) -> Result<RangeResult, KvError> {
        let state = self.open_state()?;
        let mut kvs: Vec<KeyValue> = if options.prefix {
            state
                .kvs
                .range(key.to_string()..)
                .take_while(|(k, _)| k.starts_with(key))
                .map(|(_, kv)| kv.clone())
                .collect()
        } else {
            state.kvs.get(key).cloned().into_iter().collect()
        };
        if options.sort == SortTarget::ModRevision {
            kvs.sort_by_key(|kv| kv.mod_revision);
        }
        Ok(RangeResult {
            revision: state.revision,
            kvs,
        })
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<i64, KvError> {
        let mut state = self.open_state()?;
        let op = TxnOp::Put {
            key: key.to_string(),
            value,
            lease,
        };
        Self::check_leases(&state, std::slice::from_ref(&op))?;
        Ok(self.shared.commit(&mut state, vec![op]))
    }

    async fn delete(&self, key: &str, prefix: bool) -> Result<i64, KvError> {
        let mut state = self.open_state()?;
        let ops: Vec<TxnOp> = state
            .kvs
            .keys()
            .filter(|k| matches(k, key, prefix))
            .map(|k| TxnOp::Delete { key: k.clone() })
            .collect();
        let deleted = ops.len() as i64;
        self.shared.commit(&mut state, ops);
        Ok(deleted)
    }

    async fn txn(
        &self,
        compares: Vec<Compare>,
        success: Vec<TxnOp>,
        failure: Vec<TxnOp>,
    ) -> Result<TxnResult, KvError> {
        let mut state = self.open_state()?;
        let succeeded = compares.iter().all(|c| Self::evaluate(&state, c));
        let ops = if succeeded { success } else { failure };
        Self::check_leases(&state, &ops)?;
        let revision = self.shared.commit(&mut state, ops);
        Ok(TxnResult {
            succeeded,
            revision,
        })
    }

    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId, KvError> {
        let mut state = self.open_state()?;
        let id = state.next_lease;
        state.next_lease += 1;
        state.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        drop(state);
        self.spawn_expiry(id);
        Ok(id)
    }

    async fn lease_keep_alive_once(&self, lease: LeaseId) -> Result<i64, KvError> {
        let mut state = self.open_state()?;
        match state.leases.get_mut(&lease) {
            Some(held) => {
                held.deadline = Instant::now() + held.ttl;
                Ok(held.ttl.as_secs().max(1) as i64)
            }
            None => Ok(0),
        }
    }

    async fn lease_revoke(&self, lease: LeaseId) -> Result<(), KvError> {
        let mut state = self.open_state()?;
        let Some(revoked) = state.leases.remove(&lease) else {
            return Err(KvError::LeaseNotFound(lease));
        };
        let mut keys: Vec<String> = revoked.keys.into_iter().collect();
        keys.sort();
        self.shared.commit(&mut state, keys.into_iter().map(|key| TxnOp::Delete { key }).collect());
        Ok(())
    }

    async fn watch(
        &self,
        key: &str,
        prefix: bool,
        start_revision: i64,
        cancel: CancellationToken,
    ) -> Result<KvWatchStream, KvError> {
        let (backlog, mut live, mut seen) = {
            let state = self.open_state()?;
            if start_revision > 0 && start_revision <= state.compacted {
                return Err(KvError::Compacted(state.compacted));
            }
            let start = if start_revision <= 0 {
                state.revision + 1
            } else {
                start_revision
            };
            let backlog: Vec<Batch> = state
                .history
                .iter()
                .filter(|batch| batch.revision >= start)
                .cloned()
                .collect();
            // Subscribed under the state lock, so no batch is missed or repeated.
            (backlog, self.shared.events.subscribe(), state.revision)
        };

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let shutdown = self.shutdown.clone();
        let pattern = key.to_string();

        tokio::spawn(async move {
            let filter = |batch: Batch| -> Vec<KvEvent> {
                batch
                    .events
                    .into_iter()
                    .filter(|event| matches(&event.kv.key, &pattern, prefix))
                    .collect()
            };

            for batch in backlog {
                let events = filter(batch);
                if events.is_empty() {
                    continue;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = tx.send(Ok(events)) => if sent.is_err() { return },
                }
            }

            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = shutdown.cancelled() => {
                        let _ = tx.send(Err(KvError::Closed)).await;
                        return;
                    }
                    received = live.recv() => received,
                };

                match received {
                    Ok(batch) => {
                        seen = batch.revision;
                        let events = filter(batch);
                        if events.is_empty() {
                            continue;
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            sent = tx.send(Ok(events)) => if sent.is_err() { return },
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Revisions are consecutive: the skipped ones end at seen + missed.
                        let _ = tx.send(Err(KvError::Compacted(seen + missed as i64))).await;
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = tx.send(Err(KvError::Closed)).await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn close(&self) {
        let mut state = self.shared.lock_state();
        if !state.closed {
            state.closed = true;
            self.shutdown.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_range_revisions() {
        let store = MemoryKvStore::new();
        assert_eq!(store.put("/a", b"1".to_vec(), None).await.unwrap(), 1);
        assert_eq!(store.put("/a", b"2".to_vec(), None).await.unwrap(), 2);

        let result = store.range("/a", RangeOptions::exact()).await.unwrap();
        assert_eq!(result.revision, 2);
        let kv = &result.kvs[0];
        assert_eq!(kv.value_str(), "2");
        assert_eq!(kv.create_revision, 1);
        assert_eq!(kv.mod_revision, 2);
        assert_eq!(kv.version, 2);
    }

    #[tokio::test]
    async fn test_prefix_range_sorted() {
        let store = MemoryKvStore::new();
        store.put("/p/b", b"b".to_vec(), None).await.unwrap();
        store.put("/p/a", b"a".to_vec(), None).await.unwrap();
        store.put("/q", b"q".to_vec(), None).await.unwrap();

        let by_key = store.range("/p/", RangeOptions::prefix()).await.unwrap();
        let keys: Vec<&str> = by_key.kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["/p/a", "/p/b"]);

        let by_rev = store
            .range("/p/", RangeOptions::prefix().sorted_by(SortTarget::ModRevision))
            .await
            .unwrap();
        let keys: Vec<&str> = by_rev.kvs.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["/p/b", "/p/a"]);
    }

    #[tokio::test]
    async fn test_delete_missing_keeps_revision() {
        let store = MemoryKvStore::new();
        store.put("/a", b"1".to_vec(), None).await.unwrap();
        assert_eq!(store.delete("/missing", false).await.unwrap(), 0);
        assert_eq!(store.revision(), 1);
        assert_eq!(store.delete("/a", true).await.unwrap(), 1);
        assert_eq!(store.revision(), 2);
    }

    #[tokio::test]
    async fn test_txn_create_revision_guard() {
        let store = MemoryKvStore::new();
        let guard = || {
            vec![Compare::CreateRevision {
                key: "/lock".to_string(),
                revision: 0,
            }]
        };
        let put = || {
            vec![TxnOp::Put {
                key: "/lock".to_string(),
                value: b"me".to_vec(),
                lease: None,
            }]
        };

        assert!(store.txn(guard(), put(), vec![]).await.unwrap().succeeded);
        assert!(!store.txn(guard(), put(), vec![]).await.unwrap().succeeded);
    }

    #[tokio::test]
    async fn test_value_compare_on_missing_key_fails() {
        let store = MemoryKvStore::new();
        let result = store
            .txn(
                vec![Compare::Value {
                    key: "/k".to_string(),
                    value: Vec::new(),
                }],
                vec![TxnOp::Delete {
                    key: "/k".to_string(),
                }],
                vec![],
            )
            .await
            .unwrap();
        assert!(!result.succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_deletes_keys() {
        let store = MemoryKvStore::new();
        let lease = store.lease_grant(Duration::from_secs(2)).await.unwrap();
        store.put("/ttl", b"v".to_vec(), Some(lease)).await.unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.lease_keep_alive_once(lease).await.unwrap(), 2);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.range("/ttl", RangeOptions::exact()).await.unwrap().kvs.len(), 1);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(store.range("/ttl", RangeOptions::exact()).await.unwrap().kvs.is_empty());
        assert_eq!(store.lease_keep_alive_once(lease).await.unwrap(), 0);
        assert_eq!(store.lease_revoke(lease).await, Err(KvError::LeaseNotFound(lease)));
    }

    #[tokio::test]
    async fn test_put_with_unknown_lease_fails() {
        let store = MemoryKvStore::new();
        assert_eq!(
            store.put("/k", b"v".to_vec(), Some(99)).await,
            Err(KvError::LeaseNotFound(99))
        );
    }

    #[tokio::test]
    async fn test_revoke_deletes_keys() {
        let store = MemoryKvStore::new();
        let lease = store.lease_grant(Duration::from_secs(10)).await.unwrap();
        store.put("/l/1", b"a".to_vec(), Some(lease)).await.unwrap();
        store.put("/l/2", b"b".to_vec(), Some(lease)).await.unwrap();
        store.lease_revoke(lease).await.unwrap();
        assert!(store.range("/l/", RangeOptions::prefix()).await.unwrap().kvs.is_empty());
    }

    #[tokio::test]
    async fn test_watch_replays_and_follows() {
        let store = MemoryKvStore::new();
        store.put("/w/a", b"1".to_vec(), None).await.unwrap();
        store.put("/other", b"x".to_vec(), None).await.unwrap();

        let cancel = CancellationToken::new();
        let mut stream = store.watch("/w/", true, 1, cancel.clone()).await.unwrap();

        let first = stream.recv().await.unwrap().unwrap();
        assert_eq!(first[0].kv.key, "/w/a");
        assert_eq!(first[0].kind, KvEventKind::Put);

        store.delete("/w/a", false).await.unwrap();
        let second = stream.recv().await.unwrap().unwrap();
        assert_eq!(second[0].kind, KvEventKind::Delete);
        assert_eq!(second[0].kv.mod_revision, 3);

        cancel.cancel();
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_rejects_and_ends_watches() {
        let store = MemoryKvStore::new();
        let mut stream = store
            .watch("/w", false, 0, CancellationToken::new())
            .await
            .unwrap();
        store.close().await;

        assert_eq!(stream.recv().await.unwrap(), Err(KvError::Closed));
        assert_eq!(store.put("/w", b"v".to_vec(), None).await, Err(KvError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_reaches_idle_watcher() {
        let store = MemoryKvStore::new();
        let lease = store.lease_grant(Duration::from_secs(2)).await.unwrap();
        store.put("/ttl", b"v".to_vec(), Some(lease)).await.unwrap();
        let mut stream = store
            .watch("/ttl", false, 0, CancellationToken::new())
            .await
            .unwrap();

        // Nothing else touches the store; the lease timer alone deletes the key.
        let events = stream.recv().await.unwrap().unwrap();
        assert_eq!(events[0].kind, KvEventKind::Delete);
        assert_eq!(events[0].kv.key, "/ttl");
        assert_eq!(events[0].kv.mod_revision, 2);
    }

    #[tokio::test]
    async fn test_history_compaction() {
        let store = MemoryKvStore::with_history_limit(2);
        for value in ["1", "2", "3", "4"] {
            store.put("/c", value.as_bytes().to_vec(), None).await.unwrap();
        }
        assert_eq!(store.compacted_revision(), 2);

        for start in [1, 2] {
            assert_eq!(
                store.watch("/c", false, start, CancellationToken::new()).await.err(),
                Some(KvError::Compacted(2))
            );
        }

        let mut stream = store.watch("/c", false, 3, CancellationToken::new()).await.unwrap();
        let replayed = stream.recv().await.unwrap().unwrap();
        assert_eq!(replayed[0].kv.value_str(), "3");
        assert_eq!(replayed[0].kv.mod_revision, 3);
        let replayed = stream.recv().await.unwrap().unwrap();
        assert_eq!(replayed[0].kv.mod_revision, 4);

        // Watching from now on is unaffected.
        assert!(store.watch("/c", false, 0, CancellationToken::new()).await.is_ok());
    }
}
