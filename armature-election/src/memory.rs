//! In-memory coordination store (for testing/development)

use crate::store::{
    CoordinationStore, KeyValue, LeaseId, RangeRequest, Revision, SortOrder, StoreError, Txn,
    TxnOp, TxnOpResponse, TxnResponse, WatchEvent, WatchTarget, Watcher,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

type WatchSender = mpsc::UnboundedSender<Result<WatchEvent, StoreError>>;

struct LeaseEntry {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct WatchRegistration {
    target: WatchTarget,
    tx: WatchSender,
}

struct MemoryState {
    revision: Revision,
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, LeaseEntry>,
    next_lease_id: i64,
    watchers: HashMap<u64, WatchRegistration>,
    next_watcher_id: u64,
    unavailable: bool,
}

impl MemoryState {
    fn new() -> Self {
        Self {
            revision: 1,
            kvs: BTreeMap::new(),
            leases: HashMap::new(),
            next_lease_id: 7_000,
            watchers: HashMap::new(),
            next_watcher_id: 1,
            unavailable: false,
        }
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable {
            Err(StoreError::Connection("store unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn notify(&mut self, event: WatchEvent) {
        self.watchers.retain(|_, registration| {
            if !registration.target.matches(event.key()) {
                return true;
            }
            registration.tx.send(Ok(event.clone())).is_ok()
        });
    }

    fn put_key(&mut self, key: String, value: String, lease: Option<LeaseId>, revision: Revision) {
        let kv = match self.kvs.get(&key) {
            Some(existing) => KeyValue {
                key: key.clone(),
                value,
                create_revision: existing.create_revision,
                mod_revision: revision,
                version: existing.version + 1,
                lease,
            },
            None => KeyValue {
                key: key.clone(),
                value,
                create_revision: revision,
                mod_revision: revision,
                version: 1,
                lease,
            },
        };

        if let Some(previous) = self.kvs.get(&key).and_then(|kv| kv.lease)
            && Some(previous) != lease
            && let Some(entry) = self.leases.get_mut(&previous)
        {
            entry.keys.remove(&key);
        }
        if let Some(id) = lease
            && let Some(entry) = self.leases.get_mut(&id)
        {
            entry.keys.insert(key.clone());
        }

        self.kvs.insert(key, kv.clone());
        self.notify(WatchEvent::Put(kv));
    }

    fn delete_key(&mut self, key: &str, revision: Revision) -> bool {
        let Some(mut kv) = self.kvs.remove(key) else {
            return false;
        };

        if let Some(id) = kv.lease
            && let Some(entry) = self.leases.get_mut(&id)
        {
            entry.keys.remove(key);
        }

        kv.mod_revision = revision;
        self.notify(WatchEvent::Delete(kv));
        true
    }

    fn expire(&mut self, id: LeaseId) -> bool {
        let Some(entry) = self.leases.remove(&id) else {
            return false;
        };

        if !entry.keys.is_empty() {
            self.revision += 1;
            let revision = self.revision;
            for key in &entry.keys {
                self.delete_key(key, revision);
            }
        }
        debug!("Lease {} expired ({} keys)", id, entry.keys.len());
        true
    }

    fn reap(&mut self) {
        let now = Instant::now();
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            self.expire(id);
        }
    }

    fn apply(&mut self, txn: Txn) -> Result<TxnResponse, StoreError> {
        let succeeded = txn
            .compares
            .iter()
            .all(|cmp| cmp.matches(self.kvs.get(&cmp.key)));
        let ops = if succeeded { txn.success } else { txn.failure };

        // Validate before mutating so the branch applies all-or-nothing
        for op in &ops {
            if let TxnOp::Put {
                lease: Some(id), ..
            } = op
                && !self.leases.contains_key(id)
            {
                return Err(StoreError::LeaseNotFound(*id));
            }
        }

        let next = self.revision + 1;
        let mut wrote = false;
        let mut responses = Vec::with_capacity(ops.len());

        for op in ops {
            match op {
                TxnOp::Put { key, value, lease } => {
                    self.put_key(key, value, lease, next);
                    wrote = true;
                    responses.push(TxnOpResponse::Put);
                }
                TxnOp::Get { key } => {
                    let kvs = self.kvs.get(&key).cloned().into_iter().collect();
                    responses.push(TxnOpResponse::Get(kvs));
                }
                TxnOp::Delete { key } => {
                    let deleted = self.delete_key(&key, next);
                    wrote |= deleted;
                    responses.push(TxnOpResponse::Delete {
                        deleted: i64::from(deleted),
                    });
                }
            }
        }

        if wrote {
            self.revision = next;
        }

        Ok(TxnResponse {
            succeeded,
            header_revision: self.revision,
            responses,
        })
    }
}

/// In-memory coordination store
///
/// Implements revisions, leases with TTL expiry, transactions and
/// key/prefix watches with the same semantics the election relies on from a
/// real store. Clones share state.
#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::new())),
        }
    }

    /// Current store revision
    pub fn revision(&self) -> Revision {
        self.state.lock().revision
    }

    /// Unconditionally write a key (no lease)
    pub async fn put(&self, key: &str, value: &str) -> Result<Revision, StoreError> {
        let response = self.txn(Txn::new().and_then(TxnOp::put(key, value))).await?;
        Ok(response.header_revision)
    }

    /// Unconditionally delete a key; returns whether it existed
    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let response = self.txn(Txn::new().and_then(TxnOp::delete(key))).await?;
        Ok(matches!(
            response.responses.first(),
            Some(TxnOpResponse::Delete { deleted: 1 })
        ))
    }

    /// Drop a lease as if its TTL ran out, deleting its keys
    pub fn expire_lease(&self, id: LeaseId) -> bool {
        self.state.lock().expire(id)
    }

    /// Whether a lease is currently live
    pub fn has_lease(&self, id: LeaseId) -> bool {
        let mut state = self.state.lock();
        state.reap();
        state.leases.contains_key(&id)
    }

    /// Deliver an error to every open watch
    pub fn fail_watches(&self, message: &str) {
        let state = self.state.lock();
        for registration in state.watchers.values() {
            let _ = registration
                .tx
                .send(Err(StoreError::Watch(message.to_string())));
        }
    }

    /// Make every request fail with a connection error while `true`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Number of watches not yet cancelled
    pub fn active_watchers(&self) -> usize {
        self.state.lock().watchers.len()
    }

    fn spawn_reaper(&self, id: LeaseId) {
        let weak = Arc::downgrade(&self.state);
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let Some(state) = weak.upgrade() else { return };
                    let state = state.lock();
                    let Some(entry) = state.leases.get(&id) else { return };
                    entry.deadline
                };

                tokio::time::sleep_until(deadline).await;

                let Some(state) = weak.upgrade() else { return };
                let mut state = state.lock();
                match state.leases.get(&id) {
                    None => return,
                    Some(entry) if entry.deadline <= Instant::now() => {
                        state.expire(id);
                        return;
                    }
                    Some(_) => continue,
                }
            }
        });
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.reap();
        Ok(state.kvs.get(key).cloned())
    }

    async fn range(&self, request: RangeRequest) -> Result<Vec<KeyValue>, StoreError> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.reap();

        let mut kvs: Vec<KeyValue> = state
            .kvs
            .range(request.prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(request.prefix.as_str()))
            .map(|(_, kv)| kv)
            .filter(|kv| {
                request
                    .max_create_revision
                    .is_none_or(|max| kv.create_revision <= max)
            })
            .cloned()
            .collect();

        match request.sort {
            Some(SortOrder::Ascend) => kvs.sort_by_key(|kv| kv.create_revision),
            Some(SortOrder::Descend) => {
                kvs.sort_by_key(|kv| std::cmp::Reverse(kv.create_revision))
            }
            None => {}
        }

        if let Some(limit) = request.limit {
            kvs.truncate(limit);
        }
        if request.keys_only {
            for kv in kvs.iter_mut() {
                kv.value.clear();
            }
        }

        Ok(kvs)
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse, StoreError> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.reap();
        state.apply(txn)
    }

    async fn watch(&self, target: WatchTarget) -> Result<Box<dyn Watcher>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.check_available()?;
        state.reap();

        let id = state.next_watcher_id;
        state.next_watcher_id += 1;
        state.watchers.insert(id, WatchRegistration { target, tx });

        Ok(Box::new(MemoryWatcher {
            id,
            rx,
            state: Arc::downgrade(&self.state),
        }))
    }

    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId, StoreError> {
        let id = {
            let mut state = self.state.lock();
            state.check_available()?;

            let id = LeaseId(state.next_lease_id);
            state.next_lease_id += 1;
            state.leases.insert(
                id,
                LeaseEntry {
                    ttl,
                    deadline: Instant::now() + ttl,
                    keys: BTreeSet::new(),
                },
            );
            id
        };

        self.spawn_reaper(id);
        Ok(id)
    }

    async fn lease_revoke(&self, id: LeaseId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.check_available()?;
        if state.expire(id) {
            Ok(())
        } else {
            Err(StoreError::LeaseNotFound(id))
        }
    }

    async fn lease_keep_alive(&self, id: LeaseId) -> Result<Option<Duration>, StoreError> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.reap();

        Ok(state.leases.get_mut(&id).map(|entry| {
            entry.deadline = Instant::now() + entry.ttl;
            entry.ttl
        }))
    }
}

struct MemoryWatcher {
    id: u64,
    rx: mpsc::UnboundedReceiver<Result<WatchEvent, StoreError>>,
    state: Weak<Mutex<MemoryState>>,
}

impl MemoryWatcher {
    fn unregister(&self) {
        if let Some(state) = self.state.upgrade() {
            state.lock().watchers.remove(&self.id);
        }
    }
}

#[async_trait]
impl Watcher for MemoryWatcher {
    async fn next_event(&mut self) -> Result<Option<WatchEvent>, StoreError> {
        match self.rx.recv().await {
            Some(Ok(event)) => Ok(Some(event)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    async fn cancel(&mut self) -> Result<(), StoreError> {
        self.unregister();
        self.rx.close();
        Ok(())
    }
}

impl Drop for MemoryWatcher {
    fn drop(&mut self) {
        self.unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Compare, CompareOp};

    #[tokio::test]
    async fn test_create_revision_is_stable_across_updates() {
        let store = InMemoryStore::new();
        let first = store.put("k", "a").await.unwrap();
        let second = store.put("k", "b").await.unwrap();
        assert!(second > first);

        let kv = store.get("k").await.unwrap().unwrap();
        assert_eq!(kv.create_revision, first);
        assert_eq!(kv.mod_revision, second);
        assert_eq!(kv.version, 2);
        assert_eq!(kv.value, "b");
    }

    #[tokio::test]
    async fn test_txn_branches() {
        let store = InMemoryStore::new();
        let txn = Txn::new()
            .when(Compare::create_revision("k", CompareOp::Equal, 0))
            .and_then(TxnOp::put("k", "v"))
            .or_else(TxnOp::get("k"));

        let resp = store.txn(txn.clone()).await.unwrap();
        assert!(resp.succeeded);
        let created = resp.header_revision;

        let resp = store.txn(txn).await.unwrap();
        assert!(!resp.succeeded);
        assert_eq!(resp.header_revision, created);
        assert_eq!(resp.first_kv().unwrap().create_revision, created);
    }

    #[tokio::test]
    async fn test_put_with_unknown_lease_fails_atomically() {
        let store = InMemoryStore::new();
        let txn = Txn::new()
            .and_then(TxnOp::put("a", "1"))
            .and_then(TxnOp::put("b", "1").with_lease(LeaseId(1)));

        let err = store.txn(txn).await.unwrap_err();
        assert!(matches!(err, StoreError::LeaseNotFound(LeaseId(1))));
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_revoke_deletes_bound_keys() {
        let store = InMemoryStore::new();
        let lease = store.lease_grant(Duration::from_secs(30)).await.unwrap();
        store
            .txn(Txn::new().and_then(TxnOp::put("k", "v").with_lease(lease)))
            .await
            .unwrap();

        let mut watcher = store.watch(WatchTarget::Key("k".into())).await.unwrap();
        store.lease_revoke(lease).await.unwrap();

        let event = watcher.next_event().await.unwrap().unwrap();
        assert!(matches!(event, WatchEvent::Delete(_)));
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.lease_revoke(lease).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_without_keep_alive() {
        let store = InMemoryStore::new();
        let lease = store.lease_grant(Duration::from_secs(5)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(
            store.lease_keep_alive(lease).await.unwrap(),
            Some(Duration::from_secs(5))
        );

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(store.has_lease(lease));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!store.has_lease(lease));
        assert_eq!(store.lease_keep_alive(lease).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_prefix_watch_and_cancel() {
        let store = InMemoryStore::new();
        let mut watcher = store.watch(WatchTarget::Prefix("p/".into())).await.unwrap();

        store.put("q/x", "1").await.unwrap();
        store.put("p/x", "1").await.unwrap();

        match watcher.next_event().await.unwrap() {
            Some(WatchEvent::Put(kv)) => assert_eq!(kv.key, "p/x"),
            other => panic!("unexpected event: {:?}", other),
        }

        assert_eq!(store.active_watchers(), 1);
        watcher.cancel().await.unwrap();
        watcher.cancel().await.unwrap();
        assert_eq!(store.active_watchers(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Connection(_))
        ));
        store.set_unavailable(false);
        assert!(store.get("k").await.unwrap().is_none());
    }
}
