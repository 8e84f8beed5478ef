//! Leader election over a coordination store
//!
//! Candidates write a key `election/<name>/<lease id>` bound to their session
//! lease. The live key with the lowest creation revision is the leader; every
//! other candidate waits for all strictly older keys to be deleted.

use crate::config::ElectionConfig;
use crate::error::{ElectionError, Result};
use crate::events::{ElectionEvent, ElectionSubscription};
use crate::lease::SessionLease;
use crate::namespace::Namespace;
use crate::observe;
use crate::store::{
    Compare, CompareOp, CoordinationStore, LeaseId, Revision, SortOrder, StoreError, TxnOp,
};
use crate::watch::wait_for_deletes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

/// The current leader as stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderRecord {
    /// Full key, `election/<name>/<lease id>`
    pub key: String,
    /// Value published by the leader
    pub value: String,
    pub create_revision: Revision,
    pub lease: Option<LeaseId>,
}

#[derive(Debug, Default, Clone)]
struct Session {
    lease_id: Option<LeaseId>,
    leader_key: Option<String>,
    leader_revision: Option<Revision>,
    is_campaigning: bool,
    is_leader: bool,
}

impl Session {
    fn clear_leadership(&mut self) {
        self.leader_key = None;
        self.leader_revision = None;
        self.is_campaigning = false;
        self.is_leader = false;
    }
}

pub(crate) struct ElectionInner {
    pub(crate) name: String,
    pub(crate) namespace: Namespace,
    pub(crate) config: ElectionConfig,
    session: parking_lot::Mutex<Session>,
    /// Lazily created; replaced after a loss, cleared by resign fallback
    lease: tokio::sync::Mutex<Option<Arc<SessionLease>>>,
    events: broadcast::Sender<ElectionEvent>,
    pub(crate) leader_listeners: AtomicUsize,
    pub(crate) observing: AtomicBool,
    pub(crate) shutdown: watch::Sender<bool>,
    /// Bumped whenever leadership state is cleared
    term: watch::Sender<u64>,
}

impl ElectionInner {
    pub(crate) fn emit(&self, event: ElectionEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Clear leadership and wake any campaign waiting under the old term
    fn end_term(&self, session: &mut Session) {
        session.clear_leadership();
        self.term.send_modify(|term| *term += 1);
    }

    async fn ensure_lease(self: &Arc<Self>) -> Result<LeaseId> {
        if self.is_closed() {
            return Err(ElectionError::Closed);
        }

        let mut slot = self.lease.lock().await;
        let lease = match slot.as_ref() {
            Some(lease) => lease.clone(),
            None => {
                let lease = Arc::new(SessionLease::new(
                    self.namespace.store().clone(),
                    self.config.ttl,
                ));
                spawn_lease_monitor(Arc::downgrade(self), &lease);
                *slot = Some(lease.clone());
                lease
            }
        };

        let id = lease.grant().await?;
        drop(slot);

        self.session.lock().lease_id = Some(id);
        Ok(id)
    }

    /// Revoke and forget the lease `id` if it is still the current one
    async fn discard_lease(&self, id: LeaseId) -> Result<()> {
        let stale = {
            let mut slot = self.lease.lock().await;
            let current = match slot.as_ref() {
                Some(lease) => lease.id().await == Some(id),
                None => false,
            };
            if current { slot.take() } else { None }
        };

        {
            let mut session = self.session.lock();
            if session.lease_id == Some(id) {
                session.lease_id = None;
            }
        }

        match stale {
            Some(lease) => lease.revoke().await.map_err(ElectionError::from),
            None => Ok(()),
        }
    }

    async fn handle_lease_lost(self: Arc<Self>, lost: Weak<SessionLease>, id: LeaseId) {
        warn!("Election {} lost lease {}", self.name, id);
        self.emit(ElectionEvent::Error(Arc::new(ElectionError::LeaseLost(id))));

        let stale = {
            let mut slot = self.lease.lock().await;
            let current = slot
                .as_ref()
                .is_some_and(|lease| Weak::ptr_eq(&Arc::downgrade(lease), &lost));
            if current { slot.take() } else { None }
        };
        let Some(stale) = stale else {
            debug!("Lease {} already replaced", id);
            return;
        };

        if let Err(e) = stale.revoke().await {
            debug!("Revoking lost lease {} failed: {}", id, e);
        }

        {
            let mut session = self.session.lock();
            if session.lease_id == Some(id) {
                session.lease_id = None;
                self.end_term(&mut session);
            }
        }

        if self.is_closed() {
            return;
        }

        match self.ensure_lease().await {
            Ok(fresh) => info!("Election {} recovered with lease {}", self.name, fresh),
            Err(e) => {
                error!("Election {} failed to recover lease: {}", self.name, e);
                self.emit(ElectionEvent::Error(Arc::new(ElectionError::LeaseRecovery(
                    e.to_string(),
                ))));
            }
        }
    }
}

fn spawn_lease_monitor(inner: Weak<ElectionInner>, lease: &Arc<SessionLease>) {
    let mut lost = lease.subscribe_lost();
    let lease = Arc::downgrade(lease);

    tokio::spawn(async move {
        // Closed once the lease is revoked or dropped
        let Ok(id) = lost.recv().await else { return };
        if let Some(inner) = inner.upgrade() {
            inner.handle_lease_lost(lease, id).await;
        }
    });
}

/// A participant in (or observer of) one named election
///
/// Cheap to clone; clones share the same session.
///
/// # Examples
///
/// ```rust,ignore
/// use armature_election::*;
/// use std::sync::Arc;
///
/// let store = Arc::new(InMemoryStore::new());
/// let election = Election::new(store, "singleton-service");
///
/// // Blocks until elected
/// election.campaign("node-a").await?;
/// election.proclaim("node-a:ready").await?;
/// election.resign().await?;
/// ```
#[derive(Clone)]
pub struct Election {
    inner: Arc<ElectionInner>,
}

impl Election {
    /// Leading segment of every election key
    pub const PREFIX: &'static str = "election";

    /// Create an election with the default configuration
    pub fn new(store: Arc<dyn CoordinationStore>, name: impl Into<String>) -> Self {
        Self::with_config(store, name, ElectionConfig::default())
    }

    /// Create an election with a custom configuration
    ///
    /// A TTL below [`ElectionConfig::MIN_TTL`] is raised to it; use
    /// [`ElectionBuilder::build`] to reject invalid configurations instead.
    pub fn with_config(
        store: Arc<dyn CoordinationStore>,
        name: impl Into<String>,
        mut config: ElectionConfig,
    ) -> Self {
        let name = name.into();
        if config.ttl < ElectionConfig::MIN_TTL {
            warn!(
                "Election {} ttl {:?} below minimum, using {:?}",
                name,
                config.ttl,
                ElectionConfig::MIN_TTL
            );
            config.ttl = ElectionConfig::MIN_TTL;
        }
        let namespace = Namespace::new(store, format!("{}/{}/", Self::PREFIX, name));
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        let (term, _) = watch::channel(0);

        Self {
            inner: Arc::new(ElectionInner {
                name,
                namespace,
                config,
                session: parking_lot::Mutex::new(Session::default()),
                lease: tokio::sync::Mutex::new(None),
                events,
                leader_listeners: AtomicUsize::new(0),
                observing: AtomicBool::new(false),
                shutdown,
                term,
            }),
        }
    }

    /// Election name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Key prefix, `election/<name>/`
    pub fn prefix(&self) -> &str {
        self.inner.namespace.prefix()
    }

    /// Configuration in use
    pub fn config(&self) -> &ElectionConfig {
        &self.inner.config
    }

    /// Key held by this session while campaigning
    pub fn leader_key(&self) -> Option<String> {
        self.inner.session.lock().leader_key.clone()
    }

    /// Creation revision of this session's key while campaigning
    pub fn leader_revision(&self) -> Option<Revision> {
        self.inner.session.lock().leader_revision
    }

    /// Session lease, once acquired
    pub fn lease_id(&self) -> Option<LeaseId> {
        self.inner.session.lock().lease_id
    }

    /// Whether a session lease is held
    pub fn is_ready(&self) -> bool {
        self.lease_id().is_some()
    }

    /// Whether this session holds a candidate key
    pub fn is_campaigning(&self) -> bool {
        self.inner.session.lock().is_campaigning
    }

    /// Whether the last campaign completed and leadership is still held
    pub fn is_leader(&self) -> bool {
        self.inner.session.lock().is_leader
    }

    /// Whether the observation loop is running
    pub fn is_observing(&self) -> bool {
        self.inner.observing.load(Ordering::Acquire)
    }

    /// Acquire the session lease without campaigning
    pub async fn ready(&self) -> Result<LeaseId> {
        self.inner.ensure_lease().await
    }

    /// Become leader, publishing `value`
    ///
    /// Returns once this session's key has the lowest live creation revision
    /// under the election prefix. Any failure after the key is written
    /// resigns before the error is returned.
    pub async fn campaign(&self, value: impl Into<String>) -> Result<()> {
        let value = value.into();
        let term = self.inner.term.subscribe();
        let lease_id = self.inner.ensure_lease().await?;
        let key = lease_id.to_string();
        let namespace = &self.inner.namespace;

        let txn = namespace
            .txn()
            .when(Compare::create_revision(&key, CompareOp::Equal, 0))
            .and_then(TxnOp::put(&key, value.clone()).with_lease(lease_id))
            .or_else(TxnOp::get(&key));
        let response = namespace.commit(txn).await?;

        let existing = if response.succeeded {
            None
        } else {
            match response.first_kv() {
                Some(kv) => Some(kv.clone()),
                None => {
                    return Err(ElectionError::Store(StoreError::Backend(format!(
                        "transaction on {} returned no key",
                        namespace.full_key(&key)
                    ))));
                }
            }
        };
        let revision = existing
            .as_ref()
            .map_or(response.header_revision, |kv| kv.create_revision);

        {
            let mut session = self.inner.session.lock();
            if session.lease_id != Some(lease_id) {
                return Err(ElectionError::LeaseLost(lease_id));
            }
            session.leader_key = Some(namespace.full_key(&key));
            session.leader_revision = Some(revision);
            session.is_campaigning = true;
            session.is_leader = false;
        }
        debug!(
            "Campaigning in {} with key {} at revision {}",
            self.inner.name, key, revision
        );

        if let Some(kv) = existing
            && kv.value != value
            && let Err(e) = self.proclaim(value).await
        {
            self.resign_after_failure(&e).await;
            return Err(e);
        }

        if let Err(e) = self.wait_for_elected(lease_id, revision, term).await {
            self.resign_after_failure(&e).await;
            return Err(e);
        }

        {
            let mut session = self.inner.session.lock();
            if !session.is_campaigning || session.leader_revision != Some(revision) {
                return Err(ElectionError::NotLeader);
            }
            session.is_leader = true;
        }

        info!(
            "Elected leader of {} (lease {}, revision {})",
            self.inner.name, lease_id, revision
        );
        Ok(())
    }

    async fn resign_after_failure(&self, cause: &ElectionError) {
        warn!("Campaign in {} failed: {}", self.inner.name, cause);
        if let Err(e) = self.resign().await {
            error!("Resign after failed campaign in {} failed: {}", self.inner.name, e);
        }
    }

    /// Wait for every older candidate to go away
    ///
    /// Gives up early when the election is closed or this session's
    /// leadership state is cleared.
    async fn wait_for_elected(
        &self,
        lease_id: LeaseId,
        revision: Revision,
        mut term: watch::Receiver<u64>,
    ) -> Result<()> {
        let namespace = &self.inner.namespace;
        let older = namespace
            .range()
            .sort(SortOrder::Descend)
            .max_create_revision(revision - 1)
            .keys()
            .await?;

        if older.is_empty() {
            return Ok(());
        }

        debug!(
            "{} candidates ahead in {}, waiting",
            older.len(),
            self.inner.name
        );
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|closed| *closed) => Err(ElectionError::Closed),
            _ = term.changed() => {
                if self.lease_id() == Some(lease_id) {
                    Err(ElectionError::NotLeader)
                } else {
                    Err(ElectionError::LeaseLost(lease_id))
                }
            }
            outcome = wait_for_deletes(namespace, &older) => outcome,
        }
    }

    /// Replace the published value without losing leadership
    ///
    /// Fails with [`ElectionError::NotLeader`] if this session is not
    /// campaigning or its key no longer carries the recorded creation
    /// revision; in the latter case the session's leadership state is cleared.
    pub async fn proclaim(&self, value: impl Into<String>) -> Result<()> {
        let (lease_id, revision) = {
            let session = self.inner.session.lock();
            match (session.is_campaigning, session.lease_id, session.leader_revision) {
                (true, Some(lease_id), Some(revision)) => (lease_id, revision),
                _ => return Err(ElectionError::NotLeader),
            }
        };

        let key = lease_id.to_string();
        let namespace = &self.inner.namespace;
        let txn = namespace
            .txn()
            .when(Compare::create_revision(&key, CompareOp::Equal, revision))
            .and_then(TxnOp::put(&key, value).with_lease(lease_id));
        let response = namespace.commit(txn).await?;

        if !response.succeeded {
            warn!(
                "Proclaim in {} lost the race for revision {}",
                self.inner.name, revision
            );
            let mut session = self.inner.session.lock();
            if session.leader_revision == Some(revision) {
                self.inner.end_term(&mut session);
            }
            return Err(ElectionError::NotLeader);
        }

        debug!("Proclaimed new value in {}", self.inner.name);
        Ok(())
    }

    /// Give up leadership or candidacy
    ///
    /// A no-op when not campaigning. If this session's key is already gone
    /// the lease is revoked so the next campaign starts from a fresh one.
    /// The session is left idle whether or not the store calls succeed.
    pub async fn resign(&self) -> Result<()> {
        let (lease_id, revision) = {
            let session = self.inner.session.lock();
            match (session.is_campaigning, session.lease_id, session.leader_revision) {
                (true, Some(lease_id), Some(revision)) => (lease_id, revision),
                _ => return Ok(()),
            }
        };

        let key = lease_id.to_string();
        let namespace = &self.inner.namespace;
        let txn = namespace
            .txn()
            .when(Compare::create_revision(&key, CompareOp::Equal, revision))
            .and_then(TxnOp::delete(&key));

        let outcome = match namespace.commit(txn).await {
            Ok(response) if response.succeeded => {
                info!("Resigned from {}", self.inner.name);
                Ok(())
            }
            Ok(_) => {
                warn!(
                    "Key for {} already gone at resign, revoking lease {}",
                    self.inner.name, lease_id
                );
                self.inner.discard_lease(lease_id).await
            }
            Err(e) => {
                warn!("Resign in {} failed: {}, revoking lease {}", self.inner.name, e, lease_id);
                if let Err(revoke_err) = self.inner.discard_lease(lease_id).await {
                    debug!("Lease revoke after failed resign: {}", revoke_err);
                }
                Err(e.into())
            }
        };

        self.inner.end_term(&mut self.inner.session.lock());
        outcome
    }

    /// Full key of the current leader
    pub async fn get_leader(&self) -> Result<String> {
        let namespace = &self.inner.namespace;
        let keys = namespace
            .range()
            .sort(SortOrder::Ascend)
            .limit(1)
            .keys()
            .await?;

        keys.first()
            .map(|key| namespace.full_key(key))
            .ok_or(ElectionError::NoLeader)
    }

    /// Current leader including its published value
    pub async fn leader(&self) -> Result<LeaderRecord> {
        let namespace = &self.inner.namespace;
        let kvs = namespace
            .range()
            .sort(SortOrder::Ascend)
            .limit(1)
            .key_values()
            .await?;

        kvs.into_iter()
            .next()
            .map(|kv| LeaderRecord {
                key: namespace.full_key(&kv.key),
                value: kv.value,
                create_revision: kv.create_revision,
                lease: kv.lease,
            })
            .ok_or(ElectionError::NoLeader)
    }

    /// Subscribe to leader and error events
    ///
    /// The subscription counts as a leader listener and starts observation
    /// if it is not already running. Must be called within a tokio runtime.
    pub fn subscribe(&self) -> ElectionSubscription {
        let subscription =
            ElectionSubscription::leader(self.inner.events.subscribe(), self.inner.clone());
        observe::try_observe(&self.inner);
        subscription
    }

    /// Subscribe to error events only, without driving observation
    pub fn errors(&self) -> ElectionSubscription {
        ElectionSubscription::errors(self.inner.events.subscribe())
    }

    /// Start an observation cycle; `false` if one is already running
    pub fn start_observing(&self) -> bool {
        observe::try_observe(&self.inner)
    }

    /// Stop observation, resign and revoke the session lease
    pub async fn close(&self) -> Result<()> {
        if self.inner.shutdown.send_replace(true) {
            return Ok(());
        }

        let resigned = self.resign().await;

        let lease = self.inner.lease.lock().await.take();
        self.inner.session.lock().lease_id = None;
        if let Some(lease) = lease {
            lease.revoke().await?;
        }

        info!("Closed election {}", self.inner.name);
        resigned
    }
}

/// Election builder
pub struct ElectionBuilder {
    name: String,
    config: ElectionConfig,
}

impl ElectionBuilder {
    /// Create new builder
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: ElectionConfig::default(),
        }
    }

    /// Set lease TTL
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.config.ttl = ttl;
        self
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: ElectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration and build the election
    pub fn build(self, store: Arc<dyn CoordinationStore>) -> Result<Election> {
        self.config.validate()?;
        Ok(Election::with_config(store, self.name, self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::store::{
        CompareTarget, KeyValue, RangeRequest, Txn, TxnResponse, WatchTarget, Watcher,
    };
    use async_trait::async_trait;

    fn election(store: &InMemoryStore, name: &str) -> Election {
        Election::new(Arc::new(store.clone()), name)
    }

    /// Fails value updates guarded on an existing key once armed
    struct FailingUpdates {
        inner: InMemoryStore,
        armed: AtomicBool,
    }

    impl FailingUpdates {
        fn is_update(txn: &Txn) -> bool {
            let guarded = txn
                .compares
                .iter()
                .any(|c| c.target == CompareTarget::CreateRevision && c.value != 0);
            guarded && txn.success.iter().any(|op| matches!(op, TxnOp::Put { .. }))
        }
    }

    #[async_trait]
    impl CoordinationStore for FailingUpdates {
        async fn get(&self, key: &str) -> std::result::Result<Option<KeyValue>, StoreError> {
            self.inner.get(key).await
        }

        async fn range(
            &self,
            request: RangeRequest,
        ) -> std::result::Result<Vec<KeyValue>, StoreError> {
            self.inner.range(request).await
        }

        async fn txn(&self, txn: Txn) -> std::result::Result<TxnResponse, StoreError> {
            if self.armed.load(Ordering::Acquire) && Self::is_update(&txn) {
                return Err(StoreError::Connection("update rejected".to_string()));
            }
            self.inner.txn(txn).await
        }

        async fn watch(
            &self,
            target: WatchTarget,
        ) -> std::result::Result<Box<dyn Watcher>, StoreError> {
            self.inner.watch(target).await
        }

        async fn lease_grant(&self, ttl: Duration) -> std::result::Result<LeaseId, StoreError> {
            self.inner.lease_grant(ttl).await
        }

        async fn lease_revoke(&self, id: LeaseId) -> std::result::Result<(), StoreError> {
            self.inner.lease_revoke(id).await
        }

        async fn lease_keep_alive(
            &self,
            id: LeaseId,
        ) -> std::result::Result<Option<Duration>, StoreError> {
            self.inner.lease_keep_alive(id).await
        }
    }

    #[test]
    fn test_election_builder() {
        let builder = ElectionBuilder::new("test-leader").with_ttl(Duration::from_secs(20));

        assert_eq!(builder.name, "test-leader");
        assert_eq!(builder.config.ttl, Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_builder_rejects_invalid_config() {
        let store = InMemoryStore::new();
        let result = ElectionBuilder::new("x")
            .with_ttl(Duration::ZERO)
            .build(Arc::new(store));
        assert!(matches!(result, Err(ElectionError::Config(_))));
    }

    #[tokio::test]
    async fn test_with_config_raises_short_ttl() {
        let store = InMemoryStore::new();
        let config = ElectionConfig::new(Duration::from_millis(200));
        let election = Election::with_config(Arc::new(store), "short", config);
        assert_eq!(election.config().ttl, ElectionConfig::MIN_TTL);
        assert!(election.config().validate().is_ok());
    }

    #[tokio::test]
    async fn test_failed_value_update_resigns() {
        let store = InMemoryStore::new();
        let failing = Arc::new(FailingUpdates {
            inner: store.clone(),
            armed: AtomicBool::new(false),
        });
        let election = Election::new(failing.clone(), "e");

        election.campaign("first").await.unwrap();
        let key = election.leader_key().unwrap();

        // Re-campaigning with a new value takes the existing-key branch
        failing.armed.store(true, Ordering::Release);
        let err = election.campaign("second").await.unwrap_err();

        assert!(matches!(err, ElectionError::Store(StoreError::Connection(_))));
        assert!(!election.is_campaigning());
        assert!(!election.is_leader());
        assert!(election.leader_key().is_none());
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prefix() {
        let store = InMemoryStore::new();
        let election = election(&store, "test-election");
        assert_eq!(election.prefix(), "election/test-election/");
        assert_eq!(election.name(), "test-election");
    }

    #[tokio::test]
    async fn test_campaign_sets_session() {
        let store = InMemoryStore::new();
        let election = election(&store, "e");
        assert!(!election.is_ready());

        election.campaign("candidate").await.unwrap();
        let lease = election.lease_id().unwrap();

        assert!(election.is_campaigning());
        assert!(election.is_leader());
        assert_eq!(election.leader_key().unwrap(), format!("election/e/{}", lease));

        let kv = store.get(&election.leader_key().unwrap()).await.unwrap().unwrap();
        assert_eq!(Some(kv.create_revision), election.leader_revision());
        assert_eq!(kv.value, "candidate");
        assert_eq!(kv.lease, Some(lease));
    }

    #[tokio::test]
    async fn test_campaign_again_reuses_key() {
        let store = InMemoryStore::new();
        let election = election(&store, "e");

        election.campaign("first").await.unwrap();
        let revision = election.leader_revision();

        election.campaign("second").await.unwrap();
        assert_eq!(election.leader_revision(), revision);

        let kv = store.get(&election.leader_key().unwrap()).await.unwrap().unwrap();
        assert_eq!(kv.value, "second");
    }

    #[tokio::test]
    async fn test_proclaim_after_key_vanished() {
        let store = InMemoryStore::new();
        let election = election(&store, "e");
        election.campaign("candidate").await.unwrap();

        store.delete(&election.leader_key().unwrap()).await.unwrap();

        let err = election.proclaim("new").await.unwrap_err();
        assert!(matches!(err, ElectionError::NotLeader));
        assert!(election.leader_key().is_none());
        assert!(!election.is_campaigning());
    }

    #[tokio::test]
    async fn test_resign_revokes_lease_when_key_gone() {
        let store = InMemoryStore::new();
        let election = election(&store, "e");
        election.campaign("candidate").await.unwrap();
        let lease = election.lease_id().unwrap();

        store.delete(&election.leader_key().unwrap()).await.unwrap();
        election.resign().await.unwrap();

        assert!(!store.has_lease(lease));
        assert!(!election.is_ready());
        assert!(!election.is_campaigning());

        // Next campaign starts on a fresh lease
        election.campaign("again").await.unwrap();
        assert_ne!(election.lease_id(), Some(lease));
    }

    #[tokio::test]
    async fn test_close_releases_everything() {
        let store = InMemoryStore::new();
        let election = election(&store, "e");
        election.campaign("candidate").await.unwrap();
        let lease = election.lease_id().unwrap();

        election.close().await.unwrap();
        election.close().await.unwrap();

        assert!(!store.has_lease(lease));
        assert!(!election.is_campaigning());
        assert!(matches!(
            election.campaign("x").await,
            Err(ElectionError::Closed)
        ));
        assert!(matches!(election.get_leader().await, Err(ElectionError::NoLeader)));
    }
}
