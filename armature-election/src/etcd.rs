//! etcd v3 coordination store

use crate::store::{
    Compare, CompareOp, CompareTarget, CoordinationStore, KeyValue, LeaseId, RangeRequest,
    SortOrder, StoreError, Txn, TxnOp, TxnOpResponse, TxnResponse, WatchEvent, WatchTarget,
    Watcher,
};
use async_trait::async_trait;
use etcd_client::{
    Client, EventType, GetOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions, SortTarget,
    WatchOptions,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

impl From<etcd_client::Error> for StoreError {
    fn from(err: etcd_client::Error) -> Self {
        match err {
            etcd_client::Error::TransportError(e) => StoreError::Connection(e.to_string()),
            etcd_client::Error::WatchError(message) => StoreError::Watch(message),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// Open keep-alive stream for one lease
struct KeepAliveChannel {
    keeper: LeaseKeeper,
    stream: LeaseKeepAliveStream,
}

type SharedChannel = Arc<tokio::sync::Mutex<Option<KeepAliveChannel>>>;

/// etcd-backed coordination store
///
/// Keep-alive streams are opened on the first renewal of a lease and reused
/// until the lease is revoked, reported gone, or the stream fails.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    keepers: Arc<Mutex<HashMap<LeaseId, SharedChannel>>>,
}

impl EtcdStore {
    /// Connect to an etcd cluster
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// use armature_election::EtcdStore;
    ///
    /// let store = EtcdStore::connect(["localhost:2379"]).await?;
    /// ```
    pub async fn connect<E: AsRef<str>, S: AsRef<[E]>>(endpoints: S) -> Result<Self, StoreError> {
        let client = Client::connect(endpoints, None).await?;
        info!("Connected to etcd");
        Ok(Self::from_client(client))
    }

    /// Wrap an existing client
    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            keepers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of leases with an open keep-alive stream
    pub fn open_keep_alives(&self) -> usize {
        self.keepers.lock().len()
    }

    fn keep_alive_channel(&self, id: LeaseId) -> SharedChannel {
        self.keepers.lock().entry(id).or_default().clone()
    }

    fn forget_keep_alive(&self, id: LeaseId) {
        if self.keepers.lock().remove(&id).is_some() {
            debug!("Closed keep-alive stream for lease {}", id);
        }
    }

    async fn renew(
        &self,
        id: LeaseId,
        slot: &mut Option<KeepAliveChannel>,
    ) -> Result<Option<Duration>, StoreError> {
        if slot.is_none() {
            let mut client = self.client.clone();
            let (keeper, stream) = client.lease_keep_alive(id.get()).await?;
            debug!("Opened keep-alive stream for lease {}", id);
            *slot = Some(KeepAliveChannel { keeper, stream });
        }
        let Some(channel) = slot.as_mut() else {
            return Err(StoreError::Closed);
        };

        channel.keeper.keep_alive().await?;
        match channel.stream.message().await? {
            Some(response) if response.ttl() > 0 => {
                Ok(Some(Duration::from_secs(response.ttl() as u64)))
            }
            Some(_) => Ok(None),
            None => Err(StoreError::Connection(format!(
                "keep-alive stream for lease {} closed",
                id
            ))),
        }
    }
}

fn convert_kv(kv: &etcd_client::KeyValue) -> Result<KeyValue, StoreError> {
    let key = kv
        .key_str()
        .map_err(|e| StoreError::Backend(e.to_string()))?
        .to_string();
    let value = kv
        .value_str()
        .map_err(|e| StoreError::Backend(e.to_string()))?
        .to_string();

    Ok(KeyValue {
        key,
        value,
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
        version: kv.version(),
        lease: (kv.lease() != 0).then_some(LeaseId(kv.lease())),
    })
}

fn convert_compare(compare: Compare) -> etcd_client::Compare {
    let op = match compare.op {
        CompareOp::Equal => etcd_client::CompareOp::Equal,
        CompareOp::NotEqual => etcd_client::CompareOp::NotEqual,
        CompareOp::Less => etcd_client::CompareOp::Less,
        CompareOp::Greater => etcd_client::CompareOp::Greater,
    };

    match compare.target {
        CompareTarget::CreateRevision => {
            etcd_client::Compare::create_revision(compare.key, op, compare.value)
        }
        CompareTarget::Version => etcd_client::Compare::version(compare.key, op, compare.value),
    }
}

fn convert_op(op: TxnOp) -> etcd_client::TxnOp {
    match op {
        TxnOp::Put { key, value, lease } => {
            let options = lease.map(|id| PutOptions::new().with_lease(id.get()));
            etcd_client::TxnOp::put(key, value, options)
        }
        TxnOp::Get { key } => etcd_client::TxnOp::get(key, None),
        TxnOp::Delete { key } => etcd_client::TxnOp::delete(key, None),
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        let mut client = self.client.clone();
        let response = client.get(key, None).await?;
        response.kvs().first().map(convert_kv).transpose()
    }

    async fn range(&self, request: RangeRequest) -> Result<Vec<KeyValue>, StoreError> {
        let mut options = GetOptions::new().with_prefix();
        if let Some(order) = request.sort {
            let order = match order {
                SortOrder::Ascend => etcd_client::SortOrder::Ascend,
                SortOrder::Descend => etcd_client::SortOrder::Descend,
            };
            options = options.with_sort(SortTarget::Create, order);
        }
        if let Some(max) = request.max_create_revision {
            options = options.with_max_create_revision(max);
        }
        if let Some(limit) = request.limit {
            options = options.with_limit(limit as i64);
        }
        if request.keys_only {
            options = options.with_keys_only();
        }

        let mut client = self.client.clone();
        let response = client.get(request.prefix, Some(options)).await?;
        response.kvs().iter().map(convert_kv).collect()
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse, StoreError> {
        let compares: Vec<_> = txn.compares.into_iter().map(convert_compare).collect();
        let success: Vec<_> = txn.success.into_iter().map(convert_op).collect();
        let failure: Vec<_> = txn.failure.into_iter().map(convert_op).collect();

        let request = etcd_client::Txn::new()
            .when(compares)
            .and_then(success)
            .or_else(failure);

        let mut client = self.client.clone();
        let response = client.txn(request).await?;

        let header_revision = response.header().map(|h| h.revision()).unwrap_or_default();
        let mut responses = Vec::new();
        for op in response.op_responses() {
            responses.push(match op {
                etcd_client::TxnOpResponse::Put(_) => TxnOpResponse::Put,
                etcd_client::TxnOpResponse::Get(get) => TxnOpResponse::Get(
                    get.kvs().iter().map(convert_kv).collect::<Result<_, _>>()?,
                ),
                etcd_client::TxnOpResponse::Delete(delete) => TxnOpResponse::Delete {
                    deleted: delete.deleted(),
                },
                etcd_client::TxnOpResponse::Txn(_) => {
                    return Err(StoreError::Backend("nested transactions unsupported".into()));
                }
            });
        }

        Ok(TxnResponse {
            succeeded: response.succeeded(),
            header_revision,
            responses,
        })
    }

    async fn watch(&self, target: WatchTarget) -> Result<Box<dyn Watcher>, StoreError> {
        let mut client = self.client.clone();
        let (watcher, stream) = match target {
            WatchTarget::Key(key) => client.watch(key, None).await?,
            WatchTarget::Prefix(prefix) => {
                client
                    .watch(prefix, Some(WatchOptions::new().with_prefix()))
                    .await?
            }
        };

        Ok(Box::new(EtcdWatcher {
            watcher,
            stream,
            pending: VecDeque::new(),
            cancelled: false,
        }))
    }

    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId, StoreError> {
        let mut client = self.client.clone();
        let secs = ttl.as_secs().max(1) as i64;
        let response = client.lease_grant(secs, None).await?;
        Ok(LeaseId(response.id()))
    }

    async fn lease_revoke(&self, id: LeaseId) -> Result<(), StoreError> {
        self.forget_keep_alive(id);
        let mut client = self.client.clone();
        match client.lease_revoke(id.get()).await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("lease not found") => {
                Err(StoreError::LeaseNotFound(id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn lease_keep_alive(&self, id: LeaseId) -> Result<Option<Duration>, StoreError> {
        let channel = self.keep_alive_channel(id);
        let mut slot = channel.lock().await;

        let outcome = self.renew(id, &mut slot).await;
        if !matches!(outcome, Ok(Some(_))) {
            // Reopen on the next renewal, or drop for good if the lease is gone
            *slot = None;
            drop(slot);
            self.forget_keep_alive(id);
        }
        outcome
    }
}

struct EtcdWatcher {
    watcher: etcd_client::Watcher,
    stream: etcd_client::WatchStream,
    pending: VecDeque<WatchEvent>,
    cancelled: bool,
}

#[async_trait]
impl Watcher for EtcdWatcher {
    async fn next_event(&mut self) -> Result<Option<WatchEvent>, StoreError> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }

            let Some(response) = self.stream.message().await? else {
                return Ok(None);
            };
            if response.canceled() {
                return Err(StoreError::Watch(format!(
                    "watch cancelled by server: {}",
                    response.cancel_reason()
                )));
            }

            for event in response.events() {
                let Some(kv) = event.kv() else { continue };
                let kv = convert_kv(kv)?;
                self.pending.push_back(match event.event_type() {
                    EventType::Put => WatchEvent::Put(kv),
                    EventType::Delete => WatchEvent::Delete(kv),
                });
            }
        }
    }

    async fn cancel(&mut self) -> Result<(), StoreError> {
        if self.cancelled {
            return Ok(());
        }
        self.cancelled = true;
        self.watcher.cancel().await?;
        debug!("Cancelled etcd watch {}", self.watcher.watch_id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore]
    async fn test_etcd_roundtrip() {
        let store = EtcdStore::connect(["localhost:2379"]).await.unwrap();
        let lease = store.lease_grant(Duration::from_secs(10)).await.unwrap();
        let txn = Txn::new().and_then(TxnOp::put("armature-test/k", "v").with_lease(lease));
        assert!(store.txn(txn).await.unwrap().succeeded);

        let kv = store.get("armature-test/k").await.unwrap().unwrap();
        assert_eq!(kv.lease, Some(lease));

        store.lease_revoke(lease).await.unwrap();
        assert!(store.get("armature-test/k").await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore]
    async fn test_etcd_keep_alive_reuses_stream() {
        let store = EtcdStore::connect(["localhost:2379"]).await.unwrap();
        let lease = store.lease_grant(Duration::from_millis(200)).await.unwrap();
        assert_eq!(store.open_keep_alives(), 0);

        assert!(store.lease_keep_alive(lease).await.unwrap().is_some());
        assert!(store.lease_keep_alive(lease).await.unwrap().is_some());
        assert_eq!(store.open_keep_alives(), 1);

        store.lease_revoke(lease).await.unwrap();
        assert_eq!(store.open_keep_alives(), 0);
        assert_eq!(store.lease_keep_alive(lease).await.unwrap(), None);
        assert_eq!(store.open_keep_alives(), 0);
    }
}
