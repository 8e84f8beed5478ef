//! Key-prefixed view over a coordination store

use crate::store::{
    CoordinationStore, KeyValue, RangeRequest, Revision, SortOrder, StoreError, Txn,
    TxnOpResponse, TxnResponse, WatchTarget,
};
use crate::watch::WatchGuard;
use std::sync::Arc;

/// A view of the store where every key is relative to `prefix`
#[derive(Clone)]
pub struct Namespace {
    store: Arc<dyn CoordinationStore>,
    prefix: String,
}

impl Namespace {
    /// Create a namespace rooted at `prefix`
    pub fn new(store: Arc<dyn CoordinationStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Nested namespace under this one
    pub fn namespace(&self, prefix: &str) -> Self {
        Self::new(self.store.clone(), format!("{}{}", self.prefix, prefix))
    }

    /// Key prefix of this namespace
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// Absolute key for a namespace-relative key
    pub fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn relative(&self, mut kv: KeyValue) -> KeyValue {
        if let Some(stripped) = kv.key.strip_prefix(self.prefix.as_str()) {
            kv.key = stripped.to_string();
        }
        kv
    }

    /// Read one key
    pub async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        let kv = self.store.get(&self.full_key(key)).await?;
        Ok(kv.map(|kv| self.relative(kv)))
    }

    /// Start a transaction whose keys are relative to this namespace
    pub fn txn(&self) -> Txn {
        Txn::new()
    }

    /// Commit a transaction built with namespace-relative keys
    pub async fn commit(&self, txn: Txn) -> Result<TxnResponse, StoreError> {
        let txn = Txn {
            compares: txn
                .compares
                .into_iter()
                .map(|c| c.with_prefix(&self.prefix))
                .collect(),
            success: txn
                .success
                .into_iter()
                .map(|op| op.with_prefix(&self.prefix))
                .collect(),
            failure: txn
                .failure
                .into_iter()
                .map(|op| op.with_prefix(&self.prefix))
                .collect(),
        };

        let mut response = self.store.txn(txn).await?;
        for op in response.responses.iter_mut() {
            if let TxnOpResponse::Get(kvs) = op {
                let taken = std::mem::take(kvs);
                *kvs = taken.into_iter().map(|kv| self.relative(kv)).collect();
            }
        }
        Ok(response)
    }

    /// Range over every key in the namespace
    pub fn range(&self) -> RangeQuery<'_> {
        RangeQuery {
            namespace: self,
            request: RangeRequest::prefix(self.prefix.clone()),
        }
    }

    /// Watch a single namespace-relative key
    pub async fn watch_key(&self, key: &str) -> Result<WatchGuard, StoreError> {
        let watcher = self.store.watch(WatchTarget::Key(self.full_key(key))).await?;
        Ok(WatchGuard::new(watcher, self.prefix.clone()))
    }

    /// Watch every key in the namespace
    pub async fn watch_prefix(&self) -> Result<WatchGuard, StoreError> {
        let watcher = self
            .store
            .watch(WatchTarget::Prefix(self.prefix.clone()))
            .await?;
        Ok(WatchGuard::new(watcher, self.prefix.clone()))
    }
}

/// Range query builder over a namespace
pub struct RangeQuery<'a> {
    namespace: &'a Namespace,
    request: RangeRequest,
}

impl RangeQuery<'_> {
    /// Order results by creation revision
    pub fn sort(mut self, order: SortOrder) -> Self {
        self.request.sort = Some(order);
        self
    }

    /// Only include keys created at or before `revision`
    pub fn max_create_revision(mut self, revision: Revision) -> Self {
        self.request.max_create_revision = Some(revision);
        self
    }

    /// Cap the number of results
    pub fn limit(mut self, limit: usize) -> Self {
        self.request.limit = Some(limit);
        self
    }

    /// Namespace-relative keys, in the requested order
    pub async fn keys(mut self) -> Result<Vec<String>, StoreError> {
        self.request.keys_only = true;
        let kvs = self.key_values().await?;
        Ok(kvs.into_iter().map(|kv| kv.key).collect())
    }

    /// Full entries, in the requested order
    pub async fn key_values(self) -> Result<Vec<KeyValue>, StoreError> {
        let namespace = self.namespace;
        let kvs = namespace.store.range(self.request).await?;
        Ok(kvs.into_iter().map(|kv| namespace.relative(kv)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::store::{Compare, CompareOp, TxnOp};

    fn namespace(store: &InMemoryStore) -> Namespace {
        Namespace::new(Arc::new(store.clone()), "election/").namespace("jobs/")
    }

    #[tokio::test]
    async fn test_commit_prefixes_and_strips_keys() {
        let store = InMemoryStore::new();
        let ns = namespace(&store);
        assert_eq!(ns.prefix(), "election/jobs/");

        let txn = ns
            .txn()
            .when(Compare::create_revision("a", CompareOp::Equal, 0))
            .and_then(TxnOp::put("a", "1"))
            .or_else(TxnOp::get("a"));
        let resp = ns.commit(txn.clone()).await.unwrap();
        assert!(resp.succeeded);

        let raw = store.get("election/jobs/a").await.unwrap().unwrap();
        assert_eq!(raw.value, "1");

        let resp = ns.commit(txn).await.unwrap();
        assert!(!resp.succeeded);
        assert_eq!(resp.first_kv().unwrap().key, "a");
    }

    #[tokio::test]
    async fn test_range_sorted_and_bounded() {
        let store = InMemoryStore::new();
        let ns = namespace(&store);
        for key in ["c", "a", "b"] {
            ns.commit(ns.txn().and_then(TxnOp::put(key, "x"))).await.unwrap();
        }
        store.put("election/other/z", "x").await.unwrap();

        let asc = ns.range().sort(SortOrder::Ascend).keys().await.unwrap();
        assert_eq!(asc, vec!["c", "a", "b"]);

        let c_rev = ns.get("c").await.unwrap().unwrap().create_revision;
        let older = ns
            .range()
            .sort(SortOrder::Descend)
            .max_create_revision(c_rev + 1)
            .keys()
            .await
            .unwrap();
        assert_eq!(older, vec!["a", "c"]);

        let first = ns.range().sort(SortOrder::Ascend).limit(1).keys().await.unwrap();
        assert_eq!(first, vec!["c"]);
    }
}
