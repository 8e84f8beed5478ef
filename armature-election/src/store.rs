//! Coordination store abstraction
//!
//! The election logic never talks to a concrete backend directly. It issues
//! compare-and-swap transactions, ordered range queries, watches and lease
//! calls through [`CoordinationStore`], which is implemented by
//! [`InMemoryStore`](crate::InMemoryStore) and, with the `etcd` feature,
//! by `EtcdStore`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Store-assigned revision number
pub type Revision = i64;

/// Coordination store errors
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Lease not found: {0}")]
    LeaseNotFound(LeaseId),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("Store closed")]
    Closed,

    #[error("Backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Check if retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Watch(_))
    }
}

/// Identity of a store-side lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseId(pub i64);

impl LeaseId {
    /// Raw lease id as used on the wire
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored key and its metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    /// Revision at which the key was first created; never changes on update
    pub create_revision: Revision,
    pub mod_revision: Revision,
    pub version: i64,
    pub lease: Option<LeaseId>,
}

/// Field a transaction guard compares against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareTarget {
    /// Creation revision (0 when the key does not exist)
    CreateRevision,
    /// Number of writes since creation (0 when the key does not exist)
    Version,
}

/// Comparison operator for transaction guards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Less,
    Greater,
}

impl CompareOp {
    /// Apply the operator to `actual <op> expected`
    pub fn eval(&self, actual: i64, expected: i64) -> bool {
        match self {
            CompareOp::Equal => actual == expected,
            CompareOp::NotEqual => actual != expected,
            CompareOp::Less => actual < expected,
            CompareOp::Greater => actual > expected,
        }
    }
}

/// A single transaction guard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compare {
    pub key: String,
    pub target: CompareTarget,
    pub op: CompareOp,
    pub value: i64,
}

impl Compare {
    /// Compare the key's creation revision
    pub fn create_revision(key: impl Into<String>, op: CompareOp, revision: Revision) -> Self {
        Self {
            key: key.into(),
            target: CompareTarget::CreateRevision,
            op,
            value: revision,
        }
    }

    /// Compare the key's version
    pub fn version(key: impl Into<String>, op: CompareOp, version: i64) -> Self {
        Self {
            key: key.into(),
            target: CompareTarget::Version,
            op,
            value: version,
        }
    }

    /// Evaluate against the current state of the key (`None` = absent)
    pub fn matches(&self, current: Option<&KeyValue>) -> bool {
        let actual = match (self.target, current) {
            (_, None) => 0,
            (CompareTarget::CreateRevision, Some(kv)) => kv.create_revision,
            (CompareTarget::Version, Some(kv)) => kv.version,
        };
        self.op.eval(actual, self.value)
    }

    pub(crate) fn with_prefix(mut self, prefix: &str) -> Self {
        self.key = format!("{}{}", prefix, self.key);
        self
    }
}

/// Operation executed by a transaction branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put {
        key: String,
        value: String,
        lease: Option<LeaseId>,
    },
    Get {
        key: String,
    },
    Delete {
        key: String,
    },
}

impl TxnOp {
    /// Write `value` under `key`
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            lease: None,
        }
    }

    /// Read `key`
    pub fn get(key: impl Into<String>) -> Self {
        TxnOp::Get { key: key.into() }
    }

    /// Delete `key`
    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete { key: key.into() }
    }

    /// Bind a put to a lease; no effect on other operations
    pub fn with_lease(mut self, lease_id: LeaseId) -> Self {
        if let TxnOp::Put { lease, .. } = &mut self {
            *lease = Some(lease_id);
        }
        self
    }

    /// Key the operation targets
    pub fn key(&self) -> &str {
        match self {
            TxnOp::Put { key, .. } | TxnOp::Get { key } | TxnOp::Delete { key } => key,
        }
    }

    pub(crate) fn with_prefix(self, prefix: &str) -> Self {
        match self {
            TxnOp::Put { key, value, lease } => TxnOp::Put {
                key: format!("{}{}", prefix, key),
                value,
                lease,
            },
            TxnOp::Get { key } => TxnOp::Get {
                key: format!("{}{}", prefix, key),
            },
            TxnOp::Delete { key } => TxnOp::Delete {
                key: format!("{}{}", prefix, key),
            },
        }
    }
}

/// Atomic compare-and-branch transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

impl Txn {
    /// Create an empty transaction
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a guard; all guards must hold for the success branch to run
    pub fn when(mut self, compare: Compare) -> Self {
        self.compares.push(compare);
        self
    }

    /// Add an operation to the success branch
    pub fn and_then(mut self, op: TxnOp) -> Self {
        self.success.push(op);
        self
    }

    /// Add an operation to the failure branch
    pub fn or_else(mut self, op: TxnOp) -> Self {
        self.failure.push(op);
        self
    }
}

/// Result of one transaction operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOpResponse {
    Put,
    Get(Vec<KeyValue>),
    Delete { deleted: i64 },
}

/// Transaction outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnResponse {
    /// Whether every guard held
    pub succeeded: bool,
    /// Store revision after the transaction
    pub header_revision: Revision,
    /// One response per operation of the branch that ran
    pub responses: Vec<TxnOpResponse>,
}

impl TxnResponse {
    /// First key read by a `Get` in the executed branch
    pub fn first_kv(&self) -> Option<&KeyValue> {
        self.responses.iter().find_map(|r| match r {
            TxnOpResponse::Get(kvs) => kvs.first(),
            _ => None,
        })
    }
}

/// Ordering of range results by creation revision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascend,
    Descend,
}

/// Range query over a prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRequest {
    pub prefix: String,
    pub sort: Option<SortOrder>,
    /// Only keys with `create_revision <= max_create_revision`
    pub max_create_revision: Option<Revision>,
    pub limit: Option<usize>,
    pub keys_only: bool,
}

impl RangeRequest {
    /// Range over every key starting with `prefix`
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            sort: None,
            max_create_revision: None,
            limit: None,
            keys_only: false,
        }
    }
}

/// What a watch subscribes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    Key(String),
    Prefix(String),
}

impl WatchTarget {
    /// Whether `key` falls under this target
    pub fn matches(&self, key: &str) -> bool {
        match self {
            WatchTarget::Key(k) => k == key,
            WatchTarget::Prefix(p) => key.starts_with(p.as_str()),
        }
    }
}

/// Change delivered by a watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put(KeyValue),
    Delete(KeyValue),
}

impl WatchEvent {
    /// Key the event refers to
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put(kv) | WatchEvent::Delete(kv) => &kv.key,
        }
    }
}

/// Stream of watch events backed by server-side resources
#[async_trait]
pub trait Watcher: Send {
    /// Next event; `Ok(None)` when the stream has ended
    async fn next_event(&mut self) -> Result<Option<WatchEvent>, StoreError>;

    /// Release the watch. Safe to call more than once.
    async fn cancel(&mut self) -> Result<(), StoreError>;
}

/// Transactional, revision-versioned key-value store with leases and watches
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read a single key
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError>;

    /// Ordered range query
    async fn range(&self, request: RangeRequest) -> Result<Vec<KeyValue>, StoreError>;

    /// Execute an atomic transaction
    async fn txn(&self, txn: Txn) -> Result<TxnResponse, StoreError>;

    /// Open a watch; events for changes after creation are delivered
    async fn watch(&self, target: WatchTarget) -> Result<Box<dyn Watcher>, StoreError>;

    /// Grant a lease with the given time-to-live
    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId, StoreError>;

    /// Revoke a lease, deleting every key bound to it
    async fn lease_revoke(&self, id: LeaseId) -> Result<(), StoreError>;

    /// Renew a lease; `Ok(None)` when the lease no longer exists
    async fn lease_keep_alive(&self, id: LeaseId) -> Result<Option<Duration>, StoreError>;
}
