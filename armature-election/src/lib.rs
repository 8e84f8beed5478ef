//! Leader Election for Armature
//!
//! This crate provides leader election on top of a transactional,
//! revision-versioned key-value store with leases and watches (etcd or
//! anything shaped like it).
//!
//! ## Features
//!
//! - **Revision Ordering** - The live candidate with the lowest creation
//!   revision leads; later candidates queue behind it in order
//! - **Session Leases** - Candidate keys are bound to a lease renewed in the
//!   background; a crashed process loses leadership when its lease expires
//! - **Lease Recovery** - A lost lease is replaced automatically and reported
//! - **Observation** - Non-candidates can follow leadership changes
//! - **Multiple Backends** - etcd (`etcd` feature) or in-memory
//!
//! ## Quick Start
//!
//! ### Campaigning
//!
//! ```rust,ignore
//! use armature_election::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(InMemoryStore::new());
//!     let election = Election::new(store, "singleton-service");
//!
//!     // Blocks until this process is the leader
//!     election.campaign("node-a").await?;
//!     println!("I am the leader: {:?}", election.leader_key());
//!
//!     // Publish a new value without giving up leadership
//!     election.proclaim("node-a:draining").await?;
//!
//!     election.resign().await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Observing
//!
//! ```rust,ignore
//! use armature_election::*;
//!
//! let election = Election::new(store, "singleton-service");
//! let mut events = election.subscribe();
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         ElectionEvent::Leader(key) => println!("Leader is now {}", key),
//!         ElectionEvent::Error(e) => eprintln!("Observation error: {}", e),
//!     }
//! }
//! ```
//!
//! ### etcd
//!
//! ```rust,ignore
//! use armature_election::*;
//! use std::sync::Arc;
//!
//! let store = Arc::new(EtcdStore::connect(["localhost:2379"]).await?);
//! let election = ElectionBuilder::new("singleton-service")
//!     .with_config(ElectionConfig::from_env().build())
//!     .build(store)?;
//! ```

pub mod config;
pub mod election;
pub mod error;
pub mod events;
pub mod lease;
pub mod memory;
pub mod namespace;
mod observe;
pub mod store;
pub mod watch;

#[cfg(feature = "etcd")]
pub mod etcd;

pub use config::{ElectionConfig, ElectionConfigBuilder};
pub use election::{Election, ElectionBuilder, LeaderRecord};
pub use error::{ElectionError, Result};
pub use events::{ElectionEvent, ElectionSubscription};
pub use lease::SessionLease;
pub use memory::InMemoryStore;
pub use namespace::{Namespace, RangeQuery};
pub use store::{
    Compare, CompareOp, CompareTarget, CoordinationStore, KeyValue, LeaseId, RangeRequest,
    Revision, SortOrder, StoreError, Txn, TxnOp, TxnOpResponse, TxnResponse, WatchEvent,
    WatchTarget, Watcher,
};
pub use watch::{WatchGuard, wait_for_delete, wait_for_deletes};

#[cfg(feature = "etcd")]
pub use etcd::EtcdStore;
