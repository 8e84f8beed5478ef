//! Session lease with automatic renewal

use crate::store::{CoordinationStore, LeaseId, StoreError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Default)]
struct LeaseState {
    id: Option<LeaseId>,
    keep_alive: Option<JoinHandle<()>>,
}

/// Ephemeral store identity whose expiry deletes every key bound to it
///
/// The lease is granted lazily by [`SessionLease::grant`] and renewed in the
/// background every `ttl / 3`. If renewal reports the lease gone, or keeps
/// failing for longer than the TTL, subscribers of
/// [`SessionLease::subscribe_lost`] are notified once.
pub struct SessionLease {
    store: Arc<dyn CoordinationStore>,
    ttl: Duration,
    state: Mutex<LeaseState>,
    revoked: AtomicBool,
    lost_tx: broadcast::Sender<LeaseId>,
}

impl SessionLease {
    /// Create an ungranted lease
    pub fn new(store: Arc<dyn CoordinationStore>, ttl: Duration) -> Self {
        let (lost_tx, _) = broadcast::channel(1);
        Self {
            store,
            ttl,
            state: Mutex::new(LeaseState::default()),
            revoked: AtomicBool::new(false),
            lost_tx,
        }
    }

    /// Lease TTL
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Granted id, if any
    pub async fn id(&self) -> Option<LeaseId> {
        self.state.lock().await.id
    }

    /// Whether [`SessionLease::revoke`] has been called
    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    /// Notification fired when the lease disappears without being revoked
    pub fn subscribe_lost(&self) -> broadcast::Receiver<LeaseId> {
        self.lost_tx.subscribe()
    }

    /// Grant the lease, or return the id already granted
    pub async fn grant(&self) -> Result<LeaseId, StoreError> {
        if self.is_revoked() {
            return Err(StoreError::Backend("lease already revoked".to_string()));
        }

        let mut state = self.state.lock().await;
        if let Some(id) = state.id {
            return Ok(id);
        }

        let id = self.store.lease_grant(self.ttl).await?;
        state.id = Some(id);
        state.keep_alive = Some(tokio::spawn(keep_alive(
            self.store.clone(),
            id,
            self.ttl,
            self.lost_tx.clone(),
        )));

        info!("Granted lease {} (ttl {:?})", id, self.ttl);
        Ok(id)
    }

    /// Revoke the lease. A no-op if already revoked or never granted.
    pub async fn revoke(&self) -> Result<(), StoreError> {
        if self.revoked.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        if let Some(handle) = state.keep_alive.take() {
            handle.abort();
        }

        let Some(id) = state.id else {
            return Ok(());
        };

        match self.store.lease_revoke(id).await {
            Ok(()) => {
                info!("Revoked lease {}", id);
                Ok(())
            }
            Err(StoreError::LeaseNotFound(_)) => {
                debug!("Lease {} already gone at revoke", id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(handle) = self.state.get_mut().keep_alive.take() {
            handle.abort();
        }
    }
}

async fn keep_alive(
    store: Arc<dyn CoordinationStore>,
    id: LeaseId,
    ttl: Duration,
    lost_tx: broadcast::Sender<LeaseId>,
) {
    let refresh_interval = Duration::from_millis((ttl.as_millis() / 3).max(1) as u64);
    let mut last_renewed = Instant::now();

    loop {
        tokio::time::sleep(refresh_interval).await;

        match store.lease_keep_alive(id).await {
            Ok(Some(_)) => {
                last_renewed = Instant::now();
                debug!("Renewed lease {}", id);
            }
            Ok(None) => {
                warn!("Lease {} no longer exists", id);
                let _ = lost_tx.send(id);
                return;
            }
            Err(e) => {
                warn!("Failed to renew lease {}: {}", id, e);
                if last_renewed.elapsed() >= ttl {
                    warn!("Lease {} expired while renewals were failing", id);
                    let _ = lost_tx.send(id);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;

    fn lease(store: &InMemoryStore, ttl: Duration) -> SessionLease {
        SessionLease::new(Arc::new(store.clone()), ttl)
    }

    #[tokio::test]
    async fn test_grant_is_idempotent() {
        let store = InMemoryStore::new();
        let lease = lease(&store, Duration::from_secs(30));
        assert_eq!(lease.id().await, None);

        let first = lease.grant().await.unwrap();
        let second = lease.grant().await.unwrap();
        assert_eq!(first, second);
        assert!(store.has_lease(first));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_outlives_ttl() {
        let store = InMemoryStore::new();
        let lease = lease(&store, Duration::from_secs(3));
        let id = lease.grant().await.unwrap();

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(store.has_lease(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_fires_when_lease_disappears() {
        let store = InMemoryStore::new();
        let lease = lease(&store, Duration::from_secs(3));
        let mut lost = lease.subscribe_lost();
        let id = lease.grant().await.unwrap();

        store.expire_lease(id);
        assert_eq!(lost.recv().await.unwrap(), id);
        assert!(!lease.is_revoked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_fires_after_failing_renewals() {
        let store = InMemoryStore::new();
        let lease = lease(&store, Duration::from_secs(3));
        let mut lost = lease.subscribe_lost();
        let id = lease.grant().await.unwrap();

        store.set_unavailable(true);
        assert_eq!(lost.recv().await.unwrap(), id);
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let store = InMemoryStore::new();
        let lease = lease(&store, Duration::from_secs(30));

        // Never granted
        lease.revoke().await.unwrap();
        assert!(lease.is_revoked());
        assert!(lease.grant().await.is_err());

        let lease = SessionLease::new(Arc::new(store.clone()), Duration::from_secs(30));
        let id = lease.grant().await.unwrap();
        store.expire_lease(id);
        lease.revoke().await.unwrap();
        lease.revoke().await.unwrap();
        assert!(!store.has_lease(id));
    }
}
