//! Watch guards and the wait-for-deletion loop

use crate::error::{ElectionError, Result};
use crate::namespace::Namespace;
use crate::store::{StoreError, WatchEvent, Watcher};
use tracing::{debug, warn};

/// Owns a backend watcher and releases it exactly once
///
/// Dropping the guard without calling [`WatchGuard::cancel`] schedules a
/// best-effort cancel on the current tokio runtime.
pub struct WatchGuard {
    watcher: Option<Box<dyn Watcher>>,
    prefix: String,
}

impl WatchGuard {
    pub(crate) fn new(watcher: Box<dyn Watcher>, prefix: String) -> Self {
        Self {
            watcher: Some(watcher),
            prefix,
        }
    }

    /// Next event with its key made relative to the namespace
    pub async fn next_event(&mut self) -> std::result::Result<Option<WatchEvent>, StoreError> {
        let watcher = self.watcher.as_mut().ok_or(StoreError::Closed)?;
        let event = watcher.next_event().await?;

        Ok(event.map(|event| match event {
            WatchEvent::Put(mut kv) => {
                strip(&mut kv.key, &self.prefix);
                WatchEvent::Put(kv)
            }
            WatchEvent::Delete(mut kv) => {
                strip(&mut kv.key, &self.prefix);
                WatchEvent::Delete(kv)
            }
        }))
    }

    /// Whether the watch has not been released yet
    pub fn is_active(&self) -> bool {
        self.watcher.is_some()
    }

    /// Release the watch
    pub async fn cancel(mut self) -> std::result::Result<(), StoreError> {
        match self.watcher.take() {
            Some(mut watcher) => watcher.cancel().await,
            None => Ok(()),
        }
    }
}

fn strip(key: &mut String, prefix: &str) {
    if let Some(stripped) = key.strip_prefix(prefix) {
        *key = stripped.to_string();
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        let Some(mut watcher) = self.watcher.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = watcher.cancel().await {
                        debug!("Deferred watch cancel failed: {}", e);
                    }
                });
            }
            Err(_) => warn!("Watch dropped outside a tokio runtime; not cancelled"),
        }
    }
}

/// Block until `key` is deleted
///
/// The watch is opened before the existence check so a deletion landing in
/// between is not missed. A key that is already gone returns immediately.
pub async fn wait_for_delete(namespace: &Namespace, key: &str) -> Result<()> {
    let mut guard = namespace.watch_key(key).await?;

    let outcome = match namespace.get(key).await {
        Ok(None) => {
            debug!("Key {} already deleted", namespace.full_key(key));
            Ok(())
        }
        Ok(Some(_)) => next_delete(&mut guard, namespace, key).await,
        Err(e) => Err(e.into()),
    };

    if let Err(e) = guard.cancel().await {
        debug!("Failed to cancel watch on {}: {}", namespace.full_key(key), e);
    }

    outcome
}

async fn next_delete(guard: &mut WatchGuard, namespace: &Namespace, key: &str) -> Result<()> {
    loop {
        match guard.next_event().await {
            Ok(Some(WatchEvent::Delete(_))) => return Ok(()),
            Ok(Some(WatchEvent::Put(_))) => continue,
            Ok(None) => {
                return Err(ElectionError::Watch(format!(
                    "watch on {} closed before delete",
                    namespace.full_key(key)
                )));
            }
            Err(e) => return Err(ElectionError::Watch(e.to_string())),
        }
    }
}

/// Wait for every key in `keys` to be deleted, one at a time, in order
///
/// Deleting one key says nothing about the others, so each is checked and
/// waited on in turn.
pub async fn wait_for_deletes(namespace: &Namespace, keys: &[String]) -> Result<()> {
    for key in keys {
        debug!("Waiting for deletion of {}", namespace.full_key(key));
        wait_for_delete(namespace, key).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_for_missing_key_returns() {
        let store = InMemoryStore::new();
        let ns = Namespace::new(Arc::new(store.clone()), "p/");

        wait_for_delete(&ns, "gone").await.unwrap();
        assert_eq!(store.active_watchers(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_delete_resolves_on_delete() {
        let store = InMemoryStore::new();
        let ns = Namespace::new(Arc::new(store.clone()), "p/");
        store.put("p/a", "1").await.unwrap();

        let waiter = {
            let ns = ns.clone();
            tokio::spawn(async move { wait_for_delete(&ns, "a").await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        store.put("p/a", "2").await.unwrap();
        store.delete("p/a").await.unwrap();

        waiter.await.unwrap().unwrap();
        assert_eq!(store.active_watchers(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_delete_surfaces_watch_error() {
        let store = InMemoryStore::new();
        let ns = Namespace::new(Arc::new(store.clone()), "p/");
        store.put("p/a", "1").await.unwrap();

        let waiter = {
            let ns = ns.clone();
            tokio::spawn(async move { wait_for_delete(&ns, "a").await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.fail_watches("compacted");

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, ElectionError::Watch(_)));
        assert_eq!(store.active_watchers(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_deletes_is_sequential() {
        let store = InMemoryStore::new();
        let ns = Namespace::new(Arc::new(store.clone()), "p/");
        store.put("p/a", "1").await.unwrap();
        store.put("p/b", "1").await.unwrap();

        let waiter = {
            let ns = ns.clone();
            let keys = vec!["b".to_string(), "a".to_string()];
            tokio::spawn(async move { wait_for_deletes(&ns, &keys).await })
        };

        // Deleting the older key first: the loop is still parked on "b"
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.delete("p/a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // "a" is skipped once its turn arrives
        store.delete("p/b").await.unwrap();
        waiter.await.unwrap().unwrap();
        assert_eq!(store.active_watchers(), 0);
    }

    #[tokio::test]
    async fn test_dropped_guard_is_cancelled() {
        let store = InMemoryStore::new();
        let ns = Namespace::new(Arc::new(store.clone()), "p/");

        let guard = ns.watch_prefix().await.unwrap();
        assert!(guard.is_active());
        assert_eq!(store.active_watchers(), 1);

        drop(guard);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.active_watchers(), 0);
    }
}
