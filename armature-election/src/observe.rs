//! Passive leadership observation
//!
//! One cycle finds the current leader (waiting for the first candidate if
//! there is none), reports it, then waits for that key to be deleted. Cycles
//! repeat while at least one leader listener is subscribed.

use crate::election::ElectionInner;
use crate::error::{ElectionError, Result};
use crate::events::ElectionEvent;
use crate::namespace::Namespace;
use crate::store::{SortOrder, WatchEvent};
use crate::watch::{WatchGuard, wait_for_delete};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Start the observation loop unless it is already running
pub(crate) fn try_observe(inner: &Arc<ElectionInner>) -> bool {
    if inner.is_closed() {
        return false;
    }
    if inner
        .observing
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return false;
    }

    tokio::spawn(run(inner.clone()));
    true
}

async fn run(inner: Arc<ElectionInner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut failures: u32 = 0;
    let mut gave_up = false;
    let mut last_leader: Option<String> = None;

    info!("Observing election {}", inner.name);

    loop {
        let outcome = tokio::select! {
            _ = shutdown.wait_for(|closed| *closed) => break,
            outcome = cycle(&inner, &mut last_leader) => outcome,
        };

        if let Err(e) = outcome {
            failures += 1;
            let message = e.to_string();
            warn!(
                "Observation of {} failed (attempt {}): {}",
                inner.name, failures, message
            );
            inner.emit(ElectionEvent::Error(Arc::new(e)));

            if failures > inner.config.observe_max_retries {
                error!("Giving up observing {} after {} failures", inner.name, failures);
                inner.emit(ElectionEvent::Error(Arc::new(
                    ElectionError::ObservationFailed {
                        attempts: failures,
                        last_error: message,
                    },
                )));
                gave_up = true;
                break;
            }

            let delay = jittered(inner.config.backoff_for(failures));
            tokio::select! {
                _ = shutdown.wait_for(|closed| *closed) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        } else {
            failures = 0;
        }

        if inner.leader_listeners.load(Ordering::Acquire) == 0 {
            break;
        }
    }

    inner.observing.store(false, Ordering::Release);
    debug!("Stopped observing election {}", inner.name);

    // A listener may have subscribed while the loop was winding down
    if !gave_up && inner.leader_listeners.load(Ordering::Acquire) > 0 {
        try_observe(&inner);
    }
}

async fn cycle(inner: &ElectionInner, last_leader: &mut Option<String>) -> Result<()> {
    let namespace = &inner.namespace;

    let leader = match current_leader(namespace).await? {
        Some(key) => key,
        None => {
            debug!("No leader in {}, waiting for a candidate", inner.name);
            let guard = namespace.watch_prefix().await?;
            first_candidate(namespace, guard).await?
        }
    };

    let full_key = namespace.full_key(&leader);
    if last_leader.as_deref() != Some(full_key.as_str()) {
        debug!("Leader of {} is {}", inner.name, full_key);
        inner.emit(ElectionEvent::Leader(full_key.clone()));
        *last_leader = Some(full_key);
    }

    wait_for_delete(namespace, &leader).await?;
    *last_leader = None;
    Ok(())
}

async fn current_leader(namespace: &Namespace) -> Result<Option<String>> {
    let keys = namespace
        .range()
        .sort(SortOrder::Ascend)
        .limit(1)
        .keys()
        .await?;
    Ok(keys.into_iter().next())
}

/// Resolve the first candidate key, cancelling the prefix watch on every path
async fn first_candidate(namespace: &Namespace, mut guard: WatchGuard) -> Result<String> {
    let outcome = next_put(namespace, &mut guard).await;
    if let Err(e) = guard.cancel().await {
        debug!("Failed to cancel prefix watch on {}: {}", namespace.prefix(), e);
    }
    outcome
}

async fn next_put(namespace: &Namespace, guard: &mut WatchGuard) -> Result<String> {
    // A candidate may have appeared between the range query and the watch
    if let Some(key) = current_leader(namespace).await? {
        return Ok(key);
    }

    loop {
        match guard.next_event().await {
            Ok(Some(WatchEvent::Put(kv))) => return Ok(kv.key),
            Ok(Some(WatchEvent::Delete(_))) => continue,
            Ok(None) => {
                return Err(ElectionError::Watch(format!(
                    "prefix watch on {} closed",
                    namespace.prefix()
                )));
            }
            Err(e) => return Err(ElectionError::Watch(e.to_string())),
        }
    }
}

fn jittered(base: Duration) -> Duration {
    let spread = (base.as_millis() as u64) / 4;
    if spread == 0 {
        return base;
    }
    base + Duration::from_millis(rand::rng().random_range(0..=spread))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(400);
        for _ in 0..50 {
            let delay = jittered(base);
            assert!(delay >= base);
            assert!(delay <= Duration::from_millis(500));
        }
        assert_eq!(jittered(Duration::from_millis(2)), Duration::from_millis(2));
    }
}
