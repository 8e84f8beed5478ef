//! Election notifications

use crate::election::ElectionInner;
use crate::error::ElectionError;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::warn;

/// Notification emitted by an [`Election`](crate::Election)
#[derive(Debug, Clone)]
pub enum ElectionEvent {
    /// Full key of the current leader
    Leader(String),

    /// Observation or lease-recovery failure
    Error(Arc<ElectionError>),
}

impl ElectionEvent {
    /// Leader key carried by a `Leader` event
    pub fn leader_key(&self) -> Option<&str> {
        match self {
            ElectionEvent::Leader(key) => Some(key),
            ElectionEvent::Error(_) => None,
        }
    }

    /// Error carried by an `Error` event
    pub fn error(&self) -> Option<&ElectionError> {
        match self {
            ElectionEvent::Leader(_) => None,
            ElectionEvent::Error(e) => Some(e),
        }
    }
}

/// Receiving end of an election's notifications
///
/// A subscription created by [`Election::subscribe`](crate::Election::subscribe)
/// counts as a leader listener: observation keeps running while at least one
/// exists. Subscriptions from [`Election::errors`](crate::Election::errors)
/// only see `Error` events and do not keep observation alive.
pub struct ElectionSubscription {
    rx: broadcast::Receiver<ElectionEvent>,
    listener: Option<Arc<ElectionInner>>,
}

impl ElectionSubscription {
    pub(crate) fn leader(rx: broadcast::Receiver<ElectionEvent>, inner: Arc<ElectionInner>) -> Self {
        inner.leader_listeners.fetch_add(1, Ordering::AcqRel);
        Self {
            rx,
            listener: Some(inner),
        }
    }

    pub(crate) fn errors(rx: broadcast::Receiver<ElectionEvent>) -> Self {
        Self { rx, listener: None }
    }

    /// Whether this subscription drives observation
    pub fn is_leader_listener(&self) -> bool {
        self.listener.is_some()
    }

    fn accepts(&self, event: &ElectionEvent) -> bool {
        self.is_leader_listener() || matches!(event, ElectionEvent::Error(_))
    }

    /// Next event; `None` once the election is gone
    pub async fn recv(&mut self) -> Option<ElectionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Election subscriber lagged, {} events dropped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next buffered event without waiting
    pub fn try_recv(&mut self) -> Option<ElectionEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.accepts(&event) => return Some(event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Election subscriber lagged, {} events dropped", skipped);
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for ElectionSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.listener.take() {
            inner.leader_listeners.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
