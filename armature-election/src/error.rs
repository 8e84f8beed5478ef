//! Election error types.

use crate::store::{LeaseId, StoreError};
use thiserror::Error;

/// Result type for election operations.
pub type Result<T> = std::result::Result<T, ElectionError>;

/// Election errors.
#[derive(Debug, Error)]
pub enum ElectionError {
    /// Not campaigning, or leadership was lost to a failed compare-and-swap.
    #[error("election: not leader")]
    NotLeader,

    /// No live candidates under the election prefix.
    #[error("election: no leader")]
    NoLeader,

    /// A predecessor, leader or prefix watch failed.
    #[error("Watch error: {0}")]
    Watch(String),

    /// The session lease disappeared without being revoked.
    #[error("Lease {0} lost")]
    LeaseLost(LeaseId),

    /// A fresh lease could not be acquired after a loss.
    #[error("Lease recovery failed: {0}")]
    LeaseRecovery(String),

    /// Observation gave up after repeated failures.
    #[error("Observation failed after {attempts} attempts: {last_error}")]
    ObservationFailed { attempts: u32, last_error: String },

    /// The election was closed.
    #[error("Election closed")]
    Closed,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Underlying store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl ElectionError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Watch(_) => true,
            Self::Store(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Check if this error means leadership is not held.
    pub fn is_not_leader(&self) -> bool {
        matches!(self, Self::NotLeader | Self::LeaseLost(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(ElectionError::NotLeader.to_string(), "election: not leader");
        assert_eq!(ElectionError::NoLeader.to_string(), "election: no leader");
        assert_eq!(
            ElectionError::LeaseLost(LeaseId(12)).to_string(),
            "Lease 12 lost"
        );
    }

    #[test]
    fn test_store_error_conversion() {
        let err: ElectionError = StoreError::Connection("refused".into()).into();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("refused"));

        let err: ElectionError = StoreError::LeaseNotFound(LeaseId(1)).into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_leader_classification() {
        assert!(ElectionError::NotLeader.is_not_leader());
        assert!(ElectionError::LeaseLost(LeaseId(3)).is_not_leader());
        assert!(!ElectionError::NoLeader.is_not_leader());
    }
}
