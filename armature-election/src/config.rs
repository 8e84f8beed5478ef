//! Election configuration.

use crate::error::{ElectionError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Election configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Session lease time-to-live.
    #[serde(with = "secs_serde", default = "default_ttl")]
    pub ttl: Duration,
    /// Consecutive failed observation cycles tolerated before giving up.
    #[serde(default = "default_observe_max_retries")]
    pub observe_max_retries: u32,
    /// Backoff after the first failed observation cycle.
    #[serde(with = "millis_serde", default = "default_observe_backoff")]
    pub observe_backoff: Duration,
    /// Upper bound on observation backoff.
    #[serde(with = "millis_serde", default = "default_observe_max_backoff")]
    pub observe_max_backoff: Duration,
    /// Buffered events per subscriber before it starts lagging.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_observe_max_retries() -> u32 {
    5
}

fn default_observe_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_observe_max_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_event_capacity() -> usize {
    64
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            observe_max_retries: default_observe_max_retries(),
            observe_backoff: default_observe_backoff(),
            observe_max_backoff: default_observe_max_backoff(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl ElectionConfig {
    /// Shortest lease TTL a store can grant.
    pub const MIN_TTL: Duration = Duration::from_secs(1);

    /// Create a configuration with the given lease TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Default::default()
        }
    }

    /// Create a builder.
    pub fn builder() -> ElectionConfigBuilder {
        ElectionConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> ElectionConfigBuilder {
        let mut builder = ElectionConfigBuilder::new();

        if let Ok(ttl) = std::env::var("ARMATURE_ELECTION_TTL")
            && let Ok(secs) = ttl.parse() {
                builder = builder.ttl(Duration::from_secs(secs));
            }

        if let Ok(retries) = std::env::var("ARMATURE_ELECTION_OBSERVE_MAX_RETRIES")
            && let Ok(retries) = retries.parse() {
                builder = builder.observe_max_retries(retries);
            }

        if let Ok(backoff) = std::env::var("ARMATURE_ELECTION_OBSERVE_BACKOFF_MS")
            && let Ok(ms) = backoff.parse() {
                builder = builder.observe_backoff(Duration::from_millis(ms));
            }

        if let Ok(backoff) = std::env::var("ARMATURE_ELECTION_OBSERVE_MAX_BACKOFF_MS")
            && let Ok(ms) = backoff.parse() {
                builder = builder.observe_max_backoff(Duration::from_millis(ms));
            }

        if let Ok(capacity) = std::env::var("ARMATURE_ELECTION_EVENT_CAPACITY")
            && let Ok(capacity) = capacity.parse() {
                builder = builder.event_capacity(capacity);
            }

        builder
    }

    /// Check the configuration for values the election cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.ttl < Self::MIN_TTL {
            return Err(ElectionError::Config(
                "ttl must be at least one second".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ElectionError::Config(
                "event_capacity must be greater than zero".to_string(),
            ));
        }
        if self.observe_backoff > self.observe_max_backoff {
            return Err(ElectionError::Config(
                "observe_backoff must not exceed observe_max_backoff".to_string(),
            ));
        }
        Ok(())
    }

    /// Backoff before retry number `attempt` (1-based), without jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.observe_backoff
            .saturating_mul(1u32 << exp)
            .min(self.observe_max_backoff)
    }
}

/// Builder for election configuration.
#[derive(Default)]
pub struct ElectionConfigBuilder {
    config: ElectionConfig,
}

impl ElectionConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: ElectionConfig::default(),
        }
    }

    /// Set the lease TTL.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.config.ttl = ttl;
        self
    }

    /// Set the observation retry limit.
    pub fn observe_max_retries(mut self, retries: u32) -> Self {
        self.config.observe_max_retries = retries;
        self
    }

    /// Set the initial observation backoff.
    pub fn observe_backoff(mut self, backoff: Duration) -> Self {
        self.config.observe_backoff = backoff;
        self
    }

    /// Set the maximum observation backoff.
    pub fn observe_max_backoff(mut self, backoff: Duration) -> Self {
        self.config.observe_max_backoff = backoff;
        self
    }

    /// Set the event channel capacity.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ElectionConfig {
        self.config
    }
}

mod secs_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

mod millis_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
