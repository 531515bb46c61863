//! Lobby configuration
//!
//! Plain serde struct so binaries can load it from TOML. Durations are kept
//! in milliseconds on disk.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use wsudoku_p2p::{ContentTopic, PubsubTopic, GAMEPLAY_CONTENT_TOPIC, LOBBY_CONTENT_TOPIC, PUBSUB_TOPIC};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LobbyConfig {
    /// Shared network-wide topic
    pub pubsub_topic: String,
    /// Classifier for session-lifecycle records
    pub lobby_topic: String,
    /// Classifier for gameplay traffic (never queried by the directory)
    pub gameplay_topic: String,
    /// How long a published join waits for a confirming refresh
    pub join_confirm_timeout_ms: u64,
    /// Periodic refresh; `None` refreshes only on demand
    pub refresh_interval_ms: Option<u64>,
    /// Entries kept in the peer connection log
    pub peer_log_capacity: usize,
    /// Retry policy for refreshes the runtime schedules itself
    pub backoff: BackoffPolicy,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            pubsub_topic: PUBSUB_TOPIC.to_string(),
            lobby_topic: LOBBY_CONTENT_TOPIC.to_string(),
            gameplay_topic: GAMEPLAY_CONTENT_TOPIC.to_string(),
            join_confirm_timeout_ms: 30_000,
            refresh_interval_ms: None,
            peer_log_capacity: 100,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl LobbyConfig {
    pub fn pubsub_topic(&self) -> PubsubTopic {
        PubsubTopic(self.pubsub_topic.clone())
    }

    pub fn lobby_topic(&self) -> ContentTopic {
        ContentTopic(self.lobby_topic.clone())
    }

    pub fn gameplay_topic(&self) -> ContentTopic {
        ContentTopic(self.gameplay_topic.clone())
    }

    pub fn join_confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.join_confirm_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval_ms.map(Duration::from_millis)
    }

    /// Check the values are usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pubsub_topic.is_empty() || self.lobby_topic.is_empty() {
            return Err(ConfigError::EmptyTopic);
        }
        if self.lobby_topic == self.gameplay_topic {
            return Err(ConfigError::SharedClassifier);
        }
        if self.join_confirm_timeout_ms == 0 {
            return Err(ConfigError::ZeroDuration("join_confirm_timeout_ms"));
        }
        if self.refresh_interval_ms == Some(0) {
            return Err(ConfigError::ZeroDuration("refresh_interval_ms"));
        }
        if self.peer_log_capacity == 0 {
            return Err(ConfigError::ZeroLogCapacity);
        }
        self.backoff.validate()
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub initial_ms: u64,
    pub max_interval_ms: u64,
    /// Give up after this much total time
    pub max_elapsed_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_interval_ms: 5_000,
            max_elapsed_ms: 20_000,
        }
    }
}

impl BackoffPolicy {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn max_elapsed(&self) -> Duration {
        Duration::from_millis(self.max_elapsed_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_ms == 0 {
            return Err(ConfigError::ZeroDuration("backoff.initial_ms"));
        }
        if self.max_interval_ms < self.initial_ms {
            return Err(ConfigError::InvalidBackoff);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("topics must not be empty")]
    EmptyTopic,
    #[error("lobby and gameplay classifiers must differ")]
    SharedClassifier,
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("peer log capacity must be greater than zero")]
    ZeroLogCapacity,
    #[error("backoff max interval must be >= initial interval")]
    InvalidBackoff,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = LobbyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lobby_topic().0, "/wsudoku/1/games/proto");
        assert_eq!(config.join_confirm_timeout(), Duration::from_secs(30));
        assert!(config.refresh_interval().is_none());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let shared = LobbyConfig {
            gameplay_topic: LOBBY_CONTENT_TOPIC.into(),
            ..Default::default()
        };
        assert_eq!(shared.validate(), Err(ConfigError::SharedClassifier));

        let zero = LobbyConfig {
            refresh_interval_ms: Some(0),
            ..Default::default()
        };
        assert_eq!(zero.validate(), Err(ConfigError::ZeroDuration("refresh_interval_ms")));

        let backoff = LobbyConfig {
            backoff: BackoffPolicy {
                initial_ms: 1_000,
                max_interval_ms: 10,
                max_elapsed_ms: 100,
            },
            ..Default::default()
        };
        assert_eq!(backoff.validate(), Err(ConfigError::InvalidBackoff));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: LobbyConfig =
            serde_json::from_str(r#"{"join_confirm_timeout_ms": 5000, "backoff": {"initial_ms": 10}}"#).unwrap();
        assert_eq!(config.join_confirm_timeout_ms, 5_000);
        assert_eq!(config.backoff.initial_ms, 10);
        assert_eq!(config.backoff.max_interval_ms, 5_000);
        assert_eq!(config.pubsub_topic, PUBSUB_TOPIC);
    }
}
