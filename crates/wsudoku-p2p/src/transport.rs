//! Transport seam consumed by the lobby

use async_trait::async_trait;

use crate::types::{ContentTopic, PubsubTopic, Receipt, StoredMessage};

/// Network transport: relay publish plus store history query
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a payload under (topic, classifier)
    async fn publish(
        &self,
        topic: &PubsubTopic,
        classifier: &ContentTopic,
        payload: Vec<u8>,
    ) -> Result<Receipt, NetworkError>;

    /// Query everything the store currently holds for (topic, classifier)
    async fn query(
        &self,
        topic: &PubsubTopic,
        classifier: &ContentTopic,
    ) -> Result<Vec<StoredMessage>, NetworkError>;

    /// Number of currently connected peers
    fn peer_count(&self) -> usize;

    /// Release transport resources; in-flight calls may still complete
    async fn shutdown(&self);
}

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    #[error("no route to store: {0}")]
    Unreachable(String),
    #[error("transport closed")]
    Closed,
}
