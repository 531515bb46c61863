//! Common P2P types

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Peer identifier, stable per identity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Deterministic peer id from a key seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"WSUDOKU_PEER_ID");
        hasher.update(seed);
        let digest: [u8; 32] = hasher.finalize().into();
        Self(hex::encode(digest))
    }

    /// Fresh random peer id
    pub fn random() -> Self {
        Self::from_seed(&rand::random::<[u8; 32]>())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 chars, for log lines and status text
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Network-wide pubsub topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PubsubTopic(pub String);

/// Content classifier scoped under a pubsub topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentTopic(pub String);

impl fmt::Display for PubsubTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ContentTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message returned by a history query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub payload: Vec<u8>,
    /// Store-side timestamp (unix micros)
    pub timestamp: i64,
}

/// Acknowledgement of a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Receipt {
    /// Store sequence number
    pub seq: u64,
    /// Store-side timestamp (unix micros)
    pub timestamp: i64,
}

/// Peer connection change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivityEvent {
    pub peer: PeerId,
    pub connected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_from_seed_deterministic() {
        let a = PeerId::from_seed(&[7u8; 32]);
        let b = PeerId::from_seed(&[7u8; 32]);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_ne!(a, PeerId::from_seed(&[8u8; 32]));
    }

    #[test]
    fn test_random_peer_ids_differ() {
        let a = PeerId::random();
        assert_eq!(a.as_str().len(), 64);
        assert_ne!(a, PeerId::random());
    }

    #[test]
    fn test_peer_id_short() {
        assert_eq!(PeerId::new("0123456789abcdef").short(), "01234567");
        assert_eq!(PeerId::new("abc").short(), "abc");
    }
}
