//! Session identity derived from the human-chosen title
//!
//! `id = hex(sha256(title))`. Independent creators picking the same title
//! end up with the same id; the directory cannot tell them apart.

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{LobbyError, Result};

/// Derived, stable, opaque session identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("session id must be 64 lowercase hex chars, got {0:?}")]
pub struct InvalidSessionId(String);

impl SessionId {
    /// Wrap an id read off the wire; must be 64 lowercase hex chars
    pub fn parse(s: &str) -> Option<Self> {
        let valid = s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
        valid.then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 hex chars, for display
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl TryFrom<String> for SessionId {
    type Error = InvalidSessionId;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&s).ok_or(InvalidSessionId(s))
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the session id for a title
pub fn derive_id(title: &str) -> Result<SessionId> {
    if title.trim().is_empty() {
        return Err(LobbyError::InvalidTitle);
    }
    let digest = Sha256::digest(title.as_bytes());
    Ok(SessionId(hex::encode(digest)))
}

/// Random "Sudoku-N" title for quick game creation
pub fn generate_title<R: Rng + ?Sized>(rng: &mut R) -> String {
    format!("Sudoku-{}", rng.gen::<u32>())
}
