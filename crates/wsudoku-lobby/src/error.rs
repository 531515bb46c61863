use thiserror::Error;
use wsudoku_p2p::NetworkError;

use crate::identity::SessionId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LobbyError {
    #[error("invalid title: must contain a non-whitespace character")]
    InvalidTitle,

    #[error("no peers connected, wait for peers before announcing")]
    NoPeersAvailable,

    #[error("publish failed: {0}")]
    PublishFailed(NetworkError),

    #[error("failed to encode record: {0}")]
    Encode(String),

    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("join already in progress for session {0}")]
    JoinInProgress(SessionId),

    #[error("already joined session {0}")]
    AlreadyJoined(SessionId),

    #[error("no join attempt for session {0}")]
    NoJoinAttempt(SessionId),

    #[error("lobby runtime is not running")]
    RuntimeClosed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("directory query failed: {0}")]
    QueryFailed(NetworkError),
}

pub type Result<T> = std::result::Result<T, LobbyError>;
