//! Session entities and the membership records published for them
//!
//! [`MembershipRecord`] is the unit that goes over the wire. Materialized
//! sessions are never sent; they are rebuilt from records by the directory.
//!
//! Wire format (JSON, unset fields omitted, absent or null fields decode as
//! zero values):
//!
//! ```text
//! { "kind": "join",                  // absent => create
//!   "playerCount": 1,
//!   "players": [{ "id": "..", "joinTime": 1700000000000000,
//!                 "currentGame": "<gameID>", "isAdmin": false, "finished": false }],
//!   "gameID": "<64 hex>", "gameData": "<base64>", "title": "Sudoku-42",
//!   "publishedAt": 1700000000000000 } // absent => store timestamp
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use wsudoku_p2p::PeerId;

use crate::identity::{derive_id, SessionId};

/// One game instance as announced by its creator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    /// Opaque puzzle payload, immutable after creation
    pub puzzle_blob: Vec<u8>,
    /// Creator-local unix micros
    pub created_at: i64,
}

/// A peer taking part in a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub peer_id: PeerId,
    /// Joiner-local unix micros
    pub joined_at: i64,
    pub is_admin: bool,
    pub finished: bool,
}

impl Participant {
    /// Non-admin participant that has not finished
    pub fn new(peer_id: PeerId, joined_at: i64) -> Self {
        Self {
            peer_id,
            joined_at,
            is_admin: false,
            finished: false,
        }
    }
}

/// Record variant, also the fold tie-break rank
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Create,
    Join,
    Finish,
    Leave,
}

/// Immutable, timestamped fact about a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipRecord {
    Create {
        session: Session,
        creator: Participant,
        at: i64,
    },
    Join {
        session_id: SessionId,
        participant: Participant,
        at: i64,
    },
    Leave {
        session_id: SessionId,
        peer_id: PeerId,
        at: i64,
    },
    Finish {
        session_id: SessionId,
        peer_id: PeerId,
        at: i64,
    },
}

impl MembershipRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Create { .. } => RecordKind::Create,
            Self::Join { .. } => RecordKind::Join,
            Self::Leave { .. } => RecordKind::Leave,
            Self::Finish { .. } => RecordKind::Finish,
        }
    }

    /// Session this record belongs to
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Create { session, .. } => &session.id,
            Self::Join { session_id, .. }
            | Self::Leave { session_id, .. }
            | Self::Finish { session_id, .. } => session_id,
        }
    }

    /// Peer the record is about
    pub fn peer_id(&self) -> &PeerId {
        match self {
            Self::Create { creator, .. } => &creator.peer_id,
            Self::Join { participant, .. } => &participant.peer_id,
            Self::Leave { peer_id, .. } | Self::Finish { peer_id, .. } => peer_id,
        }
    }

    /// Publish timestamp (unix micros)
    pub fn timestamp(&self) -> i64 {
        match self {
            Self::Create { at, .. }
            | Self::Join { at, .. }
            | Self::Leave { at, .. }
            | Self::Finish { at, .. } => *at,
        }
    }

    /// Serialize to the wire payload
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&WireRecord::from(self))
    }

    /// Decode a wire payload; `store_timestamp` is used when the payload
    /// carries no publish timestamp of its own
    pub fn decode(payload: &[u8], store_timestamp: i64) -> Result<Self, DecodeError> {
        let wire: WireRecord = serde_json::from_slice(payload)?;
        wire.into_record(store_timestamp)
    }
}

/// Per-record decode failure; never fatal to a refresh
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid game id {0:?}")]
    InvalidGameId(String),
    #[error("game id does not match title {0:?}")]
    IdMismatch(String),
    #[error("{0:?} record carries no player")]
    MissingPlayer(RecordKind),
    #[error("player id is empty")]
    EmptyPlayerId,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kind: Option<RecordKind>,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "is_zero_usize")]
    player_count: usize,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    players: Vec<WirePlayer>,
    #[serde(rename = "gameID", default, deserialize_with = "null_as_default")]
    game_id: String,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    game_data: Vec<u8>,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    title: String,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "is_zero_i64")]
    published_at: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePlayer {
    #[serde(default, deserialize_with = "null_as_default")]
    id: String,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "is_zero_i64")]
    join_time: i64,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "String::is_empty")]
    current_game: String,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "is_false")]
    is_admin: bool,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "is_false")]
    finished: bool,
}

impl WirePlayer {
    fn new(participant: &Participant, session_id: &SessionId) -> Self {
        Self {
            id: participant.peer_id.to_string(),
            join_time: participant.joined_at,
            current_game: session_id.to_string(),
            is_admin: participant.is_admin,
            finished: participant.finished,
        }
    }

    fn bare(peer_id: &PeerId, session_id: &SessionId, finished: bool) -> Self {
        Self {
            id: peer_id.to_string(),
            current_game: session_id.to_string(),
            finished,
            ..Default::default()
        }
    }
}

impl From<&MembershipRecord> for WireRecord {
    fn from(record: &MembershipRecord) -> Self {
        let session_id = record.session_id();
        let (kind, players) = match record {
            MembershipRecord::Create { creator, .. } => (None, vec![WirePlayer::new(creator, session_id)]),
            MembershipRecord::Join { participant, .. } => {
                (Some(RecordKind::Join), vec![WirePlayer::new(participant, session_id)])
            }
            MembershipRecord::Leave { peer_id, .. } => {
                (Some(RecordKind::Leave), vec![WirePlayer::bare(peer_id, session_id, false)])
            }
            MembershipRecord::Finish { peer_id, .. } => {
                (Some(RecordKind::Finish), vec![WirePlayer::bare(peer_id, session_id, true)])
            }
        };
        let (title, game_data) = match record {
            MembershipRecord::Create { session, .. } => (session.title.clone(), session.puzzle_blob.clone()),
            _ => (String::new(), Vec::new()),
        };
        Self {
            kind,
            player_count: players.len(),
            players,
            game_id: session_id.to_string(),
            game_data,
            title,
            published_at: record.timestamp(),
        }
    }
}

impl WireRecord {
    fn into_record(self, store_timestamp: i64) -> Result<MembershipRecord, DecodeError> {
        let bare = self.kind.is_none();
        let kind = self.kind.unwrap_or(RecordKind::Create);
        let at = if self.published_at != 0 {
            self.published_at
        } else {
            store_timestamp
        };
        let session_id = match SessionId::parse(&self.game_id) {
            Some(id) => id,
            // bare announcements carry the raw digest, not hex; the title is authoritative
            None if bare => derive_id(&self.title).map_err(|_| DecodeError::InvalidGameId(self.game_id.clone()))?,
            None => return Err(DecodeError::InvalidGameId(self.game_id)),
        };

        let player = self
            .players
            .into_iter()
            .next()
            .ok_or(DecodeError::MissingPlayer(kind))?;
        if player.id.is_empty() {
            return Err(DecodeError::EmptyPlayerId);
        }
        let peer_id = PeerId::new(player.id);

        let record = match kind {
            RecordKind::Create => {
                match derive_id(&self.title) {
                    Ok(id) if id == session_id => {}
                    _ => return Err(DecodeError::IdMismatch(self.title)),
                }
                let joined_at = if player.join_time != 0 { player.join_time } else { at };
                MembershipRecord::Create {
                    session: Session {
                        id: session_id,
                        title: self.title,
                        puzzle_blob: self.game_data,
                        created_at: at,
                    },
                    creator: Participant {
                        peer_id,
                        joined_at,
                        is_admin: true,
                        finished: false,
                    },
                    at,
                }
            }
            RecordKind::Join => {
                let joined_at = if player.join_time != 0 { player.join_time } else { at };
                MembershipRecord::Join {
                    session_id,
                    participant: Participant::new(peer_id, joined_at),
                    at,
                }
            }
            RecordKind::Leave => MembershipRecord::Leave {
                session_id,
                peer_id,
                at,
            },
            RecordKind::Finish => MembershipRecord::Finish {
                session_id,
                peer_id,
                at,
            },
        };
        Ok(record)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn is_zero_usize(n: &usize) -> bool {
    *n == 0
}

fn is_zero_i64(n: &i64) -> bool {
    *n == 0
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// `Vec<u8>` as a standard base64 string; null decodes as empty
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => STANDARD.decode(s.as_bytes()).map_err(D::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
