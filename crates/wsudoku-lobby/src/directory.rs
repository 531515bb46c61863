//! Directory - materialized view of every session on the network
//!
//! Each refresh queries the store for all lobby records and folds them from
//! scratch. The result is a snapshot, never a delta: the store may trim
//! history, so a later refresh can legitimately contain less than an earlier
//! one.
//!
//! ## fold
//!
//! 1. group records by session id
//! 2. sort each group by (timestamp, peer id, kind) with the encoded payload
//!    as the final tie-break
//! 3. the earliest `Create` is the base; groups without one are orphaned
//! 4. `Join` inserts (no-op if present), `Leave` removes, `Finish` marks a
//!    present peer finished for good
//!
//! Participants are kept in peer-id order, so two folds of the same record
//! set are identical regardless of query order.

use backoff::ExponentialBackoffBuilder;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use wsudoku_p2p::{ContentTopic, PeerId, PubsubTopic, Transport};

use crate::config::{BackoffPolicy, LobbyConfig};
use crate::error::DirectoryError;
use crate::identity::SessionId;
use crate::record::{MembershipRecord, Participant, RecordKind, Session};

/// Session with its current membership
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedSession {
    pub session: Session,
    /// Peer whose `Create` record founded the session
    pub creator: PeerId,
    /// Current participants, ordered by peer id
    pub participants: Vec<Participant>,
    /// Another peer announced a session under the same title
    pub contested: bool,
}

impl MaterializedSession {
    pub fn player_count(&self) -> usize {
        self.participants.len()
    }

    pub fn participant(&self, peer: &PeerId) -> Option<&Participant> {
        self.participants
            .binary_search_by(|p| p.peer_id.cmp(peer))
            .ok()
            .map(|i| &self.participants[i])
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.participant(peer).is_some()
    }

    /// Display label; contested titles get the short id appended
    pub fn label(&self) -> String {
        if self.contested {
            format!("{} [{}]", self.session.title, self.session.id.short())
        } else {
            self.session.title.clone()
        }
    }
}

/// Counters for one refresh
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshStats {
    /// Messages returned by the store
    pub fetched: usize,
    /// Records decoded successfully
    pub decoded: usize,
    /// Payloads that failed to decode
    pub malformed: usize,
    /// Records dropped for lack of a reachable `Create`
    pub orphaned: usize,
    /// `Create` records from a second creator for an existing id
    pub collisions: usize,
}

/// Result of one refresh
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectorySnapshot {
    pub sessions: BTreeMap<SessionId, MaterializedSession>,
    pub stats: RefreshStats,
}

impl DirectorySnapshot {
    pub fn get(&self, id: &SessionId) -> Option<&MaterializedSession> {
        self.sessions.get(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn status(&self) -> DirectoryStatus {
        if self.sessions.is_empty() {
            DirectoryStatus::Empty
        } else {
            DirectoryStatus::Listed(self.sessions.len())
        }
    }
}

/// What the UI shows for the directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DirectoryStatus {
    /// Nothing fetched yet
    #[default]
    Unknown,
    /// Query succeeded, no sessions
    Empty,
    Listed(usize),
    /// Query failed; distinct from an empty network
    Failed(String),
}

impl std::fmt::Display for DirectoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "press refresh to find games"),
            Self::Empty => write!(f, "no games found"),
            Self::Listed(n) => write!(f, "{} game(s) online", n),
            Self::Failed(reason) => write!(f, "query failed: {}", reason),
        }
    }
}

/// Directory bound to one transport and lobby classifier
#[derive(Clone)]
pub struct Directory {
    transport: Arc<dyn Transport>,
    topic: PubsubTopic,
    classifier: ContentTopic,
}

impl Directory {
    pub fn new(transport: Arc<dyn Transport>, config: &LobbyConfig) -> Self {
        Self {
            transport,
            topic: config.pubsub_topic(),
            classifier: config.lobby_topic(),
        }
    }

    /// Query the store and rebuild every session from its records
    pub async fn refresh(&self) -> Result<DirectorySnapshot, DirectoryError> {
        let messages = self
            .transport
            .query(&self.topic, &self.classifier)
            .await
            .map_err(DirectoryError::QueryFailed)?;

        let fetched = messages.len();
        let mut malformed = 0;
        let mut records = Vec::with_capacity(fetched);
        for message in &messages {
            match MembershipRecord::decode(&message.payload, message.timestamp) {
                Ok(record) => records.push(record),
                Err(e) => {
                    malformed += 1;
                    warn!(timestamp = message.timestamp, "skipping lobby record: {}", e);
                }
            }
        }

        let mut snapshot = fold(records);
        snapshot.stats.fetched = fetched;
        snapshot.stats.malformed = malformed;

        info!(
            sessions = snapshot.len(),
            fetched,
            malformed,
            orphaned = snapshot.stats.orphaned,
            "directory refreshed"
        );
        Ok(snapshot)
    }
}

/// Refresh with bounded exponential backoff on query failure
pub async fn refresh_with_backoff(
    directory: &Directory,
    policy: &BackoffPolicy,
) -> Result<DirectorySnapshot, DirectoryError> {
    let backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(policy.initial())
        .with_max_interval(policy.max_interval())
        .with_max_elapsed_time(Some(policy.max_elapsed()))
        .build();

    backoff::future::retry(backoff, || async {
        directory.refresh().await.map_err(|e| {
            warn!("directory refresh failed, retrying: {}", e);
            backoff::Error::transient(e)
        })
    })
    .await
}

/// Total fold order: timestamp, peer id, kind, creation time, then the
/// encoded payload so distinct records never compare equal
fn fold_key(record: &MembershipRecord) -> (i64, PeerId, RecordKind, i64, Vec<u8>) {
    let created_at = match record {
        MembershipRecord::Create { session, .. } => session.created_at,
        _ => 0,
    };
    (
        record.timestamp(),
        record.peer_id().clone(),
        record.kind(),
        created_at,
        record.encode().unwrap_or_default(),
    )
}

/// Membership being folded for one session
struct FoldState {
    session: Session,
    creator: PeerId,
    members: BTreeMap<PeerId, Participant>,
    finished: BTreeSet<PeerId>,
    contested: bool,
}

impl FoldState {
    fn new(session: Session, creator: Participant) -> Self {
        let mut state = Self {
            session,
            creator: creator.peer_id.clone(),
            members: BTreeMap::new(),
            finished: BTreeSet::new(),
            contested: false,
        };
        state.admit(creator.peer_id, creator.joined_at);
        state
    }

    /// Insert-or-no-op; admin and finished are derived, never taken from input
    fn admit(&mut self, peer_id: PeerId, joined_at: i64) {
        let is_admin = peer_id == self.creator;
        let finished = self.finished.contains(&peer_id);
        self.members.entry(peer_id.clone()).or_insert(Participant {
            peer_id,
            joined_at,
            is_admin,
            finished,
        });
    }

    fn apply(&mut self, record: MembershipRecord, stats: &mut RefreshStats) {
        match record {
            MembershipRecord::Create { creator, .. } => {
                if creator.peer_id != self.creator {
                    stats.collisions += 1;
                    self.contested = true;
                    warn!(
                        session = %self.session.id.short(),
                        title = %self.session.title,
                        peer = %creator.peer_id.short(),
                        "second creator for session id, folding in as participant"
                    );
                }
                self.admit(creator.peer_id, creator.joined_at);
            }
            MembershipRecord::Join { participant, .. } => {
                self.admit(participant.peer_id, participant.joined_at);
            }
            MembershipRecord::Leave { peer_id, .. } => {
                self.members.remove(&peer_id);
            }
            MembershipRecord::Finish { peer_id, .. } => {
                if let Some(p) = self.members.get_mut(&peer_id) {
                    p.finished = true;
                    self.finished.insert(peer_id);
                }
            }
        }
    }

    fn finish(self) -> MaterializedSession {
        MaterializedSession {
            session: self.session,
            creator: self.creator,
            participants: self.members.into_values().collect(),
            contested: self.contested,
        }
    }
}

/// Fold an unordered record set into materialized sessions
pub fn fold(records: impl IntoIterator<Item = MembershipRecord>) -> DirectorySnapshot {
    let mut groups: BTreeMap<SessionId, Vec<MembershipRecord>> = BTreeMap::new();
    let mut decoded = 0;
    for record in records {
        decoded += 1;
        groups.entry(record.session_id().clone()).or_default().push(record);
    }

    let mut stats = RefreshStats {
        decoded,
        ..Default::default()
    };
    let mut sessions = BTreeMap::new();

    for (id, mut group) in groups {
        group.sort_by_cached_key(fold_key);

        let Some(base) = group.iter().position(|r| matches!(r, MembershipRecord::Create { .. })) else {
            stats.orphaned += group.len();
            debug!(session = %id.short(), records = group.len(), "orphaned records, no create reachable");
            continue;
        };

        let mut state = match group.remove(base) {
            MembershipRecord::Create { session, creator, .. } => FoldState::new(session, creator),
            _ => unreachable!("position matched a create record"),
        };
        for record in group {
            state.apply(record, &mut stats);
        }
        sessions.insert(id, state.finish());
    }

    DirectorySnapshot { sessions, stats }
}
