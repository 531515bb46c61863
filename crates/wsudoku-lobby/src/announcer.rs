//! Announcer - builds session-lifecycle records and hands them to the network
//!
//! Builders are pure apart from reading the clock and the peer count; the
//! write itself goes through [`Transport::publish`]. Nothing here retries.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use wsudoku_p2p::{ContentTopic, PeerId, PubsubTopic, Receipt, Transport};

use crate::config::LobbyConfig;
use crate::error::{LobbyError, Result};
use crate::identity::{derive_id, SessionId};
use crate::record::{MembershipRecord, Participant, Session};

/// Strictly increasing local clock in unix micros
#[derive(Debug, Default)]
struct LocalClock {
    last: AtomicI64,
}

impl LocalClock {
    fn now(&self) -> i64 {
        let wall = chrono::Utc::now().timestamp_micros();
        let mut current = self.last.load(Ordering::SeqCst);
        loop {
            let next = wall.max(current + 1);
            match self
                .last
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

pub struct Announcer {
    transport: Arc<dyn Transport>,
    topic: PubsubTopic,
    classifier: ContentTopic,
    clock: LocalClock,
}

impl Announcer {
    pub fn new(transport: Arc<dyn Transport>, config: &LobbyConfig) -> Self {
        Self {
            transport,
            topic: config.pubsub_topic(),
            classifier: config.lobby_topic(),
            clock: LocalClock::default(),
        }
    }

    /// Build the `Create` record for a new session, with the creator as admin
    pub fn create_session(&self, title: &str, creator: &PeerId, puzzle_blob: Vec<u8>) -> Result<MembershipRecord> {
        let id = derive_id(title)?;
        if self.transport.peer_count() == 0 {
            return Err(LobbyError::NoPeersAvailable);
        }
        let at = self.clock.now();
        Ok(MembershipRecord::Create {
            session: Session {
                id,
                title: title.to_string(),
                puzzle_blob,
                created_at: at,
            },
            creator: Participant {
                peer_id: creator.clone(),
                joined_at: at,
                is_admin: true,
                finished: false,
            },
            at,
        })
    }

    /// Build a `Join` record; admin is never granted through a join
    pub fn announce_join(&self, session_id: &SessionId, mut participant: Participant) -> MembershipRecord {
        let at = self.clock.now();
        if participant.joined_at == 0 {
            participant.joined_at = at;
        }
        participant.is_admin = false;
        participant.finished = false;
        MembershipRecord::Join {
            session_id: session_id.clone(),
            participant,
            at,
        }
    }

    pub fn announce_leave(&self, session_id: &SessionId, peer_id: &PeerId) -> MembershipRecord {
        MembershipRecord::Leave {
            session_id: session_id.clone(),
            peer_id: peer_id.clone(),
            at: self.clock.now(),
        }
    }

    pub fn announce_finish(&self, session_id: &SessionId, peer_id: &PeerId) -> MembershipRecord {
        MembershipRecord::Finish {
            session_id: session_id.clone(),
            peer_id: peer_id.clone(),
            at: self.clock.now(),
        }
    }

    /// Encode and publish under the lobby classifier
    pub async fn publish(&self, record: &MembershipRecord) -> Result<Receipt> {
        if self.transport.peer_count() == 0 {
            return Err(LobbyError::NoPeersAvailable);
        }
        let payload = record.encode().map_err(|e| LobbyError::Encode(e.to_string()))?;
        debug!(
            kind = ?record.kind(),
            session = %record.session_id().short(),
            bytes = payload.len(),
            "publishing lobby record"
        );
        let receipt = self
            .transport
            .publish(&self.topic, &self.classifier, payload)
            .await
            .map_err(LobbyError::PublishFailed)?;
        info!(
            kind = ?record.kind(),
            session = %record.session_id().short(),
            peer = %record.peer_id().short(),
            "published lobby record"
        );
        Ok(receipt)
    }
}
