//! JoinCoordinator - optimistic join with confirmation from the directory
//!
//! Publishing a join and seeing it in the store are two independent,
//! eventually-consistent operations, so every attempt walks:
//!
//! ```text
//! Requested ──publish──► Published ──refresh lists us──► Confirmed
//!     ▲                      │
//!     └──── retry ──── TimedOut (confirm window elapsed)
//! ```

use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use wsudoku_p2p::{PeerId, Receipt};

use crate::announcer::Announcer;
use crate::directory::DirectorySnapshot;
use crate::error::{LobbyError, Result};
use crate::identity::SessionId;
use crate::record::{MembershipRecord, Participant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinState {
    /// Intent captured locally, nothing sent
    Requested,
    /// Join record handed to the network, awaiting a confirming refresh
    Published { at: Instant, receipt: Receipt },
    /// A refresh listed the local peer in the session
    Confirmed,
    /// No confirming refresh within the window
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAttempt {
    pub session_id: SessionId,
    pub state: JoinState,
    /// Number of publishes so far
    pub publishes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinTransition {
    Confirmed(SessionId),
    TimedOut(SessionId),
}

pub struct JoinCoordinator {
    local: PeerId,
    confirm_timeout: Duration,
    attempts: BTreeMap<SessionId, JoinAttempt>,
}

impl JoinCoordinator {
    pub fn new(local: PeerId, confirm_timeout: Duration) -> Self {
        Self {
            local,
            confirm_timeout,
            attempts: BTreeMap::new(),
        }
    }

    pub fn confirm_timeout(&self) -> Duration {
        self.confirm_timeout
    }

    pub fn state(&self, session_id: &SessionId) -> Option<&JoinState> {
        self.attempts.get(session_id).map(|a| &a.state)
    }

    pub fn attempts(&self) -> impl Iterator<Item = &JoinAttempt> {
        self.attempts.values()
    }

    /// Capture a join intent
    pub fn request(&mut self, session_id: &SessionId) -> Result<()> {
        match self.attempts.get(session_id).map(|a| &a.state) {
            Some(JoinState::Published { .. }) => Err(LobbyError::JoinInProgress(session_id.clone())),
            Some(JoinState::Confirmed) => Err(LobbyError::AlreadyJoined(session_id.clone())),
            Some(JoinState::Requested) => Ok(()),
            Some(JoinState::TimedOut) | None => {
                let publishes = self.attempts.get(session_id).map_or(0, |a| a.publishes);
                self.attempts.insert(
                    session_id.clone(),
                    JoinAttempt {
                        session_id: session_id.clone(),
                        state: JoinState::Requested,
                        publishes,
                    },
                );
                debug!(session = %session_id.short(), "join requested");
                Ok(())
            }
        }
    }

    /// Build the join record for a requested attempt
    pub fn prepare(&self, session_id: &SessionId, announcer: &Announcer) -> Result<MembershipRecord> {
        match self.attempts.get(session_id).map(|a| &a.state) {
            Some(JoinState::Requested) => {
                Ok(announcer.announce_join(session_id, Participant::new(self.local.clone(), 0)))
            }
            Some(JoinState::Published { .. }) => Err(LobbyError::JoinInProgress(session_id.clone())),
            Some(JoinState::Confirmed) => Err(LobbyError::AlreadyJoined(session_id.clone())),
            Some(JoinState::TimedOut) | None => Err(LobbyError::NoJoinAttempt(session_id.clone())),
        }
    }

    /// Record that the join record reached the network
    pub fn mark_published(&mut self, session_id: &SessionId, receipt: Receipt, now: Instant) -> Result<()> {
        let attempt = self
            .attempts
            .get_mut(session_id)
            .ok_or_else(|| LobbyError::NoJoinAttempt(session_id.clone()))?;
        if attempt.state != JoinState::Requested {
            return Err(LobbyError::JoinInProgress(session_id.clone()));
        }
        attempt.state = JoinState::Published { at: now, receipt };
        attempt.publishes += 1;
        info!(session = %session_id.short(), seq = receipt.seq, "join published, awaiting confirmation");
        Ok(())
    }

    /// Publish the join record for a requested attempt; on failure the
    /// attempt stays `Requested`
    pub async fn publish(&mut self, session_id: &SessionId, announcer: &Announcer, now: Instant) -> Result<Receipt> {
        let record = self.prepare(session_id, announcer)?;
        let receipt = announcer.publish(&record).await?;
        self.mark_published(session_id, receipt, now)?;
        Ok(receipt)
    }

    /// Confirm attempts the snapshot shows us in, then expire stale ones
    pub fn observe(&mut self, snapshot: &DirectorySnapshot, now: Instant) -> Vec<JoinTransition> {
        let mut transitions = Vec::new();
        for attempt in self.attempts.values_mut() {
            if !matches!(attempt.state, JoinState::Published { .. }) {
                continue;
            }
            let listed = snapshot
                .get(&attempt.session_id)
                .map_or(false, |s| s.contains(&self.local));
            if listed {
                attempt.state = JoinState::Confirmed;
                info!(session = %attempt.session_id.short(), "join confirmed");
                transitions.push(JoinTransition::Confirmed(attempt.session_id.clone()));
            }
        }
        transitions.extend(self.expire(now));
        transitions
    }

    /// Time out published attempts older than the confirm window
    pub fn expire(&mut self, now: Instant) -> Vec<JoinTransition> {
        let mut transitions = Vec::new();
        for attempt in self.attempts.values_mut() {
            if let JoinState::Published { at, .. } = attempt.state {
                if now.saturating_duration_since(at) >= self.confirm_timeout {
                    attempt.state = JoinState::TimedOut;
                    warn!(session = %attempt.session_id.short(), "join not confirmed in time");
                    transitions.push(JoinTransition::TimedOut(attempt.session_id.clone()));
                }
            }
        }
        transitions
    }

    /// Re-enter `Requested` after a timeout
    pub fn retry(&mut self, session_id: &SessionId) -> Result<()> {
        match self.attempts.get(session_id).map(|a| &a.state) {
            Some(JoinState::TimedOut) | Some(JoinState::Requested) => self.request(session_id),
            Some(JoinState::Published { .. }) => Err(LobbyError::JoinInProgress(session_id.clone())),
            Some(JoinState::Confirmed) => Err(LobbyError::AlreadyJoined(session_id.clone())),
            None => Err(LobbyError::NoJoinAttempt(session_id.clone())),
        }
    }

    /// Forget an attempt
    pub fn abandon(&mut self, session_id: &SessionId) -> Option<JoinAttempt> {
        self.attempts.remove(session_id)
    }
}
