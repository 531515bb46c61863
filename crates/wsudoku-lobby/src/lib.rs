//! wsudoku-lobby: serverless session directory for multiplayer sudoku
//!
//! Peers announce sessions and membership changes as immutable
//! [`MembershipRecord`]s on a shared pubsub topic. Any peer rebuilds the
//! directory by querying the store's history and folding every record in
//! timestamp order. No peer is authoritative.
//!
//! ## flow
//!
//! ```text
//! Announcer ──publish──► store ◄──query── Directory ──fold──► snapshot ──► UI
//!                                                               │
//! JoinCoordinator ◄────────────── confirm / time out ───────────┘
//! ```
//!
//! [`LobbyRuntime`] funnels connectivity events, user commands and network
//! completions through one task that owns all mutable lobby state.

pub mod announcer;
pub mod config;
pub mod directory;
pub mod error;
pub mod identity;
pub mod join;
pub mod peer_log;
pub mod record;
pub mod service;

pub use announcer::Announcer;
pub use config::{BackoffPolicy, ConfigError, LobbyConfig};
pub use directory::{
    fold, refresh_with_backoff, Directory, DirectorySnapshot, DirectoryStatus,
    MaterializedSession, RefreshStats,
};
pub use error::{DirectoryError, LobbyError, Result};
pub use identity::{derive_id, generate_title, InvalidSessionId, SessionId};
pub use join::{JoinAttempt, JoinCoordinator, JoinState, JoinTransition};
pub use peer_log::PeerLog;
pub use record::{DecodeError, MembershipRecord, Participant, RecordKind, Session};
pub use service::{Command, Lobby, LobbyHandle, LobbyRuntime, LobbyView};
