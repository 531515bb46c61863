//! Publish/subscribe networking seams for wsudoku peers
//!
//! The lobby never talks to a concrete network stack. It consumes the
//! [`Transport`] trait (publish, history query, peer count) and a stream of
//! [`ConnectivityEvent`]s. [`MemoryHub`] is an in-process implementation with
//! a shared append-only store, used by tests and the local simulator.
//!
//! ## Addressing
//!
//! ```text
//!   pubsub topic        /waku/2/wsudoku/
//!   ├── classifier      /wsudoku/1/games/proto        (session lifecycle)
//!   └── classifier      /wsudoku/1/multiplayer/proto  (gameplay)
//! ```

pub mod memory;
pub mod transport;
pub mod types;

pub use memory::{MemoryHub, MemoryTransport};
pub use transport::{NetworkError, Transport};
pub use types::{ConnectivityEvent, ContentTopic, PeerId, PubsubTopic, Receipt, StoredMessage};

/// Shared network-wide pubsub topic
pub const PUBSUB_TOPIC: &str = "/waku/2/wsudoku/";

/// Classifier for session-lifecycle records
pub const LOBBY_CONTENT_TOPIC: &str = "/wsudoku/1/games/proto";

/// Classifier for in-session gameplay traffic
pub const GAMEPLAY_CONTENT_TOPIC: &str = "/wsudoku/1/multiplayer/proto";
