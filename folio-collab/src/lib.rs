//! # folio-collab: multi-user layer around the folio document core
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   document-{id} topic   ┌───────────────┐
//! │ EditorSession │ ◄─────────────────────► │ EditorSession │
//! │ (user A)      │     BroadcastHub        │ (user B)      │
//! └──┬─────────┬──┘                         └───────────────┘
//!    │         │
//!    │         ▼
//!    │   ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//!    │   │DocumentChannel│ │ PresenceRoom │  │ ProfileCache │
//!    │   └──────────────┘  └──────────────┘  └──────────────┘
//!    ▼
//! ┌──────────────────────────────────────────────┐
//! │ DocumentStateStore / CommentStore / ErrorSink│
//! │ (MemoryStore or RocksStore)                  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: bincode frames and topic names
//! - [`broadcast`]: in-process topic hub with tracked presence
//! - [`channel`]: per-document connection state machine
//! - [`presence`]: remote participants, colors, cursors
//! - [`profiles`]: user directory and batched profile cache
//! - [`storage`]: durable collaborators (memory and RocksDB)
//! - [`session`]: the editing session tying it all together

pub mod broadcast;
pub mod channel;
pub mod presence;
pub mod profiles;
pub mod protocol;
pub mod session;
pub mod storage;

pub use broadcast::{BroadcastHub, ChannelError, TopicMembership, TopicStats};
pub use channel::{ChannelEvent, ConnectionState, DocumentChannel};
pub use presence::{color_for, PresenceRecord, PresenceRoom, PALETTE};
pub use profiles::{DirectoryError, MemoryDirectory, ProfileCache, UserDirectory, UserProfile};
pub use protocol::{
    document_topic, user_presence_topic, BroadcastEnvelope, BroadcastPayload, Frame,
    PresenceMeta, ProtocolError,
};
pub use session::{Collaborators, ContentSync, EditorSession, SessionConfig};
pub use storage::{
    CommentStore, DocumentMetadata, DocumentStateStore, ErrorSink, LogSink, MemorySink,
    MemoryStore, RocksStore, StoreConfig, StoreError,
};
