//! # folio-core
//!
//! Document model for a collaborative rich-text editor.
//!
//! ```text
//!   Document (arena tree)
//!     ├── node      node kinds, marks, tracked-change metadata
//!     ├── tree      structural ops, transactions, JSON snapshots
//!     ├── inline    plain-text offsets and text editing primitives
//!     ├── track     review mode: tracked insert/delete, accept/reject
//!     ├── comments  anchored comment threads
//!     ├── mentions  @-query detection and mention insertion
//!     └── export    plain text / snapshot / markup renderings
//!
//!   ReplicatedDocument (yrs)  merges remote updates, local-only undo
//! ```
//!
//! The tree is single-threaded and synchronous. Networking, presence and
//! persistence live in `folio-collab`.

pub mod comments;
pub mod error;
pub mod export;
pub mod inline;
pub mod mentions;
pub mod node;
pub mod replica;
pub mod track;
pub mod tree;

pub use comments::{Comment, CommentAuthor, CommentDraft, CommentRecord, CommentThreads, Reply};
pub use error::{CommentError, DocResult, DocumentError, MentionError, ReplicaError};
pub use export::{export, ExportFormat};
pub use inline::{BlockSpan, LeafSpan, PlainSplice};
pub use mentions::{MentionCandidate, MentionQuery, MentionState};
pub use node::{ChangeKind, ChangeMeta, ElementKind, Marks, Node, NodeId, NodeKind};
pub use replica::{ReplicatedDocument, SnapshotSchedule, CONTENT_FIELD, STRUCTURE_FIELD};
pub use track::{Author, PendingChange, ReviewMode, TrackChanges, TrackChangesConfig};
pub use tree::{Document, SnapshotNode, TreeSnapshot};

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the Unix epoch, as stored in change metadata.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
