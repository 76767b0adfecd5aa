//! Durable collaborators of an editing session.
//!
//! ```text
//! ┌───────────────┐  load/save state   ┌────────────────────┐
//! │ EditorSession │ ─────────────────► │ DocumentStateStore │
//! │               │  comment rows      ├────────────────────┤
//! │               │ ─────────────────► │ CommentStore       │
//! │               │  failures          ├────────────────────┤
//! │               │ ─────────────────► │ ErrorSink          │
//! └───────────────┘                    └────────────────────┘
//!                                        MemoryStore │ RocksStore
//! ```
//!
//! The session only sees the traits. A failing store never blocks local
//! editing; the session logs the error and hands it to the [`ErrorSink`].

pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use log::error;
use thiserror::Error;
use uuid::Uuid;

use folio_core::{CommentRecord, Reply};

pub use memory::{MemorySink, MemoryStore};
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("not found: {0}")]
    NotFound(Uuid),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("store unavailable")]
    Unavailable,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Opaque replicated state per document.
#[async_trait]
pub trait DocumentStateStore: Send + Sync {
    /// `None` when nothing was ever persisted for `document_id`.
    async fn load_state(&self, document_id: Uuid) -> Result<Option<Vec<u8>>, StoreError>;

    async fn save_state(&self, document_id: Uuid, state: &[u8]) -> Result<(), StoreError>;
}

/// Comment rows and their replies.
#[async_trait]
pub trait CommentStore: Send + Sync {
    async fn insert_comment(&self, record: &CommentRecord) -> Result<(), StoreError>;

    async fn set_resolved(&self, comment_id: Uuid, resolved: bool) -> Result<(), StoreError>;

    /// Removes the row and its replies.
    async fn delete_comment(&self, comment_id: Uuid) -> Result<(), StoreError>;

    async fn append_reply(&self, reply: &Reply) -> Result<(), StoreError>;

    /// Rows of one document, oldest first.
    async fn list_comments(&self, document_id: Uuid) -> Result<Vec<CommentRecord>, StoreError>;

    /// Replies of one comment in the order they were written.
    async fn list_replies(&self, comment_id: Uuid) -> Result<Vec<Reply>, StoreError>;
}

/// Where user-facing failures are reported (a toast in the editor).
pub trait ErrorSink: Send + Sync {
    fn report(&self, message: &str);
}

/// Sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ErrorSink for LogSink {
    fn report(&self, message: &str) {
        error!("{message}");
    }
}
