//! In-memory collaborators for tests and single-process use.
//!
//! [`MemoryStore`] keeps document state, comment rows and replies in tokio
//! locks and can be switched into a failing mode to exercise the fail-open
//! paths of a session. [`MemorySink`] records every reported message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use folio_core::{CommentRecord, Reply};

use super::{CommentStore, DocumentStateStore, ErrorSink, StoreError};

/// Both stores held in memory. `set_failing(true)` makes every call fail
/// with [`StoreError::Unavailable`].
#[derive(Default)]
pub struct MemoryStore {
    states: RwLock<HashMap<Uuid, Vec<u8>>>,
    comments: RwLock<Vec<CommentRecord>>,
    replies: RwLock<Vec<Reply>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::Acquire) {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }

    /// Raw state bytes, bypassing the failure switch.
    pub async fn raw_state(&self, document_id: Uuid) -> Option<Vec<u8>> {
        self.states.read().await.get(&document_id).cloned()
    }

    pub async fn put_raw_state(&self, document_id: Uuid, state: Vec<u8>) {
        self.states.write().await.insert(document_id, state);
    }
}

#[async_trait]
impl DocumentStateStore for MemoryStore {
    async fn load_state(&self, document_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        self.check()?;
        Ok(self.raw_state(document_id).await)
    }

    async fn save_state(&self, document_id: Uuid, state: &[u8]) -> Result<(), StoreError> {
        self.check()?;
        self.put_raw_state(document_id, state.to_vec()).await;
        Ok(())
    }
}

#[async_trait]
impl CommentStore for MemoryStore {
    async fn insert_comment(&self, record: &CommentRecord) -> Result<(), StoreError> {
        self.check()?;
        let mut comments = self.comments.write().await;
        comments.retain(|c| c.id != record.id);
        comments.push(record.clone());
        Ok(())
    }

    async fn set_resolved(&self, comment_id: Uuid, resolved: bool) -> Result<(), StoreError> {
        self.check()?;
        let mut comments = self.comments.write().await;
        let row = comments
            .iter_mut()
            .find(|c| c.id == comment_id)
            .ok_or(StoreError::NotFound(comment_id))?;
        row.resolved = resolved;
        Ok(())
    }

    async fn delete_comment(&self, comment_id: Uuid) -> Result<(), StoreError> {
        self.check()?;
        self.comments.write().await.retain(|c| c.id != comment_id);
        self.replies
            .write()
            .await
            .retain(|r| r.comment_id != comment_id);
        Ok(())
    }

    async fn append_reply(&self, reply: &Reply) -> Result<(), StoreError> {
        self.check()?;
        self.replies.write().await.push(reply.clone());
        Ok(())
    }

    async fn list_comments(&self, document_id: Uuid) -> Result<Vec<CommentRecord>, StoreError> {
        self.check()?;
        let comments = self.comments.read().await;
        let mut rows: Vec<CommentRecord> = comments
            .iter()
            .filter(|c| c.letter_id == document_id)
            .cloned()
            .collect();
        rows.sort_by_key(|c| c.created_at);
        Ok(rows)
    }

    async fn list_replies(&self, comment_id: Uuid) -> Result<Vec<Reply>, StoreError> {
        self.check()?;
        let replies = self.replies.read().await;
        let found = replies
            .iter()
            .filter(|r| r.comment_id == comment_id)
            .cloned()
            .collect();
        Ok(found)
    }
}

/// Sink that keeps every reported message.
#[derive(Debug, Default)]
pub struct MemorySink {
    messages: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        match self.messages.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ErrorSink for MemorySink {
    fn report(&self, message: &str) {
        match self.messages.lock() {
            Ok(mut guard) => guard.push(message.to_string()),
            Err(poisoned) => poisoned.into_inner().push(message.to_string()),
        }
    }
}
