//! Anchored comment threads.
//!
//! A comment owns a `CommentAnchor` wrapper in the tree around the exact text
//! it was created on. The thread record (body, replies, resolved flag) lives
//! here; the anchor lives in the document. Deleting a comment unwraps its
//! anchor in place, leaving the text where it was.

use std::time::{Duration, Instant};

use log::debug;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CommentError;
use crate::node::{NodeId, NodeKind};
use crate::tree::Document;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentAuthor {
    pub id: Uuid,
    pub name: String,
    pub avatar_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub id: Uuid,
    pub comment_id: Uuid,
    pub author_id: Uuid,
    pub author_name: String,
    pub body: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub id: Uuid,
    pub document_id: Uuid,
    pub author_id: Uuid,
    pub author_name: String,
    pub avatar_ref: Option<String>,
    pub body: String,
    pub created_at: u64,
    /// Anchor node created with the comment. Later splits may add sibling anchors with the same id.
    pub anchor: NodeId,
    pub resolved: bool,
    pub replies: Vec<Reply>,
}

/// A selection captured for a comment that has not been confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentDraft {
    pub from: usize,
    pub to: usize,
    pub quote: String,
}

/// Row shape of the durable comment store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentRecord {
    pub id: Uuid,
    pub letter_id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    pub text_position: usize,
    pub text_length: usize,
    pub resolved: bool,
    pub created_at: u64,
}

impl CommentRecord {
    pub fn from_draft(
        id: Uuid,
        document_id: Uuid,
        author: &CommentAuthor,
        draft: &CommentDraft,
        body: &str,
        created_at: u64,
    ) -> Self {
        Self {
            id,
            letter_id: document_id,
            user_id: author.id,
            content: body.trim().to_string(),
            text_position: draft.from,
            text_length: draft.to - draft.from,
            resolved: false,
            created_at,
        }
    }
}

/// Every comment thread of one document.
#[derive(Debug)]
pub struct CommentThreads {
    document_id: Uuid,
    comments: Vec<Comment>,
    highlight: Option<(Uuid, Instant)>,
    highlight_duration: Duration,
}

impl CommentThreads {
    pub fn new(document_id: Uuid) -> Self {
        Self::with_highlight_duration(document_id, Duration::from_secs(3))
    }

    pub fn with_highlight_duration(document_id: Uuid, highlight_duration: Duration) -> Self {
        Self {
            document_id,
            comments: Vec::new(),
            highlight: None,
            highlight_duration,
        }
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn comments(&self) -> &[Comment] {
        &self.comments
    }

    pub fn get(&self, id: Uuid) -> Option<&Comment> {
        self.comments.iter().find(|c| c.id == id)
    }

    pub fn len(&self) -> usize {
        self.comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }

    fn get_mut(&mut self, id: Uuid) -> Result<&mut Comment, CommentError> {
        self.comments
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(CommentError::UnknownComment(id))
    }

    // ─── Creation ──────────────────────────────────────────────

    /// Captures the selection `[from, to)` and its quoted text.
    pub fn begin(&self, doc: &Document, from: usize, to: usize) -> Result<CommentDraft, CommentError> {
        let (from, to) = (from.min(to), from.max(to));
        if from == to {
            return Err(CommentError::CollapsedSelection);
        }
        if doc.block_containing(from, to).is_none() {
            return Err(CommentError::SpansBlocks);
        }
        Ok(CommentDraft {
            from,
            to,
            quote: doc.text_range(from, to),
        })
    }

    /// Wraps the drafted range in an anchor and records the thread.
    pub fn confirm(
        &mut self,
        doc: &mut Document,
        draft: &CommentDraft,
        id: Uuid,
        body: &str,
        author: &CommentAuthor,
        now: u64,
    ) -> Result<&Comment, CommentError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(CommentError::EmptyBody);
        }
        let anchor = doc.update(|d| {
            let (block, range) = d.isolate_range(draft.from, draft.to)?;
            d.wrap_children(block, range, NodeKind::CommentAnchor { comment_id: id })
        })?;
        debug!(
            "comment {id} anchored on {anchor} over [{}, {})",
            draft.from, draft.to
        );
        self.comments.push(Comment {
            id,
            document_id: self.document_id,
            author_id: author.id,
            author_name: author.name.clone(),
            avatar_ref: author.avatar_ref.clone(),
            body: body.to_string(),
            created_at: now,
            anchor,
            resolved: false,
            replies: Vec::new(),
        });
        let last = self.comments.len() - 1;
        Ok(&self.comments[last])
    }

    /// Registers a thread loaded from the comment store.
    ///
    /// A tree restored with its structure already holds the anchor; otherwise
    /// the recorded range is wrapped again.
    pub fn restore(
        &mut self,
        doc: &mut Document,
        record: &CommentRecord,
        author: &CommentAuthor,
    ) -> Result<&Comment, CommentError> {
        if let Some(position) = self.comments.iter().position(|c| c.id == record.id) {
            return Ok(&self.comments[position]);
        }
        let anchor = match anchors_of(doc, record.id).first() {
            Some(anchor) => *anchor,
            None => {
                let from = record.text_position;
                let draft = self.begin(doc, from, from + record.text_length)?;
                self.confirm(doc, &draft, record.id, &record.content, author, record.created_at)?;
                if record.resolved {
                    self.resolve(record.id)?;
                }
                let last = self.comments.len() - 1;
                return Ok(&self.comments[last]);
            }
        };
        self.comments.push(Comment {
            id: record.id,
            document_id: self.document_id,
            author_id: author.id,
            author_name: author.name.clone(),
            avatar_ref: author.avatar_ref.clone(),
            body: record.content.clone(),
            created_at: record.created_at,
            anchor,
            resolved: record.resolved,
            replies: Vec::new(),
        });
        let last = self.comments.len() - 1;
        Ok(&self.comments[last])
    }

    // ─── Lifecycle ─────────────────────────────────────────────

    pub fn resolve(&mut self, id: Uuid) -> Result<(), CommentError> {
        self.get_mut(id)?.resolved = true;
        Ok(())
    }

    pub fn reopen(&mut self, id: Uuid) -> Result<(), CommentError> {
        self.get_mut(id)?.resolved = false;
        Ok(())
    }

    /// Removes the thread and unwraps its anchor back into the parent.
    pub fn delete(&mut self, doc: &mut Document, id: Uuid) -> Result<Comment, CommentError> {
        let position = self
            .comments
            .iter()
            .position(|c| c.id == id)
            .ok_or(CommentError::UnknownComment(id))?;
        let anchors = anchors_of(doc, id);
        doc.update(|d| {
            for anchor in &anchors {
                d.unwrap(*anchor)?;
            }
            d.normalize();
            Ok(())
        })?;
        if matches!(self.highlight, Some((h, _)) if h == id) {
            self.highlight = None;
        }
        Ok(self.comments.remove(position))
    }

    /// Appends a reply. Threads are one level deep.
    pub fn reply(
        &mut self,
        id: Uuid,
        author: &CommentAuthor,
        body: &str,
        now: u64,
    ) -> Result<&Reply, CommentError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(CommentError::EmptyBody);
        }
        let comment = self.get_mut(id)?;
        comment.replies.push(Reply {
            id: Uuid::new_v4(),
            comment_id: id,
            author_id: author.id,
            author_name: author.name.clone(),
            body: body.to_string(),
            created_at: now,
        });
        let last = comment.replies.len() - 1;
        Ok(&comment.replies[last])
    }

    /// Re-attaches a reply loaded from the comment store, keeping its id.
    pub fn restore_reply(&mut self, reply: Reply) -> Result<(), CommentError> {
        let comment = self.get_mut(reply.comment_id)?;
        if comment.replies.iter().all(|r| r.id != reply.id) {
            comment.replies.push(reply);
            comment.replies.sort_by_key(|r| r.created_at);
        }
        Ok(())
    }

    // ─── Linking ───────────────────────────────────────────────

    /// The comment whose anchored text holds the character at `offset`.
    pub fn comment_at(&self, doc: &Document, offset: usize) -> Option<Uuid> {
        let leaf = doc
            .leaves()
            .into_iter()
            .find(|l| l.start <= offset && offset < l.end())?;
        doc.ancestors(leaf.id).into_iter().find_map(|a| match doc.kind(a) {
            Some(NodeKind::CommentAnchor { comment_id }) if self.get(*comment_id).is_some() => {
                Some(*comment_id)
            }
            _ => None,
        })
    }

    /// Highlights a thread until the highlight duration elapses.
    pub fn focus(&mut self, id: Uuid, now: Instant) -> Result<(), CommentError> {
        if self.get(id).is_none() {
            return Err(CommentError::UnknownComment(id));
        }
        self.highlight = Some((id, now));
        Ok(())
    }

    /// The highlighted thread at `now`, clearing it once expired.
    pub fn highlighted(&mut self, now: Instant) -> Option<Uuid> {
        match self.highlight {
            Some((id, since)) if now.saturating_duration_since(since) < self.highlight_duration => {
                Some(id)
            }
            Some(_) => {
                self.highlight = None;
                None
            }
            None => None,
        }
    }

    /// Threads whose anchor no longer exists in `doc`.
    pub fn orphans(&self, doc: &Document) -> Vec<Uuid> {
        self.comments
            .iter()
            .filter(|c| anchors_of(doc, c.id).is_empty())
            .map(|c| c.id)
            .collect()
    }

    /// Offset range covered by the thread's anchors.
    pub fn anchor_range(&self, doc: &Document, id: Uuid) -> Option<(usize, usize)> {
        anchors_of(doc, id)
            .into_iter()
            .filter_map(|a| doc.span_of(a))
            .fold(None, |acc, (start, len)| match acc {
                None => Some((start, start + len)),
                Some((s, e)) => Some((s.min(start), e.max(start + len))),
            })
    }

    /// Durable-store projection of a thread at its current position.
    pub fn record(&self, doc: &Document, id: Uuid) -> Option<CommentRecord> {
        let comment = self.get(id)?;
        let (start, end) = self.anchor_range(doc, id).unwrap_or((0, 0));
        Some(CommentRecord {
            id,
            letter_id: comment.document_id,
            user_id: comment.author_id,
            content: comment.body.clone(),
            text_position: start,
            text_length: end - start,
            resolved: comment.resolved,
            created_at: comment.created_at,
        })
    }
}

/// Anchor nodes carrying `comment_id`, in document order.
pub fn anchors_of(doc: &Document, comment_id: Uuid) -> Vec<NodeId> {
    doc.pre_order()
        .into_iter()
        .filter(|id| {
            matches!(
                doc.kind(*id),
                Some(NodeKind::CommentAnchor { comment_id: c }) if *c == comment_id
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author() -> CommentAuthor {
        CommentAuthor {
            id: Uuid::from_u128(7),
            name: "Carol".into(),
            avatar_ref: Some("avatars/carol.png".into()),
        }
    }

    fn commented(text: &str, from: usize, to: usize) -> (Document, CommentThreads, Uuid) {
        let mut doc = Document::from_plain_text(text);
        let mut threads = CommentThreads::new(Uuid::from_u128(100));
        let draft = threads.begin(&doc, from, to).unwrap();
        let id = Uuid::new_v4();
        threads
            .confirm(&mut doc, &draft, id, "Please check", &author(), 42)
            .unwrap();
        (doc, threads, id)
    }

    #[test]
    fn test_begin_requires_selection_in_one_block() {
        let doc = Document::from_plain_text("ab\ncd");
        let threads = CommentThreads::new(Uuid::nil());
        assert_eq!(
            threads.begin(&doc, 1, 1),
            Err(CommentError::CollapsedSelection)
        );
        assert_eq!(threads.begin(&doc, 1, 4), Err(CommentError::SpansBlocks));
        assert_eq!(threads.begin(&doc, 3, 5).unwrap().quote, "cd");
    }

    #[test]
    fn test_restore_reuses_anchor_in_tree() {
        let (doc, threads, id) = commented("Hello World", 6, 11);
        let record = threads.record(&doc, id).unwrap();
        let mut doc = Document::from_json(&doc.to_json().unwrap()).unwrap();

        let mut restored = CommentThreads::new(Uuid::from_u128(100));
        restored.restore(&mut doc, &record, &author()).unwrap();
        assert_eq!(anchors_of(&doc, id).len(), 1);
        assert_eq!(restored.anchor_range(&doc, id), Some((6, 11)));
        assert_eq!(restored.get(id).unwrap().body, "Please check");
    }

    #[test]
    fn test_restore_wraps_recorded_range_in_plain_tree() {
        let (doc, mut threads, id) = commented("Hello World", 0, 5);
        threads.resolve(id).unwrap();
        let record = threads.record(&doc, id).unwrap();
        let mut plain = Document::from_plain_text("Hello World");

        let mut restored = CommentThreads::new(Uuid::from_u128(100));
        restored.restore(&mut plain, &record, &author()).unwrap();
        restored.restore(&mut plain, &record, &author()).unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(anchors_of(&plain, id).len(), 1);
        assert_eq!(restored.anchor_range(&plain, id), Some((0, 5)));
        assert!(restored.get(id).unwrap().resolved);
    }

    #[test]
    fn test_confirm_wraps_exact_range() {
        let (doc, threads, id) = commented("Hello World", 6, 11);
        let comment = threads.get(id).unwrap();
        assert_eq!(doc.text_of(comment.anchor), "World");
        assert_eq!(doc.plain_text(), "Hello World");
        assert_eq!(threads.anchor_range(&doc, id), Some((6, 11)));
        assert_eq!(comment.avatar_ref.as_deref(), Some("avatars/carol.png"));
    }

    #[test]
    fn test_confirm_rejects_empty_body() {
        let mut doc = Document::from_plain_text("Hello");
        let mut threads = CommentThreads::new(Uuid::nil());
        let draft = threads.begin(&doc, 0, 2).unwrap();
        let before = doc.clone();
        let err = threads
            .confirm(&mut doc, &draft, Uuid::new_v4(), "   ", &author(), 0)
            .unwrap_err();
        assert_eq!(err, CommentError::EmptyBody);
        assert_eq!(doc, before);
    }

    #[test]
    fn test_delete_unwraps_in_place() {
        let (mut doc, mut threads, id) = commented("Hello World", 6, 11);
        assert_eq!(anchors_of(&doc, id).len(), 1);
        let removed = threads.delete(&mut doc, id).unwrap();
        assert_eq!(removed.id, id);
        assert!(anchors_of(&doc, id).is_empty());
        assert_eq!(doc.plain_text(), "Hello World");
        assert!(threads.is_empty());
        assert_eq!(
            threads.delete(&mut doc, id),
            Err(CommentError::UnknownComment(id))
        );
    }

    #[test]
    fn test_resolve_keeps_anchor() {
        let (doc, mut threads, id) = commented("Hello World", 0, 5);
        threads.resolve(id).unwrap();
        assert!(threads.get(id).unwrap().resolved);
        assert_eq!(anchors_of(&doc, id).len(), 1);
        threads.reopen(id).unwrap();
        assert!(!threads.get(id).unwrap().resolved);
    }

    #[test]
    fn test_replies_are_single_level() {
        let (_doc, mut threads, id) = commented("Hello World", 0, 5);
        let reply = threads.reply(id, &author(), "Done", 50).unwrap();
        assert_eq!(reply.comment_id, id);
        assert_eq!(threads.get(id).unwrap().replies.len(), 1);
        let missing = Uuid::new_v4();
        assert!(threads.reply(missing, &author(), "x", 0).is_err());
    }

    #[test]
    fn test_restored_replies_keep_ids_and_order() {
        let (_doc, mut threads, id) = commented("Hello World", 0, 5);
        let reply = |n: u128, at: u64| Reply {
            id: Uuid::from_u128(n),
            comment_id: id,
            author_id: Uuid::nil(),
            author_name: "Dan".into(),
            body: format!("r{n}"),
            created_at: at,
        };
        threads.restore_reply(reply(2, 20)).unwrap();
        threads.restore_reply(reply(1, 10)).unwrap();
        threads.restore_reply(reply(1, 10)).unwrap();
        let ids: Vec<Uuid> = threads.get(id).unwrap().replies.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![Uuid::from_u128(1), Uuid::from_u128(2)]);
    }

    #[test]
    fn test_comment_at_and_highlight_expiry() {
        let (doc, mut threads, id) = commented("Hello World", 6, 11);
        assert_eq!(threads.comment_at(&doc, 7), Some(id));
        assert_eq!(threads.comment_at(&doc, 2), None);

        let t0 = Instant::now();
        threads.focus(id, t0).unwrap();
        assert_eq!(threads.highlighted(t0 + Duration::from_secs(1)), Some(id));
        assert_eq!(threads.highlighted(t0 + Duration::from_secs(3)), None);
        assert_eq!(threads.highlighted(t0), None);
    }

    #[test]
    fn test_record_projection() {
        let (doc, mut threads, id) = commented("Hello World", 6, 11);
        threads.resolve(id).unwrap();
        let record = threads.record(&doc, id).unwrap();
        assert_eq!(record.letter_id, Uuid::from_u128(100));
        assert_eq!(record.user_id, author().id);
        assert_eq!(record.text_position, 6);
        assert_eq!(record.text_length, 5);
        assert!(record.resolved);
        assert_eq!(record.content, "Please check");
    }

    #[test]
    fn test_orphan_after_anchor_removed() {
        let (mut doc, threads, id) = commented("Hello World", 6, 11);
        let anchor = threads.get(id).unwrap().anchor;
        doc.remove(anchor).unwrap();
        assert_eq!(threads.orphans(&doc), vec![id]);
    }
}
