//! Track-changes engine.
//!
//! With review mode on, edits do not change content directly. They wrap it:
//!
//! ```text
//!   typing      ──▶  TrackedInsert { author, t } ─┬─ accept ─▶ unwrap
//!                                                  └─ reject ─▶ remove
//!   deleting    ──▶  TrackedDelete { author, t } ─┬─ accept ─▶ remove
//!                                                  └─ reject ─▶ unwrap
//! ```
//!
//! Consecutive edits by the same author inside the coalescing window extend
//! the adjacent wrapper instead of creating a new one. Content inside one's own
//! pending insertion is edited in place; content inside a pending deletion is
//! never edited.

use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DocResult, DocumentError};
use crate::inline::InsertPoint;
use crate::node::{ChangeKind, ChangeMeta, Marks, NodeId, NodeKind};
use crate::tree::Document;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReviewMode {
    #[default]
    Off,
    Review,
}

/// The local user as seen by the change-tracking engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: Uuid,
    pub name: String,
}

impl Author {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackChangesConfig {
    /// Same-author edits closer together than this extend the previous wrapper.
    pub coalesce_window: Duration,
}

impl Default for TrackChangesConfig {
    fn default() -> Self {
        Self {
            coalesce_window: Duration::from_millis(2000),
        }
    }
}

/// A pending tracked change as listed in a review pane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    pub node: NodeId,
    pub kind: ChangeKind,
    pub author_id: Uuid,
    pub author_name: String,
    /// When the change was last extended by its author.
    pub timestamp: u64,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    AlreadyDeleted,
    OwnInsertion,
    Wrap,
}

#[derive(Debug, Clone)]
pub struct TrackChanges {
    mode: ReviewMode,
    author: Author,
    config: TrackChangesConfig,
}

fn nearest_tracked(doc: &Document, id: NodeId) -> Option<(NodeId, ChangeKind, &ChangeMeta)> {
    std::iter::once(id)
        .chain(doc.ancestors(id))
        .find_map(|n| {
            doc.kind(n)
                .and_then(NodeKind::change)
                .map(|(kind, meta)| (n, kind, meta))
        })
}

impl TrackChanges {
    pub fn new(author: Author) -> Self {
        Self::with_config(author, TrackChangesConfig::default())
    }

    pub fn with_config(author: Author, config: TrackChangesConfig) -> Self {
        Self {
            mode: ReviewMode::Off,
            author,
            config,
        }
    }

    pub fn mode(&self) -> ReviewMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ReviewMode) {
        debug!("review mode {:?} -> {:?}", self.mode, mode);
        self.mode = mode;
    }

    pub fn toggle(&mut self) -> ReviewMode {
        let next = match self.mode {
            ReviewMode::Off => ReviewMode::Review,
            ReviewMode::Review => ReviewMode::Off,
        };
        self.set_mode(next);
        next
    }

    pub fn author(&self) -> &Author {
        &self.author
    }

    fn meta(&self, now: u64) -> ChangeMeta {
        ChangeMeta {
            author_id: self.author.id,
            author_name: self.author.name.clone(),
            timestamp: now,
        }
    }

    fn coalesces(&self, doc: &Document, id: NodeId, want: ChangeKind, now: u64) -> bool {
        let window = self.config.coalesce_window.as_millis() as u64;
        match doc.kind(id).and_then(NodeKind::change) {
            Some((kind, meta)) => {
                kind == want
                    && meta.author_id == self.author.id
                    && now.saturating_sub(meta.timestamp) <= window
            }
            None => false,
        }
    }

    /// Moves the wrapper's timestamp to `now`. The continuity window is
    /// measured from the latest edit, so a timestamp reads "last extended".
    fn refresh(&self, doc: &mut Document, wrapper: NodeId, now: u64) -> DocResult<()> {
        match &mut doc.node_mut(wrapper)?.kind {
            NodeKind::TrackedInsert(meta) | NodeKind::TrackedDelete(meta) => {
                meta.timestamp = meta.timestamp.max(now);
            }
            _ => {}
        }
        Ok(())
    }

    fn is_own_insertion(&self, doc: &Document, id: NodeId) -> bool {
        matches!(
            nearest_tracked(doc, id),
            Some((_, ChangeKind::Insert, meta)) if meta.author_id == self.author.id
        )
    }

    fn is_foreign_insertion(&self, doc: &Document, id: NodeId) -> bool {
        matches!(
            nearest_tracked(doc, id),
            Some((_, ChangeKind::Insert, meta)) if meta.author_id != self.author.id
        )
    }

    fn disposition(&self, doc: &Document, leaf: NodeId) -> Disposition {
        if doc.outermost_delete(leaf).is_some() {
            Disposition::AlreadyDeleted
        } else if self.mode == ReviewMode::Off || self.is_own_insertion(doc, leaf) {
            Disposition::OwnInsertion
        } else {
            Disposition::Wrap
        }
    }

    // ─── Insertion ─────────────────────────────────────────────

    /// Inserts `text` at `at`. Returns the caret after the inserted text.
    pub fn insert_text(
        &self,
        doc: &mut Document,
        at: usize,
        text: &str,
        now: u64,
    ) -> DocResult<usize> {
        if self.mode == ReviewMode::Off {
            return doc.insert_text(at, text);
        }
        if text.is_empty() {
            return Ok(doc.snap_offset(at));
        }
        doc.update(|d| {
            let (_, point) = d.resolve_insert(at)?;
            let point = d.escape_delete(point)?;
            let container = match point {
                InsertPoint::InText { node, .. } => node,
                InsertPoint::Between { parent, .. } => parent,
            };
            if self.is_own_insertion(d, container) {
                let (leaf, after) = d.insert_at_point(point, text)?;
                let wrapper = nearest_tracked(d, leaf).map(|(w, _, _)| w);
                if let Some(wrapper) = wrapper {
                    self.refresh(d, wrapper, now)?;
                }
                return d.caret_in(leaf, after);
            }

            let marks = marks_at(d, point);
            let (mut parent, mut index) = boundary(d, point)?;
            while self.is_foreign_insertion(d, parent) {
                let grand = d
                    .parent(parent)
                    .ok_or_else(|| DocumentError::invariant(format!("{parent} has no parent")))?;
                index = d.split_wrapper(parent, index)?;
                parent = grand;
            }

            let siblings = d.children(parent).to_vec();
            if let Some(left) = index.checked_sub(1).and_then(|i| siblings.get(i).copied()) {
                if self.coalesces(d, left, ChangeKind::Insert, now) {
                    self.refresh(d, left, now)?;
                    return extend_wrapper(d, left, text, marks, true);
                }
            }
            if let Some(right) = siblings.get(index).copied() {
                if self.coalesces(d, right, ChangeKind::Insert, now) {
                    self.refresh(d, right, now)?;
                    return extend_wrapper(d, right, text, marks, false);
                }
            }

            let wrapper = d.create(NodeKind::TrackedInsert(self.meta(now)));
            d.insert_child(parent, index, wrapper)?;
            let leaf = d.create(NodeKind::marked_text(text, marks));
            d.insert_child(wrapper, 0, leaf)?;
            d.caret_in(leaf, text.chars().count())
        })
    }

    // ─── Deletion ──────────────────────────────────────────────

    /// Deletes `[from, to)`. Returns the collapsed caret.
    ///
    /// In review mode each block keeps its structure; only its content is marked.
    pub fn delete_range(
        &self,
        doc: &mut Document,
        from: usize,
        to: usize,
        now: u64,
    ) -> DocResult<usize> {
        let (from, to) = (from.min(to), from.max(to));
        if self.mode == ReviewMode::Off {
            return doc.remove_range(from, to);
        }
        if from == to {
            return Ok(doc.snap_offset(from));
        }
        doc.update(|d| {
            d.split_leaf_at(from)?;
            d.split_leaf_at(to)?;
            let touched: Vec<_> = d
                .leaves()
                .into_iter()
                .filter(|l| l.start < to && l.end() > from && l.len > 0)
                .collect();

            let mut groups: Vec<Vec<NodeId>> = Vec::new();
            let mut doomed = Vec::new();
            let mut previous: Option<NodeId> = None;
            for leaf in &touched {
                match self.disposition(d, leaf.id) {
                    Disposition::AlreadyDeleted => previous = None,
                    Disposition::OwnInsertion => {
                        doomed.push(leaf.id);
                        previous = None;
                    }
                    Disposition::Wrap => {
                        let adjacent = previous.is_some_and(|p| {
                            d.parent(p) == d.parent(leaf.id)
                                && d.index_in_parent(p).map(|i| i + 1)
                                    == d.index_in_parent(leaf.id)
                        });
                        match groups.last_mut() {
                            Some(group) if adjacent => group.push(leaf.id),
                            _ => groups.push(vec![leaf.id]),
                        }
                        previous = Some(leaf.id);
                    }
                }
            }

            let mut last_wrapper = None;
            for group in &groups {
                let (Some(first), Some(last)) = (group.first(), group.last()) else {
                    continue;
                };
                let parent = d
                    .parent(*first)
                    .ok_or_else(|| DocumentError::invariant(format!("{first} has no parent")))?;
                let start = d.index_in_parent(*first).unwrap_or(0);
                let end = d.index_in_parent(*last).unwrap_or(start) + 1;
                last_wrapper = Some(self.wrap_deleted(d, parent, start..end, now)?);
            }
            for id in &doomed {
                d.remove(*id)?;
            }

            let caret = match last_wrapper.and_then(|w| d.span_of(w)) {
                Some((start, len)) => start + len,
                None => touched.first().map(|l| l.start.min(from)).unwrap_or(from),
            };
            d.normalize();
            debug!(
                "tracked delete [{from}, {to}) wrapped {} group(s), removed {} own leaf(s)",
                groups.len(),
                doomed.len()
            );
            Ok(caret)
        })
    }

    /// Deletes the character before `caret`. Returns the new caret.
    ///
    /// At the start of a block this joins the block with the previous one and
    /// nothing is tracked.
    pub fn backspace(&self, doc: &mut Document, caret: usize, now: u64) -> DocResult<usize> {
        doc.update(|d| {
            d.ensure_text_block()?;
            let caret = d.snap_offset(caret);
            let block = d
                .block_at(caret)
                .ok_or_else(|| DocumentError::invariant("document has no text block"))?;
            if caret == block.start {
                if d.join_with_previous(block.id)? {
                    d.normalize();
                    return Ok(caret.saturating_sub(1));
                }
                return Ok(caret);
            }

            let target = d
                .leaves()
                .into_iter()
                .filter(|l| l.block == block.id && l.start < caret && l.len > 0)
                .rev()
                .find(|l| d.outermost_delete(l.id).is_none());
            let Some(target) = target else {
                return Ok(caret);
            };
            let is_mention = matches!(d.kind(target.id), Some(NodeKind::Mention { .. }));
            let char_end = caret.min(target.end());
            let char_start = if is_mention {
                target.start
            } else {
                char_end - 1
            };

            match self.disposition(d, target.id) {
                Disposition::Wrap => {
                    d.split_leaf_at(char_end)?;
                    d.split_leaf_at(char_start)?;
                    let leaf = d
                        .leaves()
                        .into_iter()
                        .find(|l| l.start == char_start && l.end() == char_end)
                        .ok_or_else(|| {
                            DocumentError::invariant("character before caret not isolated")
                        })?;
                    let parent = d.parent(leaf.id).ok_or_else(|| {
                        DocumentError::invariant(format!("{} has no parent", leaf.id))
                    })?;
                    let index = d.index_in_parent(leaf.id).unwrap_or(0);
                    let wrapper = self.wrap_deleted(d, parent, index..index + 1, now)?;
                    let (start, len) = d.span_of(wrapper).ok_or_else(|| {
                        DocumentError::invariant("deletion wrapper left the document")
                    })?;
                    d.normalize();
                    Ok(start + len)
                }
                _ => {
                    d.remove_inline(char_start, char_end)?;
                    d.normalize();
                    Ok(caret - (char_end - char_start))
                }
            }
        })
    }

    /// Wraps `parent.children[range]` as deleted, extending an adjacent own deletion when possible.
    fn wrap_deleted(
        &self,
        doc: &mut Document,
        parent: NodeId,
        range: std::ops::Range<usize>,
        now: u64,
    ) -> DocResult<NodeId> {
        let siblings = doc.children(parent).to_vec();
        if let Some(left) = range
            .start
            .checked_sub(1)
            .and_then(|i| siblings.get(i).copied())
        {
            if self.coalesces(doc, left, ChangeKind::Delete, now) {
                let dest = doc.children(left).len();
                doc.move_range(parent, range, left, dest)?;
                self.refresh(doc, left, now)?;
                return Ok(left);
            }
        }
        if let Some(right) = siblings.get(range.end).copied() {
            if self.coalesces(doc, right, ChangeKind::Delete, now) {
                doc.move_range(parent, range, right, 0)?;
                self.refresh(doc, right, now)?;
                return Ok(right);
            }
        }
        doc.wrap_children(parent, range, NodeKind::TrackedDelete(self.meta(now)))
    }
}

fn marks_at(doc: &Document, point: InsertPoint) -> Marks {
    let source = match point {
        InsertPoint::InText { node, .. } => Some(node),
        InsertPoint::Between { parent, index } => index
            .checked_sub(1)
            .and_then(|i| doc.children(parent).get(i).copied()),
    };
    match source.and_then(|id| doc.kind(id)) {
        Some(NodeKind::Text { marks, .. }) => *marks,
        _ => Marks::empty(),
    }
}

/// Turns an insertion point into a child boundary, splitting a text leaf if needed.
fn boundary(doc: &mut Document, point: InsertPoint) -> DocResult<(NodeId, usize)> {
    match point {
        InsertPoint::Between { parent, index } => Ok((parent, index)),
        InsertPoint::InText { node, offset } => {
            let parent = doc
                .parent(node)
                .ok_or_else(|| DocumentError::invariant(format!("{node} has no parent")))?;
            let index = doc.index_in_parent(node).unwrap_or(0);
            let len = doc.kind(node).map(NodeKind::visible_len).unwrap_or(0);
            if offset == 0 {
                Ok((parent, index))
            } else if offset >= len {
                Ok((parent, index + 1))
            } else {
                doc.split_text(node, offset)?;
                Ok((parent, index + 1))
            }
        }
    }
}

/// Adds `text` at one end of an existing insertion wrapper. Returns the caret.
fn extend_wrapper(
    doc: &mut Document,
    wrapper: NodeId,
    text: &str,
    marks: Marks,
    at_end: bool,
) -> DocResult<usize> {
    let children = doc.children(wrapper);
    let edge = if at_end {
        children.last().copied()
    } else {
        children.first().copied()
    };
    let count = text.chars().count();
    if let Some(edge) = edge {
        if let Some(NodeKind::Text { marks: m, content }) = doc.kind(edge) {
            if *m == marks {
                let offset = if at_end { content.chars().count() } else { 0 };
                let (leaf, after) =
                    doc.insert_at_point(InsertPoint::InText { node: edge, offset }, text)?;
                return doc.caret_in(leaf, after);
            }
        }
    }
    let index = if at_end { doc.children(wrapper).len() } else { 0 };
    let leaf = doc.create(NodeKind::marked_text(text, marks));
    doc.insert_child(wrapper, index, leaf)?;
    doc.caret_in(leaf, count)
}

// ─── Review ─────────────────────────────────────────────────────

/// Accepts every pending change. Returns how many were resolved.
pub fn accept_all(doc: &mut Document) -> DocResult<usize> {
    resolve_all(doc, true)
}

/// Rejects every pending change. Returns how many were resolved.
pub fn reject_all(doc: &mut Document) -> DocResult<usize> {
    resolve_all(doc, false)
}

fn resolve_all(doc: &mut Document, accept: bool) -> DocResult<usize> {
    doc.update(|d| {
        let mut resolved = 0;
        for id in d.post_order() {
            let Some(kind) = d.kind(id).and_then(NodeKind::change).map(|(k, _)| k) else {
                continue;
            };
            resolve_one(d, id, kind, accept)?;
            resolved += 1;
        }
        d.normalize();
        Ok(resolved)
    })
}

fn resolve_one(doc: &mut Document, id: NodeId, kind: ChangeKind, accept: bool) -> DocResult<()> {
    match (kind, accept) {
        (ChangeKind::Insert, true) | (ChangeKind::Delete, false) => {
            doc.unwrap(id)?;
        }
        (ChangeKind::Insert, false) | (ChangeKind::Delete, true) => doc.remove(id)?,
    }
    Ok(())
}

pub fn accept_change(doc: &mut Document, id: NodeId) -> DocResult<()> {
    resolve_change(doc, id, true)
}

pub fn reject_change(doc: &mut Document, id: NodeId) -> DocResult<()> {
    resolve_change(doc, id, false)
}

fn resolve_change(doc: &mut Document, id: NodeId, accept: bool) -> DocResult<()> {
    doc.update(|d| {
        let kind = d
            .kind(id)
            .and_then(NodeKind::change)
            .map(|(k, _)| k)
            .ok_or_else(|| DocumentError::invariant(format!("{id} is not a tracked change")))?;
        resolve_one(d, id, kind, accept)?;
        d.normalize();
        Ok(())
    })
}

/// Pending changes in document order.
pub fn pending_changes(doc: &Document) -> Vec<PendingChange> {
    doc.pre_order()
        .into_iter()
        .filter_map(|id| {
            let (kind, meta) = doc.kind(id)?.change()?;
            Some(PendingChange {
                node: id,
                kind,
                author_id: meta.author_id,
                author_name: meta.author_name.clone(),
                timestamp: meta.timestamp,
                text: doc.text_of(id),
            })
        })
        .collect()
}

pub fn change_count(doc: &Document) -> usize {
    doc.pre_order()
        .into_iter()
        .filter(|id| doc.kind(*id).and_then(NodeKind::change).is_some())
        .count()
}

/// Plain text the document would show if every change were accepted.
pub fn visible_on_accept(doc: &Document) -> DocResult<String> {
    let mut copy = doc.clone();
    accept_all(&mut copy)?;
    Ok(copy.plain_text())
}

/// Plain text the document would show if every change were rejected.
pub fn visible_on_reject(doc: &Document) -> DocResult<String> {
    let mut copy = doc.clone();
    reject_all(&mut copy)?;
    Ok(copy.plain_text())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> TrackChanges {
        let mut tc = TrackChanges::new(Author::new(Uuid::from_u128(1), "Alice"));
        tc.set_mode(ReviewMode::Review);
        tc
    }

    fn bob() -> TrackChanges {
        let mut tc = TrackChanges::new(Author::new(Uuid::from_u128(2), "Bob"));
        tc.set_mode(ReviewMode::Review);
        tc
    }

    fn type_chars(tc: &TrackChanges, doc: &mut Document, mut caret: usize, text: &str, t0: u64) -> usize {
        for (i, ch) in text.chars().enumerate() {
            caret = tc
                .insert_text(doc, caret, &ch.to_string(), t0 + i as u64 * 100)
                .unwrap();
        }
        caret
    }

    #[test]
    fn test_typing_coalesces_into_one_insertion() {
        let tc = alice();
        let mut doc = Document::new();
        let caret = type_chars(&tc, &mut doc, 0, "Hello", 1_000);
        assert_eq!(caret, 5);
        assert_eq!(doc.plain_text(), "Hello");
        let changes = pending_changes(&doc);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Insert);
        assert_eq!(changes[0].text, "Hello");
        assert_eq!(changes[0].timestamp, 1_400);
    }

    #[test]
    fn test_accept_all_unwraps_insertion() {
        let tc = alice();
        let mut doc = Document::new();
        type_chars(&tc, &mut doc, 0, "Hello", 0);
        assert_eq!(accept_all(&mut doc).unwrap(), 1);
        assert_eq!(change_count(&doc), 0);
        let p = doc.text_blocks()[0];
        assert_eq!(doc.children(p).len(), 1);
        assert_eq!(doc.kind(doc.children(p)[0]), Some(&NodeKind::text("Hello")));
    }

    #[test]
    fn test_delete_then_accept_or_reject() {
        let tc = alice();
        let mut base = Document::from_plain_text("Hello World");
        let caret = tc.delete_range(&mut base, 6, 11, 0).unwrap();
        assert_eq!(caret, 11);
        assert_eq!(base.plain_text(), "Hello World");

        let mut accepted = base.clone();
        accept_all(&mut accepted).unwrap();
        assert_eq!(accepted.plain_text(), "Hello ");

        let mut rejected = base.clone();
        reject_all(&mut rejected).unwrap();
        assert_eq!(rejected.plain_text(), "Hello World");
        assert_eq!(change_count(&rejected), 0);
    }

    #[test]
    fn test_other_author_splits_insertion() {
        let a = alice();
        let b = bob();
        let mut doc = Document::new();
        type_chars(&a, &mut doc, 0, "Hello", 0);
        let caret = b.insert_text(&mut doc, 2, "X", 10).unwrap();
        assert_eq!(caret, 3);
        assert_eq!(doc.plain_text(), "HeXllo");
        let authors: Vec<String> = pending_changes(&doc)
            .into_iter()
            .map(|c| c.author_name)
            .collect();
        assert_eq!(authors, vec!["Alice", "Bob", "Alice"]);
        assert_eq!(visible_on_reject(&doc).unwrap(), "");
    }

    #[test]
    fn test_window_expiry_starts_new_insertion() {
        let tc = alice();
        let mut doc = Document::from_plain_text("ab");
        let caret = tc.insert_text(&mut doc, 2, "x", 0).unwrap();
        assert_eq!(caret, 3);
        // Typing just before the pending insertion extends it while the window is open.
        let caret = tc.insert_text(&mut doc, 2, "y", 500).unwrap();
        assert_eq!(caret, 3);
        assert_eq!(doc.plain_text(), "abyx");
        assert_eq!(change_count(&doc), 1);

        tc.insert_text(&mut doc, 2, "z", 10_000).unwrap();
        assert_eq!(doc.plain_text(), "abzyx");
        assert_eq!(change_count(&doc), 2);
    }

    #[test]
    fn test_insert_inside_deletion_relocates_after_it() {
        let tc = alice();
        let mut doc = Document::from_plain_text("Hello World");
        tc.delete_range(&mut doc, 6, 11, 0).unwrap();
        let caret = tc.insert_text(&mut doc, 8, "!", 5_000).unwrap();
        assert_eq!(caret, 12);
        assert_eq!(doc.plain_text(), "Hello World!");
        assert_eq!(visible_on_accept(&doc).unwrap(), "Hello !");
    }

    #[test]
    fn test_backspace_sequence_merges_deletions() {
        let tc = alice();
        let mut doc = Document::from_plain_text("abc");
        let caret = tc.backspace(&mut doc, 3, 0).unwrap();
        assert_eq!(caret, 3);
        let caret = tc.backspace(&mut doc, caret, 100).unwrap();
        assert_eq!(caret, 3);
        assert_eq!(change_count(&doc), 1);
        assert_eq!(pending_changes(&doc)[0].text, "bc");
        assert_eq!(visible_on_accept(&doc).unwrap(), "a");
    }

    #[test]
    fn test_backspace_at_block_start_joins() {
        let tc = alice();
        let mut doc = Document::from_plain_text("ab\ncd");
        let caret = tc.backspace(&mut doc, 3, 0).unwrap();
        assert_eq!(caret, 2);
        assert_eq!(doc.plain_text(), "abcd");
        assert_eq!(change_count(&doc), 0);
    }

    #[test]
    fn test_backspace_inside_own_insertion_removes() {
        let tc = alice();
        let mut doc = Document::from_plain_text("ab");
        let caret = tc.insert_text(&mut doc, 2, "xy", 0).unwrap();
        let caret = tc.backspace(&mut doc, caret, 50).unwrap();
        assert_eq!(caret, 3);
        assert_eq!(doc.plain_text(), "abx");
        assert_eq!(change_count(&doc), 1);
    }

    #[test]
    fn test_delete_over_own_insertion_and_plain_text() {
        let tc = alice();
        let mut doc = Document::from_plain_text("abcd");
        tc.insert_text(&mut doc, 2, "XY", 0).unwrap();
        assert_eq!(doc.plain_text(), "abXYcd");
        let caret = tc.delete_range(&mut doc, 1, 5, 10_000).unwrap();
        // "b" and "c" are marked, "XY" disappears.
        assert_eq!(doc.plain_text(), "abcd");
        assert_eq!(caret, 3);
        assert_eq!(visible_on_accept(&doc).unwrap(), "ad");
        assert_eq!(visible_on_reject(&doc).unwrap(), "abcd");
    }

    #[test]
    fn test_delete_skips_already_deleted() {
        let a = alice();
        let b = bob();
        let mut doc = Document::from_plain_text("abcdef");
        a.delete_range(&mut doc, 2, 4, 0).unwrap();
        b.delete_range(&mut doc, 0, 6, 10).unwrap();
        let deletions: Vec<(String, String)> = pending_changes(&doc)
            .into_iter()
            .map(|c| (c.author_name, c.text))
            .collect();
        assert_eq!(
            deletions,
            vec![
                ("Bob".to_string(), "ab".to_string()),
                ("Alice".to_string(), "cd".to_string()),
                ("Bob".to_string(), "ef".to_string()),
            ]
        );
    }

    #[test]
    fn test_mention_deleted_whole() {
        let tc = alice();
        let mut doc = Document::from_plain_text("hi ");
        let p = doc.text_blocks()[0];
        let m = doc.create(NodeKind::mention(Uuid::new_v4(), "Bob"));
        doc.append_child(p, m).unwrap();
        tc.delete_range(&mut doc, 4, 5, 0).unwrap();
        let changes = pending_changes(&doc);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].text, "@Bob");
        assert_eq!(visible_on_accept(&doc).unwrap(), "hi ");
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let a = alice();
        let mut doc = Document::from_plain_text("one two");
        a.delete_range(&mut doc, 0, 3, 0).unwrap();
        a.insert_text(&mut doc, 7, "!", 10_000).unwrap();
        let mut once = doc.clone();
        accept_all(&mut once).unwrap();
        let mut twice = once.clone();
        assert_eq!(accept_all(&mut twice).unwrap(), 0);
        assert_eq!(once, twice);

        let mut once = doc.clone();
        reject_all(&mut once).unwrap();
        let mut twice = once.clone();
        reject_all(&mut twice).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_single_change_resolution() {
        let a = alice();
        let mut doc = Document::from_plain_text("keep drop");
        a.delete_range(&mut doc, 5, 9, 0).unwrap();
        let change = pending_changes(&doc)[0].node;
        reject_change(&mut doc, change).unwrap();
        assert_eq!(change_count(&doc), 0);
        assert_eq!(doc.plain_text(), "keep drop");
        let p = doc.text_blocks()[0];
        assert!(accept_change(&mut doc, p).is_err());
    }

    #[test]
    fn test_off_mode_edits_directly() {
        let tc = TrackChanges::new(Author::new(Uuid::from_u128(9), "Zed"));
        let mut doc = Document::from_plain_text("abc");
        tc.insert_text(&mut doc, 3, "d", 0).unwrap();
        tc.delete_range(&mut doc, 0, 1, 0).unwrap();
        let caret = tc.backspace(&mut doc, 3, 0).unwrap();
        assert_eq!(caret, 2);
        assert_eq!(doc.plain_text(), "bc");
        assert_eq!(change_count(&doc), 0);
    }

    #[test]
    fn test_toggle_mode() {
        let mut tc = TrackChanges::new(Author::new(Uuid::nil(), "n"));
        assert_eq!(tc.toggle(), ReviewMode::Review);
        assert_eq!(tc.toggle(), ReviewMode::Off);
    }
}
