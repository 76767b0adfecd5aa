//! Document offsets and the text-level editing primitives built on them.
//!
//! Offsets are character positions in the plain-text projection: a text leaf
//! contributes its content, a mention contributes its label, and consecutive
//! text blocks are separated by one `'\n'`. Every offset therefore lands in
//! exactly one block; the position just before a separator is the end of the
//! earlier block, the one just after it is the start of the next.

use std::ops::Range;

use log::debug;

use crate::error::{DocResult, DocumentError};
use crate::node::{Node, NodeId, NodeKind};
use crate::tree::Document;

/// A visible leaf and where it sits in the inline offset space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafSpan {
    pub id: NodeId,
    pub block: NodeId,
    pub start: usize,
    pub len: usize,
}

impl LeafSpan {
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    pub id: NodeId,
    pub start: usize,
    pub len: usize,
}

impl BlockSpan {
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Where new inline content goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InsertPoint {
    /// Inside an existing text leaf, at a char offset.
    InText { node: NodeId, offset: usize },
    /// As a new child of `parent` at `index`.
    Between { parent: NodeId, index: usize },
}

/// A single contiguous replacement in plain-text coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainSplice {
    pub start: usize,
    pub deleted: usize,
    pub inserted: String,
}

impl PlainSplice {
    /// The minimal prefix/suffix-trimmed replacement turning `old` into `new`.
    pub fn between(old: &str, new: &str) -> Option<Self> {
        if old == new {
            return None;
        }
        let old_chars: Vec<char> = old.chars().collect();
        let new_chars: Vec<char> = new.chars().collect();
        let prefix = old_chars
            .iter()
            .zip(new_chars.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let max_suffix = old_chars.len().min(new_chars.len()) - prefix;
        let suffix = old_chars
            .iter()
            .rev()
            .zip(new_chars.iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();
        Some(Self {
            start: prefix,
            deleted: old_chars.len() - prefix - suffix,
            inserted: new_chars[prefix..new_chars.len() - suffix].iter().collect(),
        })
    }
}

/// Byte index of the `chars`-th character, clamped to the end of `s`.
pub(crate) fn byte_index(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map(|(i, _)| i).unwrap_or(s.len())
}

impl Document {
    // ─── Offset queries ────────────────────────────────────────

    /// Text blocks (paragraphs, headings, code blocks) in document order.
    pub fn text_blocks(&self) -> Vec<NodeId> {
        self.pre_order()
            .into_iter()
            .filter(|id| self.kind(*id).is_some_and(NodeKind::is_text_block))
            .collect()
    }

    pub fn leaves(&self) -> Vec<LeafSpan> {
        let mut out = Vec::new();
        let mut pos = 0;
        for (i, block) in self.text_blocks().into_iter().enumerate() {
            if i > 0 {
                pos += 1;
            }
            for id in self.subtree(block).into_iter().skip(1) {
                if let Some(kind) = self.kind(id) {
                    if kind.is_leaf() {
                        let len = kind.visible_len();
                        out.push(LeafSpan {
                            id,
                            block,
                            start: pos,
                            len,
                        });
                        pos += len;
                    }
                }
            }
        }
        out
    }

    pub fn block_spans(&self) -> Vec<BlockSpan> {
        let mut out = Vec::new();
        let mut pos = 0;
        for (i, block) in self.text_blocks().into_iter().enumerate() {
            if i > 0 {
                pos += 1;
            }
            let len = self.inline_len_of(block);
            out.push(BlockSpan {
                id: block,
                start: pos,
                len,
            });
            pos += len;
        }
        out
    }

    /// Length of the plain-text projection in characters.
    pub fn text_len(&self) -> usize {
        self.block_spans().last().map(BlockSpan::end).unwrap_or(0)
    }

    /// Visible length of the subtree under `id`, separators excluded.
    pub fn inline_len_of(&self, id: NodeId) -> usize {
        self.subtree(id)
            .into_iter()
            .filter_map(|n| self.kind(n))
            .map(NodeKind::visible_len)
            .sum()
    }

    /// Visible text of the subtree under `id`.
    pub fn text_of(&self, id: NodeId) -> String {
        let mut out = String::new();
        for n in self.subtree(id) {
            match self.kind(n) {
                Some(NodeKind::Text { content, .. }) => out.push_str(content),
                Some(NodeKind::Mention { label, .. }) => out.push_str(label),
                _ => {}
            }
        }
        out
    }

    /// Visible text of every text block joined with `'\n'`.
    pub fn plain_text(&self) -> String {
        self.text_blocks()
            .into_iter()
            .map(|b| self.text_of(b))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Characters of `[from, to)` in the plain-text projection.
    pub fn text_range(&self, from: usize, to: usize) -> String {
        self.plain_text()
            .chars()
            .skip(from)
            .take(to.saturating_sub(from))
            .collect()
    }

    /// Start offset and inline length of the subtree under `id`.
    pub fn span_of(&self, id: NodeId) -> Option<(usize, usize)> {
        if !self.contains(id) {
            return None;
        }
        let mut pos = 0;
        for (i, block) in self.text_blocks().into_iter().enumerate() {
            if i > 0 {
                pos += 1;
            }
            for n in self.subtree(block) {
                if n == id {
                    return Some((pos, self.inline_len_of(id)));
                }
                pos += self.kind(n).map(NodeKind::visible_len).unwrap_or(0);
            }
        }
        None
    }

    /// The block holding `offset`, clamped to the last block.
    pub fn block_at(&self, offset: usize) -> Option<BlockSpan> {
        let spans = self.block_spans();
        spans
            .iter()
            .find(|b| b.start <= offset && offset <= b.end())
            .or_else(|| spans.last())
            .copied()
    }

    /// The first block that fully contains `[from, to]`.
    pub fn block_containing(&self, from: usize, to: usize) -> Option<BlockSpan> {
        self.block_spans()
            .into_iter()
            .find(|b| b.start <= from && to <= b.end())
    }

    /// Clamps `offset` to the document and moves it out of mention interiors.
    pub fn snap_offset(&self, offset: usize) -> usize {
        let offset = offset.min(self.text_len());
        for leaf in self.leaves() {
            if leaf.start < offset && offset < leaf.end() {
                if let Some(NodeKind::Mention { .. }) = self.kind(leaf.id) {
                    return if (offset - leaf.start) * 2 >= leaf.len {
                        leaf.end()
                    } else {
                        leaf.start
                    };
                }
            }
        }
        offset
    }

    /// Outermost tracked-deletion wrapper enclosing `id` (or `id` itself).
    pub(crate) fn outermost_delete(&self, id: NodeId) -> Option<NodeId> {
        std::iter::once(id)
            .chain(self.ancestors(id))
            .filter(|n| matches!(self.kind(*n), Some(NodeKind::TrackedDelete(_))))
            .last()
    }

    // ─── Insertion points ──────────────────────────────────────

    fn leaves_in_block(&self, block: NodeId) -> Vec<LeafSpan> {
        let mut pos = 0;
        let mut out = Vec::new();
        for id in self.subtree(block).into_iter().skip(1) {
            if let Some(kind) = self.kind(id) {
                if kind.is_leaf() {
                    let len = kind.visible_len();
                    out.push(LeafSpan {
                        id,
                        block,
                        start: pos,
                        len,
                    });
                    pos += len;
                }
            }
        }
        out
    }

    fn before(&self, id: NodeId) -> DocResult<InsertPoint> {
        let parent = self
            .parent(id)
            .ok_or_else(|| DocumentError::invariant(format!("{id} has no parent")))?;
        let index = self.index_in_parent(id).unwrap_or(0);
        Ok(InsertPoint::Between { parent, index })
    }

    fn after(&self, id: NodeId) -> DocResult<InsertPoint> {
        match self.before(id)? {
            InsertPoint::Between { parent, index } => Ok(InsertPoint::Between {
                parent,
                index: index + 1,
            }),
            point => Ok(point),
        }
    }

    /// Left-biased insertion point at `local` chars into `block`.
    pub(crate) fn resolve_in_block(&self, block: NodeId, local: usize) -> DocResult<InsertPoint> {
        let leaves = self.leaves_in_block(block);
        if let Some(leaf) = leaves
            .iter()
            .find(|l| l.start < local && local <= l.end())
        {
            return match self.node(leaf.id)?.kind {
                NodeKind::Text { .. } => Ok(InsertPoint::InText {
                    node: leaf.id,
                    offset: local - leaf.start,
                }),
                _ if local == leaf.end() || (local - leaf.start) * 2 >= leaf.len => {
                    self.after(leaf.id)
                }
                _ => self.before(leaf.id),
            };
        }
        if let Some(leaf) = leaves.iter().find(|l| l.start == local) {
            return match self.node(leaf.id)?.kind {
                NodeKind::Text { .. } => Ok(InsertPoint::InText {
                    node: leaf.id,
                    offset: 0,
                }),
                _ => self.before(leaf.id),
            };
        }
        Ok(InsertPoint::Between {
            parent: block,
            index: self.children(block).len(),
        })
    }

    /// Makes sure at least one text block exists to receive content.
    pub(crate) fn ensure_text_block(&mut self) -> DocResult<()> {
        if self.text_blocks().is_empty() {
            let paragraph = self.create(NodeKind::paragraph());
            self.append_child(self.root, paragraph)?;
        }
        Ok(())
    }

    pub(crate) fn resolve_insert(&mut self, offset: usize) -> DocResult<(usize, InsertPoint)> {
        self.ensure_text_block()?;
        let offset = self.snap_offset(offset);
        let block = self
            .block_at(offset)
            .ok_or_else(|| DocumentError::invariant("document has no text block"))?;
        let point = self.resolve_in_block(block.id, offset - block.start)?;
        Ok((offset, point))
    }

    /// Moves an insertion point that falls inside pending deleted content to just after it.
    pub(crate) fn escape_delete(&self, point: InsertPoint) -> DocResult<InsertPoint> {
        let container = match point {
            InsertPoint::InText { node, .. } => node,
            InsertPoint::Between { parent, .. } => parent,
        };
        match self.outermost_delete(container) {
            Some(wrapper) => self.after(wrapper),
            None => Ok(point),
        }
    }

    /// Inserts `text` at `point`; returns the text leaf and the char offset just past the insertion.
    pub(crate) fn insert_at_point(
        &mut self,
        point: InsertPoint,
        text: &str,
    ) -> DocResult<(NodeId, usize)> {
        let count = text.chars().count();
        match point {
            InsertPoint::InText { node, offset } => {
                match &mut self.node_mut(node)?.kind {
                    NodeKind::Text { content, .. } => {
                        let at = byte_index(content, offset);
                        content.insert_str(at, text);
                    }
                    other => {
                        return Err(DocumentError::invariant(format!(
                            "cannot type into {}",
                            other.tag()
                        )))
                    }
                }
                Ok((node, offset + count))
            }
            InsertPoint::Between { parent, index } => {
                let marks = index
                    .checked_sub(1)
                    .and_then(|i| self.children(parent).get(i).copied())
                    .and_then(|left| match self.kind(left) {
                        Some(NodeKind::Text { marks, .. }) => Some(*marks),
                        _ => None,
                    })
                    .unwrap_or_default();
                let leaf = self.create(NodeKind::marked_text(text, marks));
                self.insert_child(parent, index, leaf)?;
                Ok((leaf, count))
            }
        }
    }

    /// Converts a (leaf, char offset) pair back into a document offset.
    pub(crate) fn caret_in(&self, leaf: NodeId, offset: usize) -> DocResult<usize> {
        self.span_of(leaf)
            .map(|(start, _)| start + offset)
            .ok_or_else(|| DocumentError::invariant(format!("{leaf} is not in the document")))
    }

    // ─── Untracked editing ─────────────────────────────────────

    /// Inserts plain text at `offset`. Returns the caret after the inserted text.
    pub fn insert_text(&mut self, offset: usize, text: &str) -> DocResult<usize> {
        if text.is_empty() {
            return Ok(self.snap_offset(offset));
        }
        self.update(|d| {
            let (_, point) = d.resolve_insert(offset)?;
            let point = d.escape_delete(point)?;
            let (leaf, after) = d.insert_at_point(point, text)?;
            d.caret_in(leaf, after)
        })
    }

    /// Removes `[from, to)` outright, joining the blocks it spans. Returns the caret.
    pub fn remove_range(&mut self, from: usize, to: usize) -> DocResult<usize> {
        if from >= to {
            return Ok(self.snap_offset(from));
        }
        self.update(|d| d.remove_and_join(from, to))
    }

    pub(crate) fn remove_and_join(&mut self, from: usize, to: usize) -> DocResult<usize> {
        let spans = self.block_spans();
        let first = spans
            .iter()
            .position(|b| b.start <= from && from <= b.end())
            .unwrap_or(0);
        let last = spans
            .iter()
            .position(|b| b.start <= to && to <= b.end())
            .unwrap_or(spans.len().saturating_sub(1));
        let caret = self
            .leaves()
            .into_iter()
            .find(|l| l.start < to && l.end() > from)
            .map(|l| match self.kind(l.id) {
                // A mention cut from the middle goes whole, so the caret lands where it began.
                Some(NodeKind::Mention { .. }) => l.start.min(from),
                _ => from,
            })
            .unwrap_or(from);

        self.remove_inline(from, to)?;
        for _ in first..last {
            let next = self.text_blocks().get(first + 1).copied();
            if let Some(next) = next {
                self.join_with_previous(next)?;
            }
        }
        self.normalize();
        Ok(caret.min(self.text_len()))
    }

    /// Deletes the visible characters of `[from, to)`; intersecting mentions go whole.
    pub(crate) fn remove_inline(&mut self, from: usize, to: usize) -> DocResult<()> {
        let touched: Vec<LeafSpan> = self
            .leaves()
            .into_iter()
            .filter(|l| l.start < to && l.end() > from)
            .collect();
        for leaf in touched.into_iter().rev() {
            if !matches!(self.kind(leaf.id), Some(NodeKind::Text { .. })) {
                self.remove(leaf.id)?;
                continue;
            }
            if let NodeKind::Text { content, .. } = &mut self.node_mut(leaf.id)?.kind {
                let a = from.saturating_sub(leaf.start);
                let b = (to - leaf.start).min(leaf.len);
                let (ba, bb) = (byte_index(content, a), byte_index(content, b));
                content.replace_range(ba..bb, "");
            }
        }
        Ok(())
    }

    // ─── Splitting and isolation ───────────────────────────────

    /// Splits text leaf `id` at char `offset`; returns the new right-hand leaf.
    pub fn split_text(&mut self, id: NodeId, offset: usize) -> DocResult<NodeId> {
        let (tail, marks) = match &mut self.node_mut(id)?.kind {
            NodeKind::Text { content, marks } => {
                if offset > content.chars().count() {
                    return Err(DocumentError::invariant(format!(
                        "offset {offset} past end of {id}"
                    )));
                }
                let at = byte_index(content, offset);
                (content.split_off(at), *marks)
            }
            other => {
                return Err(DocumentError::invariant(format!(
                    "cannot split {}",
                    other.tag()
                )))
            }
        };
        let parent = self
            .parent(id)
            .ok_or_else(|| DocumentError::invariant(format!("{id} has no parent")))?;
        let index = self.index_in_parent(id).unwrap_or(0);
        let right = self.create(NodeKind::marked_text(tail, marks));
        self.insert_child(parent, index + 1, right)?;
        Ok(right)
    }

    /// Splits whichever text leaf strictly straddles `offset`.
    pub(crate) fn split_leaf_at(&mut self, offset: usize) -> DocResult<()> {
        let hit = self
            .leaves()
            .into_iter()
            .find(|l| l.start < offset && offset < l.end());
        if let Some(leaf) = hit {
            if let Some(NodeKind::Text { .. }) = self.kind(leaf.id) {
                self.split_text(leaf.id, offset - leaf.start)?;
            }
        }
        Ok(())
    }

    /// Splits wrapper `id` before its `k`-th child. Returns the boundary index in the wrapper's parent.
    pub(crate) fn split_wrapper(&mut self, id: NodeId, k: usize) -> DocResult<usize> {
        let parent = self
            .parent(id)
            .ok_or_else(|| DocumentError::invariant(format!("{id} has no parent")))?;
        let index = self.index_in_parent(id).unwrap_or(0);
        let n = self.children(id).len();
        if k == 0 {
            return Ok(index);
        }
        if k >= n {
            return Ok(index + 1);
        }
        let kind = self.node(id)?.kind.clone();
        let right = self.create(kind);
        self.move_range(id, k..n, right, 0)?;
        self.insert_child(parent, index + 1, right)?;
        Ok(index + 1)
    }

    /// Ensures a child boundary of `parent` sits at `offset` chars in; returns its index.
    ///
    /// Text leaves and inline wrappers straddling the offset are split; mentions
    /// are atomic and snap to their nearest edge.
    pub(crate) fn isolate_in(&mut self, parent: NodeId, offset: usize) -> DocResult<usize> {
        let children = self.children(parent).to_vec();
        let mut pos = 0;
        for (i, child) in children.iter().enumerate() {
            if offset == pos {
                return Ok(i);
            }
            let len = self.inline_len_of(*child);
            if offset < pos + len {
                let local = offset - pos;
                let (is_text, is_mention) = match self.node(*child)?.kind {
                    NodeKind::Text { .. } => (true, false),
                    NodeKind::Mention { .. } => (false, true),
                    _ => (false, false),
                };
                if is_text {
                    self.split_text(*child, local)?;
                    return Ok(i + 1);
                }
                if is_mention {
                    return Ok(if local * 2 >= len { i + 1 } else { i });
                }
                let k = self.isolate_in(*child, local)?;
                return self.split_wrapper(*child, k);
            }
            pos += len;
        }
        Ok(children.len())
    }

    /// Splits around `[from, to)` so the range is a run of whole children of one block.
    pub fn isolate_range(&mut self, from: usize, to: usize) -> DocResult<(NodeId, Range<usize>)> {
        let block = self
            .block_containing(from, to)
            .ok_or_else(|| DocumentError::invariant("range spans more than one block"))?;
        let i = self.isolate_in(block.id, from - block.start)?;
        let j = self.isolate_in(block.id, to - block.start)?;
        Ok((block.id, i..j.max(i)))
    }

    // ─── Blocks ────────────────────────────────────────────────

    /// Splits the block holding `offset` in two; returns the new second block.
    pub fn split_block(&mut self, offset: usize) -> DocResult<NodeId> {
        self.ensure_text_block()?;
        let offset = self.snap_offset(offset);
        let block = self
            .block_at(offset)
            .ok_or_else(|| DocumentError::invariant("document has no text block"))?;
        self.split_block_at(block.id, offset - block.start)
    }

    pub(crate) fn split_block_at(&mut self, block: NodeId, local: usize) -> DocResult<NodeId> {
        let kind = self.node(block)?.kind.clone();
        let parent = self
            .parent(block)
            .ok_or_else(|| DocumentError::invariant(format!("{block} has no parent")))?;
        let index = self.index_in_parent(block).unwrap_or(0);
        let cut = self.isolate_in(block, local)?;
        let fresh = self.create(kind);
        self.insert_child(parent, index + 1, fresh)?;
        let n = self.children(block).len();
        self.move_range(block, cut..n, fresh, 0)?;
        Ok(fresh)
    }

    /// Merges `block` into the previous text block. Returns false at the first block.
    pub fn join_with_previous(&mut self, block: NodeId) -> DocResult<bool> {
        let blocks = self.text_blocks();
        let position = blocks
            .iter()
            .position(|b| *b == block)
            .ok_or_else(|| DocumentError::invariant(format!("{block} is not a text block")))?;
        if position == 0 {
            return Ok(false);
        }
        let prev = blocks[position - 1];
        let n = self.children(block).len();
        let dest = self.children(prev).len();
        self.move_range(block, 0..n, prev, dest)?;

        let mut victim = block;
        loop {
            let parent = self.parent(victim);
            self.remove(victim)?;
            match parent {
                Some(p) if p != self.root && self.children(p).is_empty() => victim = p,
                _ => break,
            }
        }
        Ok(true)
    }

    // ─── Normalization ─────────────────────────────────────────

    /// Drops empty text leaves and empty inline wrappers, then merges adjacent
    /// text leaves with identical marks. Visible text and offsets are unchanged.
    pub fn normalize(&mut self) {
        for id in self.post_order() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            let empty = match &node.kind {
                NodeKind::Text { content, .. } => content.is_empty(),
                kind if kind.is_inline_wrapper() => {
                    node.children.is_empty() || self.inline_len_of(id) == 0
                }
                _ => false,
            };
            if empty && id != self.root {
                if let Err(e) = self.remove(id) {
                    debug!("normalize kept empty {id}: {e}");
                }
            }
        }

        for parent in self.pre_order() {
            let mut i = 0;
            loop {
                let children = self.children(parent);
                if i + 1 >= children.len() {
                    break;
                }
                let (left, right) = (children[i], children[i + 1]);
                let merged = match (self.kind(left), self.kind(right)) {
                    (
                        Some(NodeKind::Text { marks: a, .. }),
                        Some(NodeKind::Text { content, marks: b }),
                    ) if a == b => Some(content.clone()),
                    _ => None,
                };
                match merged {
                    Some(tail) => match self.remove(right) {
                        Ok(()) => {
                            if let Some(Node { kind: NodeKind::Text { content, .. }, .. }) =
                                self.nodes.get_mut(&left)
                            {
                                content.push_str(&tail);
                            }
                        }
                        Err(e) => {
                            debug!("normalize kept {right} unmerged: {e}");
                            i += 1;
                        }
                    },
                    None => i += 1,
                }
            }
        }
    }

    // ─── Plain-text projection ─────────────────────────────────

    /// Replaces `deleted` chars at offset `start` with `inserted`, untracked.
    ///
    /// Separators in the removed range join blocks; newlines in `inserted` split them.
    pub fn splice_plain(&mut self, start: usize, deleted: usize, inserted: &str) -> DocResult<()> {
        self.update(|d| {
            d.ensure_text_block()?;
            let start = start.min(d.text_len());
            if deleted > 0 {
                d.remove_and_join(start, start + deleted)?;
            }
            let span = d
                .block_at(start)
                .ok_or_else(|| DocumentError::invariant("document has no text block"))?;
            let mut block = span.id;
            let mut local = start - span.start;
            for (k, segment) in inserted.split('\n').enumerate() {
                if k > 0 {
                    block = d.split_block_at(block, local)?;
                    local = 0;
                }
                if !segment.is_empty() {
                    let point = d.resolve_in_block(block, local)?;
                    d.insert_at_point(point, segment)?;
                    local += segment.chars().count();
                }
            }
            d.normalize();
            Ok(())
        })
    }

    /// Rewrites the document so its plain text equals `text`, touching only the changed span.
    pub fn sync_plain_text(&mut self, text: &str) -> DocResult<bool> {
        match PlainSplice::between(&self.plain_text(), text) {
            Some(splice) => {
                self.splice_plain(splice.start, splice.deleted, &splice.inserted)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
