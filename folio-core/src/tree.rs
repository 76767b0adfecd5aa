//! Arena-backed document tree.
//!
//! ```text
//!   Document (arena)
//!   ├── nodes: HashMap<NodeId, Node>   parent + ordered children per node
//!   ├── root: NodeId                   always an Element(Document)
//!   └── next_id                        monotonically increasing ids
//! ```
//!
//! Every structural mutation validates first and mutates second, so a failed
//! call leaves the tree untouched. Multi-step edits go through
//! [`Document::update`], which applies a closure to a draft copy and swaps it
//! in only when the closure succeeds.

use std::collections::{HashMap, HashSet};
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{DocResult, DocumentError};
use crate::node::{ElementKind, Node, NodeId, NodeKind};

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub(crate) nodes: HashMap<NodeId, Node>,
    pub(crate) root: NodeId,
    pub(crate) next_id: u64,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

/// Flat, serializable form of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub root: NodeId,
    pub next_id: u64,
    pub nodes: Vec<SnapshotNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub id: NodeId,
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeId>,
}

impl Document {
    /// An empty document: the root element and one empty paragraph.
    pub fn new() -> Self {
        let mut doc = Self::bare();
        let paragraph = doc.create(NodeKind::paragraph());
        doc.attach(doc.root, paragraph, 0);
        doc
    }

    /// Only the root element, no blocks.
    fn bare() -> Self {
        let root = NodeId(0);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            Node::new(root, NodeKind::element(ElementKind::Document)),
        );
        Self {
            nodes,
            root,
            next_id: 1,
        }
    }

    /// One paragraph per line of `text`.
    pub fn from_plain_text(text: &str) -> Self {
        let mut doc = Self::bare();
        for (i, line) in text.split('\n').enumerate() {
            let paragraph = doc.create(NodeKind::paragraph());
            doc.attach(doc.root, paragraph, i);
            if !line.is_empty() {
                let leaf = doc.create(NodeKind::text(line));
                doc.attach(paragraph, leaf, 0);
            }
        }
        doc
    }

    // ─── Accessors ──────────────────────────────────────────────

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn kind(&self, id: NodeId) -> Option<&NodeKind> {
        self.nodes.get(&id).map(|n| &n.kind)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(&id).and_then(|n| n.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(&id)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    /// Number of nodes in the arena, root included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn index_in_parent(&self, id: NodeId) -> Option<usize> {
        let parent = self.parent(id)?;
        self.children(parent).iter().position(|c| *c == id)
    }

    /// Ancestors of `id`, nearest first, root last.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cursor = self.parent(id);
        while let Some(p) = cursor {
            out.push(p);
            cursor = self.parent(p);
        }
        out
    }

    pub fn is_ancestor(&self, ancestor: NodeId, id: NodeId) -> bool {
        let mut cursor = self.parent(id);
        while let Some(p) = cursor {
            if p == ancestor {
                return true;
            }
            cursor = self.parent(p);
        }
        false
    }

    pub(crate) fn node(&self, id: NodeId) -> DocResult<&Node> {
        self.nodes
            .get(&id)
            .ok_or_else(|| DocumentError::invariant(format!("unknown node {id}")))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> DocResult<&mut Node> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| DocumentError::invariant(format!("unknown node {id}")))
    }

    // ─── Traversal ──────────────────────────────────────────────

    pub fn pre_order(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.children(id).iter().rev().copied());
        }
        out
    }

    /// Children before parents, siblings left to right.
    pub fn post_order(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![(self.root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                out.push(id);
                continue;
            }
            stack.push((id, true));
            for child in self.children(id).iter().rev() {
                stack.push((*child, false));
            }
        }
        out
    }

    /// Pre-order ids of the subtree rooted at `id`, `id` first.
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            out.push(n);
            stack.extend(self.children(n).iter().rev().copied());
        }
        out
    }

    // ─── Structural operations ─────────────────────────────────

    /// Creates a detached node. It joins the tree through [`Document::insert_child`].
    pub fn create(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, Node::new(id, kind));
        id
    }

    pub fn insert_child(&mut self, parent: NodeId, index: usize, child: NodeId) -> DocResult<()> {
        let parent_node = self.node(parent)?;
        let child_node = self.node(child)?;
        if child == self.root {
            return Err(DocumentError::invariant("the root cannot be re-parented"));
        }
        if child_node.parent.is_some() {
            return Err(DocumentError::invariant(format!(
                "{child} is already attached"
            )));
        }
        if child == parent || self.is_ancestor(child, parent) {
            return Err(DocumentError::invariant(format!(
                "attaching {child} under {parent} would create a cycle"
            )));
        }
        if !parent_node.kind.accepts_child(&child_node.kind) {
            return Err(DocumentError::invariant(format!(
                "{} cannot contain {}",
                parent_node.kind.tag(),
                child_node.kind.tag()
            )));
        }
        if index > parent_node.children.len() {
            return Err(DocumentError::invariant(format!(
                "index {index} out of bounds for {parent}"
            )));
        }
        self.attach(parent, child, index);
        Ok(())
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> DocResult<()> {
        let index = self.node(parent)?.children.len();
        self.insert_child(parent, index, child)
    }

    /// Removes `id` and its whole subtree.
    pub fn remove(&mut self, id: NodeId) -> DocResult<()> {
        if id == self.root {
            return Err(DocumentError::invariant("the root cannot be removed"));
        }
        self.node(id)?;
        self.detach(id);
        for n in self.subtree(id) {
            self.nodes.remove(&n);
        }
        Ok(())
    }

    /// Moves `parent.children[range]` to `dest` at `dest_index`.
    ///
    /// `dest_index` is interpreted after the range has been taken out of `parent`.
    pub fn move_range(
        &mut self,
        parent: NodeId,
        range: Range<usize>,
        dest: NodeId,
        dest_index: usize,
    ) -> DocResult<()> {
        let siblings = &self.node(parent)?.children;
        if range.start > range.end || range.end > siblings.len() {
            return Err(DocumentError::invariant(format!(
                "range {range:?} out of bounds for {parent}"
            )));
        }
        let moved: Vec<NodeId> = siblings[range.clone()].to_vec();
        let dest_node = self.node(dest)?;
        for m in &moved {
            if *m == dest || self.is_ancestor(*m, dest) {
                return Err(DocumentError::invariant(format!(
                    "moving {m} under {dest} would create a cycle"
                )));
            }
            if !dest_node.kind.accepts_child(&self.node(*m)?.kind) {
                return Err(DocumentError::invariant(format!(
                    "{} cannot contain {}",
                    dest_node.kind.tag(),
                    self.node(*m)?.kind.tag()
                )));
            }
        }
        let remaining = if dest == parent {
            siblings.len() - moved.len()
        } else {
            dest_node.children.len()
        };
        if dest_index > remaining {
            return Err(DocumentError::invariant(format!(
                "index {dest_index} out of bounds for {dest}"
            )));
        }

        self.node_mut(parent)?.children.drain(range);
        for (offset, m) in moved.iter().enumerate() {
            if let Some(node) = self.nodes.get_mut(m) {
                node.parent = None;
            }
            self.attach(dest, *m, dest_index + offset);
        }
        Ok(())
    }

    /// Replaces `id` by its children in the parent. Returns the range the children now occupy.
    pub fn unwrap(&mut self, id: NodeId) -> DocResult<Range<usize>> {
        let node = self.node(id)?;
        let parent = node
            .parent
            .ok_or_else(|| DocumentError::invariant(format!("{id} has no parent")))?;
        let parent_kind = &self.node(parent)?.kind;
        for c in &node.children {
            if !parent_kind.accepts_child(&self.node(*c)?.kind) {
                return Err(DocumentError::invariant(format!(
                    "unwrapping {id} would place {} under {}",
                    self.node(*c)?.kind.tag(),
                    parent_kind.tag()
                )));
            }
        }
        let children = node.children.clone();
        let index = self.index_in_parent(id).unwrap_or(0);

        for c in &children {
            if let Some(n) = self.nodes.get_mut(c) {
                n.parent = Some(parent);
            }
        }
        let siblings = &mut self.node_mut(parent)?.children;
        siblings.splice(index..index + 1, children.iter().copied());
        self.nodes.remove(&id);
        Ok(index..index + children.len())
    }

    /// Wraps `parent.children[range]` in a new node of `kind`.
    pub fn wrap_children(
        &mut self,
        parent: NodeId,
        range: Range<usize>,
        kind: NodeKind,
    ) -> DocResult<NodeId> {
        let parent_node = self.node(parent)?;
        if range.is_empty() || range.end > parent_node.children.len() {
            return Err(DocumentError::invariant(format!(
                "cannot wrap range {range:?} of {parent}"
            )));
        }
        if !parent_node.kind.accepts_child(&kind) {
            return Err(DocumentError::invariant(format!(
                "{} cannot contain {}",
                parent_node.kind.tag(),
                kind.tag()
            )));
        }
        for c in &parent_node.children[range.clone()] {
            if !kind.accepts_child(&self.node(*c)?.kind) {
                return Err(DocumentError::invariant(format!(
                    "{} cannot contain {}",
                    kind.tag(),
                    self.node(*c)?.kind.tag()
                )));
            }
        }
        let wrapper = self.create(kind);
        let start = range.start;
        self.move_range(parent, range, wrapper, 0)?;
        self.attach(parent, wrapper, start);
        Ok(wrapper)
    }

    /// Replaces a detached-compatible node in place with a fresh node of `kind`.
    pub(crate) fn replace_leaf(&mut self, id: NodeId, kind: NodeKind) -> DocResult<NodeId> {
        let parent = self
            .parent(id)
            .ok_or_else(|| DocumentError::invariant(format!("{id} has no parent")))?;
        let index = self.index_in_parent(id).unwrap_or(0);
        let fresh = self.create(kind);
        self.remove(id)?;
        self.insert_child(parent, index, fresh)?;
        Ok(fresh)
    }

    /// Applies `f` to a draft copy and commits it only if `f` succeeds.
    pub fn update<T, F>(&mut self, f: F) -> DocResult<T>
    where
        F: FnOnce(&mut Document) -> DocResult<T>,
    {
        let mut draft = self.clone();
        let out = f(&mut draft)?;
        *self = draft;
        Ok(out)
    }

    pub(crate) fn attach(&mut self, parent: NodeId, child: NodeId, index: usize) {
        if let Some(node) = self.nodes.get_mut(&child) {
            node.parent = Some(parent);
        }
        if let Some(node) = self.nodes.get_mut(&parent) {
            let index = index.min(node.children.len());
            node.children.insert(index, child);
        }
    }

    pub(crate) fn detach(&mut self, id: NodeId) -> Option<usize> {
        let parent = self.nodes.get_mut(&id)?.parent.take()?;
        let siblings = &mut self.nodes.get_mut(&parent)?.children;
        let index = siblings.iter().position(|c| *c == id)?;
        siblings.remove(index);
        Some(index)
    }

    // ─── Snapshots ─────────────────────────────────────────────

    pub fn serialize(&self) -> TreeSnapshot {
        let nodes = self
            .pre_order()
            .into_iter()
            .filter_map(|id| self.nodes.get(&id))
            .map(|n| SnapshotNode {
                id: n.id,
                kind: n.kind.clone(),
                children: n.children.clone(),
            })
            .collect();
        TreeSnapshot {
            root: self.root,
            next_id: self.next_id,
            nodes,
        }
    }

    /// Rebuilds a document, rejecting anything that is not a single well-formed tree.
    pub fn deserialize(snapshot: TreeSnapshot) -> DocResult<Self> {
        let mut nodes: HashMap<NodeId, Node> = HashMap::with_capacity(snapshot.nodes.len());
        for entry in snapshot.nodes {
            if entry.id.0 >= snapshot.next_id {
                return Err(DocumentError::malformed(format!(
                    "node {} is not below next_id {}",
                    entry.id, snapshot.next_id
                )));
            }
            let mut node = Node::new(entry.id, entry.kind);
            node.children = entry.children;
            if nodes.insert(entry.id, node).is_some() {
                return Err(DocumentError::malformed(format!(
                    "duplicate node {}",
                    entry.id
                )));
            }
        }

        let root_kind = nodes
            .get(&snapshot.root)
            .map(|n| &n.kind)
            .ok_or_else(|| DocumentError::malformed("missing root node"))?;
        if *root_kind != NodeKind::element(ElementKind::Document) {
            return Err(DocumentError::malformed("root is not a document element"));
        }

        let mut parents: HashMap<NodeId, NodeId> = HashMap::new();
        for node in nodes.values() {
            for child in &node.children {
                let child_kind = nodes
                    .get(child)
                    .map(|n| &n.kind)
                    .ok_or_else(|| {
                        DocumentError::malformed(format!(
                            "{} references missing child {child}",
                            node.id
                        ))
                    })?;
                if !node.kind.accepts_child(child_kind) {
                    return Err(DocumentError::malformed(format!(
                        "{} cannot contain {}",
                        node.kind.tag(),
                        child_kind.tag()
                    )));
                }
                if parents.insert(*child, node.id).is_some() {
                    return Err(DocumentError::malformed(format!(
                        "{child} has more than one parent"
                    )));
                }
            }
        }
        if parents.contains_key(&snapshot.root) {
            return Err(DocumentError::malformed("root has a parent"));
        }
        for (child, parent) in &parents {
            if let Some(node) = nodes.get_mut(child) {
                node.parent = Some(*parent);
            }
        }

        let doc = Document {
            nodes,
            root: snapshot.root,
            next_id: snapshot.next_id,
        };

        let reachable: HashSet<NodeId> = doc.pre_order().into_iter().collect();
        if reachable.len() != doc.nodes.len() {
            return Err(DocumentError::malformed(
                "document contains unreachable nodes or cycles",
            ));
        }
        for node in doc.nodes.values() {
            if let NodeKind::CommentAnchor { comment_id } = node.kind {
                if doc.text_of(node.id).is_empty() {
                    return Err(DocumentError::malformed(format!(
                        "comment anchor for {comment_id} covers no content"
                    )));
                }
            }
        }
        Ok(doc)
    }

    pub fn to_json(&self) -> DocResult<String> {
        Ok(serde_json::to_string(&self.serialize())?)
    }

    pub fn from_json(json: &str) -> DocResult<Self> {
        let snapshot: TreeSnapshot = serde_json::from_str(json)?;
        Self::deserialize(snapshot)
    }
}
