//! Replicated document state.
//!
//! Every participant holds a [`ReplicatedDocument`]: a yrs `Doc` with two
//! shared types. The `content` text mirrors the plain text of the local tree
//! and merges character by character. The `structure` map holds the
//! serialized tree (tracked changes, marks, block kinds, mentions, anchors)
//! under one key, last writer wins. A stored tree is only trusted while its
//! plain text equals `content`.
//!
//! Local edits are encoded as incremental updates for broadcast; remote
//! updates are merged commutatively and idempotently, so replicas that saw the
//! same set of updates converge regardless of delivery order.
//!
//! Undo history only records local edits to `content`. Merged remote updates
//! are never undone by a local undo.

use std::time::{Duration, Instant};

use uuid::Uuid;
use yrs::types::{Map, MapRef};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Doc, GetString, Out, ReadTxn, StateVector, Text, TextRef, Transact, UndoManager, Update,
};

use crate::error::ReplicaError;
use crate::inline::{byte_index, PlainSplice};

/// Name of the shared text every replica edits.
pub const CONTENT_FIELD: &str = "content";

/// Name of the shared map holding the serialized tree.
pub const STRUCTURE_FIELD: &str = "structure";

const TREE_KEY: &str = "tree";

/// Transaction origin of local edits; the undo manager tracks only this origin.
const LOCAL_ORIGIN: &str = "folio-local";

pub struct ReplicatedDocument {
    document_id: Uuid,
    doc: Doc,
    content: TextRef,
    structure: MapRef,
    undo: Option<UndoManager>,
    dirty: bool,
}

impl ReplicatedDocument {
    pub fn new(document_id: Uuid) -> Self {
        let doc = Doc::new();
        let content = doc.get_or_insert_text(CONTENT_FIELD);
        let structure = doc.get_or_insert_map(STRUCTURE_FIELD);
        let mut undo = UndoManager::new(&doc, &content);
        undo.include_origin(LOCAL_ORIGIN);
        Self {
            document_id,
            doc,
            content,
            structure,
            undo: Some(undo),
            dirty: false,
        }
    }

    /// Builds a replica from a persisted full-state update.
    pub fn from_state(document_id: Uuid, state: &[u8]) -> Result<Self, ReplicaError> {
        let mut replica = Self::new(document_id);
        replica.merge(state)?;
        replica.dirty = false;
        Ok(replica)
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        self.content.get_string(&txn)
    }

    /// The serialized tree last stored by any replica, if one was stored.
    pub fn tree(&self) -> Option<String> {
        let txn = self.doc.transact();
        match self.structure.get(&txn, TREE_KEY) {
            Some(Out::Any(Any::String(tree))) => Some(tree.to_string()),
            _ => None,
        }
    }

    // ─── Local edits ───────────────────────────────────────────

    /// Inserts at char offset `at`. Returns the update to broadcast.
    pub fn insert_text(&mut self, at: usize, text: &str) -> Vec<u8> {
        let current = self.text();
        let at = at.min(current.chars().count());
        let splice = PlainSplice {
            start: at,
            deleted: 0,
            inserted: text.to_string(),
        };
        self.write(&current, Some(splice), None, true)
    }

    /// Deletes chars `[from, to)`. Returns the update to broadcast.
    pub fn delete_range(&mut self, from: usize, to: usize) -> Vec<u8> {
        let current = self.text();
        let len = current.chars().count();
        let (from, to) = (from.min(to).min(len), to.max(from).min(len));
        let splice = PlainSplice {
            start: from,
            deleted: to - from,
            inserted: String::new(),
        };
        self.write(&current, Some(splice), None, true)
    }

    /// Rewrites the content to `text` with a minimal splice.
    ///
    /// Returns `None` when the text is already equal.
    pub fn replace_text(&mut self, text: &str) -> Option<Vec<u8>> {
        let current = self.text();
        let splice = PlainSplice::between(&current, text)?;
        Some(self.write(&current, Some(splice), None, true))
    }

    /// Rewrites the content to `text` and stores `tree` beside it in one
    /// local transaction. Returns `None` when neither changed.
    pub fn replace_document(&mut self, text: &str, tree: &str) -> Option<Vec<u8>> {
        let current = self.text();
        let splice = PlainSplice::between(&current, text);
        let update = self.write(&current, splice, Some(tree), true);
        (!update.is_empty()).then_some(update)
    }

    /// Stores `tree` without touching the content.
    pub fn store_tree(&mut self, tree: &str) -> Option<Vec<u8>> {
        let current = self.text();
        let update = self.write(&current, None, Some(tree), true);
        (!update.is_empty()).then_some(update)
    }

    /// Like [`replace_document`](Self::replace_document), for a document that
    /// arrived from another session. Undo never reverts it. Returns true if
    /// anything changed.
    pub fn adopt_document(&mut self, text: &str, tree: &str) -> bool {
        let current = self.text();
        let splice = PlainSplice::between(&current, text);
        !self.write(&current, splice, Some(tree), false).is_empty()
    }

    /// Applies a content splice and a tree in one transaction. Unchanged parts
    /// are skipped; an empty update means nothing was written.
    fn write(
        &mut self,
        current: &str,
        splice: Option<PlainSplice>,
        tree: Option<&str>,
        local: bool,
    ) -> Vec<u8> {
        let splice = splice.filter(|s| s.deleted > 0 || !s.inserted.is_empty());
        let stored = self.tree();
        let tree = tree.filter(|t| stored.as_deref() != Some(*t));
        if splice.is_none() && tree.is_none() {
            return Vec::new();
        }
        let update = {
            let mut txn = if local {
                self.doc.transact_mut_with(LOCAL_ORIGIN)
            } else {
                self.doc.transact_mut()
            };
            if let Some(splice) = splice {
                let start = byte_index(current, splice.start) as u32;
                let end = byte_index(current, splice.start + splice.deleted) as u32;
                if end > start {
                    self.content.remove_range(&mut txn, start, end - start);
                }
                if !splice.inserted.is_empty() {
                    self.content.insert(&mut txn, start, &splice.inserted);
                }
            }
            if let Some(tree) = tree {
                self.structure.insert(&mut txn, TREE_KEY, tree.to_string());
            }
            txn.encode_update_v1()
        };
        self.dirty = true;
        update
    }

    // ─── Sync ──────────────────────────────────────────────────

    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Full state as a single update, suitable for persistence.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Everything this replica has that a peer with `remote_sv` lacks.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let sv = StateVector::decode_v1(remote_sv)?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Merges a remote update. Returns true when it contributed anything new.
    ///
    /// Remote merges run outside the local origin so undo never reverts them.
    pub fn merge(&mut self, update: &[u8]) -> Result<bool, ReplicaError> {
        let update = Update::decode_v1(update)?;
        let before = self.doc.transact().state_vector();
        let text_before = self.text();
        {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| ReplicaError::Apply(e.to_string()))?;
        }
        // A pure deletion leaves the state vector untouched.
        let changed =
            self.doc.transact().state_vector() != before || self.text() != text_before;
        if changed {
            self.dirty = true;
        }
        Ok(changed)
    }

    // ─── Undo ──────────────────────────────────────────────────

    /// Reverts the latest local edit group. Returns true if the content changed.
    pub fn undo(&mut self) -> bool {
        let before = self.text();
        match self.undo.as_mut() {
            Some(mgr) => {
                let _ = mgr.undo_blocking();
            }
            None => return false,
        }
        let changed = self.text() != before;
        if changed {
            self.dirty = true;
        }
        changed
    }

    pub fn redo(&mut self) -> bool {
        let before = self.text();
        match self.undo.as_mut() {
            Some(mgr) => {
                let _ = mgr.redo_blocking();
            }
            None => return false,
        }
        let changed = self.text() != before;
        if changed {
            self.dirty = true;
        }
        changed
    }

    pub fn can_undo(&self) -> bool {
        self.undo.as_ref().is_some_and(|m| m.can_undo())
    }

    pub fn can_redo(&self) -> bool {
        self.undo.as_ref().is_some_and(|m| m.can_redo())
    }

    /// Closes the current undo group so the next edit starts a new one.
    pub fn checkpoint(&mut self) {
        if let Some(mgr) = self.undo.as_mut() {
            mgr.reset();
        }
    }

    /// Drops undo history. Later edits are no longer undoable.
    pub fn release_undo(&mut self) {
        self.undo = None;
    }

    // ─── Snapshots ─────────────────────────────────────────────

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Flags the state as unsaved again after a failed persist.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Full state for persistence if anything changed since the last snapshot.
    pub fn take_snapshot(&mut self) -> Option<Vec<u8>> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(self.encode_state())
    }
}

/// Fixed-interval snapshot timer. A snapshot is due only when the replica is dirty.
#[derive(Debug, Clone)]
pub struct SnapshotSchedule {
    interval: Duration,
    last: Instant,
}

impl SnapshotSchedule {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self { interval, last: now }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn due(&self, now: Instant, dirty: bool) -> bool {
        dirty && now.saturating_duration_since(self.last) >= self.interval
    }

    pub fn mark(&mut self, now: Instant) {
        self.last = now;
    }
}
