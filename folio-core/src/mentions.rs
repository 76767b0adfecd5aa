//! `@` mention detection, filtering, and insertion.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DocumentError, MentionError};
use crate::node::NodeKind;
use crate::tree::Document;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MentionCandidate {
    pub user_id: Uuid,
    pub display_name: String,
}

/// An active `@query`: the trigger offset, the caret, and the text in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionQuery {
    pub trigger: usize,
    pub caret: usize,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct MentionState {
    tenant_id: Option<Uuid>,
    candidates: Vec<MentionCandidate>,
    query: Option<MentionQuery>,
    selected: usize,
}

impl MentionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the candidate list for `tenant_id`. Returns false when nothing changed.
    pub fn refresh(&mut self, tenant_id: Uuid, candidates: Vec<MentionCandidate>) -> bool {
        if self.tenant_id == Some(tenant_id) && self.candidates == candidates {
            return false;
        }
        self.tenant_id = Some(tenant_id);
        self.candidates = candidates;
        self.selected = 0;
        true
    }

    pub fn tenant_id(&self) -> Option<Uuid> {
        self.tenant_id
    }

    pub fn candidates(&self) -> &[MentionCandidate] {
        &self.candidates
    }

    pub fn query(&self) -> Option<&MentionQuery> {
        self.query.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.query.is_some()
    }

    pub fn selected_index(&self) -> usize {
        self.selected
    }

    /// Re-evaluates the query after a content change with the caret at `caret`.
    ///
    /// Only the text leaf holding the caret is searched, back to its last `@`.
    pub fn detect(&mut self, doc: &Document, caret: usize) -> Option<&MentionQuery> {
        let found = doc
            .leaves()
            .into_iter()
            .filter(|l| l.start < caret && caret <= l.end())
            .find_map(|l| match doc.kind(l.id) {
                Some(NodeKind::Text { content, .. }) => {
                    let before: String = content.chars().take(caret - l.start).collect();
                    let at = before.rfind('@')?;
                    let text = &before[at + 1..];
                    if text.chars().any(char::is_whitespace) {
                        return None;
                    }
                    Some(MentionQuery {
                        trigger: l.start + before[..at].chars().count(),
                        caret,
                        text: text.to_string(),
                    })
                }
                _ => None,
            });

        let changed = found.as_ref().map(|q| &q.text) != self.query.as_ref().map(|q| &q.text);
        if changed {
            self.selected = 0;
        }
        self.query = found;
        self.query.as_ref()
    }

    /// Candidates whose display name contains the query, ignoring case.
    pub fn suggestions(&self) -> Vec<&MentionCandidate> {
        let Some(query) = &self.query else {
            return Vec::new();
        };
        let needle = query.text.to_lowercase();
        self.candidates
            .iter()
            .filter(|c| c.display_name.to_lowercase().contains(&needle))
            .collect()
    }

    pub fn move_down(&mut self) {
        let n = self.suggestions().len();
        if n > 0 {
            self.selected = (self.selected + 1) % n;
        }
    }

    pub fn move_up(&mut self) {
        let n = self.suggestions().len();
        if n > 0 {
            self.selected = (self.selected + n - 1) % n;
        }
    }

    /// Drops the active query; the document is not touched.
    pub fn escape(&mut self) {
        self.query = None;
        self.selected = 0;
    }

    /// Inserts the selected suggestion. Returns the caret after the mention.
    pub fn commit(&mut self, doc: &mut Document) -> Result<usize, MentionError> {
        if self.query.is_none() {
            return Err(MentionError::NoActiveQuery);
        }
        let candidate = self
            .suggestions()
            .get(self.selected)
            .map(|c| (*c).clone())
            .ok_or(MentionError::NoCandidate)?;
        self.commit_candidate(doc, &candidate)
    }

    /// Replaces `@query` with a mention of `candidate`.
    pub fn commit_candidate(
        &mut self,
        doc: &mut Document,
        candidate: &MentionCandidate,
    ) -> Result<usize, MentionError> {
        let query = self.query.clone().ok_or(MentionError::NoActiveQuery)?;
        let caret = doc.update(|d| {
            let leaf = d
                .leaves()
                .into_iter()
                .find(|l| {
                    l.start <= query.trigger
                        && query.caret <= l.end()
                        && matches!(d.kind(l.id), Some(NodeKind::Text { .. }))
                })
                .ok_or_else(|| {
                    DocumentError::invariant("mention query no longer matches the document")
                })?;
            if !d.text_of(leaf.id).chars().nth(query.trigger - leaf.start).is_some_and(|c| c == '@') {
                return Err(DocumentError::invariant("mention trigger moved"));
            }
            if query.caret < leaf.end() {
                d.split_text(leaf.id, query.caret - leaf.start)?;
            }
            let target = if query.trigger > leaf.start {
                d.split_text(leaf.id, query.trigger - leaf.start)?
            } else {
                leaf.id
            };
            let mention = d.replace_leaf(
                target,
                NodeKind::mention(candidate.user_id, &candidate.display_name),
            )?;
            let (start, len) = d
                .span_of(mention)
                .ok_or_else(|| DocumentError::invariant("mention left the document"))?;
            Ok(start + len)
        })?;
        self.escape();
        Ok(caret)
    }
}
