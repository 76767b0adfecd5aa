//! Node kinds for the structured document tree.
//!
//! Nodes live in an arena owned by [`crate::Document`] and refer to each
//! other by [`NodeId`]. The kind is a closed sum type; behaviour that differs
//! per kind (`accepts_child`, `can_contain_text`, `tag`, ...) is an explicit
//! match per operation.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable arena identifier of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub(crate) u64);

impl NodeId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

bitflags! {
    /// Inline formatting flags carried by text leaves.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Marks: u8 {
        const BOLD = 1;
        const ITALIC = 1 << 1;
        const UNDERLINE = 1 << 2;
        const STRIKE = 1 << 3;
        const CODE = 1 << 4;
    }
}

/// Block and container element kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElementKind {
    Document,
    Paragraph,
    Heading { level: u8 },
    Blockquote,
    CodeBlock,
    BulletList,
    OrderedList,
    ListItem,
    Table,
    TableRow,
    TableCell,
}

impl ElementKind {
    /// Text blocks hold inline content directly; every other element holds blocks.
    pub fn is_text_block(self) -> bool {
        matches!(
            self,
            ElementKind::Paragraph | ElementKind::Heading { .. } | ElementKind::CodeBlock
        )
    }
}

/// Who proposed a tracked change, and when (milliseconds since the epoch).
///
/// Coalesced edits move `timestamp` forward, so it records the latest edit
/// folded into the wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMeta {
    pub author_id: Uuid,
    pub author_name: String,
    pub timestamp: u64,
}

/// Which side of review a tracked wrapper represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Delete,
}

/// The tagged node variants of the document tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Text {
        content: String,
        #[serde(default)]
        marks: Marks,
    },
    Element {
        element: ElementKind,
    },
    TrackedInsert(ChangeMeta),
    TrackedDelete(ChangeMeta),
    CommentAnchor {
        comment_id: Uuid,
    },
    Mention {
        user_id: Uuid,
        label: String,
    },
}

impl NodeKind {
    pub fn text(content: impl Into<String>) -> Self {
        NodeKind::Text {
            content: content.into(),
            marks: Marks::empty(),
        }
    }

    pub fn marked_text(content: impl Into<String>, marks: Marks) -> Self {
        NodeKind::Text {
            content: content.into(),
            marks,
        }
    }

    pub fn element(element: ElementKind) -> Self {
        NodeKind::Element { element }
    }

    pub fn paragraph() -> Self {
        NodeKind::Element {
            element: ElementKind::Paragraph,
        }
    }

    /// A mention leaf; the rendered label is `@` followed by the display name.
    pub fn mention(user_id: Uuid, display_name: &str) -> Self {
        NodeKind::Mention {
            user_id,
            label: format!("@{display_name}"),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, NodeKind::Text { .. } | NodeKind::Mention { .. })
    }

    pub fn is_inline(&self) -> bool {
        !matches!(self, NodeKind::Element { .. })
    }

    pub fn is_inline_wrapper(&self) -> bool {
        matches!(
            self,
            NodeKind::TrackedInsert(_) | NodeKind::TrackedDelete(_) | NodeKind::CommentAnchor { .. }
        )
    }

    pub fn is_text_block(&self) -> bool {
        matches!(self, NodeKind::Element { element } if element.is_text_block())
    }

    /// Whether inline content (text, mentions, inline wrappers) may live directly under this node.
    pub fn can_contain_text(&self) -> bool {
        self.is_text_block() || self.is_inline_wrapper()
    }

    /// Structural contract between a parent kind and a child kind.
    ///
    /// Tracked wrappers never nest directly inside a wrapper of the same kind.
    pub fn accepts_child(&self, child: &NodeKind) -> bool {
        match self {
            NodeKind::Text { .. } | NodeKind::Mention { .. } => false,
            NodeKind::Element { element } if element.is_text_block() => child.is_inline(),
            NodeKind::Element { .. } => matches!(
                child,
                NodeKind::Element { element } if *element != ElementKind::Document
            ),
            NodeKind::TrackedInsert(_) => {
                child.is_inline() && !matches!(child, NodeKind::TrackedInsert(_))
            }
            NodeKind::TrackedDelete(_) => {
                child.is_inline() && !matches!(child, NodeKind::TrackedDelete(_))
            }
            NodeKind::CommentAnchor { .. } => child.is_inline(),
        }
    }

    /// Number of characters this node contributes to the inline offset space.
    pub fn visible_len(&self) -> usize {
        match self {
            NodeKind::Text { content, .. } => content.chars().count(),
            NodeKind::Mention { label, .. } => label.chars().count(),
            _ => 0,
        }
    }

    pub fn change(&self) -> Option<(ChangeKind, &ChangeMeta)> {
        match self {
            NodeKind::TrackedInsert(meta) => Some((ChangeKind::Insert, meta)),
            NodeKind::TrackedDelete(meta) => Some((ChangeKind::Delete, meta)),
            _ => None,
        }
    }

    /// Short tag used in markup rendering and diagnostics.
    pub fn tag(&self) -> &'static str {
        match self {
            NodeKind::Text { .. } => "text",
            NodeKind::Element { element } => match element {
                ElementKind::Document => "document",
                ElementKind::Paragraph => "p",
                ElementKind::Heading { .. } => "h",
                ElementKind::Blockquote => "blockquote",
                ElementKind::CodeBlock => "pre",
                ElementKind::BulletList => "ul",
                ElementKind::OrderedList => "ol",
                ElementKind::ListItem => "li",
                ElementKind::Table => "table",
                ElementKind::TableRow => "tr",
                ElementKind::TableCell => "td",
            },
            NodeKind::TrackedInsert(_) => "ins",
            NodeKind::TrackedDelete(_) => "del",
            NodeKind::CommentAnchor { .. } => "comment",
            NodeKind::Mention { .. } => "mention",
        }
    }
}

/// A node stored in the document arena.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) kind: NodeKind,
}

impl Node {
    pub(crate) fn new(id: NodeId, kind: NodeKind) -> Self {
        Self {
            id,
            parent: None,
            children: Vec::new(),
            kind,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> ChangeMeta {
        ChangeMeta {
            author_id: Uuid::new_v4(),
            author_name: "Alice".into(),
            timestamp: 1,
        }
    }

    #[test]
    fn test_text_block_accepts_inline_only() {
        let p = NodeKind::paragraph();
        assert!(p.accepts_child(&NodeKind::text("a")));
        assert!(p.accepts_child(&NodeKind::TrackedInsert(meta())));
        assert!(!p.accepts_child(&NodeKind::paragraph()));
    }

    #[test]
    fn test_container_accepts_blocks_only() {
        let list = NodeKind::element(ElementKind::BulletList);
        assert!(list.accepts_child(&NodeKind::element(ElementKind::ListItem)));
        assert!(!list.accepts_child(&NodeKind::text("a")));
        assert!(!list.accepts_child(&NodeKind::element(ElementKind::Document)));
    }

    #[test]
    fn test_same_kind_tracked_nesting_rejected() {
        let ins = NodeKind::TrackedInsert(meta());
        let del = NodeKind::TrackedDelete(meta());
        assert!(!ins.accepts_child(&NodeKind::TrackedInsert(meta())));
        assert!(!del.accepts_child(&NodeKind::TrackedDelete(meta())));
        assert!(del.accepts_child(&ins));
    }

    #[test]
    fn test_leaves_accept_nothing() {
        let mention = NodeKind::mention(Uuid::new_v4(), "Bob");
        assert!(!mention.accepts_child(&NodeKind::text("x")));
        assert!(!NodeKind::text("x").accepts_child(&NodeKind::text("y")));
    }

    #[test]
    fn test_visible_len_counts_chars() {
        assert_eq!(NodeKind::text("héllo").visible_len(), 5);
        assert_eq!(NodeKind::mention(Uuid::new_v4(), "Bob").visible_len(), 4);
        assert_eq!(NodeKind::paragraph().visible_len(), 0);
    }

    #[test]
    fn test_kind_serde_tagging() {
        let json = serde_json::to_string(&NodeKind::text("hi")).unwrap();
        assert!(json.contains("\"kind\":\"text\""));
        let back: NodeKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, NodeKind::text("hi"));

        let unknown = r#"{"kind":"hologram"}"#;
        assert!(serde_json::from_str::<NodeKind>(unknown).is_err());
    }
}
