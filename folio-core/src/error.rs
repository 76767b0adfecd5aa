//! Error types for the document core.

use thiserror::Error;
use uuid::Uuid;

/// Failures of tree operations and snapshot decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    /// A serialized document could not be turned back into a valid tree.
    #[error("malformed document: {0}")]
    MalformedDocument(String),
    /// An operation would break a structural invariant; the tree is left untouched.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl DocumentError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        DocumentError::MalformedDocument(msg.into())
    }

    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        DocumentError::InvariantViolation(msg.into())
    }
}

impl From<serde_json::Error> for DocumentError {
    fn from(e: serde_json::Error) -> Self {
        DocumentError::MalformedDocument(e.to_string())
    }
}

pub type DocResult<T> = Result<T, DocumentError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommentError {
    #[error("comment requires a non-empty selection")]
    CollapsedSelection,
    #[error("comment selection spans more than one block")]
    SpansBlocks,
    #[error("comment body is empty")]
    EmptyBody,
    #[error("unknown comment {0}")]
    UnknownComment(Uuid),
    #[error(transparent)]
    Document(#[from] DocumentError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MentionError {
    #[error("no mention query is active")]
    NoActiveQuery,
    #[error("no candidate matches the current query")]
    NoCandidate,
    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// Failures of the replicated document state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicaError {
    #[error("failed to decode replica payload: {0}")]
    Decode(String),
    #[error("failed to apply replica update: {0}")]
    Apply(String),
}

impl From<yrs::encoding::read::Error> for ReplicaError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        ReplicaError::Decode(e.to_string())
    }
}
