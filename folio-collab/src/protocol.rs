//! Broadcast frames exchanged over a topic.
//!
//! Every frame is bincode-encoded and shared between subscribers as an
//! `Arc<Vec<u8>>`:
//!
//! ```text
//! Frame::Broadcast(envelope)   cursor / selection / content / replica update
//! Frame::PresenceSync(members) full presence state after any track/untrack
//! Frame::Shutdown              transport closed underneath the subscriber
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Topic carrying one document's broadcasts and presence.
pub fn document_topic(document_id: Uuid) -> String {
    format!("document-{document_id}")
}

/// Tenant-wide presence topic.
pub fn user_presence_topic(tenant_id: Uuid) -> String {
    format!("user_presence_{tenant_id}")
}

/// What a broadcast carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BroadcastPayload {
    Cursor { position: usize },
    Selection { from: usize, to: usize },
    /// Full serialized document content.
    Content { content: String },
    /// Incremental update of the replicated state.
    ReplicaUpdate { update: Vec<u8> },
}

impl BroadcastPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            BroadcastPayload::Cursor { .. } => "cursor",
            BroadcastPayload::Selection { .. } => "selection",
            BroadcastPayload::Content { .. } => "content",
            BroadcastPayload::ReplicaUpdate { .. } => "replica_update",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastEnvelope {
    pub origin_user_id: Uuid,
    pub document_id: Uuid,
    pub payload: BroadcastPayload,
    /// Milliseconds since the Unix epoch at the sender.
    pub timestamp: u64,
}

/// Presence state a member tracks on a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMeta {
    pub user_id: Uuid,
    /// Absent when the member has not published a profile; receivers look it up.
    pub display_name: Option<String>,
    pub joined_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Broadcast(BroadcastEnvelope),
    PresenceSync(Vec<PresenceMeta>),
    Shutdown,
}

impl Frame {
    #[inline(always)]
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    #[inline(always)]
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(frame)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}
