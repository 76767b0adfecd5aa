//! Per-document broadcast channel.
//!
//! ```text
//!   Disconnected ──connect()──▶ Connecting ──join ok──▶ Connected
//!        ▲                          │                       │
//!        └────────── join failed ───┘◀── transport error ───┘
//!                                       or disconnect()
//! ```
//!
//! Reconnecting is always a new `connect()` call, which joins the topic
//! afresh; a membership is never reused after a failure.

use log::{debug, info, trace, warn};
use uuid::Uuid;

use crate::broadcast::{BroadcastHub, ChannelError, TopicMembership};
use crate::protocol::{document_topic, BroadcastEnvelope, BroadcastPayload, Frame, PresenceMeta};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Something a remote participant did, already filtered for self-echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Cursor {
        user_id: Uuid,
        position: usize,
    },
    Selection {
        user_id: Uuid,
        from: usize,
        to: usize,
    },
    /// Full content from another session, to be applied locally.
    ApplyContent {
        origin_user_id: Uuid,
        content: String,
        timestamp: u64,
    },
    ReplicaUpdate {
        origin_user_id: Uuid,
        update: Vec<u8>,
    },
    PresenceSync(Vec<PresenceMeta>),
}

pub struct DocumentChannel {
    hub: BroadcastHub,
    document_id: Uuid,
    user_id: Uuid,
    display_name: String,
    state: ConnectionState,
    membership: Option<TopicMembership>,
    last_applied: Option<String>,
}

impl DocumentChannel {
    pub fn new(
        hub: BroadcastHub,
        document_id: Uuid,
        user_id: Uuid,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            hub,
            document_id,
            user_id,
            display_name: display_name.into(),
            state: ConnectionState::Disconnected,
            membership: None,
            last_applied: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn topic(&self) -> String {
        document_topic(self.document_id)
    }

    /// Joins the document topic with a fresh membership and tracks presence.
    pub async fn connect(&mut self, now: u64) -> Result<(), ChannelError> {
        self.membership = None;
        self.state = ConnectionState::Connecting;
        let topic = self.topic();
        debug!("{topic}: connecting as {}", self.user_id);

        let mut membership = match self.hub.join(&topic).await {
            Ok(m) => m,
            Err(e) => {
                warn!("{topic}: join failed: {e}");
                self.state = ConnectionState::Disconnected;
                return Err(e);
            }
        };
        let meta = PresenceMeta {
            user_id: self.user_id,
            display_name: Some(self.display_name.clone()),
            joined_at: now,
        };
        if let Err(e) = membership.track(meta) {
            warn!("{topic}: presence track failed: {e}");
            self.state = ConnectionState::Disconnected;
            return Err(e);
        }
        self.membership = Some(membership);
        self.state = ConnectionState::Connected;
        info!("{topic}: connected");
        Ok(())
    }

    /// Leaves the topic. Dropping the membership untracks presence.
    pub fn disconnect(&mut self) {
        if self.membership.take().is_some() {
            info!("{}: disconnected", self.topic());
        }
        self.state = ConnectionState::Disconnected;
    }

    fn fail(&mut self, error: &ChannelError) {
        warn!("{}: channel failed: {error}", self.topic());
        self.membership = None;
        self.state = ConnectionState::Disconnected;
    }

    fn send(&mut self, payload: BroadcastPayload, now: u64) -> Result<(), ChannelError> {
        let envelope = BroadcastEnvelope {
            origin_user_id: self.user_id,
            document_id: self.document_id,
            payload,
            timestamp: now,
        };
        let result = match &self.membership {
            Some(m) if self.state == ConnectionState::Connected => m.send(envelope),
            _ => return Err(ChannelError::NotConnected),
        };
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    pub fn send_cursor(&mut self, position: usize, now: u64) -> Result<(), ChannelError> {
        self.send(BroadcastPayload::Cursor { position }, now)
    }

    pub fn send_selection(&mut self, from: usize, to: usize, now: u64) -> Result<(), ChannelError> {
        self.send(BroadcastPayload::Selection { from, to }, now)
    }

    /// Broadcasts full content. Returns false, without sending, when `content`
    /// is exactly what was last applied from a remote session.
    pub fn send_content(&mut self, content: &str, now: u64) -> Result<bool, ChannelError> {
        if self.last_applied.as_deref() == Some(content) {
            debug!("{}: not rebroadcasting applied content", self.topic());
            return Ok(false);
        }
        self.send(
            BroadcastPayload::Content {
                content: content.to_string(),
            },
            now,
        )?;
        Ok(true)
    }

    pub fn send_replica_update(&mut self, update: Vec<u8>, now: u64) -> Result<(), ChannelError> {
        if update.is_empty() {
            return Ok(());
        }
        self.send(BroadcastPayload::ReplicaUpdate { update }, now)
    }

    /// Drains every buffered frame into events.
    pub fn poll(&mut self) -> Result<Vec<ChannelEvent>, ChannelError> {
        let mut events = Vec::new();
        loop {
            let next = match self.membership.as_mut() {
                Some(m) => m.try_recv(),
                None => return Err(ChannelError::NotConnected),
            };
            match next {
                Ok(Some(frame)) => {
                    if let Some(event) = self.handle(frame) {
                        events.push(event);
                    }
                }
                Ok(None) => return Ok(events),
                Err(e) => {
                    self.fail(&e);
                    return Err(e);
                }
            }
        }
    }

    /// Waits for the next event from another participant.
    pub async fn next_event(&mut self) -> Result<ChannelEvent, ChannelError> {
        loop {
            let next = match self.membership.as_mut() {
                Some(m) => m.recv().await,
                None => return Err(ChannelError::NotConnected),
            };
            match next {
                Ok(frame) => {
                    if let Some(event) = self.handle(frame) {
                        return Ok(event);
                    }
                }
                Err(e) => {
                    self.fail(&e);
                    return Err(e);
                }
            }
        }
    }

    fn handle(&mut self, frame: Frame) -> Option<ChannelEvent> {
        let envelope = match frame {
            Frame::Broadcast(envelope) => envelope,
            Frame::PresenceSync(members) => return Some(ChannelEvent::PresenceSync(members)),
            Frame::Shutdown => return None,
        };
        if envelope.origin_user_id == self.user_id {
            trace!("{}: dropping own {}", self.topic(), envelope.payload.kind());
            return None;
        }
        if envelope.document_id != self.document_id {
            warn!(
                "{}: ignoring broadcast for document {}",
                self.topic(),
                envelope.document_id
            );
            return None;
        }
        let origin_user_id = envelope.origin_user_id;
        Some(match envelope.payload {
            BroadcastPayload::Cursor { position } => ChannelEvent::Cursor {
                user_id: origin_user_id,
                position,
            },
            BroadcastPayload::Selection { from, to } => ChannelEvent::Selection {
                user_id: origin_user_id,
                from,
                to,
            },
            BroadcastPayload::Content { content } => {
                self.last_applied = Some(content.clone());
                ChannelEvent::ApplyContent {
                    origin_user_id,
                    content,
                    timestamp: envelope.timestamp,
                }
            }
            BroadcastPayload::ReplicaUpdate { update } => ChannelEvent::ReplicaUpdate {
                origin_user_id,
                update,
            },
        })
    }
}

impl Drop for DocumentChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}
