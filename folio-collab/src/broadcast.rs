//! In-process topic transport with tracked presence.
//!
//! A [`BroadcastHub`] maps topic names to tokio broadcast channels. Joining a
//! topic returns an owned [`TopicMembership`]; dropping it untracks the
//! member, so there is no separate unsubscribe bookkeeping. Every track or
//! untrack publishes the full member list as a [`Frame::PresenceSync`].
//!
//! Delivery is best-effort. A receiver that falls more than `capacity` frames
//! behind skips the frames it missed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace, warn};
use thiserror::Error;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{BroadcastEnvelope, Frame, PresenceMeta, ProtocolError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("transport is closed")]
    Closed,
    #[error("channel is not connected")]
    NotConnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, Default)]
pub struct TopicStats {
    pub frames_sent: u64,
    pub members: usize,
}

struct Topic {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    /// Presence keyed by membership, so one user may hold several memberships.
    presence: Mutex<HashMap<Uuid, PresenceMeta>>,
    frames_sent: AtomicU64,
}

impl Topic {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            presence: Mutex::new(HashMap::new()),
            frames_sent: AtomicU64::new(0),
        }
    }

    fn presence(&self) -> MutexGuard<'_, HashMap<Uuid, PresenceMeta>> {
        match self.presence.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn publish(&self, frame: &Frame) -> Result<usize, ProtocolError> {
        let encoded = Arc::new(frame.encode()?);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(self.sender.send(encoded).unwrap_or(0))
    }

    fn publish_presence(&self) -> Result<usize, ProtocolError> {
        let mut members: Vec<PresenceMeta> = self.presence().values().cloned().collect();
        members.sort_by_key(|m| (m.joined_at, m.user_id));
        self.publish(&Frame::PresenceSync(members))
    }
}

struct HubInner {
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    capacity: usize,
    closed: AtomicBool,
}

/// Shared handle to the topic transport. Cloning is cheap.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    /// `capacity` frames are buffered per subscriber before it starts lagging.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                topics: RwLock::new(HashMap::new()),
                capacity,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Subscribes to `topic`, creating it on first use.
    pub async fn join(&self, topic: &str) -> Result<TopicMembership, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let handle = self.topic(topic).await;
        let receiver = handle.sender.subscribe();
        debug!("joined topic {topic}");
        Ok(TopicMembership {
            hub: self.clone(),
            topic: handle,
            name: topic.to_string(),
            key: Uuid::new_v4(),
            receiver,
            tracked: false,
        })
    }

    async fn topic(&self, name: &str) -> Arc<Topic> {
        {
            let topics = self.inner.topics.read().await;
            if let Some(topic) = topics.get(name) {
                return topic.clone();
            }
        }
        let mut topics = self.inner.topics.write().await;
        let topic = topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Topic::new(self.inner.capacity)))
            .clone();
        topic
    }

    /// Simulates a transport failure: every membership errors from now on.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let topics = self.inner.topics.read().await;
        for (name, topic) in topics.iter() {
            if let Err(e) = topic.publish(&Frame::Shutdown) {
                warn!("failed to announce shutdown on {name}: {e}");
            }
        }
    }

    /// Brings a closed transport back. Old memberships stay dead.
    pub async fn reopen(&self) {
        let mut topics = self.inner.topics.write().await;
        topics.clear();
        self.inner.closed.store(false, Ordering::Release);
    }

    pub async fn stats(&self, topic: &str) -> TopicStats {
        let topics = self.inner.topics.read().await;
        let stats = match topics.get(topic) {
            Some(t) => TopicStats {
                frames_sent: t.frames_sent.load(Ordering::Relaxed),
                members: t.presence().len(),
            },
            None => TopicStats::default(),
        };
        stats
    }

    pub async fn members(&self, topic: &str) -> Vec<PresenceMeta> {
        let topics = self.inner.topics.read().await;
        let members = topics
            .get(topic)
            .map(|t| t.presence().values().cloned().collect())
            .unwrap_or_default();
        members
    }
}

/// A live subscription to one topic. Dropping it untracks presence.
pub struct TopicMembership {
    hub: BroadcastHub,
    topic: Arc<Topic>,
    name: String,
    key: Uuid,
    receiver: broadcast::Receiver<Arc<Vec<u8>>>,
    tracked: bool,
}

impl TopicMembership {
    pub fn topic(&self) -> &str {
        &self.name
    }

    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.hub.is_closed() {
            Err(ChannelError::Closed)
        } else {
            Ok(())
        }
    }

    /// Fire-and-forget. Returns how many subscribers were reached, self included.
    pub fn send(&self, envelope: BroadcastEnvelope) -> Result<usize, ChannelError> {
        self.ensure_open()?;
        trace!("{}: send {}", self.name, envelope.payload.kind());
        Ok(self.topic.publish(&Frame::Broadcast(envelope))?)
    }

    /// Publishes (or replaces) this member's presence state.
    pub fn track(&mut self, meta: PresenceMeta) -> Result<(), ChannelError> {
        self.ensure_open()?;
        self.topic.presence().insert(self.key, meta);
        self.tracked = true;
        self.topic.publish_presence()?;
        Ok(())
    }

    pub fn untrack(&mut self) {
        if !self.tracked {
            return;
        }
        self.tracked = false;
        self.topic.presence().remove(&self.key);
        if self.hub.is_closed() {
            return;
        }
        if let Err(e) = self.topic.publish_presence() {
            warn!("{}: presence sync after untrack failed: {e}", self.name);
        }
    }

    /// Waits for the next frame.
    pub async fn recv(&mut self) -> Result<Frame, ChannelError> {
        loop {
            self.ensure_open()?;
            match self.receiver.recv().await {
                Ok(bytes) => return self.decode(&bytes),
                Err(RecvError::Lagged(n)) => warn!("{}: lagged, skipped {n} frames", self.name),
                Err(RecvError::Closed) => return Err(ChannelError::Closed),
            }
        }
    }

    /// The next buffered frame, if any.
    pub fn try_recv(&mut self) -> Result<Option<Frame>, ChannelError> {
        loop {
            self.ensure_open()?;
            match self.receiver.try_recv() {
                Ok(bytes) => return self.decode(&bytes).map(Some),
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Lagged(n)) => {
                    warn!("{}: lagged, skipped {n} frames", self.name)
                }
                Err(TryRecvError::Closed) => return Err(ChannelError::Closed),
            }
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Frame, ChannelError> {
        match Frame::decode(bytes)? {
            Frame::Shutdown => Err(ChannelError::Closed),
            frame => Ok(frame),
        }
    }
}

impl Drop for TopicMembership {
    fn drop(&mut self) {
        self.untrack();
        debug!("left topic {}", self.name);
    }
}
