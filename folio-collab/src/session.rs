//! One user's editing session on one document.
//!
//! ```text
//!            local edit                          remote input
//!               │                                    │
//!               ▼                                    ▼
//!   TrackChanges ─▶ Document ◀── stored tree / sync_plain_text ── ReplicatedDocument ◀── ReplicaUpdate
//!                     │    ▲                                            ▲
//!                     │    └──── from_json ◀── ApplyContent (broadcast mode)
//!                     ▼
//!   replica.replace_document ──▶ DocumentChannel ──▶ peers
//!                     │
//!          SnapshotSchedule ──▶ DocumentStateStore
//! ```
//!
//! The replica carries both the plain text and the serialized tree, so
//! tracked changes, marks, and anchors survive persistence and reach
//! replicated peers. When concurrent structural edits leave the stored tree
//! behind the merged text, the session keeps its own tree, patches its text,
//! and publishes it as the new stored tree.
//!
//! The session owns the tree exclusively. Network and store results are
//! applied by the session's own methods, never from a callback. Store and
//! channel failures are logged, reported to the [`ErrorSink`], and editing
//! carries on against the in-memory state.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use uuid::Uuid;

use folio_core::track::{self, ReviewMode};
use folio_core::{
    now_millis, Author, CommentAuthor, CommentDraft, CommentError, CommentRecord,
    CommentThreads, DocResult, Document, MentionCandidate, MentionError, MentionState, NodeId,
    PendingChange, Reply, ReplicatedDocument, SnapshotSchedule, TrackChanges, TrackChangesConfig,
};

use crate::broadcast::{BroadcastHub, ChannelError, TopicMembership};
use crate::channel::{ChannelEvent, ConnectionState, DocumentChannel};
use crate::presence::PresenceRoom;
use crate::profiles::{ProfileCache, UserDirectory};
use crate::protocol::{user_presence_topic, PresenceMeta};
use crate::storage::{CommentStore, DocumentStateStore, ErrorSink};

/// How document content reaches other sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentSync {
    /// Full serialized tree on every change, last applied wins.
    Broadcast,
    /// Incremental updates of the replicated state.
    #[default]
    Replicated,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub document_id: Uuid,
    pub tenant_id: Uuid,
    pub user: CommentAuthor,
    pub content_sync: ContentSync,
    /// Minimum time between two persisted snapshots (default: 2s)
    pub snapshot_interval: Duration,
    /// How long a focused comment stays highlighted (default: 3s)
    pub highlight_duration: Duration,
    /// Same-author tracked edits closer than this share a wrapper (default: 2s)
    pub coalesce_window: Duration,
    /// Frames buffered per subscriber (default: 256)
    pub broadcast_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            document_id: Uuid::nil(),
            tenant_id: Uuid::nil(),
            user: CommentAuthor {
                id: Uuid::nil(),
                name: "anonymous".into(),
                avatar_ref: None,
            },
            content_sync: ContentSync::default(),
            snapshot_interval: Duration::from_secs(2),
            highlight_duration: Duration::from_secs(3),
            coalesce_window: Duration::from_millis(2000),
            broadcast_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub fn new(document_id: Uuid, tenant_id: Uuid, user: CommentAuthor) -> Self {
        Self {
            document_id,
            tenant_id,
            user,
            ..Self::default()
        }
    }

    /// Snapshots on every tick, small buffers.
    pub fn for_testing(document_id: Uuid, user: CommentAuthor) -> Self {
        Self {
            document_id,
            user,
            snapshot_interval: Duration::ZERO,
            broadcast_capacity: 64,
            ..Self::default()
        }
    }

    pub fn with_content_sync(mut self, content_sync: ContentSync) -> Self {
        self.content_sync = content_sync;
        self
    }

    /// A hub sized by this config.
    pub fn hub(&self) -> BroadcastHub {
        BroadcastHub::new(self.broadcast_capacity)
    }
}

/// External collaborators a session talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub hub: BroadcastHub,
    pub states: Arc<dyn DocumentStateStore>,
    pub comments: Arc<dyn CommentStore>,
    pub directory: Arc<dyn UserDirectory>,
    pub sink: Arc<dyn ErrorSink>,
}

impl Collaborators {
    /// Uses `store` for both document state and comments.
    pub fn new<S>(
        hub: BroadcastHub,
        store: Arc<S>,
        directory: Arc<dyn UserDirectory>,
        sink: Arc<dyn ErrorSink>,
    ) -> Self
    where
        S: DocumentStateStore + CommentStore + 'static,
    {
        Self {
            hub,
            states: store.clone(),
            comments: store,
            directory,
            sink,
        }
    }
}

pub struct EditorSession {
    config: SessionConfig,
    collab: Collaborators,
    document: Document,
    track: TrackChanges,
    comments: CommentThreads,
    mentions: MentionState,
    replica: ReplicatedDocument,
    schedule: SnapshotSchedule,
    channel: DocumentChannel,
    /// Membership in the tenant-wide presence topic while connected.
    tenant_presence: Option<TopicMembership>,
    presence: PresenceRoom,
    profiles: ProfileCache,
    caret: usize,
}

impl EditorSession {
    /// Loads persisted state, restores comment threads, and joins the
    /// document channel. Never fails: anything unavailable is reported and
    /// the session starts with what it has.
    pub async fn open(config: SessionConfig, collab: Collaborators) -> Self {
        let document_id = config.document_id;
        let replica = Self::load_replica(&config, &collab).await;
        let text = replica.text();
        let document =
            stored_tree(&replica, &text).unwrap_or_else(|| Document::from_plain_text(&text));
        info!(
            "opened session on {document_id} for {} ({} chars)",
            config.user.id,
            document.text_len()
        );

        let author = Author::new(config.user.id, config.user.name.clone());
        let track = TrackChanges::with_config(
            author,
            TrackChangesConfig {
                coalesce_window: config.coalesce_window,
            },
        );
        let channel = DocumentChannel::new(
            collab.hub.clone(),
            document_id,
            config.user.id,
            config.user.name.clone(),
        );
        let mut session = Self {
            comments: CommentThreads::with_highlight_duration(document_id, config.highlight_duration),
            mentions: MentionState::new(),
            schedule: SnapshotSchedule::new(config.snapshot_interval, Instant::now()),
            presence: PresenceRoom::new(config.user.id),
            profiles: ProfileCache::new(collab.directory.clone()),
            caret: document.text_len(),
            document,
            track,
            replica,
            channel,
            tenant_presence: None,
            config,
            collab,
        };
        session.restore_comments().await;
        session.refresh_candidates().await;
        session.connect().await;
        session
    }

    async fn load_replica(config: &SessionConfig, collab: &Collaborators) -> ReplicatedDocument {
        let document_id = config.document_id;
        match collab.states.load_state(document_id).await {
            Ok(Some(state)) => match ReplicatedDocument::from_state(document_id, &state) {
                Ok(replica) => {
                    debug!("loaded {} bytes of state for {document_id}", state.len());
                    replica
                }
                Err(e) => {
                    warn!("persisted state of {document_id} is malformed: {e}");
                    collab
                        .sink
                        .report("The saved document could not be read; starting empty.");
                    ReplicatedDocument::new(document_id)
                }
            },
            Ok(None) => ReplicatedDocument::new(document_id),
            Err(e) => {
                warn!("loading state of {document_id} failed: {e}");
                collab.sink.report(&format!("Could not load the document: {e}"));
                ReplicatedDocument::new(document_id)
            }
        }
    }

    /// Re-anchors stored comments at their recorded positions.
    async fn restore_comments(&mut self) {
        let records = match self.collab.comments.list_comments(self.config.document_id).await {
            Ok(records) => records,
            Err(e) => {
                self.report(&format!("Could not load comments: {e}"));
                return;
            }
        };
        self.profiles.request(records.iter().map(|r| r.user_id));
        if let Err(e) = self.profiles.flush().await {
            warn!("comment author lookup failed: {e}");
        }
        for record in records {
            if let Err(e) = self.restore_comment(&record).await {
                warn!("comment {} could not be re-anchored: {e}", record.id);
            }
        }
    }

    async fn restore_comment(&mut self, record: &CommentRecord) -> Result<(), CommentError> {
        let author = match self.profiles.get(record.user_id) {
            Some(profile) => CommentAuthor {
                id: profile.user_id,
                name: profile.display_name.clone(),
                avatar_ref: profile.avatar_ref.clone(),
            },
            None => CommentAuthor {
                id: record.user_id,
                name: record.user_id.to_string(),
                avatar_ref: None,
            },
        };
        self.comments.restore(&mut self.document, record, &author)?;
        match self.collab.comments.list_replies(record.id).await {
            Ok(replies) => {
                for reply in replies {
                    self.comments.restore_reply(reply)?;
                }
            }
            Err(e) => warn!("replies of {} unavailable: {e}", record.id),
        }
        Ok(())
    }

    fn report(&self, message: &str) {
        warn!("{message}");
        self.collab.sink.report(message);
    }

    // ─── Accessors ───────────────────────────────────────────────

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn text(&self) -> String {
        self.document.plain_text()
    }

    pub fn replica(&self) -> &ReplicatedDocument {
        &self.replica
    }

    pub fn comments(&self) -> &CommentThreads {
        &self.comments
    }

    pub fn mentions(&self) -> &MentionState {
        &self.mentions
    }

    pub fn presence(&self) -> &PresenceRoom {
        &self.presence
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.channel.state()
    }

    /// Whether this session is tracked on its tenant's presence topic.
    pub fn in_tenant_presence(&self) -> bool {
        self.tenant_presence.is_some()
    }

    pub fn caret(&self) -> usize {
        self.caret
    }

    pub fn review_mode(&self) -> ReviewMode {
        self.track.mode()
    }

    pub fn change_count(&self) -> usize {
        track::change_count(&self.document)
    }

    pub fn pending_changes(&self) -> Vec<PendingChange> {
        track::pending_changes(&self.document)
    }

    // ─── Channel ─────────────────────────────────────────────────

    /// Joins the document channel with a fresh membership, and announces the
    /// user on the tenant presence topic.
    pub async fn connect(&mut self) -> ConnectionState {
        let now = now_millis();
        if let Err(e) = self.channel.connect(now).await {
            self.report(&format!("Live collaboration is unavailable: {e}"));
            return self.channel.state();
        }
        self.join_tenant_presence(now).await;
        if self.config.content_sync == ContentSync::Replicated {
            self.publish_full_state();
        }
        self.channel.state()
    }

    async fn join_tenant_presence(&mut self, now: u64) {
        self.tenant_presence = None;
        let topic = user_presence_topic(self.config.tenant_id);
        let meta = PresenceMeta {
            user_id: self.config.user.id,
            display_name: Some(self.config.user.name.clone()),
            joined_at: now,
        };
        let joined = match self.collab.hub.join(&topic).await {
            Ok(mut membership) => membership.track(meta).map(|()| membership),
            Err(e) => Err(e),
        };
        match joined {
            Ok(membership) => self.tenant_presence = Some(membership),
            Err(e) => warn!("{topic}: tenant presence unavailable: {e}"),
        }
    }

    pub fn disconnect(&mut self) {
        self.channel.disconnect();
        self.tenant_presence = None;
        self.presence.clear();
    }

    fn lose_channel(&mut self, error: &ChannelError) {
        self.tenant_presence = None;
        self.presence.clear();
        self.report(&format!("Live collaboration was interrupted: {error}"));
    }

    fn send_result(&mut self, result: Result<(), ChannelError>) {
        match result {
            Ok(()) | Err(ChannelError::NotConnected) => {}
            Err(e) => self.report(&format!("Live collaboration was interrupted: {e}")),
        }
    }

    fn publish_full_state(&mut self) {
        let state = self.replica.encode_state();
        let result = self.channel.send_replica_update(state, now_millis());
        self.send_result(result);
    }

    /// Mirrors the tree into the replica and tells peers.
    fn publish_local_change(&mut self) {
        let now = now_millis();
        let tree = match self.document.to_json() {
            Ok(tree) => tree,
            Err(e) => {
                warn!("could not serialize document: {e}");
                return;
            }
        };
        let update = self
            .replica
            .replace_document(&self.document.plain_text(), &tree);
        let result = match self.config.content_sync {
            ContentSync::Replicated => match update {
                Some(update) => self.channel.send_replica_update(update, now),
                None => Ok(()),
            },
            ContentSync::Broadcast => self.channel.send_content(&tree, now).map(|_| ()),
        };
        self.send_result(result);
    }

    pub fn move_caret(&mut self, position: usize) {
        self.caret = self.document.snap_offset(position.min(self.document.text_len()));
        let result = self.channel.send_cursor(self.caret, now_millis());
        self.send_result(result);
    }

    pub fn select(&mut self, from: usize, to: usize) {
        let result = self.channel.send_selection(from.min(to), from.max(to), now_millis());
        self.send_result(result);
    }

    /// Applies everything peers sent since the last poll. Returns how many
    /// events changed local state.
    pub async fn poll_remote(&mut self) -> usize {
        let events = match self.channel.poll() {
            Ok(events) => events,
            Err(ChannelError::NotConnected) => return 0,
            Err(e) => {
                self.lose_channel(&e);
                return 0;
            }
        };
        let mut applied = 0;
        for event in events {
            if self.apply_event(event) {
                applied += 1;
            }
        }
        if self.profiles.pending() > 0 {
            match self.profiles.flush().await {
                Ok(profiles) => self.presence.apply_profiles(&profiles),
                Err(e) => warn!("presence profile lookup failed: {e}"),
            }
        }
        applied
    }

    /// Waits until a peer sends something, then applies it together with
    /// everything queued behind it. Returns how many events changed local state.
    pub async fn wait_remote(&mut self) -> usize {
        let first = match self.channel.next_event().await {
            Ok(event) => event,
            Err(ChannelError::NotConnected) => return 0,
            Err(e) => {
                self.lose_channel(&e);
                return 0;
            }
        };
        let applied = usize::from(self.apply_event(first));
        applied + self.poll_remote().await
    }

    fn apply_event(&mut self, event: ChannelEvent) -> bool {
        match event {
            ChannelEvent::Cursor { user_id, position } => {
                self.presence.apply_cursor(user_id, position)
            }
            ChannelEvent::Selection { user_id, from, to } => {
                self.presence.apply_selection(user_id, from, to)
            }
            ChannelEvent::PresenceSync(members) => {
                let before: HashSet<Uuid> =
                    self.presence.peers().iter().map(|p| p.user_id).collect();
                let unknown = self.presence.reconcile(&members);
                self.profiles.request(unknown);
                let joined = self
                    .presence
                    .peers()
                    .iter()
                    .any(|p| !before.contains(&p.user_id));
                if joined && self.config.content_sync == ContentSync::Replicated {
                    self.publish_full_state();
                }
                true
            }
            ChannelEvent::ApplyContent {
                origin_user_id,
                content,
                ..
            } => self.apply_content(origin_user_id, &content),
            ChannelEvent::ReplicaUpdate {
                origin_user_id,
                update,
            } => self.apply_replica_update(origin_user_id, &update),
        }
    }

    fn apply_content(&mut self, origin: Uuid, content: &str) -> bool {
        if self.config.content_sync != ContentSync::Broadcast {
            debug!("ignoring content patch from {origin} in replicated mode");
            return false;
        }
        match Document::from_json(content) {
            Ok(document) => {
                self.document = document;
                self.replica
                    .adopt_document(&self.document.plain_text(), content);
                self.caret = self.caret.min(self.document.text_len());
                debug!("applied content patch from {origin}");
                true
            }
            Err(e) => {
                warn!("dropping malformed content patch from {origin}: {e}");
                false
            }
        }
    }

    fn apply_replica_update(&mut self, origin: Uuid, update: &[u8]) -> bool {
        if self.config.content_sync != ContentSync::Replicated {
            debug!("ignoring replica update from {origin} in broadcast mode");
            return false;
        }
        match self.replica.merge(update) {
            Ok(true) => {
                if !self.sync_tree_from_replica() {
                    self.publish_tree();
                }
                true
            }
            Ok(false) => false,
            Err(e) => {
                self.report(&format!("An update from a collaborator was dropped: {e}"));
                false
            }
        }
    }

    /// Brings the tree in line with the replica. Returns true when the stored
    /// tree was adopted, false when the local tree was patched to the text.
    fn sync_tree_from_replica(&mut self) -> bool {
        let text = self.replica.text();
        let adopted = match stored_tree(&self.replica, &text) {
            Some(document) => {
                self.document = document;
                true
            }
            None => {
                if let Err(e) = self.document.sync_plain_text(&text) {
                    warn!("tree diverged from replica, rebuilding: {e}");
                    self.document = Document::from_plain_text(&text);
                }
                false
            }
        };
        self.caret = self.caret.min(self.document.text_len());
        adopted
    }

    /// Stores the local tree in the replica and sends it in replicated mode.
    fn publish_tree(&mut self) {
        let tree = match self.document.to_json() {
            Ok(tree) => tree,
            Err(e) => {
                warn!("could not serialize document: {e}");
                return;
            }
        };
        if let Some(update) = self.replica.store_tree(&tree) {
            if self.config.content_sync == ContentSync::Replicated {
                let result = self.channel.send_replica_update(update, now_millis());
                self.send_result(result);
            }
        }
    }

    // ─── Editing ─────────────────────────────────────────────────

    pub fn set_review_mode(&mut self, mode: ReviewMode) {
        self.track.set_mode(mode);
    }

    pub fn toggle_review(&mut self) -> ReviewMode {
        self.track.toggle()
    }

    fn after_edit(&mut self, caret: usize) -> usize {
        self.caret = caret;
        self.publish_local_change();
        self.mentions.detect(&self.document, caret);
        caret
    }

    /// Types `text` at `at`. Returns the caret after it.
    pub fn insert_text(&mut self, at: usize, text: &str) -> DocResult<usize> {
        let caret = self
            .track
            .insert_text(&mut self.document, at, text, now_millis())?;
        Ok(self.after_edit(caret))
    }

    pub fn delete_range(&mut self, from: usize, to: usize) -> DocResult<usize> {
        let caret = self
            .track
            .delete_range(&mut self.document, from, to, now_millis())?;
        Ok(self.after_edit(caret))
    }

    pub fn backspace(&mut self, caret: usize) -> DocResult<usize> {
        let caret = self.track.backspace(&mut self.document, caret, now_millis())?;
        Ok(self.after_edit(caret))
    }

    pub fn accept_all(&mut self) -> DocResult<usize> {
        let resolved = track::accept_all(&mut self.document)?;
        self.after_edit(self.caret.min(self.document.text_len()));
        Ok(resolved)
    }

    pub fn reject_all(&mut self) -> DocResult<usize> {
        let resolved = track::reject_all(&mut self.document)?;
        self.after_edit(self.caret.min(self.document.text_len()));
        Ok(resolved)
    }

    pub fn accept_change(&mut self, change: NodeId) -> DocResult<()> {
        track::accept_change(&mut self.document, change)?;
        self.after_edit(self.caret.min(self.document.text_len()));
        Ok(())
    }

    pub fn reject_change(&mut self, change: NodeId) -> DocResult<()> {
        track::reject_change(&mut self.document, change)?;
        self.after_edit(self.caret.min(self.document.text_len()));
        Ok(())
    }

    /// Reverts the latest local edit group. Remote edits are kept.
    pub fn undo(&mut self) -> bool {
        let before = self.replica.state_vector();
        if !self.replica.undo() {
            return false;
        }
        self.after_history_step(&before);
        true
    }

    pub fn redo(&mut self) -> bool {
        let before = self.replica.state_vector();
        if !self.replica.redo() {
            return false;
        }
        self.after_history_step(&before);
        true
    }

    fn after_history_step(&mut self, before: &[u8]) {
        self.sync_tree_from_replica();
        let now = now_millis();
        let tree = match self.document.to_json() {
            Ok(tree) => tree,
            Err(e) => {
                warn!("could not serialize document: {e}");
                return;
            }
        };
        self.replica.store_tree(&tree);
        let result = match self.config.content_sync {
            ContentSync::Replicated => match self.replica.encode_diff(before) {
                Ok(update) => self.channel.send_replica_update(update, now),
                Err(e) => {
                    warn!("could not encode undo step: {e}");
                    Ok(())
                }
            },
            ContentSync::Broadcast => self.channel.send_content(&tree, now).map(|_| ()),
        };
        self.send_result(result);
    }

    // ─── Comments ────────────────────────────────────────────────

    pub fn begin_comment(&self, from: usize, to: usize) -> Result<CommentDraft, CommentError> {
        self.comments.begin(&self.document, from, to)
    }

    /// Persists the comment row, then anchors it in the tree.
    pub async fn confirm_comment(
        &mut self,
        draft: &CommentDraft,
        body: &str,
    ) -> Result<Uuid, CommentError> {
        if body.trim().is_empty() {
            return Err(CommentError::EmptyBody);
        }
        let id = Uuid::new_v4();
        let now = now_millis();
        let record = CommentRecord::from_draft(
            id,
            self.config.document_id,
            &self.config.user,
            draft,
            body,
            now,
        );
        if let Err(e) = self.collab.comments.insert_comment(&record).await {
            self.report(&format!("Comment could not be saved: {e}"));
        }
        self.comments
            .confirm(&mut self.document, draft, id, body, &self.config.user, now)?;
        self.publish_local_change();
        Ok(id)
    }

    pub async fn resolve_comment(&mut self, id: Uuid) -> Result<(), CommentError> {
        self.comments.resolve(id)?;
        if let Err(e) = self.collab.comments.set_resolved(id, true).await {
            self.report(&format!("Comment state could not be saved: {e}"));
        }
        Ok(())
    }

    pub async fn reopen_comment(&mut self, id: Uuid) -> Result<(), CommentError> {
        self.comments.reopen(id)?;
        if let Err(e) = self.collab.comments.set_resolved(id, false).await {
            self.report(&format!("Comment state could not be saved: {e}"));
        }
        Ok(())
    }

    pub async fn delete_comment(&mut self, id: Uuid) -> Result<(), CommentError> {
        self.comments.delete(&mut self.document, id)?;
        if let Err(e) = self.collab.comments.delete_comment(id).await {
            self.report(&format!("Comment could not be deleted: {e}"));
        }
        self.publish_local_change();
        Ok(())
    }

    pub async fn reply(&mut self, id: Uuid, body: &str) -> Result<Reply, CommentError> {
        let reply = self
            .comments
            .reply(id, &self.config.user, body, now_millis())?
            .clone();
        if let Err(e) = self.collab.comments.append_reply(&reply).await {
            self.report(&format!("Reply could not be saved: {e}"));
        }
        Ok(reply)
    }

    /// Click on anchored text: highlights the thread and returns its id.
    pub fn click(&mut self, offset: usize) -> Option<Uuid> {
        let id = self.comments.comment_at(&self.document, offset)?;
        self.comments.focus(id, Instant::now()).ok()?;
        Some(id)
    }

    pub fn highlighted_comment(&mut self) -> Option<Uuid> {
        self.comments.highlighted(Instant::now())
    }

    // ─── Mentions ────────────────────────────────────────────────

    /// Reloads mention candidates for the session's tenant.
    pub async fn refresh_candidates(&mut self) {
        let tenant_id = self.config.tenant_id;
        match self.profiles.tenant_candidates(tenant_id).await {
            Ok(candidates) => {
                self.mentions.refresh(tenant_id, candidates);
            }
            Err(e) => warn!("mention candidates for tenant {tenant_id} unavailable: {e}"),
        }
    }

    pub fn mention_suggestions(&self) -> Vec<MentionCandidate> {
        self.mentions.suggestions().into_iter().cloned().collect()
    }

    pub fn mention_down(&mut self) {
        self.mentions.move_down();
    }

    pub fn mention_up(&mut self) {
        self.mentions.move_up();
    }

    pub fn mention_escape(&mut self) {
        self.mentions.escape();
    }

    /// Commits the selected suggestion. Returns the caret after the mention.
    pub fn commit_mention(&mut self) -> Result<usize, MentionError> {
        let caret = self.mentions.commit(&mut self.document)?;
        self.caret = caret;
        self.publish_local_change();
        Ok(caret)
    }

    // ─── Persistence ─────────────────────────────────────────────

    /// Persists a snapshot when the interval elapsed and something changed.
    pub async fn tick(&mut self, now: Instant) -> bool {
        if !self.schedule.due(now, self.replica.is_dirty()) {
            return false;
        }
        self.schedule.mark(now);
        self.flush().await
    }

    /// Persists the replicated state now if it changed. Returns true on a write.
    pub async fn flush(&mut self) -> bool {
        let Some(state) = self.replica.take_snapshot() else {
            return false;
        };
        let document_id = self.config.document_id;
        match self.collab.states.save_state(document_id, &state).await {
            Ok(()) => {
                debug!("persisted {} bytes for {document_id}", state.len());
                true
            }
            Err(e) => {
                self.replica.mark_dirty();
                self.report(&format!("Changes could not be saved: {e}"));
                false
            }
        }
    }

    /// Rewrites every thread's row with its current anchor range.
    async fn persist_comment_positions(&mut self) {
        let records: Vec<CommentRecord> = self
            .comments
            .comments()
            .iter()
            .filter_map(|c| self.comments.record(&self.document, c.id))
            .collect();
        for record in records {
            if let Err(e) = self.collab.comments.insert_comment(&record).await {
                self.report(&format!("Comment position could not be saved: {e}"));
                return;
            }
        }
    }

    /// Ends the session: leaves the channel, drops undo history, writes the
    /// final snapshot, then releases the replica. Returns whether the final
    /// snapshot was written.
    pub async fn close(mut self) -> bool {
        self.disconnect();
        self.replica.release_undo();
        self.persist_comment_positions().await;
        let saved = self.flush().await;
        let Self {
            channel,
            tenant_presence,
            replica,
            ..
        } = self;
        drop(channel);
        drop(tenant_presence);
        drop(replica);
        info!("closed session");
        saved
    }
}

/// The tree stored in `replica`, if it parses and agrees with `text`.
fn stored_tree(replica: &ReplicatedDocument, text: &str) -> Option<Document> {
    let tree = replica.tree()?;
    match Document::from_json(&tree) {
        Ok(document) if document.plain_text() == text => Some(document),
        Ok(_) => {
            debug!("stored tree lags the replicated text");
            None
        }
        Err(e) => {
            warn!("stored tree of {} is malformed: {e}", replica.document_id());
            None
        }
    }
}
