//! End-to-end collaboration between editing sessions on one hub.

use std::sync::Arc;
use std::time::Duration;

use folio_collab::{
    BroadcastHub, Collaborators, ConnectionState, ContentSync, EditorSession, MemoryDirectory,
    MemorySink, MemoryStore, SessionConfig, UserProfile,
};
use folio_core::track::ReviewMode;
use folio_core::{ChangeKind, CommentAuthor};
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

struct Env {
    hub: BroadcastHub,
    store: Arc<MemoryStore>,
    directory: Arc<MemoryDirectory>,
    sink: Arc<MemorySink>,
}

impl Env {
    async fn new() -> Self {
        let directory = Arc::new(MemoryDirectory::new());
        for (n, name) in [(1, "Alice"), (2, "Albert"), (3, "Bob")] {
            directory
                .add(
                    Uuid::nil(),
                    UserProfile {
                        user_id: Uuid::from_u128(n),
                        display_name: name.into(),
                        avatar_ref: None,
                    },
                )
                .await;
        }
        Self {
            hub: BroadcastHub::new(64),
            store: Arc::new(MemoryStore::new()),
            directory,
            sink: Arc::new(MemorySink::new()),
        }
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            self.hub.clone(),
            self.store.clone(),
            self.directory.clone(),
            self.sink.clone(),
        )
    }

    async fn open(&self, document_id: Uuid, user: u128, sync: ContentSync) -> EditorSession {
        let config =
            SessionConfig::for_testing(document_id, author(user)).with_content_sync(sync);
        EditorSession::open(config, self.collaborators()).await
    }
}

fn author(n: u128) -> CommentAuthor {
    let name = match n {
        1 => "Alice",
        2 => "Albert",
        _ => "Bob",
    };
    CommentAuthor {
        id: Uuid::from_u128(n),
        name: name.into(),
        avatar_ref: None,
    }
}

async fn settle(sessions: &mut [&mut EditorSession]) {
    for _ in 0..3 {
        for session in sessions.iter_mut() {
            session.poll_remote().await;
        }
    }
}

// ─── Broadcast mode ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_content_patch_applied_once_without_echo() {
    let env = Env::new().await;
    let doc = Uuid::new_v4();
    let mut a = env.open(doc, 1, ContentSync::Broadcast).await;
    let mut b = env.open(doc, 3, ContentSync::Broadcast).await;
    settle(&mut [&mut a, &mut b]).await;

    a.insert_text(0, "Hello").unwrap();
    assert_eq!(b.poll_remote().await, 1);
    assert_eq!(b.text(), "Hello");
    assert_eq!(b.replica().text(), "Hello");

    // B applied it without sending it back, and A drops its own echo.
    assert_eq!(a.poll_remote().await, 0);
    assert_eq!(a.text(), "Hello");
}

#[tokio::test]
async fn test_tracked_changes_travel_with_content() {
    let env = Env::new().await;
    let doc = Uuid::new_v4();
    let mut a = env.open(doc, 1, ContentSync::Broadcast).await;
    let mut b = env.open(doc, 3, ContentSync::Broadcast).await;
    settle(&mut [&mut a, &mut b]).await;

    a.set_review_mode(ReviewMode::Review);
    a.insert_text(0, "Draft").unwrap();
    b.poll_remote().await;
    assert_eq!(b.change_count(), 1);
    assert_eq!(b.pending_changes()[0].author_name, "Alice");

    b.accept_all().unwrap();
    assert_eq!(b.change_count(), 0);
    a.poll_remote().await;
    assert_eq!(a.change_count(), 0);
    assert_eq!(a.text(), "Draft");
}

// ─── Replicated mode ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_replicated_sessions_converge() {
    let env = Env::new().await;
    let doc = Uuid::new_v4();
    let mut a = env.open(doc, 1, ContentSync::Replicated).await;
    let mut b = env.open(doc, 3, ContentSync::Replicated).await;
    settle(&mut [&mut a, &mut b]).await;

    a.insert_text(0, "Hello world").unwrap();
    b.poll_remote().await;
    assert_eq!(b.text(), "Hello world");

    a.insert_text(5, ",").unwrap();
    b.insert_text(11, "!").unwrap();
    settle(&mut [&mut a, &mut b]).await;
    assert_eq!(a.text(), "Hello, world!");
    assert_eq!(b.text(), "Hello, world!");
}

#[tokio::test]
async fn test_tracked_changes_reach_replicated_peer() {
    let env = Env::new().await;
    let doc = Uuid::new_v4();
    let mut a = env.open(doc, 1, ContentSync::Replicated).await;
    let mut b = env.open(doc, 3, ContentSync::Replicated).await;
    settle(&mut [&mut a, &mut b]).await;

    a.insert_text(0, "Hello World").unwrap();
    a.set_review_mode(ReviewMode::Review);
    a.insert_text(5, ",").unwrap();
    a.delete_range(7, 12).unwrap();
    settle(&mut [&mut a, &mut b]).await;

    assert_eq!(b.text(), a.text());
    assert_eq!(b.change_count(), 2);
    let kinds: Vec<ChangeKind> = b.pending_changes().iter().map(|c| c.kind).collect();
    assert!(kinds.contains(&ChangeKind::Insert));
    assert!(kinds.contains(&ChangeKind::Delete));
    assert!(b.pending_changes().iter().all(|c| c.author_name == "Alice"));

    b.accept_all().unwrap();
    settle(&mut [&mut a, &mut b]).await;
    assert_eq!(a.change_count(), 0);
    assert_eq!(a.text(), "Hello, ");
    assert_eq!(b.text(), "Hello, ");
}

#[tokio::test]
async fn test_concurrent_edits_keep_one_tree() {
    let env = Env::new().await;
    let doc = Uuid::new_v4();
    let mut a = env.open(doc, 1, ContentSync::Replicated).await;
    let mut b = env.open(doc, 3, ContentSync::Replicated).await;
    settle(&mut [&mut a, &mut b]).await;

    a.insert_text(0, "one two").unwrap();
    settle(&mut [&mut a, &mut b]).await;
    a.insert_text(0, ">").unwrap();
    b.insert_text(7, "<").unwrap();
    settle(&mut [&mut a, &mut b]).await;

    assert_eq!(a.text(), ">one two<");
    assert_eq!(b.text(), ">one two<");
    assert_eq!(a.replica().tree(), b.replica().tree());
    assert_eq!(a.document().to_json().unwrap(), b.document().to_json().unwrap());
}

#[tokio::test]
async fn test_late_joiner_receives_full_state() {
    let env = Env::new().await;
    let doc = Uuid::new_v4();
    let mut a = env.open(doc, 1, ContentSync::Replicated).await;
    a.insert_text(0, "written before B arrived").unwrap();

    let mut b = env.open(doc, 3, ContentSync::Replicated).await;
    settle(&mut [&mut a, &mut b]).await;
    assert_eq!(b.text(), "written before B arrived");
}

#[tokio::test]
async fn test_undo_keeps_remote_edits() {
    let env = Env::new().await;
    let doc = Uuid::new_v4();
    let mut a = env.open(doc, 1, ContentSync::Replicated).await;
    let mut b = env.open(doc, 3, ContentSync::Replicated).await;
    settle(&mut [&mut a, &mut b]).await;

    b.insert_text(0, "theirs").unwrap();
    settle(&mut [&mut a, &mut b]).await;
    a.insert_text(0, "mine ").unwrap();
    assert_eq!(a.text(), "mine theirs");

    assert!(a.undo());
    assert_eq!(a.text(), "theirs");
    settle(&mut [&mut a, &mut b]).await;
    assert_eq!(b.text(), "theirs");

    assert!(a.redo());
    settle(&mut [&mut a, &mut b]).await;
    assert_eq!(b.text(), "mine theirs");
}

#[tokio::test]
async fn test_wait_remote_wakes_on_peer_edit() {
    let env = Env::new().await;
    let doc = Uuid::new_v4();
    let mut a = env.open(doc, 1, ContentSync::Replicated).await;
    let mut b = env.open(doc, 3, ContentSync::Replicated).await;
    settle(&mut [&mut a, &mut b]).await;

    b.insert_text(0, "ping").unwrap();
    let applied = tokio::time::timeout(Duration::from_secs(5), a.wait_remote())
        .await
        .unwrap();
    assert!(applied >= 1);
    assert_eq!(a.text(), "ping");

    a.disconnect();
    let idle = tokio::time::timeout(Duration::from_secs(5), a.wait_remote())
        .await
        .unwrap();
    assert_eq!(idle, 0);
}

// ─── Mentions ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_mention_commit_reaches_peer() {
    let env = Env::new().await;
    let doc = Uuid::new_v4();
    let mut a = env.open(doc, 1, ContentSync::Replicated).await;
    let mut b = env.open(doc, 3, ContentSync::Replicated).await;
    settle(&mut [&mut a, &mut b]).await;

    a.insert_text(0, "Hi @al").unwrap();
    let names: Vec<String> = a
        .mention_suggestions()
        .into_iter()
        .map(|c| c.display_name)
        .collect();
    assert_eq!(names, vec!["Alice", "Albert"]);
    a.mention_down();
    assert_eq!(a.commit_mention().unwrap(), 10);
    assert_eq!(a.text(), "Hi @Albert");

    b.poll_remote().await;
    assert_eq!(b.text(), "Hi @Albert");
}

#[tokio::test]
async fn test_mention_escape_leaves_text() {
    let env = Env::new().await;
    let mut a = env.open(Uuid::new_v4(), 1, ContentSync::Replicated).await;
    a.insert_text(0, "@bo").unwrap();
    assert_eq!(a.mention_suggestions().len(), 1);
    a.mention_escape();
    assert!(a.mention_suggestions().is_empty());
    assert!(a.commit_mention().is_err());
    assert_eq!(a.text(), "@bo");
}

// ─── Failure handling ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_transport_failure_does_not_block_editing() {
    let env = Env::new().await;
    let doc = Uuid::new_v4();
    let mut a = env.open(doc, 1, ContentSync::Replicated).await;
    assert_eq!(a.connection_state(), ConnectionState::Connected);

    env.hub.close().await;
    a.insert_text(0, "offline").unwrap();
    assert_eq!(a.connection_state(), ConnectionState::Disconnected);
    assert_eq!(a.text(), "offline");
    assert!(!env.sink.messages().is_empty());

    assert_eq!(a.connect().await, ConnectionState::Disconnected);
    env.hub.reopen().await;
    assert_eq!(a.connect().await, ConnectionState::Connected);

    let mut b = env.open(doc, 3, ContentSync::Replicated).await;
    settle(&mut [&mut a, &mut b]).await;
    assert_eq!(b.text(), "offline");
}

#[tokio::test]
async fn test_malformed_content_patch_is_dropped() {
    use folio_collab::{BroadcastEnvelope, BroadcastPayload};

    let env = Env::new().await;
    let doc = Uuid::new_v4();
    let mut a = env.open(doc, 1, ContentSync::Broadcast).await;
    a.insert_text(0, "intact").unwrap();
    a.poll_remote().await;

    let intruder = env
        .hub
        .join(&folio_collab::document_topic(doc))
        .await
        .unwrap();
    intruder
        .send(BroadcastEnvelope {
            origin_user_id: Uuid::new_v4(),
            document_id: doc,
            payload: BroadcastPayload::Content {
                content: "{not a document".into(),
            },
            timestamp: 0,
        })
        .unwrap();
    assert_eq!(a.poll_remote().await, 0);
    assert_eq!(a.text(), "intact");
    assert_eq!(a.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_undecodable_replica_update_is_reported() {
    use folio_collab::{BroadcastEnvelope, BroadcastPayload};

    let env = Env::new().await;
    let doc = Uuid::new_v4();
    let mut a = env.open(doc, 1, ContentSync::Replicated).await;
    a.insert_text(0, "intact").unwrap();
    a.poll_remote().await;
    assert!(env.sink.messages().is_empty());

    let intruder = env
        .hub
        .join(&folio_collab::document_topic(doc))
        .await
        .unwrap();
    intruder
        .send(BroadcastEnvelope {
            origin_user_id: Uuid::new_v4(),
            document_id: doc,
            payload: BroadcastPayload::ReplicaUpdate {
                update: vec![0xff, 0xff, 0xff],
            },
            timestamp: 0,
        })
        .unwrap();
    assert_eq!(a.poll_remote().await, 0);
    assert_eq!(a.text(), "intact");
    assert_eq!(env.sink.messages().len(), 1);
    assert_eq!(a.connection_state(), ConnectionState::Connected);
}
