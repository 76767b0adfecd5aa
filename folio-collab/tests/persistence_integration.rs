//! Sessions persisting through the durable collaborators.
//!
//! Verifies:
//! - Replicated state survives closing and reopening a session
//! - Pending suggestions survive with their authors
//! - Comment threads, replies, and resolution are restored with their anchors
//! - Failing or corrupt storage never blocks editing
//! - The RocksDB store works behind a session

use std::sync::Arc;
use std::time::Instant;

use folio_collab::{
    BroadcastHub, Collaborators, CommentStore, ContentSync, EditorSession, MemoryDirectory,
    MemorySink, MemoryStore, RocksStore, SessionConfig, StoreConfig, UserProfile,
};
use folio_core::track::ReviewMode;
use folio_core::{ChangeKind, CommentAuthor, ReplicatedDocument};
use tempfile::tempdir;
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn author() -> CommentAuthor {
    CommentAuthor {
        id: Uuid::from_u128(1),
        name: "Alice".into(),
        avatar_ref: Some("avatars/alice.png".into()),
    }
}

async fn directory() -> Arc<MemoryDirectory> {
    let directory = Arc::new(MemoryDirectory::new());
    directory
        .add(
            Uuid::nil(),
            UserProfile {
                user_id: Uuid::from_u128(1),
                display_name: "Alice".into(),
                avatar_ref: Some("avatars/alice.png".into()),
            },
        )
        .await;
    directory
}

async fn open_with<S>(document_id: Uuid, store: Arc<S>, sink: Arc<MemorySink>) -> EditorSession
where
    S: folio_collab::DocumentStateStore + CommentStore + 'static,
{
    let config = SessionConfig::for_testing(document_id, author())
        .with_content_sync(ContentSync::Replicated);
    let collab = Collaborators::new(BroadcastHub::new(16), store, directory().await, sink);
    EditorSession::open(config, collab).await
}

// ─── Replicated state ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_state_survives_reopen() {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(MemorySink::new());
    let doc = Uuid::new_v4();

    let mut session = open_with(doc, store.clone(), sink.clone()).await;
    session.insert_text(0, "first line\nsecond line").unwrap();
    assert!(session.close().await);

    let reopened = open_with(doc, store, sink.clone()).await;
    assert_eq!(reopened.text(), "first line\nsecond line");
    assert_eq!(reopened.document().text_blocks().len(), 2);
    assert!(sink.messages().is_empty());
}

#[tokio::test]
async fn test_tracked_changes_survive_reopen() {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(MemorySink::new());
    let doc = Uuid::new_v4();

    let mut session = open_with(doc, store.clone(), sink.clone()).await;
    session.insert_text(0, "Hello World").unwrap();
    let draft = session.begin_comment(0, 5).unwrap();
    let id = session.confirm_comment(&draft, "Too casual?").await.unwrap();
    session.set_review_mode(ReviewMode::Review);
    session.delete_range(6, 11).unwrap();
    assert_eq!(session.change_count(), 1);
    assert!(session.close().await);

    let mut reopened = open_with(doc, store, sink.clone()).await;
    assert_eq!(reopened.text(), "Hello World");
    assert_eq!(reopened.change_count(), 1);
    let pending = reopened.pending_changes();
    assert_eq!(pending[0].kind, ChangeKind::Delete);
    assert_eq!(pending[0].text, "World");
    assert_eq!(pending[0].author_name, "Alice");

    // The anchor came back with the tree and was not wrapped a second time.
    assert_eq!(reopened.comments().len(), 1);
    assert_eq!(
        reopened.comments().anchor_range(reopened.document(), id),
        Some((0, 5))
    );

    reopened.accept_all().unwrap();
    assert_eq!(reopened.text(), "Hello ");
    assert!(sink.messages().is_empty());
}

#[tokio::test]
async fn test_text_only_state_opens_as_paragraphs() {
    let store = Arc::new(MemoryStore::new());
    let doc = Uuid::new_v4();
    let mut legacy = ReplicatedDocument::new(doc);
    legacy.insert_text(0, "kept from before\nsecond");
    assert!(legacy.tree().is_none());
    store.put_raw_state(doc, legacy.encode_state()).await;

    let mut session = open_with(doc, store.clone(), Arc::new(MemorySink::new())).await;
    assert_eq!(session.text(), "kept from before\nsecond");
    assert_eq!(session.document().text_blocks().len(), 2);
    assert_eq!(session.change_count(), 0);

    session.insert_text(0, "> ").unwrap();
    assert!(session.replica().tree().is_some());
}

#[tokio::test]
async fn test_tick_persists_only_when_dirty() {
    let store = Arc::new(MemoryStore::new());
    let doc = Uuid::new_v4();
    let mut session = open_with(doc, store.clone(), Arc::new(MemorySink::new())).await;

    assert!(!session.tick(Instant::now()).await);
    session.insert_text(0, "tick").unwrap();
    assert!(session.tick(Instant::now()).await);
    assert!(!session.tick(Instant::now()).await);
    assert!(store.raw_state(doc).await.is_some());
}

#[tokio::test]
async fn test_failed_save_is_retried() {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(MemorySink::new());
    let doc = Uuid::new_v4();
    let mut session = open_with(doc, store.clone(), sink.clone()).await;

    store.set_failing(true);
    session.insert_text(0, "unsaved").unwrap();
    assert!(!session.flush().await);
    assert_eq!(session.text(), "unsaved");
    assert_eq!(sink.messages().len(), 1);

    store.set_failing(false);
    assert!(session.tick(Instant::now()).await);
    let reopened = open_with(doc, store, sink).await;
    assert_eq!(reopened.text(), "unsaved");
}

#[tokio::test]
async fn test_corrupt_state_opens_empty() {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(MemorySink::new());
    let doc = Uuid::new_v4();
    store.put_raw_state(doc, vec![0xff, 0xff, 0xff]).await;

    let mut session = open_with(doc, store, sink.clone()).await;
    assert_eq!(session.text(), "");
    assert_eq!(sink.messages().len(), 1);
    session.insert_text(0, "fresh start").unwrap();
    assert_eq!(session.text(), "fresh start");
}

#[tokio::test]
async fn test_unavailable_store_still_opens() {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(MemorySink::new());
    store.set_failing(true);

    let mut session = open_with(Uuid::new_v4(), store, sink.clone()).await;
    assert!(!sink.messages().is_empty());
    session.insert_text(0, "still editing").unwrap();
    assert_eq!(session.text(), "still editing");
}

// ─── Comments ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_comment_threads_are_restored() {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(MemorySink::new());
    let doc = Uuid::new_v4();

    let mut session = open_with(doc, store.clone(), sink.clone()).await;
    session.insert_text(0, "Quarterly figures attached").unwrap();
    let draft = session.begin_comment(10, 17).unwrap();
    assert_eq!(draft.quote, "figures");
    let id = session.confirm_comment(&draft, "Source?").await.unwrap();
    session.reply(id, "From finance").await.unwrap();
    session.resolve_comment(id).await.unwrap();
    session.close().await;

    let rows = store.list_comments(doc).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].text_position, 10);
    assert_eq!(rows[0].text_length, 7);
    assert!(rows[0].resolved);

    let reopened = open_with(doc, store, sink).await;
    let comment = reopened.comments().get(id).unwrap();
    assert_eq!(comment.body, "Source?");
    assert_eq!(comment.author_name, "Alice");
    assert!(comment.resolved);
    assert_eq!(comment.replies.len(), 1);
    assert_eq!(comment.replies[0].body, "From finance");
    assert_eq!(
        reopened.comments().anchor_range(reopened.document(), id),
        Some((10, 17))
    );
}

#[tokio::test]
async fn test_comment_position_follows_edits_before_close() {
    let store = Arc::new(MemoryStore::new());
    let doc = Uuid::new_v4();
    let mut session = open_with(doc, store.clone(), Arc::new(MemorySink::new())).await;
    session.insert_text(0, "Hello World").unwrap();
    let draft = session.begin_comment(6, 11).unwrap();
    let id = session.confirm_comment(&draft, "Which world?").await.unwrap();
    session.insert_text(0, "Oh, ").unwrap();
    session.close().await;

    let reopened = open_with(doc, store, Arc::new(MemorySink::new())).await;
    assert_eq!(
        reopened.comments().anchor_range(reopened.document(), id),
        Some((10, 15))
    );
}

#[tokio::test]
async fn test_deleted_comment_is_removed_from_store() {
    let store = Arc::new(MemoryStore::new());
    let doc = Uuid::new_v4();
    let mut session = open_with(doc, store.clone(), Arc::new(MemorySink::new())).await;
    session.insert_text(0, "Hello World").unwrap();
    let draft = session.begin_comment(0, 5).unwrap();
    let id = session.confirm_comment(&draft, "Greeting").await.unwrap();

    session.delete_comment(id).await.unwrap();
    assert!(session.comments().is_empty());
    assert_eq!(session.text(), "Hello World");
    assert!(store.list_comments(doc).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_comment_body_is_not_stored() {
    let store = Arc::new(MemoryStore::new());
    let doc = Uuid::new_v4();
    let mut session = open_with(doc, store.clone(), Arc::new(MemorySink::new())).await;
    session.insert_text(0, "Hello").unwrap();
    let draft = session.begin_comment(0, 5).unwrap();
    assert!(session.confirm_comment(&draft, "   ").await.is_err());
    assert!(store.list_comments(doc).await.unwrap().is_empty());
}

// ─── RocksDB ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_rocks_backed_session_round_trip() {
    let dir = tempdir().unwrap();
    let doc = Uuid::new_v4();
    let sink = Arc::new(MemorySink::new());
    let comment_id;
    {
        let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap());
        let mut session = open_with(doc, store.clone(), sink.clone()).await;
        session.insert_text(0, "durable text").unwrap();
        let draft = session.begin_comment(0, 7).unwrap();
        comment_id = session.confirm_comment(&draft, "Nice").await.unwrap();
        assert!(session.close().await);
        store.sync().unwrap();
    }

    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap());
    assert_eq!(store.list_documents().unwrap(), vec![doc]);
    let reopened = open_with(doc, store, sink.clone()).await;
    assert_eq!(reopened.text(), "durable text");
    assert!(reopened.comments().get(comment_id).is_some());
    assert!(sink.messages().is_empty());
}
