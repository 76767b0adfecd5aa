//! RocksDB-backed store.
//!
//! Column families:
//! - `document_state`: replicated state per document (LZ4 compressed), keyed by doc_id
//! - `metadata`:       [`DocumentMetadata`] per document (bincode), keyed by doc_id
//! - `comments`:       [`CommentRecord`] rows (bincode), keyed by comment_id
//! - `comment_index`:  empty values keyed by `doc_id:created_at:comment_id`
//! - `replies`:        [`Reply`] rows (bincode), keyed by `comment_id:created_at:reply_id`

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use folio_core::{now_millis, CommentRecord, Reply};

use super::{CommentStore, DocumentStateStore, StoreError};

const CF_STATE: &str = "document_state";
const CF_METADATA: &str = "metadata";
const CF_COMMENTS: &str = "comments";
const CF_COMMENT_INDEX: &str = "comment_index";
const CF_REPLIES: &str = "replies";

const COLUMN_FAMILIES: &[&str] = &[
    CF_STATE,
    CF_METADATA,
    CF_COMMENTS,
    CF_COMMENT_INDEX,
    CF_REPLIES,
];

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// fsync on every write batch
    pub sync_writes: bool,
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("folio_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 512,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Bookkeeping written next to every persisted state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub document_id: Uuid,
    /// Number of times state was saved
    pub saves: u64,
    /// Uncompressed state size in bytes
    pub state_size: u64,
    pub compressed_size: u64,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(document_id: Uuid, now: u64) -> Self {
        Self {
            document_id,
            saves: 0,
            state_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn uuid_at(key: &[u8], at: usize) -> Result<Uuid, StoreError> {
    key.get(at..at + 16)
        .and_then(|b| <[u8; 16]>::try_from(b).ok())
        .map(Uuid::from_bytes)
        .ok_or_else(|| StoreError::Deserialization("invalid UUID key".into()))
}

/// `id:created_at:child`, so a forward scan from `id` yields children in time order.
fn ordered_key(id: Uuid, created_at: u64, child: Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(id.as_bytes());
    key.extend_from_slice(&created_at.to_be_bytes());
    key.extend_from_slice(child.as_bytes());
    key
}

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Opens the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        debug!("opened store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, cache: &Cache) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            // Already LZ4 compressed by us.
            CF_STATE => opts.set_compression_type(DBCompressionType::None),
            CF_COMMENT_INDEX | CF_REPLIES => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Every `(key, value)` of `cf` whose key starts with `prefix`.
    fn scan_prefix(&self, cf: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let cf = self.cf(cf)?;
        let mut rows = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key.to_vec(), value.to_vec()));
        }
        Ok(rows)
    }

    // ─── Replicated state ────────────────────────────────────────

    /// Writes compressed state and updated metadata in one batch.
    pub fn put_state(&self, document_id: Uuid, state: &[u8]) -> Result<DocumentMetadata, StoreError> {
        let compressed = lz4_flex::compress_prepend_size(state);
        let now = now_millis();
        let mut meta = match self.metadata(document_id)? {
            Some(meta) => meta,
            None => DocumentMetadata::new(document_id, now),
        };
        meta.saves += 1;
        meta.state_size = state.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now;

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_STATE)?, document_id.as_bytes(), &compressed);
        batch.put_cf(self.cf(CF_METADATA)?, document_id.as_bytes(), encode(&meta)?);
        self.write(batch)?;
        debug!(
            "stored state of {document_id}: {} -> {} bytes",
            meta.state_size, meta.compressed_size
        );
        Ok(meta)
    }

    pub fn get_state(&self, document_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        match self.db.get_cf(self.cf(CF_STATE)?, document_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn metadata(&self, document_id: Uuid) -> Result<Option<DocumentMetadata>, StoreError> {
        match self.db.get_cf(self.cf(CF_METADATA)?, document_id.as_bytes())? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Ids of every document with persisted state.
    pub fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            ids.push(uuid_at(&key, 0)?);
        }
        Ok(ids)
    }

    /// Drops a document's state, metadata, comments and replies.
    pub fn delete_document(&self, document_id: Uuid) -> Result<(), StoreError> {
        let comment_ids = self.comment_ids(document_id)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_STATE)?, document_id.as_bytes());
        batch.delete_cf(self.cf(CF_METADATA)?, document_id.as_bytes());
        for (index_key, comment_id) in comment_ids {
            batch.delete_cf(self.cf(CF_COMMENT_INDEX)?, &index_key);
            self.delete_comment_rows(&mut batch, comment_id)?;
        }
        self.write(batch)
    }

    // ─── Comments ────────────────────────────────────────────────

    fn comment(&self, comment_id: Uuid) -> Result<CommentRecord, StoreError> {
        match self.db.get_cf(self.cf(CF_COMMENTS)?, comment_id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(StoreError::NotFound(comment_id)),
        }
    }

    fn comment_ids(&self, document_id: Uuid) -> Result<Vec<(Vec<u8>, Uuid)>, StoreError> {
        self.scan_prefix(CF_COMMENT_INDEX, document_id.as_bytes())?
            .into_iter()
            .map(|(key, _)| {
                let id = uuid_at(&key, 24)?;
                Ok((key, id))
            })
            .collect()
    }

    fn delete_comment_rows(&self, batch: &mut WriteBatch, comment_id: Uuid) -> Result<(), StoreError> {
        batch.delete_cf(self.cf(CF_COMMENTS)?, comment_id.as_bytes());
        let replies = self.cf(CF_REPLIES)?;
        for (key, _) in self.scan_prefix(CF_REPLIES, comment_id.as_bytes())? {
            batch.delete_cf(replies, &key);
        }
        Ok(())
    }

    pub fn put_comment(&self, record: &CommentRecord) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_COMMENTS)?, record.id.as_bytes(), encode(record)?);
        batch.put_cf(
            self.cf(CF_COMMENT_INDEX)?,
            ordered_key(record.letter_id, record.created_at, record.id),
            b"",
        );
        self.write(batch)
    }

    pub fn update_resolved(&self, comment_id: Uuid, resolved: bool) -> Result<(), StoreError> {
        let mut record = self.comment(comment_id)?;
        record.resolved = resolved;
        self.db
            .put_cf(self.cf(CF_COMMENTS)?, comment_id.as_bytes(), encode(&record)?)?;
        Ok(())
    }

    pub fn remove_comment(&self, comment_id: Uuid) -> Result<(), StoreError> {
        let record = match self.comment(comment_id) {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut batch = WriteBatch::default();
        batch.delete_cf(
            self.cf(CF_COMMENT_INDEX)?,
            ordered_key(record.letter_id, record.created_at, record.id),
        );
        self.delete_comment_rows(&mut batch, comment_id)?;
        self.write(batch)
    }

    pub fn put_reply(&self, reply: &Reply) -> Result<(), StoreError> {
        // A reply to a deleted comment would never be listed or removed.
        self.comment(reply.comment_id)?;
        let key = ordered_key(reply.comment_id, reply.created_at, reply.id);
        self.db.put_cf(self.cf(CF_REPLIES)?, key, encode(reply)?)?;
        Ok(())
    }

    pub fn comments_of(&self, document_id: Uuid) -> Result<Vec<CommentRecord>, StoreError> {
        self.comment_ids(document_id)?
            .into_iter()
            .map(|(_, id)| self.comment(id))
            .collect()
    }

    pub fn replies_of(&self, comment_id: Uuid) -> Result<Vec<Reply>, StoreError> {
        self.scan_prefix(CF_REPLIES, comment_id.as_bytes())?
            .iter()
            .map(|(_, value)| decode(value))
            .collect()
    }

    /// Flushes memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStateStore for RocksStore {
    async fn load_state(&self, document_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        self.get_state(document_id)
    }

    async fn save_state(&self, document_id: Uuid, state: &[u8]) -> Result<(), StoreError> {
        self.put_state(document_id, state).map(|_| ())
    }
}

#[async_trait]
impl CommentStore for RocksStore {
    async fn insert_comment(&self, record: &CommentRecord) -> Result<(), StoreError> {
        self.put_comment(record)
    }

    async fn set_resolved(&self, comment_id: Uuid, resolved: bool) -> Result<(), StoreError> {
        self.update_resolved(comment_id, resolved)
    }

    async fn delete_comment(&self, comment_id: Uuid) -> Result<(), StoreError> {
        self.remove_comment(comment_id)
    }

    async fn append_reply(&self, reply: &Reply) -> Result<(), StoreError> {
        self.put_reply(reply)
    }

    async fn list_comments(&self, document_id: Uuid) -> Result<Vec<CommentRecord>, StoreError> {
        self.comments_of(document_id)
    }

    async fn list_replies(&self, comment_id: Uuid) -> Result<Vec<Reply>, StoreError> {
        self.replies_of(comment_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open() -> (TempDir, RocksStore) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    fn record(doc: Uuid, created_at: u64) -> CommentRecord {
        CommentRecord {
            id: Uuid::new_v4(),
            letter_id: doc,
            user_id: Uuid::new_v4(),
            content: "needs a source".into(),
            text_position: 4,
            text_length: 5,
            resolved: false,
            created_at,
        }
    }

    fn reply(comment_id: Uuid, created_at: u64, body: &str) -> Reply {
        Reply {
            id: Uuid::new_v4(),
            comment_id,
            author_id: Uuid::new_v4(),
            author_name: "Ann".into(),
            body: body.into(),
            created_at,
        }
    }

    #[test]
    fn test_state_round_trip_and_metadata() {
        let (_dir, store) = open();
        let doc = Uuid::new_v4();
        assert_eq!(store.get_state(doc).unwrap(), None);

        let state = b"replicated state ".repeat(20);
        let meta = store.put_state(doc, &state).unwrap();
        assert_eq!(meta.saves, 1);
        assert_eq!(meta.state_size, state.len() as u64);
        assert!(meta.compressed_size < meta.state_size);
        assert_eq!(store.get_state(doc).unwrap(), Some(state));

        let meta = store.put_state(doc, b"v2").unwrap();
        assert_eq!(meta.saves, 2);
        assert_eq!(store.list_documents().unwrap(), vec![doc]);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let doc = Uuid::new_v4();
        {
            let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.put_state(doc, b"persisted").unwrap();
            store.sync().unwrap();
        }
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.get_state(doc).unwrap(), Some(b"persisted".to_vec()));
    }

    #[test]
    fn test_comments_listed_per_document_in_time_order() {
        let (_dir, store) = open();
        let (doc, other) = (Uuid::new_v4(), Uuid::new_v4());
        let late = record(doc, 200);
        let early = record(doc, 100);
        store.put_comment(&late).unwrap();
        store.put_comment(&early).unwrap();
        store.put_comment(&record(other, 50)).unwrap();

        assert_eq!(store.comments_of(doc).unwrap(), vec![early.clone(), late]);
        store.update_resolved(early.id, true).unwrap();
        assert!(store.comments_of(doc).unwrap()[0].resolved);
        assert_eq!(store.comments_of(other).unwrap().len(), 1);
    }

    #[test]
    fn test_replies_are_ordered_and_deleted_with_comment() {
        let (_dir, store) = open();
        let doc = Uuid::new_v4();
        let comment = record(doc, 1);
        store.put_comment(&comment).unwrap();
        let second = reply(comment.id, 20, "second");
        let first = reply(comment.id, 10, "first");
        store.put_reply(&second).unwrap();
        store.put_reply(&first).unwrap();
        assert_eq!(store.replies_of(comment.id).unwrap(), vec![first, second]);

        store.remove_comment(comment.id).unwrap();
        assert!(store.comments_of(doc).unwrap().is_empty());
        assert!(store.replies_of(comment.id).unwrap().is_empty());
        assert!(store.remove_comment(comment.id).is_ok());
    }

    #[test]
    fn test_reply_to_unknown_comment_rejected() {
        let (_dir, store) = open();
        let orphan = reply(Uuid::new_v4(), 1, "hello?");
        assert!(matches!(
            store.put_reply(&orphan),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_document_removes_everything() {
        let (_dir, store) = open();
        let doc = Uuid::new_v4();
        store.put_state(doc, b"state").unwrap();
        let comment = record(doc, 1);
        store.put_comment(&comment).unwrap();
        store.put_reply(&reply(comment.id, 2, "r")).unwrap();

        store.delete_document(doc).unwrap();
        assert_eq!(store.get_state(doc).unwrap(), None);
        assert!(store.metadata(doc).unwrap().is_none());
        assert!(store.comments_of(doc).unwrap().is_empty());
        assert!(store.replies_of(comment.id).unwrap().is_empty());
        assert!(store.list_documents().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_state_reports_compression_error() {
        let (_dir, store) = open();
        let doc = Uuid::new_v4();
        store
            .db
            .put_cf(store.cf(CF_STATE).unwrap(), doc.as_bytes(), [3u8, 0])
            .unwrap();
        assert!(matches!(
            store.get_state(doc),
            Err(StoreError::Compression(_))
        ));
    }
}
