//! Inspects a folio RocksDB store.
//!
//! ```text
//! folio-snapshot [STORE_PATH]               list persisted documents
//! folio-snapshot [STORE_PATH] DOCUMENT_ID   print a document's text and comments
//! ```
//!
//! `STORE_PATH` falls back to `FOLIO_STORE_PATH`.

use std::process::ExitCode;

use log::{error, info};
use uuid::Uuid;

use folio_collab::{RocksStore, StoreConfig, StoreError};
use folio_core::ReplicatedDocument;

fn list(store: &RocksStore) -> Result<(), StoreError> {
    let ids = store.list_documents()?;
    info!("{} documents in {}", ids.len(), store.path().display());
    for id in ids {
        match store.metadata(id)? {
            Some(meta) => println!(
                "{id}  saves={} size={}B compressed={}B updated_at={}",
                meta.saves, meta.state_size, meta.compressed_size, meta.updated_at
            ),
            None => println!("{id}"),
        }
    }
    Ok(())
}

fn show(store: &RocksStore, document_id: Uuid) -> Result<(), StoreError> {
    let state = store
        .get_state(document_id)?
        .ok_or(StoreError::NotFound(document_id))?;
    let replica = ReplicatedDocument::from_state(document_id, &state)
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    println!("{}", replica.text());
    for comment in store.comments_of(document_id)? {
        let status = if comment.resolved { "resolved" } else { "open" };
        println!(
            "-- comment {} [{status}] at {}+{}: {}",
            comment.id, comment.text_position, comment.text_length, comment.content
        );
        for reply in store.replies_of(comment.id)? {
            println!("   reply from {}: {}", reply.author_name, reply.body);
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let path = match args.next().or_else(|| std::env::var("FOLIO_STORE_PATH").ok()) {
        Some(path) => path,
        None => {
            eprintln!("usage: folio-snapshot [STORE_PATH] [DOCUMENT_ID]");
            return ExitCode::FAILURE;
        }
    };
    let document = match args.next().map(|arg| Uuid::parse_str(&arg)) {
        Some(Ok(id)) => Some(id),
        Some(Err(e)) => {
            eprintln!("invalid document id: {e}");
            return ExitCode::FAILURE;
        }
        None => None,
    };

    let store = match RocksStore::open(StoreConfig::new(&path)) {
        Ok(store) => store,
        Err(e) => {
            error!("could not open store at {path}: {e}");
            return ExitCode::FAILURE;
        }
    };
    let result = match document {
        Some(id) => show(&store, id),
        None => list(&store),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
