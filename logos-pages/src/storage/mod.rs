//! Durable document store behind the page sessions.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  load_page   ┌─────────────────────┐
//! │ PageSession  │ ◄─────────── │   DocumentStore     │
//! │ (in-memory)  │ ───────────► │ (memory | RocksDB)  │
//! └──────────────┘  FlushBatch  └──────────┬──────────┘
//!                                          │ column families
//!                                          ▼
//!                       ┌──────────────────────────────────────┐
//!                       │ CF "pages"      page info + head seq │
//!                       │ CF "blocks"     page_id ‖ block_id   │
//!                       │ CF "operations" page_id ‖ seq (LZ4)  │
//!                       └──────────────────────────────────────┘
//! ```
//!
//! A flush is atomic per page: the page record, every touched block, and
//! every new log entry land in one write batch.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 3

pub mod memory;
pub mod rocks;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::block::{Block, PageId, PageInfo};
use crate::operation::AppliedOperation;

pub use memory::MemoryDocumentStore;
pub use rocks::{RocksDocumentStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Page not found
    NotFound(Uuid),
    /// Page already exists
    AlreadyExists(Uuid),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    /// I/O error
    IoError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Page not found: {id}"),
            StoreError::AlreadyExists(id) => write!(f, "Page already exists: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::IoError(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// A page as persisted: metadata, every block (tombstones included), and
/// the last durable sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPage {
    pub page: PageInfo,
    pub blocks: Vec<Block>,
    pub sequence: u64,
}

impl StoredPage {
    pub fn empty(page: PageInfo) -> Self {
        Self {
            page,
            blocks: Vec::new(),
            sequence: 0,
        }
    }
}

/// Everything that changed on a page since its last flush.
#[derive(Debug, Clone)]
pub struct FlushBatch {
    pub page: PageInfo,
    /// Post-state of every block touched by `operations`
    pub blocks: Vec<Block>,
    /// New log entries, ascending
    pub operations: Vec<Arc<AppliedOperation>>,
    /// Head sequence after this batch
    pub sequence: u64,
}

impl FlushBatch {
    pub fn page_id(&self) -> PageId {
        self.page.id
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Durable home of pages, blocks, and operation history.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Register a new, empty page.
    async fn create_page(&self, page: PageInfo) -> Result<(), StoreError>;

    /// Load a page's metadata and block set.
    async fn load_page(&self, page_id: PageId) -> Result<StoredPage, StoreError>;

    /// Persist a flush batch atomically.
    async fn flush(&self, batch: &FlushBatch) -> Result<(), StoreError>;

    /// Persisted operations with sequence greater than `since`, ascending.
    async fn load_operations(
        &self,
        page_id: PageId,
        since: u64,
    ) -> Result<Vec<AppliedOperation>, StoreError>;
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let id = Uuid::nil();
        assert!(StoreError::NotFound(id).to_string().contains("not found"));
        assert!(StoreError::AlreadyExists(id).to_string().contains("exists"));
        assert!(StoreError::CompressionError("bad frame".into())
            .to_string()
            .contains("bad frame"));
    }

    #[test]
    fn test_stored_page_codec() {
        let page = PageInfo::new(Uuid::new_v4(), Uuid::new_v4(), "Roadmap");
        let stored = StoredPage::empty(page);
        let bytes = encode(&stored).unwrap();
        let back: StoredPage = decode(&bytes).unwrap();
        assert_eq!(back, stored);
        assert!(decode::<StoredPage>(&bytes[..bytes.len() / 2]).is_err());
    }
}
