//! In-process document store for tests and storage-less deployments.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::block::{Block, BlockId, PageId, PageInfo};
use crate::operation::AppliedOperation;

use super::{DocumentStore, FlushBatch, StoreError, StoredPage};

#[derive(Default)]
struct PageRecord {
    page: Option<PageInfo>,
    blocks: HashMap<BlockId, Block>,
    operations: BTreeMap<u64, AppliedOperation>,
    sequence: u64,
}

/// Document store held in a mutex-guarded map.
#[derive(Default)]
pub struct MemoryDocumentStore {
    pages: Mutex<HashMap<PageId, PageRecord>>,
    fail_flushes: AtomicBool,
    loads: AtomicU64,
    flushes: AtomicU64,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a page with existing blocks.
    pub fn insert_page(&self, stored: StoredPage) -> Result<(), StoreError> {
        let mut pages = self.lock()?;
        pages.insert(
            stored.page.id,
            PageRecord {
                page: Some(stored.page),
                blocks: stored.blocks.into_iter().map(|b| (b.id, b)).collect(),
                operations: BTreeMap::new(),
                sequence: stored.sequence,
            },
        );
        Ok(())
    }

    /// Make every subsequent flush fail (or succeed again).
    pub fn set_fail_flushes(&self, fail: bool) {
        self.fail_flushes.store(fail, Ordering::Relaxed);
    }

    /// Number of `load_page` calls served.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    /// Number of successful flushes.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<PageId, PageRecord>>, StoreError> {
        self.pages
            .lock()
            .map_err(|_| StoreError::IoError("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn create_page(&self, page: PageInfo) -> Result<(), StoreError> {
        let mut pages = self.lock()?;
        if pages.get(&page.id).is_some_and(|r| r.page.is_some()) {
            return Err(StoreError::AlreadyExists(page.id));
        }
        pages.insert(
            page.id,
            PageRecord {
                page: Some(page),
                ..PageRecord::default()
            },
        );
        Ok(())
    }

    async fn load_page(&self, page_id: PageId) -> Result<StoredPage, StoreError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        let pages = self.lock()?;
        let record = pages.get(&page_id).ok_or(StoreError::NotFound(page_id))?;
        let page = record.page.clone().ok_or(StoreError::NotFound(page_id))?;
        Ok(StoredPage {
            page,
            blocks: record.blocks.values().cloned().collect(),
            sequence: record.sequence,
        })
    }

    async fn flush(&self, batch: &FlushBatch) -> Result<(), StoreError> {
        if self.fail_flushes.load(Ordering::Relaxed) {
            return Err(StoreError::IoError("flush disabled".into()));
        }
        let mut pages = self.lock()?;
        let record = pages.entry(batch.page_id()).or_default();
        record.page = Some(batch.page.clone());
        for block in &batch.blocks {
            record.blocks.insert(block.id, block.clone());
        }
        for op in &batch.operations {
            record.operations.insert(op.sequence, op.as_ref().clone());
        }
        record.sequence = record.sequence.max(batch.sequence);
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn load_operations(
        &self,
        page_id: PageId,
        since: u64,
    ) -> Result<Vec<AppliedOperation>, StoreError> {
        let pages = self.lock()?;
        let record = pages.get(&page_id).ok_or(StoreError::NotFound(page_id))?;
        Ok(record
            .operations
            .range(since.saturating_add(1)..)
            .map(|(_, op)| op.clone())
            .collect())
    }
}
