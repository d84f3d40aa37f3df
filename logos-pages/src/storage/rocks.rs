//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `pages`     : Page record (info + durable head sequence), keyed by page_id
//! - `blocks`    : One record per block, keyed by page_id:block_id
//! - `operations`: LZ4-compressed log entries, keyed by page_id:sequence (BE)
//!
//! Performance targets:
//! - Page load (1k blocks, cache hit): <2ms
//! - Flush (10 ops + touched blocks): <100μs
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)
//! Reference: Patterson & Hennessy, Section 5.7 (I/O Performance)

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use crate::block::{Block, BlockId, PageId, PageInfo};
use crate::operation::AppliedOperation;

use super::{decode, encode, DocumentStore, FlushBatch, StoreError, StoredPage};

/// Column family names.
const CF_PAGES: &str = "pages";
const CF_BLOCKS: &str = "blocks";
const CF_OPERATIONS: &str = "operations";

const COLUMN_FAMILIES: &[&str] = &[CF_PAGES, CF_BLOCKS, CF_OPERATIONS];

/// Length of a page id key prefix.
const PREFIX_LEN: usize = 16;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every flush (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logos_pages_data"),
            block_cache_size: 256 * 1024 * 1024, // 256MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// Value stored in the `pages` column family.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PageRecord {
    page: PageInfo,
    sequence: u64,
}

/// RocksDB-backed document store.
pub struct RocksDocumentStore {
    /// RocksDB instance (single-threaded mode; concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksDocumentStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024); // 128MB WAL limit
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened page store at {}", config.path.display());

        Ok(Self { db, config })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_PAGES => {
                // Small values, point lookups
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_BLOCKS | CF_OPERATIONS => {
                // Many small writes, prefix-scanned by page_id
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(
                    PREFIX_LEN,
                ));
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Force a memtable flush to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn load_record(&self, page_id: PageId) -> Result<Option<PageRecord>, StoreError> {
        let cf = self.cf(CF_PAGES)?;
        match self.db.get_cf(&cf, page_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every `(key, value)` under a page id prefix, starting at `from`.
    fn scan_page(
        &self,
        cf_name: &str,
        page_id: PageId,
        from: &[u8],
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
        let cf = self.cf(cf_name)?;
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(from, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() < PREFIX_LEN || &key[..PREFIX_LEN] != page_id.as_bytes() {
                break;
            }
            out.push((key, value));
        }
        Ok(out)
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    /// page_id (16 bytes) + block_id (16 bytes).
    fn block_key(page_id: PageId, block_id: BlockId) -> Vec<u8> {
        let mut key = Vec::with_capacity(32);
        key.extend_from_slice(page_id.as_bytes());
        key.extend_from_slice(block_id.as_bytes());
        key
    }

    /// page_id (16 bytes) + sequence (8 bytes big-endian).
    fn operation_key(page_id: PageId, sequence: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(page_id.as_bytes());
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }
}

#[async_trait]
impl DocumentStore for RocksDocumentStore {
    async fn create_page(&self, page: PageInfo) -> Result<(), StoreError> {
        if self.load_record(page.id)?.is_some() {
            return Err(StoreError::AlreadyExists(page.id));
        }
        let cf = self.cf(CF_PAGES)?;
        let mut batch = WriteBatch::default();
        let page_id = page.id;
        batch.put_cf(&cf, page_id.as_bytes(), encode(&PageRecord { page, sequence: 0 })?);
        self.write(batch)
    }

    async fn load_page(&self, page_id: PageId) -> Result<StoredPage, StoreError> {
        let record = self
            .load_record(page_id)?
            .ok_or(StoreError::NotFound(page_id))?;
        let blocks = self
            .scan_page(CF_BLOCKS, page_id, page_id.as_bytes())?
            .into_iter()
            .map(|(_, value)| decode::<Block>(&value))
            .collect::<Result<Vec<_>, _>>()?;
        log::debug!(
            "Loaded page {page_id}: {} blocks at sequence {}",
            blocks.len(),
            record.sequence
        );
        Ok(StoredPage {
            page: record.page,
            blocks,
            sequence: record.sequence,
        })
    }

    async fn flush(&self, flush: &FlushBatch) -> Result<(), StoreError> {
        let cf_pages = self.cf(CF_PAGES)?;
        let cf_blocks = self.cf(CF_BLOCKS)?;
        let cf_ops = self.cf(CF_OPERATIONS)?;
        let page_id = flush.page_id();

        let mut batch = WriteBatch::default();
        let record = PageRecord {
            page: flush.page.clone(),
            sequence: flush.sequence,
        };
        batch.put_cf(&cf_pages, page_id.as_bytes(), encode(&record)?);
        for block in &flush.blocks {
            batch.put_cf(&cf_blocks, Self::block_key(page_id, block.id), encode(block)?);
        }
        for op in &flush.operations {
            let compressed = lz4_flex::compress_prepend_size(&encode(op.as_ref())?);
            batch.put_cf(&cf_ops, Self::operation_key(page_id, op.sequence), compressed);
        }
        self.write(batch)
    }

    async fn load_operations(
        &self,
        page_id: PageId,
        since: u64,
    ) -> Result<Vec<AppliedOperation>, StoreError> {
        if self.load_record(page_id)?.is_none() {
            return Err(StoreError::NotFound(page_id));
        }
        let start = Self::operation_key(page_id, since.saturating_add(1));
        self.scan_page(CF_OPERATIONS, page_id, &start)?
            .into_iter()
            .map(|(_, value)| {
                let raw = lz4_flex::decompress_size_prepended(&value)
                    .map_err(|e| StoreError::CompressionError(e.to_string()))?;
                decode::<AppliedOperation>(&raw)
            })
            .collect()
    }
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{fields, BlockType};
    use crate::operation::{Operation, OperationKind, OperationRequest, Placement};
    use crate::order_key::OrderKey;
    use std::sync::Arc;
    use uuid::Uuid;

    fn open(dir: &tempfile::TempDir) -> RocksDocumentStore {
        RocksDocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap()
    }

    fn block(page_id: PageId, text: &str) -> Block {
        Block::new(
            Uuid::new_v4(),
            page_id,
            None,
            BlockType::Paragraph,
            fields([("text", text)]),
            OrderKey::first(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            0,
            1,
        )
    }

    fn applied(block: &Block, sequence: u64) -> Arc<AppliedOperation> {
        let mut operation = Operation::from_request(
            OperationRequest {
                page_id: block.page_id,
                block_id: block.id,
                kind: OperationKind::Insert {
                    parent_id: None,
                    placement: Placement::End,
                    block_type: block.block_type,
                    content: block.content.clone(),
                },
                base_version: 0,
                observed_sequence: sequence - 1,
            },
            Uuid::new_v4(),
            Uuid::new_v4(),
            0,
        );
        operation.sequence = sequence;
        Arc::new(AppliedOperation {
            sequence,
            operation,
            blocks: vec![block.clone()],
            before: None,
            outcomes: Vec::new(),
            rescued: Vec::new(),
        })
    }

    #[tokio::test]
    async fn test_store_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        assert!(store.path().exists());
    }

    #[tokio::test]
    async fn test_create_page_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let page = PageInfo::new(Uuid::new_v4(), Uuid::new_v4(), "Specs");
        store.create_page(page.clone()).await.unwrap();
        assert_eq!(
            store.create_page(page.clone()).await,
            Err(StoreError::AlreadyExists(page.id))
        );
        assert_eq!(
            store.load_page(page.id).await.unwrap(),
            StoredPage::empty(page)
        );
    }

    #[tokio::test]
    async fn test_page_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let id = Uuid::new_v4();
        assert_eq!(store.load_page(id).await, Err(StoreError::NotFound(id)));
    }

    #[tokio::test]
    async fn test_flush_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let page = PageInfo::new(Uuid::new_v4(), Uuid::new_v4(), "Specs");
        let first = block(page.id, "one");
        let second = block(page.id, "two");
        {
            let store = open(&dir);
            store.create_page(page.clone()).await.unwrap();
            store
                .flush(&FlushBatch {
                    page: page.clone(),
                    blocks: vec![first.clone(), second.clone()],
                    operations: vec![applied(&first, 1), applied(&second, 2)],
                    sequence: 2,
                })
                .await
                .unwrap();
            store.sync().unwrap();
        }

        let store = open(&dir);
        let loaded = store.load_page(page.id).await.unwrap();
        assert_eq!(loaded.sequence, 2);
        assert_eq!(loaded.blocks.len(), 2);
        assert!(loaded.blocks.contains(&first));
        assert!(loaded.blocks.contains(&second));

        let ops = store.load_operations(page.id, 1).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].sequence, 2);
        assert_eq!(ops[0].blocks[0], second);
    }

    #[tokio::test]
    async fn test_pages_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let a = PageInfo::new(Uuid::new_v4(), Uuid::new_v4(), "A");
        let b = PageInfo::new(Uuid::new_v4(), Uuid::new_v4(), "B");
        store.create_page(a.clone()).await.unwrap();
        store.create_page(b.clone()).await.unwrap();

        let in_a = block(a.id, "only in a");
        store
            .flush(&FlushBatch {
                page: a.clone(),
                blocks: vec![in_a.clone()],
                operations: vec![applied(&in_a, 1)],
                sequence: 1,
            })
            .await
            .unwrap();

        assert_eq!(store.load_page(a.id).await.unwrap().blocks, vec![in_a]);
        assert!(store.load_page(b.id).await.unwrap().blocks.is_empty());
        assert!(store.load_operations(b.id, 0).await.unwrap().is_empty());
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.block_cache_size, 256 * 1024 * 1024);
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
    }
}
