//! Append-only block storage over a blob store table.
//!
//! Row 0 of the table holds the [`AddressIndex`], rows 1..=N hold payload
//! blocks capped at `max_block_size`. Writers go through
//! [`BlockStore::validate_for_insert`] and [`BlockStore::append`]; readers
//! call [`BlockStore::validate`] and read through the shared region cache.

use super::address::{Address, AddressIndex};
use super::blob::{BlobStore, TableLock, TableStats};
use super::shared::{RegionSet, SharedCache, SharedCacheConfig, SharedRegion};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;
use tracing::debug;

/// Default cap of one payload block (8 MiB)
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 8 * 1024 * 1024;

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Maximum bytes per block
    pub max_block_size: usize,
    /// Shared region cache settings
    pub shared: SharedCacheConfig,
}

impl StorageConfig {
    /// Addresses hold block offsets as u32
    pub fn check(&self) -> Result<()> {
        if self.max_block_size == 0 || self.max_block_size > u32::MAX as usize {
            return Err(Error::InvalidConfiguration(format!(
                "max_block_size must be in 1..={}, got {}",
                u32::MAX,
                self.max_block_size
            )));
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            shared: SharedCacheConfig::default(),
        }
    }
}

/// Writer cursors: the top payload row and the index row fill
#[derive(Debug, Clone, Copy)]
struct WriteHandles {
    top_row: Option<u32>,
    index_fill: u64,
}

pub struct BlockStore {
    blob: Arc<dyn BlobStore>,
    table: String,
    max_block_size: usize,
    block_sizes: Vec<u64>,
    index: AddressIndex,
    cache: SharedCache,
    loaded: Option<Arc<RegionSet>>,
    handles: Option<WriteHandles>,
    /// Appends or tombstones staged since the last flush
    dirty: bool,
}

impl BlockStore {
    pub fn new(blob: Arc<dyn BlobStore>, table: &str, config: &StorageConfig) -> Self {
        let cache = SharedCache::new(blob.identity(), table, config.shared.clone());
        Self {
            blob,
            table: table.to_string(),
            max_block_size: config.max_block_size.clamp(1, u32::MAX as usize),
            block_sizes: Vec::new(),
            index: AddressIndex::new(),
            cache,
            loaded: None,
            handles: None,
            dirty: false,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    pub fn cache(&mut self) -> &mut SharedCache {
        &mut self.cache
    }

    /// Create the table with an empty index row
    pub fn create(&mut self) -> Result<()> {
        self.blob.create_table(&self.table)?;
        self.blob.insert_row(&self.table, 0)?;
        self.blob.commit()?;
        self.reset_local();
        self.cache.invalidate()?;
        debug!(table = %self.table, "created block storage");
        Ok(())
    }

    pub fn drop_table(&mut self) -> Result<()> {
        self.blob.drop_table(&self.table)?;
        self.reset_local();
        self.cache.invalidate()?;
        debug!(table = %self.table, "dropped block storage");
        Ok(())
    }

    /// Remove every record, keeping the table and an empty index row
    pub fn truncate(&mut self) -> Result<()> {
        self.blob.truncate_table(&self.table)?;
        self.blob.insert_row(&self.table, 0)?;
        self.blob.commit()?;
        self.reset_local();
        self.cache.invalidate()?;
        debug!(table = %self.table, "truncated block storage");
        Ok(())
    }

    pub fn analyze(&self) -> Result<TableStats> {
        self.blob.analyze_table(&self.table)
    }

    /// Exclusive lock on the backing table
    pub fn lock(&self) -> Result<TableLock> {
        self.blob.lock_table(&self.table)
    }

    fn reset_local(&mut self) {
        self.block_sizes.clear();
        self.index.clear();
        self.loaded = None;
        self.handles = None;
        self.dirty = false;
    }

    /// Bring the loaded representation up to date with the backing store
    pub fn validate(&mut self) -> Result<()> {
        if self.dirty {
            return Err(Error::UnflushedWrites(self.table.clone()));
        }
        let set = self.cache.validate(self.blob.as_ref(), &self.table)?;
        if self
            .loaded
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &set))
        {
            return Ok(());
        }

        self.index = AddressIndex::decode(&self.table, set.index())?;
        self.block_sizes = set.block_sizes();
        debug!(
            table = %self.table,
            version = set.version,
            records = self.index.len(),
            blocks = self.block_sizes.len(),
            "block storage validated"
        );
        self.loaded = Some(set);
        Ok(())
    }

    /// Read the row table and address index from the backing store and
    /// acquire write handles.
    pub fn validate_for_insert(&mut self) -> Result<()> {
        let rows = self.blob.rows(&self.table)?;
        let Some(index_row) = rows.iter().find(|r| r.key == 0) else {
            return Err(Error::MissingIndex {
                table: self.table.clone(),
            });
        };
        AddressIndex::count_for_size(&self.table, index_row.len)?;

        let mut block_sizes = Vec::with_capacity(rows.len().saturating_sub(1));
        for row in rows.iter().filter(|r| r.key != 0) {
            if row.key as usize != block_sizes.len() + 1 {
                return Err(Error::CorruptBlock {
                    block: row.key as usize,
                    reason: format!("expected row {}", block_sizes.len() + 1),
                });
            }
            block_sizes.push(row.len);
        }

        let bytes = self.blob.read_row(&self.table, 0)?.unwrap_or_default();
        self.index = AddressIndex::decode(&self.table, &bytes)?;
        self.block_sizes = block_sizes;
        self.acquire_handles();

        debug!(
            table = %self.table,
            records = self.index.len(),
            blocks = self.block_sizes.len(),
            "block storage ready for insert"
        );
        Ok(())
    }

    fn acquire_handles(&mut self) {
        self.handles = Some(WriteHandles {
            top_row: (!self.block_sizes.is_empty()).then_some(self.block_sizes.len() as u32),
            index_fill: (self.index.len() * Address::SIZE) as u64,
        });
    }

    /// Append a record, opening a new block when the top one would overflow
    pub fn append(&mut self, data: &[u8]) -> Result<Address> {
        let Some(mut handles) = self.handles else {
            return Err(Error::NotWritable(self.table.clone()));
        };
        if data.len() > self.max_block_size {
            return Err(Error::RecordTooLarge {
                length: data.len(),
                max: self.max_block_size,
            });
        }

        self.dirty = true;
        let top_full = match self.block_sizes.last() {
            Some(&size) => size + data.len() as u64 > self.max_block_size as u64,
            None => true,
        };
        if top_full {
            let row = self.block_sizes.len() as u32 + 1;
            self.blob.insert_row(&self.table, row)?;
            self.block_sizes.push(0);
            handles.top_row = Some(row);
            debug!(table = %self.table, row, "opened new block");
        }

        let block_id = self.block_sizes.len() - 1;
        let offset = self.block_sizes[block_id];
        let row = handles.top_row.unwrap_or(block_id as u32 + 1);
        self.blob.write(&self.table, row, offset, data)?;
        self.block_sizes[block_id] += data.len() as u64;

        let addr = Address {
            block_id: block_id as u32,
            offset: offset as u32,
            length: data.len() as u32,
        };
        self.blob
            .write(&self.table, 0, handles.index_fill, &addr.to_bytes())?;
        handles.index_fill += Address::SIZE as u64;
        self.index.push(addr);
        self.handles = Some(handles);

        self.cache.bump_version()?;
        Ok(addr)
    }

    /// Overwrite the first byte of a record with the tombstone sentinel
    pub fn mark_tombstone(&mut self, addr: Address) -> Result<()> {
        if self.handles.is_none() {
            return Err(Error::NotWritable(self.table.clone()));
        }
        let size = self
            .block_sizes
            .get(addr.block_id as usize)
            .copied()
            .unwrap_or(0);
        if addr.length == 0 || addr.end() > size {
            return Err(self.out_of_range(addr, size));
        }
        self.dirty = true;
        self.blob
            .write(&self.table, addr.block_id + 1, addr.offset as u64, &[1])?;
        self.cache.bump_version()?;
        Ok(())
    }

    /// Commit pending writes, then reacquire write handles
    pub fn flush(&mut self) -> Result<()> {
        let writing = self.handles.take().is_some();
        self.blob.commit()?;
        self.dirty = false;
        // Readers that reloaded between an append and this commit saw the
        // old rows under the new version
        self.cache.bump_version()?;
        if writing {
            self.acquire_handles();
        }
        debug!(table = %self.table, records = self.index.len(), "block storage flushed");
        Ok(())
    }

    /// Release write handles without committing
    pub fn finish(&mut self) {
        self.handles = None;
    }

    pub fn is_writable(&self) -> bool {
        self.handles.is_some()
    }

    /// Number of records known to this handle
    pub fn count(&self) -> usize {
        self.index.len()
    }

    pub fn block_count(&self) -> usize {
        self.block_sizes.len()
    }

    pub fn block_sizes(&self) -> &[u64] {
        &self.block_sizes
    }

    pub fn address(&self, n: usize) -> Option<Address> {
        self.index.get(n).copied()
    }

    pub fn addresses(&self) -> &AddressIndex {
        &self.index
    }

    /// Version of the loaded shared copy
    pub fn loaded_version(&self) -> Option<u64> {
        self.loaded.as_ref().map(|set| set.version)
    }

    fn out_of_range(&self, addr: Address, size: u64) -> Error {
        Error::OutOfRange {
            block: addr.block_id,
            offset: addr.offset,
            length: addr.length,
            size,
        }
    }

    /// Region and byte range of a record in the loaded representation
    pub fn fetch_region(&self, addr: Address) -> Result<(Arc<SharedRegion>, Range<usize>)> {
        let region = self
            .loaded
            .as_ref()
            .and_then(|set| set.block(addr.block_id as usize))
            .ok_or_else(|| self.out_of_range(addr, 0))?;
        if addr.end() > region.len() as u64 {
            return Err(self.out_of_range(addr, region.len() as u64));
        }
        let start = addr.offset as usize;
        Ok((Arc::clone(region), start..start + addr.length as usize))
    }

    /// Bytes of a record in the loaded representation
    pub fn fetch(&self, addr: Address) -> Result<&[u8]> {
        let region = self
            .loaded
            .as_ref()
            .and_then(|set| set.block(addr.block_id as usize))
            .ok_or_else(|| self.out_of_range(addr, 0))?;
        let bytes = region.as_slice();
        if addr.end() > bytes.len() as u64 {
            return Err(self.out_of_range(addr, bytes.len() as u64));
        }
        Ok(&bytes[addr.offset as usize..addr.end() as usize])
    }
}
