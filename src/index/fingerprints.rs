//! Fingerprint index: append path, screening and one-counting.
//!
//! Committed blocks live in a [`BlockStore`] table, one serialized
//! [`FingerprintBlock`] per record. The writer buffers new fingerprints in a
//! [`PendingBlock`] and seals it into a block once it holds `block_rows`
//! rows or on [`FingerprintIndex::flush`]. Record ids are positional: block
//! `k` covers ids `base_k .. base_k + used_k` where the bases are prefix sums
//! of the block sizes.
//!
//! Blocks are visited in order: committed (shared) blocks, blocks sealed by
//! this writer since the last validate, then the pending buffer.

use super::block::{encoded_len_for, BlockLayout, ColumnSource, FingerprintBlock};
use super::pending::PendingBlock;
use super::screening::{row_window, scan_columns, scan_pending, BlockCursor, BlockData, Screening};
use super::types::{IndexConfig, RecordId};
use crate::error::{Error, Result};
use crate::storage::{Address, BlobStore, BlockStore, TableLock, TableStats};
use roaring::RoaringBitmap;
use std::sync::Arc;
use tracing::{debug, info};

/// Committed block as seen after the last validate
#[derive(Debug, Clone, Copy)]
struct CommittedBlock {
    addr: Address,
    base: RecordId,
    layout: BlockLayout,
}

/// Block sealed by this writer, kept until a validate picks it up
#[derive(Debug, Clone)]
struct SealedBlock {
    block_no: usize,
    base: RecordId,
    block: Arc<FingerprintBlock>,
}

pub struct FingerprintIndex {
    config: IndexConfig,
    store: BlockStore,
    pending: PendingBlock,
    committed: Vec<CommittedBlock>,
    committed_rows: usize,
    sealed: Vec<SealedBlock>,
    loaded_version: Option<u64>,
}

impl FingerprintIndex {
    pub fn new(blob: Arc<dyn BlobStore>, table: &str, config: IndexConfig) -> Result<Self> {
        config.check()?;
        // A full block must fit in one storage block
        let mut storage = config.storage.clone();
        storage.max_block_size = storage
            .max_block_size
            .max(encoded_len_for(config.fp_bytes, config.block_rows));
        let store = BlockStore::new(blob, table, &storage);
        Ok(Self {
            pending: PendingBlock::new(config.fp_bytes),
            config,
            store,
            committed: Vec::new(),
            committed_rows: 0,
            sealed: Vec::new(),
            loaded_version: None,
        })
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn fp_bytes(&self) -> usize {
        self.config.fp_bytes
    }

    pub fn create(&mut self) -> Result<()> {
        self.reset_local();
        self.store.create()
    }

    pub fn drop_table(&mut self) -> Result<()> {
        self.reset_local();
        self.store.drop_table()
    }

    pub fn truncate(&mut self) -> Result<()> {
        self.reset_local();
        self.store.truncate()
    }

    pub fn analyze_table(&self) -> Result<TableStats> {
        self.store.analyze()
    }

    pub fn lock(&self) -> Result<TableLock> {
        self.store.lock()
    }

    fn reset_local(&mut self) {
        self.pending.clear();
        self.committed.clear();
        self.committed_rows = 0;
        self.sealed.clear();
        self.loaded_version = None;
    }

    /// Load the committed blocks from shared storage
    pub fn validate(&mut self) -> Result<()> {
        self.store.validate()?;
        let version = self.store.loaded_version();
        if version.is_some() && version == self.loaded_version {
            return Ok(());
        }

        let mut committed = Vec::with_capacity(self.store.count());
        let mut rows = 0usize;
        for (block_no, addr) in self.store.addresses().iter().enumerate() {
            let layout = BlockLayout::parse(block_no, self.store.fetch(*addr)?)?;
            if layout.fp_bytes() != self.config.fp_bytes {
                return Err(Error::InvalidConfiguration(format!(
                    "block {} holds {}-byte fingerprints, index is configured for {}",
                    block_no,
                    layout.fp_bytes(),
                    self.config.fp_bytes
                )));
            }
            committed.push(CommittedBlock {
                addr: *addr,
                base: rows as RecordId,
                layout,
            });
            rows += layout.used();
        }

        let committed_count = committed.len();
        self.sealed.retain(|s| s.block_no >= committed_count);
        self.committed = committed;
        self.committed_rows = rows;
        self.loaded_version = version;

        debug!(
            table = %self.store.table(),
            blocks = self.committed.len(),
            fingerprints = rows,
            "fingerprint blocks validated"
        );
        Ok(())
    }

    /// Prepare for appending: acquire write handles and pick up the block
    /// count from the backing store.
    pub fn validate_for_update(&mut self) -> Result<()> {
        self.store.validate_for_insert()?;
        self.pending.clear();
        self.validate()
    }

    /// Buffer one fingerprint; seals the pending block when full
    pub fn add_fingerprint(&mut self, fp: &[u8]) -> Result<RecordId> {
        if fp.len() != self.config.fp_bytes {
            return Err(Error::InvalidConfiguration(format!(
                "fingerprint is {} bytes, index expects {}",
                fp.len(),
                self.config.fp_bytes
            )));
        }
        if !self.store.is_writable() {
            return Err(Error::NotWritable(self.store.table().to_string()));
        }

        let id = self.get_total_count() as RecordId;
        self.pending.push(fp);
        if self.pending.len() >= self.config.block_rows {
            self.seal_pending()?;
        }
        Ok(id)
    }

    fn seal_pending(&mut self) -> Result<()> {
        let base = self.pending_base();
        let block = self.pending.seal();
        let rows = block.used();
        self.store.append(&block.encode())?;

        let block_no = self.committed.len() + self.sealed.len();
        self.sealed.push(SealedBlock {
            block_no,
            base,
            block: Arc::new(block),
        });
        debug!(block = block_no, rows, "sealed fingerprint block");
        Ok(())
    }

    /// Seal a non-empty pending block and commit
    pub fn flush(&mut self) -> Result<()> {
        self.seal_pending_if_any()?;
        self.store.flush()
    }

    /// Stage the pending rows without committing, so that callers sharing
    /// the blob store can commit once.
    pub fn seal_pending_if_any(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            self.seal_pending()?;
        }
        Ok(())
    }

    pub fn finish(&mut self) {
        self.store.finish();
    }

    fn sealed_rows(&self) -> usize {
        self.sealed.iter().map(|s| s.block.used()).sum()
    }

    fn pending_base(&self) -> RecordId {
        (self.committed_rows + self.sealed_rows()) as RecordId
    }

    /// Fingerprints visible to this handle, pending ones included
    pub fn get_total_count(&self) -> usize {
        self.committed_rows + self.sealed_rows() + self.pending.len()
    }

    /// Number of stored blocks (committed plus sealed)
    pub fn count_blocks(&self) -> usize {
        self.committed.len() + self.sealed.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn block_slots(&self) -> usize {
        self.count_blocks() + usize::from(!self.pending.is_empty())
    }

    /// Open block `slot` in scan order
    fn open_block(&self, slot: usize) -> Result<Option<(BlockData, RecordId, usize)>> {
        if let Some(block) = self.committed.get(slot) {
            let (region, range) = self.store.fetch_region(block.addr)?;
            let used = block.layout.used();
            let data = BlockData::Mapped {
                region,
                range,
                layout: block.layout,
            };
            return Ok(Some((data, block.base, used)));
        }
        let slot = slot - self.committed.len();
        if let Some(sealed) = self.sealed.get(slot) {
            let used = sealed.block.used();
            return Ok(Some((BlockData::Owned(Arc::clone(&sealed.block)), sealed.base, used)));
        }
        if slot == self.sealed.len() && !self.pending.is_empty() {
            let data = BlockData::Pending {
                generation: self.pending.generation(),
            };
            return Ok(Some((data, self.pending_base(), self.pending.len())));
        }
        Ok(None)
    }

    /// Start a screening session for `query`
    pub fn screen_init(&self, query: &[u8]) -> Result<Screening> {
        if query.len() != self.config.fp_bytes {
            return Err(Error::InvalidConfiguration(format!(
                "query is {} bytes, index expects {}",
                query.len(),
                self.config.fp_bytes
            )));
        }
        Ok(Screening::new(query, self.config.priority))
    }

    /// Whether screening can prune anything: the query has set bits
    pub fn able_to_screen(&self, screening: &Screening) -> bool {
        !screening.query_ones.is_empty()
    }

    /// Advance to the next block; false when every block was visited
    pub fn screen_part_init(&self, screening: &mut Screening) -> Result<bool> {
        screening.current = None;
        let Some((data, base, used)) = self.open_block(screening.next_block)? else {
            return Ok(false);
        };
        screening.next_block += 1;

        let window = match &data {
            BlockData::Pending { .. } => 0..used,
            BlockData::Owned(block) => {
                row_window(block.as_ref(), &screening.query_ones, screening.query_count)
            }
            BlockData::Mapped {
                region,
                range,
                layout,
            } => {
                let view = layout.view(&region.as_slice()[range.clone()]);
                row_window(&view, &screening.query_ones, screening.query_count)
            }
        };

        screening.current = Some(BlockCursor {
            data,
            base,
            next_row: window.start,
            end_row: window.end,
        });
        Ok(true)
    }

    /// Scan one chunk of the current block; true while rows remain.
    ///
    /// # Panics
    ///
    /// Panics if called without a successful `screen_part_init`.
    pub fn screen_part_next(&self, screening: &mut Screening) -> Result<bool> {
        let Screening {
            query,
            query_ones,
            query_count,
            passed,
            items_read,
            current,
            ..
        } = screening;
        let cursor = current
            .as_mut()
            .expect("screen_part_next called without screen_part_init");

        let rows = cursor.next_row..cursor.end_row;
        let chunk_rows = self.config.chunk_words.max(1) * 64;
        let next = match &cursor.data {
            BlockData::Pending { generation } => {
                // Sealed or cleared since the block was opened
                if *generation != self.pending.generation() {
                    cursor.next_row = cursor.end_row;
                    return Ok(false);
                }
                let stop = rows.end.min(rows.start + chunk_rows).min(self.pending.len());
                scan_pending(&self.pending, query, *query_count, rows.start..stop, cursor.base, passed);
                stop
            }
            BlockData::Owned(block) => scan_columns(
                block.as_ref(),
                query_ones,
                rows.clone(),
                self.config.chunk_words,
                cursor.base,
                passed,
            ),
            BlockData::Mapped {
                region,
                range,
                layout,
            } => {
                let view = layout.view(&region.as_slice()[range.clone()]);
                scan_columns(
                    &view,
                    query_ones,
                    rows.clone(),
                    self.config.chunk_words,
                    cursor.base,
                    passed,
                )
            }
        };

        *items_read += next.saturating_sub(rows.start);
        cursor.next_row = next;
        Ok(next < cursor.end_row)
    }

    /// Release the current block
    pub fn screen_part_end(&self, screening: &mut Screening) {
        screening.current = None;
    }

    /// Translate a sorted row of the current block into a record id
    pub fn get_storage_index(&self, screening: &Screening, local: usize) -> Option<RecordId> {
        let cursor = screening.current.as_ref()?;
        let original = match &cursor.data {
            BlockData::Pending { generation } => {
                let live = *generation == self.pending.generation();
                (live && local < self.pending.len()).then_some(local)?
            }
            BlockData::Owned(block) => {
                (local < block.used()).then(|| block.mapping(local) as usize)?
            }
            BlockData::Mapped {
                region,
                range,
                layout,
            } => {
                let view = layout.view(&region.as_slice()[range.clone()]);
                (local < view.used()).then(|| view.mapping(local) as usize)?
            }
        };
        Some(cursor.base + original as RecordId)
    }

    /// Run the whole screening protocol and collect passing ids
    pub fn screen(&self, query: &[u8]) -> Result<RoaringBitmap> {
        let mut screening = self.screen_init(query)?;
        if screening.query_ones.len() > 1 && self.count_blocks() > 0 {
            self.count_ones(&mut screening)?;
        }
        self.screen_all(&mut screening)
    }

    /// Screen every remaining block of an initialized session
    pub fn screen_all(&self, screening: &mut Screening) -> Result<RoaringBitmap> {
        let mut result = RoaringBitmap::new();
        while self.screen_part_init(screening)? {
            while self.screen_part_next(screening)? {}
            result.extend(screening.take_passed());
            self.screen_part_end(screening);
        }
        debug!(
            candidates = result.len(),
            rows_read = screening.items_read(),
            "screening finished"
        );
        Ok(result)
    }

    /// Advance to the next block for one-counting; false when done
    pub fn count_ones_init(&self, screening: &mut Screening) -> Result<bool> {
        screening.current = None;
        if screening.counted {
            return Ok(false);
        }
        let Some((data, base, used)) = self.open_block(screening.next_block)? else {
            return Ok(false);
        };
        screening.next_block += 1;
        screening.next_count_bit = 0;
        screening.current = Some(BlockCursor {
            data,
            base,
            next_row: 0,
            end_row: used,
        });
        Ok(true)
    }

    /// Count one chunk of query bits in the current block; true while bits
    /// remain.
    ///
    /// # Panics
    ///
    /// Panics if called without a successful `count_ones_init`.
    pub fn count_ones_next(&self, screening: &mut Screening) -> Result<bool> {
        let Screening {
            query_ones,
            one_counters,
            next_count_bit,
            current,
            ..
        } = screening;
        let cursor = current
            .as_ref()
            .expect("count_ones_next called without count_ones_init");

        let from = *next_count_bit;
        let to = query_ones.len().min(from + self.config.count_chunk_bits.max(1));
        for i in from..to {
            let bit = query_ones[i];
            let ones = match &cursor.data {
                BlockData::Pending { generation } if *generation == self.pending.generation() => {
                    self.pending
                        .rows()
                        .take(cursor.end_row)
                        .filter(|row| crate::utils::get_bit(row, bit))
                        .count() as u64
                }
                BlockData::Pending { .. } => 0,
                BlockData::Owned(block) => block.column_ones(bit) as u64,
                BlockData::Mapped {
                    region,
                    range,
                    layout,
                } => layout.view(&region.as_slice()[range.clone()]).column_ones(bit) as u64,
            };
            one_counters[i] += ones;
        }
        *next_count_bit = to;
        Ok(to < query_ones.len())
    }

    /// Release the current block; after the last block, reorder the query
    /// bits rarest first.
    pub fn count_ones_end(&self, screening: &mut Screening) {
        screening.current = None;
        if screening.next_block >= self.block_slots() {
            screening.prioritize();
        }
    }

    /// Run one-counting over every block
    pub fn count_ones(&self, screening: &mut Screening) -> Result<()> {
        screening.rewind();
        screening.counted = false;
        screening.one_counters.iter_mut().for_each(|c| *c = 0);
        while self.count_ones_init(screening)? {
            while self.count_ones_next(screening)? {}
            self.count_ones_end(screening);
        }
        if !screening.counted {
            // No blocks at all
            screening.prioritize();
        }
        Ok(())
    }

    /// Fraction of query bits expected to prune well. With counts, the bits
    /// rarer than `rare_bit_ratio`; before counting, the bits inside the
    /// priority range.
    pub fn query_ones_ratio(&self, screening: &Screening) -> f32 {
        let bits = screening.query_ones.len();
        if bits == 0 {
            return 0.0;
        }

        let total = self.get_total_count();
        if screening.counted && total > 0 {
            let rare = screening
                .one_counters
                .iter()
                .filter(|&&count| (count as f64 / total as f64) < self.config.rare_bit_ratio as f64)
                .count();
            return rare as f32 / bits as f32;
        }

        match self.config.priority {
            Some(range) => {
                let inside = screening
                    .query_ones
                    .iter()
                    .filter(|&&bit| range.contains_bit(bit))
                    .count();
                inside as f32 / bits as f32
            }
            None => 1.0,
        }
    }

    /// Ones per bit over every stored fingerprint
    pub fn bit_counts(&self) -> Result<Vec<u64>> {
        let fp_bits = self.config.fp_bits();
        let mut counts = vec![0u64; fp_bits];
        for block in &self.committed {
            let (region, range) = self.store.fetch_region(block.addr)?;
            let view = block.layout.view(&region.as_slice()[range]);
            for (bit, count) in counts.iter_mut().enumerate() {
                *count += view.column_ones(bit) as u64;
            }
        }
        for sealed in &self.sealed {
            for (bit, count) in counts.iter_mut().enumerate() {
                *count += sealed.block.column_ones(bit) as u64;
            }
        }
        for row in self.pending.rows() {
            for bit in crate::utils::set_bits(row) {
                counts[bit] += 1;
            }
        }
        info!(blocks = self.count_blocks(), "computed bit densities");
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryBlobStore, SharedCacheConfig, StorageConfig};
    use crate::utils::{contains_all, set_bit};
    use tempfile::{tempdir, TempDir};

    fn config(shm: &TempDir, fp_bytes: usize, block_rows: usize) -> IndexConfig {
        IndexConfig {
            fp_bytes,
            block_rows,
            chunk_words: 1,
            count_chunk_bits: 2,
            storage: StorageConfig {
                shared: SharedCacheConfig {
                    shm_dir: Some(shm.path().to_path_buf()),
                    ..SharedCacheConfig::default()
                },
                ..StorageConfig::default()
            },
            ..IndexConfig::default()
        }
    }

    fn writer(shm: &TempDir, fp_bytes: usize, block_rows: usize) -> FingerprintIndex {
        let blob = Arc::new(MemoryBlobStore::new("mem://fingerprints"));
        let mut index =
            FingerprintIndex::new(blob, "fingerprints_1", config(shm, fp_bytes, block_rows)).unwrap();
        index.create().unwrap();
        index.validate_for_update().unwrap();
        index
    }

    fn fp_with_bits(fp_bytes: usize, bits: &[usize]) -> Vec<u8> {
        let mut fp = vec![0u8; fp_bytes];
        for &b in bits {
            set_bit(&mut fp, b);
        }
        fp
    }

    fn pseudo_random(seed: &mut u64) -> u64 {
        *seed ^= *seed << 13;
        *seed ^= *seed >> 7;
        *seed ^= *seed << 17;
        *seed
    }

    #[test]
    fn test_screen_three_fingerprints() {
        let shm = tempdir().unwrap();
        let mut index = writer(&shm, 2, 16);
        index.add_fingerprint(&fp_with_bits(2, &[0, 1, 2, 3, 4])).unwrap();
        index.add_fingerprint(&fp_with_bits(2, &[0, 1])).unwrap();
        index.add_fingerprint(&fp_with_bits(2, &[0, 1, 2, 3, 4, 5, 6, 7, 8])).unwrap();
        index.flush().unwrap();
        index.validate().unwrap();

        let hits = index.screen(&fp_with_bits(2, &[0, 1, 2])).unwrap();
        assert_eq!(hits.iter().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(index.get_total_count(), 3);
        assert_eq!(index.count_blocks(), 1);
    }

    #[test]
    fn test_query_bits_unique_to_sparse_fingerprint() {
        let shm = tempdir().unwrap();
        let mut index = writer(&shm, 16, 16);
        index.add_fingerprint(&fp_with_bits(16, &[0, 1, 2, 3, 4])).unwrap();
        index.add_fingerprint(&fp_with_bits(16, &[100, 101])).unwrap();
        index.add_fingerprint(&fp_with_bits(16, &[0, 1, 2, 3, 4, 5, 6, 7, 8])).unwrap();
        index.flush().unwrap();
        index.validate().unwrap();

        for query in [&[100, 101][..], &[100][..], &[101][..]] {
            let hits = index.screen(&fp_with_bits(16, query)).unwrap();
            assert_eq!(hits.iter().collect::<Vec<_>>(), vec![1], "query bits {:?}", query);
        }
    }

    #[test]
    fn test_open_pending_block_survives_flush() {
        let shm = tempdir().unwrap();
        let mut index = writer(&shm, 1, 8);
        for fp in [0b01u8, 0b11, 0b10] {
            index.add_fingerprint(&[fp]).unwrap();
        }

        let mut s = index.screen_init(&[0b01]).unwrap();
        assert!(index.screen_part_init(&mut s).unwrap());
        index.flush().unwrap();

        // The buffered rows now live in a sealed block
        assert!(!index.screen_part_next(&mut s).unwrap());
        assert_eq!(index.get_storage_index(&s, 0), None);
        assert!(s.passed().is_empty());
        index.screen_part_end(&mut s);

        index.add_fingerprint(&[0b01]).unwrap();
        let mut c = index.screen_init(&[0b01]).unwrap();
        assert!(index.count_ones_init(&mut c).unwrap());
        while index.count_ones_next(&mut c).unwrap() {}
        index.count_ones_end(&mut c);
        // Second slot is the pending row
        assert!(index.count_ones_init(&mut c).unwrap());
        index.flush().unwrap();
        while index.count_ones_next(&mut c).unwrap() {}
        index.count_ones_end(&mut c);
        assert_eq!(c.one_counters(), &[2]);

        index.validate().unwrap();
        let hits = index.screen(&[0b01]).unwrap();
        assert_eq!(hits.iter().collect::<Vec<_>>(), vec![0, 1, 3]);
    }

    #[test]
    fn test_pending_rows_are_screened() {
        let shm = tempdir().unwrap();
        let mut index = writer(&shm, 1, 4);
        for fp in [0b0011u8, 0b0001, 0b0111, 0b1111, 0b0010, 0b0011] {
            index.add_fingerprint(&[fp]).unwrap();
        }
        // One sealed block of 4, two pending rows
        assert_eq!(index.count_blocks(), 1);
        assert_eq!(index.pending_count(), 2);

        let hits = index.screen(&[0b0011]).unwrap();
        assert_eq!(hits.iter().collect::<Vec<_>>(), vec![0, 2, 3, 5]);
    }

    #[test]
    fn test_partial_blocks_keep_positional_ids() {
        let shm = tempdir().unwrap();
        let mut index = writer(&shm, 1, 8);
        index.add_fingerprint(&[0x01]).unwrap();
        index.add_fingerprint(&[0x03]).unwrap();
        index.flush().unwrap();
        index.add_fingerprint(&[0x01]).unwrap();
        index.flush().unwrap();
        index.validate().unwrap();

        assert_eq!(index.count_blocks(), 2);
        let hits = index.screen(&[0x01]).unwrap();
        assert_eq!(hits.iter().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_screening_matches_exhaustive_and() {
        let shm = tempdir().unwrap();
        let mut index = writer(&shm, 4, 100);
        let mut seed = 0x9e3779b97f4a7c15u64;
        let mut stored = Vec::new();
        for _ in 0..350 {
            let fp = (pseudo_random(&mut seed) as u32 | pseudo_random(&mut seed) as u32).to_le_bytes();
            index.add_fingerprint(&fp).unwrap();
            stored.push(fp);
        }
        index.flush().unwrap();
        index.validate().unwrap();

        for _ in 0..20 {
            let query = (pseudo_random(&mut seed) as u32
                & pseudo_random(&mut seed) as u32
                & pseudo_random(&mut seed) as u32)
                .to_le_bytes();
            let expected: Vec<u32> = stored
                .iter()
                .enumerate()
                .filter(|(_, fp)| contains_all(&fp[..], &query))
                .map(|(i, _)| i as u32)
                .collect();
            let hits = index.screen(&query).unwrap();
            assert_eq!(hits.iter().collect::<Vec<_>>(), expected);
        }
    }

    #[test]
    fn test_count_ones_and_ratio() {
        let shm = tempdir().unwrap();
        let mut index = writer(&shm, 1, 2);
        for fp in [0b001u8, 0b011, 0b111, 0b001] {
            index.add_fingerprint(&[fp]).unwrap();
        }
        index.flush().unwrap();
        index.validate().unwrap();

        let mut s = index.screen_init(&[0b111]).unwrap();
        assert_eq!(index.query_ones_ratio(&s), 1.0);

        index.count_ones(&mut s).unwrap();
        assert!(s.is_counted());
        // Rarest first: bit 2 (1), bit 1 (2), bit 0 (4)
        assert_eq!(s.query_ones(), &[2, 1, 0]);
        assert_eq!(s.one_counters(), &[1, 2, 4]);
        // 1 of 4 rows is not below the 0.25 threshold
        assert_eq!(index.query_ones_ratio(&s), 0.0);

        let hits = index.screen_all(&mut s).unwrap();
        assert_eq!(hits.iter().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_manual_protocol_and_storage_index() {
        let shm = tempdir().unwrap();
        let mut index = writer(&shm, 1, 8);
        for fp in [0b11u8, 0b01, 0b10] {
            index.add_fingerprint(&[fp]).unwrap();
        }
        index.flush().unwrap();
        index.validate().unwrap();

        let mut s = index.screen_init(&[0b01]).unwrap();
        assert!(index.able_to_screen(&s));
        assert!(index.screen_part_init(&mut s).unwrap());
        // Sorted rows: 1 (pc 1), 2 (pc 1), 0 (pc 2)
        assert_eq!(index.get_storage_index(&s, 0), Some(1));
        assert_eq!(index.get_storage_index(&s, 2), Some(0));
        assert_eq!(index.get_storage_index(&s, 3), None);
        while index.screen_part_next(&mut s).unwrap() {}
        index.screen_part_end(&mut s);
        assert!(!index.screen_part_init(&mut s).unwrap());

        let mut passed = s.take_passed();
        passed.sort_unstable();
        assert_eq!(passed, vec![0, 1]);
    }

    #[test]
    #[should_panic(expected = "without screen_part_init")]
    fn test_next_without_init_panics() {
        let shm = tempdir().unwrap();
        let index = writer(&shm, 1, 8);
        let mut s = index.screen_init(&[1]).unwrap();
        let _ = index.screen_part_next(&mut s);
    }

    #[test]
    fn test_wrong_length_rejected() {
        let shm = tempdir().unwrap();
        let mut index = writer(&shm, 2, 8);
        assert!(matches!(
            index.add_fingerprint(&[1, 2, 3]),
            Err(Error::InvalidConfiguration(_))
        ));
        assert!(matches!(
            index.screen_init(&[1]),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_empty_query_passes_everything() {
        let shm = tempdir().unwrap();
        let mut index = writer(&shm, 1, 8);
        for fp in [0u8, 5, 9] {
            index.add_fingerprint(&[fp]).unwrap();
        }
        let s = index.screen_init(&[0]).unwrap();
        assert!(!index.able_to_screen(&s));
        assert_eq!(index.screen(&[0]).unwrap().len(), 3);
    }

    #[test]
    fn test_bit_counts() {
        let shm = tempdir().unwrap();
        let mut index = writer(&shm, 1, 2);
        for fp in [0b01u8, 0b11, 0b10] {
            index.add_fingerprint(&[fp]).unwrap();
        }
        let counts = index.bit_counts().unwrap();
        assert_eq!(&counts[..3], &[2, 2, 0]);
    }
}
