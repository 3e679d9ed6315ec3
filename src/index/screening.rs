//! Caller-owned scan state for screening and one-counting.
//!
//! A [`Screening`] is created by `FingerprintIndex::screen_init` and passed
//! back into every `screen_part_*` / `count_ones_*` call. It owns the handle
//! of the block being scanned, so dropping the session releases the mapping
//! on every path.

use super::block::{BlockLayout, ColumnSource, FingerprintBlock};
use super::pending::PendingBlock;
use super::types::{PriorityRange, RecordId};
use crate::storage::SharedRegion;
use crate::utils::contains_all;
use std::ops::Range;
use std::sync::Arc;

/// Block currently held by a session
pub(crate) enum BlockData {
    /// Sealed by this writer and not yet reloaded from shared storage
    Owned(Arc<FingerprintBlock>),
    /// Committed block inside a shared region
    Mapped {
        region: Arc<SharedRegion>,
        range: Range<usize>,
        layout: BlockLayout,
    },
    /// The writer's pending buffer at `generation`, scanned row by row
    Pending { generation: u64 },
}

pub(crate) struct BlockCursor {
    pub(crate) data: BlockData,
    /// Record id of the block's first original row
    pub(crate) base: RecordId,
    /// Sorted row window still to scan (rows for the pending block)
    pub(crate) next_row: usize,
    pub(crate) end_row: usize,
}

/// Resumable screening / one-counting session
pub struct Screening {
    pub(crate) query: Vec<u8>,
    pub(crate) query_ones: Vec<usize>,
    pub(crate) query_count: u16,
    pub(crate) one_counters: Vec<u64>,
    pub(crate) counted: bool,
    pub(crate) passed: Vec<RecordId>,
    pub(crate) items_read: usize,
    pub(crate) next_block: usize,
    pub(crate) next_count_bit: usize,
    pub(crate) current: Option<BlockCursor>,
}

impl Screening {
    /// Record the query's set bits, those inside the priority range first
    pub(crate) fn new(query: &[u8], priority: Option<PriorityRange>) -> Self {
        let ones = crate::utils::set_bits(query);
        let (mut query_ones, rest): (Vec<usize>, Vec<usize>) = match priority {
            Some(range) => ones.into_iter().partition(|&bit| range.contains_bit(bit)),
            None => (ones, Vec::new()),
        };
        query_ones.extend(rest);

        Self {
            query: query.to_vec(),
            query_count: query_ones.len() as u16,
            one_counters: vec![0; query_ones.len()],
            query_ones,
            counted: false,
            passed: Vec::new(),
            items_read: 0,
            next_block: 0,
            next_count_bit: 0,
            current: None,
        }
    }

    /// Query bit positions in scan order
    pub fn query_ones(&self) -> &[usize] {
        &self.query_ones
    }

    /// Per query bit, the number of stored fingerprints with it set
    pub fn one_counters(&self) -> &[u64] {
        &self.one_counters
    }

    pub fn is_counted(&self) -> bool {
        self.counted
    }

    /// Record ids that passed so far
    pub fn passed(&self) -> &[RecordId] {
        &self.passed
    }

    pub fn take_passed(&mut self) -> Vec<RecordId> {
        std::mem::take(&mut self.passed)
    }

    /// Rows examined so far (skipped rows excluded)
    pub fn items_read(&self) -> usize {
        self.items_read
    }

    /// Number of blocks visited so far
    pub fn blocks_visited(&self) -> usize {
        self.next_block
    }

    pub fn in_block(&self) -> bool {
        self.current.is_some()
    }

    /// Reorder query bits by ascending one count so the rarest bit is tested
    /// first, and rewind the block cursor for screening.
    pub fn prioritize(&mut self) {
        let mut pairs: Vec<(usize, u64)> = self
            .query_ones
            .iter()
            .copied()
            .zip(self.one_counters.iter().copied())
            .collect();
        pairs.sort_by_key(|&(_, count)| count);
        (self.query_ones, self.one_counters) = pairs.into_iter().unzip();

        self.counted = true;
        self.rewind();
    }

    /// Start over from the first block, keeping query order and counts
    pub fn rewind(&mut self) {
        self.current = None;
        self.next_block = 0;
        self.next_count_bit = 0;
        self.passed.clear();
        self.items_read = 0;
    }
}

/// Sorted-row window a block can match: the intersection of the query
/// columns' occupancy ranges, starting no earlier than the first row whose
/// popcount reaches the query's.
pub(crate) fn row_window<S: ColumnSource + ?Sized>(
    source: &S,
    query_ones: &[usize],
    query_count: u16,
) -> Range<usize> {
    let mut lo = source.first_row_with_count(query_count);
    let mut hi = source.used();
    for &bit in query_ones {
        match source.bit_range(bit) {
            Some((start, end)) => {
                lo = lo.max(start as usize);
                hi = hi.min(end as usize + 1);
            }
            None => return 0..0,
        }
        if lo >= hi {
            return 0..0;
        }
    }
    lo..hi
}

/// AND the query columns over one chunk of sorted rows, pushing passing ids.
/// Returns the first row not yet scanned.
pub(crate) fn scan_columns<S: ColumnSource + ?Sized>(
    source: &S,
    query_ones: &[usize],
    rows: Range<usize>,
    chunk_words: usize,
    base: RecordId,
    passed: &mut Vec<RecordId>,
) -> usize {
    if rows.start >= rows.end {
        return rows.end;
    }
    let first_word = rows.start / 64;
    let last_word = (rows.end - 1) / 64;
    let stop_word = last_word.min(first_word + chunk_words.max(1) - 1);

    for word in first_word..=stop_word {
        let mut acc = u64::MAX;
        if word == first_word {
            acc &= u64::MAX << (rows.start % 64);
        }
        if word == last_word && rows.end % 64 != 0 {
            acc &= u64::MAX >> (64 - rows.end % 64);
        }

        for &bit in query_ones {
            acc &= source.column_word(bit, word);
            if acc == 0 {
                break;
            }
        }

        while acc != 0 {
            let sorted = word * 64 + acc.trailing_zeros() as usize;
            passed.push(base + source.mapping(sorted) as RecordId);
            acc &= acc - 1;
        }
    }

    ((stop_word + 1) * 64).min(rows.end)
}

/// Row-wise test of the pending buffer over `rows`
pub(crate) fn scan_pending(
    pending: &PendingBlock,
    query: &[u8],
    query_count: u16,
    rows: Range<usize>,
    base: RecordId,
    passed: &mut Vec<RecordId>,
) {
    for row in rows {
        if pending.counter(row) >= query_count && contains_all(pending.row(row), query) {
            passed.push(base + row as RecordId);
        }
    }
}
