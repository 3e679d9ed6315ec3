//! Columnar fingerprint blocks.
//!
//! A block holds up to 65536 fingerprints transposed into bit columns. Rows
//! are stored sorted by ascending popcount; `mapping` remembers the original
//! insertion order. Each column records the first and last sorted row that has
//! the bit set, so a scan can skip rows no query column can match.
//!
//! ## Serialized format (little-endian)
//!
//! ```text
//! [magic "FPBK"][version u32][fp_bytes u32][used u32][words_per_column u32]
//! [counters u16 * used]        popcount per original row
//! [mapping u16 * used]         sorted row -> original row
//! [bit_starts u32 * fp_bits]   first sorted row per column
//! [bit_ends u32 * fp_bits]     last sorted row per column (start > end = empty)
//! [columns u64 * fp_bits * words_per_column]
//! ```

use super::types::MAX_BLOCK_ROWS;
use crate::error::{Error, Result};
use crate::utils::{get_bit, get_u16_le, get_u32_le, get_u64_le, put_u16_le, put_u32_le, put_u64_le};
use rayon::prelude::*;

pub const BLOCK_MAGIC: &[u8; 4] = b"FPBK";
pub const BLOCK_VERSION: u32 = 1;
const HEADER_SIZE: usize = 20;

/// Start value of a column with no set bits
pub const EMPTY_START: u32 = u32::MAX;
pub const EMPTY_END: u32 = 0;

/// Read access to the columnar layout, shared by owned blocks and views over
/// mapped regions.
pub trait ColumnSource {
    fn fp_bytes(&self) -> usize;
    fn used(&self) -> usize;
    fn words_per_column(&self) -> usize;

    /// Popcount of the fingerprint at original row `row`
    fn counter(&self, row: usize) -> u16;

    /// Original row of sorted row `sorted`
    fn mapping(&self, sorted: usize) -> u16;

    /// Inclusive sorted-row range of a column, None when the column is empty
    fn bit_range(&self, column: usize) -> Option<(u32, u32)>;

    fn column_word(&self, column: usize, word: usize) -> u64;

    fn fp_bits(&self) -> usize {
        self.fp_bytes() * 8
    }

    /// Popcount of sorted row `sorted`
    fn sorted_counter(&self, sorted: usize) -> u16 {
        self.counter(self.mapping(sorted) as usize)
    }

    /// First sorted row whose popcount is at least `min`
    fn first_row_with_count(&self, min: u16) -> usize {
        let (mut lo, mut hi) = (0, self.used());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.sorted_counter(mid) < min {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Number of rows with `column` set
    fn column_ones(&self, column: usize) -> u32 {
        (0..self.words_per_column())
            .map(|w| self.column_word(column, w).count_ones())
            .sum()
    }
}

#[inline]
fn words_for(used: usize) -> usize {
    used.div_ceil(64)
}

fn column_range(words: &[u64]) -> (u32, u32) {
    let first = words.iter().position(|&w| w != 0);
    let last = words.iter().rposition(|&w| w != 0);
    match (first, last) {
        (Some(f), Some(l)) => (
            (f * 64) as u32 + words[f].trailing_zeros(),
            (l * 64 + 63) as u32 - words[l].leading_zeros(),
        ),
        _ => (EMPTY_START, EMPTY_END),
    }
}

/// Serialized size of a block of `rows` fingerprints
pub fn encoded_len_for(fp_bytes: usize, rows: usize) -> usize {
    let fp_bits = fp_bytes * 8;
    HEADER_SIZE + rows * 4 + fp_bits * 8 + fp_bits * words_for(rows) * 8
}

/// Owned, immutable fingerprint block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintBlock {
    fp_bytes: usize,
    used: usize,
    counters: Vec<u16>,
    mapping: Vec<u16>,
    bit_starts: Vec<u32>,
    bit_ends: Vec<u32>,
    columns: Vec<u64>,
}

impl FingerprintBlock {
    /// Build the sorted, transposed layout from row-major fingerprints and
    /// their popcounts.
    pub fn optimize(fp_bytes: usize, raw: &[u8], counters: &[u16]) -> Self {
        let used = if fp_bytes == 0 { 0 } else { raw.len() / fp_bytes };
        debug_assert!(used <= MAX_BLOCK_ROWS);
        debug_assert_eq!(counters.len(), used);

        let fp_bits = fp_bytes * 8;
        let wpc = words_for(used);

        // Stable: rows with equal popcount keep insertion order
        let mut mapping: Vec<u16> = (0..used).map(|i| i as u16).collect();
        mapping.sort_by_key(|&row| counters[row as usize]);

        if used == 0 {
            return Self {
                fp_bytes,
                used,
                counters: Vec::new(),
                mapping,
                bit_starts: vec![EMPTY_START; fp_bits],
                bit_ends: vec![EMPTY_END; fp_bits],
                columns: Vec::new(),
            };
        }

        let mut columns = vec![0u64; fp_bits * wpc];
        let ranges: Vec<(u32, u32)> = columns
            .par_chunks_mut(wpc)
            .enumerate()
            .map(|(column, words)| {
                for (sorted, &row) in mapping.iter().enumerate() {
                    let start = row as usize * fp_bytes;
                    if get_bit(&raw[start..start + fp_bytes], column) {
                        words[sorted / 64] |= 1 << (sorted % 64);
                    }
                }
                column_range(words)
            })
            .collect();
        let (bit_starts, bit_ends) = ranges.into_iter().unzip();

        Self {
            fp_bytes,
            used,
            counters: counters.to_vec(),
            mapping,
            bit_starts,
            bit_ends,
            columns,
        }
    }

    pub fn encoded_len(&self) -> usize {
        encoded_len_for(self.fp_bytes, self.used)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(BLOCK_MAGIC);
        put_u32_le(&mut buf, BLOCK_VERSION);
        put_u32_le(&mut buf, self.fp_bytes as u32);
        put_u32_le(&mut buf, self.used as u32);
        put_u32_le(&mut buf, words_for(self.used) as u32);
        for &c in &self.counters {
            put_u16_le(&mut buf, c);
        }
        for &m in &self.mapping {
            put_u16_le(&mut buf, m);
        }
        for &s in &self.bit_starts {
            put_u32_le(&mut buf, s);
        }
        for &e in &self.bit_ends {
            put_u32_le(&mut buf, e);
        }
        for &w in &self.columns {
            put_u64_le(&mut buf, w);
        }
        buf
    }

    /// Decode a serialized block into an owned copy
    pub fn decode(block: usize, bytes: &[u8]) -> Result<Self> {
        let layout = BlockLayout::parse(block, bytes)?;
        let view = layout.view(bytes);
        let fp_bits = view.fp_bits();
        let wpc = view.words_per_column();
        Ok(Self {
            fp_bytes: view.fp_bytes(),
            used: view.used(),
            counters: (0..view.used()).map(|r| view.counter(r)).collect(),
            mapping: (0..view.used()).map(|r| view.mapping(r)).collect(),
            bit_starts: (0..fp_bits).map(|c| view.raw_start(c)).collect(),
            bit_ends: (0..fp_bits).map(|c| view.raw_end(c)).collect(),
            columns: (0..fp_bits)
                .flat_map(|c| (0..wpc).map(move |w| (c, w)))
                .map(|(c, w)| view.column_word(c, w))
                .collect(),
        })
    }
}

impl ColumnSource for FingerprintBlock {
    fn fp_bytes(&self) -> usize {
        self.fp_bytes
    }

    fn used(&self) -> usize {
        self.used
    }

    fn words_per_column(&self) -> usize {
        words_for(self.used)
    }

    #[inline]
    fn counter(&self, row: usize) -> u16 {
        self.counters.get(row).copied().unwrap_or(0)
    }

    #[inline]
    fn mapping(&self, sorted: usize) -> u16 {
        self.mapping.get(sorted).copied().unwrap_or(0)
    }

    fn bit_range(&self, column: usize) -> Option<(u32, u32)> {
        let start = *self.bit_starts.get(column)?;
        let end = *self.bit_ends.get(column)?;
        (start <= end).then_some((start, end))
    }

    #[inline]
    fn column_word(&self, column: usize, word: usize) -> u64 {
        let wpc = words_for(self.used);
        if word >= wpc {
            return 0;
        }
        self.columns.get(column * wpc + word).copied().unwrap_or(0)
    }
}

/// Validated offsets of a serialized block. Checking the header once lets
/// scans rebuild cheap views across calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    fp_bytes: usize,
    used: usize,
    words_per_column: usize,
    counters_at: usize,
    mapping_at: usize,
    starts_at: usize,
    ends_at: usize,
    columns_at: usize,
    len: usize,
}

impl BlockLayout {
    /// Validate a serialized block. Never panics on arbitrary input.
    pub fn parse(block: usize, bytes: &[u8]) -> Result<Self> {
        let corrupt = |reason: &str| Error::CorruptBlock {
            block,
            reason: reason.to_string(),
        };

        if bytes.len() < HEADER_SIZE || &bytes[..4] != BLOCK_MAGIC {
            return Err(corrupt("bad magic"));
        }
        let field = |at: usize| get_u32_le(bytes, at).map(|v| v as usize).unwrap_or(0);
        if field(4) != BLOCK_VERSION as usize {
            return Err(corrupt("unsupported version"));
        }
        let fp_bytes = field(8);
        let used = field(12);
        let words_per_column = field(16);

        if fp_bytes == 0 || fp_bytes > u16::MAX as usize / 8 {
            return Err(corrupt("bad fingerprint length"));
        }
        if used > MAX_BLOCK_ROWS {
            return Err(corrupt("too many rows"));
        }
        if words_per_column != words_for(used) {
            return Err(corrupt("column width does not match row count"));
        }

        let fp_bits = fp_bytes * 8;
        let counters_at = HEADER_SIZE;
        let mapping_at = counters_at + used * 2;
        let starts_at = mapping_at + used * 2;
        let ends_at = starts_at + fp_bits * 4;
        let columns_at = ends_at + fp_bits * 4;
        let len = fp_bits
            .checked_mul(words_per_column)
            .and_then(|n| n.checked_mul(8))
            .and_then(|n| n.checked_add(columns_at))
            .ok_or_else(|| corrupt("size overflow"))?;
        if bytes.len() != len {
            return Err(corrupt("length does not match header"));
        }

        let layout = Self {
            fp_bytes,
            used,
            words_per_column,
            counters_at,
            mapping_at,
            starts_at,
            ends_at,
            columns_at,
            len,
        };

        let view = layout.view(bytes);
        let mut seen = vec![false; used];
        for sorted in 0..used {
            let row = view.mapping(sorted) as usize;
            if row >= used || std::mem::replace(&mut seen[row], true) {
                return Err(corrupt("mapping is not a permutation"));
            }
        }
        for column in 0..fp_bits {
            let (start, end) = (view.raw_start(column), view.raw_end(column));
            if start <= end && end as usize >= used {
                return Err(corrupt("column range beyond last row"));
            }
        }
        Ok(layout)
    }

    pub fn fp_bytes(&self) -> usize {
        self.fp_bytes
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// View over the bytes this layout was parsed from
    pub fn view<'a>(&self, bytes: &'a [u8]) -> FingerprintBlockView<'a> {
        FingerprintBlockView {
            bytes,
            layout: *self,
        }
    }
}

/// Zero-copy view of a serialized block
#[derive(Debug, Clone, Copy)]
pub struct FingerprintBlockView<'a> {
    bytes: &'a [u8],
    layout: BlockLayout,
}

impl FingerprintBlockView<'_> {
    fn raw_start(&self, column: usize) -> u32 {
        get_u32_le(self.bytes, self.layout.starts_at + column * 4).unwrap_or(EMPTY_START)
    }

    fn raw_end(&self, column: usize) -> u32 {
        get_u32_le(self.bytes, self.layout.ends_at + column * 4).unwrap_or(EMPTY_END)
    }

    pub fn len(&self) -> usize {
        self.layout.len
    }

    pub fn is_empty(&self) -> bool {
        self.layout.used == 0
    }
}

impl ColumnSource for FingerprintBlockView<'_> {
    fn fp_bytes(&self) -> usize {
        self.layout.fp_bytes
    }

    fn used(&self) -> usize {
        self.layout.used
    }

    fn words_per_column(&self) -> usize {
        self.layout.words_per_column
    }

    #[inline]
    fn counter(&self, row: usize) -> u16 {
        if row >= self.layout.used {
            return 0;
        }
        get_u16_le(self.bytes, self.layout.counters_at + row * 2).unwrap_or(0)
    }

    #[inline]
    fn mapping(&self, sorted: usize) -> u16 {
        if sorted >= self.layout.used {
            return 0;
        }
        get_u16_le(self.bytes, self.layout.mapping_at + sorted * 2).unwrap_or(0)
    }

    fn bit_range(&self, column: usize) -> Option<(u32, u32)> {
        if column >= self.fp_bits() {
            return None;
        }
        let (start, end) = (self.raw_start(column), self.raw_end(column));
        (start <= end).then_some((start, end))
    }

    #[inline]
    fn column_word(&self, column: usize, word: usize) -> u64 {
        let wpc = self.layout.words_per_column;
        if word >= wpc || column >= self.fp_bits() {
            return 0;
        }
        get_u64_le(self.bytes, self.layout.columns_at + (column * wpc + word) * 8).unwrap_or(0)
    }
}
