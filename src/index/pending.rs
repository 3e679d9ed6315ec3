use super::block::FingerprintBlock;
use crate::utils::popcount;

/// Writer-private buffer of fingerprints not yet sealed into a block.
/// Row-major, insertion order, with popcounts recorded on append.
#[derive(Debug, Clone, Default)]
pub struct PendingBlock {
    fp_bytes: usize,
    raw: Vec<u8>,
    counters: Vec<u16>,
    /// Bumped whenever the buffered rows are dropped
    generation: u64,
}

impl PendingBlock {
    pub fn new(fp_bytes: usize) -> Self {
        Self {
            fp_bytes,
            raw: Vec::new(),
            counters: Vec::new(),
            generation: 0,
        }
    }

    /// Append one fingerprint; the caller checks its length
    pub fn push(&mut self, fp: &[u8]) {
        debug_assert_eq!(fp.len(), self.fp_bytes);
        self.raw.extend_from_slice(fp);
        self.counters.push(popcount(fp) as u16);
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    #[inline]
    pub fn row(&self, row: usize) -> &[u8] {
        let start = row * self.fp_bytes;
        &self.raw[start..start + self.fp_bytes]
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn counter(&self, row: usize) -> u16 {
        self.counters[row]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[u8]> {
        self.raw.chunks_exact(self.fp_bytes.max(1))
    }

    /// Optimize the buffered rows into a block and start over
    pub fn seal(&mut self) -> FingerprintBlock {
        let block = FingerprintBlock::optimize(self.fp_bytes, &self.raw, &self.counters);
        self.clear();
        block
    }

    pub fn clear(&mut self) {
        self.raw.clear();
        self.counters.clear();
        self.generation = self.generation.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::block::ColumnSource;

    #[test]
    fn test_push_and_seal() {
        let mut pending = PendingBlock::new(2);
        pending.push(&[0xff, 0x00]);
        pending.push(&[0x01, 0x00]);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending.row(1), &[0x01, 0x00]);
        assert_eq!(pending.counter(0), 8);
        assert_eq!(pending.rows().count(), 2);

        let block = pending.seal();
        assert!(pending.is_empty());
        assert_eq!(pending.generation(), 1);
        assert_eq!(block.used(), 2);
        assert_eq!(block.mapping(0), 1);
    }
}
