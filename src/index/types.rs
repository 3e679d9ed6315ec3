use crate::error::{Error, Result};
use crate::storage::StorageConfig;
use serde::{Deserialize, Serialize};

/// Positional record identifier, shared by a fingerprint and its payload
pub type RecordId = u32;

/// Upper bound on rows per fingerprint block (row numbers are u16)
pub const MAX_BLOCK_ROWS: usize = 65536;

/// Status byte stored in front of every payload
pub const STATUS_LIVE: u8 = 0;
pub const STATUS_REMOVED: u8 = 1;

/// Half-open byte range of fingerprint bits that are set most often
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityRange {
    pub start: usize,
    pub end: usize,
}

impl PriorityRange {
    /// Bit positions covered by the range
    pub fn contains_bit(&self, bit: usize) -> bool {
        (self.start * 8..self.end * 8).contains(&bit)
    }
}

/// Configuration for the fingerprint index
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Fingerprint length in bytes
    pub fp_bytes: usize,
    /// Priority byte range (None = whole fingerprint)
    pub priority: Option<PriorityRange>,
    /// Fingerprints per block
    pub block_rows: usize,
    /// Column words scanned per `screen_part_next` call
    pub chunk_words: usize,
    /// Query bits processed per `count_ones_next` call
    pub count_chunk_bits: usize,
    /// A query bit is rare when count / total is below this ratio
    pub rare_bit_ratio: f32,
    /// Payload and fingerprint block storage
    pub storage: StorageConfig,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            fp_bytes: 120,
            priority: None,
            block_rows: MAX_BLOCK_ROWS,
            chunk_words: 256,
            count_chunk_bits: 32,
            rare_bit_ratio: 0.25,
            storage: StorageConfig::default(),
        }
    }
}

impl IndexConfig {
    pub fn fp_bits(&self) -> usize {
        self.fp_bytes * 8
    }

    /// Reject configurations the block format cannot represent
    pub fn check(&self) -> Result<()> {
        // Popcounts are stored as u16
        if self.fp_bytes == 0 || self.fp_bytes > u16::MAX as usize / 8 {
            return Err(Error::InvalidConfiguration(format!(
                "fingerprint length must be in 1..={} bytes, got {}",
                u16::MAX as usize / 8,
                self.fp_bytes
            )));
        }
        if self.block_rows == 0 || self.block_rows > MAX_BLOCK_ROWS {
            return Err(Error::InvalidConfiguration(format!(
                "block_rows must be in 1..={}, got {}",
                MAX_BLOCK_ROWS, self.block_rows
            )));
        }
        if self.chunk_words == 0 || self.count_chunk_bits == 0 {
            return Err(Error::InvalidConfiguration(
                "scan chunk sizes must be positive".to_string(),
            ));
        }
        if let Some(range) = self.priority {
            if range.start >= range.end || range.end > self.fp_bytes {
                return Err(Error::InvalidConfiguration(format!(
                    "priority range {}..{} outside fingerprint of {} bytes",
                    range.start, range.end, self.fp_bytes
                )));
            }
        }
        self.storage.check()
    }
}

/// Table names used by one index context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub payloads: String,
    pub fingerprints: String,
}

impl TableNames {
    pub fn for_context(context_id: u32) -> Self {
        Self {
            payloads: format!("storage_{}", context_id),
            fingerprints: format!("fingerprints_{}", context_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        IndexConfig::default().check().unwrap();
    }

    #[test]
    fn test_config_bounds() {
        let config = IndexConfig {
            block_rows: MAX_BLOCK_ROWS + 1,
            ..IndexConfig::default()
        };
        assert!(matches!(config.check(), Err(Error::InvalidConfiguration(_))));

        let config = IndexConfig {
            fp_bytes: 8,
            priority: Some(PriorityRange { start: 4, end: 9 }),
            ..IndexConfig::default()
        };
        assert!(config.check().is_err());
    }

    #[test]
    fn test_block_size_must_fit_addresses() {
        let mut config = IndexConfig::default();
        config.storage.max_block_size = u32::MAX as usize + 1;
        assert!(matches!(config.check(), Err(Error::InvalidConfiguration(_))));

        config.storage.max_block_size = u32::MAX as usize;
        config.check().unwrap();
    }

    #[test]
    fn test_priority_bits() {
        let range = PriorityRange { start: 1, end: 2 };
        assert!(!range.contains_bit(7));
        assert!(range.contains_bit(8));
        assert!(range.contains_bit(15));
        assert!(!range.contains_bit(16));
    }

    #[test]
    fn test_config_json_defaults() {
        let config: IndexConfig = serde_json::from_str(r#"{"fp_bytes": 64}"#).unwrap();
        assert_eq!(config.fp_bytes, 64);
        assert_eq!(config.block_rows, MAX_BLOCK_ROWS);
    }
}
