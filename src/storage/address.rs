//! Record addresses and the flat address index stored in row 0.

use crate::error::{Error, Result};
use crate::utils::{get_u32_le, put_u32_le};

/// Location of one record inside the block sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    /// Zero-based payload block number (backing row `block_id + 1`)
    pub block_id: u32,
    pub offset: u32,
    pub length: u32,
}

impl Address {
    /// Size of an address record in bytes (fixed-size for row 0)
    pub const SIZE: usize = 4 + 4 + 4;

    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_u32_le(buf, self.block_id);
        put_u32_le(buf, self.offset);
        put_u32_le(buf, self.length);
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.block_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.offset.to_le_bytes());
        out[8..12].copy_from_slice(&self.length.to_le_bytes());
        out
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        Some(Self {
            block_id: get_u32_le(buf, 0)?,
            offset: get_u32_le(buf, 4)?,
            length: get_u32_le(buf, 8)?,
        })
    }

    /// Exclusive end offset of the record inside its block
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.length as u64
    }
}

/// Logical record number to address map, in insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressIndex {
    entries: Vec<Address>,
}

impl AddressIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the serialized row 0 of `table`.
    pub fn decode(table: &str, bytes: &[u8]) -> Result<Self> {
        if bytes.len() % Address::SIZE != 0 {
            return Err(Error::CorruptIndex {
                table: table.to_string(),
                row: 0,
                size: bytes.len() as u64,
                record_size: Address::SIZE,
            });
        }

        let entries = bytes
            .chunks_exact(Address::SIZE)
            .filter_map(Address::decode)
            .collect();
        Ok(Self { entries })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.entries.len() * Address::SIZE);
        for addr in &self.entries {
            addr.encode(&mut buf);
        }
        buf
    }

    /// Number of records implied by a row 0 of `size` bytes
    pub fn count_for_size(table: &str, size: u64) -> Result<usize> {
        if size % Address::SIZE as u64 != 0 {
            return Err(Error::CorruptIndex {
                table: table.to_string(),
                row: 0,
                size,
                record_size: Address::SIZE,
            });
        }
        Ok((size / Address::SIZE as u64) as usize)
    }

    pub fn push(&mut self, addr: Address) {
        self.entries.push(addr);
    }

    pub fn get(&self, n: usize) -> Option<&Address> {
        self.entries.get(n)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Address> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
