//! Error types for the storage and screening engines

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The address index row is not a whole number of address records.
    #[error(
        "corrupt index in table {table}: row {row} has size {size}, not a multiple of {record_size}"
    )]
    CorruptIndex {
        table: String,
        row: u32,
        size: u64,
        record_size: usize,
    },

    #[error("missing index row 0 in table {table}")]
    MissingIndex { table: String },

    /// A shared region could not be attached. Recovered by the coherence
    /// protocol and only escapes while a fresh load is in progress.
    #[error("can't map shared region {region}: {source}")]
    BlockMapFailed {
        region: String,
        #[source]
        source: io::Error,
    },

    #[error("range {offset}+{length} is outside block {block} (size {size})")]
    OutOfRange {
        block: u32,
        offset: u32,
        length: u32,
        size: u64,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("record of {length} bytes exceeds the block capacity of {max} bytes")]
    RecordTooLarge { length: usize, max: usize },

    #[error("corrupt fingerprint block {block}: {reason}")]
    CorruptBlock { block: usize, reason: String },

    #[error("timed out after {waited_ms}ms waiting for shared state {state}")]
    CoherenceTimeout { state: String, waited_ms: u64 },

    #[error("store {0} is not open for writing (call validate_for_insert first)")]
    NotWritable(String),

    /// Loading would copy this session's staged rows into shared memory.
    #[error("table {0} has unflushed writes; flush before validate")]
    UnflushedWrites(String),

    #[error("table {0} is locked by another session")]
    TableLocked(String),

    #[error("table {0} does not exist")]
    TableNotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;
