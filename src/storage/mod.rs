//! Block storage over a host blob store.
//!
//! ## Modules
//!
//! - [`address`] - Record addresses and the row 0 address index
//! - [`blob`] - Blob store interface and the in-memory implementation
//! - [`file_blob`] - Directory-backed blob store
//! - [`shared`] - Process-shared regions and the coherence protocol
//! - [`block_store`] - Capacity-capped block sequence with random access
//!
//! ## Persisted layout
//!
//! ```text
//! row 0      [block_id u32][offset u32][length u32] * records
//! row 1..=N  payload bytes, at most max_block_size each
//! ```

pub mod address;
pub mod blob;
pub mod block_store;
pub mod file_blob;
pub mod shared;

pub use address::{Address, AddressIndex};
pub use blob::{BlobStore, MemoryBlobStore, RowInfo, TableLock, TableStats};
pub use block_store::{BlockStore, StorageConfig, DEFAULT_MAX_BLOCK_SIZE};
pub use file_blob::FileBlobStore;
pub use shared::{Coherence, Phase, SharedCache, SharedCacheConfig, SharedRegion};
