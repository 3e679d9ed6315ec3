//! # molsieve - Fingerprint screening index
//!
//! molsieve stores chemical records as a binary fingerprint plus a payload
//! blob and prunes candidates for an exact structure match by testing the
//! query fingerprint against every stored one with columnar bit scans.
//!
//! ## Architecture
//!
//! The crate is organized into these main modules:
//!
//! - [`storage`] - Block storage over a blob store, shared by cooperating
//!   processes through memory-mapped regions and a coherence protocol
//! - [`index`] - Columnar fingerprint blocks, screening and one-counting
//! - [`output`] - Result formatting
//! - [`utils`] - Encoding, bit helpers and app data
//!
//! ## Quick Start
//!
//! ```ignore
//! use molsieve::index::{IndexConfig, IndexContext};
//! use molsieve::storage::FileBlobStore;
//! use std::sync::Arc;
//!
//! let blob = Arc::new(FileBlobStore::open("/var/lib/molsieve".as_ref()).unwrap());
//! let config = IndexConfig { fp_bytes: 8, ..IndexConfig::default() };
//! let mut ctx = IndexContext::new(blob, 1, config).unwrap();
//! ctx.create().unwrap();
//! ctx.validate_for_insert().unwrap();
//! ctx.insert(&[0x0f, 0, 0, 0, 0, 0, 0, 1], b"CCO").unwrap();
//! ctx.flush().unwrap();
//!
//! ctx.validate().unwrap();
//! for id in ctx.search(&[0x03, 0, 0, 0, 0, 0, 0, 0]).unwrap() {
//!     println!("{}", id);
//! }
//! ```
//!
//! ## Performance
//!
//! Fingerprints are stored in blocks of up to 65536 rows, sorted by popcount
//! and transposed into bit columns:
//!
//! 1. **Occupancy ranges** - rows outside every query column's range are
//!    never read
//! 2. **Popcount floor** - rows with fewer bits than the query are skipped
//! 3. **Rare bits first** - one-counting orders query bits by selectivity
//!
//! Committed blocks are loaded once into shared memory and attached by every
//! other process without touching the backing store.

pub mod error;
pub mod index;
pub mod output;
pub mod storage;
pub mod utils;

pub use error::{Error, Result};
