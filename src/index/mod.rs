//! Fingerprint index: columnar blocks, screening and the record context.
//!
//! ## Modules
//!
//! - [`types`] - Configuration and shared identifiers
//! - [`block`] - Columnar fingerprint blocks and their serialized form
//! - [`pending`] - The writer's unsealed fingerprint buffer
//! - [`screening`] - Caller-owned scan sessions
//! - [`fingerprints`] - Append, screening and one-counting
//! - [`context`] - Payloads and fingerprints under one commit
//! - [`build`] - Bulk load driver
//! - [`stats`] - Index statistics

pub mod block;
pub mod build;
pub mod context;
pub mod fingerprints;
pub mod pending;
pub mod screening;
pub mod stats;
pub mod types;

pub use block::{BlockLayout, ColumnSource, FingerprintBlock, FingerprintBlockView};
pub use context::IndexContext;
pub use fingerprints::FingerprintIndex;
pub use screening::Screening;
pub use types::{IndexConfig, PriorityRange, RecordId};
