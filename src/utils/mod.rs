//! Utility functions shared across the crate.
//!
//! ## Modules
//!
//! - [`app_data`] - Application data directory and JSON config
//! - [`bits`] - Fingerprint bit manipulation and hex decoding
//! - [`encoding`] - Little-endian fixed-width encoding
//! - [`progress`] - Progress bars (no-op without the `progress` feature)

pub mod app_data;
pub mod bits;
pub mod encoding;
pub mod progress;

pub use app_data::*;
pub use bits::*;
pub use encoding::*;
