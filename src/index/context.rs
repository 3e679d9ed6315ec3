//! Payload storage and fingerprint index over one blob store.
//!
//! Record `n` is the `n`th payload appended and the `n`th fingerprint added.
//! Both tables share the blob store session, so one commit publishes the
//! payload blocks, fingerprint blocks and address indexes together.

use super::fingerprints::FingerprintIndex;
use super::types::{IndexConfig, RecordId, TableNames, STATUS_LIVE, STATUS_REMOVED};
use crate::error::{Error, Result};
use crate::storage::{BlobStore, BlockStore, TableLock, TableStats};
use roaring::RoaringBitmap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Table statistics of both halves of a context
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ContextStats {
    pub payloads: TableStats,
    pub fingerprints: TableStats,
}

pub struct IndexContext {
    tables: TableNames,
    payloads: BlockStore,
    fingerprints: FingerprintIndex,
}

impl IndexContext {
    pub fn new(blob: Arc<dyn BlobStore>, context_id: u32, config: IndexConfig) -> Result<Self> {
        config.check()?;
        let tables = TableNames::for_context(context_id);
        let payloads = BlockStore::new(Arc::clone(&blob), &tables.payloads, &config.storage);
        let fingerprints = FingerprintIndex::new(blob, &tables.fingerprints, config)?;
        Ok(Self {
            tables,
            payloads,
            fingerprints,
        })
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    pub fn fingerprints(&self) -> &FingerprintIndex {
        &self.fingerprints
    }

    pub fn payloads(&self) -> &BlockStore {
        &self.payloads
    }

    pub fn create(&mut self) -> Result<()> {
        self.payloads.create()?;
        self.fingerprints.create()?;
        info!(payloads = %self.tables.payloads, fingerprints = %self.tables.fingerprints, "created index context");
        Ok(())
    }

    pub fn drop_tables(&mut self) -> Result<()> {
        self.payloads.drop_table()?;
        self.fingerprints.drop_table()?;
        info!(payloads = %self.tables.payloads, "dropped index context");
        Ok(())
    }

    pub fn truncate(&mut self) -> Result<()> {
        self.payloads.truncate()?;
        self.fingerprints.truncate()?;
        info!(payloads = %self.tables.payloads, "truncated index context");
        Ok(())
    }

    pub fn analyze(&self) -> Result<ContextStats> {
        Ok(ContextStats {
            payloads: self.payloads.analyze()?,
            fingerprints: self.fingerprints.analyze_table()?,
        })
    }

    /// Exclusive locks on both tables
    pub fn lock(&self) -> Result<[TableLock; 2]> {
        Ok([self.payloads.lock()?, self.fingerprints.lock()?])
    }

    /// Reader preparation: attach the latest shared copy of both tables.
    ///
    /// Fingerprints load first. A commit landing between the two loads can
    /// only leave payloads ahead of fingerprints, never behind.
    pub fn validate(&mut self) -> Result<()> {
        self.fingerprints.validate()?;
        self.payloads.validate()
    }

    /// Writer preparation for both tables
    pub fn validate_for_insert(&mut self) -> Result<()> {
        self.payloads.validate_for_insert()?;
        self.fingerprints.validate_for_update()?;

        let (payloads, fingerprints) = (self.payloads.count(), self.fingerprints.get_total_count());
        if payloads != fingerprints {
            return Err(Error::InvalidConfiguration(format!(
                "{} holds {} records but {} holds {} fingerprints",
                self.tables.payloads, payloads, self.tables.fingerprints, fingerprints
            )));
        }
        Ok(())
    }

    /// Store a record; returns its id
    pub fn insert(&mut self, fp: &[u8], payload: &[u8]) -> Result<RecordId> {
        if fp.len() != self.fingerprints.fp_bytes() {
            return Err(Error::InvalidConfiguration(format!(
                "fingerprint is {} bytes, index expects {}",
                fp.len(),
                self.fingerprints.fp_bytes()
            )));
        }
        if payload.len() + 1 > self.payloads.max_block_size() {
            return Err(Error::RecordTooLarge {
                length: payload.len() + 1,
                max: self.payloads.max_block_size(),
            });
        }

        let mut record = Vec::with_capacity(payload.len() + 1);
        record.push(STATUS_LIVE);
        record.extend_from_slice(payload);
        self.payloads.append(&record)?;
        let id = self.fingerprints.add_fingerprint(fp)?;
        debug_assert_eq!(id as usize + 1, self.payloads.count());
        Ok(id)
    }

    /// Tombstone a record; false if the id is unknown
    pub fn remove(&mut self, id: RecordId) -> Result<bool> {
        let Some(addr) = self.payloads.address(id as usize) else {
            return Ok(false);
        };
        self.payloads.mark_tombstone(addr)?;
        debug!(id, "record removed");
        Ok(true)
    }

    /// Seal pending fingerprints and publish everything with one commit
    pub fn flush(&mut self) -> Result<()> {
        self.fingerprints.seal_pending_if_any()?;
        self.payloads.flush()?;
        // Nothing left to commit; bumps the version and reacquires handles
        self.fingerprints.flush()
    }

    pub fn finish(&mut self) {
        self.payloads.finish();
        self.fingerprints.finish();
    }

    pub fn count(&self) -> usize {
        self.fingerprints.get_total_count()
    }

    /// Payload of a live record from the loaded copy
    pub fn fetch(&self, id: RecordId) -> Result<Option<&[u8]>> {
        let Some(addr) = self.payloads.address(id as usize) else {
            return Ok(None);
        };
        let bytes = self.payloads.fetch(addr)?;
        match bytes.split_first() {
            Some((&STATUS_LIVE, payload)) => Ok(Some(payload)),
            _ => Ok(None),
        }
    }

    fn is_removed(&self, id: RecordId) -> bool {
        self.payloads
            .address(id as usize)
            .and_then(|addr| self.payloads.fetch(addr).ok())
            .is_some_and(|bytes| bytes.first() == Some(&STATUS_REMOVED))
    }

    /// Screening candidates for `query`, removed records excluded
    pub fn search(&self, query: &[u8]) -> Result<RoaringBitmap> {
        let mut candidates = self.fingerprints.screen(query)?;
        // Fingerprints without a loaded payload
        let payloads = self.payloads.count() as u32;
        if candidates.remove_range(payloads..) > 0 {
            debug!(payloads, "dropped candidates past the payload table");
        }
        let removed: Vec<u32> = candidates.iter().filter(|&id| self.is_removed(id)).collect();
        for id in removed {
            candidates.remove(id);
        }
        debug!(candidates = candidates.len(), "search finished");
        Ok(candidates)
    }
}
