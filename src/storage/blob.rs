//! Backing blob store interface and the in-memory implementation.
//!
//! The host relational store is modelled as a set of named tables, each
//! holding rows of bytes keyed by an integer. Writes are staged per session
//! and become visible to other sessions only on [`BlobStore::commit`]. DDL
//! (create / drop / truncate) takes effect immediately.

use crate::error::{Error, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

/// One row of a table as returned by [`BlobStore::rows`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowInfo {
    pub key: u32,
    pub len: u64,
}

/// Table statistics returned by `analyze`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TableStats {
    pub rows: usize,
    pub bytes: u64,
}

/// Exclusive table lock; released when dropped
pub struct TableLock {
    _guard: Box<dyn Send>,
}

impl TableLock {
    pub fn new(guard: impl Send + 'static) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

/// Primitive operations the engines issue against the host store
pub trait BlobStore: Send + Sync {
    /// Stable identity of the store instance, used to name shared regions
    fn identity(&self) -> &str;

    fn create_table(&self, table: &str) -> Result<()>;
    fn drop_table(&self, table: &str) -> Result<()>;
    fn truncate_table(&self, table: &str) -> Result<()>;

    /// Insert an empty row (staged until commit)
    fn insert_row(&self, table: &str, key: u32) -> Result<()>;

    /// All rows of the table ordered by key, as seen by this session
    fn rows(&self, table: &str) -> Result<Vec<RowInfo>>;

    fn read(&self, table: &str, key: u32, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Overwrite or extend a row at `offset` (staged until commit)
    fn write(&self, table: &str, key: u32, offset: u64, data: &[u8]) -> Result<()>;

    fn lock_table(&self, table: &str) -> Result<TableLock>;

    /// Publish every staged write of this session as one unit
    fn commit(&self) -> Result<()>;

    fn analyze_table(&self, table: &str) -> Result<TableStats> {
        let rows = self.rows(table)?;
        Ok(TableStats {
            rows: rows.len(),
            bytes: rows.iter().map(|r| r.len).sum(),
        })
    }

    /// Read a whole row, or None if it does not exist
    fn read_row(&self, table: &str, key: u32) -> Result<Option<Vec<u8>>> {
        let Some(row) = self.rows(table)?.into_iter().find(|r| r.key == key) else {
            return Ok(None);
        };
        let mut buf = vec![0u8; row.len as usize];
        self.read(table, key, 0, &mut buf)?;
        Ok(Some(buf))
    }
}

pub(crate) fn row_not_found(table: &str, key: u32) -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("row {} not found in table {}", key, table),
    ))
}

pub(crate) fn read_range(
    row: &[u8],
    key: u32,
    offset: u64,
    buf: &mut [u8],
) -> Result<()> {
    let end = offset + buf.len() as u64;
    if end > row.len() as u64 {
        return Err(Error::OutOfRange {
            block: key,
            offset: offset as u32,
            length: buf.len() as u32,
            size: row.len() as u64,
        });
    }
    buf.copy_from_slice(&row[offset as usize..end as usize]);
    Ok(())
}

pub(crate) fn write_range(row: &mut Vec<u8>, offset: u64, data: &[u8]) {
    let end = offset as usize + data.len();
    if row.len() < end {
        row.resize(end, 0);
    }
    row[offset as usize..end].copy_from_slice(data);
}

type Table = BTreeMap<u32, Vec<u8>>;

#[derive(Default)]
struct Committed {
    tables: FxHashMap<String, Table>,
    locks: FxHashSet<String>,
}

/// In-memory blob store.
///
/// Every handle is one session with its own staging area; [`session`]
/// creates another handle over the same committed tables, which is how tests
/// stand in for several cooperating processes.
///
/// [`session`]: MemoryBlobStore::session
pub struct MemoryBlobStore {
    identity: String,
    committed: Arc<Mutex<Committed>>,
    staged: Mutex<FxHashMap<String, Table>>,
}

impl MemoryBlobStore {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            committed: Arc::new(Mutex::new(Committed::default())),
            staged: Mutex::new(FxHashMap::default()),
        }
    }

    /// Open another session over the same committed data
    pub fn session(&self) -> Self {
        Self {
            identity: self.identity.clone(),
            committed: Arc::clone(&self.committed),
            staged: Mutex::new(FxHashMap::default()),
        }
    }

    fn committed(&self) -> MutexGuard<'_, Committed> {
        self.committed.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn staged(&self) -> MutexGuard<'_, FxHashMap<String, Table>> {
        self.staged.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct MemoryLock {
    committed: Arc<Mutex<Committed>>,
    table: String,
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        let mut committed = self.committed.lock().unwrap_or_else(|e| e.into_inner());
        committed.locks.remove(&self.table);
    }
}

impl BlobStore for MemoryBlobStore {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn create_table(&self, table: &str) -> Result<()> {
        self.committed()
            .tables
            .entry(table.to_string())
            .or_default();
        Ok(())
    }

    fn drop_table(&self, table: &str) -> Result<()> {
        self.staged().remove(table);
        self.committed().tables.remove(table);
        Ok(())
    }

    fn truncate_table(&self, table: &str) -> Result<()> {
        self.staged().remove(table);
        match self.committed().tables.get_mut(table) {
            Some(rows) => {
                rows.clear();
                Ok(())
            }
            None => Err(Error::TableNotFound(table.to_string())),
        }
    }

    fn insert_row(&self, table: &str, key: u32) -> Result<()> {
        let exists = {
            let committed = self.committed();
            let rows = committed
                .tables
                .get(table)
                .ok_or_else(|| Error::TableNotFound(table.to_string()))?;
            rows.contains_key(&key)
        };
        let mut staged = self.staged();
        let staged_rows = staged.entry(table.to_string()).or_default();
        if exists || staged_rows.contains_key(&key) {
            tracing::warn!(table, key, "row already exists, keeping it");
            return Ok(());
        }
        staged_rows.insert(key, Vec::new());
        Ok(())
    }

    fn rows(&self, table: &str) -> Result<Vec<RowInfo>> {
        let mut merged: BTreeMap<u32, u64> = {
            let committed = self.committed();
            committed
                .tables
                .get(table)
                .ok_or_else(|| Error::TableNotFound(table.to_string()))?
                .iter()
                .map(|(&k, v)| (k, v.len() as u64))
                .collect()
        };
        if let Some(staged_rows) = self.staged().get(table) {
            for (&k, v) in staged_rows {
                merged.insert(k, v.len() as u64);
            }
        }

        Ok(merged
            .into_iter()
            .map(|(key, len)| RowInfo { key, len })
            .collect())
    }

    fn read(&self, table: &str, key: u32, offset: u64, buf: &mut [u8]) -> Result<()> {
        if let Some(row) = self.staged().get(table).and_then(|t| t.get(&key)) {
            return read_range(row, key, offset, buf);
        }
        let committed = self.committed();
        let row = committed
            .tables
            .get(table)
            .ok_or_else(|| Error::TableNotFound(table.to_string()))?
            .get(&key)
            .ok_or_else(|| row_not_found(table, key))?;
        read_range(row, key, offset, buf)
    }

    fn write(&self, table: &str, key: u32, offset: u64, data: &[u8]) -> Result<()> {
        let mut staged = self.staged();
        let staged_rows = staged.entry(table.to_string()).or_default();
        if !staged_rows.contains_key(&key) {
            let committed = self.committed();
            let row = committed
                .tables
                .get(table)
                .ok_or_else(|| Error::TableNotFound(table.to_string()))?
                .get(&key)
                .ok_or_else(|| row_not_found(table, key))?;
            staged_rows.insert(key, row.clone());
        }
        if let Some(row) = staged_rows.get_mut(&key) {
            write_range(row, offset, data);
        }
        Ok(())
    }

    fn lock_table(&self, table: &str) -> Result<TableLock> {
        let mut committed = self.committed();
        if !committed.locks.insert(table.to_string()) {
            return Err(Error::TableLocked(table.to_string()));
        }
        Ok(TableLock::new(MemoryLock {
            committed: Arc::clone(&self.committed),
            table: table.to_string(),
        }))
    }

    fn commit(&self) -> Result<()> {
        let staged = std::mem::take(&mut *self.staged());
        let mut committed = self.committed();
        for (table, rows) in staged {
            // Rows staged against a table dropped in the meantime are discarded
            if let Some(target) = committed.tables.get_mut(&table) {
                target.extend(rows);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staged_writes_are_session_local() {
        let store = MemoryBlobStore::new("mem");
        store.create_table("t").unwrap();
        store.insert_row("t", 0).unwrap();
        store.write("t", 0, 0, b"abc").unwrap();

        let other = store.session();
        assert!(other.rows("t").unwrap().is_empty());
        assert_eq!(store.read_row("t", 0).unwrap().unwrap(), b"abc");

        store.commit().unwrap();
        assert_eq!(other.read_row("t", 0).unwrap().unwrap(), b"abc");
    }

    #[test]
    fn test_write_extends_and_overwrites() {
        let store = MemoryBlobStore::new("mem");
        store.create_table("t").unwrap();
        store.insert_row("t", 1).unwrap();
        store.write("t", 1, 0, b"hello").unwrap();
        store.write("t", 1, 4, b"0 world").unwrap();
        store.commit().unwrap();

        let mut buf = [0u8; 5];
        store.read("t", 1, 6, &mut buf).unwrap();
        assert_eq!(&buf, b"world");

        let err = store.read("t", 1, 8, &mut buf).unwrap_err();
        assert!(matches!(err, Error::OutOfRange { .. }));
    }

    #[test]
    fn test_rows_ordered_by_key() {
        let store = MemoryBlobStore::new("mem");
        store.create_table("t").unwrap();
        for key in [3, 0, 2, 1] {
            store.insert_row("t", key).unwrap();
        }
        let keys: Vec<u32> = store.rows("t").unwrap().iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_table_lock_is_exclusive() {
        let store = MemoryBlobStore::new("mem");
        store.create_table("t").unwrap();
        let other = store.session();

        let lock = store.lock_table("t").unwrap();
        assert!(matches!(other.lock_table("t"), Err(Error::TableLocked(_))));
        drop(lock);
        assert!(other.lock_table("t").is_ok());
    }

    #[test]
    fn test_truncate_and_drop() {
        let store = MemoryBlobStore::new("mem");
        store.create_table("t").unwrap();
        store.insert_row("t", 0).unwrap();
        store.commit().unwrap();

        store.truncate_table("t").unwrap();
        assert!(store.rows("t").unwrap().is_empty());

        store.drop_table("t").unwrap();
        assert!(matches!(store.rows("t"), Err(Error::TableNotFound(_))));
    }
}
