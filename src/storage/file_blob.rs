//! Directory-backed blob store.
//!
//! Each table is a directory and each row a file named `row_<key>.bin`.
//! Writes are staged in memory and published on commit by writing a
//! temporary file and renaming it over the row. Row 0 of every table is
//! renamed last, so a reader that trusts the address index never sees an
//! index entry whose payload is not on disk yet.

use super::blob::{read_range, row_not_found, write_range, BlobStore, RowInfo, TableLock};
use crate::error::{Error, Result};
use rustc_hash::FxHashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const ROW_PREFIX: &str = "row_";
const ROW_SUFFIX: &str = ".bin";
const LOCK_FILE: &str = ".lock";

pub struct FileBlobStore {
    root: PathBuf,
    identity: String,
    staged: Mutex<FxHashMap<(String, u32), Vec<u8>>>,
}

impl FileBlobStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        let identity = format!("file:{}", root.display());
        Ok(Self {
            root,
            identity,
            staged: Mutex::new(FxHashMap::default()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_dir(&self, table: &str) -> PathBuf {
        self.root.join(table)
    }

    fn row_path(&self, table: &str, key: u32) -> PathBuf {
        self.table_dir(table)
            .join(format!("{}{:010}{}", ROW_PREFIX, key, ROW_SUFFIX))
    }

    fn existing_table_dir(&self, table: &str) -> Result<PathBuf> {
        let dir = self.table_dir(table);
        if !dir.is_dir() {
            return Err(Error::TableNotFound(table.to_string()));
        }
        Ok(dir)
    }

    fn staged(&self) -> MutexGuard<'_, FxHashMap<(String, u32), Vec<u8>>> {
        self.staged.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn discard_staged(&self, table: &str) {
        self.staged().retain(|(t, _), _| t != table);
    }

    fn publish_row(&self, table: &str, key: u32, data: &[u8]) -> Result<()> {
        let path = self.row_path(table, key);
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn parse_row_key(name: &str) -> Option<u32> {
    name.strip_prefix(ROW_PREFIX)?
        .strip_suffix(ROW_SUFFIX)?
        .parse()
        .ok()
}

#[cfg(unix)]
fn try_flock(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn try_flock(_file: &File) -> std::io::Result<()> {
    Ok(())
}

impl BlobStore for FileBlobStore {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn create_table(&self, table: &str) -> Result<()> {
        fs::create_dir_all(self.table_dir(table))?;
        Ok(())
    }

    fn drop_table(&self, table: &str) -> Result<()> {
        self.discard_staged(table);
        let dir = self.table_dir(table);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    fn truncate_table(&self, table: &str) -> Result<()> {
        self.discard_staged(table);
        let dir = self.existing_table_dir(table)?;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if parse_row_key(&name.to_string_lossy()).is_some() {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    fn insert_row(&self, table: &str, key: u32) -> Result<()> {
        self.existing_table_dir(table)?;
        let mut staged = self.staged();
        let staged_key = (table.to_string(), key);
        if staged.contains_key(&staged_key) || self.row_path(table, key).exists() {
            tracing::warn!(table, key, "row already exists, keeping it");
            return Ok(());
        }
        staged.insert(staged_key, Vec::new());
        Ok(())
    }

    fn rows(&self, table: &str) -> Result<Vec<RowInfo>> {
        let dir = self.existing_table_dir(table)?;
        let mut rows: FxHashMap<u32, u64> = FxHashMap::default();

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(key) = parse_row_key(&entry.file_name().to_string_lossy()) {
                rows.insert(key, entry.metadata()?.len());
            }
        }
        for ((t, key), data) in self.staged().iter() {
            if t == table {
                rows.insert(*key, data.len() as u64);
            }
        }

        let mut rows: Vec<RowInfo> = rows
            .into_iter()
            .map(|(key, len)| RowInfo { key, len })
            .collect();
        rows.sort_by_key(|r| r.key);
        Ok(rows)
    }

    fn read(&self, table: &str, key: u32, offset: u64, buf: &mut [u8]) -> Result<()> {
        if let Some(row) = self.staged().get(&(table.to_string(), key)) {
            return read_range(row, key, offset, buf);
        }

        self.existing_table_dir(table)?;
        let path = self.row_path(table, key);
        if !path.exists() {
            return Err(row_not_found(table, key));
        }
        let row = fs::read(&path)?;
        read_range(&row, key, offset, buf)
    }

    fn write(&self, table: &str, key: u32, offset: u64, data: &[u8]) -> Result<()> {
        let mut staged = self.staged();
        let staged_key = (table.to_string(), key);
        if !staged.contains_key(&staged_key) {
            self.existing_table_dir(table)?;
            let path = self.row_path(table, key);
            if !path.exists() {
                return Err(row_not_found(table, key));
            }
            staged.insert(staged_key.clone(), fs::read(&path)?);
        }
        if let Some(row) = staged.get_mut(&staged_key) {
            write_range(row, offset, data);
        }
        Ok(())
    }

    fn lock_table(&self, table: &str) -> Result<TableLock> {
        let dir = self.existing_table_dir(table)?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(dir.join(LOCK_FILE))?;

        if try_flock(&file).is_err() {
            return Err(Error::TableLocked(table.to_string()));
        }

        // Process ID in the lock file for debugging
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        Ok(TableLock::new(file))
    }

    fn commit(&self) -> Result<()> {
        let staged = std::mem::take(&mut *self.staged());
        if staged.is_empty() {
            return Ok(());
        }

        let mut pending: Vec<((String, u32), Vec<u8>)> = staged.into_iter().collect();
        // Payload rows first, index rows (key 0) last
        pending.sort_by(|a, b| {
            let a_index = a.0 .1 == 0;
            let b_index = b.0 .1 == 0;
            a_index.cmp(&b_index).then_with(|| a.0.cmp(&b.0))
        });

        let mut touched = Vec::new();
        for ((table, key), data) in &pending {
            if !self.table_dir(table).is_dir() {
                continue;
            }
            self.publish_row(table, *key, data)?;
            if !touched.contains(table) {
                touched.push(table.clone());
            }
        }

        #[cfg(unix)]
        for table in &touched {
            File::open(self.table_dir(table))?.sync_all()?;
        }

        tracing::debug!(rows = pending.len(), tables = touched.len(), "committed staged rows");
        Ok(())
    }
}
