//! Process-shared block cache and its coherence protocol.
//!
//! Every process that opens the same store derives the same store id and so
//! the same region names. Regions are files in a shared-memory directory
//! (`/dev/shm` where available) mapped with `memmap2`; unlinking a name never
//! invalidates a mapping another process already holds, which gives the
//! OS-level reference counting the cache relies on.
//!
//! One small state region per store holds the coherence word:
//!
//! ```text
//! offset 0   control   phase (2 bits) | version_loaded (62 bits)
//! offset 8   version   bumped by the writer on every change
//! offset 16  lease     loader lease deadline, unix millis (0 = none)
//! offset 24  owner     pid of the lease holder
//! ```
//!
//! Phase changes are compare-and-swap updates of the control word. A loader
//! claims LOADING together with a lease; waiters poll with bounded backoff and
//! take the lease over once it expires, so a crashed loader cannot wedge them.
//! Concurrent loaders are tolerated: regions are written to a temporary name
//! and renamed into place, and the last READY transition wins.

use super::blob::BlobStore;
use crate::error::{Error, Result};
use crate::utils::{get_u32_le, get_u64_le, put_u32_le, put_u64_le};
use ahash::RandomState;
use memmap2::{Mmap, MmapMut};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::hash::{BuildHasher, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const STATE_SIZE: u64 = 64;
const CONTROL_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 8;
const LEASE_OFFSET: usize = 16;
const OWNER_OFFSET: usize = 24;

const PHASE_SHIFT: u32 = 62;
const LOADED_MASK: u64 = (1 << PHASE_SHIFT) - 1;

/// Configuration of the shared region cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedCacheConfig {
    /// Directory holding region files; None picks a per-user default
    pub shm_dir: Option<PathBuf>,
    /// How long a LOADING claim stays valid without completing
    pub lease_timeout_ms: u64,
    /// First backoff step while waiting on another loader
    pub poll_initial_us: u64,
    /// Backoff ceiling
    pub poll_max_ms: u64,
    /// Give up waiting after this long
    pub max_wait_ms: u64,
}

impl Default for SharedCacheConfig {
    fn default() -> Self {
        Self {
            shm_dir: None,
            lease_timeout_ms: 30_000,
            poll_initial_us: 200,
            poll_max_ms: 50,
            max_wait_ms: 120_000,
        }
    }
}

impl SharedCacheConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        self.shm_dir.clone().unwrap_or_else(default_shm_dir)
    }
}

/// Per-user shared memory directory
pub fn default_shm_dir() -> PathBuf {
    #[cfg(unix)]
    let user = unsafe { libc::getuid() }.to_string();
    #[cfg(not(unix))]
    let user = std::env::var("USERNAME").unwrap_or_else(|_| "user".to_string());

    let base = Path::new("/dev/shm");
    let base = if base.is_dir() {
        base.to_path_buf()
    } else {
        std::env::temp_dir()
    };
    base.join(format!("molsieve-{}", user))
}

/// Derive the shared store id from the blob store identity and table name.
/// Format: sanitized table name + hash, like app data folder names.
pub fn store_id(identity: &str, table: &str) -> String {
    let mut hasher = RandomState::with_seeds(
        0x243f6a8885a308d3,
        0x13198a2e03707344,
        0xa4093822299f31d0,
        0x082efa98ec4e6c89,
    )
    .build_hasher();
    hasher.write(identity.as_bytes());
    hasher.write_u8(0);
    hasher.write(table.as_bytes());
    let hash = hasher.finish();

    let sanitized: String = table
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
        .take(24)
        .collect();
    format!("{}-{:016x}", sanitized, hash)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Coherence phase of a store's shared copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Empty = 0,
    Loading = 1,
    Ready = 2,
}

impl Phase {
    fn from_bits(bits: u64) -> Self {
        match bits {
            1 => Phase::Loading,
            2 => Phase::Ready,
            _ => Phase::Empty,
        }
    }
}

/// Snapshot of the coherence state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Coherence {
    pub phase: Phase,
    pub version: u64,
    pub version_loaded: u64,
}

fn pack(phase: Phase, version_loaded: u64) -> u64 {
    ((phase as u64) << PHASE_SHIFT) | (version_loaded & LOADED_MASK)
}

fn unpack(control: u64) -> (Phase, u64) {
    (Phase::from_bits(control >> PHASE_SHIFT), control & LOADED_MASK)
}

/// The small shared region holding the coherence word
pub struct CoherenceState {
    map: MmapMut,
}

impl CoherenceState {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        // Zero-filled state is a valid EMPTY state at version 0
        if file.metadata()?.len() < STATE_SIZE {
            file.set_len(STATE_SIZE)?;
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        if (map.len() as u64) < STATE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "coherence state region too small",
            ));
        }
        Ok(Self { map })
    }

    #[inline]
    fn word(&self, offset: usize) -> &AtomicU64 {
        debug_assert!(offset + 8 <= STATE_SIZE as usize);
        // The mapping is page aligned and at least STATE_SIZE bytes long, and
        // AtomicU64 has the size and alignment of u64.
        unsafe { &*(self.map.as_ptr().add(offset) as *const AtomicU64) }
    }

    pub fn snapshot(&self) -> Coherence {
        let (phase, version_loaded) = unpack(self.word(CONTROL_OFFSET).load(Ordering::Acquire));
        Coherence {
            phase,
            version: self.word(VERSION_OFFSET).load(Ordering::Acquire),
            version_loaded,
        }
    }

    /// Increment the version; returns the new value
    pub fn bump_version(&self) -> u64 {
        self.word(VERSION_OFFSET).fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Compare-and-swap the (phase, version_loaded) word
    pub fn transition(&self, from: (Phase, u64), to: (Phase, u64)) -> bool {
        self.word(CONTROL_OFFSET)
            .compare_exchange(
                pack(from.0, from.1),
                pack(to.0, to.1),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn lease_deadline(&self) -> u64 {
        self.word(LEASE_OFFSET).load(Ordering::Acquire)
    }

    fn claim_lease(&self, timeout: Duration) {
        self.word(OWNER_OFFSET)
            .store(std::process::id() as u64, Ordering::Release);
        self.word(LEASE_OFFSET)
            .store(now_ms() + timeout.as_millis() as u64, Ordering::Release);
    }

    fn steal_lease(&self, seen_deadline: u64, timeout: Duration) -> bool {
        let stolen = self
            .word(LEASE_OFFSET)
            .compare_exchange(
                seen_deadline,
                now_ms() + timeout.as_millis() as u64,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if stolen {
            self.word(OWNER_OFFSET)
                .store(std::process::id() as u64, Ordering::Release);
        }
        stolen
    }

    fn release_lease(&self) {
        self.word(LEASE_OFFSET).store(0, Ordering::Release);
        self.word(OWNER_OFFSET).store(0, Ordering::Release);
    }

    pub fn lease_owner(&self) -> u64 {
        self.word(OWNER_OFFSET).load(Ordering::Acquire)
    }
}

/// A named, read-only mapping of one backing row
pub struct SharedRegion {
    name: String,
    map: Option<Mmap>,
}

impl SharedRegion {
    /// Create (or replace) a region by filling a temporary file and renaming
    /// it into place, so existing attachments keep the old contents.
    pub fn create(
        dir: &Path,
        name: &str,
        len: usize,
        fill: impl FnOnce(&mut [u8]) -> Result<()>,
    ) -> Result<Self> {
        let path = dir.join(name);
        let tmp = dir.join(format!("{}.tmp{}", name, std::process::id()));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.set_len(len as u64)?;

        let map = if len > 0 {
            let mut map = unsafe { MmapMut::map_mut(&file)? };
            if let Err(e) = fill(&mut map[..]) {
                drop(map);
                let _ = fs::remove_file(&tmp);
                return Err(e);
            }
            Some(map.make_read_only()?)
        } else {
            fill(&mut [])?;
            None
        };

        fs::rename(&tmp, &path)?;
        Ok(Self {
            name: name.to_string(),
            map,
        })
    }

    /// Attach to a region created by another process
    pub fn attach(dir: &Path, name: &str) -> io::Result<Self> {
        let file = File::open(dir.join(name))?;
        let len = file.metadata()?.len();
        let map = if len > 0 {
            Some(unsafe { Mmap::map(&file)? })
        } else {
            None
        };
        Ok(Self {
            name: name.to_string(),
            map,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Regions of one loaded version: the address index row plus every block
pub struct RegionSet {
    pub version: u64,
    index: Arc<SharedRegion>,
    blocks: Vec<Arc<SharedRegion>>,
}

impl RegionSet {
    /// Serialized address index (row 0)
    pub fn index(&self) -> &[u8] {
        self.index.as_slice()
    }

    /// Region of zero-based payload block `block_id`
    pub fn block(&self, block_id: usize) -> Option<&Arc<SharedRegion>> {
        self.blocks.get(block_id)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_sizes(&self) -> Vec<u64> {
        self.blocks.iter().map(|b| b.len() as u64).collect()
    }
}

/// Exponential backoff for the LOADING wait
struct Backoff {
    step: Duration,
    max: Duration,
}

impl Backoff {
    fn new(config: &SharedCacheConfig) -> Self {
        Self {
            step: Duration::from_micros(config.poll_initial_us.max(1)),
            max: Duration::from_millis(config.poll_max_ms.max(1)),
        }
    }

    fn wait(&mut self) {
        std::thread::sleep(self.step);
        self.step = (self.step * 2).min(self.max);
    }
}

/// Per-process view of one store's shared cache
pub struct SharedCache {
    dir: PathBuf,
    store_id: String,
    config: SharedCacheConfig,
    state: Option<CoherenceState>,
    current: Option<Arc<RegionSet>>,
}

impl SharedCache {
    pub fn new(identity: &str, table: &str, config: SharedCacheConfig) -> Self {
        Self {
            dir: config.resolved_dir(),
            store_id: store_id(identity, table),
            config,
            state: None,
            current: None,
        }
    }

    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn region_name(&self, row: u32, version: u64) -> String {
        format!("{}_{}_{}", self.store_id, row, version)
    }

    fn manifest_name(&self, version: u64) -> String {
        format!("{}_m_{}", self.store_id, version)
    }

    fn state(&mut self) -> Result<&CoherenceState> {
        if self.state.is_none() {
            fs::create_dir_all(&self.dir)?;
            let path = self.dir.join(format!("{}.state", self.store_id));
            self.state = Some(CoherenceState::open(&path)?);
        }
        match self.state.as_ref() {
            Some(state) => Ok(state),
            None => Err(Error::Io(io::Error::other("coherence state unavailable"))),
        }
    }

    /// Current coherence snapshot
    pub fn coherence(&mut self) -> Result<Coherence> {
        Ok(self.state()?.snapshot())
    }

    /// Record that the backing data changed
    pub fn bump_version(&mut self) -> Result<u64> {
        Ok(self.state()?.bump_version())
    }

    /// The version this process has attached, if any
    pub fn attached_version(&self) -> Option<u64> {
        self.current.as_ref().map(|c| c.version)
    }

    pub fn current(&self) -> Option<&Arc<RegionSet>> {
        self.current.as_ref()
    }

    /// Drop this process's attachment and mark the shared copy stale
    pub fn invalidate(&mut self) -> Result<()> {
        self.current = None;
        self.bump_version()?;
        Ok(())
    }

    /// Detach without touching shared state
    pub fn detach(&mut self) {
        self.current = None;
    }

    /// Bring this process's attachment up to date with the backing store,
    /// loading the shared copy if it is missing or stale.
    pub fn validate(&mut self, blob: &dyn BlobStore, table: &str) -> Result<Arc<RegionSet>> {
        let started = Instant::now();
        let max_wait = Duration::from_millis(self.config.max_wait_ms);
        let lease_timeout = Duration::from_millis(self.config.lease_timeout_ms);
        let mut backoff = Backoff::new(&self.config);
        let mut loading_since: Option<Instant> = None;

        debug!(store = %self.store_id, "validating shared storage");

        loop {
            let snap = self.state()?.snapshot();

            if started.elapsed() > max_wait {
                return Err(Error::CoherenceTimeout {
                    state: format!("{:?}", snap.phase),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }

            match snap.phase {
                Phase::Loading => {
                    let since = *loading_since.get_or_insert_with(Instant::now);
                    let state = self.state()?;
                    let deadline = state.lease_deadline();
                    let expired = if deadline == 0 {
                        since.elapsed() > lease_timeout
                    } else {
                        now_ms() > deadline
                    };
                    let owner = state.lease_owner();
                    if expired && state.steal_lease(deadline, lease_timeout) {
                        warn!(
                            store = %self.store_id,
                            owner,
                            "loader lease expired, taking over"
                        );
                        return self.load(blob, table, snap);
                    }
                    backoff.wait();
                }
                Phase::Ready if snap.version_loaded == snap.version => {
                    if let Some(current) = &self.current {
                        if current.version == snap.version {
                            debug!(version = snap.version, "up to date");
                            return Ok(Arc::clone(current));
                        }
                    }
                    match self.attach(snap.version) {
                        Ok(set) => {
                            debug!(version = snap.version, "loaded by another process");
                            let set = Arc::new(set);
                            self.current = Some(Arc::clone(&set));
                            return Ok(set);
                        }
                        Err(Error::BlockMapFailed { region, source }) => {
                            // Rare but possible: regions were reclaimed under us
                            warn!(%region, error = %source, "shared memory is gone, resetting");
                            self.state()?.transition(
                                (Phase::Ready, snap.version_loaded),
                                (Phase::Empty, snap.version_loaded),
                            );
                        }
                        Err(e) => return Err(e),
                    }
                }
                Phase::Ready | Phase::Empty => {
                    let state = self.state()?;
                    if state.transition(
                        (snap.phase, snap.version_loaded),
                        (Phase::Loading, snap.version_loaded),
                    ) {
                        state.claim_lease(lease_timeout);
                        if snap.phase == Phase::Ready {
                            info!(
                                version = snap.version,
                                loaded = snap.version_loaded,
                                "storage has changed, reloading"
                            );
                        } else {
                            info!(version = snap.version, "loading shared storage");
                        }
                        return self.load(blob, table, snap);
                    }
                }
            }
        }
    }

    fn load(&mut self, blob: &dyn BlobStore, table: &str, claim: Coherence) -> Result<Arc<RegionSet>> {
        let version = claim.version;
        let populated = self.populate(blob, table, version);
        let state = self.state()?;

        let set = match populated {
            Ok(set) => set,
            Err(e) => {
                // Hand the claim back so waiters don't sit out the lease
                let now = state.snapshot();
                if now.phase == Phase::Loading {
                    state.transition(
                        (Phase::Loading, now.version_loaded),
                        (Phase::Empty, now.version_loaded),
                    );
                }
                state.release_lease();
                return Err(e);
            }
        };

        loop {
            let now = state.snapshot();
            match now.phase {
                Phase::Loading => {
                    if state.transition(
                        (Phase::Loading, now.version_loaded),
                        (Phase::Ready, version),
                    ) {
                        break;
                    }
                }
                // Another loader finished first; its READY stands
                _ => break,
            }
        }
        state.release_lease();

        self.remove_stale_regions(version);
        debug!(version, blocks = set.block_count(), "shared storage ready");

        let set = Arc::new(set);
        self.current = Some(Arc::clone(&set));
        Ok(set)
    }

    fn populate(&self, blob: &dyn BlobStore, table: &str, version: u64) -> Result<RegionSet> {
        let rows = blob.rows(table)?;
        let Some(index_row) = rows.iter().find(|r| r.key == 0) else {
            return Err(Error::MissingIndex {
                table: table.to_string(),
            });
        };
        super::address::AddressIndex::count_for_size(table, index_row.len)?;

        let mut index = None;
        let mut blocks = Vec::with_capacity(rows.len().saturating_sub(1));
        let mut manifest = Vec::with_capacity(4 + rows.len() * 12);
        put_u32_le(&mut manifest, rows.len() as u32);

        for row in &rows {
            if row.key != 0 && row.key as usize != blocks.len() + 1 {
                return Err(Error::CorruptBlock {
                    block: row.key as usize,
                    reason: format!("expected row {}", blocks.len() + 1),
                });
            }

            let name = self.region_name(row.key, version);
            let region = SharedRegion::create(&self.dir, &name, row.len as usize, |buf| {
                blob.read(table, row.key, 0, buf)
            })?;
            put_u32_le(&mut manifest, row.key);
            put_u64_le(&mut manifest, row.len);

            if row.key == 0 {
                index = Some(Arc::new(region));
            } else {
                blocks.push(Arc::new(region));
            }
        }

        // Manifest last: attachers only find complete versions
        let manifest_name = self.manifest_name(version);
        SharedRegion::create(&self.dir, &manifest_name, manifest.len(), |buf| {
            buf.copy_from_slice(&manifest);
            Ok(())
        })?;

        let index = index.ok_or_else(|| Error::MissingIndex {
            table: table.to_string(),
        })?;
        Ok(RegionSet {
            version,
            index,
            blocks,
        })
    }

    fn attach(&self, version: u64) -> Result<RegionSet> {
        let map_failed = |region: &str, source: io::Error| Error::BlockMapFailed {
            region: region.to_string(),
            source,
        };

        let manifest_name = self.manifest_name(version);
        let manifest = SharedRegion::attach(&self.dir, &manifest_name)
            .map_err(|e| map_failed(&manifest_name, e))?;
        let bytes = manifest.as_slice();
        let invalid = |name: &str| {
            map_failed(
                name,
                io::Error::new(io::ErrorKind::InvalidData, "region does not match manifest"),
            )
        };

        let count = get_u32_le(bytes, 0).ok_or_else(|| invalid(&manifest_name))? as usize;
        let mut index = None;
        let mut blocks = Vec::with_capacity(count.saturating_sub(1));

        for i in 0..count {
            let at = 4 + i * 12;
            let key = get_u32_le(bytes, at).ok_or_else(|| invalid(&manifest_name))?;
            let len = get_u64_le(bytes, at + 4).ok_or_else(|| invalid(&manifest_name))?;

            let name = self.region_name(key, version);
            let region = SharedRegion::attach(&self.dir, &name).map_err(|e| map_failed(&name, e))?;
            if region.len() as u64 != len {
                return Err(invalid(&name));
            }

            if key == 0 {
                index = Some(Arc::new(region));
            } else {
                blocks.push(Arc::new(region));
            }
        }

        let index = index.ok_or_else(|| invalid(&manifest_name))?;
        Ok(RegionSet {
            version,
            index,
            blocks,
        })
    }

    /// Unlink regions of versions older than `version`. Processes that still
    /// have them mapped keep their view until they detach.
    fn remove_stale_regions(&self, version: u64) {
        let prefix = format!("{}_", self.store_id);
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };

        let mut removed = 0usize;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Some(region_version) = rest.rsplit('_').next().and_then(|v| v.parse::<u64>().ok())
            else {
                continue;
            };
            if region_version < version && fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "unlinked stale shared regions");
        }
    }

    /// Remove every region and the state file of this store
    pub fn destroy(&mut self) -> Result<()> {
        self.current = None;
        self.state = None;
        let prefix = format!("{}_", self.store_id);
        let state_name = format!("{}.state", self.store_id);
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Ok(());
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) || name == state_name {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}
