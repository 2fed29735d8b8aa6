//! Cache handle: configuration, open/create, validation pipeline, close.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::format;
use crate::registry;
use crate::writer::WriteSession;
use slc_mmap::MmapFileMut;

/// Durability contract for a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Writeback {
    /// Rely on the OS to flush dirty pages lazily; no `msync` call.
    #[default]
    None,
    /// `msync` the header and touched data pages at commit boundaries.
    Sync,
}

/// Configuration for opening or creating a cache file.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub path: PathBuf,
    pub key_size: u32,
    pub index_size: u32,
    pub user_version: u64,
    pub slot_capacity: u64,
    pub ordered_keys: bool,
    pub writeback: Writeback,
    pub disable_locking: bool,
}

impl CacheOptions {
    pub fn new(
        path: impl Into<PathBuf>,
        key_size: u32,
        index_size: u32,
        slot_capacity: u64,
        user_version: u64,
    ) -> Self {
        Self {
            path: path.into(),
            key_size,
            index_size,
            user_version,
            slot_capacity,
            ordered_keys: false,
            writeback: Writeback::None,
            disable_locking: false,
        }
    }

    pub fn with_ordered_keys(mut self, ordered_keys: bool) -> Self {
        self.ordered_keys = ordered_keys;
        self
    }

    pub fn with_writeback(mut self, writeback: Writeback) -> Self {
        self.writeback = writeback;
        self
    }

    pub fn with_disable_locking(mut self, disable_locking: bool) -> Self {
        self.disable_locking = disable_locking;
        self
    }

    fn validate(&self) -> Result<Derived> {
        if self.key_size == 0 || self.key_size > format::MAX_KEY_SIZE {
            return Err(Error::invalid(format!(
                "key_size must be in 1..={}, got {}",
                format::MAX_KEY_SIZE,
                self.key_size
            )));
        }
        if self.index_size > format::MAX_INDEX_SIZE {
            return Err(Error::invalid(format!(
                "index_size must be <= {}, got {}",
                format::MAX_INDEX_SIZE,
                self.index_size
            )));
        }
        if self.slot_capacity == 0 || self.slot_capacity > format::MAX_SLOT_CAPACITY {
            return Err(Error::invalid(format!(
                "slot_capacity must be in 1..={}, got {}",
                format::MAX_SLOT_CAPACITY,
                self.slot_capacity
            )));
        }
        let slot_size = format::compute_slot_size(self.key_size, self.index_size);
        if slot_size > format::MAX_SLOT_SIZE {
            return Err(Error::invalid(format!(
                "slot_size {slot_size} exceeds the {} byte limit",
                format::MAX_SLOT_SIZE
            )));
        }
        let bucket_count = format::compute_bucket_count(self.slot_capacity);
        let slots_offset = format::HEADER_SIZE as u64;
        let buckets_offset = slots_offset + self.slot_capacity * slot_size as u64;
        let file_size = buckets_offset + bucket_count * format::BUCKET_RECORD_SIZE as u64;
        if file_size > format::MAX_FILE_SIZE {
            return Err(Error::invalid(format!(
                "file size {file_size} exceeds the {} byte limit",
                format::MAX_FILE_SIZE
            )));
        }
        Ok(Derived {
            slot_size,
            bucket_count,
            slots_offset,
            buckets_offset,
            file_size,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Derived {
    slot_size: usize,
    bucket_count: u64,
    slots_offset: u64,
    buckets_offset: u64,
    file_size: u64,
}

fn check_platform() -> Result<()> {
    if !cfg!(target_pointer_width = "64") {
        return Err(Error::incompatible("requires a 64-bit host"));
    }
    if !cfg!(target_endian = "little") {
        return Err(Error::incompatible("requires a little-endian host"));
    }
    Ok(())
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".lock");
    PathBuf::from(s)
}

/// Non-blocking exclusive lock attempt on `path`. `Ok(None)` means contended.
fn try_lock_exclusive(path: &Path) -> Result<Option<std::fs::File>> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(file)),
        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Handle to one open cache file. Bound to a single mapping; cheap to hold
/// across many operations, expensive to open (it runs the full validation
/// pipeline once).
pub struct Cache {
    mmap: MmapFileMut,
    // Cached once at open time; the mapping never moves or grows for the
    // life of this handle (dynamic resize is out of scope).
    base: *mut u8,
    mapping_len: usize,
    pub(crate) key_size: u32,
    pub(crate) index_size: u32,
    pub(crate) slot_size: usize,
    pub(crate) ordered_keys: bool,
    pub(crate) writeback: Writeback,
    pub(crate) disable_locking: bool,
    pub(crate) lock_path: PathBuf,
    file_key: registry::FileKey,
    pub(crate) registry: Arc<registry::RegistryEntry>,
    closed: AtomicBool,
}

// SAFETY: `base` always points within `mmap`'s live allocation, which this
// struct keeps alive for as long as `base` is used. All access through
// `base` is synchronized via `registry`'s lock plus the seqlock generation
// protocol, not via Rust's aliasing rules.
unsafe impl Send for Cache {}
unsafe impl Sync for Cache {}

impl Cache {
    /// Open the cache at `opts.path`, creating it if missing or empty.
    pub fn open(opts: CacheOptions) -> Result<Self> {
        Self::open_internal(opts, false)
    }

    /// Create a new cache file; fails with `Incompatible` if one already
    /// exists and is non-empty.
    pub fn create(opts: CacheOptions) -> Result<Self> {
        Self::open_internal(opts, true)
    }

    fn open_internal(opts: CacheOptions, require_new: bool) -> Result<Self> {
        check_platform()?;
        let derived = opts.validate()?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&opts.path)?;
        let existing_len = file.metadata()?.len();
        let lock_path = lock_path_for(&opts.path);

        let mut mmap = if existing_len == 0 {
            let _creation_lock = if opts.disable_locking {
                None
            } else {
                match try_lock_exclusive(&lock_path)? {
                    Some(lock) => Some(lock),
                    None => return Err(Error::Busy),
                }
            };
            file.set_len(derived.file_size)?;
            let mut mmap = MmapFileMut::from_file(file)?;
            write_fresh_header(mmap.as_mut_ptr(), &opts, &derived);
            mmap.sync_file()?;
            mmap.flush()?;
            debug!(path = %opts.path.display(), "created cache file");
            mmap
        } else {
            if require_new {
                return Err(Error::incompatible("file already exists"));
            }
            if existing_len < format::HEADER_SIZE as u64 {
                return Err(Error::incompatible("file shorter than the header"));
            }
            MmapFileMut::from_file(file)?
        };

        let base = mmap.as_ptr() as *const u8;

        validate_format_and_config(base, &opts, &derived)?;
        check_generation_state(&opts, base, &lock_path)?;
        validate_crc_and_state(base)?;
        validate_structural_invariants(base)?;
        bucket_sampling_spot_check(base)?;

        // `MmapFileMut` does not expose its `File`; re-open the path to read
        // the (device, inode) identity the registry keys on.
        let file_key = {
            let f = OpenOptions::new().read(true).open(&opts.path)?;
            registry::file_identity(&f)?
        };
        let registry_entry = registry::acquire(file_key);

        let mapping_len = mmap.len();
        let base = mmap.as_mut_ptr();

        let opened_generation = unsafe { format::generation(base) };
        debug!(path = %opts.path.display(), generation = opened_generation, "opened cache");

        Ok(Cache {
            key_size: opts.key_size,
            index_size: opts.index_size,
            slot_size: derived.slot_size,
            ordered_keys: opts.ordered_keys,
            writeback: opts.writeback,
            disable_locking: opts.disable_locking,
            lock_path,
            file_key,
            registry: registry_entry,
            closed: AtomicBool::new(false),
            mapping_len,
            base,
            mmap,
        })
    }

    pub(crate) fn base(&self) -> *const u8 {
        self.base as *const u8
    }

    pub(crate) fn base_mut(&self) -> *mut u8 {
        self.base
    }

    pub(crate) fn mapping_len(&self) -> usize {
        self.mapping_len
    }

    /// `msync` the whole mapping. Only called from the `Sync` writeback path.
    pub(crate) fn flush(&self) -> Result<()> {
        self.mmap.flush().map_err(Error::Writeback)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Begin a write session. Fails `Busy` if another writer (in this
    /// process, or cross-process when locking is enabled) is active.
    pub fn begin_write(&self) -> Result<WriteSession<'_>> {
        self.ensure_open()?;
        WriteSession::begin(self)
    }

    /// Close the handle. Idempotent; fails `Busy` if a writer session owned
    /// by this handle is still open.
    pub fn close(&self) -> Result<()> {
        if self
            .registry
            .writer_active
            .load(Ordering::Acquire)
        {
            return Err(Error::Busy);
        }
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            registry::release(self.file_key, &self.registry);
        }
        Ok(())
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            registry::release(self.file_key, &self.registry);
        }
    }
}

fn write_fresh_header(base: *mut u8, opts: &CacheOptions, derived: &Derived) {
    unsafe {
        std::ptr::write_bytes(base, 0, format::HEADER_SIZE);
        std::ptr::copy_nonoverlapping(format::MAGIC.as_ptr(), base, 4);
        (base.add(format::off::VERSION) as *mut u32).write_unaligned(format::FORMAT_VERSION);
        (base.add(format::off::HEADER_SIZE) as *mut u32)
            .write_unaligned(format::HEADER_SIZE as u32);

        format::set_key_size(base, opts.key_size);
        format::set_index_size(base, opts.index_size);
        format::set_slot_size_field(base, derived.slot_size as u32);
        format::set_hash_algorithm(base, format::HASH_ALGORITHM_FNV1A64);

        let mut flags = 0u32;
        if opts.ordered_keys {
            flags |= format::FLAG_ORDERED_KEYS;
        }
        format::set_flags(base, flags);

        format::set_slot_capacity(base, opts.slot_capacity);
        format::set_slot_highwater(base, 0);
        format::set_live_count(base, 0);
        format::set_user_version(base, opts.user_version);
        format::set_bucket_count(base, derived.bucket_count);
        format::set_bucket_used(base, 0);
        format::set_bucket_tombstones(base, 0);
        format::set_slots_offset(base, derived.slots_offset);
        format::set_buckets_offset(base, derived.buckets_offset);
        format::set_state(base, format::STATE_NORMAL);
        format::set_user_flags(base, 0);
        format::set_generation(base, 0, std::sync::atomic::Ordering::Relaxed);

        let snapshot = format::snapshot_header(base as *const u8);
        let crc = format::compute_header_crc(&snapshot);
        format::set_crc(base, crc);
    }
}

fn validate_format_and_config(base: *const u8, opts: &CacheOptions, derived: &Derived) -> Result<()> {
    unsafe {
        if format::magic(base) != format::MAGIC {
            return Err(Error::incompatible("bad magic"));
        }
        if format::version(base) != format::FORMAT_VERSION {
            return Err(Error::incompatible("unsupported version"));
        }
        if format::header_size_field(base) != format::HEADER_SIZE as u32 {
            return Err(Error::incompatible("unexpected header size"));
        }
        if format::hash_algorithm(base) != format::HASH_ALGORITHM_FNV1A64 {
            return Err(Error::incompatible("unsupported hash algorithm"));
        }
        if !format::reserved_is_zero(base) {
            return Err(Error::incompatible("reserved header bytes are non-zero"));
        }
        if format::key_size(base) != opts.key_size {
            return Err(Error::incompatible("key_size mismatch"));
        }
        if format::index_size(base) != opts.index_size {
            return Err(Error::incompatible("index_size mismatch"));
        }
        if format::user_version(base) != opts.user_version {
            return Err(Error::incompatible("user_version mismatch"));
        }
        if format::slot_capacity(base) != opts.slot_capacity {
            return Err(Error::incompatible("slot_capacity mismatch"));
        }
        let ordered = format::flags(base) & format::FLAG_ORDERED_KEYS != 0;
        if ordered != opts.ordered_keys {
            return Err(Error::incompatible("ordered_keys mismatch"));
        }
        if format::slot_size_field(base) != derived.slot_size as u32 {
            return Err(Error::incompatible("slot_size mismatch"));
        }
        if format::slots_offset(base) != derived.slots_offset {
            return Err(Error::incompatible("slots_offset mismatch"));
        }
        if format::buckets_offset(base) != derived.buckets_offset {
            return Err(Error::incompatible("buckets_offset mismatch"));
        }
        if format::bucket_count(base) != derived.bucket_count {
            return Err(Error::incompatible("bucket_count mismatch"));
        }
    }
    Ok(())
}

fn check_generation_state(opts: &CacheOptions, base: *const u8, lock_path: &Path) -> Result<()> {
    let generation = unsafe { format::generation(base) };
    if generation & 1 == 0 {
        return Ok(());
    }
    if opts.disable_locking {
        return Err(Error::Busy);
    }
    match try_lock_exclusive(lock_path)? {
        None => Err(Error::Busy),
        Some(lock) => {
            let generation2 = unsafe { format::generation(base) };
            drop(lock);
            if generation2 & 1 != 0 {
                warn!("generation still odd under the writer lock; treating as a crashed writer");
                Err(Error::Corrupt {
                    reason: "writer crashed mid-commit",
                })
            } else {
                Ok(())
            }
        }
    }
}

fn validate_crc_and_state(base: *const u8) -> Result<()> {
    let g1 = unsafe { format::generation(base) };
    let snapshot = unsafe { format::snapshot_header(base) };
    let expected = format::compute_header_crc(&snapshot);
    let stored = unsafe { format::crc(snapshot.as_ptr()) };
    if stored != expected {
        let g2 = unsafe { format::generation(base) };
        if g2 != g1 {
            return Err(Error::Busy);
        }
        if g2 & 1 != 0 {
            return Err(Error::Corrupt {
                reason: "writer crashed mid-commit",
            });
        }
        return Err(Error::Corrupt {
            reason: "header CRC mismatch",
        });
    }
    let state = unsafe { format::state(snapshot.as_ptr()) };
    if state == format::STATE_INVALIDATED {
        return Err(Error::Invalidated);
    }
    if state != format::STATE_NORMAL {
        return Err(Error::Corrupt {
            reason: "unrecognized state value",
        });
    }
    Ok(())
}

fn validate_structural_invariants(base: *const u8) -> Result<()> {
    unsafe {
        let capacity = format::slot_capacity(base);
        let highwater = format::slot_highwater(base);
        let live = format::live_count(base);
        let bucket_count = format::bucket_count(base);
        let bucket_used = format::bucket_used(base);
        let bucket_tombstones = format::bucket_tombstones(base);

        if highwater > capacity {
            return Err(Error::Corrupt {
                reason: "slot_highwater exceeds slot_capacity",
            });
        }
        if live > highwater {
            return Err(Error::Corrupt {
                reason: "live_count exceeds slot_highwater",
            });
        }
        if bucket_used != live {
            return Err(Error::Corrupt {
                reason: "bucket_used disagrees with live_count",
            });
        }
        if !bucket_count.is_power_of_two() || bucket_count < 2 {
            return Err(Error::Corrupt {
                reason: "bucket_count is not a power of two >= 2",
            });
        }
        if bucket_count <= capacity {
            return Err(Error::Corrupt {
                reason: "bucket_count does not exceed slot_capacity",
            });
        }
        if bucket_used + bucket_tombstones >= bucket_count {
            return Err(Error::Corrupt {
                reason: "no empty bucket slack remains",
            });
        }
    }
    Ok(())
}

fn bucket_sampling_spot_check(base: *const u8) -> Result<()> {
    unsafe {
        let bucket_count = format::bucket_count(base);
        let buckets_offset = format::buckets_offset(base);
        let highwater = format::slot_highwater(base);
        let samples = format::BUCKET_SAMPLE_COUNT.min(bucket_count);
        let step = (bucket_count / samples).max(1);

        for i in 0..samples {
            let idx = (i * step).min(bucket_count - 1);
            let off = format::bucket_offset(buckets_offset, idx);
            let slot_plus_one = format::bucket_slot_plus_one(base, off);
            if slot_plus_one == format::BUCKET_EMPTY || slot_plus_one == format::BUCKET_TOMBSTONE {
                continue;
            }
            let slot_id = slot_plus_one - 1;
            if slot_id >= highwater {
                return Err(Error::Corrupt {
                    reason: "sampled bucket references a slot past highwater",
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_then_open_round_trips_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("create_open");
        let opts = CacheOptions::new(&path, 8, 4, 64, 1).with_disable_locking(true);
        {
            let cache = Cache::create(opts.clone()).unwrap();
            assert_eq!(cache.key_size, 8);
            cache.close().unwrap();
        }
        {
            let cache = Cache::open(opts).unwrap();
            cache.close().unwrap();
        }
    }

    #[test]
    fn create_twice_is_incompatible() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("create_twice");
        let opts = CacheOptions::new(&path, 8, 4, 64, 1).with_disable_locking(true);
        let cache = Cache::create(opts.clone()).unwrap();
        cache.close().unwrap();
        let result = Cache::create(opts);
        assert!(matches!(result, Err(Error::Incompatible { .. })));
    }

    #[test]
    fn mismatched_key_size_is_incompatible() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mismatch");
        let opts = CacheOptions::new(&path, 8, 4, 64, 1).with_disable_locking(true);
        let cache = Cache::create(opts).unwrap();
        cache.close().unwrap();

        let bad_opts = CacheOptions::new(&path, 16, 4, 64, 1).with_disable_locking(true);
        let result = Cache::open(bad_opts);
        assert!(matches!(result, Err(Error::Incompatible { .. })));
    }
}
