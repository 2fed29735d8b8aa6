//! Buffered mutation session and the seqlock publish protocol.

use std::sync::atomic::Ordering;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::format;
use crate::mapping::{Cache, Writeback};

enum StagedOp {
    Put {
        key: Vec<u8>,
        revision: i64,
        index: Vec<u8>,
    },
    Delete {
        key: Vec<u8>,
    },
}

/// A buffered set of mutations against one `Cache`. Nothing touches the
/// mapping until `commit` runs; dropping the session without committing
/// discards everything staged.
pub struct WriteSession<'a> {
    cache: &'a Cache,
    ops: Vec<StagedOp>,
    user_flags: Option<u64>,
    user_data: Option<Vec<u8>>,
    lock_file: Option<std::fs::File>,
}

impl<'a> WriteSession<'a> {
    pub(crate) fn begin(cache: &'a Cache) -> Result<Self> {
        if cache
            .registry
            .writer_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Busy);
        }

        let lock_file = if cache.disable_locking {
            None
        } else {
            match try_lock(&cache.lock_path) {
                Ok(Some(file)) => Some(file),
                Ok(None) => {
                    cache.registry.writer_active.store(false, Ordering::Release);
                    return Err(Error::Busy);
                }
                Err(e) => {
                    cache.registry.writer_active.store(false, Ordering::Release);
                    return Err(e);
                }
            }
        };

        let state = unsafe { format::state(cache.base()) };
        if state == format::STATE_INVALIDATED {
            cache.registry.writer_active.store(false, Ordering::Release);
            return Err(Error::Invalidated);
        }

        Ok(WriteSession {
            cache,
            ops: Vec::new(),
            user_flags: None,
            user_data: None,
            lock_file,
        })
    }

    /// Stage an insert-or-update of `key`.
    pub fn put(&mut self, key: &[u8], revision: i64, index: &[u8]) -> Result<()> {
        if key.len() != self.cache.key_size as usize {
            return Err(Error::invalid("key length does not match key_size"));
        }
        if index.len() != self.cache.index_size as usize {
            return Err(Error::invalid("index length does not match index_size"));
        }
        if self.ops.len() >= format::MAX_STAGED_OPS {
            return Err(Error::invalid("too many staged operations in one session"));
        }
        if self.cache.ordered_keys {
            if let Some(max_key) = self.highest_known_key() {
                if key < max_key.as_slice() && !self.key_already_present(key) {
                    return Err(Error::invalid(
                        "ordered-keys cache requires non-decreasing put order",
                    ));
                }
            }
        }
        self.ops.push(StagedOp::Put {
            key: key.to_vec(),
            revision,
            index: index.to_vec(),
        });
        Ok(())
    }

    /// Stage a delete of `key`. Returns whether the key is currently
    /// present (committed state plus already-staged operations).
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        if key.len() != self.cache.key_size as usize {
            return Err(Error::invalid("key length does not match key_size"));
        }
        if self.ops.len() >= format::MAX_STAGED_OPS {
            return Err(Error::invalid("too many staged operations in one session"));
        }
        let was_present = self.key_already_present(key);
        self.ops.push(StagedOp::Delete { key: key.to_vec() });
        Ok(was_present)
    }

    pub fn set_user_header_flags(&mut self, flags: u64) {
        self.user_flags = Some(flags);
    }

    pub fn set_user_header_data(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > format::off::USER_DATA_LEN {
            return Err(Error::invalid("user header data exceeds 64 bytes"));
        }
        self.user_data = Some(data.to_vec());
        Ok(())
    }

    /// Resolve whether `key` is logically present given staged ops applied
    /// in order over the committed state.
    fn key_already_present(&self, key: &[u8]) -> bool {
        let mut present = self.committed_key_present(key);
        for op in &self.ops {
            match op {
                StagedOp::Put { key: k, .. } if k == key => present = true,
                StagedOp::Delete { key: k } if k == key => present = false,
                _ => {}
            }
        }
        present
    }

    fn committed_key_present(&self, key: &[u8]) -> bool {
        probe_bucket(self.cache, key).is_some()
    }

    /// Largest committed or already-staged key, used to validate ordering
    /// eagerly as `put` calls arrive.
    fn highest_known_key(&self) -> Option<Vec<u8>> {
        let mut highest = self.committed_max_key();
        for op in &self.ops {
            if let StagedOp::Put { key, .. } = op {
                if highest.as_deref().is_none_or(|h| key.as_slice() > h) {
                    highest = Some(key.clone());
                }
            }
        }
        highest
    }

    fn committed_max_key(&self) -> Option<Vec<u8>> {
        let base = self.cache.base();
        let highwater = unsafe { format::slot_highwater(base) };
        let slots_offset = unsafe { format::slots_offset(base) };
        for slot_id in (0..highwater).rev() {
            let slot_off = format::slot_offset(slots_offset, self.cache.slot_size, slot_id);
            let meta = unsafe { format::slot_meta(base, slot_off) };
            if meta & format::META_USED != 0 {
                let key = unsafe {
                    format::slot_key(base, slot_off, self.cache.key_size as usize).to_vec()
                };
                return Some(key);
            }
        }
        None
    }

    /// Publish all staged mutations via the seqlock odd/even protocol.
    pub fn commit(self) -> Result<()> {
        let cache = self.cache;
        let _guard = cache.registry.lock.write().expect("registry lock poisoned");
        let base = cache.base_mut();

        let g0 = unsafe { format::generation(base) };
        unsafe { format::set_generation(base, g0.wrapping_add(1), Ordering::Release) };

        let outcome = apply_staged(cache, base, &self.ops, &self.user_flags, &self.user_data);

        if outcome.is_ok() && cache.writeback == Writeback::Sync {
            if let Err(e) = cache.flush() {
                unsafe { format::set_generation(base, g0.wrapping_add(2), Ordering::Release) };
                return Err(e);
            }
        }

        let snapshot = unsafe { format::snapshot_header(base as *const u8) };
        let crc = format::compute_header_crc(&snapshot);
        unsafe { format::set_crc(base, crc) };

        if cache.writeback == Writeback::Sync {
            if let Err(e) = cache.flush() {
                unsafe { format::set_generation(base, g0.wrapping_add(2), Ordering::Release) };
                return Err(e);
            }
        }

        unsafe { format::set_generation(base, g0.wrapping_add(2), Ordering::Release) };

        if cache.writeback == Writeback::Sync {
            if let Err(e) = cache.flush() {
                return Err(e);
            }
        }

        debug!(generation = g0.wrapping_add(2), ops = self.ops.len(), "committed write session");
        outcome
    }

    /// Mark the cache permanently invalidated. Idempotent from the caller's
    /// perspective: once invalidated, every subsequent open/operation fails.
    pub fn invalidate(self) -> Result<()> {
        let cache = self.cache;
        let _guard = cache.registry.lock.write().expect("registry lock poisoned");
        let base = cache.base_mut();

        let g0 = unsafe { format::generation(base) };
        unsafe { format::set_generation(base, g0.wrapping_add(1), Ordering::Release) };
        unsafe { format::set_state(base, format::STATE_INVALIDATED) };
        let snapshot = unsafe { format::snapshot_header(base as *const u8) };
        let crc = format::compute_header_crc(&snapshot);
        unsafe { format::set_crc(base, crc) };
        unsafe { format::set_generation(base, g0.wrapping_add(2), Ordering::Release) };

        warn!("cache invalidated");
        Ok(())
    }
}

impl Drop for WriteSession<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock_file.take() {
            let _ = fs2::FileExt::unlock(&lock);
        }
        self.cache
            .registry
            .writer_active
            .store(false, Ordering::Release);
    }
}

fn try_lock(path: &std::path::Path) -> Result<Option<std::fs::File>> {
    use fs2::FileExt;
    let file = std::fs::OpenOptions::new()
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

/// Linear-probe `key`'s bucket; returns the slot id if a live, matching
/// bucket entry exists. Used only from within an active write session,
/// where no concurrent writer can be mutating the table.
fn probe_bucket(cache: &Cache, key: &[u8]) -> Option<u64> {
    let base = cache.base();
    let hash = format::fnv1a64(key);
    let bucket_count = unsafe { format::bucket_count(base) };
    let buckets_offset = unsafe { format::buckets_offset(base) };
    let slots_offset = unsafe { format::slots_offset(base) };
    let mut idx = hash % bucket_count;

    for _ in 0..bucket_count {
        let off = format::bucket_offset(buckets_offset, idx);
        let slot_plus_one = unsafe { format::bucket_slot_plus_one(base, off) };
        if slot_plus_one == format::BUCKET_EMPTY {
            return None;
        }
        if slot_plus_one != format::BUCKET_TOMBSTONE {
            let slot_id = slot_plus_one - 1;
            let stored_hash = unsafe { format::bucket_hash(base, off) };
            if stored_hash == hash {
                let slot_off = format::slot_offset(slots_offset, cache.slot_size, slot_id);
                let slot_key = unsafe { format::slot_key(base, slot_off, cache.key_size as usize) };
                if slot_key == key {
                    return Some(slot_id);
                }
            }
        }
        idx = (idx + 1) % bucket_count;
    }
    None
}

/// Find the bucket slot to place `key` in: an existing `FULL` bucket for an
/// update, or the first `EMPTY`/`TOMBSTONE` bucket for an insert. Returns
/// `None` if the table has no room (every bucket probed is `FULL`).
fn find_bucket_for_insert(cache: &Cache, key: &[u8], hash: u64) -> Option<InsertTarget> {
    let base = cache.base();
    let bucket_count = unsafe { format::bucket_count(base) };
    let buckets_offset = unsafe { format::buckets_offset(base) };
    let slots_offset = unsafe { format::slots_offset(base) };
    let mut idx = hash % bucket_count;
    let mut first_tombstone: Option<u64> = None;

    for _ in 0..bucket_count {
        let off = format::bucket_offset(buckets_offset, idx);
        let slot_plus_one = unsafe { format::bucket_slot_plus_one(base, off) };
        if slot_plus_one == format::BUCKET_EMPTY {
            return Some(InsertTarget::Bucket(first_tombstone.unwrap_or(idx)));
        }
        if slot_plus_one == format::BUCKET_TOMBSTONE {
            if first_tombstone.is_none() {
                first_tombstone = Some(idx);
            }
        } else {
            let stored_hash = unsafe { format::bucket_hash(base, off) };
            if stored_hash == hash {
                let slot_id = slot_plus_one - 1;
                let slot_off = format::slot_offset(slots_offset, cache.slot_size, slot_id);
                let slot_key =
                    unsafe { format::slot_key(base, slot_off, cache.key_size as usize) };
                if slot_key == key {
                    return Some(InsertTarget::ExistingSlot(slot_id));
                }
            }
        }
        idx = (idx + 1) % bucket_count;
    }
    None
}

enum InsertTarget {
    /// Reuse an existing live slot (update in place).
    ExistingSlot(u64),
    /// Write a fresh slot at the current highwater and claim this bucket.
    Bucket(u64),
}

fn apply_staged(
    cache: &Cache,
    base: *mut u8,
    ops: &[StagedOp],
    user_flags: &Option<u64>,
    user_data: &Option<Vec<u8>>,
) -> Result<()> {
    for op in ops {
        match op {
            StagedOp::Put {
                key,
                revision,
                index,
            } => apply_put(cache, base, key, *revision, index)?,
            StagedOp::Delete { key } => apply_delete(cache, base, key),
        }
    }

    if let Some(flags) = user_flags {
        unsafe { format::set_user_flags(base, *flags) };
    }
    if let Some(data) = user_data {
        unsafe { format::set_user_data(base, data) };
    }

    Ok(())
}

fn apply_put(cache: &Cache, base: *mut u8, key: &[u8], revision: i64, index: &[u8]) -> Result<()> {
    let hash = format::fnv1a64(key);
    let target = find_bucket_for_insert(cache, key, hash).ok_or(Error::Corrupt {
        reason: "hash table exhausted: no empty bucket available",
    })?;

    match target {
        InsertTarget::ExistingSlot(slot_id) => {
            let slots_offset = unsafe { format::slots_offset(base) };
            let slot_off = format::slot_offset(slots_offset, cache.slot_size, slot_id);
            let rev_off = slot_off + format::revision_offset_in_slot(cache.key_size);
            unsafe {
                format::set_slot_revision(base, rev_off, revision, Ordering::Release);
                format::set_slot_index(base, rev_off, index);
            }
        }
        InsertTarget::Bucket(bucket_id) => {
            let highwater = unsafe { format::slot_highwater(base) };
            let capacity = unsafe { format::slot_capacity(base) };
            if highwater >= capacity {
                return Err(Error::Corrupt {
                    reason: "slot capacity exhausted",
                });
            }
            let slot_id = highwater;
            let slots_offset = unsafe { format::slots_offset(base) };
            let slot_off = format::slot_offset(slots_offset, cache.slot_size, slot_id);
            let rev_off = slot_off + format::revision_offset_in_slot(cache.key_size);

            unsafe {
                format::set_slot_key(base, slot_off, key);
                format::set_slot_revision(base, rev_off, revision, Ordering::Relaxed);
                format::set_slot_index(base, rev_off, index);
                format::set_slot_meta(base, slot_off, format::META_USED, Ordering::Release);
            }

            let buckets_offset = unsafe { format::buckets_offset(base) };
            let bucket_off = format::bucket_offset(buckets_offset, bucket_id);
            let was_tombstone = unsafe { format::bucket_slot_plus_one(base, bucket_off) }
                == format::BUCKET_TOMBSTONE;
            unsafe {
                format::set_bucket_hash(base, bucket_off, hash);
                format::set_bucket_slot_plus_one(base, bucket_off, slot_id + 1);
            }

            unsafe {
                format::set_slot_highwater(base, slot_id + 1);
                let live = format::live_count(base);
                format::set_live_count(base, live + 1);
                let used = format::bucket_used(base);
                format::set_bucket_used(base, used + 1);
                if was_tombstone {
                    let tombstones = format::bucket_tombstones(base);
                    format::set_bucket_tombstones(base, tombstones - 1);
                }
            }
        }
    }
    Ok(())
}

fn apply_delete(cache: &Cache, base: *mut u8, key: &[u8]) {
    let Some(slot_id) = probe_bucket(cache, key) else {
        return;
    };
    let hash = format::fnv1a64(key);
    let bucket_count = unsafe { format::bucket_count(base) };
    let buckets_offset = unsafe { format::buckets_offset(base) };
    let slots_offset = unsafe { format::slots_offset(base) };
    let mut idx = hash % bucket_count;

    for _ in 0..bucket_count {
        let off = format::bucket_offset(buckets_offset, idx);
        let slot_plus_one = unsafe { format::bucket_slot_plus_one(base, off) };
        if slot_plus_one == format::BUCKET_EMPTY {
            return;
        }
        if slot_plus_one != format::BUCKET_TOMBSTONE && slot_plus_one - 1 == slot_id {
            unsafe {
                format::set_bucket_slot_plus_one(base, off, format::BUCKET_TOMBSTONE);
            }
            let slot_off = format::slot_offset(slots_offset, cache.slot_size, slot_id);
            unsafe {
                format::set_slot_meta(base, slot_off, 0, Ordering::Release);

                let live = format::live_count(base);
                format::set_live_count(base, live - 1);
                let used = format::bucket_used(base);
                format::set_bucket_used(base, used - 1);
                let tombstones = format::bucket_tombstones(base);
                format::set_bucket_tombstones(base, tombstones + 1);
            }
            return;
        }
        idx = (idx + 1) % bucket_count;
    }
    let _ = slots_offset;
}
