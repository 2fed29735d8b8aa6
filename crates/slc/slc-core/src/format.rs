//! On-disk layout: header and slot/bucket record shape, field offsets,
//! size arithmetic, key hashing, and the header checksum.
//!
//! Every accessor here operates on raw pointers into a live mapping rather
//! than through a `&[u8]`, since the memory may be concurrently mutated by
//! another process holding the write lock; only the functions explicitly
//! marked atomic give any ordering guarantee, matching the discipline a
//! seqlock requires (generation, slot `meta`, and slot `revision` are
//! atomic; everything else is written once per commit under the odd/even
//! bracket and read back the same way `SeqlockSlot::read` treats its `T`).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub const MAGIC: [u8; 4] = *b"SLC1";
pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 256;
pub const HASH_ALGORITHM_FNV1A64: u32 = 1;

pub const FLAG_ORDERED_KEYS: u32 = 1 << 0;

pub const STATE_NORMAL: u32 = 0;
pub const STATE_INVALIDATED: u32 = 1;

pub const META_USED: u64 = 1 << 0;
pub const META_RESERVED_MASK: u64 = !META_USED;

pub const BUCKET_EMPTY: u64 = 0;
pub const BUCKET_TOMBSTONE: u64 = u64::MAX;
pub const BUCKET_RECORD_SIZE: usize = 16;

pub const MAX_KEY_SIZE: u32 = 512;
pub const MAX_INDEX_SIZE: u32 = 1 << 20;
pub const MAX_SLOT_SIZE: usize = 2 * 1024 * 1024;
pub const MAX_SLOT_CAPACITY: u64 = 100_000_000;
pub const MAX_FILE_SIZE: u64 = 1u64 << 40;
pub const MAX_SCAN_BOUND: usize = 100_000_000;
pub const MAX_STAGED_OPS: usize = 1_000_000;
pub const BUCKET_SAMPLE_COUNT: u64 = 8;

pub mod off {
    pub const MAGIC: usize = 0x000;
    pub const VERSION: usize = 0x004;
    pub const HEADER_SIZE: usize = 0x008;
    pub const KEY_SIZE: usize = 0x00C;
    pub const INDEX_SIZE: usize = 0x010;
    pub const SLOT_SIZE: usize = 0x014;
    pub const HASH_ALGORITHM: usize = 0x018;
    pub const FLAGS: usize = 0x01C;
    pub const SLOT_CAPACITY: usize = 0x020;
    pub const SLOT_HIGHWATER: usize = 0x028;
    pub const LIVE_COUNT: usize = 0x030;
    pub const USER_VERSION: usize = 0x038;
    pub const GENERATION: usize = 0x040;
    pub const BUCKET_COUNT: usize = 0x048;
    pub const BUCKET_USED: usize = 0x050;
    pub const BUCKET_TOMBSTONES: usize = 0x058;
    pub const SLOTS_OFFSET: usize = 0x060;
    pub const BUCKETS_OFFSET: usize = 0x068;
    pub const CRC: usize = 0x070;
    pub const STATE: usize = 0x074;
    pub const USER_FLAGS: usize = 0x078;
    pub const USER_DATA: usize = 0x080;
    pub const USER_DATA_LEN: usize = 64;
    pub const RESERVED: usize = 0x0C0;
    pub const RESERVED_LEN: usize = 64;
}

#[inline]
pub const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Total bytes occupied by one slot record for the given key/index sizes.
pub const fn compute_slot_size(key_size: u32, index_size: u32) -> usize {
    let before_revision = align8(8 + key_size as usize);
    let total = before_revision + 8 + index_size as usize;
    align8(total)
}

/// Byte offset of the revision field within a slot, given the key size.
pub const fn revision_offset_in_slot(key_size: u32) -> usize {
    align8(8 + key_size as usize)
}

/// Smallest power-of-two bucket count keeping the load factor at or below
/// one half, guaranteeing at least one `EMPTY` bucket always exists.
pub fn compute_bucket_count(slot_capacity: u64) -> u64 {
    slot_capacity.saturating_mul(2).max(2).next_power_of_two()
}

/// FNV-1a over 64 bits with the algorithm's standard offset basis and prime.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xCBF29CE484222325;
    const PRIME: u64 = 0x0000_0100_0000_01B3;
    let mut hash = OFFSET_BASIS;
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// CRC32-C (Castagnoli) over a 256-byte header snapshot with the generation
/// and CRC fields themselves zeroed.
pub fn compute_header_crc(header: &[u8; HEADER_SIZE]) -> u32 {
    let mut scratch = *header;
    scratch[off::GENERATION..off::GENERATION + 8].fill(0);
    scratch[off::CRC..off::CRC + 4].fill(0);
    crc32c::crc32c(&scratch)
}

// --- raw pointer accessors -------------------------------------------------
//
// SAFETY (all functions below): callers must ensure `base` points at a live
// mapping at least `offset + size_of::<T>()` bytes long and that the
// pointer's provenance covers the whole mapping.

#[inline]
unsafe fn read_u32(base: *const u8, offset: usize) -> u32 {
    unsafe { (base.add(offset) as *const u32).read_unaligned() }
}

#[inline]
unsafe fn write_u32(base: *mut u8, offset: usize, value: u32) {
    unsafe { (base.add(offset) as *mut u32).write_unaligned(value) }
}

#[inline]
unsafe fn read_u64(base: *const u8, offset: usize) -> u64 {
    unsafe { (base.add(offset) as *const u64).read_unaligned() }
}

#[inline]
unsafe fn write_u64(base: *mut u8, offset: usize, value: u64) {
    unsafe { (base.add(offset) as *mut u64).write_unaligned(value) }
}

#[inline]
unsafe fn atomic_u64(base: *const u8, offset: usize) -> &'static AtomicU64 {
    unsafe { &*(base.add(offset) as *const AtomicU64) }
}

#[inline]
unsafe fn atomic_u32(base: *const u8, offset: usize) -> &'static AtomicU32 {
    unsafe { &*(base.add(offset) as *const AtomicU32) }
}

/// Generation counter: even = stable, odd = commit in progress. The only
/// field every reader and writer synchronizes through.
#[inline]
pub unsafe fn generation(base: *const u8) -> u64 {
    unsafe { atomic_u64(base, off::GENERATION).load(Ordering::Acquire) }
}

#[inline]
pub unsafe fn set_generation(base: *mut u8, value: u64, order: Ordering) {
    unsafe { atomic_u64(base as *const u8, off::GENERATION).store(value, order) }
}

#[inline]
pub unsafe fn state(base: *const u8) -> u32 {
    unsafe { atomic_u32(base, off::STATE).load(Ordering::Acquire) }
}

#[inline]
pub unsafe fn set_state(base: *mut u8, value: u32) {
    unsafe { write_u32(base, off::STATE, value) }
}

macro_rules! plain_u32_field {
    ($get:ident, $set:ident, $off:path) => {
        #[inline]
        pub unsafe fn $get(base: *const u8) -> u32 {
            unsafe { read_u32(base, $off) }
        }
        #[inline]
        pub unsafe fn $set(base: *mut u8, value: u32) {
            unsafe { write_u32(base, $off, value) }
        }
    };
}

macro_rules! plain_u64_field {
    ($get:ident, $set:ident, $off:path) => {
        #[inline]
        pub unsafe fn $get(base: *const u8) -> u64 {
            unsafe { read_u64(base, $off) }
        }
        #[inline]
        pub unsafe fn $set(base: *mut u8, value: u64) {
            unsafe { write_u64(base, $off, value) }
        }
    };
}

plain_u32_field!(key_size, set_key_size, off::KEY_SIZE);
plain_u32_field!(index_size, set_index_size, off::INDEX_SIZE);
plain_u32_field!(slot_size_field, set_slot_size_field, off::SLOT_SIZE);
plain_u32_field!(hash_algorithm, set_hash_algorithm, off::HASH_ALGORITHM);
plain_u32_field!(flags, set_flags, off::FLAGS);
plain_u32_field!(crc, set_crc, off::CRC);

plain_u64_field!(slot_capacity, set_slot_capacity, off::SLOT_CAPACITY);
plain_u64_field!(slot_highwater, set_slot_highwater, off::SLOT_HIGHWATER);
plain_u64_field!(live_count, set_live_count, off::LIVE_COUNT);
plain_u64_field!(user_version, set_user_version, off::USER_VERSION);
plain_u64_field!(bucket_count, set_bucket_count, off::BUCKET_COUNT);
plain_u64_field!(bucket_used, set_bucket_used, off::BUCKET_USED);
plain_u64_field!(
    bucket_tombstones,
    set_bucket_tombstones,
    off::BUCKET_TOMBSTONES
);
plain_u64_field!(slots_offset, set_slots_offset, off::SLOTS_OFFSET);
plain_u64_field!(buckets_offset, set_buckets_offset, off::BUCKETS_OFFSET);
plain_u64_field!(user_flags, set_user_flags, off::USER_FLAGS);

#[inline]
pub unsafe fn magic(base: *const u8) -> [u8; 4] {
    let mut out = [0u8; 4];
    unsafe { std::ptr::copy_nonoverlapping(base, out.as_mut_ptr(), 4) };
    out
}

#[inline]
pub unsafe fn version(base: *const u8) -> u32 {
    unsafe { read_u32(base, off::VERSION) }
}

#[inline]
pub unsafe fn header_size_field(base: *const u8) -> u32 {
    unsafe { read_u32(base, off::HEADER_SIZE) }
}

#[inline]
pub unsafe fn reserved_is_zero(base: *const u8) -> bool {
    let slice = unsafe { std::slice::from_raw_parts(base.add(off::RESERVED), off::RESERVED_LEN) };
    slice.iter().all(|&b| b == 0)
}

#[inline]
pub unsafe fn user_data(base: *const u8) -> [u8; off::USER_DATA_LEN] {
    let mut out = [0u8; off::USER_DATA_LEN];
    unsafe { std::ptr::copy_nonoverlapping(base.add(off::USER_DATA), out.as_mut_ptr(), out.len()) };
    out
}

#[inline]
pub unsafe fn set_user_data(base: *mut u8, data: &[u8]) {
    debug_assert!(data.len() <= off::USER_DATA_LEN);
    unsafe {
        std::ptr::write_bytes(base.add(off::USER_DATA), 0, off::USER_DATA_LEN);
        std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(off::USER_DATA), data.len());
    }
}

/// Snapshot the whole 256-byte header out of a live mapping into an owned
/// buffer so validation logic can run against a single consistent copy.
pub unsafe fn snapshot_header(base: *const u8) -> [u8; HEADER_SIZE] {
    let mut out = [0u8; HEADER_SIZE];
    unsafe { std::ptr::copy_nonoverlapping(base, out.as_mut_ptr(), HEADER_SIZE) };
    out
}

// --- slot record accessors --------------------------------------------------

#[inline]
pub fn slot_offset(slots_offset: u64, slot_size: usize, slot_id: u64) -> usize {
    slots_offset as usize + slot_id as usize * slot_size
}

#[inline]
pub unsafe fn slot_meta(base: *const u8, slot_off: usize) -> u64 {
    unsafe { atomic_u64(base, slot_off).load(Ordering::Acquire) }
}

#[inline]
pub unsafe fn set_slot_meta(base: *mut u8, slot_off: usize, value: u64, order: Ordering) {
    unsafe { atomic_u64(base as *const u8, slot_off).store(value, order) }
}

#[inline]
pub unsafe fn slot_key<'a>(base: *const u8, slot_off: usize, key_size: usize) -> &'a [u8] {
    unsafe { std::slice::from_raw_parts(base.add(slot_off + 8), key_size) }
}

#[inline]
pub unsafe fn set_slot_key(base: *mut u8, slot_off: usize, key: &[u8]) {
    unsafe { std::ptr::copy_nonoverlapping(key.as_ptr(), base.add(slot_off + 8), key.len()) }
}

#[inline]
pub unsafe fn slot_revision(base: *const u8, rev_off: usize) -> i64 {
    unsafe { atomic_u64(base, rev_off).load(Ordering::Acquire) as i64 }
}

#[inline]
pub unsafe fn set_slot_revision(base: *mut u8, rev_off: usize, value: i64, order: Ordering) {
    unsafe { atomic_u64(base as *const u8, rev_off).store(value as u64, order) }
}

#[inline]
pub unsafe fn slot_index<'a>(base: *const u8, rev_off: usize, index_size: usize) -> &'a [u8] {
    unsafe { std::slice::from_raw_parts(base.add(rev_off + 8), index_size) }
}

#[inline]
pub unsafe fn set_slot_index(base: *mut u8, rev_off: usize, index: &[u8]) {
    unsafe { std::ptr::copy_nonoverlapping(index.as_ptr(), base.add(rev_off + 8), index.len()) }
}

// --- bucket record accessors -------------------------------------------------

#[inline]
pub fn bucket_offset(buckets_offset: u64, bucket_id: u64) -> usize {
    buckets_offset as usize + bucket_id as usize * BUCKET_RECORD_SIZE
}

#[inline]
pub unsafe fn bucket_hash(base: *const u8, bucket_off: usize) -> u64 {
    unsafe { atomic_u64(base, bucket_off).load(Ordering::Acquire) }
}

#[inline]
pub unsafe fn set_bucket_hash(base: *mut u8, bucket_off: usize, value: u64) {
    unsafe { atomic_u64(base as *const u8, bucket_off).store(value, Ordering::Relaxed) }
}

#[inline]
pub unsafe fn bucket_slot_plus_one(base: *const u8, bucket_off: usize) -> u64 {
    unsafe { atomic_u64(base, bucket_off + 8).load(Ordering::Acquire) }
}

#[inline]
pub unsafe fn set_bucket_slot_plus_one(base: *mut u8, bucket_off: usize, value: u64) {
    unsafe { atomic_u64(base as *const u8, bucket_off + 8).store(value, Ordering::Relaxed) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_size_is_eight_byte_aligned() {
        for key_size in [1u32, 7, 8, 9, 511, 512] {
            for index_size in [0u32, 3, 4, 1023] {
                let size = compute_slot_size(key_size, index_size);
                assert_eq!(size % 8, 0);
                assert!(size >= 16 + key_size as usize + index_size as usize);
            }
        }
    }

    #[test]
    fn bucket_count_is_power_of_two_and_exceeds_capacity() {
        for capacity in [1u64, 2, 3, 1000, 1_000_001] {
            let buckets = compute_bucket_count(capacity);
            assert!(buckets.is_power_of_two());
            assert!(buckets > capacity);
        }
    }

    #[test]
    fn fnv1a_matches_known_vector() {
        // FNV-1a-64 of the empty string is the offset basis itself.
        assert_eq!(fnv1a64(b""), 0xCBF29CE484222325);
    }

    #[test]
    fn header_crc_ignores_generation_and_crc_bytes() {
        let mut header = [0u8; HEADER_SIZE];
        header[off::MAGIC..off::MAGIC + 4].copy_from_slice(&MAGIC);
        let crc_a = compute_header_crc(&header);
        header[off::GENERATION..off::GENERATION + 8].copy_from_slice(&42u64.to_le_bytes());
        let crc_b = compute_header_crc(&header);
        assert_eq!(crc_a, crc_b);
    }
}
