//! Lookup, length/generation introspection, and scan operations.

use crate::error::{Error, Result};
use crate::format;
use crate::mapping::Cache;
use crate::seqlock::{self, ReadOutcome};
use crate::Entry;

/// Options shared by every scan entry point.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub reverse: bool,
    pub offset: usize,
    pub limit: usize,
    pub predicate: Option<fn(&[u8], i64, &[u8]) -> bool>,
}

impl ScanOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_predicate(mut self, predicate: fn(&[u8], i64, &[u8]) -> bool) -> Self {
        self.predicate = Some(predicate);
        self
    }

    fn check_bounds(&self) -> Result<()> {
        if self.offset > format::MAX_SCAN_BOUND || self.limit > format::MAX_SCAN_BOUND {
            return Err(Error::invalid("scan offset/limit exceeds implementation limit"));
        }
        Ok(())
    }
}

/// A bit-level key prefix match specification for `scan_match`.
#[derive(Debug, Clone)]
pub struct MatchSpec {
    pub offset: usize,
    pub bits: usize,
    pub bytes: Vec<u8>,
}

impl Cache {
    /// Number of live entries.
    pub fn len(&self) -> Result<u64> {
        self.ensure_open()?;
        let base = self.base();
        seqlock::read_with_retry(base, |_g| {
            let live = unsafe { format::live_count(base) };
            let highwater = unsafe { format::slot_highwater(base) };
            if live > highwater {
                ReadOutcome::SuspectedCorruption("live_count exceeds slot_highwater")
            } else {
                ReadOutcome::Done(live)
            }
        })
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Current stable generation. Cheap, useful for change detection.
    pub fn generation(&self) -> Result<u64> {
        self.ensure_open()?;
        let base = self.base();
        seqlock::read_with_retry(base, |g| ReadOutcome::Done(g))
    }

    /// Snapshot of the user-owned flags word and opaque data region.
    pub fn user_header(&self) -> Result<(u64, [u8; 64])> {
        self.ensure_open()?;
        let base = self.base();
        seqlock::read_with_retry(base, |_g| {
            let flags = unsafe { format::user_flags(base) };
            let data = unsafe { format::user_data(base) };
            ReadOutcome::Done((flags, data))
        })
    }

    /// Point lookup by exact key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        self.ensure_open()?;
        if key.len() != self.key_size as usize {
            return Err(Error::invalid("key length does not match key_size"));
        }
        let base = self.base();
        let hash = format::fnv1a64(key);

        seqlock::read_with_retry(base, |_g| {
            let bucket_count = unsafe { format::bucket_count(base) };
            let buckets_offset = unsafe { format::buckets_offset(base) };
            let slots_offset = unsafe { format::slots_offset(base) };
            let highwater = unsafe { format::slot_highwater(base) };
            let mut idx = hash % bucket_count;

            for _ in 0..bucket_count {
                let off = format::bucket_offset(buckets_offset, idx);
                let slot_plus_one = unsafe { format::bucket_slot_plus_one(base, off) };
                if slot_plus_one == format::BUCKET_EMPTY {
                    return ReadOutcome::Done(None);
                }
                if slot_plus_one != format::BUCKET_TOMBSTONE {
                    let slot_id = slot_plus_one - 1;
                    if slot_id >= highwater {
                        return ReadOutcome::SuspectedCorruption(
                            "bucket references a slot past highwater",
                        );
                    }
                    let stored_hash = unsafe { format::bucket_hash(base, off) };
                    if stored_hash == hash {
                        let slot_off =
                            format::slot_offset(slots_offset, self.slot_size, slot_id);
                        let slot_key = unsafe {
                            format::slot_key(base, slot_off, self.key_size as usize)
                        };
                        if slot_key == key {
                            let meta = unsafe { format::slot_meta(base, slot_off) };
                            if meta & format::META_RESERVED_MASK != 0 {
                                return ReadOutcome::SuspectedCorruption(
                                    "reserved slot meta bits are set",
                                );
                            }
                            if meta & format::META_USED == 0 {
                                return ReadOutcome::SuspectedCorruption(
                                    "bucket references a non-live slot",
                                );
                            }
                            let rev_off =
                                slot_off + format::revision_offset_in_slot(self.key_size);
                            let revision = unsafe { format::slot_revision(base, rev_off) };
                            let index = unsafe {
                                format::slot_index(base, rev_off, self.index_size as usize)
                            };
                            return ReadOutcome::Done(Some(Entry {
                                key: key.to_vec(),
                                revision,
                                index: index.to_vec(),
                            }));
                        }
                    }
                }
                idx = (idx + 1) % bucket_count;
            }
            ReadOutcome::SuspectedCorruption("bucket table fully probed without an empty slot")
        })
    }

    /// Iterate all live entries, applying offset/limit/predicate/order.
    pub fn scan(&self, options: &ScanOptions) -> Result<Vec<Entry>> {
        self.ensure_open()?;
        options.check_bounds()?;
        let base = self.base();

        seqlock::read_with_retry(base, |_g| self.scan_once(base, options, None, None))
    }

    /// Scan entries whose key starts with `prefix`.
    pub fn scan_prefix(&self, prefix: &[u8], options: &ScanOptions) -> Result<Vec<Entry>> {
        self.scan_match(
            &MatchSpec {
                offset: 0,
                bits: 0,
                bytes: prefix.to_vec(),
            },
            options,
        )
    }

    /// Scan entries matching a byte/bit-level key window.
    pub fn scan_match(&self, spec: &MatchSpec, options: &ScanOptions) -> Result<Vec<Entry>> {
        self.ensure_open()?;
        options.check_bounds()?;
        let total_bits = spec.bits.max(spec.bytes.len() * 8);
        if spec.offset * 8 + total_bits > self.key_size as usize * 8 {
            return Err(Error::invalid("match spec exceeds key capacity"));
        }
        if spec.bits > 0 && spec.bytes.len() < spec.bits.div_ceil(8) {
            return Err(Error::invalid("match spec bytes shorter than bits requires"));
        }

        if self.ordered_keys && spec.offset == 0 {
            if let Some((start, end)) = prefix_range_bounds(spec, self.key_size as usize) {
                return self.scan_range_inner(Some(&start), end.as_deref(), options);
            }
        }

        let base = self.base();
        seqlock::read_with_retry(base, |_g| self.scan_once(base, options, None, Some(spec)))
    }

    /// Half-open range scan `[start, end)`. Requires ordered-keys mode.
    pub fn scan_range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        options: &ScanOptions,
    ) -> Result<Vec<Entry>> {
        self.ensure_open()?;
        if !self.ordered_keys {
            return Err(Error::Unordered);
        }
        options.check_bounds()?;
        for bound in [start, end].into_iter().flatten() {
            if bound.is_empty() {
                return Err(Error::invalid("range bound must be nil or non-empty"));
            }
            if bound.len() > self.key_size as usize {
                return Err(Error::invalid("range bound longer than key_size"));
            }
        }
        self.scan_range_inner(start, end, options)
    }

    fn scan_range_inner(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        options: &ScanOptions,
    ) -> Result<Vec<Entry>> {
        let base = self.base();
        let padded_start = start.map(|s| pad_key(s, self.key_size as usize));
        let padded_end = end.map(|e| pad_key(e, self.key_size as usize));
        seqlock::read_with_retry(base, |_g| {
            self.scan_once(
                base,
                options,
                Some((padded_start.as_deref(), padded_end.as_deref())),
                None,
            )
        })
    }

    fn scan_once(
        &self,
        base: *const u8,
        options: &ScanOptions,
        range: Option<(Option<&[u8]>, Option<&[u8]>)>,
        match_spec: Option<&MatchSpec>,
    ) -> ReadOutcome<Vec<Entry>> {
        let highwater = unsafe { format::slot_highwater(base) };
        let slots_offset = unsafe { format::slots_offset(base) };

        let (lo, hi) = match range {
            Some((start, end)) => self.locate_range_bounds(base, highwater, start, end),
            None => (0, highwater),
        };

        let mut results = Vec::new();
        let mut skipped = 0usize;
        let mut prev_key: Option<Vec<u8>> = None;

        let indices: Box<dyn Iterator<Item = u64>> = if options.reverse {
            Box::new((lo..hi).rev())
        } else {
            Box::new(lo..hi)
        };

        for slot_id in indices {
            let slot_off = format::slot_offset(slots_offset, self.slot_size, slot_id);
            let meta = unsafe { format::slot_meta(base, slot_off) };
            if meta & format::META_RESERVED_MASK != 0 {
                return ReadOutcome::SuspectedCorruption("reserved slot meta bits are set");
            }
            let key = unsafe { format::slot_key(base, slot_off, self.key_size as usize) };

            if self.ordered_keys {
                if let Some(prev) = &prev_key {
                    let ordered_ok = if options.reverse {
                        prev.as_slice() >= key
                    } else {
                        prev.as_slice() <= key
                    };
                    if !ordered_ok {
                        return ReadOutcome::SuspectedCorruption("key order invariant violated");
                    }
                }
                prev_key = Some(key.to_vec());
            }

            if meta & format::META_USED == 0 {
                continue;
            }

            if let Some(spec) = match_spec {
                if !key_matches(key, spec) {
                    continue;
                }
            }

            if let Some((start, end)) = range {
                if let Some(start) = start {
                    if key < start {
                        continue;
                    }
                }
                if let Some(end) = end {
                    if key >= end {
                        continue;
                    }
                }
            }

            let rev_off = slot_off + format::revision_offset_in_slot(self.key_size);
            let revision = unsafe { format::slot_revision(base, rev_off) };
            let index = unsafe { format::slot_index(base, rev_off, self.index_size as usize) };

            if let Some(predicate) = options.predicate {
                if !predicate(key, revision, index) {
                    continue;
                }
            }

            if skipped < options.offset {
                skipped += 1;
                continue;
            }

            results.push(Entry {
                key: key.to_vec(),
                revision,
                index: index.to_vec(),
            });

            if options.limit != 0 && results.len() >= options.limit {
                break;
            }
        }

        ReadOutcome::Done(results)
    }

    /// Binary-search the slot range `[lo, hi)` covering `[start, end)` in an
    /// ordered-keys cache. Returns the index bounds to scan sequentially.
    fn locate_range_bounds(
        &self,
        base: *const u8,
        highwater: u64,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> (u64, u64) {
        let slots_offset = unsafe { format::slots_offset(base) };
        let key_at = |slot_id: u64| -> &[u8] {
            let slot_off = format::slot_offset(slots_offset, self.slot_size, slot_id);
            unsafe { format::slot_key(base, slot_off, self.key_size as usize) }
        };

        let lo = match start {
            None => 0,
            Some(start) => {
                let mut lo = 0u64;
                let mut hi = highwater;
                while lo < hi {
                    let mid = lo + (hi - lo) / 2;
                    if key_at(mid) < start {
                        lo = mid + 1;
                    } else {
                        hi = mid;
                    }
                }
                lo
            }
        };

        let hi = match end {
            None => highwater,
            Some(end) => {
                let mut lo = 0u64;
                let mut hi = highwater;
                while lo < hi {
                    let mid = lo + (hi - lo) / 2;
                    if key_at(mid) < end {
                        lo = mid + 1;
                    } else {
                        hi = mid;
                    }
                }
                lo
            }
        };

        (lo.min(highwater), hi.max(lo).min(highwater))
    }
}

fn pad_key(key: &[u8], key_size: usize) -> Vec<u8> {
    let mut v = key.to_vec();
    v.resize(key_size, 0);
    v
}

fn key_matches(key: &[u8], spec: &MatchSpec) -> bool {
    let window_len = spec.bytes.len();
    if spec.offset + window_len > key.len() {
        return false;
    }
    let window = &key[spec.offset..spec.offset + window_len];
    if spec.bits == 0 {
        return window == spec.bytes.as_slice();
    }
    let full_bytes = spec.bits / 8;
    let remaining_bits = spec.bits % 8;
    if window[..full_bytes] != spec.bytes[..full_bytes] {
        return false;
    }
    if remaining_bits == 0 {
        return true;
    }
    let mask = 0xFFu8 << (8 - remaining_bits);
    (window[full_bytes] & mask) == (spec.bytes[full_bytes] & mask)
}

/// Compute `[padded_prefix, successor)` for a byte/bit prefix, for the
/// ordered-keys fast path in `scan_match`. `None` end means unbounded.
fn prefix_range_bounds(spec: &MatchSpec, key_size: usize) -> Option<(Vec<u8>, Option<Vec<u8>>)> {
    if spec.offset != 0 {
        return None;
    }
    let mut start = spec.bytes.clone();
    start.resize(key_size, 0);

    let mut end = spec.bytes.clone();
    if spec.bits == 0 {
        if !increment_bytes(&mut end) {
            return Some((start, None));
        }
    } else {
        let full_bytes = spec.bits / 8;
        let remaining_bits = spec.bits % 8;
        end.truncate(if remaining_bits == 0 { full_bytes } else { full_bytes + 1 });
        let increment = if remaining_bits == 0 {
            1u16
        } else {
            1u16 << (8 - remaining_bits)
        };
        if !increment_from(&mut end, increment) {
            return Some((start, None));
        }
    }
    end.resize(key_size, 0);
    Some((start, Some(end)))
}

fn increment_bytes(bytes: &mut [u8]) -> bool {
    increment_from(bytes, 1)
}

fn increment_from(bytes: &mut [u8], amount: u16) -> bool {
    let mut carry = amount;
    for byte in bytes.iter_mut().rev() {
        let sum = *byte as u16 + carry;
        *byte = (sum & 0xFF) as u8;
        carry = sum >> 8;
        if carry == 0 {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_spec_exact_bytes() {
        let spec = MatchSpec {
            offset: 0,
            bits: 0,
            bytes: vec![0xAA],
        };
        assert!(key_matches(&[0xAA, 0x01], &spec));
        assert!(!key_matches(&[0xAB, 0x01], &spec));
    }

    #[test]
    fn match_spec_bit_level_mask() {
        let spec = MatchSpec {
            offset: 0,
            bits: 4,
            bytes: vec![0xF0],
        };
        assert!(key_matches(&[0xF5], &spec));
        assert!(!key_matches(&[0x05], &spec));
    }

    #[test]
    fn prefix_successor_carries() {
        let spec = MatchSpec {
            offset: 0,
            bits: 0,
            bytes: vec![0xFF],
        };
        let (start, end) = prefix_range_bounds(&spec, 2).unwrap();
        assert_eq!(start, vec![0xFF, 0x00]);
        assert_eq!(end, None);
    }

    #[test]
    fn prefix_successor_normal_case() {
        let spec = MatchSpec {
            offset: 0,
            bits: 0,
            bytes: vec![0xAA],
        };
        let (start, end) = prefix_range_bounds(&spec, 2).unwrap();
        assert_eq!(start, vec![0xAA, 0x00]);
        assert_eq!(end, Some(vec![0xAB, 0x00]));
    }
}
