//! Property-based tests for the cache's quantified invariants.
//!
//! Mirrors the model-based style of `ferrisdb-storage`'s WAL property tests:
//! generate an arbitrary sequence of operations, apply it both to the cache
//! and to a plain in-memory model, then assert the two agree.

use proptest::prelude::*;
use slc::{Cache, CacheOptions, ScanOptions};
use std::collections::HashMap;
use tempfile::TempDir;

const KEY_SIZE: u32 = 4;
const INDEX_SIZE: u32 = 2;
const CAPACITY: u64 = 64;

fn scratch_path(dir: &TempDir, tag: &str) -> std::path::PathBuf {
    dir.path().join(tag)
}

#[derive(Debug, Clone)]
enum Op {
    Put { key: u8, revision: i64, index: [u8; 2] },
    Delete { key: u8 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<u8>(), any::<i64>(), any::<[u8; 2]>()).prop_map(|(key, revision, index)| {
            Op::Put { key, revision, index }
        }),
        any::<u8>().prop_map(|key| Op::Delete { key }),
    ]
}

fn key_bytes(key: u8) -> [u8; 4] {
    // Keep the domain small (one live byte) so capacity=64 is never exhausted
    // by the number of distinct keys a proptest run can generate.
    [0, 0, 0, key % (CAPACITY as u8 / 2)]
}

proptest! {
    /// An arbitrary sequence of put/delete operations, applied one at a time
    /// inside its own commit, agrees with a plain `HashMap` model: every key
    /// the model says is live is present with the model's last-written
    /// revision/index, `len()` matches the model's size, and `scan()`
    /// returns exactly the model's entries.
    #[test]
    fn put_delete_sequence_matches_model(ops in prop::collection::vec(op_strategy(), 0..40)) {
        let dir = TempDir::new().unwrap();
        let path = scratch_path(&dir, "model");
        let opts = CacheOptions::new(&path, KEY_SIZE, INDEX_SIZE, CAPACITY, 1)
            .with_disable_locking(true);
        let cache = Cache::create(opts).unwrap();
        let mut model: HashMap<[u8; 4], (i64, [u8; 2])> = HashMap::new();

        for op in &ops {
            let mut session = cache.begin_write().unwrap();
            match op {
                Op::Put { key, revision, index } => {
                    let k = key_bytes(*key);
                    session.put(&k, *revision, index).unwrap();
                    model.insert(k, (*revision, *index));
                }
                Op::Delete { key } => {
                    let k = key_bytes(*key);
                    session.delete(&k).unwrap();
                    model.remove(&k);
                }
            }
            session.commit().unwrap();
        }

        prop_assert_eq!(cache.len().unwrap() as usize, model.len());

        for (key, (revision, index)) in &model {
            let entry = cache.get(key).unwrap();
            prop_assert!(entry.is_some());
            let entry = entry.unwrap();
            prop_assert_eq!(entry.revision, *revision);
            prop_assert_eq!(entry.index.as_slice(), index.as_slice());
        }

        let scanned = cache.scan(&ScanOptions::new()).unwrap();
        prop_assert_eq!(scanned.len(), model.len());
        for entry in &scanned {
            let key: [u8; 4] = entry.key.as_slice().try_into().unwrap();
            let (revision, index) = model.get(&key).expect("scanned key missing from model");
            prop_assert_eq!(entry.revision, *revision);
            prop_assert_eq!(entry.index.as_slice(), index.as_slice());
        }
    }

    /// `generation()` increases by exactly 2 per successful commit and never
    /// decreases, regardless of what the commit's operations were.
    #[test]
    fn generation_advances_by_two_per_commit(op_count in 1usize..20) {
        let dir = TempDir::new().unwrap();
        let path = scratch_path(&dir, "generation");
        let opts = CacheOptions::new(&path, KEY_SIZE, INDEX_SIZE, CAPACITY, 1)
            .with_disable_locking(true);
        let cache = Cache::create(opts).unwrap();

        let mut previous = cache.generation().unwrap();
        for i in 0..op_count {
            let mut session = cache.begin_write().unwrap();
            session.put(&key_bytes(i as u8), i as i64, &[0, 0]).unwrap();
            session.commit().unwrap();
            let current = cache.generation().unwrap();
            prop_assert_eq!(current, previous + 2);
            previous = current;
        }
    }

    /// Offset beyond the available results returns empty; limit=0 returns
    /// every passing entry.
    #[test]
    fn scan_offset_and_limit_boundaries(count in 1usize..20) {
        let dir = TempDir::new().unwrap();
        let path = scratch_path(&dir, "bounds");
        let opts = CacheOptions::new(&path, KEY_SIZE, INDEX_SIZE, CAPACITY, 1)
            .with_disable_locking(true);
        let cache = Cache::create(opts).unwrap();
        let mut session = cache.begin_write().unwrap();
        for i in 0..count {
            session.put(&key_bytes(i as u8), i as i64, &[0, 0]).unwrap();
        }
        session.commit().unwrap();

        let beyond = cache
            .scan(&ScanOptions::new().with_offset(count + 10))
            .unwrap();
        prop_assert!(beyond.is_empty());

        let unlimited = cache.scan(&ScanOptions::new().with_limit(0)).unwrap();
        prop_assert_eq!(unlimited.len(), cache.len().unwrap() as usize);
    }
}
