//! Process-wide registry of open files, keyed by device/inode identity.
//!
//! Two handles opened against the same path (and therefore the same inode)
//! share a single `RegistryEntry`: its read/write lock serializes commits
//! against concurrent readers within this process, and its active-writer
//! flag enforces the single-writer-session rule. The registry itself lives
//! behind a lazily-initialized `OnceLock`, the same idiom
//! `lithos-perf-recorder` uses for its process-wide cached timebase, scaled
//! up from one cached value to a small table.

use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

pub(crate) type FileKey = (u64, u64);

pub(crate) struct RegistryEntry {
    /// Serializes writer commits against reader attempts within this process.
    pub(crate) lock: RwLock<()>,
    /// Set for the duration of a single in-process write session.
    pub(crate) writer_active: AtomicBool,
    refcount: Mutex<usize>,
}

impl RegistryEntry {
    fn new() -> Self {
        Self {
            lock: RwLock::new(()),
            writer_active: AtomicBool::new(false),
            refcount: Mutex::new(0),
        }
    }
}

static REGISTRY: OnceLock<Mutex<HashMap<FileKey, Arc<RegistryEntry>>>> = OnceLock::new();

fn table() -> &'static Mutex<HashMap<FileKey, Arc<RegistryEntry>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Identity used to key the registry: (device, inode).
pub(crate) fn file_identity(file: &std::fs::File) -> std::io::Result<FileKey> {
    let meta = file.metadata()?;
    Ok((meta.dev(), meta.ino()))
}

/// Look up or create the entry for `key`, bumping its refcount.
pub(crate) fn acquire(key: FileKey) -> Arc<RegistryEntry> {
    let mut table = table().lock().expect("registry mutex poisoned");
    let entry = table
        .entry(key)
        .or_insert_with(|| Arc::new(RegistryEntry::new()));
    *entry.refcount.lock().expect("refcount mutex poisoned") += 1;
    entry.clone()
}

/// Drop a reference to `entry`, pruning the table entry once the last
/// handle for this file identity has released it.
pub(crate) fn release(key: FileKey, entry: &Arc<RegistryEntry>) {
    let mut table = table().lock().expect("registry mutex poisoned");
    let remaining = {
        let mut count = entry.refcount.lock().expect("refcount mutex poisoned");
        *count -= 1;
        *count
    };
    if remaining == 0 {
        if let Some(current) = table.get(&key) {
            if Arc::ptr_eq(current, entry) {
                table.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_key_returns_same_entry() {
        let key = (1u64, 2u64);
        let a = acquire(key);
        let b = acquire(key);
        assert!(Arc::ptr_eq(&a, &b));
        release(key, &a);
        release(key, &b);
    }

    #[test]
    fn entry_pruned_after_last_release() {
        let key = (3u64, 4u64);
        let a = acquire(key);
        release(key, &a);
        let b = acquire(key);
        assert!(!Arc::ptr_eq(&a, &b));
        release(key, &b);
    }
}
