//! Same-process concurrent reader/writer test.
//!
//! Grounded in `lithos-icc`'s concurrent broadcast reader/writer test and the
//! two-process `e2e_mmap.rs` pattern, adapted to threads: this format's
//! readers and a writer session can coexist within one process, and a
//! second independent `Cache` handle opened against the same path already
//! exercises the registry-sharing and seqlock-across-handle behavior a
//! genuinely separate process would add.

use slc::{Cache, CacheOptions, Error};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

#[test]
fn concurrent_reader_never_observes_corruption() {
    let _ = tracing_subscriber::fmt::try_init();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("reader_writer");
    let opts = CacheOptions::new(&path, 8, 0, 16, 1).with_disable_locking(true);

    let writer_cache = Cache::create(opts.clone()).unwrap();
    {
        let mut session = writer_cache.begin_write().unwrap();
        session.put(b"revcount", 0, &[]).unwrap();
        session.commit().unwrap();
    }

    let reader_cache = Cache::open(opts).unwrap();
    let stop = Arc::new(AtomicBool::new(false));

    let writer_stop = stop.clone();
    let writer = std::thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_millis(200);
        let mut rev = 0i64;
        while Instant::now() < deadline {
            rev += 1;
            let mut session = writer_cache.begin_write().unwrap();
            session.put(b"revcount", rev, &[]).unwrap();
            session.commit().unwrap();
        }
        writer_stop.store(true, Ordering::Release);
        rev
    });

    let reader_stop = stop.clone();
    let reader = std::thread::spawn(move || {
        let mut observed_max = -1i64;
        while !reader_stop.load(Ordering::Acquire) {
            match reader_cache.get(b"revcount") {
                Ok(Some(entry)) => {
                    assert!(entry.revision >= 0);
                    if entry.revision > observed_max {
                        observed_max = entry.revision;
                    }
                }
                Ok(None) => panic!("key unexpectedly absent"),
                Err(Error::Busy) => {}
                Err(other) => panic!("reader saw unexpected error: {other:?}"),
            }
        }
        observed_max
    });

    let final_rev = writer.join().unwrap();
    let observed_max = reader.join().unwrap();

    assert!(observed_max >= 0);
    assert!(observed_max <= final_rev);
}
