//! `slc`: an embedded, single-file key-value cache shared between processes
//! over a memory-mapped region.
//!
//! Coherence between one writer and many concurrent readers is provided by a
//! sequence lock over the whole mapping rather than per-key locking: readers
//! never block, and a writer never blocks a reader, at the cost of readers
//! occasionally retrying when their read overlapped a commit.
//!
//! # Core Components
//!
//! - [`Cache`]: an open handle to a cache file; create, open, read, and begin
//!   write sessions through it
//! - [`CacheOptions`]: layout and behavior configuration for [`Cache::open`]
//!   and [`Cache::create`]
//! - [`WriteSession`]: a buffered set of mutations, published atomically by
//!   [`WriteSession::commit`]
//! - [`Entry`]: a decoded key/revision/index record returned from lookups
//!   and scans
//!
//! # Example
//!
//! ```ignore
//! use slc::{Cache, CacheOptions};
//!
//! let opts = CacheOptions::new("/tmp/prices.slc", 8, 16, 1_000_000, 1);
//! let cache = Cache::create(opts)?;
//!
//! let mut session = cache.begin_write()?;
//! session.put(b"AAPL\0\0\0\0", 1, &[0u8; 16])?;
//! session.commit()?;
//!
//! let entry = cache.get(b"AAPL\0\0\0\0")?;
//! ```
//!
//! # Internal Modules
//!
//! - `format`: on-disk header/slot/bucket layout, field offsets, hashing
//! - `seqlock`: the generation-counter retry protocol readers run under
//! - `registry`: process-wide file-identity table backing in-process locking
//! - `mapping`: `Cache` open/create/validate/close
//! - `reader`: lookup and scan operations
//! - `writer`: buffered write sessions and the commit/invalidate protocol

mod error;
mod format;
mod mapping;
mod reader;
mod registry;
mod seqlock;
mod writer;

pub use error::{Error, Result};
pub use mapping::{Cache, CacheOptions, Writeback};
pub use reader::{MatchSpec, ScanOptions};
pub use writer::WriteSession;

/// A decoded record: the key the caller looked up, its monotonic revision,
/// and its opaque index payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub revision: i64,
    pub index: Vec<u8>,
}
