//! Generation-counter coherence protocol shared by every reader operation.
//!
//! Even generation = stable, odd = a writer is mid-commit. Readers bracket
//! their work between two generation loads and retry on mismatch, the same
//! odd/even discipline `SeqlockSlot::read`/`write` use for a single value,
//! generalized here to cover an entire mapped region instead of one `Copy`
//! payload.

use std::time::Duration;

use crate::error::Error;
use crate::format;

const MAX_RETRIES: u32 = 10;
const INITIAL_BACKOFF: Duration = Duration::from_micros(50);
const MAX_BACKOFF: Duration = Duration::from_millis(1);

#[inline]
pub(crate) fn load_generation(base: *const u8) -> u64 {
    unsafe { format::generation(base) }
}

#[inline]
pub(crate) fn is_committing(generation: u64) -> bool {
    generation & 1 == 1
}

/// Outcome a reader's body reports back to the retry driver.
pub(crate) enum ReadOutcome<T> {
    /// The read completed; still needs confirmation against the generation
    /// observed after the read.
    Done(T),
    /// The body observed an invariant that is only legal mid-commit; the
    /// driver must distinguish overlap from real corruption.
    SuspectedCorruption(&'static str),
}

/// Runs `body` under the seqlock read protocol, retrying on overlap with a
/// concurrent commit and returning `Busy` once the retry budget is spent.
///
/// `body` is handed the generation value the attempt started with (useful
/// for operations, like `generation()` itself, that want to report it) and
/// must not retain borrows into the mapping past its own return.
pub(crate) fn read_with_retry<T>(
    base: *const u8,
    mut body: impl FnMut(u64) -> ReadOutcome<T>,
) -> Result<T, Error> {
    let mut backoff = INITIAL_BACKOFF;

    for _ in 0..MAX_RETRIES {
        let g1 = load_generation(base);
        if is_committing(g1) {
            spin_and_backoff(&mut backoff);
            continue;
        }

        match body(g1) {
            ReadOutcome::Done(value) => {
                let g2 = load_generation(base);
                if g1 == g2 {
                    return Ok(value);
                }
            }
            ReadOutcome::SuspectedCorruption(reason) => {
                let g2 = load_generation(base);
                if g1 == g2 && !is_committing(g2) {
                    return Err(Error::Corrupt { reason });
                }
            }
        }

        spin_and_backoff(&mut backoff);
    }

    Err(Error::Busy)
}

fn spin_and_backoff(backoff: &mut Duration) {
    std::hint::spin_loop();
    std::thread::sleep(*backoff);
    *backoff = (*backoff * 2).min(MAX_BACKOFF);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn stable_even_generation_succeeds_first_try() {
        let gen = AtomicU64::new(4);
        let base = &gen as *const AtomicU64 as *const u8;
        let mut attempts = 0;
        let result = read_with_retry(base, |_g| {
            attempts += 1;
            ReadOutcome::Done(42)
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts, 1);
    }

    #[test]
    fn odd_generation_eventually_gives_up() {
        let gen = AtomicU64::new(5);
        let base = &gen as *const AtomicU64 as *const u8;
        let result: Result<(), Error> = read_with_retry(base, |_g| ReadOutcome::Done(()));
        assert!(matches!(result, Err(Error::Busy)));
    }

    #[test]
    fn suspected_corruption_confirmed_under_stable_generation() {
        let gen = AtomicU64::new(6);
        let base = &gen as *const AtomicU64 as *const u8;
        let result: Result<(), Error> =
            read_with_retry(base, |_g| ReadOutcome::SuspectedCorruption("bad bucket"));
        assert!(matches!(result, Err(Error::Corrupt { reason: "bad bucket" })));
    }

    #[test]
    fn suspected_corruption_retried_when_generation_moved() {
        let gen = AtomicU64::new(8);
        let base = &gen as *const AtomicU64 as *const u8;
        let mut first = true;
        let result = read_with_retry(base, |_g| {
            if first {
                first = false;
                gen.store(10, Ordering::Relaxed);
                ReadOutcome::SuspectedCorruption("torn read")
            } else {
                ReadOutcome::Done(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
    }
}
