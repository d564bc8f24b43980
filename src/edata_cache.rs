//! The extent-descriptor pool: `get() -> edata?`, `put(edata)`, backed
//! by a real free list rather than a pool of just one spare, plus a
//! fault-injection knob so descriptor exhaustion can be forced
//! deterministically in tests.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::edata::{Edata, EdataHandle, EdataMut};

pub trait EdataCache: std::fmt::Debug + Send + Sync {
    /// Returns a fresh descriptor, or `None` if the pool is
    /// exhausted.  The returned descriptor's fields are unspecified
    /// garbage from a prior life; the caller must `reinit` it before
    /// use.
    fn get(&self) -> Option<EdataHandle>;

    /// Returns a descriptor to the pool for reuse.  The descriptor
    /// must not be referenced by any cache or the boundary index
    /// afterwards.
    fn put(&self, edata: EdataHandle);
}

/// A simple boxed free list behind a mutex, with an optional cap used
/// to simulate metadata exhaustion in tests.
#[derive(Debug)]
pub struct BoxEdataCache {
    free: Mutex<Vec<EdataHandle>>,
    /// Number of descriptors manufactured so far (free-list pops that
    /// required allocating fresh memory, not recycled ones).
    minted: AtomicUsize,
    /// When `Some(n)`, `get()` returns `None` once `minted` would
    /// exceed `n` and the free list is empty.  `None` means
    /// unbounded.
    max_descriptors: Option<usize>,
}

impl BoxEdataCache {
    pub fn new() -> BoxEdataCache {
        BoxEdataCache {
            free: Mutex::new(Vec::new()),
            minted: AtomicUsize::new(0),
            max_descriptors: None,
        }
    }

    /// Builds a pool that starts refusing to mint new descriptors
    /// once `max` have been manufactured, regardless of how many have
    /// since been `put` back.  Used by tests exercising the
    /// abandonment path.
    pub fn with_max_descriptors(max: usize) -> BoxEdataCache {
        BoxEdataCache {
            free: Mutex::new(Vec::new()),
            minted: AtomicUsize::new(0),
            max_descriptors: Some(max),
        }
    }

    pub fn minted(&self) -> usize {
        self.minted.load(Ordering::Relaxed)
    }
}

impl Default for BoxEdataCache {
    fn default() -> Self {
        BoxEdataCache::new()
    }
}

impl EdataCache for BoxEdataCache {
    #[ensures(ret.is_none() -> self.max_descriptors.is_some())]
    fn get(&self) -> Option<EdataHandle> {
        if let Some(handle) = self.free.lock().unwrap().pop() {
            return Some(handle);
        }

        if let Some(max) = self.max_descriptors {
            if self.minted.load(Ordering::Relaxed) >= max {
                log::debug!("descriptor pool exhausted at cap {}", max);
                return None;
            }
        }

        self.minted.fetch_add(1, Ordering::Relaxed);
        Some(EdataHandle::from_boxed(Edata::new(blank())))
    }

    fn put(&self, edata: EdataHandle) {
        self.free.lock().unwrap().push(edata);
    }
}

fn blank() -> EdataMut {
    use crate::edata::{ExtentState, Pai};

    EdataMut {
        base: 0,
        size: 0,
        arena_ind: 0,
        sn: 0,
        state: ExtentState::Active,
        committed: false,
        zeroed: false,
        pai: Pai::Pac,
        is_head: false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn recycled_descriptor_is_reused_before_minting() {
        let pool = BoxEdataCache::new();
        let a = pool.get().unwrap();
        assert_eq!(pool.minted(), 1);
        pool.put(a);
        let _b = pool.get().unwrap();
        assert_eq!(pool.minted(), 1, "put-then-get must recycle, not mint");
    }

    #[test]
    fn exhaustion_is_deterministic_with_a_cap() {
        let pool = BoxEdataCache::with_max_descriptors(2);
        let a = pool.get();
        let b = pool.get();
        let c = pool.get();
        assert!(a.is_some());
        assert!(b.is_some());
        assert!(c.is_none());
    }

    #[test]
    fn exhaustion_cap_is_not_relieved_by_put_after_exhaustion() {
        let pool = BoxEdataCache::with_max_descriptors(1);
        let a = pool.get().unwrap();
        assert!(pool.get().is_none());
        pool.put(a);
        // Recycling works even after the mint cap was hit, since
        // `put` always goes back on the free list.
        assert!(pool.get().is_some());
    }
}
