//! The boundary index: a concurrent address-to-extent map with
//! per-extent locking and neighbor queries.
//!
//! The lookup structure is a `BTreeMap` queried with a `predecessor`
//! helper (`range(..=addr).next_back()`), the same shape as a
//! debug-only overlap sanity net but used here as the load-bearing
//! index. Per-extent locking is simply `Edata`'s own internal mutex
//! (see `edata.rs`); `Emap` stores non-owning pointers and borrows
//! that lock rather than keeping a second one.
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

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard};

use crate::edata::{Edata, EdataHandle, EdataMut, ExtentState};
use crate::error::PacError;

#[derive(Debug, Default)]
pub struct Emap {
    // Keyed by `base`.  Non-owning: the pointee is owned by whichever
    // cache or caller currently holds the matching `EdataHandle`.
    index: Mutex<BTreeMap<usize, NonNull<Edata>>>,
}

// Every pointer stored here is paired with a live `EdataHandle`
// elsewhere, and all mutable access to the pointee goes through the
// pointee's own `Mutex`; the index itself is just an address lookup
// table.
unsafe impl Send for Emap {}
unsafe impl Sync for Emap {}

impl Emap {
    pub fn new() -> Emap {
        Emap::default()
    }

    /// Registers `handle`'s address range.  Fails if the range
    /// overlaps an existing registration (invariant 1).
    #[ensures(ret.is_ok() -> self.lookup(handle.base()).is_some())]
    pub fn register(&self, handle: &EdataHandle) -> Result<(), PacError> {
        let base = handle.base();
        let mut index = self.index.lock().unwrap();

        if let Some((&prev_base, &prev_ptr)) = index.range(..=base).next_back() {
            let prev_end = unsafe { prev_ptr.as_ref() }.end();
            if base < prev_end {
                return Err(PacError::InvalidConfig("overlaps previous registration"));
            }
            let _ = prev_base;
        }
        index.insert(base, handle.weak_ref());
        Ok(())
    }

    pub fn deregister(&self, base: usize) {
        self.index.lock().unwrap().remove(&base);
    }

    /// Returns the descriptor covering `addr`, if any.
    pub fn lookup(&self, addr: usize) -> Option<NonNull<Edata>> {
        let index = self.index.lock().unwrap();
        let (_, &ptr) = index.range(..=addr).next_back()?;
        let edata = unsafe { ptr.as_ref() };
        if edata.contains(addr) {
            Some(ptr)
        } else {
            None
        }
    }

    /// Looks up an extent by its exact base, only returning it when
    /// it is in `state` — used for the `new_addr` fast path in the
    /// recycle extract step.
    pub fn lookup_exact_in_state(&self, base: usize, state: ExtentState) -> Option<NonNull<Edata>> {
        let ptr = *self.index.lock().unwrap().get(&base)?;
        let edata = unsafe { ptr.as_ref() };
        if edata.state() == state {
            Some(ptr)
        } else {
            None
        }
    }

    /// The forward neighbor: the extent whose base is exactly
    /// `end_addr`.  `inactive_only` skips neighbors currently
    /// `Active` (the delay-coalesce variant).
    pub fn forward_neighbor(&self, end_addr: usize, inactive_only: bool) -> Option<NonNull<Edata>> {
        let ptr = *self.index.lock().unwrap().get(&end_addr)?;
        let edata = unsafe { ptr.as_ref() };
        if inactive_only && edata.state() == ExtentState::Active {
            None
        } else {
            Some(ptr)
        }
    }

    /// The backward neighbor: the extent whose range contains
    /// `base - 1`, clamped to that extent's own base.
    pub fn backward_neighbor(&self, base: usize, inactive_only: bool) -> Option<NonNull<Edata>> {
        if base == 0 {
            return None;
        }
        let probe = base - 1;
        let index = self.index.lock().unwrap();
        let (_, &ptr) = index.range(..=probe).next_back()?;
        let edata = unsafe { ptr.as_ref() };
        if !edata.contains(probe) {
            return None;
        }
        if inactive_only && edata.state() == ExtentState::Active {
            None
        } else {
            Some(ptr)
        }
    }

    /// Locks a single descriptor's mutable state.
    pub fn lock_edata<'a>(&self, edata: &'a Edata) -> MutexGuard<'a, EdataMut> {
        edata.lock()
    }

    /// Locks two descriptors' mutable state in address order, per the
    /// locking discipline's rule 2 ("acquire in address order").
    pub fn lock_edata2<'a>(
        &self,
        a: &'a Edata,
        b: &'a Edata,
    ) -> (MutexGuard<'a, EdataMut>, MutexGuard<'a, EdataMut>) {
        if a.base() <= b.base() {
            let ga = a.lock();
            let gb = b.lock();
            (ga, gb)
        } else {
            let gb = b.lock();
            let ga = a.lock();
            (ga, gb)
        }
    }

    /// No-op placeholder for a two-phase index update's prepare
    /// phase.  Unlike jemalloc's radix-tree-backed `emap`, a
    /// `BTreeMap` never needs to preallocate internal nodes before a
    /// split or merge, so there is nothing to reserve; the function
    /// exists so call sites mirror the two-phase shape the split/merge protocol uses.
    pub fn split_prepare(&self) -> Result<(), PacError> {
        Ok(())
    }

    /// Registers the new trail produced by a split.  The parent's
    /// entry needs no update: it keeps its base, and its size is read
    /// live from its own descriptor.
    pub fn split_commit(&self, trail: &EdataHandle) -> Result<(), PacError> {
        self.register(trail)
    }

    pub fn merge_prepare(&self) -> Result<(), PacError> {
        Ok(())
    }

    /// Removes the absorbed extent's entry.  The surviving extent
    /// keeps its base and simply reports a larger size afterwards.
    pub fn merge_commit(&self, absorbed_base: usize) {
        self.deregister(absorbed_base);
    }

    /// Debug invariant: the descriptor is registered at exactly its
    /// own base.
    pub fn assert_mapped(&self, edata: &Edata) {
        debug_assert!(
            self.lookup_exact_in_state(edata.base(), edata.state()).is_some(),
            "edata at {:#x} is not registered in its own state",
            edata.base()
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::edata::{Edata, EdataMut, Pai};

    fn handle(base: usize, size: usize, state: ExtentState) -> EdataHandle {
        EdataHandle::from_boxed(Edata::new(EdataMut {
            base,
            size,
            arena_ind: 0,
            sn: 0,
            state,
            committed: true,
            zeroed: false,
            pai: Pai::Pac,
            is_head: true,
        }))
    }

    #[test]
    fn lookup_finds_containing_extent() {
        let emap = Emap::new();
        let h = handle(0x1000, 0x1000, ExtentState::Dirty);
        emap.register(&h).unwrap();
        assert!(emap.lookup(0x1000).is_some());
        assert!(emap.lookup(0x1fff).is_some());
        assert!(emap.lookup(0x2000).is_none());
        assert!(emap.lookup(0x0fff).is_none());
    }

    #[test]
    fn register_rejects_overlap() {
        let emap = Emap::new();
        let h1 = handle(0x1000, 0x2000, ExtentState::Dirty);
        emap.register(&h1).unwrap();
        let h2 = handle(0x2000, 0x1000, ExtentState::Dirty);
        assert!(emap.register(&h2).is_err());
    }

    #[test]
    fn forward_and_backward_neighbors() {
        let emap = Emap::new();
        let a = handle(0x1000, 0x1000, ExtentState::Dirty);
        let b = handle(0x2000, 0x1000, ExtentState::Dirty);
        emap.register(&a).unwrap();
        emap.register(&b).unwrap();

        let fwd = emap.forward_neighbor(0x2000, false).unwrap();
        assert_eq!(unsafe { fwd.as_ref() }.base(), 0x2000);

        let back = emap.backward_neighbor(0x2000, false).unwrap();
        assert_eq!(unsafe { back.as_ref() }.base(), 0x1000);
    }

    #[test]
    fn inactive_only_skips_active_neighbor() {
        let emap = Emap::new();
        let a = handle(0x1000, 0x1000, ExtentState::Active);
        emap.register(&a).unwrap();
        assert!(emap.forward_neighbor(0x1000, true).is_none());
        assert!(emap.forward_neighbor(0x1000, false).is_some());
    }

    #[test]
    fn deregistered_extent_is_unreachable() {
        let emap = Emap::new();
        let a = handle(0x1000, 0x1000, ExtentState::Retained);
        emap.register(&a).unwrap();
        emap.deregister(0x1000);
        assert!(emap.lookup(0x1000).is_none());
    }
}
