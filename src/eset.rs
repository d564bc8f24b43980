//! A per-state container of inactive extents supporting best-fit
//! lookup and LRU eviction order. All operations here assume the
//! enclosing `Ecache`'s mutex is already held; `Eset` itself does no
//! locking.
//!
//! The best-fit index is a `BTreeMap` keyed first by size then by
//! serial number, queried with a `range` lookup, giving the exact
//! tie-break order (smallest viable size, then smallest serial
//! number) without a custom heap type.
use std::collections::BTreeMap;
use std::ptr::NonNull;

use crate::edata::{Edata, EdataHandle};

pub(crate) fn align_up(addr: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (addr + align - 1) & !(align - 1)
}

#[derive(Debug)]
pub struct Eset {
    /// size -> (sn -> owning handle).  The outer map gives best-fit
    /// ("smallest viable size class"); the inner map gives the
    /// serial-number tie-break ("then smallest sn").
    by_size: BTreeMap<usize, BTreeMap<u64, EdataHandle>>,
    /// Insertion-ordered, oldest first.  Non-owning: the owning
    /// handle lives in `by_size`.
    lru: Vec<NonNull<Edata>>,
    page_size: usize,
    npages: usize,
}

// `Eset` is always accessed under its owning `Ecache`'s mutex; the
// raw pointers in `lru` are identity-only shadows of handles owned by
// `by_size`, so moving an `Eset` across threads carries no aliasing.
unsafe impl Send for Eset {}

impl Eset {
    pub fn new(page_size: usize) -> Eset {
        Eset {
            by_size: BTreeMap::new(),
            lru: Vec::new(),
            page_size,
            npages: 0,
        }
    }

    pub fn npages(&self) -> usize {
        self.npages
    }

    pub fn is_empty(&self) -> bool {
        self.by_size.is_empty()
    }

    pub fn insert(&mut self, handle: EdataHandle) {
        let ptr = handle.weak_ref();
        let size = handle.size();
        let sn = handle.sn();
        self.by_size.entry(size).or_default().insert(sn, handle);
        self.lru.push(ptr);
        self.npages += size / self.page_size;
    }

    fn remove_from_lru(&mut self, ptr: NonNull<Edata>) {
        if let Some(pos) = self.lru.iter().position(|p| *p == ptr) {
            self.lru.remove(pos);
        }
    }

    /// Removes a specific descriptor, identified by a pointer obtained
    /// from the boundary index.  Returns `None` if it is not present
    /// (e.g. a stale lookup raced with another remover; callers under
    /// the cache mutex should not see this in practice).
    pub fn remove(&mut self, ptr: NonNull<Edata>) -> Option<EdataHandle> {
        let edata = unsafe { ptr.as_ref() };
        let size = edata.size();
        let sn = edata.sn();

        let bucket = self.by_size.get_mut(&size)?;
        let handle = bucket.remove(&sn)?;
        if bucket.is_empty() {
            self.by_size.remove(&size);
        }
        self.remove_from_lru(ptr);
        self.npages -= size / self.page_size;
        Some(handle)
    }

    /// Best-fit lookup: the smallest-size-class extent
    /// `>= size` whose base can be aligned within `size *
    /// 2^lg_max_fit` slack, tie-broken by smallest `sn`.  When
    /// `exact_only`, only the exact-`size` bucket is considered.
    pub fn fit(&mut self, size: usize, align: usize, exact_only: bool, lg_max_fit: u32) -> Option<EdataHandle> {
        if size == 0 || align == 0 {
            return None;
        }

        let max_size = if exact_only {
            size
        } else {
            size.checked_shl(lg_max_fit).unwrap_or(usize::MAX)
        };
        if max_size < size {
            return None;
        }

        let mut found: Option<(usize, u64)> = None;
        'outer: for (&bucket_size, candidates) in self.by_size.range(size..=max_size) {
            for (&sn, handle) in candidates.iter() {
                let base = handle.base();
                let leadsize = align_up(base, align) - base;
                if bucket_size >= leadsize + size {
                    found = Some((bucket_size, sn));
                    break 'outer;
                }
            }
        }

        let (bucket_size, sn) = found?;
        let bucket = self.by_size.get_mut(&bucket_size)?;
        let handle = bucket.remove(&sn)?;
        if bucket.is_empty() {
            self.by_size.remove(&bucket_size);
        }
        self.remove_from_lru(handle.weak_ref());
        self.npages -= bucket_size / self.page_size;
        Some(handle)
    }

    /// Oldest entry, without removing it.
    pub fn first_lru(&self) -> Option<NonNull<Edata>> {
        self.lru.first().copied()
    }

    /// Pops and returns the oldest entry.
    pub fn pop_lru(&mut self) -> Option<EdataHandle> {
        let ptr = *self.lru.first()?;
        self.remove(ptr)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::edata::{Edata, EdataMut, ExtentState, Pai};

    fn handle(base: usize, size: usize, sn: u64) -> EdataHandle {
        EdataHandle::from_boxed(Edata::new(EdataMut {
            base,
            size,
            arena_ind: 0,
            sn,
            state: ExtentState::Dirty,
            committed: true,
            zeroed: false,
            pai: Pai::Pac,
            is_head: true,
        }))
    }

    #[test]
    fn fit_prefers_smallest_viable_size_then_smallest_sn() {
        let mut eset = Eset::new(4096);
        eset.insert(handle(0x1000, 8192, 5));
        eset.insert(handle(0x3000, 8192, 1));
        eset.insert(handle(0x5000, 16384, 0));

        let got = eset.fit(8192, 4096, true, 0).unwrap();
        assert_eq!(got.sn(), 1, "smallest sn wins among equal-size candidates");
    }

    #[test]
    fn fit_respects_lg_max_fit_cap() {
        let mut eset = Eset::new(4096);
        eset.insert(handle(0x1000, 65536, 0));
        // Requesting 4096 with lg_max_fit = 1 allows up to 8192;
        // the 65536 extent is out of range.
        assert!(eset.fit(4096, 4096, false, 1).is_none());
        assert!(eset.fit(4096, 4096, false, 4).is_some());
    }

    #[test]
    fn exact_only_ignores_larger_buckets() {
        let mut eset = Eset::new(4096);
        eset.insert(handle(0x1000, 8192, 0));
        assert!(eset.fit(4096, 4096, true, 6).is_none());
        assert!(eset.fit(8192, 4096, true, 6).is_some());
    }

    #[test]
    fn lru_order_is_insertion_order() {
        let mut eset = Eset::new(4096);
        eset.insert(handle(0x1000, 4096, 0));
        eset.insert(handle(0x2000, 4096, 1));
        let first = eset.pop_lru().unwrap();
        assert_eq!(first.base(), 0x1000);
        let second = eset.pop_lru().unwrap();
        assert_eq!(second.base(), 0x2000);
        assert!(eset.pop_lru().is_none());
    }

    #[test]
    fn npages_tracks_insert_and_remove() {
        let mut eset = Eset::new(4096);
        eset.insert(handle(0x1000, 4096 * 3, 0));
        assert_eq!(eset.npages(), 3);
        eset.pop_lru();
        assert_eq!(eset.npages(), 0);
    }
}
