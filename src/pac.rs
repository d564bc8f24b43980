//! The page allocator core facade: the single entry point wiring
//! together the three lifecycle-state caches, the retained-growth
//! engine, the descriptor pool, the boundary index, and the hooks into
//! the four public operations (`alloc`, `alloc_grow`, `dalloc`,
//! `evict`).
//!
//! Shaped after an aggregating facade that wraps a block stack, a
//! descriptor pool, and an OS-interface object behind one object with
//! a small public surface; `Pac` plays the same aggregating role one
//! level up, over extents instead of size-classed blocks.
use std::sync::atomic::AtomicU64;

use crate::config::Config;
use crate::dalloc;
use crate::debug_checks::DebugChecker;
use crate::ecache::Ecache;
use crate::edata::{EdataHandle, ExtentState};
use crate::edata_cache::{BoxEdataCache, EdataCache};
use crate::emap::Emap;
use crate::grow::Grow;
use crate::hooks::{Hooks, SystemHooks};
use crate::record;
use crate::recycle;
use crate::stats::Stats;

pub struct Pac {
    hooks: Box<dyn Hooks>,
    pool: Box<dyn EdataCache>,
    emap: Emap,
    dirty: Ecache,
    muzzy: Ecache,
    retained: Ecache,
    grow: Grow,
    config: Config,
    stats: Stats,
    sn_counter: AtomicU64,
    arena_ind: u32,
    /// Tracks exactly which ranges are currently handed out to a
    /// caller, independent of `Emap`'s own bookkeeping, so a
    /// double-`dalloc` or a `dalloc` of an address never returned by
    /// `alloc` is caught in debug builds rather than silently
    /// corrupting a cache.
    debug: DebugChecker,
}

impl Pac {
    pub fn new(hooks: Box<dyn Hooks>, pool: Box<dyn EdataCache>, config: Config, arena_ind: u32) -> Pac {
        let page_size = config.page_size;
        Pac {
            hooks,
            pool,
            emap: Emap::new(),
            dirty: Ecache::new(ExtentState::Dirty, true, arena_ind, page_size),
            muzzy: Ecache::new(ExtentState::Muzzy, false, arena_ind, page_size),
            retained: Ecache::new(ExtentState::Retained, false, arena_ind, page_size),
            grow: Grow::new(),
            config,
            stats: Stats::new(),
            sn_counter: AtomicU64::new(0),
            arena_ind,
            debug: DebugChecker::new(),
        }
    }

    /// Builds a `Pac` backed by the process's global allocator and an
    /// unbounded descriptor pool, using the built-in configuration
    /// defaults for `page_size`.
    pub fn new_default(page_size: usize) -> Pac {
        Pac::new(
            Box::new(SystemHooks::new(page_size)),
            Box::new(BoxEdataCache::new()),
            Config::default_for_page_size(page_size),
            0,
        )
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn dirty_npages(&self) -> usize {
        self.dirty.npages()
    }

    pub fn muzzy_npages(&self) -> usize {
        self.muzzy.npages()
    }

    pub fn retained_npages(&self) -> usize {
        self.retained.npages()
    }

    /// Satisfies a `(size, align)` request, preferring recycled pages
    /// over fresh VM: dirty, then muzzy, then retained, then the
    /// retained-growth engine.
    pub fn alloc(&self, new_addr: Option<usize>, size: usize, align: usize, zero: bool) -> Option<EdataHandle> {
        for cache in [&self.dirty, &self.muzzy, &self.retained] {
            if let Some(h) = recycle::recycle(&*self.hooks, &*self.pool, &self.emap, cache, &self.config, new_addr, size, align, zero) {
                self.stats.add_pages(h.size() / self.config.page_size);
                debug_assert!(self.debug.on_register(h.base(), h.size()).is_ok());
                return Some(h);
            }
        }

        if new_addr.is_some() || !self.config.retain {
            return None;
        }

        self.alloc_grow(size, align)
    }

    /// Obtains fresh VM from the OS via the geometric growth series,
    /// bypassing the three caches entirely. Accounts the grown range
    /// in `stats` and the debug checker exactly like `alloc`'s recycle
    /// path, so a handle returned from here is just as safe to pass to
    /// `dalloc` as one returned from `alloc`.
    pub fn alloc_grow(&self, size: usize, align: usize) -> Option<EdataHandle> {
        let h = crate::grow::grow_retained(
            &*self.hooks,
            &*self.pool,
            &self.emap,
            &self.retained,
            &self.grow,
            &self.stats,
            &self.config.growth_series,
            self.config.page_size,
            self.arena_ind,
            &self.sn_counter,
            size,
            align,
        )?;
        self.stats.add_pages(h.size() / self.config.page_size);
        debug_assert!(self.debug.on_register(h.base(), h.size()).is_ok());
        Some(h)
    }

    /// Returns `edata` to the dirty cache, coalescing with active
    /// neighbors.
    pub fn dalloc(&self, edata: EdataHandle) {
        self.stats.sub_pages(edata.size() / self.config.page_size);
        debug_assert!(self.debug.on_deregister(edata.base()).is_ok());
        record::record(
            &*self.hooks,
            &*self.pool,
            &self.emap,
            &self.retained,
            &self.dirty,
            &self.stats,
            &self.config,
            edata,
        );
    }

    /// Evicts the single oldest extent from `from`'s LRU, advancing it
    /// one step down the decay pipeline: dirty -> muzzy (lazily
    /// purged) or muzzy -> retained (the full dalloc cascade). Never
    /// evicts below `npages_min` cached pages, and on a delay-coalesce
    /// cache (dirty) gives the popped extent one more inactive-only
    /// coalesce attempt first, reinserting and retrying the pop
    /// instead of evicting it, if that grows it.
    ///
    /// Returns whether anything was evicted.
    pub fn evict_one(&self, from: ExtentState, npages_min: usize) -> bool {
        let cache = match from {
            ExtentState::Dirty => &self.dirty,
            ExtentState::Muzzy => &self.muzzy,
            _ => return false,
        };

        loop {
            if cache.npages() <= npages_min {
                return false;
            }
            let mut edata = match cache.with_eset(|eset| eset.pop_lru()) {
                Some(e) => e,
                None => return false,
            };

            if cache.delay_coalesce {
                let (new_edata, coalesced) =
                    record::coalesce_once_inactive_only(&*self.hooks, &*self.pool, &self.emap, cache, edata);
                edata = new_edata;
                if coalesced {
                    cache.with_eset(|eset| eset.insert(edata));
                    continue;
                }
            }

            match from {
                ExtentState::Dirty => {
                    let _ = self.hooks.purge_lazy(edata.base(), edata.size(), 0, edata.size());
                    record::record(
                        &*self.hooks,
                        &*self.pool,
                        &self.emap,
                        &self.retained,
                        &self.muzzy,
                        &self.stats,
                        &self.config,
                        edata,
                    );
                }
                ExtentState::Muzzy => {
                    dalloc::dalloc(&*self.hooks, &*self.pool, &self.emap, &self.retained, &self.stats, &self.config, edata);
                }
                _ => unreachable!(),
            }
            return true;
        }
    }

    /// Evicts extents from `from`'s cache down to `npages_min` cached
    /// pages. Returns the count evicted.
    pub fn evict_all(&self, from: ExtentState, npages_min: usize) -> usize {
        let mut count = 0;
        while self.evict_one(from, npages_min) {
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn alloc_then_dalloc_reuses_the_same_range() {
        let pac = Pac::new_default(4096);
        let a = pac.alloc(None, 4096, 4096, false).unwrap();
        let base = a.base();
        pac.dalloc(a);
        assert_eq!(pac.dirty_npages(), 1);

        let b = pac.alloc(None, 4096, 4096, false).unwrap();
        assert_eq!(b.base(), base, "the freed range should be reused");
        assert!(pac.dirty.is_empty());
        pac.dalloc(b);
    }

    #[test]
    fn split_then_free_both_halves_coalesces() {
        // Lower `large_min_class` to 0 so the delay-coalesce dirty
        // cache attempts a coalesce on every free, regardless of
        // size; otherwise small test extents would never qualify for
        // the "large" branch of the record path.
        let mut config = Config::default_for_page_size(4096);
        config.large_min_class = 0;
        let pac = Pac::new(Box::new(SystemHooks::new(4096)), Box::new(BoxEdataCache::new()), config, 0);
        let whole = pac.alloc_grow(8192, 4096).unwrap();
        let base = whole.base();
        pac.dalloc(whole);
        assert_eq!(pac.dirty_npages(), 2);

        let a = pac.alloc(None, 4096, 4096, false).unwrap();
        assert_eq!(a.base(), base);
        let b = pac.alloc(None, 4096, 4096, false).unwrap();
        assert_eq!(b.base(), base + 4096);
        assert!(pac.dirty.is_empty());

        pac.dalloc(a);
        pac.dalloc(b);
        assert_eq!(pac.dirty_npages(), 2, "coalesced back into one 8 KiB extent");

        let reunited = pac.alloc(None, 8192, 4096, false).unwrap();
        assert_eq!(reunited.base(), base);
        pac.dalloc(reunited);
    }

    #[test]
    fn retained_growth_kicks_in_when_caches_are_empty() {
        let pac = Pac::new_default(4096);
        let h = pac.alloc(None, 1 << 20, 4096, false).unwrap();
        assert_eq!(h.size(), 1 << 20);
        assert_eq!(pac.stats().curpages(), (1 << 20) / 4096);
        pac.dalloc(h);
    }

    #[test]
    fn decay_pipeline_moves_dirty_through_muzzy_into_retained() {
        let pac = Pac::new_default(4096);
        let a = pac.alloc(None, 4096, 4096, false).unwrap();
        pac.dalloc(a);
        assert_eq!(pac.dirty_npages(), 1);

        assert!(pac.evict_one(ExtentState::Dirty, 0));
        assert!(pac.dirty.is_empty());
        assert_eq!(pac.muzzy_npages(), 1);

        assert!(pac.evict_one(ExtentState::Muzzy, 0));
        assert!(pac.muzzy.is_empty());
        assert_eq!(pac.retained_npages(), 1);
    }

    #[test]
    fn evict_one_honors_the_npages_min_floor() {
        let pac = Pac::new_default(4096);
        let a = pac.alloc(None, 4096, 4096, false).unwrap();
        let b = pac.alloc(None, 4096, 4096, false).unwrap();
        pac.dalloc(a);
        pac.dalloc(b);
        assert_eq!(pac.dirty_npages(), 2);

        // At the floor already: nothing should move.
        assert!(!pac.evict_one(ExtentState::Dirty, 2));
        assert_eq!(pac.dirty_npages(), 2);
        assert_eq!(pac.muzzy_npages(), 0);

        // One page of slack: exactly one extent steps down to muzzy.
        assert!(pac.evict_one(ExtentState::Dirty, 1));
        assert_eq!(pac.dirty_npages(), 1);
        assert_eq!(pac.muzzy_npages(), 1);
        assert!(!pac.evict_one(ExtentState::Dirty, 1));
    }

    #[test]
    fn evict_all_stops_at_the_floor() {
        let pac = Pac::new_default(4096);
        for _ in 0..4 {
            let h = pac.alloc(None, 4096, 4096, false).unwrap();
            pac.dalloc(h);
        }
        assert_eq!(pac.dirty_npages(), 4);

        let evicted = pac.evict_all(ExtentState::Dirty, 1);
        assert_eq!(evicted, 3);
        assert_eq!(pac.dirty_npages(), 1);
        assert_eq!(pac.muzzy_npages(), 3);
    }

    #[test]
    fn oversize_free_bypasses_dirty_and_muzzy_straight_into_retained() {
        // With both thresholds lowered to one page, a freed extent
        // should skip the dirty and muzzy caches entirely and come out
        // the other end of the purge cascade already in `retained`.
        let config = Config::new(4096, 6, true, 4096, 4096, 10_000, 10_000, true, vec![1 << 20]).unwrap();
        let pac = Pac::new(Box::new(SystemHooks::new(4096)), Box::new(BoxEdataCache::new()), config, 0);

        let h = pac.alloc_grow(4096, 4096).unwrap();
        pac.dalloc(h);

        assert!(pac.dirty.is_empty());
        assert!(pac.muzzy.is_empty());
        assert_eq!(pac.retained_npages(), 1);
        assert_eq!(pac.stats().decay_dirty_purged.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    use proptest::prelude::*;

    proptest! {
        // Bulk allocate, then free and re-allocate in random-ish order:
        // every live base address must stay unique, and every byte
        // handed back must eventually be reclaimed.
        #[test]
        fn random_order_never_double_issues(indices in prop::collection::vec(0..20usize, 1..80)) {
            let pac = Pac::new_default(4096);
            let mut slots: Vec<Option<EdataHandle>> = Vec::new();
            slots.resize_with(20, || pac.alloc(None, 4096, 4096, false));
            prop_assert!(slots.iter().all(|s| s.is_some()));

            for index in indices {
                if let Some(h) = slots[index].take() {
                    pac.dalloc(h);
                } else {
                    let fresh = pac.alloc(None, 4096, 4096, false);
                    prop_assert!(fresh.is_some());
                    let base = fresh.as_ref().unwrap().base();
                    let collides = slots.iter().flatten().any(|h| h.base() == base);
                    prop_assert!(!collides, "a live base address must never be handed out twice");
                    slots[index] = fresh;
                }
            }

            for slot in slots.into_iter().flatten() {
                pac.dalloc(slot);
            }
            prop_assert_eq!(pac.stats().curpages(), 0);
        }
    }
}
