//! The record (free) path and the coalescing protocol, composed from
//! `Eset`, `Emap`, and `split_merge`. Structured the way jemalloc's own
//! `extent_try_coalesce_impl` works: one direction at a time, re-trying
//! the fixpoint loop only when `delay_coalesce` is off.
use crate::config::Config;
use crate::ecache::Ecache;
use crate::edata::{EdataHandle, ExtentState};
use crate::edata_cache::EdataCache;
use crate::emap::Emap;
use crate::hooks::Hooks;
use crate::split_merge;
use crate::stats::Stats;

/// Attempts to coalesce `edata` with its neighbor on one side.
/// Returns whichever handle now represents the (possibly combined)
/// extent: on a successful backward merge this is the former
/// neighbor, since the lower-addressed descriptor always survives a
/// merge.
fn try_coalesce_one_direction(
    hooks: &dyn Hooks,
    pool: &dyn EdataCache,
    emap: &Emap,
    cache: &Ecache,
    edata: EdataHandle,
    forward: bool,
    inactive_only: bool,
) -> EdataHandle {
    let probe_addr = if forward { edata.end() } else { edata.base() };
    let neighbor_ptr = if forward {
        emap.forward_neighbor(probe_addr, inactive_only)
    } else {
        emap.backward_neighbor(probe_addr, inactive_only)
    };
    let neighbor_ptr = match neighbor_ptr {
        Some(p) => p,
        None => return edata,
    };

    // Claim the neighbor out of this cache before releasing the cache
    // mutex to call into hooks (locking discipline rule 1).
    let neighbor = match cache.with_eset(|eset| eset.remove(neighbor_ptr)) {
        Some(n) => n,
        None => return edata,
    };

    // `can_coalesce_with`'s head check applies to the higher-addressed
    // operand, since that's the one the merge hook actually rejects
    // when it is a head: forward, that's `neighbor`; backward, it's
    // `edata`.
    let coalescable = if forward {
        edata.can_coalesce_with(&neighbor, cache.state)
    } else {
        neighbor.can_coalesce_with(&edata, cache.state)
    };
    if !coalescable {
        cache.with_eset(|eset| eset.insert(neighbor));
        return edata;
    }

    // Move the neighbor to `active` so no other thread can claim it
    // while the merge hook runs outside any cache mutex.
    neighbor.set_state(ExtentState::Active);

    if forward {
        match split_merge::merge(hooks, pool, emap, &edata, neighbor) {
            Ok(()) => edata,
            Err(neighbor) => {
                neighbor.set_state(cache.state);
                cache.with_eset(|eset| eset.insert(neighbor));
                edata
            }
        }
    } else {
        match split_merge::merge(hooks, pool, emap, &neighbor, edata) {
            Ok(()) => neighbor,
            Err(edata) => {
                neighbor.set_state(cache.state);
                cache.with_eset(|eset| eset.insert(neighbor));
                edata
            }
        }
    }
}

/// Coalesces with both neighbors, looping until neither succeeds
/// (`delay_coalesce == false`).
fn coalesce_to_fixpoint(
    hooks: &dyn Hooks,
    pool: &dyn EdataCache,
    emap: &Emap,
    cache: &Ecache,
    mut edata: EdataHandle,
) -> EdataHandle {
    loop {
        let before = edata.size();
        edata = try_coalesce_one_direction(hooks, pool, emap, cache, edata, true, false);
        edata = try_coalesce_one_direction(hooks, pool, emap, cache, edata, false, false);
        if edata.size() == before {
            return edata;
        }
    }
}

/// Stops after the first successful direction (`delay_coalesce ==
/// true`).  Returns whether anything coalesced.
pub(crate) fn coalesce_once_inactive_only(
    hooks: &dyn Hooks,
    pool: &dyn EdataCache,
    emap: &Emap,
    cache: &Ecache,
    edata: EdataHandle,
) -> (EdataHandle, bool) {
    let before = edata.size();
    let edata = try_coalesce_one_direction(hooks, pool, emap, cache, edata, true, true);
    if edata.size() != before {
        return (edata, true);
    }
    let edata = try_coalesce_one_direction(hooks, pool, emap, cache, edata, false, true);
    let coalesced = edata.size() != before;
    (edata, coalesced)
}

/// Returns `edata` to `cache`, coalescing with neighbors per the
/// cache's `delay_coalesce` policy.
pub fn record(
    hooks: &dyn Hooks,
    pool: &dyn EdataCache,
    emap: &Emap,
    retained: &Ecache,
    cache: &Ecache,
    stats: &Stats,
    config: &Config,
    edata: EdataHandle,
) {
    // Transition to the target state before attempting to coalesce:
    // `can_coalesce_with` requires both operands already be in the
    // cache's state, and every already-cached neighbor has already
    // made this transition.
    edata.set_state(cache.state);

    if !cache.delay_coalesce {
        let edata = coalesce_to_fixpoint(hooks, pool, emap, cache, edata);
        cache.with_eset(|eset| eset.insert(edata));
        return;
    }

    if edata.size() >= config.large_min_class {
        let (edata, _coalesced) = coalesce_once_inactive_only(hooks, pool, emap, cache, edata);
        if edata.size() >= config.oversize_threshold && config.may_force_decay() {
            crate::dalloc::maximally_purge(hooks, pool, emap, retained, stats, config, edata);
            return;
        }
        cache.with_eset(|eset| eset.insert(edata));
        return;
    }

    cache.with_eset(|eset| eset.insert(edata));
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::edata::{Edata, EdataMut, Pai};
    use crate::edata_cache::BoxEdataCache;
    use crate::hooks::SystemHooks;

    fn active(base: usize, size: usize, sn: u64) -> EdataHandle {
        EdataHandle::from_boxed(Edata::new(EdataMut {
            base,
            size,
            arena_ind: 0,
            sn,
            state: ExtentState::Active,
            committed: true,
            zeroed: false,
            pai: Pai::Pac,
            is_head: sn == 0,
        }))
    }

    fn test_config() -> Config {
        let mut cfg = Config::default_for_page_size(4096);
        cfg.large_min_class = 4096 * 4;
        cfg
    }

    #[test]
    fn non_delayed_cache_coalesces_both_neighbors() {
        let hooks = SystemHooks::new(4096);
        let pool = BoxEdataCache::new();
        let emap = Emap::new();
        let muzzy = Ecache::new(ExtentState::Muzzy, false, 0, 4096);
        let retained = Ecache::new(ExtentState::Retained, false, 0, 4096);
        let cfg = test_config();
        let stats = Stats::new();

        let left = active(0x1000, 4096, 0);
        let mid = active(0x2000, 4096, 1);
        let right = active(0x3000, 4096, 2);
        emap.register(&left).unwrap();
        emap.register(&mid).unwrap();
        emap.register(&right).unwrap();

        record(&hooks, &pool, &emap, &retained, &muzzy, &stats, &cfg, left);
        record(&hooks, &pool, &emap, &retained, &muzzy, &stats, &cfg, right);
        assert_eq!(muzzy.npages(), 2);

        record(&hooks, &pool, &emap, &retained, &muzzy, &stats, &cfg, mid);
        assert_eq!(muzzy.npages(), 3, "all three extents should have coalesced into one");

        let combined = emap.lookup(0x1000).unwrap();
        assert_eq!(unsafe { combined.as_ref() }.size(), 3 * 4096);
        assert_eq!(unsafe { combined.as_ref() }.sn(), 0, "sn is the min of the three");
    }

    #[test]
    fn delay_coalesce_skips_small_extents() {
        let hooks = SystemHooks::new(4096);
        let pool = BoxEdataCache::new();
        let emap = Emap::new();
        let dirty = Ecache::new(ExtentState::Dirty, true, 0, 4096);
        let retained = Ecache::new(ExtentState::Retained, false, 0, 4096);
        let cfg = test_config();
        let stats = Stats::new();

        let left = active(0x1000, 4096, 0);
        let right = active(0x2000, 4096, 1);
        emap.register(&left).unwrap();
        emap.register(&right).unwrap();

        record(&hooks, &pool, &emap, &retained, &dirty, &stats, &cfg, left);
        record(&hooks, &pool, &emap, &retained, &dirty, &stats, &cfg, right);

        // Both extents are below `large_min_class`, so delay_coalesce
        // must leave them uncoalesced.
        assert_eq!(dirty.npages(), 2);
        assert!(emap.lookup(0x1000).is_some());
        assert!(emap.lookup(0x2000).is_some());
    }
}
