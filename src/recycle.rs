//! The extract / split-to-fit / commit-if-needed path: turns a cached,
//! possibly oversized extent into one that exactly matches a request.
//!
//! Shaped after a fit-then-trim allocate path, generalized from
//! fixed-size-class magazines to a best-fit-plus-split model.
use crate::config::Config;
use crate::ecache::Ecache;
use crate::edata::{EdataHandle, ExtentState};
use crate::edata_cache::EdataCache;
use crate::emap::Emap;
use crate::eset::align_up;
use crate::hooks::Hooks;
use crate::split_merge::{self, SplitOutcome};

/// Tries to satisfy `(size, align)` out of `cache` alone, without
/// touching the OS.  Returns an `active` extent ready for the caller
/// on success.
#[allow(clippy::too_many_arguments)]
pub fn recycle(
    hooks: &dyn Hooks,
    pool: &dyn EdataCache,
    emap: &Emap,
    cache: &Ecache,
    config: &Config,
    new_addr: Option<usize>,
    size: usize,
    align: usize,
    zero: bool,
) -> Option<EdataHandle> {
    let candidate = extract(emap, cache, config, new_addr, size, align)?;

    let fitted = match split_to_fit(hooks, pool, emap, cache, candidate, size, align) {
        Some(h) => h,
        None => return None,
    };

    commit_if_needed(hooks, cache, fitted, zero)
}

fn extract(
    emap: &Emap,
    cache: &Ecache,
    config: &Config,
    new_addr: Option<usize>,
    size: usize,
    align: usize,
) -> Option<EdataHandle> {
    if let Some(addr) = new_addr {
        let ptr = emap.lookup_exact_in_state(addr, cache.state)?;
        let found = unsafe { ptr.as_ref() };
        if found.size() < size || align_up(addr, align) != addr {
            return None;
        }
        return cache.with_eset(|eset| eset.remove(ptr));
    }

    // A delay-coalesce cache (the dirty cache) caps how much slack it
    // will hand out before preferring a fresh/larger-cache extent, so
    // a single freed page can't be permanently pinned serving tiny
    // requests.
    let lg_max_fit = if cache.delay_coalesce {
        config.lg_extent_max_active_fit
    } else {
        usize::BITS - 1
    };
    // When the platform can't coalesce independently obtained mappings
    // and retained-growth is off, split/merge are disabled entirely:
    // only an extent that already matches `size` exactly is usable.
    let exact_only = !config.maps_coalesce && !config.retain;
    cache.with_eset(|eset| eset.fit(size, align, exact_only, lg_max_fit))
}

fn split_to_fit(
    hooks: &dyn Hooks,
    pool: &dyn EdataCache,
    emap: &Emap,
    cache: &Ecache,
    candidate: EdataHandle,
    size: usize,
    align: usize,
) -> Option<EdataHandle> {
    let base = candidate.base();
    let leadsize = align_up(base, align) - base;

    // `split_will_fail` lets a hooks implementation that can never
    // split tell us so up front, skipping a doomed call into
    // `split_merge::split` entirely rather than paying for the lock
    // dance just to get `Error` back.
    let cant_split = hooks.split_will_fail();

    let main = if leadsize > 0 {
        if cant_split {
            candidate.set_state(cache.state);
            cache.with_eset(|eset| eset.insert(candidate));
            return None;
        }
        match split_merge::split(hooks, pool, emap, &candidate, leadsize) {
            SplitOutcome::Ok(main) => {
                candidate.set_state(cache.state);
                cache.with_eset(|eset| eset.insert(candidate));
                main
            }
            _ => {
                // Could not peel the lead off; put the whole,
                // untouched candidate back rather than lose track of
                // it.
                candidate.set_state(cache.state);
                cache.with_eset(|eset| eset.insert(candidate));
                return None;
            }
        }
    } else {
        candidate
    };

    let trailsize = main.size() - size;
    if trailsize == 0 {
        return Some(main);
    }

    if cant_split {
        main.set_state(cache.state);
        cache.with_eset(|eset| eset.insert(main));
        return None;
    }

    match split_merge::split(hooks, pool, emap, &main, size) {
        SplitOutcome::Ok(trail) => {
            trail.set_state(cache.state);
            cache.with_eset(|eset| eset.insert(trail));
            Some(main)
        }
        _ => {
            // Couldn't trim the trail off; `main` is still a fully
            // valid (if oversized) extent, so hand it back to the
            // cache unsplit instead of abandoning it.
            main.set_state(cache.state);
            cache.with_eset(|eset| eset.insert(main));
            None
        }
    }
}

fn commit_if_needed(hooks: &dyn Hooks, cache: &Ecache, edata: EdataHandle, zero: bool) -> Option<EdataHandle> {
    if !edata.committed() {
        if hooks.commit(edata.base(), edata.size(), 0, edata.size()).is_err() {
            log::warn!("commit failed for {:#x}, returning extent to its cache", edata.base());
            edata.set_state(cache.state);
            cache.with_eset(|eset| eset.insert(edata));
            return None;
        }
        edata.set_committed(true);
        edata.set_zeroed(true);
    }

    if zero && !edata.zeroed() {
        hooks.zero(edata.base(), edata.size());
        edata.set_zeroed(true);
    }

    edata.set_state(ExtentState::Active);
    Some(edata)
}
