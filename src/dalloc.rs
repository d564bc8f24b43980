//! The full-release path: try to hand the
//! range straight back to the OS, and if that fails, fall through
//! decommit, then forced purge, then lazy purge, before parking the
//! (possibly still-dirty) extent in `retained`.
//!
//! Shaped after a release/purge fallback chain, generalized from a
//! single `Result` return into a multi-step cascade.
use crate::config::Config;
use crate::ecache::Ecache;
use crate::edata::{EdataHandle, ExtentState};
use crate::edata_cache::EdataCache;
use crate::emap::Emap;
use crate::hooks::Hooks;
use crate::record;
use crate::stats::Stats;

/// Releases `edata` fully if possible, otherwise pushes it through the
/// decommit/purge cascade and records it into `retained`.
pub fn dalloc(
    hooks: &dyn Hooks,
    pool: &dyn EdataCache,
    emap: &Emap,
    retained: &Ecache,
    stats: &Stats,
    config: &Config,
    edata: EdataHandle,
) {
    let base = edata.base();
    let size = edata.size();
    let committed = edata.committed();

    emap.deregister(base);

    if !hooks.dalloc_will_fail() && hooks.dalloc(base, size, committed).is_ok() {
        pool.put(edata);
        return;
    }

    // Direct release failed; the range is still live, so it must stay
    // indexed.
    if emap.register(&edata).is_err() {
        log::warn!("failed to reregister {:#x} after a failed dalloc", base);
    }

    purge_cascade(hooks, stats, config.page_size, ExtentState::Dirty, &edata, base, size, committed);
    record::record(hooks, pool, emap, retained, retained, stats, config, edata);
}

/// Drives a dirty, cached-but-large extent straight through the purge
/// cascade into `retained`, bypassing the dirty/muzzy caches entirely
/// (the oversize-threshold shortcut).
pub fn maximally_purge(
    hooks: &dyn Hooks,
    pool: &dyn EdataCache,
    emap: &Emap,
    retained: &Ecache,
    stats: &Stats,
    config: &Config,
    edata: EdataHandle,
) {
    let base = edata.base();
    let size = edata.size();
    let committed = edata.committed();

    purge_cascade(hooks, stats, config.page_size, ExtentState::Dirty, &edata, base, size, committed);
    record::record(hooks, pool, emap, retained, retained, stats, config, edata);
}

/// Steps 3-6 of the dalloc pipeline: not-committed implies zeroed,
/// else try decommit, else forced purge, else lazy purge (accepted
/// unconditionally when the extent's origin state was already
/// `Muzzy`, since muzzy extents are allowed to stay dirty-looking).
fn purge_cascade(
    hooks: &dyn Hooks,
    stats: &Stats,
    page_size: usize,
    origin: ExtentState,
    edata: &EdataHandle,
    base: usize,
    size: usize,
    committed: bool,
) {
    let pages = (size / page_size) as u64;

    if !committed {
        edata.set_zeroed(true);
        return;
    }

    if hooks.decommit(base, size, 0, size).is_ok() {
        edata.set_committed(false);
        edata.set_zeroed(true);
        bump_purge_stat(stats, origin, pages);
        return;
    }

    if hooks.purge_forced(base, size, 0, size).is_ok() {
        edata.set_zeroed(true);
        bump_purge_stat(stats, origin, pages);
        return;
    }

    if origin == ExtentState::Muzzy || hooks.purge_lazy(base, size, 0, size).is_ok() {
        // Lazily purged (or already muzzy, where an unpurged dirty
        // look is tolerated): leave `zeroed` as-is.
        bump_purge_stat(stats, origin, pages);
        return;
    }

    log::debug!("every purge step failed for {:#x}, recording as-is", base);
}

fn bump_purge_stat(stats: &Stats, origin: ExtentState, pages: u64) {
    if origin == ExtentState::Muzzy {
        stats.decay_muzzy_purged.fetch_add(pages, std::sync::atomic::Ordering::Relaxed);
    } else {
        stats.decay_dirty_purged.fetch_add(pages, std::sync::atomic::Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::edata::{Edata, EdataMut, Pai};
    use crate::edata_cache::BoxEdataCache;
    use crate::hooks::SystemHooks;

    fn active(base: usize, size: usize) -> EdataHandle {
        EdataHandle::from_boxed(Edata::new(EdataMut {
            base,
            size,
            arena_ind: 0,
            sn: 0,
            state: ExtentState::Active,
            committed: true,
            zeroed: false,
            pai: Pai::Pac,
            is_head: true,
        }))
    }

    #[test]
    fn successful_dalloc_frees_directly() {
        let hooks = SystemHooks::new(4096);
        let pool = BoxEdataCache::new();
        let emap = Emap::new();
        let retained = Ecache::new(ExtentState::Retained, false, 0, 4096);
        let cfg = Config::default_for_page_size(4096);
        let stats = Stats::new();

        let mut zeroed = false;
        let mut committed = false;
        let addr = hooks.alloc(None, 4096, 4096, &mut zeroed, &mut committed).unwrap();
        let edata = active(addr, 4096);
        emap.register(&edata).unwrap();

        dalloc(&hooks, &pool, &emap, &retained, &stats, &cfg, edata);
        assert_eq!(hooks.dalloc_count(), 1);
        assert!(retained.is_empty());
        assert!(emap.lookup(addr).is_none());
    }

    #[test]
    fn failed_dalloc_falls_through_to_retained() {
        let hooks = SystemHooks::new(4096);
        let pool = BoxEdataCache::new();
        let emap = Emap::new();
        let retained = Ecache::new(ExtentState::Retained, false, 0, 4096);
        let cfg = Config::default_for_page_size(4096);
        let stats = Stats::new();

        let mut zeroed = false;
        let mut committed = false;
        let addr = hooks.alloc(None, 4096, 4096, &mut zeroed, &mut committed).unwrap();
        let edata = active(addr, 4096);
        emap.register(&edata).unwrap();

        hooks.set_force_dalloc_fail(true);
        dalloc(&hooks, &pool, &emap, &retained, &stats, &cfg, edata);

        assert_eq!(retained.npages(), 1);
        assert!(emap.lookup(addr).is_some());
        assert_eq!(stats.decay_dirty_purged.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
