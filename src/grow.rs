//! The retained-growth engine: obtains fresh VM from the OS in a
//! geometric series when no cached extent fits, guarded by a grow
//! mutex distinct from any `Ecache` mutex.
//!
//! The growth-series table lives on `Config` (`Config::growth_series`)
//! rather than behind a process-wide global, since it is
//! `Pac`-instance-specific configuration; every call site supplies its
//! own for both production and testing.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::ecache::Ecache;
use crate::edata::{Edata, EdataHandle, EdataMut, ExtentState, Pai};
use crate::edata_cache::EdataCache;
use crate::emap::Emap;
use crate::eset::align_up;
use crate::hooks::Hooks;
use crate::split_merge::{self, SplitOutcome};
use crate::stats::Stats;

#[derive(Debug, Default)]
pub struct Grow {
    cursor: Mutex<usize>,
}

impl Grow {
    pub fn new() -> Grow {
        Grow::default()
    }

    pub fn cursor(&self) -> usize {
        *self.cursor.lock().unwrap()
    }
}

/// `size + page_ceil(align) - page_size`, guarding against overflow.
fn alloc_size_min(size: usize, align: usize, page_size: usize) -> Option<usize> {
    let page_ceil_align = align_up(align, page_size);
    size.checked_add(page_ceil_align)?.checked_sub(page_size)
}

#[allow(clippy::too_many_arguments)]
pub fn grow_retained(
    hooks: &dyn Hooks,
    pool: &dyn EdataCache,
    emap: &Emap,
    retained: &Ecache,
    grow: &Grow,
    stats: &Stats,
    series: &[usize],
    page_size: usize,
    arena_ind: u32,
    sn_counter: &AtomicU64,
    size: usize,
    align: usize,
) -> Option<EdataHandle> {
    let guard = grow.cursor.lock().unwrap();
    let alloc_size_min = alloc_size_min(size, align, page_size)?;

    // Stage the cursor advance locally; it is only written back to
    // `grow.cursor` on full success, so a failed attempt is retried at
    // the same series step next time.
    let mut cursor = *guard;
    while cursor < series.len() && series[cursor] < alloc_size_min {
        cursor += 1;
    }
    if cursor >= series.len() {
        log::debug!("retained-growth series exhausted at alloc_size_min={}", alloc_size_min);
        return None;
    }
    let alloc_size = series[cursor];

    let mut zeroed = false;
    let mut committed = false;
    let addr = hooks.alloc(None, alloc_size, page_size, &mut zeroed, &mut committed)?;

    let descriptor = match pool.get() {
        Some(d) => d,
        None => {
            let _ = hooks.dalloc(addr, alloc_size, committed);
            return None;
        }
    };
    descriptor.reinit(EdataMut {
        base: addr,
        size: alloc_size,
        arena_ind,
        sn: sn_counter.fetch_add(1, Ordering::Relaxed),
        state: ExtentState::Active,
        committed,
        zeroed,
        pai: Pai::Pac,
        is_head: true,
    });

    if emap.register(&descriptor).is_err() {
        let _ = hooks.dalloc(addr, alloc_size, committed);
        pool.put(descriptor);
        return None;
    }

    if committed && cfg!(debug_assertions) {
        debug_first_page_is_zero(&descriptor);
    }

    let leadsize = align_up(addr, align) - addr;
    let (lead, main) = if leadsize > 0 {
        match split_merge::split(hooks, pool, emap, &descriptor, leadsize) {
            SplitOutcome::Ok(rest) => (Some(descriptor), rest),
            _ => {
                abandon_whole_range(hooks, pool, emap, stats, descriptor, addr, alloc_size, committed);
                return None;
            }
        }
    } else {
        (None, descriptor)
    };
    if let Some(lead) = lead {
        lead.set_state(ExtentState::Retained);
        retained.with_eset(|eset| eset.insert(lead));
    }

    let trailsize = main.size() - size;
    let main = if trailsize > 0 {
        match split_merge::split(hooks, pool, emap, &main, size) {
            SplitOutcome::Ok(trail) => {
                trail.set_state(ExtentState::Retained);
                retained.with_eset(|eset| eset.insert(trail));
                main
            }
            _ => {
                // Could not carve the trail off; recycle the whole
                // remaining range into `retained` instead of losing
                // it, and report this attempt as failed.
                main.set_state(ExtentState::Retained);
                retained.with_eset(|eset| eset.insert(main));
                return None;
            }
        }
    } else {
        main
    };

    // Only now, with every fragment accounted for, persist the
    // cursor advance.
    drop(guard);
    *grow.cursor.lock().unwrap() = cursor;

    Some(main)
}

fn abandon_whole_range(
    hooks: &dyn Hooks,
    pool: &dyn EdataCache,
    emap: &Emap,
    stats: &Stats,
    descriptor: EdataHandle,
    addr: usize,
    size: usize,
    committed: bool,
) {
    emap.deregister(addr);
    if hooks.dalloc(addr, size, committed).is_ok() {
        pool.put(descriptor);
        return;
    }
    // Could not even free the freshly obtained range back to the OS;
    // fall through to a lazy-then-forced purge, the same cascade the
    // dalloc pipeline uses.
    if hooks.purge_lazy(addr, size, 0, size).is_ok() || hooks.purge_forced(addr, size, 0, size).is_ok() {
        pool.put(descriptor);
        return;
    }
    // Every release path failed: the range is deregistered and no
    // longer tracked by any cache, so it is lost for the life of the
    // process.
    stats.record_abandonment(size as u64);
    pool.put(descriptor);
}

fn debug_first_page_is_zero(descriptor: &Edata) {
    // Best-effort sanity check; `SystemHooks::alloc` always hands back
    // zeroed memory, so this should never fire for the shipped hooks
    // implementation. A custom hooks implementation that lies about
    // `zeroed` would trip it.
    if !descriptor.zeroed() {
        return;
    }
    let base = descriptor.base();
    let page = unsafe { std::slice::from_raw_parts(base as *const u8, 4096.min(descriptor.size())) };
    debug_assert!(page.iter().all(|&b| b == 0), "hooks reported zeroed but first page is not");
}
