//! The extent cache: an `Eset` bound to a
//! single lifecycle state, guarded by its own mutex, plus the
//! `delay_coalesce` policy flag.  `Ecache` itself only owns the
//! container; `alloc`/`alloc_grow`/`dalloc`/`evict` are free functions
//! in `recycle.rs`/`grow.rs`/`record.rs`/`dalloc.rs` that take the
//! relevant `Ecache` alongside the rest of the page allocator core —
//! mirroring jemalloc's own `ecache_alloc(tsdn, pac, ehooks, ecache,
//! ...)` signature shape, where the cache is just one argument among
//! several shared resources.
use std::sync::Mutex;

use crate::edata::ExtentState;
use crate::eset::Eset;

#[derive(Debug)]
pub struct Ecache {
    pub state: ExtentState,
    pub delay_coalesce: bool,
    pub arena_ind: u32,
    eset: Mutex<Eset>,
}

impl Ecache {
    pub fn new(state: ExtentState, delay_coalesce: bool, arena_ind: u32, page_size: usize) -> Ecache {
        Ecache {
            state,
            delay_coalesce,
            arena_ind,
            eset: Mutex::new(Eset::new(page_size)),
        }
    }

    /// Runs `f` with exclusive access to this cache's `Eset`, holding
    /// the cache mutex for the duration.  Every `Eset` operation in
    /// the crate goes through here, so this is the one place that
    /// enforces "all `Eset` operations assume the enclosing cache's
    /// mutex is held."
    pub fn with_eset<R>(&self, f: impl FnOnce(&mut Eset) -> R) -> R {
        let mut guard = self.eset.lock().unwrap();
        f(&mut guard)
    }

    pub fn npages(&self) -> usize {
        self.eset.lock().unwrap().npages()
    }

    pub fn is_empty(&self) -> bool {
        self.eset.lock().unwrap().is_empty()
    }
}
