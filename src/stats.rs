//! Profile-dump counters and decay/abandonment bookkeeping.
//! `curpages`/`highpages` are process-wide atomics with relaxed
//! ordering; the high-water tracker deliberately does not refresh its
//! local snapshot of `cur` on a failed compare-and-swap, trading exact
//! maxima for eventual consistency.
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct Stats {
    curpages: AtomicUsize,
    highpages: AtomicUsize,
    /// Bytes deliberately leaked because the descriptor pool was
    /// exhausted mid-split and the fragment's index state was
    /// ambiguous.
    pub abandoned_vm: AtomicU64,
    /// Pages lazily purged across the lifetime of the process.
    pub decay_dirty_purged: AtomicU64,
    /// Pages forcibly purged (decommitted or madvise(DONTNEED)-style)
    /// across the lifetime of the process.
    pub decay_muzzy_purged: AtomicU64,
}

impl Stats {
    pub fn new() -> Stats {
        Stats::default()
    }

    /// Adds `delta` pages to the current count, bumping the
    /// high-water mark if needed.  Called when an extent moves into
    /// `active`.
    pub fn add_pages(&self, delta: usize) {
        let cur = self.curpages.fetch_add(delta, Ordering::Relaxed) + delta;
        self.update_highpages(cur);
    }

    /// Subtracts `delta` pages from the current count.  Called when
    /// an extent leaves `active`.
    pub fn sub_pages(&self, delta: usize) {
        self.curpages.fetch_sub(delta, Ordering::Relaxed);
    }

    fn update_highpages(&self, cur: usize) {
        let mut high = self.highpages.load(Ordering::Relaxed);
        while cur > high {
            match self.highpages.compare_exchange_weak(
                high,
                cur,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                // Intentionally do not refresh `high` from the
                // failure witness: another thread may have already
                // pushed it past `cur`, in which case looping again
                // with a stale `high` just exits via the `while`
                // guard on the next read.
                Err(_) => high = self.highpages.load(Ordering::Relaxed),
            }
        }
    }

    pub fn curpages(&self) -> usize {
        self.curpages.load(Ordering::Relaxed)
    }

    pub fn highpages(&self) -> usize {
        self.highpages.load(Ordering::Relaxed)
    }

    pub fn abandoned_vm(&self) -> u64 {
        self.abandoned_vm.load(Ordering::Relaxed)
    }

    pub fn record_abandonment(&self, bytes: u64) {
        self.abandoned_vm.fetch_add(bytes, Ordering::Relaxed);
        log::warn!("abandoning {} bytes of VM after pool exhaustion", bytes);
    }
}
