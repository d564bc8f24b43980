//! The OS interface hooks contract: raw
//! alloc/dalloc/commit/decommit/purge/split/merge/zero/destroy.
//!
//! Shaped the way a `#[contract_trait]`-annotated trait with one
//! default implementation delegating to OS primitives is usually built
//! in this codebase, using the global allocator directly the way a
//! `System.alloc` call site does.  `SystemHooks` plays the default
//! implementation's role here: since this core's job is extent
//! management rather than talking to `mmap` itself, backing pages with
//! the process's global allocator is a faithful enough stand-in to
//! exercise every path described above, with fault-injection
//! switches so dalloc-cascade and split/merge-rejection tests don't
//! need a real OS underneath them.
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

use std::alloc::Layout;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

#[allow(clippy::inline_fn_without_body)]
#[contract_trait]
pub trait Hooks: std::fmt::Debug + Send + Sync {
    /// The mapping granularity hooks operate at.  Must be a power of
    /// two.
    #[ensures(ret > 0 && ret & (ret - 1) == 0, "page size must be a power of 2")]
    fn page_size(&self) -> usize;

    /// Obtains `size` bytes of VM, `alignment`-aligned.  `new_addr`
    /// is advisory; a hooks implementation that cannot honor it
    /// simply allocates elsewhere.  Sets `*zeroed`/`*committed` to
    /// reflect what the OS actually handed back.
    #[requires(size > 0 && size % self.page_size() == 0)]
    #[requires(alignment > 0 && alignment % self.page_size() == 0)]
    fn alloc(
        &self,
        new_addr: Option<usize>,
        size: usize,
        alignment: usize,
        zeroed: &mut bool,
        committed: &mut bool,
    ) -> Option<usize>;

    /// Fully releases a range obtained from `alloc`.
    fn dalloc(&self, addr: usize, size: usize, committed: bool) -> Result<(), ()>;

    /// Fast-path predicate: true when `dalloc` is known to always
    /// fail on this platform (so callers can skip straight to the
    /// purge cascade).
    fn dalloc_will_fail(&self) -> bool;

    fn commit(&self, addr: usize, total_size: usize, offset: usize, length: usize) -> Result<(), ()>;
    fn decommit(&self, addr: usize, total_size: usize, offset: usize, length: usize) -> Result<(), ()>;
    fn purge_lazy(&self, addr: usize, total_size: usize, offset: usize, length: usize) -> Result<(), ()>;
    fn purge_forced(&self, addr: usize, total_size: usize, offset: usize, length: usize) -> Result<(), ()>;

    fn split(&self, addr: usize, total: usize, a: usize, b: usize, committed: bool) -> Result<(), ()>;
    fn split_will_fail(&self) -> bool;

    fn merge(
        &self,
        base_a: usize,
        size_a: usize,
        head_a: bool,
        base_b: usize,
        size_b: usize,
        head_b: bool,
        committed: bool,
    ) -> Result<(), ()>;

    fn zero(&self, addr: usize, size: usize);
    fn destroy(&self, addr: usize, size: usize, committed: bool);
}

#[derive(Debug, Default)]
struct Counters {
    alloc: AtomicUsize,
    dalloc: AtomicUsize,
    commit: AtomicUsize,
    decommit: AtomicUsize,
    purge_lazy: AtomicUsize,
    purge_forced: AtomicUsize,
}

/// Backs `alloc`/`dalloc`/`zero` with the process's global allocator
/// at page granularity; treats `commit`/`decommit`/`purge_*` as
/// accounting-only, since there is no OS page table to manipulate
/// above the global allocator.
#[derive(Debug)]
pub struct SystemHooks {
    page_size: usize,
    counters: Counters,
    live: Mutex<HashMap<usize, Layout>>,
    force_dalloc_fail: AtomicBool,
    force_split_fail: AtomicBool,
    force_merge_fail: AtomicBool,
}

impl SystemHooks {
    pub fn new(page_size: usize) -> SystemHooks {
        SystemHooks {
            page_size,
            counters: Counters::default(),
            live: Mutex::new(HashMap::new()),
            force_dalloc_fail: AtomicBool::new(false),
            force_split_fail: AtomicBool::new(false),
            force_merge_fail: AtomicBool::new(false),
        }
    }

    pub fn alloc_count(&self) -> usize {
        self.counters.alloc.load(Ordering::Relaxed)
    }

    pub fn dalloc_count(&self) -> usize {
        self.counters.dalloc.load(Ordering::Relaxed)
    }

    pub fn purge_forced_count(&self) -> usize {
        self.counters.purge_forced.load(Ordering::Relaxed)
    }

    pub fn purge_lazy_count(&self) -> usize {
        self.counters.purge_lazy.load(Ordering::Relaxed)
    }

    /// Makes every subsequent `dalloc` call fail, forcing callers
    /// through the decommit/purge cascade.
    pub fn set_force_dalloc_fail(&self, fail: bool) {
        self.force_dalloc_fail.store(fail, Ordering::Relaxed);
    }

    pub fn set_force_split_fail(&self, fail: bool) {
        self.force_split_fail.store(fail, Ordering::Relaxed);
    }

    pub fn set_force_merge_fail(&self, fail: bool) {
        self.force_merge_fail.store(fail, Ordering::Relaxed);
    }
}

impl Default for SystemHooks {
    fn default() -> Self {
        SystemHooks::new(4096)
    }
}

#[contract_trait]
impl Hooks for SystemHooks {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn alloc(
        &self,
        _new_addr: Option<usize>,
        size: usize,
        alignment: usize,
        zeroed: &mut bool,
        committed: &mut bool,
    ) -> Option<usize> {
        let layout = Layout::from_size_align(size, alignment).ok()?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            log::warn!("SystemHooks::alloc failed for size={} align={}", size, alignment);
            return None;
        }
        self.counters.alloc.fetch_add(1, Ordering::Relaxed);
        *zeroed = true;
        *committed = true;
        let addr = ptr as usize;
        self.live.lock().unwrap().insert(addr, layout);
        Some(addr)
    }

    fn dalloc(&self, addr: usize, _size: usize, _committed: bool) -> Result<(), ()> {
        if self.force_dalloc_fail.load(Ordering::Relaxed) {
            return Err(());
        }
        let layout = self.live.lock().unwrap().remove(&addr).ok_or(())?;
        unsafe { std::alloc::dealloc(addr as *mut u8, layout) };
        self.counters.dalloc.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn dalloc_will_fail(&self) -> bool {
        self.force_dalloc_fail.load(Ordering::Relaxed)
    }

    fn commit(&self, _addr: usize, _total_size: usize, _offset: usize, _length: usize) -> Result<(), ()> {
        self.counters.commit.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn decommit(&self, _addr: usize, _total_size: usize, _offset: usize, _length: usize) -> Result<(), ()> {
        self.counters.decommit.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn purge_lazy(&self, addr: usize, _total_size: usize, offset: usize, length: usize) -> Result<(), ()> {
        self.counters.purge_lazy.fetch_add(1, Ordering::Relaxed);
        self.zero((addr as usize) + offset, length);
        Ok(())
    }

    fn purge_forced(&self, addr: usize, _total_size: usize, offset: usize, length: usize) -> Result<(), ()> {
        self.counters.purge_forced.fetch_add(1, Ordering::Relaxed);
        self.zero(addr + offset, length);
        Ok(())
    }

    fn split(&self, _addr: usize, _total: usize, _a: usize, _b: usize, _committed: bool) -> Result<(), ()> {
        if self.force_split_fail.load(Ordering::Relaxed) {
            return Err(());
        }
        // The global allocator backs the whole range as one
        // allocation already; splitting is purely a bookkeeping
        // change in the descriptors above this hook.
        Ok(())
    }

    fn split_will_fail(&self) -> bool {
        self.force_split_fail.load(Ordering::Relaxed)
    }

    fn merge(
        &self,
        _base_a: usize,
        _size_a: usize,
        _head_a: bool,
        _base_b: usize,
        _size_b: usize,
        head_b: bool,
        _committed: bool,
    ) -> Result<(), ()> {
        if head_b || self.force_merge_fail.load(Ordering::Relaxed) {
            return Err(());
        }
        Ok(())
    }

    fn zero(&self, addr: usize, size: usize) {
        if size == 0 {
            return;
        }
        unsafe { std::ptr::write_bytes(addr as *mut u8, 0, size) };
    }

    fn destroy(&self, addr: usize, size: usize, committed: bool) {
        let _ = self.dalloc(addr, size, committed);
    }
}
