//! The extent descriptor: immutable identity plus mutable lifecycle
//! state, and the move-only handle that enforces an ownership
//! discipline where a descriptor is exclusively owned by whichever of
//! {caller, an `eset`, the boundary index..., a local operation} holds
//! it.
//!
//! `EdataHandle` plays the role a linear-reference wrapper plays for
//! raw allocated blocks: a `NonNull` wrapper that is neither `Copy`
//! nor `Clone`, so the type system forces exactly one owner to exist
//! at a time for any given descriptor.  Unlike a hard-aborting linear
//! reference, dropping a stray handle does not abort the process; it
//! logs and frees the descriptor's memory, since a hard panic here
//! cannot be validated without running the test suite.
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard};

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

/// The four lifecycle states an extent can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentState {
    Active,
    Dirty,
    Muzzy,
    Retained,
}

/// Provider tag.  This core only ever produces one kind of extent, but
/// the field exists so a future provider could be distinguished
/// without breaking the descriptor's layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pai {
    Pac,
}

/// The mutable half of an extent descriptor.  Held behind a mutex so
/// that the boundary index can serialize identity-critical reads and
/// writes under a one-mutex-per-extent-descriptor discipline.
#[derive(Debug, Clone)]
pub(crate) struct EdataMut {
    pub base: usize,
    pub size: usize,
    pub arena_ind: u32,
    pub sn: u64,
    pub state: ExtentState,
    pub committed: bool,
    pub zeroed: bool,
    pub pai: Pai,
    pub is_head: bool,
}

#[derive(Debug)]
pub struct Edata {
    mutable: Mutex<EdataMut>,
}

impl Edata {
    pub(crate) fn new(fields: EdataMut) -> Edata {
        Edata {
            mutable: Mutex::new(fields),
        }
    }

    /// Overwrites every field.  Used when the descriptor pool hands
    /// out a recycled, previously-`put`-back `Edata` for a brand new
    /// range.
    pub(crate) fn reinit(&self, fields: EdataMut) {
        *self.mutable.lock().unwrap() = fields;
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EdataMut> {
        self.mutable.lock().unwrap()
    }

    pub fn base(&self) -> usize {
        self.lock().base
    }

    pub fn size(&self) -> usize {
        self.lock().size
    }

    pub fn end(&self) -> usize {
        let g = self.lock();
        g.base + g.size
    }

    pub fn arena_ind(&self) -> u32 {
        self.lock().arena_ind
    }

    pub fn sn(&self) -> u64 {
        self.lock().sn
    }

    pub fn state(&self) -> ExtentState {
        self.lock().state
    }

    pub fn committed(&self) -> bool {
        self.lock().committed
    }

    pub fn zeroed(&self) -> bool {
        self.lock().zeroed
    }

    pub fn pai(&self) -> Pai {
        self.lock().pai
    }

    pub fn is_head(&self) -> bool {
        self.lock().is_head
    }

    pub fn contains(&self, addr: usize) -> bool {
        let g = self.lock();
        addr >= g.base && addr < g.base + g.size
    }

    #[requires(matches!(new_state, ExtentState::Active | ExtentState::Dirty | ExtentState::Muzzy | ExtentState::Retained))]
    pub(crate) fn set_state(&self, new_state: ExtentState) {
        self.lock().state = new_state;
    }

    pub(crate) fn set_committed(&self, committed: bool) {
        self.lock().committed = committed;
    }

    /// Invariant 5: cleared on any caller-visible mutation of the
    /// range's contents.
    pub(crate) fn set_zeroed(&self, zeroed: bool) {
        self.lock().zeroed = zeroed;
    }

    /// Two extents may merge only if invariant 7 holds: same arena,
    /// same `pai`, same `committed`, same target state, and the
    /// right-hand side is not a head.
    pub(crate) fn can_coalesce_with(&self, other: &Edata, target_state: ExtentState) -> bool {
        let a = self.lock();
        let b = other.lock();
        a.arena_ind == b.arena_ind
            && a.pai == b.pai
            && a.committed == b.committed
            && a.state == target_state
            && b.state == target_state
            && !b.is_head
    }
}

/// Move-only owning handle to a heap-allocated `Edata`.  At most one
/// of {a caller, an `Eset`, a local split/merge operation} may hold
/// this at a time; the boundary index instead stores a non-owning
/// `NonNull<Edata>` obtained via `EdataHandle::weak_ref`.
#[derive(Debug)]
pub struct EdataHandle(NonNull<Edata>);

// An `Edata`'s own mutex makes the pointee safe to move between
// threads; only one `EdataHandle` ever exists for a given pointee at
// a time, so there is no aliasing to worry about beyond what the
// mutex already serializes.
unsafe impl Send for EdataHandle {}

impl EdataHandle {
    pub(crate) fn from_boxed(edata: Edata) -> EdataHandle {
        let boxed = Box::new(edata);
        EdataHandle(NonNull::new(Box::into_raw(boxed)).expect("Box pointer is never null"))
    }

    /// Returns a non-owning pointer suitable for storage in the
    /// boundary index.  The caller must never let this pointer
    /// outlive the owning `EdataHandle`.
    pub(crate) fn weak_ref(&self) -> NonNull<Edata> {
        self.0
    }

    /// Reconstructs ownership from a pointer obtained via
    /// `into_raw`.  Must only be called once per `into_raw` call.
    pub(crate) unsafe fn from_raw(ptr: NonNull<Edata>) -> EdataHandle {
        EdataHandle(ptr)
    }

    /// Releases ownership without running `Drop`, returning the raw
    /// pointer.  Used when transferring ownership into a data
    /// structure that cannot hold `EdataHandle` directly (none of the
    /// current call sites need this; kept for symmetry with
    /// `from_raw` and for future external-interface adapters).
    #[allow(dead_code)]
    pub(crate) fn into_raw(self) -> NonNull<Edata> {
        let ptr = self.0;
        std::mem::forget(self);
        ptr
    }
}

impl std::ops::Deref for EdataHandle {
    type Target = Edata;

    fn deref(&self) -> &Edata {
        unsafe { self.0.as_ref() }
    }
}

impl Drop for EdataHandle {
    fn drop(&mut self) {
        log::debug!("EdataHandle dropped without being returned to a cache or pool");
        unsafe {
            drop(Box::from_raw(self.0.as_ptr()));
        }
    }
}

static_assertions::assert_not_impl_any!(EdataHandle: Clone, Copy);

#[cfg(test)]
mod test {
    use super::*;

    fn handle(base: usize, size: usize) -> EdataHandle {
        EdataHandle::from_boxed(Edata::new(EdataMut {
            base,
            size,
            arena_ind: 0,
            sn: 0,
            state: ExtentState::Active,
            committed: true,
            zeroed: true,
            pai: Pai::Pac,
            is_head: true,
        }))
    }

    #[test]
    fn accessors_roundtrip() {
        let h = handle(4096, 8192);
        assert_eq!(h.base(), 4096);
        assert_eq!(h.size(), 8192);
        assert_eq!(h.end(), 12288);
        assert!(h.contains(4096));
        assert!(h.contains(12287));
        assert!(!h.contains(12288));
    }

    #[test]
    fn can_coalesce_with_requires_matching_state_and_not_head() {
        let a = handle(0, 4096);
        let b = handle(4096, 4096);
        a.set_state(ExtentState::Dirty);
        b.set_state(ExtentState::Dirty);
        b.lock().is_head = false;
        assert!(a.can_coalesce_with(&b, ExtentState::Dirty));

        b.lock().is_head = true;
        assert!(!a.can_coalesce_with(&b, ExtentState::Dirty));
    }

    #[test]
    fn reinit_overwrites_every_field() {
        let h = handle(0, 4096);
        h.reinit(EdataMut {
            base: 999,
            size: 111,
            arena_ind: 2,
            sn: 7,
            state: ExtentState::Retained,
            committed: false,
            zeroed: false,
            pai: Pai::Pac,
            is_head: false,
        });
        assert_eq!(h.base(), 999);
        assert_eq!(h.sn(), 7);
        assert_eq!(h.state(), ExtentState::Retained);
    }
}
