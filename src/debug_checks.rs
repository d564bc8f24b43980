//! Debug-only double-registration / overlap sanity net, independent of
//! `Emap`'s own load-bearing overlap check so a bug in one does not
//! hide a bug in the other.
//!
//! A `BTreeMap` plus a `predecessor()`-by-`range(..=key)` lookup over a
//! flat set of non-overlapping live extent ranges. Kept per-instance
//! rather than behind a process-wide global, so one `Pac`'s checks can
//! never cross-contaminate another's.
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Clone, Copy, Debug)]
struct Range {
    begin: usize,
    size: usize,
}

#[derive(Debug, Default)]
pub struct DebugChecker {
    live: Mutex<BTreeMap<usize, Range>>,
}

impl DebugChecker {
    pub fn new() -> DebugChecker {
        DebugChecker::default()
    }

    fn predecessor(map: &BTreeMap<usize, Range>, addr: usize) -> Option<Range> {
        map.range(..=addr).next_back().map(|(_, r)| *r)
    }

    /// Records a freshly registered extent.  Fails if it overlaps a
    /// range already marked live.  A no-op outside debug builds.
    pub fn on_register(&self, base: usize, size: usize) -> Result<(), &'static str> {
        if !cfg!(debug_assertions) {
            return Ok(());
        }
        let mut map = self.live.lock().unwrap();
        if let Some(prev) = Self::predecessor(&map, base) {
            if base < prev.begin + prev.size {
                return Err("overlaps a previously registered live range");
            }
        }
        if let Some((&next_base, _)) = map.range(base..).next() {
            if base + size > next_base {
                return Err("overlaps the next registered live range");
            }
        }
        map.insert(base, Range { begin: base, size });
        Ok(())
    }

    /// Records that an extent is no longer live.  Fails if nothing
    /// was registered at exactly `base` (a double-free or a stale
    /// pointer).  A no-op outside debug builds.
    pub fn on_deregister(&self, base: usize) -> Result<(), &'static str> {
        if !cfg!(debug_assertions) {
            return Ok(());
        }
        self.live
            .lock()
            .unwrap()
            .remove(&base)
            .ok_or("deregistering an address with no matching registration")
            .map(|_| ())
    }
}
