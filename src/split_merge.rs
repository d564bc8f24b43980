//! Split and merge primitives: the only place a descriptor's boundary
//! actually moves.  Both operations coordinate the descriptor pool,
//! the boundary index, and the hooks, and both must leave every
//! structure consistent on failure.
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

use crate::edata::{EdataHandle, EdataMut};
use crate::edata_cache::EdataCache;
use crate::emap::Emap;
use crate::hooks::Hooks;

pub enum SplitOutcome {
    Ok(EdataHandle),
    /// The requested split point does not fit inside the parent; an
    /// implementation bug in the caller.
    CantAlloc,
    /// The descriptor pool was exhausted or the hooks rejected the
    /// split.  The parent is left untouched.
    Error,
}

/// Splits `parent` at offset `a`, producing a trailing descriptor of
/// size `parent.size() - a`.  On success, `parent`'s recorded size
/// shrinks to `a` and the trail is registered in `emap`.
#[requires(a > 0)]
pub fn split(
    hooks: &dyn Hooks,
    pool: &dyn EdataCache,
    emap: &Emap,
    parent: &EdataHandle,
    a: usize,
) -> SplitOutcome {
    let total = parent.size();
    if a >= total {
        return SplitOutcome::CantAlloc;
    }
    let b = total - a;

    let trail = match pool.get() {
        Some(t) => t,
        None => return SplitOutcome::Error,
    };

    if emap.split_prepare().is_err() {
        pool.put(trail);
        return SplitOutcome::Error;
    }

    let parent_base = parent.base();
    let (arena_ind, sn, state, committed, zeroed, pai) = {
        let g = parent.lock();
        (g.arena_ind, g.sn, g.state, g.committed, g.zeroed, g.pai)
    };
    trail.reinit(EdataMut {
        base: parent_base + a,
        size: b,
        arena_ind,
        sn,
        state,
        committed,
        zeroed,
        pai,
        is_head: false,
    });

    let (mut parent_guard, _trail_guard) = emap.lock_edata2(parent, &trail);

    match hooks.split(parent_base, total, a, b, committed) {
        Ok(()) => {
            parent_guard.size = a;
            drop(parent_guard);
            drop(_trail_guard);
            // A freshly derived trail can never overlap an existing
            // registration, so indexing it cannot fail in practice;
            // the boundary index's overlap check exists for programmer
            // error elsewhere, not for this call site.
            debug_assert!(emap.split_commit(&trail).is_ok());
            SplitOutcome::Ok(trail)
        }
        Err(()) => {
            drop(parent_guard);
            drop(_trail_guard);
            pool.put(trail);
            SplitOutcome::Error
        }
    }
}

/// Merges `b` into `a`.  On success `a` absorbs `b`'s size and `b`'s
/// descriptor is returned to the pool.  On failure, ownership of `b`
/// is handed back to the caller so it can be restored to its cache.
///
/// Callers are expected to have already checked `can_coalesce`
/// (invariant 6: `b` must not be a head); the hooks layer rejects a
/// head `b` too, as defense in depth.
pub fn merge(
    hooks: &dyn Hooks,
    pool: &dyn EdataCache,
    emap: &Emap,
    a: &EdataHandle,
    b: EdataHandle,
) -> Result<(), EdataHandle> {
    let (a_base, a_size, a_head, a_committed) = {
        let g = a.lock();
        (g.base, g.size, g.is_head, g.committed)
    };
    let (b_base, b_size, b_head) = {
        let g = b.lock();
        (g.base, g.size, g.is_head)
    };
    debug_assert_eq!(a_base + a_size, b_base, "merge operands must be adjacent");

    match hooks.merge(a_base, a_size, a_head, b_base, b_size, b_head, a_committed) {
        Err(()) => Err(b),
        Ok(()) => {
            if emap.merge_prepare().is_err() {
                return Err(b);
            }
            {
                let (mut ga, gb) = emap.lock_edata2(a, &b);
                ga.size += gb.size;
                ga.sn = ga.sn.min(gb.sn);
                ga.zeroed = ga.zeroed && gb.zeroed;
            }
            emap.merge_commit(b_base);
            pool.put(b);
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::edata::{Edata, ExtentState, Pai};
    use crate::edata_cache::BoxEdataCache;
    use crate::hooks::SystemHooks;

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
    fn split_shrinks_parent_and_registers_trail() {
        let hooks = SystemHooks::new(4096);
        let pool = BoxEdataCache::new();
        let emap = Emap::new();
        let parent = handle(0x1000, 8192);
        emap.register(&parent).unwrap();

        match split(&hooks, &pool, &emap, &parent, 4096) {
            SplitOutcome::Ok(trail) => {
                assert_eq!(parent.size(), 4096);
                assert_eq!(trail.base(), 0x2000);
                assert_eq!(trail.size(), 4096);
                assert!(emap.lookup(0x2000).is_some());
            }
            _ => panic!("expected a successful split"),
        }
    }

    #[test]
    fn split_and_merge_round_trip_to_original_shape() {
        let hooks = SystemHooks::new(4096);
        let pool = BoxEdataCache::new();
        let emap = Emap::new();
        let parent = handle(0x1000, 8192);
        emap.register(&parent).unwrap();

        let trail = match split(&hooks, &pool, &emap, &parent, 4096) {
            SplitOutcome::Ok(t) => t,
            _ => panic!("split failed"),
        };

        assert!(merge(&hooks, &pool, &emap, &parent, trail).is_ok());
        assert_eq!(parent.base(), 0x1000);
        assert_eq!(parent.size(), 8192);
        assert!(emap.lookup(0x2000).is_some());
        assert!(emap.lookup(0x1000).is_some());
    }

    #[test]
    fn merge_rejects_head_right_hand_operand() {
        let hooks = SystemHooks::new(4096);
        let pool = BoxEdataCache::new();
        let emap = Emap::new();
        let a = handle(0x1000, 4096);
        let b = handle(0x2000, 4096);
        emap.register(&a).unwrap();
        emap.register(&b).unwrap();

        let b = match merge(&hooks, &pool, &emap, &a, b) {
            Err(returned) => returned,
            Ok(()) => panic!("merge across a head boundary must be rejected"),
        };
        assert_eq!(b.base(), 0x2000);
    }

    use proptest::prelude::*;

    proptest! {
        // Splitting a parent at a random sequence of increasing offsets
        // and then merging every piece back in address order must
        // reproduce the original base and size, regardless of where
        // the cuts landed.
        #[test]
        fn chained_split_then_merge_restores_original_shape(
            cuts in prop::collection::btree_set(1usize..8, 0..4),
        ) {
            let hooks = SystemHooks::new(4096);
            let pool = BoxEdataCache::new();
            let emap = Emap::new();
            let whole = handle(0x10_0000, 8 * 4096);
            emap.register(&whole).unwrap();

            let mut pieces = vec![whole];
            let mut offset = 0usize;
            for cut in cuts {
                let cut_addr = cut * 4096;
                if cut_addr <= offset {
                    continue;
                }
                let last = pieces.pop().unwrap();
                let a = cut_addr - offset;
                match split(&hooks, &pool, &emap, &last, a) {
                    SplitOutcome::Ok(trail) => {
                        pieces.push(last);
                        pieces.push(trail);
                        offset = cut_addr;
                    }
                    _ => {
                        pieces.push(last);
                        break;
                    }
                }
            }

            prop_assert!(pieces.len() >= 1);
            let mut merged = pieces.remove(0);
            for piece in pieces {
                merged = match merge(&hooks, &pool, &emap, &merged, piece) {
                    Ok(()) => merged,
                    Err(_) => return Ok(()),
                };
            }
            prop_assert_eq!(merged.base(), 0x10_0000);
            prop_assert_eq!(merged.size(), 8 * 4096);
        }
    }
}
