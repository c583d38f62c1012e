//! Mutex and read-write-lock clock rules
//!
//! Two release clocks per lock: `rel_w` (last write release) and `rel_r`
//! (merged read releases). A write acquire orders after both; a read acquire
//! orders only after the last writer, so readers never serialize each other
//! but all precede the next writer.
//!
//! Under `ignore_critical_sections` the sync/publish steps are skipped
//! entirely; the routine clock still ticks so same-routine ordering survives.

use crate::state::AnalysisState;
use crate::trace::element::{MutexOp, ObjectId, RoutineId};

/// Acquire side (Lock/RLock and try variants)
///
/// A failed try attempt only ticks the routine clock: it created no ordering.
pub fn acquire(
    state: &mut AnalysisState,
    routine: RoutineId,
    id: ObjectId,
    op: MutexOp,
    success: bool,
    ignore_cs: bool,
) {
    debug_assert!(op.is_acquire());
    if success && !ignore_cs {
        if let Some(rel_w) = state.mutex_rel_w.get(&id).cloned() {
            state.clock_mut(routine).sync(&rel_w);
        }
        if !op.is_read() {
            if let Some(rel_r) = state.mutex_rel_r.get(&id).cloned() {
                state.clock_mut(routine).sync(&rel_r);
            }
        }
    }
    state.clock_mut(routine).inc(routine);
}

/// Release side (Unlock/RUnlock)
pub fn release(
    state: &mut AnalysisState,
    routine: RoutineId,
    id: ObjectId,
    op: MutexOp,
    ignore_cs: bool,
) {
    debug_assert!(!op.is_acquire());
    state.clock_mut(routine).inc(routine);
    if ignore_cs {
        return;
    }
    let own = state.clock(routine).clone();
    if op == MutexOp::RUnlock {
        // readers merge; they only fence the next writer
        state
            .mutex_rel_r
            .entry(id)
            .and_modify(|c| c.sync(&own))
            .or_insert(own);
    } else {
        state.mutex_rel_w.insert(id, own.clone());
        state.mutex_rel_r.insert(id, own);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_clock::{HappensBefore, VectorClock};

    #[test]
    fn test_lock_orders_after_unlock() {
        let mut state = AnalysisState::new(2);
        let snap_unlock = state.clock(1).clone();
        release(&mut state, 1, 9, MutexOp::Unlock, false);
        acquire(&mut state, 2, 9, MutexOp::Lock, true, false);
        assert_eq!(
            VectorClock::happens_before(&snap_unlock, state.clock(2)),
            HappensBefore::Before
        );
    }

    #[test]
    fn test_readers_do_not_serialize_each_other() {
        let mut state = AnalysisState::new(3);
        // writer releases, then two readers acquire
        release(&mut state, 1, 9, MutexOp::Unlock, false);
        acquire(&mut state, 2, 9, MutexOp::RLock, true, false);
        acquire(&mut state, 3, 9, MutexOp::RLock, true, false);
        let r2 = state.clock(2).clone();
        let r3 = state.clock(3).clone();
        assert_eq!(
            VectorClock::happens_before(&r2, &r3),
            HappensBefore::Concurrent
        );
    }

    #[test]
    fn test_read_unlocks_fence_next_writer() {
        let mut state = AnalysisState::new(3);
        acquire(&mut state, 1, 9, MutexOp::RLock, true, false);
        release(&mut state, 1, 9, MutexOp::RUnlock, false);
        acquire(&mut state, 2, 9, MutexOp::RLock, true, false);
        release(&mut state, 2, 9, MutexOp::RUnlock, false);
        let r1 = state.clock(1).clone();
        let r2 = state.clock(2).clone();
        acquire(&mut state, 3, 9, MutexOp::Lock, true, false);
        let w = state.clock(3);
        assert_eq!(VectorClock::happens_before(&r1, w), HappensBefore::Before);
        assert_eq!(VectorClock::happens_before(&r2, w), HappensBefore::Before);
    }

    #[test]
    fn test_failed_try_only_ticks() {
        let mut state = AnalysisState::new(2);
        release(&mut state, 1, 9, MutexOp::Unlock, false);
        acquire(&mut state, 2, 9, MutexOp::TryLock, false, false);
        // no sync happened: routine 2 saw nothing of routine 1
        assert_eq!(state.clock(2).get(1), 0);
        assert_eq!(state.clock(2).get(2), 1);
    }

    #[test]
    fn test_ignore_critical_sections_drops_edges() {
        let mut state = AnalysisState::new(2);
        release(&mut state, 1, 9, MutexOp::Unlock, true);
        acquire(&mut state, 2, 9, MutexOp::Lock, true, true);
        assert!(state.mutex_rel_w.is_empty());
        assert_eq!(state.clock(2).get(1), 0);
    }
}
