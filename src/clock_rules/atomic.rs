//! Atomic operation clock rules
//!
//! One "last write" clock per atomic variable. A load orders after the last
//! write it could have observed; read-modify-write operations (add, swap) act
//! as both.

use crate::state::AnalysisState;
use crate::trace::element::{AtomicOp, ObjectId, RoutineId};

pub fn apply(state: &mut AnalysisState, routine: RoutineId, id: ObjectId, op: AtomicOp) {
    let reads = matches!(op, AtomicOp::Load | AtomicOp::Add | AtomicOp::Swap);
    let writes = matches!(op, AtomicOp::Store | AtomicOp::Add | AtomicOp::Swap);
    if reads {
        if let Some(lw) = state.atomic_last_write.get(&id).cloned() {
            state.clock_mut(routine).sync(&lw);
        }
    }
    state.clock_mut(routine).inc(routine);
    if writes {
        let own = state.clock(routine).clone();
        state.atomic_last_write.insert(id, own);
    }
}
