//! Wait-group clock rules
//!
//! Every counter change (Add or Done) merges into one per-group "last change"
//! clock; Wait syncs against that merged clock. This causally links a Wait to
//! *every* change that could have contributed to the counter it observed,
//! which is exactly the over-approximation the negative-counter flow analysis
//! needs.

use crate::state::AnalysisState;
use crate::trace::element::{ObjectId, RoutineId};

/// Counter change (Add with positive delta, Done with negative)
pub fn change(state: &mut AnalysisState, routine: RoutineId, id: ObjectId) {
    state.clock_mut(routine).inc(routine);
    let own = state.clock(routine).clone();
    state
        .wg_change
        .entry(id)
        .and_modify(|c| c.sync(&own))
        .or_insert(own);
}

/// Wait for the counter to reach zero
pub fn wait(state: &mut AnalysisState, routine: RoutineId, id: ObjectId) {
    if let Some(merged) = state.wg_change.get(&id).cloned() {
        state.clock_mut(routine).sync(&merged);
    }
    state.clock_mut(routine).inc(routine);
}
