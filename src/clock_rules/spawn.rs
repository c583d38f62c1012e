//! Spawn clock rule
//!
//! The child routine starts with a copy of the parent's pre-spawn clock, then
//! both tick their own components: everything the parent did before the spawn
//! happens-before everything the child does.

use crate::state::AnalysisState;
use crate::trace::element::RoutineId;

pub fn apply(state: &mut AnalysisState, parent: RoutineId, child: RoutineId) {
    let inherited = state.clock(parent).clone();
    if child >= 1 && child <= state.n_routines {
        state.set_clock(child, inherited);
        state.clock_mut(child).inc(child);
    }
    state.clock_mut(parent).inc(parent);
}
