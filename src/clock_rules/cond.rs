//! Condition-variable clock rules
//!
//! Signal and Broadcast record the signaling routine's clock as the
//! condition's release clock; a Wait that completes orders after the release
//! that woke it.

use crate::state::AnalysisState;
use crate::trace::element::{ObjectId, RoutineId};

/// Completed wait: orders after the last recorded release
pub fn wait(state: &mut AnalysisState, routine: RoutineId, id: ObjectId) {
    if let Some(release) = state.cond_release.get(&id).cloned() {
        state.clock_mut(routine).sync(&release);
    }
    state.clock_mut(routine).inc(routine);
}

/// Signal or Broadcast: publish a new release clock
pub fn release(state: &mut AnalysisState, routine: RoutineId, id: ObjectId) {
    state.clock_mut(routine).inc(routine);
    let own = state.clock(routine).clone();
    state.cond_release.insert(id, own);
}
