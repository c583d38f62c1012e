//! One-shot (once) clock rules
//!
//! The execution that wins the one-shot publishes its clock; every later
//! attempt observes the winner's effects and orders after it.

use crate::state::AnalysisState;
use crate::trace::element::{ObjectId, RoutineId};

pub fn apply(state: &mut AnalysisState, routine: RoutineId, id: ObjectId, winner: bool) {
    if winner {
        state.clock_mut(routine).inc(routine);
        let own = state.clock(routine).clone();
        state.once_winner.insert(id, own);
    } else {
        if let Some(w) = state.once_winner.get(&id).cloned() {
            state.clock_mut(routine).sync(&w);
        }
        state.clock_mut(routine).inc(routine);
    }
}
