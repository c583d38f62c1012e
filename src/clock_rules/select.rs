//! Multiplexed-wait (select) clock rules
//!
//! A select that resolved to a channel case behaves exactly as that case's
//! channel rule; the driver dispatches into [`super::channel`] for it. Only
//! the degenerate outcomes live here: a default branch and a blocked wait
//! both just tick the routine clock (no communication happened). The
//! non-chosen cases of a blocked wait are registered by the driver for
//! partner search in the post-pass.

use crate::state::AnalysisState;
use crate::trace::element::RoutineId;

/// Default branch ran: no communication, local step only
pub fn default_branch(state: &mut AnalysisState, routine: RoutineId) {
    state.clock_mut(routine).inc(routine);
}

/// The wait never resolved: local step only
pub fn blocked(state: &mut AnalysisState, routine: RoutineId) {
    state.clock_mut(routine).inc(routine);
}
