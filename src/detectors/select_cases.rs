//! Unmatched multiplexed-wait cases (post-pass)
//!
//! For every recorded select, each case other than the one that actually ran
//! is checked for a *potential* communication partner anywhere in the trace:
//! an opposite-direction operation on the case's channel, a case of another
//! select in the opposite direction, or a close for receive-direction cases.
//!
//! Cases with a partner that was simply never scheduled are a warning (S02) —
//! coverage the recorded run missed. Cases with no partner in the whole trace
//! are informational (S01): dead code unless the program is nondeterministic
//! in ways the trace does not show. One bug per select per class, carrying
//! all affected case indices.

use crate::bug::{Bug, BugCase, BugElement, BugKind};
use crate::state::AnalysisState;
use crate::trace::element::{ChannelOp, ChosenCase, ElementKind, SelectCase};
use crate::trace::Trace;
use tracing::debug;

/// Run the case check over all recorded selects
pub fn check(state: &mut AnalysisState, trace: &Trace) {
    let selects = std::mem::take(&mut state.selects);
    for &sel in &selects {
        let Some(elem) = trace.get(sel) else { continue };
        let ElementKind::Select { id, cases, chosen, .. } = &elem.kind else {
            continue;
        };
        let mut unscheduled = Vec::new();
        let mut untriggerable = Vec::new();
        for (i, case) in cases.iter().enumerate() {
            if matches!(chosen, ChosenCase::Case(c) if *c == i) {
                continue;
            }
            let target = if has_partner(trace, sel.routine, case) {
                &mut unscheduled
            } else {
                &mut untriggerable
            };
            target.push(BugCase {
                object_id: *id,
                object_type: "SS",
                case_index: i as i64,
            });
        }
        if unscheduled.is_empty() && untriggerable.is_empty() {
            continue;
        }
        let Some(snap) = BugElement::snapshot(trace, sel) else {
            debug!("dropping select-case finding without resolvable position");
            continue;
        };
        if !unscheduled.is_empty() {
            state.report(Bug::with_cases(
                BugKind::SelectCasePartnerUnscheduled,
                vec![snap.clone()],
                unscheduled,
            ));
        }
        if !untriggerable.is_empty() {
            state.report(Bug::with_cases(
                BugKind::SelectCaseNeverTriggerable,
                vec![snap],
                untriggerable,
            ));
        }
    }
    state.selects = selects;
}

/// Whether any operation in the trace could serve this case
///
/// Operations of the select's own routine cannot pair with it, so they are
/// skipped.
fn has_partner(trace: &Trace, own_routine: usize, case: &SelectCase) -> bool {
    trace.all_refs().iter().any(|&r| {
        if r.routine == own_routine {
            return false;
        }
        let Some(e) = trace.get(r) else { return false };
        match &e.kind {
            ElementKind::Channel { id, op, .. } if *id == case.channel => match op {
                ChannelOp::Send => case.dir == ChannelOp::Recv,
                ChannelOp::Recv => case.dir == ChannelOp::Send,
                ChannelOp::Close => case.dir == ChannelOp::Recv,
            },
            ElementKind::Select { cases, .. } => cases
                .iter()
                .any(|c| c.channel == case.channel && c.dir != case.dir),
            _ => false,
        }
    })
}
