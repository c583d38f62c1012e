//! Leak resolution (post-pass)
//!
//! The driver registers every operation still blocked at program end
//! (`t_post == 0`) as a [`LeakCandidate`] with the clock of its routine at
//! that point. After the merge, each candidate is classified by primitive and
//! by whether a *potential partner* exists anywhere in the trace — a
//! completed counterpart that a different schedule could have paired with the
//! stuck operation. With a partner the leak is repairable by reordering;
//! without one, no schedule of this trace unblocks the routine.
//!
//! A routine that stopped without its end marker and without any blocked
//! operation gets the diagnostic R01 instead: the recording shows it stuck
//! but not on what.

use crate::bug::{Bug, BugElement, BugKind};
use crate::state::AnalysisState;
use crate::trace::element::{
    ChannelOp, CondOp, ElementKind, ElementRef, ObjectId, SelectCase, WaitGroupOp,
};
use crate::trace::Trace;
use crate::vector_clock::{HappensBefore, VectorClock};
use fnv::FnvHashSet;
use tracing::debug;

/// A blocked operation awaiting classification
#[derive(Debug, Clone)]
pub struct LeakCandidate {
    pub elem: ElementRef,
    /// Routine clock at the point the routine got stuck
    pub clock: VectorClock,
}

/// Register a blocked element once; repeat registrations are ignored
pub fn register(state: &mut AnalysisState, elem: ElementRef, clock: VectorClock) {
    if state.leak_registered.insert(elem) {
        state.leaks.push(LeakCandidate { elem, clock });
    }
}

/// Classify all registered candidates and report stuck routines without one
pub fn resolve(state: &mut AnalysisState, trace: &Trace) {
    let candidates = std::mem::take(&mut state.leaks);
    let mut stuck_routines: FnvHashSet<usize> = FnvHashSet::default();
    for cand in &candidates {
        stuck_routines.insert(cand.elem.routine);
        classify(state, trace, cand);
    }
    report_unexplained(state, trace, &stuck_routines);
    state.leaks = candidates;
}

fn classify(state: &mut AnalysisState, trace: &Trace, cand: &LeakCandidate) {
    let Some(elem) = trace.get(cand.elem) else {
        return;
    };
    let (kind, partners) = match &elem.kind {
        ElementKind::Channel { id: 0, .. } => (BugKind::LeakNilChan, Vec::new()),
        ElementKind::Channel {
            id,
            op,
            q_size: 0,
            ..
        } => {
            let partners = channel_partners(trace, cand, *id, *op, false);
            if partners.is_empty() {
                (BugKind::LeakUnbufChanNoPartner, partners)
            } else {
                (BugKind::LeakUnbufChanWithPartner, partners)
            }
        }
        ElementKind::Channel { id, op, .. } => {
            let partners = channel_partners(trace, cand, *id, *op, true);
            if partners.is_empty() {
                (BugKind::LeakBufChanNoPartner, partners)
            } else {
                (BugKind::LeakBufChanWithPartner, partners)
            }
        }
        ElementKind::Select { cases, .. } => {
            let partners = select_partners(trace, cand, cases);
            if partners.is_empty() {
                (BugKind::LeakSelectNoPartner, partners)
            } else {
                (BugKind::LeakSelectWithPartner, partners)
            }
        }
        ElementKind::Mutex { id, op, .. } if op.is_acquire() => {
            (BugKind::LeakMutex, mutex_partners(trace, cand, *id))
        }
        ElementKind::WaitGroup {
            id,
            op: WaitGroupOp::Wait,
            ..
        } => (BugKind::LeakWaitGroup, waitgroup_partners(trace, cand, *id)),
        ElementKind::Cond {
            id, op: CondOp::Wait, ..
        } => (BugKind::LeakCond, cond_partners(trace, cand, *id)),
        _ => return,
    };

    let Some(primary) = BugElement::snapshot(trace, cand.elem) else {
        debug!("dropping leak bug without resolvable position");
        return;
    };
    let mut secondary = Vec::new();
    for p in partners {
        if let Some(s) = BugElement::snapshot(trace, p) {
            secondary.push(s);
        }
    }
    state.report(Bug::new(kind, vec![primary], secondary));
}

/// Completed opposite-direction operations that a reordering could pair with
/// the stuck channel operation
///
/// For unbuffered channels the pairing is a rendezvous, so the partner must
/// be `Concurrent` with the stuck clock. For buffered channels any opposite
/// operation not already ordered before the stuck point qualifies: delaying
/// it changes which slot it touches.
fn channel_partners(
    trace: &Trace,
    cand: &LeakCandidate,
    id: ObjectId,
    op: ChannelOp,
    buffered: bool,
) -> Vec<ElementRef> {
    let want = match op {
        ChannelOp::Send => ChannelOp::Recv,
        ChannelOp::Recv => ChannelOp::Send,
        ChannelOp::Close => return Vec::new(),
    };
    let mut out = Vec::new();
    for r in trace.all_refs() {
        if r == cand.elem {
            continue;
        }
        let Some(e) = trace.get(r) else { continue };
        if e.is_blocked() {
            continue;
        }
        let matches = match &e.kind {
            ElementKind::Channel { id: eid, op: eop, .. } => *eid == id && *eop == want,
            ElementKind::Select { cases, chosen, .. } => {
                executed_case(cases, chosen).is_some_and(|c| c.channel == id && c.dir == want)
            }
            _ => false,
        };
        if !matches {
            continue;
        }
        let Some(clock) = e.clock.as_ref() else { continue };
        let verdict = VectorClock::happens_before(clock, &cand.clock);
        let usable = if buffered {
            verdict != HappensBefore::Before
        } else {
            verdict == HappensBefore::Concurrent
        };
        if usable {
            out.push(r);
        }
    }
    out
}

fn executed_case<'a>(
    cases: &'a [SelectCase],
    chosen: &crate::trace::element::ChosenCase,
) -> Option<&'a SelectCase> {
    match chosen {
        crate::trace::element::ChosenCase::Case(i) => cases.get(*i),
        _ => None,
    }
}

/// Partners for any case of a stuck multiplexed wait
///
/// A close also unblocks a receive-direction case.
fn select_partners(trace: &Trace, cand: &LeakCandidate, cases: &[SelectCase]) -> Vec<ElementRef> {
    let mut out = Vec::new();
    for r in trace.all_refs() {
        if r == cand.elem {
            continue;
        }
        let Some(e) = trace.get(r) else { continue };
        if e.is_blocked() {
            continue;
        }
        let matches = match &e.kind {
            ElementKind::Channel { id, op, .. } => cases.iter().any(|c| {
                c.channel == *id
                    && match op {
                        ChannelOp::Send => c.dir == ChannelOp::Recv,
                        ChannelOp::Recv => c.dir == ChannelOp::Send,
                        ChannelOp::Close => c.dir == ChannelOp::Recv,
                    }
            }),
            ElementKind::Select { cases: other, chosen, .. } => executed_case(other, chosen)
                .is_some_and(|oc| {
                    cases
                        .iter()
                        .any(|c| c.channel == oc.channel && c.dir != oc.dir)
                }),
            _ => false,
        };
        if !matches {
            continue;
        }
        let Some(clock) = e.clock.as_ref() else { continue };
        if VectorClock::is_concurrent(clock, &cand.clock) {
            out.push(r);
        }
    }
    out
}

/// Completed acquires of the same mutex concurrent with the stuck acquire
///
/// May be empty: a stuck acquire whose blocker is ordered before it cannot be
/// repaired by reordering, but the leak itself is still reported.
fn mutex_partners(trace: &Trace, cand: &LeakCandidate, id: ObjectId) -> Vec<ElementRef> {
    let mut out = Vec::new();
    for r in trace.all_refs() {
        if r == cand.elem {
            continue;
        }
        let Some(e) = trace.get(r) else { continue };
        if e.is_blocked() {
            continue;
        }
        let is_acquire = matches!(
            &e.kind,
            ElementKind::Mutex { id: eid, op, success: true } if *eid == id && op.is_acquire()
        );
        if !is_acquire {
            continue;
        }
        let Some(clock) = e.clock.as_ref() else { continue };
        if VectorClock::is_concurrent(clock, &cand.clock) {
            out.push(r);
        }
    }
    out
}

/// Counter changes concurrent with the stuck wait
fn waitgroup_partners(trace: &Trace, cand: &LeakCandidate, id: ObjectId) -> Vec<ElementRef> {
    let mut out = Vec::new();
    for r in trace.all_refs() {
        let Some(e) = trace.get(r) else { continue };
        if e.is_blocked() {
            continue;
        }
        let is_change = matches!(
            &e.kind,
            ElementKind::WaitGroup { id: eid, op: WaitGroupOp::Change, .. } if *eid == id
        );
        if !is_change {
            continue;
        }
        let Some(clock) = e.clock.as_ref() else { continue };
        if VectorClock::is_concurrent(clock, &cand.clock) {
            out.push(r);
        }
    }
    out
}

/// Wake-ups that a reordering could deliver to the stuck condition wait
fn cond_partners(trace: &Trace, cand: &LeakCandidate, id: ObjectId) -> Vec<ElementRef> {
    let mut out = Vec::new();
    for r in trace.all_refs() {
        let Some(e) = trace.get(r) else { continue };
        if e.is_blocked() {
            continue;
        }
        let is_wake = matches!(
            &e.kind,
            ElementKind::Cond { id: eid, op: CondOp::Signal | CondOp::Broadcast } if *eid == id
        );
        if !is_wake {
            continue;
        }
        let Some(clock) = e.clock.as_ref() else { continue };
        // a wake-up after the stuck point can be moved earlier
        if VectorClock::happens_before(clock, &cand.clock) != HappensBefore::Before {
            out.push(r);
        }
    }
    out
}

/// R01 for routines that stopped early without a registered blocked element
fn report_unexplained(state: &mut AnalysisState, trace: &Trace, stuck: &FnvHashSet<usize>) {
    let mut routines: Vec<usize> = trace.routine_ids().collect();
    routines.sort_unstable();
    for routine in routines {
        if stuck.contains(&routine) {
            continue;
        }
        let elems = trace.routine(routine);
        let ended = elems
            .last()
            .is_some_and(|e| matches!(e.kind, ElementKind::RoutineEnd));
        if ended || elems.is_empty() {
            continue;
        }
        let last = ElementRef::new(routine, elems.len() - 1);
        let Some(snap) = BugElement::snapshot(trace, last) else {
            debug!(routine, "dropping stuck-routine diagnostic without resolvable position");
            continue;
        };
        state.report(Bug::new(BugKind::StuckRoutineNoCause, vec![snap], Vec::new()));
    }
}
