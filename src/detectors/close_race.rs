//! Closed-channel race detection (streaming)
//!
//! Tracks the close event per channel and the most recent send/receive per
//! (channel, routine). Verdicts:
//!
//! - *actual*: the recorded run already executed the racing pair — a send
//!   dequeued after the close, or a receive that unblocked because of the
//!   close. No reordering is needed to see the bug, so these refuse rewrite.
//! - *possible*: happens-before classifies send and close as `Concurrent`
//!   (a legal reordering panics), or — for receives — also `Before`: a
//!   receive that completed ahead of the close could be delayed past it.

use crate::bug::{Bug, BugElement, BugKind};
use crate::state::{AnalysisState, OpSnapshot};
use crate::trace::element::{ElementRef, ObjectId};
use crate::trace::Trace;
use crate::vector_clock::{HappensBefore, VectorClock};
use tracing::debug;

/// Check a dequeued send against an earlier close
pub fn on_send(state: &mut AnalysisState, trace: &Trace, send: ElementRef, id: ObjectId) {
    if let Some(close) = state.closes.get(&id).cloned() {
        match send_verdict(trace, send, &close.clock) {
            Some(HappensBefore::After) => {
                report_pair(state, trace, BugKind::ActualSendOnClosed, send, close.elem);
            }
            Some(HappensBefore::Concurrent) => {
                report_pair(state, trace, BugKind::PossibleSendOnClosed, send, close.elem);
            }
            _ => {}
        }
    }
    record(state_sends(state, id), trace, send);
}

fn send_verdict(trace: &Trace, send: ElementRef, close_clock: &VectorClock) -> Option<HappensBefore> {
    let clock = trace.get(send)?.clock.as_ref()?;
    Some(VectorClock::happens_before(clock, close_clock))
}

/// Check a dequeued receive; `unblocked_by_close` is the recorder's flag
pub fn on_recv(
    state: &mut AnalysisState,
    trace: &Trace,
    recv: ElementRef,
    id: ObjectId,
    unblocked_by_close: bool,
) {
    if unblocked_by_close {
        if let Some(close) = state.closes.get(&id).cloned() {
            report_pair(state, trace, BugKind::ActualRecvOnClosed, recv, close.elem);
        }
    } else if let Some(close) = state.closes.get(&id).cloned() {
        if let Some(clock) = trace.get(recv).and_then(|e| e.clock.as_ref()) {
            if VectorClock::happens_before(clock, &close.clock) == HappensBefore::Concurrent {
                report_pair(state, trace, BugKind::PossibleRecvOnClosed, recv, close.elem);
            }
        }
    }
    record(state_recvs(state, id), trace, recv);
}

/// Check a dequeued close against every routine's latest send/receive
pub fn on_close(state: &mut AnalysisState, trace: &Trace, close: ElementRef, id: ObjectId) {
    let close_clock = match trace.get(close).and_then(|e| e.clock.clone()) {
        Some(c) => c,
        None => return,
    };
    let sends: Vec<OpSnapshot> = state
        .last_sends
        .get(&id)
        .map(|m| m.values().cloned().collect())
        .unwrap_or_default();
    for snap in sends {
        if VectorClock::happens_before(&snap.clock, &close_clock) == HappensBefore::Concurrent {
            report_pair(state, trace, BugKind::PossibleSendOnClosed, snap.elem, close);
        }
    }
    let recvs: Vec<OpSnapshot> = state
        .last_recvs
        .get(&id)
        .map(|m| m.values().cloned().collect())
        .unwrap_or_default();
    for snap in recvs {
        match VectorClock::happens_before(&snap.clock, &close_clock) {
            // a receive that ran before the close can be delayed past it
            HappensBefore::Concurrent | HappensBefore::Before => {
                report_pair(state, trace, BugKind::PossibleRecvOnClosed, snap.elem, close);
            }
            _ => {}
        }
    }
}

fn report_pair(
    state: &mut AnalysisState,
    trace: &Trace,
    kind: BugKind,
    op: ElementRef,
    close: ElementRef,
) {
    let (Some(op_snap), Some(close_snap)) = (
        BugElement::snapshot(trace, op),
        BugElement::snapshot(trace, close),
    ) else {
        debug!(?kind, "dropping close-race bug without resolvable position");
        return;
    };
    state.report(Bug::new(kind, vec![op_snap], vec![close_snap]));
}

fn state_sends<'a>(
    state: &'a mut AnalysisState,
    id: ObjectId,
) -> &'a mut fnv::FnvHashMap<usize, OpSnapshot> {
    state.last_sends.entry(id).or_default()
}

fn state_recvs<'a>(
    state: &'a mut AnalysisState,
    id: ObjectId,
) -> &'a mut fnv::FnvHashMap<usize, OpSnapshot> {
    state.last_recvs.entry(id).or_default()
}

fn record(
    table: &mut fnv::FnvHashMap<usize, OpSnapshot>,
    trace: &Trace,
    op: ElementRef,
) {
    if let Some(clock) = trace.get(op).and_then(|e| e.clock.clone()) {
        table.insert(op.routine, OpSnapshot { elem: op, clock });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::element::{ChannelOp, ElementKind, SourcePos, TraceElement};

    fn chan_elem(routine: usize, op: ChannelOp, t: u64, clock: VectorClock) -> TraceElement {
        let mut e = TraceElement::new(
            routine,
            t,
            t + 1,
            SourcePos::new("main.go", 5),
            ElementKind::Channel {
                id: 7,
                op,
                closed: false,
                op_id: 1,
                q_size: 0,
                partner: None,
            },
        );
        e.clock = Some(clock);
        e
    }

    fn clock(vals: &[(usize, u64)], size: usize) -> VectorClock {
        let mut c = VectorClock::new(size);
        for &(r, n) in vals {
            for _ in 0..n {
                c.inc(r);
            }
        }
        c
    }

    #[test]
    fn test_send_after_close_is_actual() {
        let mut state = AnalysisState::new(2);
        let mut trace = Trace::new();
        let close = trace.push(chan_elem(1, ChannelOp::Close, 1, clock(&[(1, 1)], 2)));
        state.closes.insert(
            7,
            OpSnapshot {
                elem: close,
                clock: clock(&[(1, 1)], 2),
            },
        );
        // send clock dominates the close clock: After
        let send = trace.push(chan_elem(2, ChannelOp::Send, 5, clock(&[(1, 2), (2, 1)], 2)));
        on_send(&mut state, &trace, send, 7);
        assert_eq!(state.bugs.len(), 1);
        assert_eq!(state.bugs[0].kind, BugKind::ActualSendOnClosed);
    }

    #[test]
    fn test_concurrent_send_is_possible() {
        let mut state = AnalysisState::new(2);
        let mut trace = Trace::new();
        let close = trace.push(chan_elem(1, ChannelOp::Close, 1, clock(&[(1, 1)], 2)));
        state.closes.insert(
            7,
            OpSnapshot {
                elem: close,
                clock: clock(&[(1, 1)], 2),
            },
        );
        let send = trace.push(chan_elem(2, ChannelOp::Send, 5, clock(&[(2, 1)], 2)));
        on_send(&mut state, &trace, send, 7);
        assert_eq!(state.bugs.len(), 1);
        assert_eq!(state.bugs[0].kind, BugKind::PossibleSendOnClosed);
    }

    #[test]
    fn test_close_scans_earlier_receives_including_before() {
        let mut state = AnalysisState::new(2);
        let mut trace = Trace::new();
        let recv = trace.push(chan_elem(2, ChannelOp::Recv, 1, clock(&[(2, 1)], 2)));
        on_recv(&mut state, &trace, recv, 7, false);
        assert!(state.bugs.is_empty());

        // close whose clock dominates the receive: the receive ran Before,
        // which is still a possible receive-on-closed
        let close = trace.push(chan_elem(1, ChannelOp::Close, 5, clock(&[(1, 1), (2, 2)], 2)));
        on_close(&mut state, &trace, close, 7);
        assert_eq!(state.bugs.len(), 1);
        assert_eq!(state.bugs[0].kind, BugKind::PossibleRecvOnClosed);
    }

    #[test]
    fn test_ordered_send_then_close_is_clean() {
        let mut state = AnalysisState::new(2);
        let mut trace = Trace::new();
        let send = trace.push(chan_elem(2, ChannelOp::Send, 1, clock(&[(2, 1)], 2)));
        on_send(&mut state, &trace, send, 7);
        let close = trace.push(chan_elem(1, ChannelOp::Close, 5, clock(&[(1, 1), (2, 2)], 2)));
        // send happens-before close: sends are fine in that order
        let sends_before = state.bugs.len();
        on_close(&mut state, &trace, close, 7);
        let new_bugs: Vec<_> = state.bugs[sends_before..]
            .iter()
            .filter(|b| b.kind == BugKind::PossibleSendOnClosed)
            .collect();
        assert!(new_bugs.is_empty());
    }
}
