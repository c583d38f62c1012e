//! Concurrent-receive detection (streaming)
//!
//! Two receives on the same channel with `Concurrent` clocks mean message
//! delivery is nondeterministic: a different schedule hands the messages to
//! the receivers in the other order. Compared against the most recent receive
//! of *every other* routine on the channel, before that table is updated with
//! the new receive.

use crate::bug::{Bug, BugElement, BugKind};
use crate::state::AnalysisState;
use crate::trace::element::{ElementRef, ObjectId};
use crate::trace::Trace;
use crate::vector_clock::VectorClock;
use tracing::debug;

/// Check a dequeued receive against prior receives on the channel
///
/// Must run before [`crate::detectors::close_race::on_recv`] records the new
/// receive, otherwise the element would race against itself.
pub fn on_recv(state: &mut AnalysisState, trace: &Trace, recv: ElementRef, id: ObjectId) {
    let clock = match trace.get(recv).and_then(|e| e.clock.as_ref()) {
        Some(c) => c.clone(),
        None => return,
    };
    let others: Vec<ElementRef> = state
        .last_recvs
        .get(&id)
        .map(|m| {
            m.iter()
                .filter(|(&routine, snap)| {
                    routine != recv.routine && VectorClock::is_concurrent(&snap.clock, &clock)
                })
                .map(|(_, snap)| snap.elem)
                .collect()
        })
        .unwrap_or_default();
    for other in others {
        let (Some(a), Some(b)) = (
            BugElement::snapshot(trace, recv),
            BugElement::snapshot(trace, other),
        ) else {
            debug!("dropping concurrent-receive bug without resolvable position");
            continue;
        };
        state.report(Bug::new(BugKind::ConcurrentRecv, vec![a], vec![b]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::OpSnapshot;
    use crate::trace::element::{ChannelOp, ElementKind, SourcePos, TraceElement};

    fn recv_elem(routine: usize, clock: VectorClock) -> TraceElement {
        let mut e = TraceElement::new(
            routine,
            1,
            2,
            SourcePos::new("main.go", 9),
            ElementKind::Channel {
                id: 4,
                op: ChannelOp::Recv,
                closed: false,
                op_id: 1,
                q_size: 1,
                partner: None,
            },
        );
        e.clock = Some(clock);
        e
    }

    #[test]
    fn test_concurrent_receives_flagged() {
        let mut state = AnalysisState::new(2);
        let mut trace = Trace::new();
        let mut c1 = VectorClock::new(2);
        c1.inc(1);
        let prior = trace.push(recv_elem(1, c1.clone()));
        state
            .last_recvs
            .entry(4)
            .or_default()
            .insert(1, OpSnapshot { elem: prior, clock: c1 });

        let mut c2 = VectorClock::new(2);
        c2.inc(2);
        let recv = trace.push(recv_elem(2, c2));
        on_recv(&mut state, &trace, recv, 4);
        assert_eq!(state.bugs.len(), 1);
        assert_eq!(state.bugs[0].kind, BugKind::ConcurrentRecv);
    }

    #[test]
    fn test_ordered_receives_not_flagged() {
        let mut state = AnalysisState::new(2);
        let mut trace = Trace::new();
        let mut c1 = VectorClock::new(2);
        c1.inc(1);
        let prior = trace.push(recv_elem(1, c1.clone()));
        state
            .last_recvs
            .entry(4)
            .or_default()
            .insert(1, OpSnapshot { elem: prior, clock: c1.clone() });

        let mut c2 = c1.clone();
        c2.inc(2);
        let recv = trace.push(recv_elem(2, c2));
        on_recv(&mut state, &trace, recv, 4);
        assert!(state.bugs.is_empty());
    }
}
