//! Trace rewriting: produce a replayable bug-triggering schedule
//!
//! Given a finding, rewrite the recorded timestamps so the replay runtime is
//! steered into the buggy interleaving, then write the modified trace plus a
//! sentinel line announcing the expected outcome. Every attempt operates on a
//! fresh deep copy of the analyzed trace, so attempts cannot contaminate each
//! other, and the output is deterministic: the same finding on the same trace
//! produces byte-identical files.
//!
//! The basic move is *delaying*: an element is given a later start time and
//! every later element of its routine shifts by the same amount, which keeps
//! each routine's sequence internally ordered while changing the global
//! interleaving. A possible send-on-closed, for example, delays the send past
//! the close; a negative-counter finding delays the increases past the
//! decreases; a leak gives the stuck element the slot immediately after its
//! partner.
//!
//! Not every finding can be replayed: *actual* bugs already occurred in the
//! recorded run, and findings without a reorderable partner have no schedule
//! to construct. These refuse with a typed reason rather than writing a
//! misleading trace.

use crate::bug::{Bug, BugKind};
use crate::trace::element::{ElementKind, ElementRef, SourcePos, TraceElement};
use crate::trace::writer::write_trace;
use crate::trace::Trace;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Replay exit codes, consumed by the replay runtime
mod exit_code {
    pub const LEAK: u32 = 20;
    pub const SEND_ON_CLOSED: u32 = 30;
    pub const RECV_ON_CLOSED: u32 = 31;
    pub const NEGATIVE_COUNTER: u32 = 32;
    pub const UNLOCK_WITHOUT_LOCK: u32 = 33;
    pub const CYCLIC_DEADLOCK: u32 = 34;
}

/// Outcome of one rewrite attempt
#[derive(Debug, PartialEq)]
pub enum RewriteOutcome {
    /// The rewritten trace was written
    Written { files: Vec<PathBuf> },
    /// The recorded order already triggers the bug
    NotNeeded,
    /// No schedule for this finding can be constructed
    NotPossible(&'static str),
}

/// Attempt to rewrite `trace` so `bug` triggers during replay
pub fn rewrite(trace: &Trace, bug: &Bug, out_dir: &Path) -> io::Result<RewriteOutcome> {
    let mut copy = trace.clone();
    let plan = match bug.kind {
        BugKind::ActualSendOnClosed | BugKind::ActualRecvOnClosed => {
            return Ok(RewriteOutcome::NotPossible(
                "bug already occurred in the recorded run",
            ));
        }
        BugKind::PossibleSendOnClosed => delay_past_close(&mut copy, bug, exit_code::SEND_ON_CLOSED),
        BugKind::PossibleRecvOnClosed => delay_past_close(&mut copy, bug, exit_code::RECV_ON_CLOSED),
        BugKind::PossibleNegativeWaitGroup => {
            delay_increases(&mut copy, bug, exit_code::NEGATIVE_COUNTER)
        }
        BugKind::PossibleUnlockWithoutLock => {
            delay_increases(&mut copy, bug, exit_code::UNLOCK_WITHOUT_LOCK)
        }
        BugKind::CyclicDeadlock => interleave_cycle(&mut copy, bug),
        k if k.is_leak() => unblock_leak(&mut copy, bug),
        BugKind::ConcurrentRecv => {
            return Ok(RewriteOutcome::NotPossible(
                "either delivery order is legal; nothing to trigger",
            ));
        }
        BugKind::ResourceDeadlock => {
            return Ok(RewriteOutcome::NotPossible(
                "dependency chains abstract over concrete acquisitions",
            ));
        }
        _ => {
            return Ok(RewriteOutcome::NotPossible("finding is diagnostic only"));
        }
    };

    let code = match plan {
        Plan::Shifted(code) => code,
        Plan::NotNeeded => return Ok(RewriteOutcome::NotNeeded),
        Plan::NotPossible(reason) => return Ok(RewriteOutcome::NotPossible(reason)),
    };

    append_sentinel(&mut copy, code);
    let files = write_trace(&copy, out_dir)?;
    info!(code, dir = %out_dir.display(), "rewritten trace written");
    Ok(RewriteOutcome::Written { files })
}

enum Plan {
    Shifted(u32),
    NotNeeded,
    NotPossible(&'static str),
}

/// Delay an element: its timestamps and those of every later element in its
/// routine move so the element starts at `new_t_pre`
///
/// Blocked elements keep `t_post == 0`. A `new_t_pre` at or before the
/// element's current start is a no-op (delays only move forward).
fn delay(trace: &mut Trace, r: ElementRef, new_t_pre: u64) {
    let Some(elem) = trace.get(r) else { return };
    if new_t_pre <= elem.t_pre {
        return;
    }
    let delta = new_t_pre - elem.t_pre;
    let len = trace.routine(r.routine).len();
    for index in r.index..len {
        if let Some(e) = trace.get_mut(ElementRef::new(r.routine, index)) {
            e.t_pre += delta;
            if e.t_post != 0 {
                e.t_post += delta;
            }
        }
    }
}

/// P01/P02: move the racing operation past the close
fn delay_past_close(trace: &mut Trace, bug: &Bug, code: u32) -> Plan {
    let (Some(op), Some(close)) = (bug.primary.first(), bug.secondary.first()) else {
        return Plan::NotPossible("finding names no close event");
    };
    let close_end = match trace.get(close.elem) {
        Some(e) if e.t_post != 0 => e.t_post,
        _ => return Plan::NotPossible("close event is not in the trace"),
    };
    let Some(op_elem) = trace.get(op.elem) else {
        return Plan::NotPossible("operation is not in the trace");
    };
    if op_elem.t_pre > close_end {
        return Plan::NotNeeded;
    }
    delay(trace, op.elem, close_end + 1);
    Plan::Shifted(code)
}

/// P04/P05: move the matched increases past every unmatched decrease
fn delay_increases(trace: &mut Trace, bug: &Bug, code: u32) -> Plan {
    if bug.primary.is_empty() {
        return Plan::NotPossible("no reorderable increase exists");
    }
    let max_dec = bug
        .secondary
        .iter()
        .filter_map(|d| trace.get(d.elem))
        .map(|e| e.t_post)
        .max()
        .unwrap_or(0);
    if max_dec == 0 {
        return Plan::NotPossible("decreases are not in the trace");
    }
    let mut incs: Vec<ElementRef> = bug.primary.iter().map(|e| e.elem).collect();
    incs.sort();
    let already_after = incs
        .iter()
        .all(|&r| trace.get(r).is_some_and(|e| e.t_pre > max_dec));
    if already_after {
        return Plan::NotNeeded;
    }
    for (i, &inc) in incs.iter().enumerate() {
        delay(trace, inc, max_dec + 1 + 2 * i as u64);
    }
    Plan::Shifted(code)
}

/// P06: run every held-side acquire, then release the requesting acquires
/// into the cycle together
fn interleave_cycle(trace: &mut Trace, bug: &Bug) -> Plan {
    // primary alternates held and requesting acquires per cycle edge
    if bug.primary.len() < 4 || bug.primary.len() % 2 != 0 {
        return Plan::NotPossible("cycle does not name its acquire pairs");
    }
    let helds: Vec<ElementRef> = bug.primary.iter().step_by(2).map(|e| e.elem).collect();
    let reqs: Vec<ElementRef> = bug
        .primary
        .iter()
        .skip(1)
        .step_by(2)
        .map(|e| e.elem)
        .collect();
    let held_end = helds
        .iter()
        .filter_map(|&r| trace.get(r))
        .map(|e| e.t_post)
        .max()
        .unwrap_or(0);
    if held_end == 0 {
        return Plan::NotPossible("held acquires are not in the trace");
    }
    let already = reqs
        .iter()
        .all(|&r| trace.get(r).is_some_and(|e| e.t_pre > held_end));
    if already {
        return Plan::NotNeeded;
    }
    for (i, &req) in reqs.iter().enumerate() {
        delay(trace, req, held_end + 1 + 2 * i as u64);
    }
    Plan::Shifted(exit_code::CYCLIC_DEADLOCK)
}

/// Leaks: give the stuck element the slot immediately after its partner
fn unblock_leak(trace: &mut Trace, bug: &Bug) -> Plan {
    let Some(stuck) = bug.primary.first() else {
        return Plan::NotPossible("finding names no stuck element");
    };
    let Some(partner) = bug.secondary.first() else {
        return Plan::NotPossible("no partner exists to unblock the routine");
    };
    let partner_end = match trace.get(partner.elem) {
        Some(e) if e.t_post != 0 => e.t_post,
        _ => return Plan::NotPossible("partner is not in the trace"),
    };
    let Some(elem) = trace.get_mut(stuck.elem) else {
        return Plan::NotPossible("stuck element is not in the trace");
    };
    debug!(
        routine = stuck.elem.routine,
        index = stuck.elem.index,
        "scheduling stuck element after its partner"
    );
    elem.t_pre = partner_end;
    elem.t_post = partner_end + 1;
    Plan::Shifted(exit_code::LEAK)
}

/// Append the replay sentinel after the last completed operation
fn append_sentinel(trace: &mut Trace, code: u32) {
    let t = trace.max_t_post() + 1;
    trace.push(TraceElement::new(
        1,
        t,
        t,
        SourcePos::new("", 0),
        ElementKind::ReplaySentinel { code },
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bug::BugElement;
    use crate::trace::element::ChannelOp;
    use crate::trace::parser::load_trace;

    fn chan(routine: usize, t_pre: u64, t_post: u64, op: ChannelOp, op_id: u64) -> TraceElement {
        TraceElement::new(
            routine,
            t_pre,
            t_post,
            SourcePos::new("main.go", 33),
            ElementKind::Channel {
                id: 4,
                op,
                closed: false,
                op_id,
                q_size: 0,
                partner: None,
            },
        )
    }

    fn snap(trace: &Trace, r: ElementRef) -> BugElement {
        BugElement::snapshot(trace, r).unwrap()
    }

    #[test]
    fn test_send_on_closed_rewrite_moves_send_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut trace = Trace::new();
        let send = trace.push(chan(1, 1, 2, ChannelOp::Send, 1));
        let close = trace.push(chan(2, 3, 4, ChannelOp::Close, 0));
        let bug = Bug::new(
            BugKind::PossibleSendOnClosed,
            vec![snap(&trace, send)],
            vec![snap(&trace, close)],
        );
        let outcome = rewrite(&trace, &bug, dir.path()).unwrap();
        let RewriteOutcome::Written { files } = outcome else {
            panic!("expected a written trace");
        };
        assert_eq!(files.len(), 2);

        let rewritten = load_trace(dir.path()).unwrap();
        let new_send = rewritten.get(send).unwrap();
        let new_close = rewritten.get(close).unwrap();
        assert!(new_send.t_pre > new_close.t_post);
        // sentinel appended to routine 1
        let last = rewritten.routine(1).last().unwrap();
        assert_eq!(
            last.kind,
            ElementKind::ReplaySentinel {
                code: exit_code::SEND_ON_CLOSED
            }
        );
    }

    #[test]
    fn test_actual_bug_refuses_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let mut trace = Trace::new();
        let send = trace.push(chan(1, 5, 6, ChannelOp::Send, 1));
        let close = trace.push(chan(2, 1, 2, ChannelOp::Close, 0));
        let bug = Bug::new(
            BugKind::ActualSendOnClosed,
            vec![snap(&trace, send)],
            vec![snap(&trace, close)],
        );
        let outcome = rewrite(&trace, &bug, dir.path()).unwrap();
        assert!(matches!(outcome, RewriteOutcome::NotPossible(_)));
    }

    #[test]
    fn test_already_ordered_is_not_needed() {
        let dir = tempfile::tempdir().unwrap();
        let mut trace = Trace::new();
        let close = trace.push(chan(2, 1, 2, ChannelOp::Close, 0));
        let send = trace.push(chan(1, 5, 6, ChannelOp::Send, 1));
        let bug = Bug::new(
            BugKind::PossibleSendOnClosed,
            vec![snap(&trace, send)],
            vec![snap(&trace, close)],
        );
        let outcome = rewrite(&trace, &bug, dir.path()).unwrap();
        assert_eq!(outcome, RewriteOutcome::NotNeeded);
    }

    #[test]
    fn test_leak_without_partner_refuses() {
        let dir = tempfile::tempdir().unwrap();
        let mut trace = Trace::new();
        let stuck = trace.push(chan(1, 5, 0, ChannelOp::Send, 1));
        let bug = Bug::new(
            BugKind::LeakUnbufChanNoPartner,
            vec![snap(&trace, stuck)],
            Vec::new(),
        );
        let outcome = rewrite(&trace, &bug, dir.path()).unwrap();
        assert!(matches!(outcome, RewriteOutcome::NotPossible(_)));
    }

    #[test]
    fn test_leak_with_partner_schedules_adjacent_slot() {
        let dir = tempfile::tempdir().unwrap();
        let mut trace = Trace::new();
        let stuck = trace.push(chan(1, 5, 0, ChannelOp::Send, 1));
        let partner = trace.push(chan(2, 2, 3, ChannelOp::Recv, 2));
        let bug = Bug::new(
            BugKind::LeakUnbufChanWithPartner,
            vec![snap(&trace, stuck)],
            vec![snap(&trace, partner)],
        );
        let outcome = rewrite(&trace, &bug, dir.path()).unwrap();
        assert!(matches!(outcome, RewriteOutcome::Written { .. }));
        let rewritten = load_trace(dir.path()).unwrap();
        let s = rewritten.get(stuck).unwrap();
        assert_eq!(s.t_post, 4);
        // leak sentinel
        let last = rewritten.routine(1).last().unwrap();
        assert_eq!(last.kind, ElementKind::ReplaySentinel { code: exit_code::LEAK });
    }

    #[test]
    fn test_rewrite_is_deterministic() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let mut trace = Trace::new();
        let send = trace.push(chan(1, 1, 2, ChannelOp::Send, 1));
        let close = trace.push(chan(2, 3, 4, ChannelOp::Close, 0));
        let bug = Bug::new(
            BugKind::PossibleSendOnClosed,
            vec![snap(&trace, send)],
            vec![snap(&trace, close)],
        );
        let a = rewrite(&trace, &bug, dir_a.path()).unwrap();
        let b = rewrite(&trace, &bug, dir_b.path()).unwrap();
        let (RewriteOutcome::Written { files: fa }, RewriteOutcome::Written { files: fb }) =
            (a, b)
        else {
            panic!("expected written traces");
        };
        for (pa, pb) in fa.iter().zip(fb.iter()) {
            let ca = std::fs::read(pa).unwrap();
            let cb = std::fs::read(pb).unwrap();
            assert_eq!(ca, cb);
        }
    }

    #[test]
    fn test_original_trace_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut trace = Trace::new();
        let send = trace.push(chan(1, 1, 2, ChannelOp::Send, 1));
        let close = trace.push(chan(2, 3, 4, ChannelOp::Close, 0));
        let bug = Bug::new(
            BugKind::PossibleSendOnClosed,
            vec![snap(&trace, send)],
            vec![snap(&trace, close)],
        );
        rewrite(&trace, &bug, dir.path()).unwrap();
        assert_eq!(trace.get(send).unwrap().t_pre, 1);
        assert_eq!(trace.len(), 2);
    }

    #[test]
    fn test_negative_counter_delays_increase() {
        let dir = tempfile::tempdir().unwrap();
        let mut trace = Trace::new();
        let add = trace.push(TraceElement::new(
            1,
            1,
            2,
            SourcePos::new("wg.go", 5),
            ElementKind::WaitGroup {
                id: 6,
                op: crate::trace::element::WaitGroupOp::Change,
                delta: 1,
                value: 1,
            },
        ));
        let done = trace.push(TraceElement::new(
            2,
            3,
            4,
            SourcePos::new("wg.go", 6),
            ElementKind::WaitGroup {
                id: 6,
                op: crate::trace::element::WaitGroupOp::Change,
                delta: -1,
                value: 0,
            },
        ));
        let bug = Bug::new(
            BugKind::PossibleNegativeWaitGroup,
            vec![snap(&trace, add)],
            vec![snap(&trace, done)],
        );
        let outcome = rewrite(&trace, &bug, dir.path()).unwrap();
        assert!(matches!(outcome, RewriteOutcome::Written { .. }));
        let rewritten = load_trace(dir.path()).unwrap();
        assert!(rewritten.get(add).unwrap().t_pre > rewritten.get(done).unwrap().t_post);
    }
}
