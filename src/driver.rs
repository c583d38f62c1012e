//! Replay driver: k-way merge of the per-routine sequences
//!
//! Replays the recorded run in ascending completion order, one cursor per
//! routine. Each dequeued element gets the clock of its routine *before* its
//! rule runs; the rule then syncs the reads the primitive implies, ticks the
//! routine's own component, and publishes what later operations must order
//! after. Streaming detectors see the element after its clock is assigned and
//! before the tables they read are updated with it.
//!
//! Rendezvous pairs are the one place the merge departs from strict
//! completion order: when the earlier half of an unbuffered send/receive pair
//! is dequeued, its partner — found by the shared per-channel operation id,
//! possibly inside another routine's multiplexed wait — is consumed
//! immediately so both sides observe the same merged clock. The partner's
//! cursor slot is remembered and skipped when its routine reaches it.
//!
//! Elements with `t_post == 0` never completed; they are processed last,
//! registered as leak candidates with the clock their routine had reached.

use crate::clock_rules::{atomic, channel, cond, mutex, once, select, spawn, waitgroup};
use crate::detectors::flow::{FlowDir, FlowEvent};
use crate::detectors::{close_race, concurrent_recv, leak};
use crate::state::AnalysisState;
use crate::trace::element::{
    ChannelOp, ChosenCase, CondOp, ElementKind, ElementRef, MutexOp, ObjectId, RoutineId,
    SelectCase, WaitGroupOp,
};
use crate::trace::Trace;
use fnv::{FnvHashMap, FnvHashSet};
use std::collections::BTreeMap;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, trace as trace_event};

/// Merge-time options, a subset of the analysis options
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverOptions {
    /// Order same-routine buffered sends/receives per channel
    pub assume_fifo: bool,
    /// Drop lock-release ordering edges
    pub ignore_critical_sections: bool,
    /// Hard wall-clock limit for the merge
    pub deadline: Option<Instant>,
}

/// The merge ran past its deadline
#[derive(Debug, Error)]
#[error("analysis deadline exceeded")]
pub struct DeadlineExceeded;

/// Run the merge, assigning clocks and feeding the streaming detectors
pub fn run(
    trace: &mut Trace,
    state: &mut AnalysisState,
    opts: &DriverOptions,
) -> Result<(), DeadlineExceeded> {
    let mut driver = Driver {
        state,
        opts: *opts,
        cursors: trace.routine_ids().map(|r| (r, 0)).collect(),
        done: FnvHashSet::default(),
        held: FnvHashMap::default(),
    };
    driver.run(trace)
}

struct Driver<'a> {
    state: &'a mut AnalysisState,
    opts: DriverOptions,
    /// Next unprocessed index per routine
    cursors: BTreeMap<RoutineId, usize>,
    /// Elements consumed early as rendezvous partners
    done: FnvHashSet<ElementRef>,
    /// Held locks per routine with the acquire that took each
    held: FnvHashMap<RoutineId, Vec<(ObjectId, ElementRef)>>,
}

impl Driver<'_> {
    fn run(&mut self, trace: &mut Trace) -> Result<(), DeadlineExceeded> {
        while let Some(next) = self.next_completed(trace) {
            if self.expired() {
                return Err(DeadlineExceeded);
            }
            self.advance(next);
            self.process(trace, next);
        }
        // everything left is blocked
        let heads: Vec<ElementRef> = self
            .cursors
            .iter()
            .flat_map(|(&routine, &idx)| {
                (idx..trace.routine(routine).len()).map(move |i| ElementRef::new(routine, i))
            })
            .collect();
        for r in heads {
            if self.expired() {
                return Err(DeadlineExceeded);
            }
            if !self.done.contains(&r) {
                self.process_blocked(trace, r);
            }
        }
        Ok(())
    }

    fn expired(&self) -> bool {
        self.opts.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Head element with the smallest nonzero completion time
    fn next_completed(&mut self, trace: &Trace) -> Option<ElementRef> {
        let mut best: Option<(u64, ElementRef)> = None;
        let cursors: Vec<(RoutineId, usize)> =
            self.cursors.iter().map(|(&r, &i)| (r, i)).collect();
        for (routine, mut idx) in cursors {
            let seq = trace.routine(routine);
            while idx < seq.len() && self.done.contains(&ElementRef::new(routine, idx)) {
                idx += 1;
            }
            self.cursors.insert(routine, idx);
            if idx >= seq.len() {
                continue;
            }
            let t = seq[idx].t_post;
            if t == 0 {
                continue;
            }
            let r = ElementRef::new(routine, idx);
            if best.is_none_or(|(bt, br)| (t, r.routine) < (bt, br.routine)) {
                best = Some((t, r));
            }
        }
        best.map(|(_, r)| r)
    }

    fn advance(&mut self, r: ElementRef) {
        self.cursors.insert(r.routine, r.index + 1);
    }

    /// Stamp an element with its routine's pre-rule clock
    fn stamp(&self, trace: &mut Trace, r: ElementRef) {
        let clock = self.state.clock(r.routine).clone();
        if let Some(e) = trace.get_mut(r) {
            e.clock = Some(clock);
        }
    }

    fn process(&mut self, trace: &mut Trace, r: ElementRef) {
        self.stamp(trace, r);
        let Some(kind) = trace.get(r).map(|e| e.kind.clone()) else {
            return;
        };
        trace_event!(routine = r.routine, index = r.index, "dequeue");
        match kind {
            ElementKind::Atomic { id, op } => atomic::apply(self.state, r.routine, id, op),
            ElementKind::Channel {
                id,
                op,
                closed,
                op_id,
                q_size,
                ..
            } => self.process_channel(trace, r, id, op, closed, op_id, q_size),
            ElementKind::Mutex { id, op, success } => self.process_mutex(trace, r, id, op, success),
            ElementKind::Spawn { child } => spawn::apply(self.state, r.routine, child),
            ElementKind::Select {
                ref cases, chosen, ..
            } => {
                self.state.selects.push(r);
                self.process_select(trace, r, cases, chosen);
            }
            ElementKind::WaitGroup { id, op, delta, .. } => {
                self.process_waitgroup(trace, r, id, op, delta)
            }
            ElementKind::Once { id, winner } => once::apply(self.state, r.routine, id, winner),
            ElementKind::Cond { id, op } => match op {
                CondOp::Wait => cond::wait(self.state, r.routine, id),
                CondOp::Signal | CondOp::Broadcast => cond::release(self.state, r.routine, id),
            },
            ElementKind::RoutineEnd | ElementKind::ReplaySentinel { .. } => {}
        }
    }

    fn process_channel(
        &mut self,
        trace: &mut Trace,
        r: ElementRef,
        id: ObjectId,
        op: ChannelOp,
        closed: bool,
        op_id: u64,
        q_size: usize,
    ) {
        match op {
            ChannelOp::Close => {
                close_race::on_close(self.state, trace, r, id);
                channel::close(self.state, r.routine, id, r);
            }
            ChannelOp::Send if q_size == 0 => {
                close_race::on_send(self.state, trace, r, id);
                match self.find_rendezvous(trace, r, id, op_id, ChannelOp::Recv) {
                    Some(partner) => self.rendezvous(trace, r, partner),
                    None => {
                        debug!(id, op_id, "unbuffered send without partner");
                        self.state.clock_mut(r.routine).inc(r.routine);
                    }
                }
            }
            ChannelOp::Send => {
                close_race::on_send(self.state, trace, r, id);
                channel::buffered_send(
                    self.state,
                    r.routine,
                    id,
                    op_id,
                    q_size,
                    r,
                    self.opts.assume_fifo,
                );
            }
            ChannelOp::Recv if closed => {
                concurrent_recv::on_recv(self.state, trace, r, id);
                close_race::on_recv(self.state, trace, r, id, true);
                channel::recv_on_closed(self.state, r.routine, id);
            }
            ChannelOp::Recv if q_size == 0 => {
                concurrent_recv::on_recv(self.state, trace, r, id);
                close_race::on_recv(self.state, trace, r, id, false);
                match self.find_rendezvous(trace, r, id, op_id, ChannelOp::Send) {
                    Some(partner) => self.rendezvous(trace, partner, r),
                    None => {
                        debug!(id, op_id, "unbuffered receive without partner");
                        self.state.clock_mut(r.routine).inc(r.routine);
                    }
                }
            }
            ChannelOp::Recv => {
                concurrent_recv::on_recv(self.state, trace, r, id);
                close_race::on_recv(self.state, trace, r, id, false);
                let sender = channel::buffered_recv(
                    self.state,
                    r.routine,
                    id,
                    op_id,
                    q_size,
                    self.opts.assume_fifo,
                );
                if let Some(s) = sender {
                    trace.link_partners(s, r);
                }
            }
        }
    }

    /// Merge both halves of an unbuffered pair
    fn rendezvous(&mut self, trace: &mut Trace, send: ElementRef, recv: ElementRef) {
        channel::unbuffered(self.state, send.routine, recv.routine);
        trace.link_partners(send, recv);
    }

    /// Find the unconsumed opposite half of a rendezvous by operation id
    ///
    /// Searches every routine from its cursor onward, including chosen cases
    /// of multiplexed waits. A found partner is stamped, consumed, and run
    /// through its side's streaming detectors before the rendezvous merges
    /// the clocks.
    fn find_rendezvous(
        &mut self,
        trace: &mut Trace,
        own: ElementRef,
        id: ObjectId,
        op_id: u64,
        want: ChannelOp,
    ) -> Option<ElementRef> {
        let mut found: Option<(ElementRef, bool)> = None;
        'routines: for (&routine, &start) in &self.cursors {
            if routine == own.routine {
                continue;
            }
            let seq = trace.routine(routine);
            for index in start..seq.len() {
                let r = ElementRef::new(routine, index);
                if self.done.contains(&r) {
                    continue;
                }
                let e = &seq[index];
                if e.is_blocked() {
                    continue;
                }
                match &e.kind {
                    ElementKind::Channel {
                        id: eid,
                        op,
                        op_id: eop,
                        q_size: 0,
                        ..
                    } if *eid == id && *op == want && *eop == op_id => {
                        found = Some((r, false));
                        break 'routines;
                    }
                    ElementKind::Select { cases, chosen, .. } => {
                        let hit = executed_case(cases, chosen).is_some_and(|c| {
                            c.channel == id && c.dir == want && c.op_id == op_id
                        });
                        if hit {
                            found = Some((r, true));
                            break 'routines;
                        }
                    }
                    _ => {}
                }
            }
        }
        let (partner, is_select) = found?;
        self.done.insert(partner);
        self.stamp(trace, partner);
        if is_select {
            self.state.selects.push(partner);
        }
        // a chosen select case is the same channel operation as a plain one
        if want == ChannelOp::Recv {
            concurrent_recv::on_recv(self.state, trace, partner, id);
            close_race::on_recv(self.state, trace, partner, id, false);
        } else {
            close_race::on_send(self.state, trace, partner, id);
        }
        Some(partner)
    }

    fn process_mutex(
        &mut self,
        _trace: &mut Trace,
        r: ElementRef,
        id: ObjectId,
        op: MutexOp,
        success: bool,
    ) {
        if op.is_acquire() {
            mutex::acquire(
                self.state,
                r.routine,
                id,
                op,
                success,
                self.opts.ignore_critical_sections,
            );
            if !success {
                return;
            }
            let clock = self.state.clock(r.routine).clone();
            let held = self.held.entry(r.routine).or_default().clone();
            self.state.lock_deps.record(r.routine, id, &held, r);
            self.state
                .lock_forest
                .acquire(r.routine, id, op.is_read(), clock.clone(), r);
            self.held.entry(r.routine).or_default().push((id, r));
            self.record_mutex_flow(r, id, op.is_read(), FlowDir::Inc, clock);
        } else {
            mutex::release(
                self.state,
                r.routine,
                id,
                op,
                self.opts.ignore_critical_sections,
            );
            self.state.lock_forest.release(r.routine, id);
            if let Some(stack) = self.held.get_mut(&r.routine) {
                if let Some(pos) = stack.iter().rposition(|&(l, _)| l == id) {
                    stack.remove(pos);
                }
            }
            let clock = self.state.clock(r.routine).clone();
            self.record_mutex_flow(r, id, op.is_read(), FlowDir::Dec, clock);
        }
    }

    fn record_mutex_flow(
        &mut self,
        r: ElementRef,
        id: ObjectId,
        read: bool,
        dir: FlowDir,
        clock: crate::vector_clock::VectorClock,
    ) {
        self.state
            .mutex_events
            .entry((id, read))
            .or_default()
            .push(FlowEvent {
                elem: r,
                clock,
                dir,
                weight: 1,
            });
    }

    fn process_waitgroup(
        &mut self,
        _trace: &mut Trace,
        r: ElementRef,
        id: ObjectId,
        op: WaitGroupOp,
        delta: i64,
    ) {
        match op {
            WaitGroupOp::Change => {
                waitgroup::change(self.state, r.routine, id);
                if delta != 0 {
                    let dir = if delta > 0 { FlowDir::Inc } else { FlowDir::Dec };
                    let clock = self.state.clock(r.routine).clone();
                    self.state.wg_events.entry(id).or_default().push(FlowEvent {
                        elem: r,
                        clock,
                        dir,
                        weight: delta.unsigned_abs(),
                    });
                }
            }
            WaitGroupOp::Wait => waitgroup::wait(self.state, r.routine, id),
        }
    }

    fn process_select(
        &mut self,
        trace: &mut Trace,
        r: ElementRef,
        cases: &[SelectCase],
        chosen: ChosenCase,
    ) {
        let case = match chosen {
            ChosenCase::Default => {
                select::default_branch(self.state, r.routine);
                return;
            }
            ChosenCase::Blocked => {
                // the parser rejects completed blocked selects; bare tick
                select::blocked(self.state, r.routine);
                return;
            }
            ChosenCase::Case(i) => match cases.get(i) {
                Some(c) => c.clone(),
                None => {
                    debug!(index = i, "chosen case out of range");
                    self.state.clock_mut(r.routine).inc(r.routine);
                    return;
                }
            },
        };
        match case.dir {
            ChannelOp::Send => close_race::on_send(self.state, trace, r, case.channel),
            ChannelOp::Recv => {
                concurrent_recv::on_recv(self.state, trace, r, case.channel);
                close_race::on_recv(self.state, trace, r, case.channel, false);
            }
            ChannelOp::Close => {}
        }
        let q_size = partner_queue_size(trace, case.channel, case.op_id, r);
        match (case.dir, q_size) {
            (ChannelOp::Send, 0) => {
                match self.find_rendezvous(trace, r, case.channel, case.op_id, ChannelOp::Recv) {
                    Some(partner) => self.rendezvous(trace, r, partner),
                    None => self.state.clock_mut(r.routine).inc(r.routine),
                }
            }
            (ChannelOp::Recv, 0) => {
                match self.find_rendezvous(trace, r, case.channel, case.op_id, ChannelOp::Send) {
                    Some(partner) => self.rendezvous(trace, partner, r),
                    None => {
                        // a close also resolves a receive-direction case
                        if channel::close_clock(self.state, case.channel).is_some() {
                            channel::recv_on_closed(self.state, r.routine, case.channel);
                        } else {
                            self.state.clock_mut(r.routine).inc(r.routine);
                        }
                    }
                }
            }
            (ChannelOp::Send, q) => {
                channel::buffered_send(
                    self.state,
                    r.routine,
                    case.channel,
                    case.op_id,
                    q,
                    r,
                    self.opts.assume_fifo,
                );
            }
            (ChannelOp::Recv, q) => {
                let sender = channel::buffered_recv(
                    self.state,
                    r.routine,
                    case.channel,
                    case.op_id,
                    q,
                    self.opts.assume_fifo,
                );
                if let Some(s) = sender {
                    trace.link_partners(s, r);
                }
            }
            (ChannelOp::Close, _) => {
                debug!("close is not a valid multiplexed-wait case");
                self.state.clock_mut(r.routine).inc(r.routine);
            }
        }
    }

    /// A blocked element gets its clock, a leak registration, and a tick
    fn process_blocked(&mut self, trace: &mut Trace, r: ElementRef) {
        self.stamp(trace, r);
        let Some(elem) = trace.get(r) else { return };
        let clock = self.state.clock(r.routine).clone();
        if elem.can_leak() {
            leak::register(self.state, r, clock);
        }
        if matches!(elem.kind, ElementKind::Select { .. }) {
            self.state.selects.push(r);
            select::blocked(self.state, r.routine);
        } else {
            self.state.clock_mut(r.routine).inc(r.routine);
        }
    }
}

fn executed_case<'a>(cases: &'a [SelectCase], chosen: &ChosenCase) -> Option<&'a SelectCase> {
    match chosen {
        ChosenCase::Case(i) => cases.get(*i),
        _ => None,
    }
}

/// Queue size of the channel a select case communicates on, learned from the
/// plain channel operation sharing its operation id (0 when none is found)
fn partner_queue_size(trace: &Trace, channel: ObjectId, op_id: u64, exclude: ElementRef) -> usize {
    for r in trace.all_refs() {
        if r == exclude {
            continue;
        }
        if let Some(e) = trace.get(r) {
            if let ElementKind::Channel {
                id,
                op_id: eop,
                q_size,
                ..
            } = &e.kind
            {
                if *id == channel && *eop == op_id {
                    return *q_size;
                }
            }
        }
    }
    0
}
