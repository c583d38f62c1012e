//! Channel clock rules: rendezvous, buffered ring, close
//!
//! Unbuffered channels are a rendezvous: both participants jump to the
//! pointwise maximum of their pre-operation clocks, then tick. Buffered
//! channels carry clocks through a ring of slots (see
//! [`crate::state::BufferedChannel`]) addressed by the per-channel operation
//! id. Close publishes the closing clock for the close-race detector and for
//! receives that unblock on a closed channel.

use crate::state::{AnalysisState, BufferedChannel, OpSnapshot};
use crate::trace::element::{ElementRef, ObjectId, RoutineId};
use crate::vector_clock::VectorClock;

/// Rendezvous of an unbuffered send/receive pair
pub fn unbuffered(state: &mut AnalysisState, sender: RoutineId, receiver: RoutineId) {
    let mut merged = state.clock(sender).clone();
    merged.sync(state.clock(receiver));
    state.set_clock(sender, merged.clone());
    state.set_clock(receiver, merged);
    state.clock_mut(sender).inc(sender);
    state.clock_mut(receiver).inc(receiver);
}

/// Send into a buffered channel
///
/// In FIFO mode the send additionally orders after the same routine's
/// previous send on this channel.
pub fn buffered_send(
    state: &mut AnalysisState,
    routine: RoutineId,
    id: ObjectId,
    op_id: u64,
    cap: usize,
    sender: ElementRef,
    fifo: bool,
) {
    if fifo {
        if let Some(prev) = state.fifo_send.get(&(id, routine)).cloned() {
            state.clock_mut(routine).sync(&prev);
        }
    }
    state.clock_mut(routine).inc(routine);
    let own = state.clock(routine).clone();
    state
        .buffered
        .entry(id)
        .or_insert_with(|| BufferedChannel::new(cap))
        .push_send(op_id, sender, own.clone());
    if fifo {
        state.fifo_send.insert((id, routine), own);
    }
}

/// Receive from a buffered channel
///
/// Pops the slot correlated with this receive's op id and orders after the
/// send that filled it. Returns the sender for partner linkage; `None` when
/// the matching send was never admitted (inconsistent trace) — the receive
/// then only ticks.
pub fn buffered_recv(
    state: &mut AnalysisState,
    routine: RoutineId,
    id: ObjectId,
    op_id: u64,
    cap: usize,
    fifo: bool,
) -> Option<ElementRef> {
    if fifo {
        if let Some(prev) = state.fifo_recv.get(&(id, routine)).cloned() {
            state.clock_mut(routine).sync(&prev);
        }
    }
    let popped = state
        .buffered
        .entry(id)
        .or_insert_with(|| BufferedChannel::new(cap))
        .pop_recv(op_id);
    let sender = match popped {
        Some((sender, slot_clock)) => {
            state.clock_mut(routine).sync(&slot_clock);
            Some(sender)
        }
        None => None,
    };
    state.clock_mut(routine).inc(routine);
    if fifo {
        let own = state.clock(routine).clone();
        state.fifo_recv.insert((id, routine), own);
    }
    sender
}

/// Close a channel: publish the closing routine's clock
pub fn close(state: &mut AnalysisState, routine: RoutineId, id: ObjectId, elem: ElementRef) {
    let snapshot = OpSnapshot {
        elem,
        clock: state.clock(routine).clone(),
    };
    state.closes.insert(id, snapshot);
    state.clock_mut(routine).inc(routine);
}

/// Receive that unblocked because the channel was closed
pub fn recv_on_closed(state: &mut AnalysisState, routine: RoutineId, id: ObjectId) {
    if let Some(close_clock) = state.closes.get(&id).map(|s| s.clock.clone()) {
        state.clock_mut(routine).sync(&close_clock);
    }
    state.clock_mut(routine).inc(routine);
}

/// Clock of the close event on a channel, if any
pub fn close_clock(state: &AnalysisState, id: ObjectId) -> Option<&VectorClock> {
    state.closes.get(&id).map(|s| &s.clock)
}
