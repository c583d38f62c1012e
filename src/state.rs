//! Per-run analysis state
//!
//! Every mutable table the driver and detectors share lives in one explicit
//! [`AnalysisState`] value, constructed per run and reset between runs. The
//! external fuzzing loop re-runs analysis many times in one process, so
//! nothing here may be a process-wide singleton — including the
//! resource-deadlock recorder, which gets the same treatment as the main
//! cyclic-deadlock state.

use crate::bug::Bug;
use crate::detectors::cyclic::LockForest;
use crate::detectors::flow::FlowEvent;
use crate::detectors::leak::LeakCandidate;
use crate::detectors::resource::LockDependencies;
use crate::trace::element::{ElementRef, ObjectId, RoutineId};
use crate::vector_clock::VectorClock;
use fnv::{FnvHashMap, FnvHashSet};
use std::collections::VecDeque;

/// Snapshot of a processed operation: address plus its clock
#[derive(Debug, Clone)]
pub struct OpSnapshot {
    pub elem: ElementRef,
    pub clock: VectorClock,
}

/// State of one buffered channel during the merge
///
/// A ring of clock-tagged slots sized to the channel capacity, addressed by
/// the per-channel operation id. A send that finds the ring full queues
/// internally (the producer ran ahead of the trace's consumer ordering) and
/// is admitted when a receive frees a slot, so at any prefix of the merged
/// order the number of unmatched admitted sends never exceeds the capacity.
#[derive(Debug, Clone, Default)]
pub struct BufferedChannel {
    pub cap: usize,
    /// Admitted sends not yet received: (op id, sender, clock at send)
    pub slots: VecDeque<(u64, ElementRef, VectorClock)>,
    /// Sends waiting for a free slot
    pub pending_sends: VecDeque<(u64, ElementRef, VectorClock)>,
}

impl BufferedChannel {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            slots: VecDeque::new(),
            pending_sends: VecDeque::new(),
        }
    }

    /// Admit a send, queueing it if the ring is full
    pub fn push_send(&mut self, op_id: u64, sender: ElementRef, clock: VectorClock) {
        if self.slots.len() < self.cap {
            self.slots.push_back((op_id, sender, clock));
        } else {
            self.pending_sends.push_back((op_id, sender, clock));
        }
    }

    /// Pop the slot matching a receive's correlated op id
    ///
    /// Frees one slot, which admits the oldest pending send. `None` when the
    /// matching send was never admitted (inconsistent trace).
    pub fn pop_recv(&mut self, op_id: u64) -> Option<(ElementRef, VectorClock)> {
        let idx = self.slots.iter().position(|(oid, _, _)| *oid == op_id)?;
        let (_, sender, clock) = self.slots.remove(idx)?;
        if let Some(next) = self.pending_sends.pop_front() {
            self.slots.push_back(next);
        }
        Some((sender, clock))
    }

    /// Number of admitted, unreceived sends
    pub fn filled(&self) -> usize {
        self.slots.len()
    }
}

/// All shared mutable analysis state for one run
#[derive(Debug, Default)]
pub struct AnalysisState {
    /// Number of routines (vector-clock size)
    pub n_routines: usize,
    /// Current clock per routine, index = routine - 1
    clocks: Vec<VectorClock>,

    // Mutex clock tables
    pub mutex_rel_w: FnvHashMap<ObjectId, VectorClock>,
    pub mutex_rel_r: FnvHashMap<ObjectId, VectorClock>,

    // Channel state
    pub buffered: FnvHashMap<ObjectId, BufferedChannel>,
    /// Close event per channel
    pub closes: FnvHashMap<ObjectId, OpSnapshot>,
    /// Most recent send per channel per routine
    pub last_sends: FnvHashMap<ObjectId, FnvHashMap<RoutineId, OpSnapshot>>,
    /// Most recent receive per channel per routine
    pub last_recvs: FnvHashMap<ObjectId, FnvHashMap<RoutineId, OpSnapshot>>,
    /// FIFO mode: previous send clock per (channel, routine)
    pub fifo_send: FnvHashMap<(ObjectId, RoutineId), VectorClock>,
    /// FIFO mode: previous receive clock per (channel, routine)
    pub fifo_recv: FnvHashMap<(ObjectId, RoutineId), VectorClock>,

    // Wait group
    pub wg_change: FnvHashMap<ObjectId, VectorClock>,
    pub wg_events: FnvHashMap<ObjectId, Vec<FlowEvent>>,

    // Mutex events for the unlock-without-lock flow analysis,
    // keyed by (mutex, read-mode) since read and write sides match separately
    pub mutex_events: FnvHashMap<(ObjectId, bool), Vec<FlowEvent>>,

    // Condition variables
    pub cond_release: FnvHashMap<ObjectId, VectorClock>,

    // Atomics
    pub atomic_last_write: FnvHashMap<ObjectId, VectorClock>,

    // One-shots
    pub once_winner: FnvHashMap<ObjectId, VectorClock>,

    // Deadlock models
    pub lock_forest: LockForest,
    pub lock_deps: LockDependencies,

    // Leak registry
    pub leaks: Vec<LeakCandidate>,
    /// Blocked elements already registered (guards double registration)
    pub leak_registered: FnvHashSet<ElementRef>,

    /// All multiplexed waits seen, for the unmatched-case post-pass
    pub selects: Vec<ElementRef>,

    /// Bugs found so far (streaming and post-pass)
    pub bugs: Vec<Bug>,
}

impl AnalysisState {
    pub fn new(n_routines: usize) -> Self {
        let mut state = Self::default();
        state.n_routines = n_routines;
        state.clocks = vec![VectorClock::new(n_routines); n_routines];
        state
    }

    /// Current clock of a routine
    pub fn clock(&self, routine: RoutineId) -> &VectorClock {
        &self.clocks[routine - 1]
    }

    pub fn clock_mut(&mut self, routine: RoutineId) -> &mut VectorClock {
        &mut self.clocks[routine - 1]
    }

    /// Overwrite a routine's clock (spawn inheritance)
    pub fn set_clock(&mut self, routine: RoutineId, clock: VectorClock) {
        self.clocks[routine - 1] = clock;
    }

    /// Record a found bug
    pub fn report(&mut self, bug: Bug) {
        self.bugs.push(bug);
    }

    /// Drop everything back to the post-construction state
    ///
    /// Required between fuzzing iterations; forgetting a table here produces
    /// cross-run contamination, so new fields must be added to this list.
    pub fn reset(&mut self) {
        let n = self.n_routines;
        *self = Self::new(n);
    }
}
