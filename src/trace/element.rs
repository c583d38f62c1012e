//! Trace element model
//!
//! A recorded operation is a [`TraceElement`]: common attributes (routine,
//! logical timestamps, source position, lazily assigned vector clock) plus a
//! closed payload enum [`ElementKind`] with one variant per synchronization
//! primitive. The closed enum replaces the unbounded dynamic dispatch a trait
//! object would give us: every consumer matches exhaustively, so adding a
//! primitive is a compile error everywhere it matters.
//!
//! Timestamps are logical, assigned by the recorder in completion order.
//! `t_post == 0` means the operation never completed (it was still blocked
//! when the program ended) and is the trigger for leak analysis.

use crate::vector_clock::VectorClock;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 1-based routine id (routine 1 is the main routine)
pub type RoutineId = usize;

/// Stable identifier of a synchronization object (channel, mutex, ...)
pub type ObjectId = u64;

/// Address of an element inside a [`crate::trace::Trace`]: (routine, index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementRef {
    pub routine: RoutineId,
    pub index: usize,
}

impl ElementRef {
    pub fn new(routine: RoutineId, index: usize) -> Self {
        Self { routine, index }
    }
}

/// Source position of the operation in the traced program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePos {
    pub file: String,
    pub line: u32,
}

impl SourcePos {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }

    /// True when the recorder could not resolve a position
    pub fn is_unknown(&self) -> bool {
        self.file.is_empty() || self.file == "?"
    }
}

impl fmt::Display for SourcePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Atomic memory operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AtomicOp {
    Load,
    Store,
    Add,
    Swap,
}

/// Channel operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelOp {
    Send,
    Recv,
    Close,
}

/// Mutex operation kinds (read/write, plain and try variants)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutexOp {
    Lock,
    RLock,
    TryLock,
    TryRLock,
    Unlock,
    RUnlock,
}

impl MutexOp {
    /// True for the acquire side (including try variants)
    pub fn is_acquire(self) -> bool {
        matches!(
            self,
            MutexOp::Lock | MutexOp::RLock | MutexOp::TryLock | MutexOp::TryRLock
        )
    }

    /// True for reader operations
    pub fn is_read(self) -> bool {
        matches!(self, MutexOp::RLock | MutexOp::TryRLock | MutexOp::RUnlock)
    }
}

/// Wait-group operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitGroupOp {
    /// Counter change (positive or negative delta)
    Change,
    /// Wait for the counter to reach zero
    Wait,
}

/// Condition-variable operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CondOp {
    Wait,
    Signal,
    Broadcast,
}

/// One case of a multiplexed wait (select)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectCase {
    pub channel: ObjectId,
    /// Send or Recv; Close never appears in a case
    pub dir: ChannelOp,
    /// Per-channel operation id correlating this case with its partner
    pub op_id: u64,
}

/// Which case a multiplexed wait resolved to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChosenCase {
    /// Index into the case list
    Case(usize),
    /// The default branch ran
    Default,
    /// The wait never resolved (leaked)
    Blocked,
}

/// Payload of a trace element, one variant per primitive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementKind {
    Atomic {
        id: ObjectId,
        op: AtomicOp,
    },
    Channel {
        id: ObjectId,
        op: ChannelOp,
        /// For Recv: the receive unblocked because the channel was closed
        closed: bool,
        /// Per-channel operation id; sends and receives with equal ids match
        op_id: u64,
        /// Channel capacity; 0 = unbuffered rendezvous
        q_size: usize,
        /// Rendezvous partner, set by the driver
        partner: Option<ElementRef>,
    },
    Mutex {
        id: ObjectId,
        op: MutexOp,
        /// For try variants: whether the attempt succeeded
        success: bool,
    },
    Spawn {
        child: RoutineId,
    },
    Select {
        id: ObjectId,
        cases: Vec<SelectCase>,
        chosen: ChosenCase,
        /// Partner of the chosen case, set by the driver
        partner: Option<ElementRef>,
    },
    WaitGroup {
        id: ObjectId,
        op: WaitGroupOp,
        delta: i64,
        value: i64,
    },
    Once {
        id: ObjectId,
        /// True for the execution that won the one-shot
        winner: bool,
    },
    Cond {
        id: ObjectId,
        op: CondOp,
    },
    RoutineEnd,
    /// Appended by the rewriter; carries the expected replay outcome
    ReplaySentinel {
        code: u32,
    },
}

/// One recorded operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceElement {
    pub routine: RoutineId,
    /// Logical time the operation started (entered the runtime)
    pub t_pre: u64,
    /// Logical time the operation completed; 0 = never completed
    pub t_post: u64,
    pub pos: SourcePos,
    pub kind: ElementKind,
    /// Vector clock at execution, assigned once by the driver
    pub clock: Option<VectorClock>,
}

impl TraceElement {
    pub fn new(routine: RoutineId, t_pre: u64, t_post: u64, pos: SourcePos, kind: ElementKind) -> Self {
        Self {
            routine,
            t_pre,
            t_post,
            pos,
            kind,
            clock: None,
        }
    }

    /// True iff the operation never completed
    pub fn is_blocked(&self) -> bool {
        self.t_post == 0
    }

    /// Object id of the primitive, if the element has one
    pub fn object_id(&self) -> Option<ObjectId> {
        match &self.kind {
            ElementKind::Atomic { id, .. }
            | ElementKind::Channel { id, .. }
            | ElementKind::Mutex { id, .. }
            | ElementKind::Select { id, .. }
            | ElementKind::WaitGroup { id, .. }
            | ElementKind::Once { id, .. }
            | ElementKind::Cond { id, .. } => Some(*id),
            ElementKind::Spawn { child } => Some(*child as ObjectId),
            ElementKind::RoutineEnd | ElementKind::ReplaySentinel { .. } => None,
        }
    }

    /// Short object-type code used in machine-readable bug reports
    pub fn object_type(&self) -> &'static str {
        match &self.kind {
            ElementKind::Atomic { op, .. } => match op {
                AtomicOp::Load => "AL",
                AtomicOp::Store => "AS",
                AtomicOp::Add => "AA",
                AtomicOp::Swap => "AW",
            },
            ElementKind::Channel { op, .. } => match op {
                ChannelOp::Send => "CS",
                ChannelOp::Recv => "CR",
                ChannelOp::Close => "CC",
            },
            ElementKind::Mutex { op, .. } => match op {
                MutexOp::Lock => "ML",
                MutexOp::RLock => "MR",
                MutexOp::TryLock => "MT",
                MutexOp::TryRLock => "MN",
                MutexOp::Unlock => "MU",
                MutexOp::RUnlock => "MQ",
            },
            ElementKind::Spawn { .. } => "GS",
            ElementKind::Select { .. } => "SS",
            ElementKind::WaitGroup { op, .. } => match op {
                WaitGroupOp::Change => "WA",
                WaitGroupOp::Wait => "WW",
            },
            ElementKind::Once { .. } => "ON",
            ElementKind::Cond { op, .. } => match op {
                CondOp::Wait => "DW",
                CondOp::Signal => "DS",
                CondOp::Broadcast => "DB",
            },
            ElementKind::RoutineEnd => "RE",
            ElementKind::ReplaySentinel { .. } => "RX",
        }
    }

    /// True for operations that can block and therefore leak
    pub fn can_leak(&self) -> bool {
        match &self.kind {
            ElementKind::Channel { op, .. } => !matches!(op, ChannelOp::Close),
            ElementKind::Mutex { op, .. } => op.is_acquire(),
            ElementKind::Select { .. } => true,
            ElementKind::WaitGroup { op, .. } => matches!(op, WaitGroupOp::Wait),
            ElementKind::Cond { op, .. } => matches!(op, CondOp::Wait),
            _ => false,
        }
    }

    /// Rendezvous partner, if one was resolved
    pub fn partner(&self) -> Option<ElementRef> {
        match &self.kind {
            ElementKind::Channel { partner, .. } | ElementKind::Select { partner, .. } => *partner,
            _ => None,
        }
    }

    /// Record the rendezvous partner (mutual linkage is the driver's job)
    pub fn set_partner(&mut self, p: ElementRef) {
        match &mut self.kind {
            ElementKind::Channel { partner, .. } | ElementKind::Select { partner, .. } => {
                *partner = Some(p);
            }
            _ => {}
        }
    }
}
