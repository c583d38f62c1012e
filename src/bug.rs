//! Bug records and machine-readable encoding
//!
//! Every detector verdict becomes a [`Bug`]: a kind tag plus one or two
//! ordered lists of involved operations (or, for multiplexed-wait findings, a
//! list of case descriptors). The machine log encodes one bug per line:
//!
//! ```text
//! <TypeCode>,<arg-list-1>[,<arg-list-2>]
//! ```
//!
//! where each arg list is `;`-separated tokens of the form
//! `T:routine:objectId:tPre:objectType:file:line`, and select-case findings
//! use `S:objectId:objectType:caseIndex` tokens instead.
//!
//! The distinction between *actual* (the recorded run already exhibited the
//! bug) and *possible* (implied by happens-before but not observed) is carried
//! in the kind itself because it decides rewritability: an actual bug needs no
//! reproduction.

use crate::trace::element::{ElementRef, ObjectId, RoutineId, TraceElement};
use crate::trace::Trace;
use serde::Serialize;
use std::fmt;

/// Report severity groups, ordered most severe first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Critical,
    Warning,
    Informational,
}

/// Closed set of detectable bug categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BugKind {
    /// A01: send on closed channel, observed in the recorded run
    ActualSendOnClosed,
    /// A02: receive on closed channel, observed in the recorded run
    ActualRecvOnClosed,
    /// P01: send and close are concurrent; a reordering panics
    PossibleSendOnClosed,
    /// P02: receive could observe the close under a reordering
    PossibleRecvOnClosed,
    /// P03: two receives on one channel are concurrent (nondeterministic delivery)
    ConcurrentRecv,
    /// P04: wait-group counter can go negative under a legal reordering
    PossibleNegativeWaitGroup,
    /// P05: unlock without a matching prior lock under a legal reordering
    PossibleUnlockWithoutLock,
    /// P06: cyclic mutex deadlock (lock-tree cycle)
    CyclicDeadlock,
    /// P07: resource deadlock (lock-dependency chain)
    ResourceDeadlock,
    /// L01: unbuffered-channel operation leaked, partner exists
    LeakUnbufChanWithPartner,
    /// L02: unbuffered-channel operation leaked, no partner anywhere
    LeakUnbufChanNoPartner,
    /// L03: buffered-channel operation leaked, partner exists
    LeakBufChanWithPartner,
    /// L04: buffered-channel operation leaked, no partner anywhere
    LeakBufChanNoPartner,
    /// L05: operation on a nil channel leaked (never unblockable)
    LeakNilChan,
    /// L06: multiplexed wait leaked, some case has a partner
    LeakSelectWithPartner,
    /// L07: multiplexed wait leaked, no case has a partner
    LeakSelectNoPartner,
    /// L08: mutex acquire leaked
    LeakMutex,
    /// L09: wait-group wait leaked
    LeakWaitGroup,
    /// L10: condition-variable wait leaked
    LeakCond,
    /// S01: select case that no operation in the whole trace could serve
    SelectCaseNeverTriggerable,
    /// S02: select case whose partner existed but was never scheduled
    SelectCasePartnerUnscheduled,
    /// R01: routine ended blocked with no identified blocking operation
    StuckRoutineNoCause,
}

impl BugKind {
    /// Stable machine type code
    pub fn code(self) -> &'static str {
        match self {
            BugKind::ActualSendOnClosed => "A01",
            BugKind::ActualRecvOnClosed => "A02",
            BugKind::PossibleSendOnClosed => "P01",
            BugKind::PossibleRecvOnClosed => "P02",
            BugKind::ConcurrentRecv => "P03",
            BugKind::PossibleNegativeWaitGroup => "P04",
            BugKind::PossibleUnlockWithoutLock => "P05",
            BugKind::CyclicDeadlock => "P06",
            BugKind::ResourceDeadlock => "P07",
            BugKind::LeakUnbufChanWithPartner => "L01",
            BugKind::LeakUnbufChanNoPartner => "L02",
            BugKind::LeakBufChanWithPartner => "L03",
            BugKind::LeakBufChanNoPartner => "L04",
            BugKind::LeakNilChan => "L05",
            BugKind::LeakSelectWithPartner => "L06",
            BugKind::LeakSelectNoPartner => "L07",
            BugKind::LeakMutex => "L08",
            BugKind::LeakWaitGroup => "L09",
            BugKind::LeakCond => "L10",
            BugKind::SelectCaseNeverTriggerable => "S01",
            BugKind::SelectCasePartnerUnscheduled => "S02",
            BugKind::StuckRoutineNoCause => "R01",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            BugKind::ActualSendOnClosed | BugKind::ActualRecvOnClosed => Severity::Critical,
            BugKind::SelectCaseNeverTriggerable | BugKind::StuckRoutineNoCause => {
                Severity::Informational
            }
            _ => Severity::Warning,
        }
    }

    /// One-line human description for the readable log
    pub fn describe(self) -> &'static str {
        match self {
            BugKind::ActualSendOnClosed => "Send on closed channel (observed)",
            BugKind::ActualRecvOnClosed => "Receive on closed channel (observed)",
            BugKind::PossibleSendOnClosed => "Possible send on closed channel",
            BugKind::PossibleRecvOnClosed => "Possible receive on closed channel",
            BugKind::ConcurrentRecv => "Concurrent receives on the same channel",
            BugKind::PossibleNegativeWaitGroup => "Possible negative wait-group counter",
            BugKind::PossibleUnlockWithoutLock => "Possible unlock without prior lock",
            BugKind::CyclicDeadlock => "Cyclic mutex deadlock",
            BugKind::ResourceDeadlock => "Resource deadlock (lock-dependency cycle)",
            BugKind::LeakUnbufChanWithPartner => {
                "Leak on unbuffered channel with possible partner"
            }
            BugKind::LeakUnbufChanNoPartner => "Leak on unbuffered channel without partner",
            BugKind::LeakBufChanWithPartner => "Leak on buffered channel with possible partner",
            BugKind::LeakBufChanNoPartner => "Leak on buffered channel without partner",
            BugKind::LeakNilChan => "Leak on nil channel",
            BugKind::LeakSelectWithPartner => "Leak on select with possible partner",
            BugKind::LeakSelectNoPartner => "Leak on select without partner",
            BugKind::LeakMutex => "Leak on mutex acquire",
            BugKind::LeakWaitGroup => "Leak on wait-group wait",
            BugKind::LeakCond => "Leak on condition-variable wait",
            BugKind::SelectCaseNeverTriggerable => "Select case can never trigger",
            BugKind::SelectCasePartnerUnscheduled => {
                "Select case had a partner that was never scheduled"
            }
            BugKind::StuckRoutineNoCause => "Routine stuck without identified blocking operation",
        }
    }

    /// True for leak categories
    pub fn is_leak(self) -> bool {
        matches!(
            self,
            BugKind::LeakUnbufChanWithPartner
                | BugKind::LeakUnbufChanNoPartner
                | BugKind::LeakBufChanWithPartner
                | BugKind::LeakBufChanNoPartner
                | BugKind::LeakNilChan
                | BugKind::LeakSelectWithPartner
                | BugKind::LeakSelectNoPartner
                | BugKind::LeakMutex
                | BugKind::LeakWaitGroup
                | BugKind::LeakCond
        )
    }
}

/// Snapshot of one involved operation
///
/// Carries both the element's address (for the rewriter) and the identity
/// fields that go into the machine log, so a report stays meaningful even
/// after the trace copy it came from is gone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BugElement {
    pub elem: ElementRef,
    pub routine: RoutineId,
    pub object_id: ObjectId,
    pub t_pre: u64,
    pub object_type: &'static str,
    pub file: String,
    pub line: u32,
}

impl BugElement {
    /// Snapshot an element; `None` when no source position is resolvable
    /// (the caller then drops the bug rather than aborting the pass)
    pub fn snapshot(trace: &Trace, r: ElementRef) -> Option<Self> {
        let elem = trace.get(r)?;
        Self::from_element(r, elem)
    }

    pub fn from_element(r: ElementRef, elem: &TraceElement) -> Option<Self> {
        if elem.pos.is_unknown() {
            return None;
        }
        Some(Self {
            elem: r,
            routine: elem.routine,
            object_id: elem.object_id().unwrap_or(0),
            t_pre: elem.t_pre,
            object_type: elem.object_type(),
            file: elem.pos.file.clone(),
            line: elem.pos.line,
        })
    }

    fn token(&self) -> String {
        format!(
            "T:{}:{}:{}:{}:{}:{}",
            self.routine, self.object_id, self.t_pre, self.object_type, self.file, self.line
        )
    }
}

/// Descriptor of one unmatched multiplexed-wait case
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BugCase {
    pub object_id: ObjectId,
    pub object_type: &'static str,
    /// Case index; -1 refers to the whole operation
    pub case_index: i64,
}

impl BugCase {
    fn token(&self) -> String {
        format!("S:{}:{}:{}", self.object_id, self.object_type, self.case_index)
    }
}

/// One detector verdict
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bug {
    pub kind: BugKind,
    /// First argument list (e.g. the stuck op, the sends, the cycle)
    pub primary: Vec<BugElement>,
    /// Second argument list (e.g. the partner, the closes, the dones)
    pub secondary: Vec<BugElement>,
    /// Case descriptors for multiplexed-wait findings
    pub cases: Vec<BugCase>,
}

impl Bug {
    pub fn new(kind: BugKind, primary: Vec<BugElement>, secondary: Vec<BugElement>) -> Self {
        Self {
            kind,
            primary,
            secondary,
            cases: Vec::new(),
        }
    }

    pub fn with_cases(
        kind: BugKind,
        primary: Vec<BugElement>,
        cases: Vec<BugCase>,
    ) -> Self {
        Self {
            kind,
            primary,
            secondary: Vec::new(),
            cases,
        }
    }

    /// Machine log line for this bug
    pub fn machine_line(&self) -> String {
        let mut line = self.kind.code().to_string();
        let mut first_list: Vec<String> = self.primary.iter().map(BugElement::token).collect();
        first_list.extend(self.cases.iter().map(BugCase::token));
        line.push(',');
        line.push_str(&first_list.join(";"));
        if !self.secondary.is_empty() {
            let second: Vec<String> = self.secondary.iter().map(BugElement::token).collect();
            line.push(',');
            line.push_str(&second.join(";"));
        }
        line
    }

    /// Stable identity for deduplication across rewrite attempts
    pub fn signature(&self) -> String {
        self.machine_line()
    }
}

impl fmt::Display for Bug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.kind.describe())?;
        for e in &self.primary {
            writeln!(f, "    -> {}:{} ({} {})", e.file, e.line, e.object_type, e.object_id)?;
        }
        for e in &self.secondary {
            writeln!(f, "    <- {}:{} ({} {})", e.file, e.line, e.object_type, e.object_id)?;
        }
        for c in &self.cases {
            writeln!(
                f,
                "    case {} of {} {}",
                c.case_index, c.object_type, c.object_id
            )?;
        }
        Ok(())
    }
}
