//! Trace model: per-routine ordered event sequences
//!
//! A [`Trace`] maps each routine id to the ordered sequence of operations that
//! routine recorded. The global replay order is ascending `t_post`; elements
//! with `t_post == 0` never completed and are excluded from ordering (they are
//! the input to leak analysis instead).

pub mod element;
pub mod parser;
pub mod writer;

use element::{ElementRef, RoutineId, TraceElement};
use std::collections::BTreeMap;

/// Full recorded trace of one program run
///
/// Routine ids are 1-based; routine 1 is the main routine. A `BTreeMap` keeps
/// iteration deterministic, which the rewriter's byte-identical-output
/// guarantee depends on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trace {
    routines: BTreeMap<RoutineId, Vec<TraceElement>>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an element to its routine's sequence, returning its address
    pub fn push(&mut self, elem: TraceElement) -> ElementRef {
        let routine = elem.routine;
        let seq = self.routines.entry(routine).or_default();
        seq.push(elem);
        ElementRef::new(routine, seq.len() - 1)
    }

    /// Ensure a routine exists even if it recorded nothing
    pub fn ensure_routine(&mut self, routine: RoutineId) {
        self.routines.entry(routine).or_default();
    }

    /// Number of routines (the vector-clock size)
    pub fn routine_count(&self) -> usize {
        self.routines.keys().copied().max().unwrap_or(0)
    }

    /// Routine ids in ascending order
    pub fn routine_ids(&self) -> impl Iterator<Item = RoutineId> + '_ {
        self.routines.keys().copied()
    }

    /// Sequence recorded by one routine
    pub fn routine(&self, routine: RoutineId) -> &[TraceElement] {
        self.routines.get(&routine).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn get(&self, r: ElementRef) -> Option<&TraceElement> {
        self.routines.get(&r.routine)?.get(r.index)
    }

    pub fn get_mut(&mut self, r: ElementRef) -> Option<&mut TraceElement> {
        self.routines.get_mut(&r.routine)?.get_mut(r.index)
    }

    /// Total number of recorded elements
    pub fn len(&self) -> usize {
        self.routines.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.routines.values().all(Vec::is_empty)
    }

    /// Largest completion timestamp in the trace
    pub fn max_t_post(&self) -> u64 {
        self.routines
            .values()
            .flatten()
            .map(|e| e.t_post)
            .max()
            .unwrap_or(0)
    }

    /// Addresses of all elements, per-routine order
    pub fn all_refs(&self) -> Vec<ElementRef> {
        let mut out = Vec::with_capacity(self.len());
        for (&routine, seq) in &self.routines {
            for index in 0..seq.len() {
                out.push(ElementRef::new(routine, index));
            }
        }
        out
    }

    /// Link two rendezvous partners mutually
    ///
    /// Invariant maintained: if `a.partner == Some(b)` then `b.partner == Some(a)`.
    pub fn link_partners(&mut self, a: ElementRef, b: ElementRef) {
        if let Some(ea) = self.get_mut(a) {
            ea.set_partner(b);
        }
        if let Some(eb) = self.get_mut(b) {
            eb.set_partner(a);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::element::{ChannelOp, ElementKind, SourcePos};
    use super::*;

    fn chan(routine: RoutineId, op: ChannelOp, t_pre: u64, t_post: u64, op_id: u64) -> TraceElement {
        TraceElement::new(
            routine,
            t_pre,
            t_post,
            SourcePos::new("main.go", 1),
            ElementKind::Channel {
                id: 1,
                op,
                closed: false,
                op_id,
                q_size: 0,
                partner: None,
            },
        )
    }

    #[test]
    fn test_push_and_get() {
        let mut trace = Trace::new();
        let r = trace.push(chan(1, ChannelOp::Send, 1, 2, 1));
        assert_eq!(r, ElementRef::new(1, 0));
        assert_eq!(trace.get(r).unwrap().t_post, 2);
        assert_eq!(trace.len(), 1);
    }

    #[test]
    fn test_partner_linkage_is_mutual() {
        let mut trace = Trace::new();
        let a = trace.push(chan(1, ChannelOp::Send, 1, 2, 1));
        let b = trace.push(chan(2, ChannelOp::Recv, 1, 3, 1));
        trace.link_partners(a, b);
        assert_eq!(trace.get(a).unwrap().partner(), Some(b));
        assert_eq!(trace.get(b).unwrap().partner(), Some(a));
    }

    #[test]
    fn test_routine_count_uses_max_id() {
        let mut trace = Trace::new();
        trace.push(chan(3, ChannelOp::Send, 1, 2, 1));
        trace.ensure_routine(5);
        assert_eq!(trace.routine_count(), 5);
    }

    #[test]
    fn test_deep_copy_isolated() {
        let mut trace = Trace::new();
        let a = trace.push(chan(1, ChannelOp::Send, 1, 2, 1));
        let copy = trace.clone();
        trace.get_mut(a).unwrap().t_post = 99;
        assert_eq!(copy.get(a).unwrap().t_post, 2);
    }
}
