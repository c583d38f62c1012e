//! Vector clocks for happens-before analysis
//!
//! This module implements fixed-size vector clocks to establish **mathematically
//! guaranteed** causal ordering between operations recorded in a concurrency
//! trace. Unlike scalar Lamport clocks, vector clocks are complete: two
//! operations are causally ordered *iff* their clocks are ordered pointwise,
//! so `Concurrent` is a provable verdict rather than an absence of evidence.
//!
//! # Peer-Reviewed Foundation
//!
//! **Fidge (1988). "Timestamps in Message-Passing Systems That Preserve the
//! Partial Ordering."** / **Mattern (1989). "Virtual Time and Global States of
//! Distributed Systems."**
//! - **Theorem:** A happens-before B iff VC(A) < VC(B) (pointwise ≤, one strict <)
//! - **Application:** every race/deadlock/leak verdict in this crate reduces to
//!   a `happens_before` comparison between two recorded operations.
//!
//! # Design
//!
//! The clock size is fixed at construction to the number of routines in the
//! trace and never changes. Routine ids are 1-based (matching the trace file
//! names); component `r` lives at index `r - 1`. `inc` with an out-of-range
//! routine id is a deliberate no-op: a truncated trace may reference a routine
//! the header did not announce, and dropping the tick is strictly safer than
//! panicking mid-analysis.
//!
//! # Example
//!
//! ```
//! use vigia::vector_clock::{VectorClock, HappensBefore};
//!
//! let mut a = VectorClock::new(2);
//! let mut b = VectorClock::new(2);
//! a.inc(1);
//! b.inc(2);
//!
//! // Neither clock dominates the other
//! assert_eq!(VectorClock::happens_before(&a, &b), HappensBefore::Concurrent);
//!
//! // After b observes a, a happens-before b
//! b.sync(&a);
//! assert_eq!(VectorClock::happens_before(&a, &b), HappensBefore::Before);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Verdict of a vector-clock comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HappensBefore {
    /// The first operation causally precedes the second
    Before,
    /// The second operation causally precedes the first
    After,
    /// Neither operation causally precedes the other
    Concurrent,
    /// The clocks are not comparable (size mismatch)
    Undefined,
}

/// Fixed-size per-routine counter vector
///
/// # Invariants
///
/// - The size is fixed at construction and never changes.
/// - All counters start at zero.
/// - `sync` computes the pointwise maximum and is commutative and idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    counters: Vec<u64>,
}

impl VectorClock {
    /// Create a zero-initialized clock for `size` routines
    pub fn new(size: usize) -> Self {
        Self {
            counters: vec![0; size],
        }
    }

    /// Number of routine components
    pub fn size(&self) -> usize {
        self.counters.len()
    }

    /// Counter for a 1-based routine id (0 for out-of-range ids)
    pub fn get(&self, routine: usize) -> u64 {
        if routine == 0 || routine > self.counters.len() {
            return 0;
        }
        self.counters[routine - 1]
    }

    /// Increment the component of a 1-based routine id
    ///
    /// Out-of-range routine ids are ignored.
    pub fn inc(&mut self, routine: usize) {
        if routine == 0 || routine > self.counters.len() {
            return;
        }
        self.counters[routine - 1] += 1;
    }

    /// Merge another clock into this one (pointwise maximum)
    ///
    /// A zero-size operand on either side leaves the non-empty side unchanged;
    /// mismatched non-empty sizes merge the shared prefix. Both situations
    /// only arise from truncated traces and must not abort the run.
    pub fn sync(&mut self, other: &VectorClock) {
        if other.counters.is_empty() {
            return;
        }
        if self.counters.is_empty() {
            self.counters = other.counters.clone();
            return;
        }
        for (own, theirs) in self.counters.iter_mut().zip(other.counters.iter()) {
            if *theirs > *own {
                *own = *theirs;
            }
        }
    }

    /// Compare two clocks under the happens-before partial order
    ///
    /// `Before`/`After` require pointwise ≤/≥ with at least one strict
    /// inequality. Equal clocks are reported as `Concurrent` (they carry no
    /// ordering information either way). Size mismatch yields `Undefined`.
    pub fn happens_before(a: &VectorClock, b: &VectorClock) -> HappensBefore {
        if a.counters.len() != b.counters.len() {
            return HappensBefore::Undefined;
        }
        let mut less = false;
        let mut greater = false;
        for (x, y) in a.counters.iter().zip(b.counters.iter()) {
            if x < y {
                less = true;
            } else if x > y {
                greater = true;
            }
        }
        match (less, greater) {
            (true, false) => HappensBefore::Before,
            (false, true) => HappensBefore::After,
            _ => HappensBefore::Concurrent,
        }
    }

    /// True iff the two clocks are incomparable (and comparably sized)
    pub fn is_concurrent(a: &VectorClock, b: &VectorClock) -> bool {
        Self::happens_before(a, b) == HappensBefore::Concurrent
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, c) in self.counters.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{c}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_zero() {
        let vc = VectorClock::new(4);
        assert_eq!(vc.size(), 4);
        for r in 1..=4 {
            assert_eq!(vc.get(r), 0);
        }
    }

    #[test]
    fn test_inc_is_monotonic_per_routine() {
        let mut vc = VectorClock::new(3);
        vc.inc(2);
        vc.inc(2);
        assert_eq!(vc.get(2), 2);
        assert_eq!(vc.get(1), 0);
        assert_eq!(vc.get(3), 0);
    }

    #[test]
    fn test_inc_out_of_range_is_noop() {
        let mut vc = VectorClock::new(2);
        vc.inc(0);
        vc.inc(3);
        assert_eq!(vc, VectorClock::new(2));
    }

    #[test]
    fn test_sync_is_pointwise_max() {
        let mut a = VectorClock::new(3);
        let mut b = VectorClock::new(3);
        a.inc(1);
        a.inc(1);
        b.inc(2);
        a.sync(&b);
        assert_eq!(a.get(1), 2);
        assert_eq!(a.get(2), 1);
        assert_eq!(a.get(3), 0);
    }

    #[test]
    fn test_sync_commutative() {
        let mut a = VectorClock::new(3);
        let mut b = VectorClock::new(3);
        a.inc(1);
        b.inc(2);
        b.inc(3);
        let mut ab = a.clone();
        ab.sync(&b);
        let mut ba = b.clone();
        ba.sync(&a);
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_sync_idempotent() {
        let mut a = VectorClock::new(3);
        a.inc(1);
        a.inc(3);
        let before = a.clone();
        let snapshot = a.clone();
        a.sync(&snapshot);
        assert_eq!(a, before);
    }

    #[test]
    fn test_sync_zero_size_operand() {
        let mut a = VectorClock::new(3);
        a.inc(1);
        let empty = VectorClock::new(0);
        let before = a.clone();
        a.sync(&empty);
        assert_eq!(a, before);

        let mut e = VectorClock::new(0);
        e.sync(&before);
        assert_eq!(e, before);
    }

    #[test]
    fn test_copy_unaffected_by_source_mutation() {
        let mut a = VectorClock::new(2);
        a.inc(1);
        let copy = a.clone();
        a.inc(1);
        a.inc(2);
        assert_eq!(copy.get(1), 1);
        assert_eq!(copy.get(2), 0);
    }

    #[test]
    fn test_happens_before_basic() {
        let mut a = VectorClock::new(2);
        let mut b = VectorClock::new(2);
        a.inc(1);
        b.inc(1);
        b.inc(2);
        assert_eq!(VectorClock::happens_before(&a, &b), HappensBefore::Before);
        assert_eq!(VectorClock::happens_before(&b, &a), HappensBefore::After);
    }

    #[test]
    fn test_happens_before_concurrent() {
        let mut a = VectorClock::new(2);
        let mut b = VectorClock::new(2);
        a.inc(1);
        b.inc(2);
        assert_eq!(
            VectorClock::happens_before(&a, &b),
            HappensBefore::Concurrent
        );
        assert_eq!(
            VectorClock::happens_before(&b, &a),
            HappensBefore::Concurrent
        );
    }

    #[test]
    fn test_happens_before_size_mismatch_undefined() {
        let a = VectorClock::new(2);
        let b = VectorClock::new(3);
        assert_eq!(VectorClock::happens_before(&a, &b), HappensBefore::Undefined);
    }

    #[test]
    fn test_happens_before_antisymmetric() {
        let mut a = VectorClock::new(3);
        let mut b = VectorClock::new(3);
        a.inc(1);
        b.sync(&a);
        b.inc(2);
        let ab = VectorClock::happens_before(&a, &b);
        let ba = VectorClock::happens_before(&b, &a);
        assert_eq!(ab, HappensBefore::Before);
        assert_eq!(ba, HappensBefore::After);
    }

    #[test]
    fn test_display() {
        let mut vc = VectorClock::new(3);
        vc.inc(1);
        vc.inc(3);
        assert_eq!(vc.to_string(), "[1,0,1]");
    }
}
