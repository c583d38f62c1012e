//! Cyclic mutex deadlock detection (post-pass)
//!
//! Builds one lock tree per routine while the driver replays acquisitions: a
//! node per acquire, parented under the lock held most recently at that
//! moment, so a parent→child tree edge means "held while acquiring".
//! Same-lock nodes in *other* routines' trees are reachable through "outside"
//! edges. A deadlock candidate is a cycle over tree edges plus outside edges.
//!
//! Nodes live in one index arena; parent/children/outside links are indices,
//! which sidesteps the ownership cycles a pointer-linked tree would create.
//!
//! A candidate cycle is reported only if all of these hold:
//!
//! - **R1** it spans more than one distinct lock;
//! - **R2** every cross-routine pair of nodes in the cycle has `Concurrent`
//!   clocks (otherwise the run order was forced and the cycle cannot close);
//! - **R3** no two same-lock nodes joined by a cycle edge are both
//!   read-locks (readers coexist, so no contention on that edge);
//! - **R4** no shared guard lock: if the two requesting sides of an edge both
//!   held some common lock other than the edge's own lock, that guard
//!   serializes them and the cycle is infeasible.
//!
//! Rotations of an already-found cycle are deduplicated.

use crate::bug::{Bug, BugElement, BugKind};
use crate::trace::element::{ElementRef, ObjectId, RoutineId};
use crate::trace::Trace;
use crate::vector_clock::{HappensBefore, VectorClock};
use fnv::{FnvHashMap, FnvHashSet};
use tracing::debug;

/// One lock acquisition in a routine's tree
#[derive(Debug, Clone)]
pub struct LockNode {
    pub lock: ObjectId,
    pub routine: RoutineId,
    pub read: bool,
    /// Clock at the acquire
    pub clock: VectorClock,
    /// Locks already held at the acquire
    pub lockset: Vec<ObjectId>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub elem: ElementRef,
}

/// Arena of per-routine lock trees plus the cross-routine lock index
#[derive(Debug, Default)]
pub struct LockForest {
    pub nodes: Vec<LockNode>,
    /// Currently held nodes per routine, in acquisition order
    current: FnvHashMap<RoutineId, Vec<usize>>,
    /// All nodes per lock id; the implicit "outside" edges
    by_lock: FnvHashMap<ObjectId, Vec<usize>>,
}

impl LockForest {
    /// Record a successful acquire
    pub fn acquire(
        &mut self,
        routine: RoutineId,
        lock: ObjectId,
        read: bool,
        clock: VectorClock,
        elem: ElementRef,
    ) {
        let stack = self.current.entry(routine).or_default();
        let parent = stack.last().copied();
        let lockset: Vec<ObjectId> = stack.iter().map(|&i| self.nodes[i].lock).collect();
        let idx = self.nodes.len();
        self.nodes.push(LockNode {
            lock,
            routine,
            read,
            clock,
            lockset,
            parent,
            children: Vec::new(),
            elem,
        });
        if let Some(p) = parent {
            self.nodes[p].children.push(idx);
        }
        self.current.entry(routine).or_default().push(idx);
        self.by_lock.entry(lock).or_default().push(idx);
    }

    /// Record a release: drops the most recent held node of this lock
    ///
    /// Out-of-order unlocks are legal; the tree edges recorded at acquire
    /// time stay as they were.
    pub fn release(&mut self, routine: RoutineId, lock: ObjectId) {
        if let Some(stack) = self.current.get_mut(&routine) {
            if let Some(pos) = stack.iter().rposition(|&i| self.nodes[i].lock == lock) {
                stack.remove(pos);
            }
        }
    }

    /// All (held, requested) dependency pairs: a node with each of its
    /// tree ancestors
    fn dependencies(&self) -> Vec<Dependency> {
        let mut deps = Vec::new();
        for (req, node) in self.nodes.iter().enumerate() {
            let mut ancestor = node.parent;
            while let Some(held) = ancestor {
                deps.push(Dependency {
                    routine: node.routine,
                    held,
                    req,
                });
                ancestor = self.nodes[held].parent;
            }
        }
        deps
    }
}

/// "Routine holds `held`'s lock while requesting `req`'s lock"
#[derive(Debug, Clone, Copy)]
struct Dependency {
    routine: RoutineId,
    held: usize,
    req: usize,
}

/// Search the forest for feasible deadlock cycles
pub fn find_cycles(forest: &LockForest, trace: &Trace) -> Vec<Bug> {
    let deps = forest.dependencies();
    let mut by_held_lock: FnvHashMap<ObjectId, Vec<usize>> = FnvHashMap::default();
    for (i, d) in deps.iter().enumerate() {
        by_held_lock
            .entry(forest.nodes[d.held].lock)
            .or_default()
            .push(i);
    }

    let mut bugs = Vec::new();
    let mut seen: FnvHashSet<Vec<usize>> = FnvHashSet::default();
    let mut chain: Vec<usize> = Vec::new();
    for start in 0..deps.len() {
        chain.push(start);
        extend(
            forest,
            trace,
            &deps,
            &by_held_lock,
            &mut chain,
            &mut seen,
            &mut bugs,
        );
        chain.pop();
    }
    bugs
}

/// Depth-first extension of a dependency chain into cycles
fn extend(
    forest: &LockForest,
    trace: &Trace,
    deps: &[Dependency],
    by_held_lock: &FnvHashMap<ObjectId, Vec<usize>>,
    chain: &mut Vec<usize>,
    seen: &mut FnvHashSet<Vec<usize>>,
    bugs: &mut Vec<Bug>,
) {
    let Some(&last_idx) = chain.last() else {
        return;
    };
    let next_lock = forest.nodes[deps[last_idx].req].lock;
    let Some(candidates) = by_held_lock.get(&next_lock) else {
        return;
    };
    for &ci in candidates {
        let cand = deps[ci];
        if chain.iter().any(|&k| deps[k].routine == cand.routine) {
            continue;
        }
        chain.push(ci);
        // closing edge: the candidate requests the first routine's held lock
        let first = deps[chain[0]];
        if forest.nodes[cand.req].lock == forest.nodes[first.held].lock {
            if let Some(bug) = check_cycle(forest, trace, deps, chain, seen) {
                bugs.push(bug);
            }
        }
        extend(forest, trace, deps, by_held_lock, chain, seen, bugs);
        chain.pop();
    }
}

/// Apply the soundness filters R1–R4 and rotation dedup to a closed chain
fn check_cycle(
    forest: &LockForest,
    trace: &Trace,
    deps: &[Dependency],
    chain: &[usize],
    seen: &mut FnvHashSet<Vec<usize>>,
) -> Option<Bug> {
    let nodes: Vec<(usize, usize)> = chain
        .iter()
        .map(|&k| (deps[k].held, deps[k].req))
        .collect();

    // rotation dedup: canonical form starts at the smallest req index
    let mut signature: Vec<usize> = chain.iter().map(|&k| deps[k].req).collect();
    let min_pos = signature
        .iter()
        .enumerate()
        .min_by_key(|(_, &v)| v)
        .map(|(i, _)| i)
        .unwrap_or(0);
    signature.rotate_left(min_pos);
    if !seen.insert(signature) {
        return None;
    }

    // R1: more than one distinct lock
    let mut locks: Vec<ObjectId> = nodes
        .iter()
        .flat_map(|&(h, r)| [forest.nodes[h].lock, forest.nodes[r].lock])
        .collect();
    locks.sort_unstable();
    locks.dedup();
    if locks.len() < 2 {
        return None;
    }

    // R2: all cross-routine node pairs concurrent
    let all: Vec<usize> = nodes.iter().flat_map(|&(h, r)| [h, r]).collect();
    for (i, &a) in all.iter().enumerate() {
        for &b in &all[i + 1..] {
            let na = &forest.nodes[a];
            let nb = &forest.nodes[b];
            if na.routine != nb.routine
                && VectorClock::happens_before(&na.clock, &nb.clock) != HappensBefore::Concurrent
            {
                return None;
            }
        }
    }

    let k = chain.len();
    for i in 0..k {
        let req_i = deps[chain[i]].req;
        let held_next = deps[chain[(i + 1) % k]].held;
        let req_next = deps[chain[(i + 1) % k]].req;
        let edge_lock = forest.nodes[req_i].lock;

        // R3: both sides of a same-lock edge read-locking cannot contend
        if forest.nodes[req_i].read && forest.nodes[held_next].read {
            return None;
        }

        // R4: a lock held by both requesting sides (other than the edge's
        // own lock) forces an order between them
        let ls_a = &forest.nodes[req_i].lockset;
        let ls_b = &forest.nodes[req_next].lockset;
        if ls_a
            .iter()
            .any(|l| *l != edge_lock && ls_b.contains(l))
        {
            return None;
        }
    }

    // reference every acquire in cycle order: held then req per routine
    let mut elems = Vec::new();
    for &(h, r) in &nodes {
        for idx in [h, r] {
            match BugElement::snapshot(trace, forest.nodes[idx].elem) {
                Some(s) => elems.push(s),
                None => {
                    debug!("dropping deadlock cycle without resolvable position");
                    return None;
                }
            }
        }
    }
    Some(Bug::new(BugKind::CyclicDeadlock, elems, Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::element::{ElementKind, MutexOp, SourcePos, TraceElement};
    use crate::trace::Trace;

    fn clock(vals: &[u64]) -> VectorClock {
        let mut c = VectorClock::new(vals.len());
        for (r, &n) in vals.iter().enumerate() {
            for _ in 0..n {
                c.inc(r + 1);
            }
        }
        c
    }

    fn push_lock(trace: &mut Trace, routine: RoutineId, lock: ObjectId) -> ElementRef {
        trace.push(TraceElement::new(
            routine,
            1,
            2,
            SourcePos::new("main.go", 10),
            ElementKind::Mutex {
                id: lock,
                op: MutexOp::Lock,
                success: true,
            },
        ))
    }

    /// r1: Lock(x); Lock(y)   r2: Lock(y); Lock(x) — with concurrent clocks
    fn ab_ba(trace: &mut Trace, forest: &mut LockForest) {
        let e1 = push_lock(trace, 1, 100);
        forest.acquire(1, 100, false, clock(&[1, 0]), e1);
        let e2 = push_lock(trace, 1, 200);
        forest.acquire(1, 200, false, clock(&[2, 0]), e2);
        forest.release(1, 200);
        forest.release(1, 100);

        let e3 = push_lock(trace, 2, 200);
        forest.acquire(2, 200, false, clock(&[0, 1]), e3);
        let e4 = push_lock(trace, 2, 100);
        forest.acquire(2, 100, false, clock(&[0, 2]), e4);
        forest.release(2, 100);
        forest.release(2, 200);
    }

    #[test]
    fn test_ab_ba_cycle_found_once() {
        let mut trace = Trace::new();
        let mut forest = LockForest::default();
        ab_ba(&mut trace, &mut forest);
        let bugs = find_cycles(&forest, &trace);
        assert_eq!(bugs.len(), 1);
        assert_eq!(bugs[0].kind, BugKind::CyclicDeadlock);
        assert_eq!(bugs[0].primary.len(), 4);
    }

    #[test]
    fn test_guard_lock_suppresses_cycle() {
        let mut trace = Trace::new();
        let mut forest = LockForest::default();
        // both routines wrap the AB-BA pattern in a shared guard lock 9
        let g1 = push_lock(&mut trace, 1, 9);
        forest.acquire(1, 9, false, clock(&[1, 0]), g1);
        let e1 = push_lock(&mut trace, 1, 100);
        forest.acquire(1, 100, false, clock(&[2, 0]), e1);
        let e2 = push_lock(&mut trace, 1, 200);
        forest.acquire(1, 200, false, clock(&[3, 0]), e2);
        forest.release(1, 200);
        forest.release(1, 100);
        forest.release(1, 9);

        let g2 = push_lock(&mut trace, 2, 9);
        forest.acquire(2, 9, false, clock(&[0, 1]), g2);
        let e3 = push_lock(&mut trace, 2, 200);
        forest.acquire(2, 200, false, clock(&[0, 2]), e3);
        let e4 = push_lock(&mut trace, 2, 100);
        forest.acquire(2, 100, false, clock(&[0, 3]), e4);
        forest.release(2, 100);
        forest.release(2, 200);
        forest.release(2, 9);

        let bugs = find_cycles(&forest, &trace);
        assert!(bugs.is_empty());
    }

    #[test]
    fn test_all_read_cycle_suppressed() {
        let mut trace = Trace::new();
        let mut forest = LockForest::default();
        let e1 = push_lock(&mut trace, 1, 100);
        forest.acquire(1, 100, true, clock(&[1, 0]), e1);
        let e2 = push_lock(&mut trace, 1, 200);
        forest.acquire(1, 200, true, clock(&[2, 0]), e2);
        forest.release(1, 200);
        forest.release(1, 100);

        let e3 = push_lock(&mut trace, 2, 200);
        forest.acquire(2, 200, true, clock(&[0, 1]), e3);
        let e4 = push_lock(&mut trace, 2, 100);
        forest.acquire(2, 100, true, clock(&[0, 2]), e4);
        forest.release(2, 100);
        forest.release(2, 200);

        let bugs = find_cycles(&forest, &trace);
        assert!(bugs.is_empty());
    }

    #[test]
    fn test_ordered_routines_suppressed() {
        let mut trace = Trace::new();
        let mut forest = LockForest::default();
        // routine 2's clocks dominate routine 1's: R2 fails
        let e1 = push_lock(&mut trace, 1, 100);
        forest.acquire(1, 100, false, clock(&[1, 0]), e1);
        let e2 = push_lock(&mut trace, 1, 200);
        forest.acquire(1, 200, false, clock(&[2, 0]), e2);
        forest.release(1, 200);
        forest.release(1, 100);

        let e3 = push_lock(&mut trace, 2, 200);
        forest.acquire(2, 200, false, clock(&[3, 1]), e3);
        let e4 = push_lock(&mut trace, 2, 100);
        forest.acquire(2, 100, false, clock(&[3, 2]), e4);
        forest.release(2, 100);
        forest.release(2, 200);

        let bugs = find_cycles(&forest, &trace);
        assert!(bugs.is_empty());
    }

    #[test]
    fn test_single_lock_reentry_not_a_cycle() {
        let mut trace = Trace::new();
        let mut forest = LockForest::default();
        let e1 = push_lock(&mut trace, 1, 100);
        forest.acquire(1, 100, false, clock(&[1, 0]), e1);
        let e2 = push_lock(&mut trace, 1, 100);
        forest.acquire(1, 100, false, clock(&[2, 0]), e2);
        forest.release(1, 100);
        forest.release(1, 100);

        let e3 = push_lock(&mut trace, 2, 100);
        forest.acquire(2, 100, false, clock(&[0, 1]), e3);
        let e4 = push_lock(&mut trace, 2, 100);
        forest.acquire(2, 100, false, clock(&[0, 2]), e4);
        forest.release(2, 100);
        forest.release(2, 100);

        let bugs = find_cycles(&forest, &trace);
        assert!(bugs.is_empty());
    }

    #[test]
    fn test_three_routine_cycle() {
        let mut trace = Trace::new();
        let mut forest = LockForest::default();
        let pairs = [(1usize, 100u64, 200u64), (2, 200, 300), (3, 300, 100)];
        for (i, &(r, a, b)) in pairs.iter().enumerate() {
            let mut c1 = vec![0u64; 3];
            c1[i] = 1;
            let e1 = push_lock(&mut trace, r, a);
            forest.acquire(r, a, false, clock(&c1), e1);
            let mut c2 = vec![0u64; 3];
            c2[i] = 2;
            let e2 = push_lock(&mut trace, r, b);
            forest.acquire(r, b, false, clock(&c2), e2);
            forest.release(r, b);
            forest.release(r, a);
        }
        let bugs = find_cycles(&forest, &trace);
        assert_eq!(bugs.len(), 1);
        assert_eq!(bugs[0].primary.len(), 6);
    }
}
