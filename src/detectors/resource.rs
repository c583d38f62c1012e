//! Resource deadlock detection over lock-dependency chains (post-pass)
//!
//! An abstraction of the mutex history that survives lock reuse across
//! schedules: every acquire made while at least one lock is already held is
//! recorded as a *dependency* `(thread, lock, lockset)`, deduplicated on all
//! three components. A chain of dependencies
//!
//! ```text
//! d_1, d_2, …, d_n   (distinct threads)
//! ```
//!
//! is a deadlock witness when each `d_i.lock` is in `d_{i+1}.lockset`, the
//! final lock is in `d_1.lockset`, and the locksets are pairwise disjoint:
//! every thread can reach its acquire while holding its lockset, and each
//! then waits on a lock the next thread holds.
//!
//! This complements the lock-tree cycle model: dependencies abstract over
//! which concrete acquisition produced a lockset, so chains can surface
//! deadlocks between iterations of a loop that the tree search treats as
//! ordered.
//!
//! # Peer-Reviewed Foundation
//!
//! **Zhou et al. (2022). "UNDEAD: Detecting and Preventing Deadlocks in
//! Production Software."** — the dependency abstraction and chain criterion.

use crate::bug::{Bug, BugElement, BugKind};
use crate::trace::element::{ElementRef, ObjectId, RoutineId};
use crate::trace::Trace;
use fnv::FnvHashMap;
use tracing::debug;

/// One deduplicated acquire-while-holding record
#[derive(Debug, Clone)]
pub struct LockDependency {
    pub thread: RoutineId,
    pub lock: ObjectId,
    /// Sorted, deduplicated locks held at the acquire
    pub lockset: Vec<ObjectId>,
    /// Acquire elements that produced this dependency: the requested lock
    /// preceded by one representative acquire per held lock
    pub events: Vec<ElementRef>,
}

/// All dependencies of a run, deduplicated on (thread, lock, lockset)
#[derive(Debug, Default)]
pub struct LockDependencies {
    deps: FnvHashMap<(RoutineId, ObjectId, Vec<ObjectId>), LockDependency>,
}

impl LockDependencies {
    /// Record an acquire of `lock` while `held` (with the acquires that took
    /// each held lock) is non-empty
    pub fn record(
        &mut self,
        thread: RoutineId,
        lock: ObjectId,
        held: &[(ObjectId, ElementRef)],
        acquire: ElementRef,
    ) {
        if held.is_empty() {
            return;
        }
        let mut lockset: Vec<ObjectId> = held.iter().map(|&(l, _)| l).collect();
        lockset.sort_unstable();
        lockset.dedup();
        self.deps
            .entry((thread, lock, lockset.clone()))
            .or_insert_with(|| {
                let mut events: Vec<ElementRef> = held.iter().map(|&(_, e)| e).collect();
                events.push(acquire);
                LockDependency {
                    thread,
                    lock,
                    lockset,
                    events,
                }
            });
    }

    fn by_thread(&self) -> FnvHashMap<RoutineId, Vec<&LockDependency>> {
        let mut map: FnvHashMap<RoutineId, Vec<&LockDependency>> = FnvHashMap::default();
        let mut all: Vec<&LockDependency> = self.deps.values().collect();
        all.sort_by(|a, b| (a.thread, a.lock, &a.lockset).cmp(&(b.thread, b.lock, &b.lockset)));
        for d in all {
            map.entry(d.thread).or_default().push(d);
        }
        map
    }
}

/// Search all dependency chains for deadlock witnesses
pub fn find_chains(deps: &LockDependencies, trace: &Trace) -> Vec<Bug> {
    let by_thread = deps.by_thread();
    let mut threads: Vec<RoutineId> = by_thread.keys().copied().collect();
    threads.sort_unstable();

    let mut bugs = Vec::new();
    let mut chain: Vec<&LockDependency> = Vec::new();
    // each cycle is visited once by forcing the smallest thread id first
    for &start in &threads {
        for dep in &by_thread[&start] {
            chain.push(dep);
            extend(&by_thread, &threads, start, &mut chain, trace, &mut bugs);
            chain.pop();
        }
    }
    bugs
}

fn extend<'a>(
    by_thread: &FnvHashMap<RoutineId, Vec<&'a LockDependency>>,
    threads: &[RoutineId],
    start: RoutineId,
    chain: &mut Vec<&'a LockDependency>,
    trace: &Trace,
    bugs: &mut Vec<Bug>,
) {
    let Some(last) = chain.last().copied() else {
        return;
    };
    for &thread in threads {
        if thread <= start || chain.iter().any(|d| d.thread == thread) {
            continue;
        }
        for cand in &by_thread[&thread] {
            if !cand.lockset.contains(&last.lock) {
                continue;
            }
            if chain
                .iter()
                .any(|d| d.lockset.iter().any(|l| cand.lockset.contains(l)))
            {
                continue;
            }
            chain.push(cand);
            if let Some(first) = chain.first() {
                if first.lockset.contains(&cand.lock) {
                    if let Some(bug) = witness(chain, trace) {
                        bugs.push(bug);
                    }
                }
            }
            extend(by_thread, threads, start, chain, trace, bugs);
            chain.pop();
        }
    }
}

fn witness(chain: &[&LockDependency], trace: &Trace) -> Option<Bug> {
    let mut elems = Vec::new();
    for dep in chain {
        for &e in &dep.events {
            match BugElement::snapshot(trace, e) {
                Some(s) => elems.push(s),
                None => {
                    debug!("dropping dependency-chain deadlock without resolvable position");
                    return None;
                }
            }
        }
    }
    Some(Bug::new(BugKind::ResourceDeadlock, elems, Vec::new()))
}
