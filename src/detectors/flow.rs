//! Negative-counter and unlock-without-lock detection (post-pass)
//!
//! Models counter legality as a bipartite matching problem: every decrease
//! event (wait-group Done, mutex Unlock) must be covered by an increase event
//! (Add, Lock) that happens-before it. Build
//!
//! ```text
//! source → each decrease → every increase that happens-before it → sink
//! ```
//!
//! and compute max flow (Ford–Fulkerson with BFS augmenting paths, i.e.
//! Edmonds–Karp). If the max flow is smaller than the total decrease weight,
//! some decrease cannot be matched under *any* legal reordering — a possible
//! negative counter (P04) or unlock without a prior lock (P05). The unmatched
//! decreases and increases are then greedily paired by mutual concurrency for
//! the report.
//!
//! # Peer-Reviewed Foundation
//!
//! **Ford & Fulkerson (1956). "Maximal Flow Through a Network."** —
//! integral max flow equals maximum bipartite matching here, so a flow
//! deficit is a proof that no matching covers all decreases.

use crate::bug::{Bug, BugElement, BugKind};
use crate::state::AnalysisState;
use crate::trace::element::ElementRef;
use crate::trace::Trace;
use crate::vector_clock::{HappensBefore, VectorClock};
use std::collections::VecDeque;
use tracing::debug;

/// Direction of a counter event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDir {
    /// Add with positive delta, or a successful lock
    Inc,
    /// Add with negative delta (Done), or an unlock
    Dec,
}

/// One recorded counter event
#[derive(Debug, Clone)]
pub struct FlowEvent {
    pub elem: ElementRef,
    pub clock: VectorClock,
    pub dir: FlowDir,
    pub weight: u64,
}

/// Run the flow analysis over all wait groups
pub fn check_waitgroups(state: &mut AnalysisState, trace: &Trace) {
    let groups = std::mem::take(&mut state.wg_events);
    let mut ids: Vec<_> = groups.keys().copied().collect();
    ids.sort_unstable();
    for id in ids {
        if let Some(bug) = analyze(&groups[&id], trace, BugKind::PossibleNegativeWaitGroup) {
            state.report(bug);
        }
    }
    state.wg_events = groups;
}

/// Run the flow analysis over all mutexes (read and write sides separately)
pub fn check_mutexes(state: &mut AnalysisState, trace: &Trace) {
    let mutexes = std::mem::take(&mut state.mutex_events);
    let mut keys: Vec<_> = mutexes.keys().copied().collect();
    keys.sort_unstable();
    for key in keys {
        if let Some(bug) = analyze(&mutexes[&key], trace, BugKind::PossibleUnlockWithoutLock) {
            state.report(bug);
        }
    }
    state.mutex_events = mutexes;
}

/// Analyze one entity's event list; `Some` when a deficit was proven
fn analyze(events: &[FlowEvent], trace: &Trace, kind: BugKind) -> Option<Bug> {
    let incs: Vec<&FlowEvent> = events.iter().filter(|e| e.dir == FlowDir::Inc).collect();
    let decs: Vec<&FlowEvent> = events.iter().filter(|e| e.dir == FlowDir::Dec).collect();
    if decs.is_empty() {
        return None;
    }
    let total_dec: u64 = decs.iter().map(|e| e.weight).sum();

    // node layout: 0 = source, 1..=D decreases, D+1..=D+I increases, last = sink
    let d = decs.len();
    let i = incs.len();
    let n = d + i + 2;
    let sink = n - 1;
    let mut cap = vec![vec![0i64; n]; n];
    for (di, dec) in decs.iter().enumerate() {
        cap[0][1 + di] = dec.weight as i64;
        for (ii, inc) in incs.iter().enumerate() {
            if VectorClock::happens_before(&inc.clock, &dec.clock) == HappensBefore::Before {
                cap[1 + di][1 + d + ii] = i64::MAX / 2;
            }
        }
    }
    for (ii, inc) in incs.iter().enumerate() {
        cap[1 + d + ii][sink] = inc.weight as i64;
    }

    let flow = max_flow(&mut cap, 0, sink);
    if flow >= total_dec as i64 {
        return None;
    }

    // residual source capacity identifies the unmatchable decreases
    let unmatched_decs: Vec<&FlowEvent> = decs
        .iter()
        .enumerate()
        .filter(|(di, _)| cap[0][1 + di] > 0)
        .map(|(_, e)| *e)
        .collect();
    let unmatched_incs: Vec<&FlowEvent> = incs
        .iter()
        .enumerate()
        .filter(|(ii, _)| cap[1 + d + ii][sink] > 0)
        .map(|(_, e)| *e)
        .collect();

    // greedy pairing by mutual concurrency, for a readable report
    let mut paired: Vec<&FlowEvent> = Vec::new();
    let mut used = vec![false; unmatched_incs.len()];
    for dec in &unmatched_decs {
        for (k, inc) in unmatched_incs.iter().enumerate() {
            if !used[k] && VectorClock::is_concurrent(&inc.clock, &dec.clock) {
                used[k] = true;
                paired.push(inc);
                break;
            }
        }
    }

    let mut primary = Vec::new();
    for inc in paired {
        match BugElement::snapshot(trace, inc.elem) {
            Some(s) => primary.push(s),
            None => {
                debug!("dropping counter-flow bug without resolvable increase position");
                return None;
            }
        }
    }
    let mut secondary = Vec::new();
    for dec in unmatched_decs {
        match BugElement::snapshot(trace, dec.elem) {
            Some(s) => secondary.push(s),
            None => {
                debug!("dropping counter-flow bug without resolvable decrease position");
                return None;
            }
        }
    }
    Some(Bug::new(kind, primary, secondary))
}

/// Edmonds–Karp on an adjacency-matrix residual network
fn max_flow(cap: &mut [Vec<i64>], source: usize, sink: usize) -> i64 {
    let n = cap.len();
    let mut total = 0;
    loop {
        // BFS for a shortest augmenting path
        let mut parent = vec![usize::MAX; n];
        parent[source] = source;
        let mut queue = VecDeque::from([source]);
        while let Some(u) = queue.pop_front() {
            if u == sink {
                break;
            }
            for v in 0..n {
                if parent[v] == usize::MAX && cap[u][v] > 0 {
                    parent[v] = u;
                    queue.push_back(v);
                }
            }
        }
        if parent[sink] == usize::MAX {
            return total;
        }
        // bottleneck along the path
        let mut bottleneck = i64::MAX;
        let mut v = sink;
        while v != source {
            let u = parent[v];
            bottleneck = bottleneck.min(cap[u][v]);
            v = u;
        }
        // apply
        let mut v = sink;
        while v != source {
            let u = parent[v];
            cap[u][v] -= bottleneck;
            cap[v][u] += bottleneck;
            v = u;
        }
        total += bottleneck;
    }
}
