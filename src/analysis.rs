//! Analysis orchestration: load, merge, post-pass, report
//!
//! One call to [`run_analysis`] performs a complete pass over a trace
//! directory: parse the per-routine files, run the merge driver (which feeds
//! the streaming detectors), then the post-pass detectors the scenario
//! selection enables. The result carries both the findings and the clocked
//! trace, which the rewriter needs.

use crate::bug::{Bug, BugKind};
use crate::detectors::{cyclic, flow, leak, resource, select_cases};
use crate::driver::{self, DriverOptions};
use crate::state::AnalysisState;
use crate::trace::parser::{load_trace, TraceParseError};
use crate::trace::Trace;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// Detector family selection
///
/// Streaming families are filtered from the result rather than skipped: the
/// merge itself always runs, since its clocks feed every family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scenarios {
    pub close_race: bool,
    pub concurrent_recv: bool,
    pub flow: bool,
    pub cyclic: bool,
    pub resource: bool,
    pub leak: bool,
    pub select_cases: bool,
}

impl Default for Scenarios {
    fn default() -> Self {
        Self::all()
    }
}

/// A scenario token not in the accepted list
#[derive(Debug, Error)]
#[error("unknown scenario '{0}' (expected one of: all, close, recv, flow, cyclic, resource, leak, select)")]
pub struct UnknownScenario(pub String);

impl Scenarios {
    pub fn all() -> Self {
        Self {
            close_race: true,
            concurrent_recv: true,
            flow: true,
            cyclic: true,
            resource: true,
            leak: true,
            select_cases: true,
        }
    }

    pub fn none() -> Self {
        Self {
            close_race: false,
            concurrent_recv: false,
            flow: false,
            cyclic: false,
            resource: false,
            leak: false,
            select_cases: false,
        }
    }

    /// Parse a comma-separated selector list, e.g. `close,leak,cyclic`
    pub fn parse(list: &str) -> Result<Self, UnknownScenario> {
        let mut s = Self::none();
        for token in list.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token {
                "all" => s = Self::all(),
                "close" => s.close_race = true,
                "recv" => s.concurrent_recv = true,
                "flow" => s.flow = true,
                "cyclic" => s.cyclic = true,
                "resource" => s.resource = true,
                "leak" => s.leak = true,
                "select" => s.select_cases = true,
                other => return Err(UnknownScenario(other.to_string())),
            }
        }
        Ok(s)
    }

    /// Whether a finding of this kind is in the selection
    pub fn admits(&self, kind: BugKind) -> bool {
        match kind {
            BugKind::ActualSendOnClosed
            | BugKind::ActualRecvOnClosed
            | BugKind::PossibleSendOnClosed
            | BugKind::PossibleRecvOnClosed => self.close_race,
            BugKind::ConcurrentRecv => self.concurrent_recv,
            BugKind::PossibleNegativeWaitGroup | BugKind::PossibleUnlockWithoutLock => self.flow,
            BugKind::CyclicDeadlock => self.cyclic,
            BugKind::ResourceDeadlock => self.resource,
            BugKind::SelectCaseNeverTriggerable | BugKind::SelectCasePartnerUnscheduled => {
                self.select_cases
            }
            BugKind::StuckRoutineNoCause => self.leak,
            k if k.is_leak() => self.leak,
            _ => true,
        }
    }
}

/// Options of one analysis run
#[derive(Debug, Clone, Default)]
pub struct AnalysisOptions {
    /// Model per-routine FIFO delivery on buffered channels
    pub assume_fifo: bool,
    /// Drop lock-release happens-before edges
    pub ignore_critical_sections: bool,
    pub scenarios: Scenarios,
    /// Wall-clock limit for the whole run
    pub timeout: Option<Duration>,
}

/// Typed analysis failures
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("trace loading failed: {0}")]
    Parse(#[from] TraceParseError),

    #[error("analysis timed out")]
    Timeout,
}

/// Result of one analysis run
#[derive(Debug)]
pub struct AnalysisReport {
    /// Findings, ordered by severity then code then identity
    pub bugs: Vec<Bug>,
    /// The trace with clocks and rendezvous partners assigned
    pub trace: Trace,
    pub n_routines: usize,
    pub elapsed: Duration,
}

/// Run a full analysis over a trace directory
pub fn run_analysis(trace_dir: &Path, options: &AnalysisOptions) -> Result<AnalysisReport, AnalysisError> {
    let started = Instant::now();
    let mut trace = load_trace(trace_dir)?;
    info!(
        dir = %trace_dir.display(),
        routines = trace.routine_count(),
        elements = trace.len(),
        "trace loaded"
    );
    let bugs = analyze_trace(&mut trace, options)?;
    let n_routines = trace.routine_count();
    Ok(AnalysisReport {
        bugs,
        trace,
        n_routines,
        elapsed: started.elapsed(),
    })
}

/// Run the merge and detectors over an already-loaded trace
///
/// Separated from [`run_analysis`] so the rewriter's verification pass and
/// the fuzz-style repeated runs can reuse a parsed trace.
pub fn analyze_trace(trace: &mut Trace, options: &AnalysisOptions) -> Result<Vec<Bug>, AnalysisError> {
    let deadline = options.timeout.map(|t| Instant::now() + t);
    let mut state = AnalysisState::new(trace.routine_count());
    let driver_opts = DriverOptions {
        assume_fifo: options.assume_fifo,
        ignore_critical_sections: options.ignore_critical_sections,
        deadline,
    };
    driver::run(trace, &mut state, &driver_opts).map_err(|_| AnalysisError::Timeout)?;

    let scenarios = options.scenarios;
    if scenarios.leak {
        leak::resolve(&mut state, trace);
    }
    if scenarios.flow {
        flow::check_waitgroups(&mut state, trace);
        flow::check_mutexes(&mut state, trace);
    }
    if scenarios.cyclic {
        // The cycle search needs clocks without lock-release edges: in the
        // recorded run the second routine acquired each lock only after the
        // first released it, so full clocks order every candidate cycle and
        // the concurrency filter would suppress all of them. A second merge
        // over a copy with those edges dropped yields the weak clocks.
        let mut weak_trace = trace.clone();
        let mut weak_state = AnalysisState::new(weak_trace.routine_count());
        let weak_opts = DriverOptions {
            ignore_critical_sections: true,
            ..driver_opts
        };
        driver::run(&mut weak_trace, &mut weak_state, &weak_opts)
            .map_err(|_| AnalysisError::Timeout)?;
        let found = cyclic::find_cycles(&weak_state.lock_forest, &weak_trace);
        for bug in found {
            state.report(bug);
        }
    }
    if scenarios.resource {
        let found = resource::find_chains(&state.lock_deps, trace);
        for bug in found {
            state.report(bug);
        }
    }
    if scenarios.select_cases {
        select_cases::check(&mut state, trace);
    }
    if let Some(d) = deadline {
        if Instant::now() >= d {
            return Err(AnalysisError::Timeout);
        }
    }

    let mut bugs: Vec<Bug> = state
        .bugs
        .into_iter()
        .filter(|b| scenarios.admits(b.kind))
        .collect();
    bugs.sort_by(|a, b| {
        (a.kind.severity(), a.kind.code(), a.signature())
            .cmp(&(b.kind.severity(), b.kind.code(), b.signature()))
    });
    bugs.dedup_by(|a, b| a.signature() == b.signature());
    debug!(count = bugs.len(), "analysis complete");
    Ok(bugs)
}
