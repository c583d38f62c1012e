//! Vigia - Offline happens-before analyzer for recorded concurrency traces
//!
//! This library reads the per-routine event logs a concurrency recorder
//! produces, reconstructs the run's happens-before partial order with vector
//! clocks, and reports races, deadlocks, and leaks the recorded schedule only
//! narrowly avoided. For repairable findings it can rewrite the trace into a
//! schedule that triggers the bug under replay.

pub mod analysis;
pub mod bug;
pub mod cli;
pub mod clock_rules;
pub mod detectors;
pub mod driver;
pub mod report;
pub mod rewriter;
pub mod state;
pub mod trace;
pub mod vector_clock;
