//! Bug detectors
//!
//! Two families share the [`crate::state::AnalysisState`] tables:
//!
//! - **streaming** detectors run inside the driver loop, once per dequeued
//!   element: closed-channel races, concurrent receives, and leak-candidate
//!   registration;
//! - **post-pass** detectors run after the merge over the fully-clocked
//!   trace: leak resolution, the max-flow negative-counter/unlock analysis,
//!   the two deadlock models, and unmatched multiplexed-wait cases.
//!
//! A detector that cannot resolve a source position for an element drops that
//! single bug instead of aborting the pass.

pub mod close_race;
pub mod concurrent_recv;
pub mod cyclic;
pub mod flow;
pub mod leak;
pub mod resource;
pub mod select_cases;
