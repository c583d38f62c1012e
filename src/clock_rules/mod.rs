//! Per-primitive vector-clock update rules
//!
//! One module per synchronization primitive. Each rule consumes the element's
//! identity plus the shared clock tables in [`crate::state::AnalysisState`]
//! and updates both in place. The driver owns dispatch; rules never look at
//! other routines' cursors.
//!
//! # Update order convention
//!
//! Every rule follows the same sequence, and the driver snapshots the
//! element's clock *before* calling the rule:
//!
//! 1. sync the routine clock with whatever tables the primitive reads
//! 2. increment the routine's own component
//! 3. publish the (post-increment) routine clock into whatever tables the
//!    primitive writes
//!
//! The pre-rule snapshot is the clock detectors compare; publishing
//! post-increment keeps a reader strictly after the publisher.

pub mod atomic;
pub mod channel;
pub mod cond;
pub mod mutex;
pub mod once;
pub mod select;
pub mod spawn;
pub mod waitgroup;
