//! Trace file writing
//!
//! Emits the same line format the parser consumes, one `trace_<routine>.log`
//! per routine. The rewriter uses this to produce replayable trace sets;
//! output is deterministic (routines ascending, elements in recorded order),
//! which backs the byte-identical-rewrite guarantee.

use super::element::{
    AtomicOp, ChannelOp, ChosenCase, CondOp, ElementKind, MutexOp, TraceElement, WaitGroupOp,
};
use super::Trace;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

fn flag(b: bool) -> &'static str {
    if b {
        "t"
    } else {
        "f"
    }
}

/// Serialize one element into its trace-line form
pub fn format_element(e: &TraceElement) -> String {
    let mut s = String::new();
    match &e.kind {
        ElementKind::Atomic { id, op } => {
            let op = match op {
                AtomicOp::Load => "L",
                AtomicOp::Store => "S",
                AtomicOp::Add => "A",
                AtomicOp::Swap => "W",
            };
            let _ = write!(s, "A,{},{},{},{},{}", e.t_pre, e.t_post, id, op, e.pos);
        }
        ElementKind::Channel {
            id,
            op,
            closed,
            op_id,
            q_size,
            ..
        } => {
            let op = match op {
                ChannelOp::Send => "S",
                ChannelOp::Recv => "R",
                ChannelOp::Close => "C",
            };
            let _ = write!(
                s,
                "C,{},{},{},{},{},{},{},{}",
                e.t_pre,
                e.t_post,
                id,
                op,
                flag(*closed),
                op_id,
                q_size,
                e.pos
            );
        }
        ElementKind::Mutex { id, op, success } => {
            let op = match op {
                MutexOp::Lock => "L",
                MutexOp::RLock => "R",
                MutexOp::TryLock => "T",
                MutexOp::TryRLock => "N",
                MutexOp::Unlock => "U",
                MutexOp::RUnlock => "Q",
            };
            let _ = write!(
                s,
                "M,{},{},{},{},{},{}",
                e.t_pre,
                e.t_post,
                id,
                op,
                flag(*success),
                e.pos
            );
        }
        ElementKind::Spawn { child } => {
            let _ = write!(s, "G,{},{},{}", e.t_post, child, e.pos);
        }
        ElementKind::Select {
            id, cases, chosen, ..
        } => {
            let mut case_str = String::new();
            for (i, c) in cases.iter().enumerate() {
                if i > 0 {
                    case_str.push('~');
                }
                let dir = if c.dir == ChannelOp::Send { "s" } else { "r" };
                let _ = write!(case_str, "{}.{}.{}", c.channel, dir, c.op_id);
            }
            let chosen_str = match chosen {
                ChosenCase::Case(i) => i.to_string(),
                ChosenCase::Default => {
                    if !case_str.is_empty() {
                        case_str.push('~');
                    }
                    case_str.push('d');
                    "d".to_string()
                }
                ChosenCase::Blocked => "b".to_string(),
            };
            let _ = write!(
                s,
                "S,{},{},{},{},{},{}",
                e.t_pre, e.t_post, id, case_str, chosen_str, e.pos
            );
        }
        ElementKind::WaitGroup {
            id,
            op,
            delta,
            value,
        } => {
            let op = match op {
                WaitGroupOp::Change => "A",
                WaitGroupOp::Wait => "W",
            };
            let _ = write!(
                s,
                "W,{},{},{},{},{},{},{}",
                e.t_pre, e.t_post, id, op, delta, value, e.pos
            );
        }
        ElementKind::Once { id, winner } => {
            let _ = write!(
                s,
                "O,{},{},{},{},{}",
                e.t_pre,
                e.t_post,
                id,
                flag(*winner),
                e.pos
            );
        }
        ElementKind::Cond { id, op } => {
            let op = match op {
                CondOp::Wait => "W",
                CondOp::Signal => "S",
                CondOp::Broadcast => "B",
            };
            let _ = write!(s, "D,{},{},{},{},{}", e.t_pre, e.t_post, id, op, e.pos);
        }
        ElementKind::RoutineEnd => {
            let _ = write!(s, "E,{}", e.t_post);
        }
        ElementKind::ReplaySentinel { code } => {
            let _ = write!(s, "X,{},{}", e.t_post, code);
        }
    }
    s
}

/// Write all routine files of a trace into `dir`, returning the paths written
pub fn write_trace(trace: &Trace, dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let mut written = Vec::new();
    for routine in trace.routine_ids() {
        let mut content = String::new();
        for elem in trace.routine(routine) {
            content.push_str(&format_element(elem));
            content.push('\n');
        }
        let path = dir.join(format!("trace_{routine}.log"));
        fs::write(&path, content)?;
        written.push(path);
    }
    Ok(written)
}
