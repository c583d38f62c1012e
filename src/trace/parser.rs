//! Trace file parsing
//!
//! One file per routine (`trace_<routine>.log`), line-oriented records with
//! comma-separated positional fields. The first field selects the element
//! kind; the remaining fields are positional per kind:
//!
//! ```text
//! A,tpre,tpost,id,op,pos            atomic      op ∈ {L,S,A,W}
//! C,tpre,tpost,id,op,cl,oid,q,pos   channel     op ∈ {S,R,C}, cl ∈ {t,f}
//! M,tpre,tpost,id,op,suc,pos        mutex       op ∈ {L,R,T,N,U,Q}
//! G,tpost,id,pos                    spawn of routine `id`
//! S,tpre,tpost,id,cases,chosen,pos  select      cases = `~`-joined cid.d.oid
//! W,tpre,tpost,id,op,delta,val,pos  wait group  op ∈ {A,W}
//! O,tpre,tpost,id,suc,pos           one-shot
//! D,tpre,tpost,id,op,pos            cond        op ∈ {W,S,B}
//! E,tpost                           routine end
//! X,tpost,code                      replay sentinel
//! ```
//!
//! Error policy (deliberate asymmetry): a malformed *field* is recoverable —
//! the line is skipped with a warning and the routine's trace continues. An
//! unrecognized *kind letter* means the trace was produced by an incompatible
//! recorder version and aborts loading.

use super::element::{
    AtomicOp, ChannelOp, ChosenCase, CondOp, ElementKind, MutexOp, RoutineId, SelectCase,
    SourcePos, TraceElement, WaitGroupOp,
};
use super::Trace;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Fatal trace-loading errors
#[derive(Debug, Error)]
pub enum TraceParseError {
    #[error("failed to read trace file: {0}")]
    Io(#[from] std::io::Error),

    #[error("unrecognized element kind '{kind}' in {file}:{line}")]
    UnknownKind {
        kind: String,
        file: PathBuf,
        line: usize,
    },

    #[error("no trace files (trace_<routine>.log) found in {0}")]
    NoTraceFiles(PathBuf),
}

/// Recoverable per-line field error (the line is skipped)
#[derive(Debug, Error)]
#[error("malformed field {field}: {reason}")]
pub struct FieldError {
    field: &'static str,
    reason: String,
}

impl FieldError {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Load a full trace from a directory of `trace_<routine>.log` files
pub fn load_trace(dir: &Path) -> Result<Trace, TraceParseError> {
    let mut files: Vec<(RoutineId, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(routine) = routine_from_file_name(&name) {
            files.push((routine, entry.path()));
        }
    }
    if files.is_empty() {
        return Err(TraceParseError::NoTraceFiles(dir.to_path_buf()));
    }
    files.sort();

    let mut trace = Trace::new();
    for (routine, path) in files {
        trace.ensure_routine(routine);
        let content = fs::read_to_string(&path)?;
        parse_routine(&mut trace, routine, &content, &path)?;
    }
    Ok(trace)
}

/// Extract the routine id from a `trace_<routine>.log` file name
pub fn routine_from_file_name(name: &str) -> Option<RoutineId> {
    let rest = name.strip_prefix("trace_")?;
    let num = rest.strip_suffix(".log")?;
    num.parse::<RoutineId>().ok().filter(|&r| r > 0)
}

/// Parse all lines of one routine's file into the trace
pub fn parse_routine(
    trace: &mut Trace,
    routine: RoutineId,
    content: &str,
    path: &Path,
) -> Result<(), TraceParseError> {
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_line(routine, line) {
            Ok(elem) => {
                trace.push(elem);
            }
            Err(LineError::Field(err)) => {
                warn!(
                    file = %path.display(),
                    line = lineno + 1,
                    %err,
                    "skipping malformed trace line"
                );
            }
            Err(LineError::UnknownKind(kind)) => {
                return Err(TraceParseError::UnknownKind {
                    kind,
                    file: path.to_path_buf(),
                    line: lineno + 1,
                });
            }
        }
    }
    Ok(())
}

/// Outcome of parsing one line
#[derive(Debug)]
pub enum LineError {
    /// Recoverable: skip the line
    Field(FieldError),
    /// Fatal: incompatible recorder
    UnknownKind(String),
}

impl From<FieldError> for LineError {
    fn from(e: FieldError) -> Self {
        LineError::Field(e)
    }
}

/// Parse a single trace line into an element
pub fn parse_line(routine: RoutineId, line: &str) -> Result<TraceElement, LineError> {
    let fields: Vec<&str> = line.split(',').collect();
    let kind = fields[0];
    match kind {
        "A" => parse_atomic(routine, &fields).map_err(Into::into),
        "C" => parse_channel(routine, &fields).map_err(Into::into),
        "M" => parse_mutex(routine, &fields).map_err(Into::into),
        "G" => parse_spawn(routine, &fields).map_err(Into::into),
        "S" => parse_select(routine, &fields).map_err(Into::into),
        "W" => parse_waitgroup(routine, &fields).map_err(Into::into),
        "O" => parse_once(routine, &fields).map_err(Into::into),
        "D" => parse_cond(routine, &fields).map_err(Into::into),
        "E" => parse_end(routine, &fields).map_err(Into::into),
        "X" => parse_sentinel(routine, &fields).map_err(Into::into),
        other => Err(LineError::UnknownKind(other.to_string())),
    }
}

fn need<'a>(fields: &[&'a str], idx: usize, name: &'static str) -> Result<&'a str, FieldError> {
    fields
        .get(idx)
        .copied()
        .ok_or_else(|| FieldError::new(name, "missing"))
}

fn num(fields: &[&str], idx: usize, name: &'static str) -> Result<u64, FieldError> {
    let raw = need(fields, idx, name)?;
    raw.parse::<u64>()
        .map_err(|_| FieldError::new(name, format!("'{raw}' is not a number")))
}

fn signed(fields: &[&str], idx: usize, name: &'static str) -> Result<i64, FieldError> {
    let raw = need(fields, idx, name)?;
    raw.parse::<i64>()
        .map_err(|_| FieldError::new(name, format!("'{raw}' is not a number")))
}

fn flag(fields: &[&str], idx: usize, name: &'static str) -> Result<bool, FieldError> {
    match need(fields, idx, name)? {
        "t" => Ok(true),
        "f" => Ok(false),
        other => Err(FieldError::new(name, format!("'{other}' is not t/f"))),
    }
}

fn pos(fields: &[&str], idx: usize) -> Result<SourcePos, FieldError> {
    let raw = need(fields, idx, "pos")?;
    // file paths may themselves contain ':'
    match raw.rsplit_once(':') {
        Some((file, line)) => {
            let line = line
                .parse::<u32>()
                .map_err(|_| FieldError::new("pos", format!("'{raw}' has no line number")))?;
            Ok(SourcePos::new(file, line))
        }
        None => Err(FieldError::new("pos", format!("'{raw}' is not file:line"))),
    }
}

fn parse_atomic(routine: RoutineId, f: &[&str]) -> Result<TraceElement, FieldError> {
    let op = match need(f, 4, "op")? {
        "L" => AtomicOp::Load,
        "S" => AtomicOp::Store,
        "A" => AtomicOp::Add,
        "W" => AtomicOp::Swap,
        other => return Err(FieldError::new("op", format!("'{other}' is not an atomic op"))),
    };
    Ok(TraceElement::new(
        routine,
        num(f, 1, "tpre")?,
        num(f, 2, "tpost")?,
        pos(f, 5)?,
        ElementKind::Atomic {
            id: num(f, 3, "id")?,
            op,
        },
    ))
}

fn parse_channel(routine: RoutineId, f: &[&str]) -> Result<TraceElement, FieldError> {
    let op = match need(f, 4, "op")? {
        "S" => ChannelOp::Send,
        "R" => ChannelOp::Recv,
        "C" => ChannelOp::Close,
        other => return Err(FieldError::new("op", format!("'{other}' is not a channel op"))),
    };
    Ok(TraceElement::new(
        routine,
        num(f, 1, "tpre")?,
        num(f, 2, "tpost")?,
        pos(f, 8)?,
        ElementKind::Channel {
            id: num(f, 3, "id")?,
            op,
            closed: flag(f, 5, "cl")?,
            op_id: num(f, 6, "oid")?,
            q_size: num(f, 7, "qsize")? as usize,
            partner: None,
        },
    ))
}

fn parse_mutex(routine: RoutineId, f: &[&str]) -> Result<TraceElement, FieldError> {
    let op = match need(f, 4, "op")? {
        "L" => MutexOp::Lock,
        "R" => MutexOp::RLock,
        "T" => MutexOp::TryLock,
        "N" => MutexOp::TryRLock,
        "U" => MutexOp::Unlock,
        "Q" => MutexOp::RUnlock,
        other => return Err(FieldError::new("op", format!("'{other}' is not a mutex op"))),
    };
    Ok(TraceElement::new(
        routine,
        num(f, 1, "tpre")?,
        num(f, 2, "tpost")?,
        pos(f, 6)?,
        ElementKind::Mutex {
            id: num(f, 3, "id")?,
            op,
            success: flag(f, 5, "suc")?,
        },
    ))
}

fn parse_spawn(routine: RoutineId, f: &[&str]) -> Result<TraceElement, FieldError> {
    let t_post = num(f, 1, "tpost")?;
    Ok(TraceElement::new(
        routine,
        t_post,
        t_post,
        pos(f, 3)?,
        ElementKind::Spawn {
            child: num(f, 2, "id")? as RoutineId,
        },
    ))
}

fn parse_select(routine: RoutineId, f: &[&str]) -> Result<TraceElement, FieldError> {
    let mut cases = Vec::new();
    let mut has_default = false;
    let raw_cases = need(f, 4, "cases")?;
    if !raw_cases.is_empty() {
        for part in raw_cases.split('~') {
            if part == "d" {
                has_default = true;
                continue;
            }
            let bits: Vec<&str> = part.split('.').collect();
            if bits.len() != 3 {
                return Err(FieldError::new("cases", format!("'{part}' is not cid.d.oid")));
            }
            let channel = bits[0]
                .parse::<u64>()
                .map_err(|_| FieldError::new("cases", format!("'{}' is not a channel id", bits[0])))?;
            let dir = match bits[1] {
                "s" => ChannelOp::Send,
                "r" => ChannelOp::Recv,
                other => return Err(FieldError::new("cases", format!("'{other}' is not s/r"))),
            };
            let op_id = bits[2]
                .parse::<u64>()
                .map_err(|_| FieldError::new("cases", format!("'{}' is not an op id", bits[2])))?;
            cases.push(SelectCase { channel, dir, op_id });
        }
    }
    let t_post = num(f, 2, "tpost")?;
    let chosen = match need(f, 5, "chosen")? {
        "d" if has_default => ChosenCase::Default,
        "d" => return Err(FieldError::new("chosen", "default chosen but no default case")),
        "b" => ChosenCase::Blocked,
        raw => {
            let idx = raw
                .parse::<usize>()
                .map_err(|_| FieldError::new("chosen", format!("'{raw}' is not an index")))?;
            if idx >= cases.len() {
                return Err(FieldError::new("chosen", format!("index {idx} out of range")));
            }
            ChosenCase::Case(idx)
        }
    };
    if matches!(chosen, ChosenCase::Blocked) && t_post != 0 {
        return Err(FieldError::new("chosen", "blocked select with nonzero tpost"));
    }
    Ok(TraceElement::new(
        routine,
        num(f, 1, "tpre")?,
        t_post,
        pos(f, 6)?,
        ElementKind::Select {
            id: num(f, 3, "id")?,
            cases,
            chosen,
            partner: None,
        },
    ))
}

fn parse_waitgroup(routine: RoutineId, f: &[&str]) -> Result<TraceElement, FieldError> {
    let op = match need(f, 4, "op")? {
        "A" => WaitGroupOp::Change,
        "W" => WaitGroupOp::Wait,
        other => return Err(FieldError::new("op", format!("'{other}' is not a wait-group op"))),
    };
    Ok(TraceElement::new(
        routine,
        num(f, 1, "tpre")?,
        num(f, 2, "tpost")?,
        pos(f, 7)?,
        ElementKind::WaitGroup {
            id: num(f, 3, "id")?,
            op,
            delta: signed(f, 5, "delta")?,
            value: signed(f, 6, "val")?,
        },
    ))
}

fn parse_once(routine: RoutineId, f: &[&str]) -> Result<TraceElement, FieldError> {
    Ok(TraceElement::new(
        routine,
        num(f, 1, "tpre")?,
        num(f, 2, "tpost")?,
        pos(f, 5)?,
        ElementKind::Once {
            id: num(f, 3, "id")?,
            winner: flag(f, 4, "suc")?,
        },
    ))
}

fn parse_cond(routine: RoutineId, f: &[&str]) -> Result<TraceElement, FieldError> {
    let op = match need(f, 4, "op")? {
        "W" => CondOp::Wait,
        "S" => CondOp::Signal,
        "B" => CondOp::Broadcast,
        other => return Err(FieldError::new("op", format!("'{other}' is not a cond op"))),
    };
    Ok(TraceElement::new(
        routine,
        num(f, 1, "tpre")?,
        num(f, 2, "tpost")?,
        pos(f, 5)?,
        ElementKind::Cond {
            id: num(f, 3, "id")?,
            op,
        },
    ))
}

fn parse_end(routine: RoutineId, f: &[&str]) -> Result<TraceElement, FieldError> {
    let t_post = num(f, 1, "tpost")?;
    Ok(TraceElement::new(
        routine,
        t_post,
        t_post,
        SourcePos::new("", 0),
        ElementKind::RoutineEnd,
    ))
}

fn parse_sentinel(routine: RoutineId, f: &[&str]) -> Result<TraceElement, FieldError> {
    let t_post = num(f, 1, "tpost")?;
    Ok(TraceElement::new(
        routine,
        t_post,
        t_post,
        SourcePos::new("", 0),
        ElementKind::ReplaySentinel {
            code: num(f, 2, "code")? as u32,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routine_from_file_name() {
        assert_eq!(routine_from_file_name("trace_1.log"), Some(1));
        assert_eq!(routine_from_file_name("trace_17.log"), Some(17));
        assert_eq!(routine_from_file_name("trace_0.log"), None);
        assert_eq!(routine_from_file_name("trace.log"), None);
        assert_eq!(routine_from_file_name("readable.log"), None);
    }

    #[test]
    fn test_parse_channel_send() {
        let e = parse_line(1, "C,3,4,7,S,f,1,0,main.go:42").unwrap();
        assert_eq!(e.routine, 1);
        assert_eq!(e.t_pre, 3);
        assert_eq!(e.t_post, 4);
        assert_eq!(e.pos, SourcePos::new("main.go", 42));
        match e.kind {
            ElementKind::Channel { id, op, op_id, q_size, .. } => {
                assert_eq!(id, 7);
                assert_eq!(op, ChannelOp::Send);
                assert_eq!(op_id, 1);
                assert_eq!(q_size, 0);
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn test_parse_mutex_try_failure() {
        let e = parse_line(2, "M,9,10,3,T,f,mu.go:8").unwrap();
        match e.kind {
            ElementKind::Mutex { op, success, .. } => {
                assert_eq!(op, MutexOp::TryLock);
                assert!(!success);
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn test_parse_select_cases() {
        let e = parse_line(1, "S,5,8,11,3.r.2~4.s.1~d,0,sel.go:20").unwrap();
        match e.kind {
            ElementKind::Select { cases, chosen, .. } => {
                assert_eq!(cases.len(), 2);
                assert_eq!(cases[0].channel, 3);
                assert_eq!(cases[0].dir, ChannelOp::Recv);
                assert_eq!(cases[1].dir, ChannelOp::Send);
                assert_eq!(chosen, ChosenCase::Case(0));
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn test_parse_blocked_select() {
        let e = parse_line(1, "S,5,0,11,3.r.2,b,sel.go:20").unwrap();
        assert!(e.is_blocked());
        match e.kind {
            ElementKind::Select { chosen, .. } => assert_eq!(chosen, ChosenCase::Blocked),
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn test_parse_spawn_and_end() {
        let g = parse_line(1, "G,2,3,main.go:10").unwrap();
        assert!(matches!(g.kind, ElementKind::Spawn { child: 3 }));
        let e = parse_line(3, "E,99").unwrap();
        assert!(matches!(e.kind, ElementKind::RoutineEnd));
        assert_eq!(e.t_post, 99);
    }

    #[test]
    fn test_unknown_kind_is_fatal() {
        match parse_line(1, "Z,1,2,3") {
            Err(LineError::UnknownKind(kind)) => assert_eq!(kind, "Z"),
            other => panic!("expected UnknownKind, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_field_is_recoverable() {
        match parse_line(1, "C,notanumber,4,7,S,f,1,0,main.go:42") {
            Err(LineError::Field(_)) => {}
            other => panic!("expected Field error, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_line_skipped_trace_continues() {
        let mut trace = Trace::new();
        let content = "C,1,2,7,S,f,1,0,a.go:1\nM,bogus\nC,3,4,7,R,f,2,0,a.go:2\n";
        parse_routine(&mut trace, 1, content, Path::new("trace_1.log")).unwrap();
        assert_eq!(trace.routine(1).len(), 2);
    }

    #[test]
    fn test_unknown_kind_aborts_routine() {
        let mut trace = Trace::new();
        let content = "C,1,2,7,S,f,1,0,a.go:1\nZ,1,2\n";
        let err = parse_routine(&mut trace, 1, content, Path::new("trace_1.log"));
        assert!(err.is_err());
    }

    #[test]
    fn test_pos_with_colons_in_path() {
        let e = parse_line(1, "D,1,2,4,W,C:/src/main.go:17").unwrap();
        assert_eq!(e.pos, SourcePos::new("C:/src/main.go", 17));
    }

    #[test]
    fn test_parse_waitgroup_negative_delta() {
        let e = parse_line(1, "W,1,2,5,A,-1,2,wg.go:30").unwrap();
        match e.kind {
            ElementKind::WaitGroup { delta, value, op, .. } => {
                assert_eq!(op, WaitGroupOp::Change);
                assert_eq!(delta, -1);
                assert_eq!(value, 2);
            }
            other => panic!("wrong kind: {other:?}"),
        }
    }

    #[test]
    fn test_parse_sentinel() {
        let e = parse_line(1, "X,50,34").unwrap();
        assert!(matches!(e.kind, ElementKind::ReplaySentinel { code: 34 }));
    }
}
