//! Shared helpers for integration tests: write trace directories on disk

use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Create a trace directory from per-routine line lists
///
/// `routines[i]` becomes `trace_<i+1>.log`.
pub fn trace_dir(routines: &[&[&str]]) -> TempDir {
    let dir = tempfile::tempdir().expect("create temp dir");
    for (i, lines) in routines.iter().enumerate() {
        write_routine(dir.path(), i + 1, lines);
    }
    dir
}

/// Write one routine's trace file
pub fn write_routine(dir: &Path, routine: usize, lines: &[&str]) {
    let mut content = String::new();
    for line in lines {
        content.push_str(line);
        content.push('\n');
    }
    fs::write(dir.join(format!("trace_{routine}.log")), content).expect("write trace file");
}
