//! Report output: machine log, readable log, JSON
//!
//! Three renderings of the same findings:
//!
//! - `machine_readable.log` — one encoded line per bug, the format the replay
//!   tooling consumes;
//! - `readable.log` — findings grouped by severity for humans;
//! - `--format json` — a serializable mirror of the report for downstream
//!   tooling.

use crate::analysis::AnalysisReport;
use crate::bug::{Bug, BugElement, Severity};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Source reference of one involved operation
#[derive(Debug, Clone, Serialize)]
pub struct JsonOperation {
    pub routine: usize,
    pub object_id: u64,
    pub object_type: String,
    pub file: String,
    pub line: u32,
}

impl From<&BugElement> for JsonOperation {
    fn from(e: &BugElement) -> Self {
        Self {
            routine: e.routine,
            object_id: e.object_id,
            object_type: e.object_type.to_string(),
            file: e.file.clone(),
            line: e.line,
        }
    }
}

/// One finding
#[derive(Debug, Clone, Serialize)]
pub struct JsonBug {
    pub code: String,
    pub severity: Severity,
    pub description: String,
    pub operations: Vec<JsonOperation>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<JsonOperation>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub case_indices: Vec<i64>,
}

impl From<&Bug> for JsonBug {
    fn from(bug: &Bug) -> Self {
        Self {
            code: bug.kind.code().to_string(),
            severity: bug.kind.severity(),
            description: bug.kind.describe().to_string(),
            operations: bug.primary.iter().map(JsonOperation::from).collect(),
            related: bug.secondary.iter().map(JsonOperation::from).collect(),
            case_indices: bug.cases.iter().map(|c| c.case_index).collect(),
        }
    }
}

/// Top-level JSON report
#[derive(Debug, Clone, Serialize)]
pub struct JsonReport {
    pub routines: usize,
    pub elapsed_ms: u128,
    pub critical: usize,
    pub warnings: usize,
    pub informational: usize,
    pub bugs: Vec<JsonBug>,
}

impl JsonReport {
    pub fn new(report: &AnalysisReport) -> Self {
        let count = |s: Severity| {
            report
                .bugs
                .iter()
                .filter(|b| b.kind.severity() == s)
                .count()
        };
        Self {
            routines: report.n_routines,
            elapsed_ms: report.elapsed.as_millis(),
            critical: count(Severity::Critical),
            warnings: count(Severity::Warning),
            informational: count(Severity::Informational),
            bugs: report.bugs.iter().map(JsonBug::from).collect(),
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Render the machine log, one line per finding
pub fn machine_log(bugs: &[Bug]) -> String {
    let mut out = String::new();
    for bug in bugs {
        out.push_str(&bug.machine_line());
        out.push('\n');
    }
    out
}

/// Render the human-readable log grouped by severity
pub fn readable_log(bugs: &[Bug]) -> String {
    let mut out = String::new();
    for (severity, heading) in [
        (Severity::Critical, "Critical"),
        (Severity::Warning, "Warning"),
        (Severity::Informational, "Informational"),
    ] {
        let group: Vec<&Bug> = bugs.iter().filter(|b| b.kind.severity() == severity).collect();
        if group.is_empty() {
            continue;
        }
        out.push_str(&format!("=== {heading} ({}) ===\n", group.len()));
        for bug in group {
            out.push_str(&format!("[{}] {bug}", bug.kind.code()));
        }
        out.push('\n');
    }
    if out.is_empty() {
        out.push_str("No findings.\n");
    }
    out
}

/// Write both log files into a directory, returning their paths
pub fn write_logs(bugs: &[Bug], dir: &Path) -> io::Result<(PathBuf, PathBuf)> {
    fs::create_dir_all(dir)?;
    let machine = dir.join("machine_readable.log");
    let readable = dir.join("readable.log");
    fs::write(&machine, machine_log(bugs))?;
    fs::write(&readable, readable_log(bugs))?;
    Ok((machine, readable))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bug::{BugElement, BugKind};
    use crate::trace::element::ElementRef;

    fn sample_bug(kind: BugKind) -> Bug {
        Bug::new(
            kind,
            vec![BugElement {
                elem: ElementRef::new(1, 0),
                routine: 1,
                object_id: 4,
                t_pre: 1,
                object_type: "CS",
                file: "main.go".into(),
                line: 10,
            }],
            Vec::new(),
        )
    }

    #[test]
    fn test_machine_log_one_line_per_bug() {
        let bugs = vec![
            sample_bug(BugKind::ActualSendOnClosed),
            sample_bug(BugKind::PossibleSendOnClosed),
        ];
        let log = machine_log(&bugs);
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("A01,"));
        assert!(lines[1].starts_with("P01,"));
    }

    #[test]
    fn test_readable_log_groups_by_severity() {
        let bugs = vec![
            sample_bug(BugKind::ActualSendOnClosed),
            sample_bug(BugKind::PossibleSendOnClosed),
            sample_bug(BugKind::SelectCaseNeverTriggerable),
        ];
        let log = readable_log(&bugs);
        let crit = log.find("=== Critical (1)").unwrap();
        let warn = log.find("=== Warning (1)").unwrap();
        let info = log.find("=== Informational (1)").unwrap();
        assert!(crit < warn && warn < info);
    }

    #[test]
    fn test_readable_log_empty() {
        assert_eq!(readable_log(&[]), "No findings.\n");
    }

    #[test]
    fn test_json_report_counts() {
        let report = AnalysisReport {
            bugs: vec![
                sample_bug(BugKind::ActualSendOnClosed),
                sample_bug(BugKind::PossibleSendOnClosed),
            ],
            trace: crate::trace::Trace::new(),
            n_routines: 2,
            elapsed: std::time::Duration::from_millis(3),
        };
        let json = JsonReport::new(&report);
        assert_eq!(json.critical, 1);
        assert_eq!(json.warnings, 1);
        assert_eq!(json.informational, 0);
        let text = json.to_json().unwrap();
        assert!(text.contains("\"code\": \"A01\""));
    }

    #[test]
    fn test_write_logs_creates_files() {
        let dir = tempfile::tempdir().unwrap();
        let bugs = vec![sample_bug(BugKind::ActualSendOnClosed)];
        let (machine, readable) = write_logs(&bugs, dir.path()).unwrap();
        assert!(machine.exists());
        assert!(readable.exists());
        let content = fs::read_to_string(machine).unwrap();
        assert!(content.starts_with("A01,"));
    }
}
