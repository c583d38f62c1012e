use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::Path;
use std::time::Duration;
use vigia::analysis::{run_analysis, AnalysisOptions, Scenarios};
use vigia::cli::{Cli, Command, OutputFormat};
use vigia::report::{self, JsonReport};
use vigia::rewriter::{rewrite, RewriteOutcome};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    match cli.command {
        Command::Analyze {
            trace_dir,
            fifo,
            ignore_critical_sections,
            scenarios,
            timeout,
            format,
            output,
        } => {
            let options = AnalysisOptions {
                assume_fifo: fifo,
                ignore_critical_sections,
                scenarios: Scenarios::parse(&scenarios)?,
                timeout: timeout.map(Duration::from_secs),
            };
            analyze(&trace_dir, &options, format, output.as_deref())
        }
        Command::Rewrite {
            trace_dir,
            bug,
            all,
            output,
            fifo,
        } => {
            let options = AnalysisOptions {
                assume_fifo: fifo,
                ..Default::default()
            };
            run_rewrite(&trace_dir, &options, bug, all, &output)
        }
    }
}

fn analyze(
    trace_dir: &Path,
    options: &AnalysisOptions,
    format: OutputFormat,
    output: Option<&Path>,
) -> Result<()> {
    let report = run_analysis(trace_dir, options)
        .with_context(|| format!("analyzing {}", trace_dir.display()))?;
    match format {
        OutputFormat::Text => {
            print!("{}", report::readable_log(&report.bugs));
        }
        OutputFormat::Json => {
            println!("{}", JsonReport::new(&report).to_json()?);
        }
    }
    if let Some(dir) = output {
        let (machine, readable) = report::write_logs(&report.bugs, dir)
            .with_context(|| format!("writing logs to {}", dir.display()))?;
        eprintln!("wrote {} and {}", machine.display(), readable.display());
    }
    Ok(())
}

fn run_rewrite(
    trace_dir: &Path,
    options: &AnalysisOptions,
    bug_index: Option<usize>,
    all: bool,
    output: &Path,
) -> Result<()> {
    let report = run_analysis(trace_dir, options)
        .with_context(|| format!("analyzing {}", trace_dir.display()))?;
    if report.bugs.is_empty() {
        println!("no findings to rewrite");
        return Ok(());
    }
    let indices: Vec<usize> = match (bug_index, all) {
        (Some(i), _) => {
            if i >= report.bugs.len() {
                bail!(
                    "finding index {i} out of range ({} findings)",
                    report.bugs.len()
                );
            }
            vec![i]
        }
        (None, true) => (0..report.bugs.len()).collect(),
        (None, false) => bail!("pass --bug N or --all"),
    };
    for i in indices {
        let bug = &report.bugs[i];
        let dir = if all {
            output.join(format!("rewrite_{i}"))
        } else {
            output.to_path_buf()
        };
        match rewrite(&report.trace, bug, &dir)
            .with_context(|| format!("rewriting finding {i}"))?
        {
            RewriteOutcome::Written { files } => {
                println!("[{i}] {}: wrote {} files to {}", bug.kind.code(), files.len(), dir.display());
            }
            RewriteOutcome::NotNeeded => {
                println!("[{i}] {}: recorded order already triggers the bug", bug.kind.code());
            }
            RewriteOutcome::NotPossible(reason) => {
                println!("[{i}] {}: not rewritable ({reason})", bug.kind.code());
            }
        }
    }
    Ok(())
}
