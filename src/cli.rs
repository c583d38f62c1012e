//! CLI argument parsing for Vigia

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Output format for analysis reports
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "vigia")]
#[command(version)]
#[command(about = "Offline happens-before analyzer for recorded concurrency traces", long_about = None)]
pub struct Cli {
    /// Enable debug logging to stderr
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Analyze a directory of per-routine trace files
    Analyze {
        /// Directory containing trace_<routine>.log files
        trace_dir: PathBuf,

        /// Model per-routine FIFO delivery on buffered channels
        #[arg(long)]
        fifo: bool,

        /// Drop lock-release happens-before edges
        #[arg(long = "ignore-critical-sections")]
        ignore_critical_sections: bool,

        /// Detector families to run (comma-separated: all, close, recv, flow,
        /// cyclic, resource, leak, select)
        #[arg(long, value_name = "LIST", default_value = "all")]
        scenarios: String,

        /// Abort the analysis after this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,

        /// Output format (text or json)
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,

        /// Write machine_readable.log and readable.log into this directory
        #[arg(long, value_name = "DIR")]
        output: Option<PathBuf>,
    },

    /// Rewrite a trace so one finding triggers during replay
    Rewrite {
        /// Directory containing trace_<routine>.log files
        trace_dir: PathBuf,

        /// Index of the finding (from the analyze output) to reproduce
        #[arg(long, value_name = "N")]
        bug: Option<usize>,

        /// Attempt a rewrite for every repairable finding
        #[arg(long, conflicts_with = "bug")]
        all: bool,

        /// Directory to write the rewritten trace into
        #[arg(long, value_name = "DIR")]
        output: PathBuf,

        /// Model per-routine FIFO delivery on buffered channels
        #[arg(long)]
        fifo: bool,
    },
}
