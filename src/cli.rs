use std::path::PathBuf;

use clap::builder::RangedU64ValueParser;
use clap::{Parser, ValueEnum};

/// Command line interface definition for sigdrain.
#[derive(Parser, Debug)]
#[command(name = "sigdrain")]
#[command(about = "Count words with a worker pool that drains cleanly on SIGINT/SIGTERM")]
#[command(version)]
pub struct Cli {
    /// Text file every task reads
    #[arg(value_name = "FILE")]
    pub input: PathBuf,

    /// Worker threads (default: available parallelism)
    #[arg(short, long, value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    pub workers: Option<usize>,

    /// Tasks to schedule against the input
    #[arg(short, long, value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    pub tasks: Option<usize>,

    /// Bound on queued tasks
    #[arg(long, value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    pub queue_capacity: Option<usize>,

    /// Milliseconds between status dumps
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub status_interval_ms: Option<u64>,

    /// Output format for the final report
    #[arg(long, value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Increase logging verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbosity: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbosity")]
    pub quiet: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human readable summary
    Text,
    /// Pretty-printed JSON report
    Json,
}
