//! CLI argument parsing for Callbench

use std::path::PathBuf;

use clap::Parser;

use crate::privilege::Identity;

#[derive(Parser, Debug)]
#[command(name = "callbench")]
#[command(version)]
#[command(about = "System call benchmarking with periodic checkpoints", long_about = None)]
pub struct Cli {
    /// Duration to run the benchmark, forever if omitted (e.g. 90, 5m, 1h, 1m30s, or "1m 30s")
    #[arg(short = 'd', long = "duration", value_name = "TIME", num_args = 1..)]
    pub duration: Vec<String>,

    /// Interval between checkpoints (default: 30m)
    #[arg(short = 'c', long = "checkpoint", value_name = "TIME", num_args = 1..)]
    pub checkpoint: Vec<String>,

    /// Rewrite this file at every checkpoint
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Write a numbered file (callbench.N) per checkpoint into this directory
    #[arg(long = "outdir", value_name = "DIR")]
    pub outdir: Option<PathBuf>,

    /// Allow overwriting existing output files
    #[arg(long = "overwrite")]
    pub overwrite: bool,

    /// Also print every snapshot to stderr
    #[arg(long = "tee")]
    pub tee: bool,

    /// Sort by name, id, count, overhead or avg-overhead
    #[arg(long = "sort", value_name = "KEY", default_value = "avg-overhead")]
    pub sort: String,

    /// Print the system call number column
    #[arg(long = "sysnum")]
    pub sysnum: bool,

    /// Omit the average overhead column
    #[arg(long = "no-average", alias = "noavg")]
    pub no_average: bool,

    /// Report activity since the previous checkpoint instead of running totals
    #[arg(long = "interval")]
    pub interval: bool,

    /// Attach to running process by PID (mutually exclusive with command)
    #[arg(short = 'p', long = "pid", value_name = "PID")]
    pub pid: Option<i32>,

    /// Follow child processes (requires -p or a command)
    #[arg(short = 'f', long = "follow")]
    pub follow: bool,

    /// Unprivileged identity for writing results (default: SUDO_UID/SUDO_GID)
    #[arg(short = 'u', long = "user", value_name = "UID[:GID]")]
    pub user: Option<Identity>,

    /// Enable debug logging
    #[arg(long = "debug", hide = true)]
    pub debug: bool,

    /// Command to benchmark (everything after --)
    #[arg(last = true)]
    pub command: Option<Vec<String>>,
}
