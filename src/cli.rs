use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kubectl-chronicle")]
#[command(about = "Record every change of every Kubernetes resource and show what changed")]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Record all changes to resource objects (and optionally pod logs)
    Record(RecordArgs),
    /// Show the changes recorded since the last recording started. No
    /// connection to a cluster is needed.
    Deltas(DeltasArgs),
    /// List every recorded snapshot of objects whose name contains a text
    Find(FindArgs),
}

#[derive(Args)]
pub struct RecordArgs {
    /// Directory to write snapshots to, one subdirectory per cluster
    #[arg(short, long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Record logs of pods
    #[arg(short, long)]
    pub with_logs: bool,

    /// File with log lines to ignore. Syntax: 'file-regex ~~ line-regex'. The
    /// file regex matches namespace/pod/container; without a line regex the
    /// container is not tailed. Lines starting with '#' are ignored.
    #[arg(long)]
    pub ignore_log_lines_file: Option<PathBuf>,

    /// Do not watch resources. Only meaningful with --with-logs
    #[arg(long)]
    pub disable_resource_recording: bool,

    /// Kubeconfig context to use instead of the current one
    #[arg(long)]
    pub context: Option<String>,

    /// How far back to start reading each container's log, in seconds
    #[arg(long, default_value_t = 1)]
    pub log_lookback_seconds: i64,

    /// How long to wait for tasks to stop after an interrupt before exiting
    #[arg(long, default_value_t = 3)]
    pub shutdown_grace_seconds: u64,
}

#[derive(Args)]
pub struct DeltasArgs {
    /// Directory of one cluster, as created by `record`
    pub dir: PathBuf,

    /// Skip partitions whose path (e.g. apps/Deployment/default/web) matches
    #[arg(long)]
    pub skip: Vec<String>,

    /// Only show partitions whose path matches. Overrides --skip
    #[arg(long)]
    pub only: Vec<String>,

    /// Do not show the first snapshot of an object
    #[arg(long)]
    pub skip_initial: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,
}

#[derive(Args)]
pub struct FindArgs {
    /// Directory of one cluster, as created by `record`
    pub dir: PathBuf,

    /// Part of the object name to look for
    pub name: String,

    /// Print the stored content of each record as well
    #[arg(short, long)]
    pub content: bool,
}
