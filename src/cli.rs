use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

use crate::constants::DEFAULT_ARTIFACTS_DIR;

/// Command-line arguments for the artifact sensor.
///
/// Each subcommand is one step of a monitored run: snapshot the filesystem,
/// prepare the artifacts directory, process the monitor reports and archive
/// the results.
#[derive(Parser, Debug)]
#[clap(name = "artifact-sensor", about = "Container artifact sensor", version)]
pub struct Args {
    /// Verbose logging
    #[clap(short, long, global = true)]
    pub verbose: bool,

    /// Also write the log to this file
    #[clap(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// Available subcommands for the sensor.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Record the regular files and symlinks present before the app runs
    Snapshot(SnapshotOpts),

    /// Create the artifacts directory and stash preserved paths
    Prepare(PrepareOpts),

    /// Turn monitor reports into the retained file tree and container report
    Process(ProcessOpts),

    /// Pack the run data into run.tar
    Archive(ArchiveOpts),
}

#[derive(ClapArgs, Debug)]
pub struct SnapshotOpts {
    /// Root of the filesystem to snapshot
    #[clap(long, default_value = "/")]
    pub root: PathBuf,

    /// Start command whose excludes apply to the walk
    #[clap(short, long)]
    pub command: Option<PathBuf>,

    /// Where to write the path list (JSON)
    #[clap(short, long)]
    pub output: PathBuf,
}

#[derive(ClapArgs, Debug)]
pub struct PrepareOpts {
    /// Start command (JSON or YAML)
    #[clap(short, long)]
    pub command: PathBuf,

    /// Artifacts directory
    #[clap(short, long, default_value = DEFAULT_ARTIFACTS_DIR)]
    pub artifacts_dir: PathBuf,
}

#[derive(ClapArgs, Debug)]
pub struct ProcessOpts {
    /// Start command (JSON or YAML)
    #[clap(short, long)]
    pub command: PathBuf,

    /// File access monitor report (JSON)
    #[clap(long)]
    pub fan_report: PathBuf,

    /// Syscall trace monitor report (JSON)
    #[clap(long)]
    pub pt_report: Option<PathBuf>,

    /// Artifacts directory
    #[clap(short, long, default_value = DEFAULT_ARTIFACTS_DIR)]
    pub artifacts_dir: PathBuf,

    /// Mount point of the monitored filesystem
    #[clap(short, long, default_value = "/")]
    pub mount_point: PathBuf,

    /// Lookup table overrides (YAML)
    #[clap(long)]
    pub rules: Option<PathBuf>,

    /// Pre-run path list written by `snapshot`
    #[clap(long)]
    pub snapshot: Option<PathBuf>,

    /// Also write files.tar
    #[clap(long)]
    pub archive_files: bool,
}

#[derive(ClapArgs, Debug)]
pub struct ArchiveOpts {
    /// Artifacts directory
    #[clap(short, long, default_value = DEFAULT_ARTIFACTS_DIR)]
    pub artifacts_dir: PathBuf,

    /// Extra files to add to the archive
    #[clap(long)]
    pub extra: Vec<PathBuf>,
}
