use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, LevelFilter};
use simplelog::{
    ColorChoice, CombinedLogger, Config, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};

use artifact_sensor::artifacts::save::exclude_patterns;
use artifact_sensor::artifacts::Processor;
use artifact_sensor::cli::{Args, ArchiveOpts, Commands, PrepareOpts, ProcessOpts, SnapshotOpts};
use artifact_sensor::config::{ArtifactRules, StartCommand};
use artifact_sensor::inspect::LddResolver;
use artifact_sensor::report::MonitorReports;

fn main() {
    let args = Args::parse();

    if let Err(e) = initialize_logging(args.verbose, args.log_file.as_deref()) {
        eprintln!("Failed to initialize logging: {:#}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(args.command) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Initialize logging with the specified verbosity level
fn initialize_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let log_level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        log_level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];

    if let Some(path) = log_file {
        let file = File::create(path)
            .context(format!("Failed to create log file: {}", path.display()))?;
        loggers.push(WriteLogger::new(log_level, Config::default(), file));
    }

    CombinedLogger::init(loggers).context("Failed to initialize logger")?;
    Ok(())
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Snapshot(opts) => snapshot(&opts),
        Commands::Prepare(opts) => prepare(&opts),
        Commands::Process(opts) => process(&opts),
        Commands::Archive(opts) => archive(&opts),
    }
}

fn snapshot(opts: &SnapshotOpts) -> Result<()> {
    let excludes = match &opts.command {
        Some(path) => exclude_patterns(&StartCommand::from_file(path)?),
        None => Vec::new(),
    };

    let mut processor = Processor::new(Path::new("."), Vec::new());
    let paths = processor.current_paths(&opts.root, &excludes);

    let data = serde_json::to_vec_pretty(&paths).context("Failed to serialize snapshot")?;
    fs::write(&opts.output, data)
        .context(format!("Failed to write snapshot: {}", opts.output.display()))?;

    info!("Snapshot with {} paths saved to {}", paths.len(), opts.output.display());
    Ok(())
}

fn prepare(opts: &PrepareOpts) -> Result<()> {
    let cmd = StartCommand::from_file(&opts.command)?;
    Processor::new(&opts.artifacts_dir, Vec::new()).prepare_env(&cmd)?;
    info!("Artifacts directory ready at {}", opts.artifacts_dir.display());
    Ok(())
}

fn process(opts: &ProcessOpts) -> Result<()> {
    let cmd = StartCommand::from_file(&opts.command)?;
    let rules = match &opts.rules {
        Some(path) => ArtifactRules::from_yaml_file(path)?,
        None => ArtifactRules::default(),
    };
    let monitors = MonitorReports::from_files(&opts.fan_report, opts.pt_report.as_deref())?;

    let mut processor = Processor::new(&opts.artifacts_dir, Vec::new());
    if let Some(path) = &opts.snapshot {
        processor.set_orig_paths(load_snapshot(path)?);
    }

    let resolver = LddResolver::new();
    let report = processor.process(&cmd, &opts.mount_point, &monitors, &rules, &resolver)?;
    info!("Retained {} artifacts", report.image.files.len());

    if opts.archive_files {
        let output = processor.archive_files()?;
        info!("File tree archived to {}", output.display());
    }
    Ok(())
}

fn archive(opts: &ArchiveOpts) -> Result<()> {
    let processor = Processor::new(&opts.artifacts_dir, opts.extra.clone());
    let output = processor.archive()?;
    info!("Run data archived to {}", output.display());
    Ok(())
}

fn load_snapshot(path: &Path) -> Result<BTreeSet<String>> {
    let data = fs::read(path).context(format!("Failed to read snapshot: {}", path.display()))?;
    serde_json::from_slice(&data).context(format!("Failed to parse snapshot: {}", path.display()))
}
