//! Top-level driver for one sensor run: prepares the artifacts directory,
//! turns monitor reports into a retained file tree plus report, and packs the
//! run data into tar archives.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info};

use crate::artifacts::fsutil;
use crate::artifacts::matcher::PathMatcher;
use crate::artifacts::save::exclude_patterns;
use crate::artifacts::store::{ArtifactStore, StoreEnv};
use crate::artifacts::symlinks::SymlinkCloser;
use crate::artifacts::walker::{self, is_filtered_path};
use crate::config::{ArtifactRules, StartCommand};
use crate::constants::{
    FILES_ARCHIVE_NAME, FILES_DIR_NAME, MONITOR_EVENT_LOG_FILE_NAME, PRESERVED_DIR_NAME,
    RUN_ARCHIVE_NAME,
};
use crate::inspect::DependencyResolver;
use crate::report::{ContainerReport, MonitorReports, SensorInfo};
use crate::utils::archive::{write_dir_tar, write_tar, ArchiveEntry};

/// Owns the artifacts directory for one run
pub struct Processor {
    artifacts_dir: PathBuf,
    /// Files outside the artifacts directory that go into `run.tar`
    extra_files: Vec<PathBuf>,
    orig_paths: BTreeSet<String>,
    sensor: SensorInfo,
}

impl Processor {
    pub fn new(artifacts_dir: &Path, extra_files: Vec<PathBuf>) -> Self {
        Processor {
            artifacts_dir: artifacts_dir.to_path_buf(),
            extra_files,
            orig_paths: BTreeSet::new(),
            sensor: SensorInfo::current(),
        }
    }

    pub fn with_sensor_info(mut self, sensor: SensorInfo) -> Self {
        self.sensor = sensor;
        self
    }

    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    /// Pre-run snapshot recorded by [`Processor::current_paths`] or [`Processor::set_orig_paths`]
    pub fn orig_paths(&self) -> &BTreeSet<String> {
        &self.orig_paths
    }

    pub fn set_orig_paths(&mut self, paths: BTreeSet<String>) {
        self.orig_paths = paths;
    }

    /// Snapshot regular files and symlinks under `root` and keep it for the run
    pub fn current_paths(&mut self, root: &Path, excludes: &[String]) -> BTreeSet<String> {
        let matcher = PathMatcher::new(excludes);
        let paths = walker::current_paths(root, &matcher);
        info!("Snapshot of {} has {} paths", root.display(), paths.len());
        self.orig_paths = paths.clone();
        paths
    }

    /// Create the output root and stash the preserved paths before the app runs
    pub fn prepare_env(&self, cmd: &StartCommand) -> Result<()> {
        let files_dir = self.artifacts_dir.join(FILES_DIR_NAME);
        fs::create_dir_all(&files_dir)
            .with_context(|| format!("Failed to create output root: {}", files_dir.display()))?;

        if cmd.preserves.is_empty() {
            return Ok(());
        }

        let preserved_dir = self.artifacts_dir.join(PRESERVED_DIR_NAME);
        fs::create_dir_all(&preserved_dir).with_context(|| {
            format!("Failed to create preserved dir: {}", preserved_dir.display())
        })?;

        info!("Preserving {} paths", cmd.preserves.len());
        let none = PathMatcher::default();
        for path in cmd.preserves.keys() {
            let src = Path::new(path);
            if is_filtered_path(src) {
                debug!("Skipping filtered preserve path {}", path);
                continue;
            }

            let metadata = match fs::symlink_metadata(src) {
                Ok(m) => m,
                Err(e) => {
                    debug!("Skipping preserve path {}: {}", path, e);
                    continue;
                }
            };

            let dst = fsutil::output_path(&preserved_dir, src);
            let result = fsutil::ensure_contained(&preserved_dir, &dst).and_then(|_| {
                if metadata.is_dir() {
                    fsutil::copy_dir(cmd.keep_perms, src, &preserved_dir, &dst, &none).map(|errors| {
                        if !errors.is_empty() {
                            debug!("Preserving {} had {} errors", path, errors.len());
                        }
                    })
                } else {
                    fsutil::copy_file(cmd.keep_perms, src, &dst)
                }
            });

            if let Err(e) = result {
                debug!("Error preserving {}: {:#}", path, e);
            }
        }

        for (path, access) in cmd.preserve_overrides() {
            let dst = fsutil::output_path(&preserved_dir, Path::new(&path));
            if !fsutil::exists(&dst) {
                continue;
            }
            if let Err(e) =
                fsutil::ensure_contained(&preserved_dir, &dst).and_then(|_| fsutil::set_access(&dst, &access))
            {
                debug!("Error setting access on preserved {}: {:#}", dst.display(), e);
            }
        }

        Ok(())
    }

    /// Run the store over the monitor output and write the report
    pub fn process(
        &self,
        cmd: &StartCommand,
        mount_point: &Path,
        monitors: &MonitorReports,
        rules: &ArtifactRules,
        resolver: &dyn DependencyResolver,
    ) -> Result<ContainerReport> {
        let observed = monitors.fan.observed_paths();
        info!(
            "Processing {} observed paths from {} processes",
            observed.len(),
            monitors.fan.process_files.len()
        );

        let excludes = PathMatcher::new(&exclude_patterns(cmd));
        let closure = SymlinkCloser::new(mount_point, &excludes, rules.symlink_fixpoint_rounds)
            .close(&observed);
        debug!(
            "Symlink closure found {} paths in {} rounds",
            closure.found.len(),
            closure.rounds
        );

        let mut raw_names = observed;
        raw_names.extend(closure.found);

        let env = StoreEnv {
            artifacts_dir: &self.artifacts_dir,
            mount_point,
            cmd,
            rules,
            resolver,
            fan: &monitors.fan,
            pt: monitors.pt.as_ref(),
            orig_paths: &self.orig_paths,
        };

        let mut store = ArtifactStore::new(env, raw_names);
        store.prepare()?;
        store.save()?;
        store.enumerate()?;
        store.save_report(self.sensor.clone())
    }

    /// Pack everything but the file tree and the event log into `run.tar`
    pub fn archive(&self) -> Result<PathBuf> {
        let mut entries: Vec<ArchiveEntry> = Vec::new();

        for extra in &self.extra_files {
            if !fsutil::exists(extra) {
                debug!("Skipping missing extra file {}", extra.display());
                continue;
            }
            if let Some(name) = extra.file_name() {
                entries.push(ArchiveEntry {
                    source: extra.clone(),
                    name: name.to_string_lossy().into_owned(),
                });
            }
        }

        let listing = fs::read_dir(&self.artifacts_dir).with_context(|| {
            format!("Failed to read artifacts dir: {}", self.artifacts_dir.display())
        })?;
        for entry in listing {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_run_archive_member(&name) {
                entries.push(ArchiveEntry {
                    source: entry.path(),
                    name,
                });
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries.dedup_by(|a, b| a.name == b.name);

        let output = self.artifacts_dir.join(RUN_ARCHIVE_NAME);
        write_tar(&output, &entries)?;
        Ok(output)
    }

    /// Pack the output tree into `files.tar`
    pub fn archive_files(&self) -> Result<PathBuf> {
        let output = self.artifacts_dir.join(FILES_ARCHIVE_NAME);
        write_dir_tar(&output, &self.artifacts_dir.join(FILES_DIR_NAME))?;
        Ok(output)
    }
}

fn is_run_archive_member(name: &str) -> bool {
    name != FILES_DIR_NAME
        && name != FILES_ARCHIVE_NAME
        && name != MONITOR_EVENT_LOG_FILE_NAME
        && name != RUN_ARCHIVE_NAME
}
