//! The copy phase of the store: mirrors retained paths into `files/` and
//! applies the include, exclude, permission and preserve policies.

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info};

use crate::artifacts::extras;
use crate::artifacts::fsutil;
use crate::artifacts::matcher::PathMatcher;
use crate::artifacts::obfuscate;
use crate::artifacts::postprocess::PostProcessor;
use crate::artifacts::store::{ArtifactStore, StorePhase};
use crate::artifacts::walker::{is_filtered_path, TreeWalker, WalkAction};
use crate::config::{ArtifactRules, StartCommand};
use crate::constants::{
    PASSWD_FILE_PATH, PRESERVED_DIR_NAME, RUN_DIR_MODE, RUN_DIR_PATH, SENSOR_ROOT_DIR,
    TMP_DIR_MODE, TMP_DIR_PATH,
};
use crate::inspect::{binfile, sodeps, DependencyResolver};
use crate::utils::paths::dest_path;

const VARLOCK_EXCLUDES: &[&str] = &["/var/lock/**", "/run/lock/**"];

/// Exclude patterns in effect for a run
pub fn exclude_patterns(cmd: &StartCommand) -> Vec<String> {
    let mut patterns = cmd.excludes.clone();
    patterns.push(SENSOR_ROOT_DIR.to_string());
    patterns.push(format!("{}/**", SENSOR_ROOT_DIR));
    if cmd.exclude_varlock_files {
        patterns.extend(VARLOCK_EXCLUDES.iter().map(|p| p.to_string()));
    }
    patterns
}

/// Shared state for everything that copies into the output tree
pub struct CopyContext<'c> {
    pub files_dir: PathBuf,
    pub clone: bool,
    pub excludes: PathMatcher,
    pub cmd: &'c StartCommand,
    pub rules: &'c ArtifactRules,
    pub resolver: &'c dyn DependencyResolver,
}

impl<'c> CopyContext<'c> {
    /// Output location of a source path, resolved inside the output tree
    pub fn dst(&self, source: &str) -> PathBuf {
        fsutil::output_path(&self.files_dir, Path::new(source))
    }

    /// [`Self::dst`] for writing: fails when the location would resolve
    /// outside the output tree
    pub fn write_dst(&self, source: &str) -> Result<PathBuf> {
        let dst = self.dst(source);
        fsutil::ensure_contained(&self.files_dir, &dst)?;
        Ok(dst)
    }

    /// Pseudo filesystem or excluded by pattern
    pub fn is_skipped(&self, path: &str) -> bool {
        if is_filtered_path(Path::new(path)) {
            return true;
        }
        if let Some(pattern) = self.excludes.matching_pattern(path) {
            debug!("Excluding {} (pattern {})", path, pattern);
            return true;
        }
        false
    }

    /// Copy a file or symlink unless its output copy already exists
    pub fn copy_missing(&self, source: &str) {
        let src = Path::new(source);
        if !fsutil::exists(src) {
            return;
        }

        let dst = self.dst(source);
        if fsutil::exists(&dst) {
            return;
        }

        if let Err(e) = self
            .write_dst(source)
            .and_then(|dst| fsutil::copy_file(self.clone, src, &dst))
        {
            debug!("Error copying {}: {:#}", source, e);
        }
    }

    /// Copy a directory tree; `honor_excludes` applies the run's patterns
    pub fn copy_tree(&self, source: &str, honor_excludes: bool) {
        let none = PathMatcher::default();
        let excludes = if honor_excludes { &self.excludes } else { &none };

        let result = self.write_dst(source).and_then(|dst| {
            fsutil::copy_dir(self.clone, Path::new(source), &self.files_dir, &dst, excludes)
        });
        match result {
            Ok(errors) if !errors.is_empty() => {
                debug!("Copying {} had {} errors", source, errors.len())
            }
            Ok(_) => {}
            Err(e) => debug!("Error copying directory {}: {:#}", source, e),
        }
    }

    /// Copy every path of a dependency list that is not in the output yet
    pub fn copy_all(&self, paths: &[String]) {
        for path in paths {
            self.copy_missing(path);
        }
    }
}

impl<'a> ArtifactStore<'a> {
    pub(crate) fn copy_context(&self) -> CopyContext<'a> {
        CopyContext {
            files_dir: self.files_dir(),
            clone: self.env.cmd.keep_perms,
            excludes: PathMatcher::new(&exclude_patterns(self.env.cmd)),
            cmd: self.env.cmd,
            rules: self.env.rules,
            resolver: self.env.resolver,
        }
    }

    /// Mirror every retained path into the output tree
    pub fn save(&mut self) -> Result<()> {
        self.advance(StorePhase::Copying)?;

        let ctx = self.copy_context();
        fs::create_dir_all(&ctx.files_dir).context(format!(
            "Failed to create output root: {}",
            ctx.files_dir.display()
        ))?;

        self.save_links(&ctx);
        let (extra_dirs, app_dirs) = self.save_files(&ctx);
        self.save_static_deps(&ctx);

        ctx.copy_missing(PASSWD_FILE_PATH);
        save_includes(&ctx, &app_dirs);
        save_include_exes(&ctx);
        save_include_bins(&ctx);

        if ctx.cmd.include_shell {
            extras::save_shell(&ctx);
        }
        extras::save_workdir(&ctx);
        extras::save_ssh_client(&ctx);
        extras::save_os_libs_net(&ctx, self.env.orig_paths);
        extras::save_certs(&ctx, &self.app_stacks);
        extras::save_zoneinfo(&ctx);

        ensure_runtime_dirs(&ctx);
        restore_extra_dirs(&ctx, &extra_dirs);
        apply_permission_overrides(&ctx);
        restore_preserved(&ctx, self.env.artifacts_dir);

        info!("Saved artifacts to {}", ctx.files_dir.display());
        Ok(())
    }

    fn save_links(&self, ctx: &CopyContext<'_>) {
        let mut retry = Vec::new();
        for link in &self.link_map {
            if ctx.is_skipped(link) {
                continue;
            }
            if let Err(e) = self.copy_link(ctx, link) {
                debug!("Error copying link {} (will retry): {:#}", link, e);
                retry.push(link);
            }
        }

        for link in retry {
            if let Err(e) = self.copy_link(ctx, link) {
                debug!("Error copying link {}: {:#}", link, e);
            }
        }
    }

    fn copy_link(&self, ctx: &CopyContext<'_>, link: &str) -> Result<()> {
        let dst = ctx.dst(link);
        if fsutil::exists(&dst) {
            return Ok(());
        }

        let link_ref = match self.known.get(link).and_then(|p| p.link_ref.clone()) {
            Some(r) => PathBuf::from(r),
            None => fs::read_link(link).context(format!("Failed to read link: {}", link))?,
        };

        let dst = ctx.write_dst(link)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create directory: {}", parent.display()))?;
        }
        symlink(&link_ref, &dst).context(format!("Failed to create link {}", dst.display()))
    }

    /// Copy the regular files.
    ///
    /// Returns the parent dirs of skipped PID files and the app dirs the
    /// post-copy hooks asked for.
    fn save_files(&mut self, ctx: &CopyContext<'_>) -> (BTreeSet<String>, BTreeSet<String>) {
        let mut extra_dirs = BTreeSet::new();
        let mut post = PostProcessor::new();
        let files: Vec<String> = self.file_map.iter().cloned().collect();

        for source in &files {
            if ctx.is_skipped(source) {
                continue;
            }

            if ctx.rules.is_pid_file(source) {
                if let Some(parent) = Path::new(source).parent() {
                    debug!("Skipping PID file {}", source);
                    extra_dirs.insert(parent.to_string_lossy().into_owned());
                }
                continue;
            }

            let dst = match ctx.write_dst(source) {
                Ok(dst) => dst,
                Err(e) => {
                    debug!("Error copying {}: {:#}", source, e);
                    continue;
                }
            };
            if let Err(e) = copy_artifact_file(ctx, source, &dst) {
                debug!("Error copying {}: {:#}", source, e);
                continue;
            }

            self.app_stacks.detect(source);
            post.process(ctx, source, &dst);
        }

        (extra_dirs, post.into_include_dirs())
    }

    fn save_static_deps(&self, ctx: &CopyContext<'_>) {
        for source in &self.static_dep_map {
            if ctx.is_skipped(source) {
                continue;
            }

            let dst = ctx.dst(source);
            if fsutil::exists(&dst) {
                continue;
            }

            if let Err(e) = ctx
                .write_dst(source)
                .and_then(|dst| copy_artifact_file(ctx, source, &dst))
            {
                debug!("Error copying dependency {}: {:#}", source, e);
            }
        }
    }
}

/// Plain or obfuscated copy of one regular file
fn copy_artifact_file(ctx: &CopyContext<'_>, source: &str, dst: &Path) -> Result<()> {
    let src = Path::new(source);
    let file_name = src.file_name().and_then(|n| n.to_str()).unwrap_or_default();

    if ctx.cmd.obfuscate_metadata && ctx.rules.is_app_metadata_file(file_name) {
        let data_path = obfuscate::copy_and_obfuscate(ctx.clone, src, dst)?;
        return obfuscate::update_package_file(file_name, &data_path);
    }

    fsutil::copy_regular_file(ctx.clone, src, dst)?;

    if ctx.cmd.obfuscate_metadata {
        if let Ok(Some(props)) = binfile::detect(src) {
            if props.is_exe() {
                obfuscate::append_marker(dst)?;
                obfuscate::apply_patch_rules(dst, ctx.rules.patch_rules_for(source))?;
            }
        }
    }
    Ok(())
}

fn save_includes(ctx: &CopyContext<'_>, app_dirs: &BTreeSet<String>) {
    for source in ctx.cmd.includes.keys().chain(app_dirs.iter()) {
        if ctx.is_skipped(source) {
            continue;
        }

        // directory links are followed, other links are copied as links
        if Path::new(source).is_dir() {
            ctx.copy_tree(source, true);
            continue;
        }

        match fs::symlink_metadata(source) {
            Ok(_) => {
                if let Err(e) = ctx
                    .write_dst(source)
                    .and_then(|dst| fsutil::copy_file(ctx.clone, Path::new(source), &dst))
                {
                    debug!("Error copying include {}: {:#}", source, e);
                }
            }
            Err(e) => debug!("Skipping include {}: {}", source, e),
        }
    }
}

fn save_include_exes(ctx: &CopyContext<'_>) {
    for name in &ctx.cmd.include_exes {
        match sodeps::exe_dependencies(ctx.resolver, name) {
            Ok(paths) => ctx.copy_all(&paths),
            Err(e) => debug!("Error getting dependencies for exe {}: {}", name, e),
        }
    }
}

/// Explicit binaries plus every binary under the listed directories
pub fn include_bin_list(ctx: &CopyContext<'_>) -> Vec<String> {
    let mut bins: Vec<String> = ctx.cmd.include_bins.clone();

    for dir in ctx.cmd.include_dir_bins_list.keys() {
        let root = Path::new(dir);
        if !root.is_dir() {
            debug!("Skipping bin dir {}: not a directory", dir);
            continue;
        }

        TreeWalker::new(root, &ctx.excludes).walk(|entry, metadata| {
            if metadata.is_file() && matches!(binfile::detect(entry.path()), Ok(Some(_))) {
                bins.push(entry.path().to_string_lossy().into_owned());
            }
            WalkAction::Continue
        });
    }

    bins
}

fn save_include_bins(ctx: &CopyContext<'_>) {
    for bin in include_bin_list(ctx) {
        if ctx.is_skipped(&bin) {
            continue;
        }

        match sodeps::all_dependencies(ctx.resolver, Path::new(&bin)) {
            Ok(paths) => ctx.copy_all(&paths),
            Err(e) => debug!("Error getting dependencies for bin {}: {}", bin, e),
        }
    }
}

fn ensure_runtime_dirs(ctx: &CopyContext<'_>) {
    if Path::new(TMP_DIR_PATH).is_dir() {
        if let Err(e) = ctx
            .write_dst(TMP_DIR_PATH)
            .and_then(|dst| fsutil::create_dir_with_mode(&dst, TMP_DIR_MODE))
        {
            debug!("Error creating {}: {:#}", TMP_DIR_PATH, e);
        }
    }

    if Path::new(RUN_DIR_PATH).is_dir() {
        let dst = ctx.dst(RUN_DIR_PATH);
        if !dst.exists() {
            if let Err(e) = ctx
                .write_dst(RUN_DIR_PATH)
                .and_then(|dst| fsutil::create_dir_with_mode(&dst, RUN_DIR_MODE))
            {
                debug!("Error creating {}: {:#}", dst.display(), e);
            }
        }
    }
}

fn restore_extra_dirs(ctx: &CopyContext<'_>, dirs: &BTreeSet<String>) {
    for dir in dirs {
        let src = Path::new(dir);
        let dst = ctx.dst(dir);
        if !src.is_dir() || fsutil::exists(&dst) {
            continue;
        }

        if let Err(e) = ctx
            .write_dst(dir)
            .and_then(|dst| fsutil::copy_dir_only(ctx.clone, src, &dst))
        {
            debug!("Error creating dir {}: {:#}", dst.display(), e);
        }
    }
}

fn apply_permission_overrides(ctx: &CopyContext<'_>) {
    for (path, access) in ctx.cmd.permission_overrides() {
        let dst = ctx.dst(&path);
        if !fsutil::exists(&dst) {
            continue;
        }

        if let Err(e) = ctx
            .write_dst(&path)
            .and_then(|dst| fsutil::set_access(&dst, &access))
        {
            debug!("Error applying permissions to {}: {:#}", dst.display(), e);
        }
    }
}

fn restore_preserved(ctx: &CopyContext<'_>, artifacts_dir: &Path) {
    let preserved_root = artifacts_dir.join(PRESERVED_DIR_NAME);
    let none = PathMatcher::default();

    for path in ctx.cmd.preserves.keys() {
        let src = dest_path(&preserved_root, Path::new(path));
        let metadata = match fs::symlink_metadata(&src) {
            Ok(m) => m,
            Err(e) => {
                debug!("No preserved copy of {}: {}", path, e);
                continue;
            }
        };

        let result = ctx.write_dst(path).and_then(|dst| {
            if metadata.is_dir() {
                fsutil::copy_dir(ctx.clone, &src, &ctx.files_dir, &dst, &none).map(|errors| {
                    if !errors.is_empty() {
                        debug!("Restoring {} had {} errors", path, errors.len());
                    }
                })
            } else {
                fsutil::copy_file(ctx.clone, &src, &dst)
            }
        });

        if let Err(e) = result {
            debug!("Error restoring preserved {}: {:#}", path, e);
        }
    }
}
