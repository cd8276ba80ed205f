//! The artifact store: the per-run state machine that turns the observed
//! path set into a retained artifact tree and a report.
//!
//! Phases run strictly in order: Gathering, Preparing, Copying,
//! Enumerating, Reporting. Per-path metadata is computed in parallel, but
//! only the owning thread ever mutates the store.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use log::{debug, info, warn};
use rayon::prelude::*;

use crate::artifacts::app_stack::AppStacks;
use crate::artifacts::dedup::{group_by_identity, Deduplicator};
use crate::artifacts::symlinks::backfill_root;
use crate::config::{ArtifactRules, StartCommand};
use crate::constants::FILES_DIR_NAME;
use crate::inspect::filetype::DataTypeSniffer;
use crate::inspect::{binfile, sodeps, DependencyResolver};
use crate::models::{ArtifactProps, ArtifactType, FanMonitorReport, PtMonitorReport};
use crate::utils::hash::calculate_sha256;
use crate::utils::paths::{dest_path, link_target_to_full_path};

/// Where the store is in its run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorePhase {
    Gathering,
    Preparing,
    Copying,
    Enumerating,
    Reporting,
    Done,
}

impl StorePhase {
    fn next(self) -> StorePhase {
        match self {
            StorePhase::Gathering => StorePhase::Preparing,
            StorePhase::Preparing => StorePhase::Copying,
            StorePhase::Copying => StorePhase::Enumerating,
            StorePhase::Enumerating => StorePhase::Reporting,
            StorePhase::Reporting | StorePhase::Done => StorePhase::Done,
        }
    }
}

impl fmt::Display for StorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Everything the store reads but never changes
pub struct StoreEnv<'a> {
    pub artifacts_dir: &'a Path,
    pub mount_point: &'a Path,
    pub cmd: &'a StartCommand,
    pub rules: &'a ArtifactRules,
    pub resolver: &'a dyn DependencyResolver,
    pub fan: &'a FanMonitorReport,
    pub pt: Option<&'a PtMonitorReport>,
    /// Pre-run snapshot of the filesystem, used for OS network libraries
    pub orig_paths: &'a BTreeSet<String>,
}

pub struct ArtifactStore<'a> {
    pub(crate) env: StoreEnv<'a>,
    pub(crate) sniffer: DataTypeSniffer,
    pub(crate) phase: StorePhase,

    /// Paths handed in by the monitors and the symlink closure
    pub(crate) raw_names: BTreeSet<String>,
    pub(crate) known: BTreeMap<String, ArtifactProps>,
    pub(crate) name_list: Vec<String>,
    /// Symlink targets that still need classification
    pub(crate) pending: BTreeSet<String>,

    pub(crate) file_map: BTreeSet<String>,
    pub(crate) link_map: BTreeSet<String>,
    /// Files found only through dependency closure
    pub(crate) static_dep_map: BTreeSet<String>,

    pub(crate) app_stacks: AppStacks,
}

impl<'a> ArtifactStore<'a> {
    pub fn new(env: StoreEnv<'a>, raw_names: BTreeSet<String>) -> Self {
        ArtifactStore {
            env,
            sniffer: DataTypeSniffer::new(),
            phase: StorePhase::Gathering,
            raw_names,
            known: BTreeMap::new(),
            name_list: Vec::new(),
            pending: BTreeSet::new(),
            file_map: BTreeSet::new(),
            link_map: BTreeSet::new(),
            static_dep_map: BTreeSet::new(),
            app_stacks: AppStacks::new(),
        }
    }

    /// Replace the data type sniffer (e.g. with a disabled one)
    pub fn with_sniffer(mut self, sniffer: DataTypeSniffer) -> Self {
        self.sniffer = sniffer;
        self
    }

    pub fn phase(&self) -> StorePhase {
        self.phase
    }

    pub fn known(&self) -> &BTreeMap<String, ArtifactProps> {
        &self.known
    }

    pub fn files(&self) -> &BTreeSet<String> {
        &self.file_map
    }

    pub fn links(&self) -> &BTreeSet<String> {
        &self.link_map
    }

    pub fn static_deps(&self) -> &BTreeSet<String> {
        &self.static_dep_map
    }

    pub fn app_stacks(&self) -> &AppStacks {
        &self.app_stacks
    }

    pub(crate) fn advance(&mut self, to: StorePhase) -> Result<()> {
        let expected = self.phase.next();
        if to != expected {
            bail!("Store cannot move from {} to {}", self.phase, to);
        }
        debug!("Store phase {} -> {}", self.phase, to);
        self.phase = to;
        Ok(())
    }

    /// Output tree root (`<artifacts>/files`)
    pub fn files_dir(&self) -> PathBuf {
        self.env.artifacts_dir.join(FILES_DIR_NAME)
    }

    /// Output location of a source path
    pub fn dst(&self, source: &str) -> PathBuf {
        dest_path(&self.files_dir(), Path::new(source))
    }

    /// Classify every path, expand symlinks and dependencies, then dedup
    pub fn prepare(&mut self) -> Result<()> {
        self.advance(StorePhase::Preparing)?;

        let raw: Vec<String> = self.raw_names.iter().cloned().collect();
        info!("Preparing {} raw artifact paths", raw.len());
        self.prepare_batch(&raw);

        self.attach_fs_activity();
        self.resolve_dependencies();

        let known: BTreeSet<String> = self.known.keys().cloned().collect();
        let backfill = backfill_root(self.env.mount_point, &known);
        if !backfill.is_empty() {
            debug!("Root backfill added {} links", backfill.len());
        }
        self.prepare_batch(&backfill);

        self.resolve_pending();
        self.dedup();

        info!(
            "Prepared {} artifacts ({} files, {} links, {} dependency files)",
            self.known.len(),
            self.file_map.len(),
            self.link_map.len(),
            self.static_dep_map.len()
        );
        Ok(())
    }

    /// Compute props in parallel, then fold them in on this thread
    pub(crate) fn prepare_batch(&mut self, names: &[String]) {
        let computed: Vec<(String, ArtifactProps)> = {
            let this = &*self;
            names
                .par_iter()
                .filter(|name| !this.known.contains_key(name.as_str()))
                .filter_map(|name| this.artifact_props(name).map(|props| (name.clone(), props)))
                .collect()
        };

        for (name, props) in computed {
            self.record(name, props, false);
        }
    }

    /// Full properties of one path; `None` when it cannot be lstat'ed
    pub(crate) fn artifact_props(&self, name: &str) -> Option<ArtifactProps> {
        let path = Path::new(name);
        let metadata = match fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(e) => {
                debug!("Skipping artifact {}: {}", name, e);
                return None;
            }
        };

        let mut props = ArtifactProps::from_metadata(name, &metadata);
        props.flags = self.env.fan.access_flags(name);

        match props.file_type {
            ArtifactType::File => {
                match calculate_sha256(path) {
                    Ok(hash) => props.sha256_hash = Some(hash),
                    Err(e) => debug!("Unable to hash {}: {}", name, e),
                }
                props.data_type = self.sniffer.data_type(path);
            }
            ArtifactType::Symlink => match fs::read_link(path) {
                Ok(target) => props.link_ref = Some(target.to_string_lossy().into_owned()),
                Err(e) => debug!("Unable to read link {}: {}", name, e),
            },
            ArtifactType::Dir | ArtifactType::Unknown => {}
        }

        Some(props)
    }

    /// Single writer for the store maps
    pub(crate) fn record(&mut self, name: String, props: ArtifactProps, static_dep: bool) {
        match props.file_type {
            ArtifactType::File => {
                if static_dep {
                    self.static_dep_map.insert(name.clone());
                } else {
                    self.file_map.insert(name.clone());
                }
            }
            ArtifactType::Symlink => {
                self.link_map.insert(name.clone());
                if let Some(link_ref) = &props.link_ref {
                    self.queue_link_targets(&name, link_ref);
                }
            }
            ArtifactType::Dir | ArtifactType::Unknown => {}
        }

        self.name_list.push(name.clone());
        self.known.insert(name, props);
    }

    fn queue_link_targets(&mut self, name: &str, link_ref: &str) {
        let abs_target = link_target_to_full_path(Path::new(name), Path::new(link_ref))
            .to_string_lossy()
            .into_owned();

        let mut targets = vec![abs_target.clone()];
        if let Ok(eval) = fs::canonicalize(&abs_target) {
            let eval = eval.to_string_lossy().into_owned();
            if eval != abs_target {
                targets.push(eval);
            }
        }

        for target in targets {
            if !self.raw_names.contains(&target) && !self.known.contains_key(&target) {
                self.pending.insert(target);
            }
        }
    }

    fn attach_fs_activity(&mut self) {
        let pt = match self.env.pt {
            Some(pt) if pt.enabled => pt,
            _ => return,
        };

        let unknown: Vec<String> = pt
            .fs_activity
            .keys()
            .filter(|p| !self.known.contains_key(p.as_str()))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            debug!("Preparing {} paths seen only by the trace monitor", unknown.len());
            self.prepare_batch(&unknown);
        }

        for (path, activity) in &pt.fs_activity {
            if let Some(props) = self.known.get_mut(path) {
                props.fs_activity = Some(activity.clone());
            }
        }
    }

    fn resolve_dependencies(&mut self) {
        let binaries: Vec<String> = self
            .file_map
            .iter()
            .filter(|name| matches!(binfile::detect(Path::new(name.as_str())), Ok(Some(_))))
            .cloned()
            .collect();
        debug!("Resolving dependencies for {} binaries", binaries.len());

        let resolver = self.env.resolver;
        let results: Vec<(String, crate::error::Result<Vec<String>>)> = binaries
            .par_iter()
            .map(|bin| (bin.clone(), sodeps::all_dependencies(resolver, Path::new(bin))))
            .collect();

        let mut missing_resolver = false;
        let mut deps: BTreeSet<String> = BTreeSet::new();
        for (bin, result) in results {
            match result {
                Ok(list) => deps.extend(list),
                Err(e) if e.is_resolver_not_found() => missing_resolver = true,
                Err(e) => debug!("Error getting dependencies for {}: {}", bin, e),
            }
        }
        if missing_resolver {
            warn!("No dependency resolver available, binary dependencies not added");
        }

        let new_deps: Vec<String> = deps
            .into_iter()
            .filter(|d| !self.known.contains_key(d))
            .collect();

        let computed: Vec<(String, ArtifactProps)> = {
            let this = &*self;
            new_deps
                .par_iter()
                .filter_map(|name| this.artifact_props(name).map(|props| (name.clone(), props)))
                .collect()
        };

        for (name, props) in computed {
            match props.file_type {
                ArtifactType::File => self.record(name, props, true),
                ArtifactType::Symlink => self.record(name, props, false),
                _ => debug!("Ignoring dependency {} of type {:?}", name, props.file_type),
            }
        }
    }

    fn resolve_pending(&mut self) {
        while !self.pending.is_empty() {
            let batch: Vec<String> = std::mem::take(&mut self.pending)
                .into_iter()
                .filter(|p| !self.known.contains_key(p))
                .collect();
            if batch.is_empty() {
                break;
            }
            debug!("Resolving {} pending link targets", batch.len());
            self.prepare_batch(&batch);
        }
    }

    fn dedup(&mut self) {
        let dir_links: Vec<String> = self
            .link_map
            .iter()
            .filter(|link| fs::metadata(link.as_str()).map(|m| m.is_dir()).unwrap_or(false))
            .cloned()
            .collect();
        let dedup = Deduplicator::new(&self.env.rules.redirect_prefixes, dir_links);

        let groups = group_by_identity(self.file_map.iter().chain(self.static_dep_map.iter()));
        let known = &self.known;
        let dropped = dedup.drops(&groups, |p| known.get(p).map_or(false, |props| props.has_flags()));

        if dropped.is_empty() {
            return;
        }

        info!("Dropping {} duplicate paths", dropped.len());
        let dropped: BTreeSet<String> = dropped.into_iter().collect();
        for name in &dropped {
            self.file_map.remove(name);
            self.static_dep_map.remove(name);
            self.known.remove(name);
        }
        self.name_list.retain(|n| !dropped.contains(n));
    }

    /// Add the output-tree entries the store does not know yet
    pub fn enumerate(&mut self) -> Result<()> {
        self.advance(StorePhase::Enumerating)?;

        let files_dir = self.files_dir();
        let found = crate::report::enumerate::enumerate_output(&files_dir)?;

        let mut added = 0;
        for name in found {
            if self.known.contains_key(&name) {
                continue;
            }

            let props = match self.artifact_props(&name) {
                Some(props) => props,
                None => match fs::symlink_metadata(self.dst(&name)) {
                    Ok(metadata) => ArtifactProps::from_metadata(&name, &metadata),
                    Err(e) => {
                        debug!("No properties for output entry {}: {}", name, e);
                        continue;
                    }
                },
            };

            self.name_list.push(name.clone());
            self.known.insert(name, props);
            added += 1;
        }

        debug!("Output enumeration added {} paths", added);
        Ok(())
    }

    /// Sorted, deduplicated final name list
    pub fn sorted_names(&self) -> Vec<String> {
        let mut names = self.name_list.clone();
        names.sort();
        names.dedup();
        names
    }
}
