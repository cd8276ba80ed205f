//! Symlink and hardlink closure over the observed file set.
//!
//! A walk over the mount point finds every symlink that leads to (or through)
//! a known path and every hardlink of an observed regular file. Symlinks that
//! do not match yet are retried in a fixpoint pass once the known set has
//! grown, and the direct children of the mount point get a final backfill
//! check against the store's view.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::artifacts::matcher::PathMatcher;
use crate::artifacts::walker::{is_filtered_path, TreeWalker, WalkAction};
use crate::utils::paths::link_target_to_full_path;

/// (device, inode) identity of a filesystem object
pub type FileId = (u64, u64);

/// A symlink with its target in the three forms the matcher needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymlinkInfo {
    pub path: String,
    /// Raw link text
    pub link_ref: String,
    /// Target resolved against the link's directory, lexically cleaned
    pub abs_target: String,
    /// Fully dereferenced target, when it exists
    pub eval_target: Option<String>,
}

impl SymlinkInfo {
    /// Read a symlink; `None` when the path is not a readable link
    pub fn read(path: &Path) -> Option<Self> {
        let link_ref = match fs::read_link(path) {
            Ok(target) => target,
            Err(e) => {
                debug!("Error reading link {}: {}", path.display(), e);
                return None;
            }
        };

        let abs_target = link_target_to_full_path(path, &link_ref);
        let eval_target = match fs::canonicalize(&abs_target) {
            Ok(p) => Some(p.to_string_lossy().into_owned()),
            Err(e) => {
                debug!("Error evaluating link {}: {}", path.display(), e);
                None
            }
        };

        Some(SymlinkInfo {
            path: path.to_string_lossy().into_owned(),
            link_ref: link_ref.to_string_lossy().into_owned(),
            abs_target: abs_target.to_string_lossy().into_owned(),
            eval_target,
        })
    }

    /// True when the link leads to a known path or to a directory that
    /// contains one
    pub fn references(&self, known: &BTreeSet<String>) -> bool {
        if known.contains(&self.abs_target) {
            return true;
        }

        if let Some(eval) = &self.eval_target {
            if known.contains(eval) {
                return true;
            }
        }

        if has_path_with_prefix(known, &format!("{}/", self.path)) {
            return true;
        }

        let abs_prefix = format!("{}/", self.abs_target);
        if has_path_with_prefix(known, &abs_prefix) {
            return true;
        }

        match &self.eval_target {
            Some(eval) if *eval != self.abs_target => {
                has_path_with_prefix(known, &format!("{}/", eval))
            }
            _ => false,
        }
    }
}

fn has_path_with_prefix(known: &BTreeSet<String>, prefix: &str) -> bool {
    known
        .range::<str, _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
        .next()
        .map_or(false, |p| p.starts_with(prefix))
}

/// Outcome of a closure run
#[derive(Debug, Default, Clone)]
pub struct SymlinkClosure {
    /// Every path found to be needed, including observed paths met by the walk
    pub found: BTreeSet<String>,
    /// Regular files grouped by identity; only identities of observed files
    pub hardlinks: BTreeMap<FileId, BTreeSet<String>>,
    /// Fixpoint rounds that added something
    pub rounds: usize,
}

/// Symlink closure over one mount point
pub struct SymlinkCloser<'a> {
    mount_point: PathBuf,
    excludes: &'a PathMatcher,
    max_rounds: usize,
}

impl<'a> SymlinkCloser<'a> {
    pub fn new(mount_point: &Path, excludes: &'a PathMatcher, max_rounds: usize) -> Self {
        SymlinkCloser {
            mount_point: mount_point.to_path_buf(),
            excludes,
            max_rounds,
        }
    }

    pub fn close(&self, observed: &BTreeSet<String>) -> SymlinkClosure {
        let (inodes, devices) = observed_identities(observed);
        debug!(
            "Symlink closure over {} paths ({} inodes, {} devices)",
            observed.len(),
            inodes.len(),
            devices.len()
        );

        let mut known = observed.clone();
        let mut closure = SymlinkClosure::default();
        let mut remembered: Vec<SymlinkInfo> = Vec::new();

        TreeWalker::new(&self.mount_point, self.excludes).walk(|entry, metadata| {
            if !devices.contains(&metadata.dev()) {
                return WalkAction::Continue;
            }

            let path = entry.path();
            let name = path.to_string_lossy().into_owned();

            if metadata.file_type().is_symlink() {
                if let Some(info) = SymlinkInfo::read(path) {
                    if info.references(&known) {
                        known.insert(name.clone());
                        closure.found.insert(name.clone());
                    } else {
                        remembered.push(info);
                    }
                }

                // a link to an observed file is needed, but it is not a hardlink
                if let Ok(target) = fs::metadata(path) {
                    if target.is_file() && inodes.contains(&(target.dev(), target.ino())) {
                        known.insert(name.clone());
                        closure.found.insert(name);
                    }
                }
            } else if metadata.is_file() {
                let id = (metadata.dev(), metadata.ino());
                if inodes.contains(&id) {
                    closure.hardlinks.entry(id).or_default().insert(name.clone());
                    known.insert(name.clone());
                    closure.found.insert(name);
                }
            }

            WalkAction::Continue
        });

        remembered.retain(|info| !known.contains(&info.path));
        closure.rounds = fixpoint(&mut known, &mut closure.found, &mut remembered, self.max_rounds);

        info!(
            "Symlink closure found {} paths in {} hardlink groups",
            closure.found.len(),
            closure.hardlinks.len()
        );
        closure
    }
}

/// Retry remembered symlinks until a round adds nothing or the cap is hit.
///
/// Returns the number of rounds that added paths.
pub fn fixpoint(
    known: &mut BTreeSet<String>,
    found: &mut BTreeSet<String>,
    remembered: &mut Vec<SymlinkInfo>,
    max_rounds: usize,
) -> usize {
    let mut productive = 0;
    for round in 0..max_rounds {
        let (matched, rest): (Vec<SymlinkInfo>, Vec<SymlinkInfo>) = remembered
            .drain(..)
            .partition(|info| info.references(known));
        *remembered = rest;

        if matched.is_empty() {
            return productive;
        }

        debug!("Symlink fixpoint round {} added {} links", round + 1, matched.len());
        for info in matched {
            known.insert(info.path.clone());
            found.insert(info.path);
        }
        productive += 1;
    }

    if !remembered.is_empty() {
        debug!(
            "Symlink fixpoint stopped at {} rounds with {} links unresolved",
            max_rounds,
            remembered.len()
        );
    }
    productive
}

/// Symlinks directly under the mount point that lead to known paths and are
/// not known yet
pub fn backfill_root(mount_point: &Path, known: &BTreeSet<String>) -> Vec<String> {
    let entries = match fs::read_dir(mount_point) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Root backfill cannot read {}: {}", mount_point.display(), e);
            return Vec::new();
        }
    };

    let mut added = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if is_filtered_path(&path) {
            continue;
        }

        let is_link = entry.file_type().map(|t| t.is_symlink()).unwrap_or(false);
        if !is_link {
            continue;
        }

        let name = path.to_string_lossy().into_owned();
        if known.contains(&name) {
            continue;
        }

        if let Some(info) = SymlinkInfo::read(&path) {
            if info.references(known) {
                debug!("Root backfill: {} -> {}", name, info.link_ref);
                added.push(name);
            }
        }
    }

    added.sort();
    added
}

/// Identities and devices of the observed regular files (targets followed)
fn observed_identities(observed: &BTreeSet<String>) -> (HashSet<FileId>, HashSet<u64>) {
    let mut inodes = HashSet::new();
    let mut devices = HashSet::new();

    for path in observed {
        match fs::metadata(path) {
            Ok(metadata) => {
                devices.insert(metadata.dev());
                if metadata.is_file() {
                    inodes.insert((metadata.dev(), metadata.ino()));
                }
            }
            Err(e) => debug!("No identity for {}: {}", path, e),
        }
    }

    (inodes, devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn s(path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn info(path: &str, abs: &str, eval: Option<&str>) -> SymlinkInfo {
        SymlinkInfo {
            path: path.to_string(),
            link_ref: abs.to_string(),
            abs_target: abs.to_string(),
            eval_target: eval.map(|e| e.to_string()),
        }
    }

    #[test]
    fn test_references_rules() {
        let known = set(&["/usr/lib/x86_64/libc.so.6", "/opt/app/bin/run"]);

        assert!(info("/lib", "/usr/lib", None).references(&known));
        assert!(info("/usr/lib/libc.so", "/usr/lib/x86_64/libc.so.6", None).references(&known));
        assert!(info("/opt/app/bin", "/srv/bin", None).references(&known));
        assert!(info("/x", "/y", Some("/usr/lib/x86_64")).references(&known));
        assert!(!info("/x", "/usr/li", None).references(&known));
        assert!(!info("/usr/lib64", "/usr/lib64-real", None).references(&known));
    }

    #[test]
    fn test_read_relative_link() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir(root.join("real")).unwrap();
        fs::write(root.join("real/file"), b"x").unwrap();
        symlink("./real/../real", root.join("alias")).unwrap();

        let info = SymlinkInfo::read(&root.join("alias")).unwrap();
        assert_eq!(info.abs_target, s(&root.join("real")));
        assert_eq!(info.link_ref, "./real/../real");
        assert!(info.eval_target.is_some());
        assert!(SymlinkInfo::read(&root.join("real/file")).is_none());
    }

    #[test]
    fn test_hardlink_group_excludes_symlinks() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir(root.join("a")).unwrap();
        fs::create_dir(root.join("b")).unwrap();
        fs::write(root.join("a/data.bin"), b"payload").unwrap();
        fs::hard_link(root.join("a/data.bin"), root.join("b/data.bin")).unwrap();
        symlink(root.join("a/data.bin"), root.join("b/data.link")).unwrap();
        fs::write(root.join("b/other.bin"), b"other").unwrap();

        let observed = set(&[&s(&root.join("a/data.bin"))]);
        let excludes = PathMatcher::default();
        let closure = SymlinkCloser::new(root, &excludes, 8).close(&observed);

        assert_eq!(closure.hardlinks.len(), 1);
        let group = closure.hardlinks.values().next().unwrap();
        assert_eq!(
            group,
            &set(&[&s(&root.join("a/data.bin")), &s(&root.join("b/data.bin"))])
        );

        assert!(closure.found.contains(&s(&root.join("b/data.link"))));
        assert!(!closure.found.contains(&s(&root.join("b/other.bin"))));
    }

    #[test]
    fn test_directory_link_chain_found() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("opt/real/lib")).unwrap();
        fs::write(root.join("opt/real/lib/libx.so"), b"x").unwrap();
        // z-current -> real, a-alias -> z-current
        symlink("real", root.join("opt/z-current")).unwrap();
        symlink("z-current", root.join("opt/a-alias")).unwrap();

        let observed = set(&[&s(&root.join("opt/z-current/lib/libx.so"))]);
        let excludes = PathMatcher::default();
        let closure = SymlinkCloser::new(root, &excludes, 8).close(&observed);

        assert!(closure.found.contains(&s(&root.join("opt/z-current"))));
        assert!(closure.found.contains(&s(&root.join("opt/a-alias"))));
    }

    #[test]
    fn test_closure_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("usr/lib")).unwrap();
        fs::write(root.join("usr/lib/libz.so.1.3"), b"z").unwrap();
        symlink("libz.so.1.3", root.join("usr/lib/libz.so.1")).unwrap();
        symlink("libz.so.1", root.join("usr/lib/libz.so")).unwrap();
        symlink("usr/lib", root.join("lib")).unwrap();
        fs::write(root.join("usr/lib/unrelated"), b"u").unwrap();

        let observed = set(&[&s(&root.join("usr/lib/libz.so.1.3"))]);
        let excludes = PathMatcher::default();
        let closer = SymlinkCloser::new(root, &excludes, 8);

        let first = closer.close(&observed);
        let mut grown = observed.clone();
        grown.extend(first.found.iter().cloned());

        let second = closer.close(&grown);
        assert!(second.found.is_subset(&grown));
        assert!(first.found.contains(&s(&root.join("usr/lib/libz.so"))));
        assert!(first.found.contains(&s(&root.join("lib"))));
    }

    #[test]
    fn test_fixpoint_cap() {
        let mut known = set(&["/t"]);
        let mut found = BTreeSet::new();
        let mut remembered = vec![
            info("/l3", "/l2", None),
            info("/l2", "/l1", None),
            info("/l1", "/t", None),
        ];

        let rounds = fixpoint(&mut known, &mut found, &mut remembered, 2);
        assert_eq!(rounds, 2);
        assert_eq!(found, set(&["/l1", "/l2"]));
        assert_eq!(remembered.len(), 1);
    }

    #[test]
    fn test_backfill_root() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::write(root.join("usr/bin/app"), b"a").unwrap();
        symlink("usr/bin", root.join("bin")).unwrap();
        symlink("usr/sbin", root.join("sbin")).unwrap();

        let known = set(&[&s(&root.join("usr/bin/app"))]);
        let added = backfill_root(root, &known);
        assert_eq!(added, vec![s(&root.join("bin"))]);
    }
}
