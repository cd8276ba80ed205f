use std::collections::BTreeSet;
use std::fs::Metadata;
use std::path::{Path, PathBuf};

use log::debug;
use walkdir::{DirEntry, WalkDir};

use crate::artifacts::matcher::PathMatcher;
use crate::constants::FILTERED_PATHS;

/// What the walker should do after visiting an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkAction {
    Continue,
    /// Do not descend into this directory
    SkipSubtree,
    /// Stop the whole walk
    Abort,
}

/// True for paths under the pseudo filesystems that are never walked or copied
pub fn is_filtered_path(path: &Path) -> bool {
    FILTERED_PATHS.iter().any(|root| path.starts_with(root))
}

/// Visitor-style walker that never follows symlinks.
///
/// Pseudo filesystems and excluded paths are skipped before the visitor
/// sees them; an excluded directory is skipped with its whole subtree.
pub struct TreeWalker<'a> {
    root: PathBuf,
    excludes: &'a PathMatcher,
}

impl<'a> TreeWalker<'a> {
    pub fn new(root: &Path, excludes: &'a PathMatcher) -> Self {
        TreeWalker {
            root: root.to_path_buf(),
            excludes,
        }
    }

    /// Walk the tree, calling `visit` with each entry and its lstat metadata.
    ///
    /// Returns the number of entries visited.
    pub fn walk<F>(&self, mut visit: F) -> usize
    where
        F: FnMut(&DirEntry, &Metadata) -> WalkAction,
    {
        let mut visited = 0;
        let mut it = WalkDir::new(&self.root).follow_links(false).into_iter();

        loop {
            let entry = match it.next() {
                None => break,
                Some(Ok(entry)) => entry,
                Some(Err(e)) => {
                    debug!("Walk error under {}: {}", self.root.display(), e);
                    continue;
                }
            };

            let path = entry.path();
            let is_dir = entry.file_type().is_dir();

            if is_filtered_path(path) || self.is_excluded(path) {
                debug!("Skipping {}", path.display());
                if is_dir {
                    it.skip_current_dir();
                }
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    debug!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };

            visited += 1;
            match visit(&entry, &metadata) {
                WalkAction::Continue => {}
                WalkAction::SkipSubtree => {
                    if is_dir {
                        it.skip_current_dir();
                    }
                }
                WalkAction::Abort => break,
            }
        }

        visited
    }

    fn is_excluded(&self, path: &Path) -> bool {
        match path.to_str() {
            Some(p) => self.excludes.is_match(p),
            None => false,
        }
    }
}

/// Snapshot of every regular file and symlink under `root`
pub fn current_paths(root: &Path, excludes: &PathMatcher) -> BTreeSet<String> {
    let mut paths = BTreeSet::new();
    TreeWalker::new(root, excludes).walk(|entry, metadata| {
        let file_type = metadata.file_type();
        if file_type.is_file() || file_type.is_symlink() {
            paths.insert(entry.path().to_string_lossy().into_owned());
        }
        WalkAction::Continue
    });
    paths
}
