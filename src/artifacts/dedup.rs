use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::MetadataExt;

use log::debug;

use crate::artifacts::symlinks::FileId;

/// Picks one canonical path per group of paths that name the same file.
///
/// Paths are ranked by: not reached through a redirect prefix, carrying
/// access flags, longer, then lexicographically greater.
#[derive(Debug, Clone, Default)]
pub struct Deduplicator {
    redirect_prefixes: Vec<String>,
}

impl Deduplicator {
    /// `configured` prefixes are used as given; every directory symlink
    /// contributes `<link>/`
    pub fn new<I>(configured: &[String], dir_symlinks: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut redirect_prefixes: Vec<String> = configured.to_vec();
        for link in dir_symlinks {
            let prefix = format!("{}/", link.trim_end_matches('/'));
            if !redirect_prefixes.contains(&prefix) {
                redirect_prefixes.push(prefix);
            }
        }
        Deduplicator { redirect_prefixes }
    }

    pub fn is_redirected(&self, path: &str) -> bool {
        self.redirect_prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }

    /// Rank two paths; `Less` means `a` is preferred
    pub fn compare<F>(&self, a: &str, b: &str, has_flags: &F) -> Ordering
    where
        F: Fn(&str) -> bool,
    {
        self.is_redirected(a)
            .cmp(&self.is_redirected(b))
            .then_with(|| has_flags(b).cmp(&has_flags(a)))
            .then_with(|| b.len().cmp(&a.len()))
            .then_with(|| b.cmp(a))
    }

    /// Paths to drop: every member of a multi-path group except the best one
    pub fn drops<F>(&self, groups: &BTreeMap<FileId, Vec<String>>, has_flags: F) -> Vec<String>
    where
        F: Fn(&str) -> bool,
    {
        let mut dropped = Vec::new();
        for paths in groups.values() {
            if paths.len() < 2 {
                continue;
            }

            let mut ranked = paths.clone();
            ranked.sort_by(|a, b| self.compare(a, b, &has_flags));

            debug!("Keeping {} over {:?}", ranked[0], &ranked[1..]);
            dropped.extend(ranked.into_iter().skip(1));
        }
        dropped
    }
}

/// Group regular file paths by (device, inode); unreadable paths are skipped
pub fn group_by_identity<'a, I>(paths: I) -> BTreeMap<FileId, Vec<String>>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut groups: BTreeMap<FileId, Vec<String>> = BTreeMap::new();
    for path in paths {
        match fs::symlink_metadata(path) {
            Ok(metadata) if metadata.is_file() => {
                groups
                    .entry((metadata.dev(), metadata.ino()))
                    .or_default()
                    .push(path.clone());
            }
            Ok(_) => {}
            Err(e) => debug!("No identity for {}: {}", path, e),
        }
    }
    groups
}
