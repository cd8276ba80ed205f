use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;

/// List the leaves of the output tree as source paths.
///
/// Leaves are regular files, symlinks and empty directories. Each is returned
/// as `/` followed by its path relative to `files_dir`, in breadth-first order.
/// Unreadable subdirectories are logged and treated as empty.
pub fn enumerate_output(files_dir: &Path) -> Result<Vec<String>> {
    fs::symlink_metadata(files_dir)
        .with_context(|| format!("Output tree missing: {}", files_dir.display()))?;

    let mut leaves = Vec::new();
    let mut queue: VecDeque<PathBuf> = VecDeque::from([files_dir.to_path_buf()]);

    while let Some(current) = queue.pop_front() {
        let entries: Vec<fs::DirEntry> = match fs::read_dir(&current) {
            Ok(iter) => iter.filter_map(|e| e.ok()).collect(),
            Err(e) => {
                debug!("Failed to read output dir {}: {}", current.display(), e);
                Vec::new()
            }
        };

        if entries.is_empty() {
            if let Some(name) = source_name(files_dir, &current) {
                leaves.push(name);
            }
            continue;
        }

        for entry in entries {
            let path = entry.path();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                queue.push_back(path);
            } else if let Some(name) = source_name(files_dir, &path) {
                leaves.push(name);
            }
        }
    }

    Ok(leaves)
}

fn source_name(files_dir: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(files_dir).ok()?;
    if rel.as_os_str().is_empty() {
        return None;
    }
    Some(format!("/{}", rel.to_string_lossy()))
}
